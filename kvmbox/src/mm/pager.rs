// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Guest physical memory and page tables.
//!
//! The pager owns every chunk of host memory that backs guest-physical
//! space and keeps the guest's 4-level long-mode page tables consistent
//! with the monitor's view: for every guest-virtual address the guest can
//! legitimately touch, [`Pager::get_host_p`] returns the host-virtual
//! address of the byte it names.
//!
//! Page-table frames live in a reserved prefix of the system chunk and
//! are bump-allocated; the PML4 occupies the very first frame, so the
//! guest's CR3 is zero. Table edits are done host-side through the
//! chunk registry — the guest never touches its own tables.

use core::ops::Range;

use kvm_bindings::kvm_userspace_memory_region;
use thiserror::Error;
use x86_64::structures::paging::page_table::{PageTable, PageTableEntry};
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::layout::{
    KERNEL_SPACE_BASE, MMAP_AREA_BASE, PAGE_SIZE, PAGE_TABLE_RESERVE, STACK_GROW_LIMIT,
    SYSTEM_CHUNK_SIZE, USER_CHUNK_OFFSET,
};
use crate::mm::{page_aligned, page_begin, GuestPtr};
use crate::platform::{HvError, VmMode, VmProvider};

bitflags::bitflags! {
    /// Per-page mapping options.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageOpts: u8 {
        /// Make the PTE writable.
        const WRITE = 1 << 0;
        /// Clear NX on the PTE.
        const EXEC = 1 << 1;
    }
}

/// Errors from the pager.
#[derive(Error, Debug)]
pub enum PagerError {
    #[error("host memory allocation failed: {0}")]
    HostMmap(std::io::Error),
    #[error(transparent)]
    Hv(#[from] HvError),
    #[error("out of page-table frames")]
    NoMemory,
    #[error("address is not page-aligned")]
    Unaligned,
    #[error("host address {0:#x} is not inside any registered chunk")]
    UnknownHostAddress(usize),
    #[error("guest address {0:#x} is not mapped")]
    NotMapped(GuestPtr),
    #[error("only long mode is supported")]
    UnsupportedMode,
}

/// A contiguous host-allocated buffer registered with the hypervisor as
/// guest-physical memory. Never moves; destroyed only at VM teardown.
pub struct Chunk {
    host_base: *mut u8,
    guest_phys: u64,
    size: usize,
    slot: u32,
    owned: bool,
}

impl Chunk {
    pub fn host_base(&self) -> *mut u8 {
        self.host_base
    }

    pub fn guest_phys(&self) -> u64 {
        self.guest_phys
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    fn contains_host(&self, p: usize) -> bool {
        let base = self.host_base as usize;
        p >= base && p < base + self.size
    }

    fn contains_phys(&self, gpa: u64) -> bool {
        gpa >= self.guest_phys && gpa < self.guest_phys + self.size as u64
    }

    fn as_memory_region(&self) -> kvm_userspace_memory_region {
        kvm_userspace_memory_region {
            slot: self.slot,
            flags: 0,
            guest_phys_addr: self.guest_phys,
            memory_size: self.size as u64,
            userspace_addr: self.host_base as u64,
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::munmap(self.host_base.cast(), self.size);
            }
        }
    }
}

fn host_alloc(size: usize) -> Result<*mut u8, PagerError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(PagerError::HostMmap(std::io::Error::last_os_error()));
    }
    Ok(ptr.cast())
}

const STACK_RESERVE_PAGES: usize = 64;

/// Guest physical memory and page-table manager.
pub struct Pager<V: VmProvider> {
    vm: V,
    chunks: Vec<Chunk>,
    next_slot: u32,
    next_user_phys: u64,
    /// Bump pointer for page-table frames inside the reserved prefix of
    /// the system chunk.
    pt_next: u64,
    /// Table frames recycled by [`Pager::unmap_region`].
    pt_free: Vec<u64>,
    next_kernel_virt: GuestPtr,
    next_mmap_virt: GuestPtr,
    /// Lowest mapped page of the current user stack; faults just below it
    /// grow the stack.
    stack_low: Option<GuestPtr>,
    /// Lazily created chunk backing stack-growth pages, plus how many of
    /// its pages are handed out.
    stack_reserve: Option<(usize, usize)>,
}

impl<V: VmProvider> Pager<V> {
    /// Set up long-mode paging: allocate the system chunk at
    /// guest-physical zero, reserve its page-table prefix and install an
    /// empty PML4 in the first frame (CR3 = 0).
    pub fn initialize(mut vm: V, mode: VmMode) -> Result<Self, PagerError> {
        if mode != VmMode::LongMode {
            return Err(PagerError::UnsupportedMode);
        }

        let host_base = host_alloc(SYSTEM_CHUNK_SIZE)?;
        let system = Chunk {
            host_base,
            guest_phys: 0,
            size: SYSTEM_CHUNK_SIZE,
            slot: 0,
            owned: true,
        };
        unsafe { vm.set_user_memory_region(system.as_memory_region()) }?;

        Ok(Self {
            vm,
            chunks: vec![system],
            next_slot: 1,
            next_user_phys: USER_CHUNK_OFFSET,
            // Frame 0 is the PML4; host memory comes back zeroed.
            pt_next: PAGE_SIZE as u64,
            pt_free: Vec::new(),
            next_kernel_virt: KERNEL_SPACE_BASE,
            next_mmap_virt: MMAP_AREA_BASE,
            stack_low: None,
            stack_reserve: None,
        })
    }

    /// Guest-physical address of the PML4 root, suitable for CR3.
    pub fn pml4_addr(&self) -> u64 {
        0
    }

    /// The chunk at guest-physical zero.
    pub fn system_chunk(&self) -> &Chunk {
        &self.chunks[0]
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk(&self, idx: usize) -> &Chunk {
        &self.chunks[idx]
    }

    /// Allocate a fresh host-backed chunk of at least `size` bytes and
    /// register it with the hypervisor.
    pub fn create_chunk(&mut self, size: usize) -> Result<usize, PagerError> {
        let size = crate::mm::pagesize_align(size);
        let host_base = host_alloc(size)?;
        self.install_chunk(host_base, size, None, true)
    }

    /// Register caller-provided host memory (for example a buffer the
    /// host mmap handler produced) as a new chunk.
    ///
    /// `host_p` must be page-aligned and `size` a page multiple. The slot
    /// is assigned monotonically unless `slot_hint` names a free one.
    ///
    /// # Safety
    ///
    /// `host_p` must point at `size` bytes that stay valid for the life
    /// of the VM.
    pub unsafe fn register_chunk(
        &mut self,
        host_p: *mut u8,
        size: usize,
        slot_hint: Option<u32>,
    ) -> Result<usize, PagerError> {
        if !page_aligned(host_p as u64) || !page_aligned(size as u64) {
            return Err(PagerError::Unaligned);
        }
        self.install_chunk(host_p, size, slot_hint, false)
    }

    fn install_chunk(
        &mut self,
        host_base: *mut u8,
        size: usize,
        slot_hint: Option<u32>,
        owned: bool,
    ) -> Result<usize, PagerError> {
        let slot = match slot_hint {
            Some(hint) => {
                if self.chunks.iter().any(|c| c.slot == hint) {
                    return Err(PagerError::Hv(HvError::SlotInUse(hint)));
                }
                hint
            }
            None => {
                let slot = self.next_slot;
                self.next_slot += 1;
                slot
            }
        };
        let chunk = Chunk {
            host_base,
            guest_phys: self.next_user_phys,
            size,
            slot,
            owned,
        };
        self.next_user_phys += size as u64;
        unsafe { self.vm.set_user_memory_region(chunk.as_memory_region()) }?;
        log::debug!(
            "chunk {}: host {:p} phys {:#x} size {:#x}",
            chunk.slot,
            chunk.host_base,
            chunk.guest_phys,
            chunk.size
        );
        self.chunks.push(chunk);
        Ok(self.chunks.len() - 1)
    }

    /// The memory region a chunk was registered as.
    pub fn get_chunk_region(&self, idx: usize) -> kvm_userspace_memory_region {
        self.chunks[idx].as_memory_region()
    }

    /// Host pointer for a guest-physical address.
    pub fn host_from_phys(&self, gpa: u64) -> Option<*mut u8> {
        self.chunks.iter().find(|c| c.contains_phys(gpa)).map(|c| {
            let off = gpa - c.guest_phys;
            unsafe { c.host_base.add(off as usize) }
        })
    }

    /// Guest-physical address for a host pointer inside a chunk.
    pub fn phys_from_host(&self, p: *const u8) -> Option<u64> {
        let p = p as usize;
        self.chunks.iter().find(|c| c.contains_host(p)).map(|c| {
            c.guest_phys + (p - c.host_base as usize) as u64
        })
    }

    /// Index of the chunk containing a host pointer.
    pub fn chunk_index_for_host(&self, p: *const u8) -> Option<usize> {
        let p = p as usize;
        self.chunks.iter().position(|c| c.contains_host(p))
    }

    fn alloc_table_frame(&mut self) -> Result<u64, PagerError> {
        let gpa = match self.pt_free.pop() {
            Some(gpa) => gpa,
            None => {
                let gpa = self.pt_next;
                if gpa + PAGE_SIZE as u64 > PAGE_TABLE_RESERVE as u64 {
                    return Err(PagerError::NoMemory);
                }
                self.pt_next += PAGE_SIZE as u64;
                gpa
            }
        };
        // Frames can be recycled, so always clear.
        let host = self.host_from_phys(gpa).expect("table frame in system chunk");
        unsafe { core::ptr::write_bytes(host, 0, PAGE_SIZE) };
        Ok(gpa)
    }

    fn table_ptr(&self, gpa: u64) -> *mut PageTable {
        self.host_from_phys(gpa)
            .expect("page-table frame outside registered chunks")
            .cast()
    }

    /// Walk to the PTE for `gva`, creating intermediate tables on demand.
    fn walk_create(
        &mut self,
        gva: VirtAddr,
        user: bool,
    ) -> Result<*mut PageTableEntry, PagerError> {
        let mut table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            table_flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        let mut table = self.table_ptr(self.pml4_addr());
        for idx in [gva.p4_index(), gva.p3_index(), gva.p2_index()] {
            let entry = unsafe { &mut (&mut (*table))[idx] };
            if entry.is_unused() {
                let frame = self.alloc_table_frame()?;
                entry.set_addr(PhysAddr::new(frame), table_flags);
            } else if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
                entry.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
            }
            table = self.table_ptr(entry.addr().as_u64());
        }
        Ok(unsafe { &mut (&mut (*table))[gva.p1_index()] as *mut _ })
    }

    /// Walk to the PTE for `gva` without creating anything.
    fn walk(&self, gva: VirtAddr) -> Option<*mut PageTableEntry> {
        let mut table = self.table_ptr(self.pml4_addr());
        for idx in [gva.p4_index(), gva.p3_index(), gva.p2_index()] {
            let entry = unsafe { &(&(*table))[idx] };
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }
            table = self.table_ptr(entry.addr().as_u64());
        }
        Some(unsafe { &mut (&mut (*table))[gva.p1_index()] as *mut _ })
    }

    fn leaf_flags(opts: PageOpts, user: bool) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if opts.contains(PageOpts::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if !opts.contains(PageOpts::EXEC) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }

    fn map_page(
        &mut self,
        host_p: *const u8,
        guest_virt: GuestPtr,
        opts: PageOpts,
        user: bool,
    ) -> Result<(), PagerError> {
        if !page_aligned(host_p as u64) || !page_aligned(guest_virt) {
            return Err(PagerError::Unaligned);
        }
        let gpa = self
            .phys_from_host(host_p)
            .ok_or(PagerError::UnknownHostAddress(host_p as usize))?;
        let gva = VirtAddr::new(guest_virt);
        let entry = self.walk_create(gva, user)?;
        unsafe {
            (*entry).set_addr(PhysAddr::new(gpa), Self::leaf_flags(opts, user));
        }
        Ok(())
    }

    /// Insert a single 4K user mapping at `guest_virt`.
    pub fn map_user_page(
        &mut self,
        host_p: *const u8,
        guest_virt: GuestPtr,
        opts: PageOpts,
    ) -> Result<(), PagerError> {
        self.map_page(host_p, guest_virt, opts, true)
    }

    /// Insert a single 4K kernel mapping; the guest-virtual address is
    /// chosen from the upper half and returned.
    pub fn map_kernel_page(
        &mut self,
        host_p: *const u8,
        opts: PageOpts,
    ) -> Result<GuestPtr, PagerError> {
        let gva = self.next_kernel_virt;
        self.next_kernel_virt += PAGE_SIZE as u64;
        self.map_page(host_p, gva, opts, false)?;
        Ok(gva)
    }

    /// Map `pages` contiguous kernel pages; returns the base of the
    /// guest-virtual range.
    pub fn map_kernel_region(
        &mut self,
        host_base: *const u8,
        pages: usize,
        opts: PageOpts,
    ) -> Result<GuestPtr, PagerError> {
        let base = self.next_kernel_virt;
        self.next_kernel_virt += (pages * PAGE_SIZE) as u64;
        for i in 0..pages {
            let gva = base + (i * PAGE_SIZE) as u64;
            self.map_page(unsafe { host_base.add(i * PAGE_SIZE) }, gva, opts, false)?;
        }
        Ok(base)
    }

    /// Map `pages` user pages starting at `guest_base`, backed by the
    /// host range starting at `host_base`.
    pub fn map_region(
        &mut self,
        host_base: *const u8,
        guest_base: GuestPtr,
        pages: usize,
        opts: PageOpts,
    ) -> Result<(), PagerError> {
        for i in 0..pages {
            self.map_user_page(
                unsafe { host_base.add(i * PAGE_SIZE) },
                guest_base + (i * PAGE_SIZE) as u64,
                opts,
            )?;
        }
        Ok(())
    }

    /// Clear `pages` PTEs starting at `guest_base`, recycling table
    /// frames that become empty.
    pub fn unmap_region(&mut self, guest_base: GuestPtr, pages: usize) -> Result<(), PagerError> {
        if !page_aligned(guest_base) {
            return Err(PagerError::Unaligned);
        }
        for i in 0..pages {
            let gva = VirtAddr::new(guest_base + (i * PAGE_SIZE) as u64);
            if let Some(entry) = self.walk(gva) {
                unsafe { (*entry).set_unused() };
            }
            self.prune_empty_tables(gva);
        }
        Ok(())
    }

    /// Free PT and PD frames under `gva` if they no longer hold any
    /// present entries.
    fn prune_empty_tables(&mut self, gva: VirtAddr) {
        let pml4 = self.table_ptr(self.pml4_addr());
        let p4e = unsafe { &mut (&mut (*pml4))[gva.p4_index()] };
        if !p4e.flags().contains(PageTableFlags::PRESENT) {
            return;
        }
        let pdpt = self.table_ptr(p4e.addr().as_u64());
        let p3e = unsafe { &mut (&mut (*pdpt))[gva.p3_index()] };
        if !p3e.flags().contains(PageTableFlags::PRESENT) {
            return;
        }
        let pd = self.table_ptr(p3e.addr().as_u64());
        let p2e = unsafe { &mut (&mut (*pd))[gva.p2_index()] };
        if !p2e.flags().contains(PageTableFlags::PRESENT) {
            return;
        }
        let pt = self.table_ptr(p2e.addr().as_u64());
        if unsafe { (*pt).iter().all(|e| e.is_unused()) } {
            self.pt_free.push(p2e.addr().as_u64());
            p2e.set_unused();
        }
        if unsafe { (*pd).iter().all(|e| e.is_unused()) } {
            self.pt_free.push(p3e.addr().as_u64());
            p3e.set_unused();
        }
    }

    /// Translate a guest-virtual address to the host pointer backing it.
    pub fn get_host_p(&self, guest_virt: GuestPtr) -> Option<*mut u8> {
        let gva = VirtAddr::try_new(guest_virt).ok()?;
        let entry = self.walk(gva)?;
        let entry = unsafe { &*entry };
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let host = self.host_from_phys(entry.addr().as_u64())?;
        Some(unsafe { host.add(crate::mm::offset_in_page(guest_virt) as usize) })
    }

    /// Hand out a fresh guest-virtual range for an `mmap` mapping.
    pub fn alloc_user_virt(&mut self, pages: usize) -> GuestPtr {
        let base = self.next_mmap_virt;
        self.next_mmap_virt += (pages * PAGE_SIZE) as u64;
        base
    }

    /// Tell the pager where the current user stack ends; faults within
    /// [`STACK_GROW_LIMIT`] below this grow the stack.
    pub fn set_stack_window(&mut self, lowest_mapped: GuestPtr) {
        self.stack_low = Some(lowest_mapped);
    }

    /// The growth area currently accepted by [`Pager::handle_pagefault`].
    pub fn stack_growth_area(&self) -> Option<Range<GuestPtr>> {
        self.stack_low
            .map(|low| low.saturating_sub(STACK_GROW_LIMIT)..low)
    }

    /// Resolve a guest page fault.
    ///
    /// Returns `true` if the fault was inside the stack growth area and a
    /// fresh writable page was mapped; `false` means the fault cannot be
    /// recovered and the caller should treat it as fatal.
    pub fn handle_pagefault(
        &mut self,
        fault_addr: GuestPtr,
        error_code: u32,
    ) -> Result<bool, PagerError> {
        let in_growth_area = self
            .stack_growth_area()
            .is_some_and(|area| area.contains(&fault_addr));
        if !in_growth_area {
            log::debug!(
                "unrecoverable page fault at {:#x} (error code {:#x})",
                fault_addr,
                error_code
            );
            return Ok(false);
        }

        let (chunk_idx, used) = match self.stack_reserve {
            Some(r) => r,
            None => {
                let idx = self.create_chunk(STACK_RESERVE_PAGES * PAGE_SIZE)?;
                self.stack_reserve = Some((idx, 0));
                (idx, 0)
            }
        };
        if used >= STACK_RESERVE_PAGES {
            return Err(PagerError::NoMemory);
        }
        let host = unsafe { self.chunks[chunk_idx].host_base.add(used * PAGE_SIZE) };
        let page = page_begin(fault_addr);
        self.map_user_page(host, page, PageOpts::WRITE)?;
        self.stack_reserve = Some((chunk_idx, used + 1));
        self.stack_low = Some(page);
        log::debug!("stack grown to {:#x}", page);
        Ok(true)
    }
}
