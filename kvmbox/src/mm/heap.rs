// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The guest process's address space: `brk` windows and the `mmap` arena.
//!
//! Two pools of mappings sit on top of the region manager. The brk pool
//! is an ordered sequence growing upward from the end of the data
//! segment; its last element is the active frontier. The mmap pool is an
//! unordered collection whose addresses the monitor chooses unless the
//! guest insists with `MAP_FIXED`.
//!
//! Slicing a mapping always slices its region in the same shape, so
//! freeing a sliced piece returns its memory to the free list.

use kvmbox_common_linux::{MRemapFlags, MapFlags, ProtFlags};
use thiserror::Error;

use crate::layout::PAGE_SIZE;
use crate::mm::pager::{PageOpts, PagerError};
use crate::mm::region::{RegionError, RegionHandle, RegionManager};
use crate::mm::{next_page, page_begin, pages_from_size, pagesize_align, GuestPtr, Purpose};
use crate::platform::VmProvider;

/// Errors from the heap layer.
#[derive(Error, Debug)]
pub enum MapError {
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Pager(#[from] PagerError),
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error("no mapping at {0:#x}")]
    NoSuchMapping(GuestPtr),
    #[error("brk below the initial data segment")]
    BelowInitialBrk,
    #[error("address is not page-aligned")]
    Unaligned,
}

/// A guest-visible `mmap`-style view onto a region.
#[derive(Clone, Debug)]
pub struct Mapping {
    region: RegionHandle,
    guest_addr: GuestPtr,
    length: usize,
    mapped_pages: usize,
    prot: ProtFlags,
    flags: MapFlags,
    fd: i32,
    offset: u64,
}

impl Mapping {
    pub fn guest_address(&self) -> GuestPtr {
        self.guest_addr
    }

    pub fn get_length(&self) -> usize {
        self.length
    }

    pub fn get_pages(&self) -> usize {
        self.mapped_pages
    }

    pub fn region(&self) -> RegionHandle {
        self.region
    }

    pub fn prot(&self) -> ProtFlags {
        self.prot
    }

    pub fn contains_address(&self, addr: GuestPtr) -> bool {
        addr >= self.guest_addr && addr < self.guest_addr + self.length as u64
    }

    fn page_opts(&self) -> PageOpts {
        let mut opts = PageOpts::empty();
        if self.prot.contains(ProtFlags::PROT_WRITE) {
            opts |= PageOpts::WRITE;
        }
        if self.prot.contains(ProtFlags::PROT_EXEC) {
            opts |= PageOpts::EXEC;
        }
        opts
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pool {
    Brk,
    Mmap,
}

/// The POSIX-shaped address space above the pager and region manager.
pub struct HeapManager {
    brk_mappings: Vec<Mapping>,
    mmap_mappings: Vec<Mapping>,
    curbrk: GuestPtr,
    initial_brk: GuestPtr,
}

impl Default for HeapManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapManager {
    pub fn new() -> Self {
        Self {
            brk_mappings: Vec::new(),
            mmap_mappings: Vec::new(),
            curbrk: 0,
            initial_brk: 0,
        }
    }

    /// Install the first brk mapping over the loaded data segment. The
    /// initial program break lies just past the segment's memory image.
    pub fn init<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        data_region: RegionHandle,
        image_size: usize,
    ) {
        let guest = rm
            .guest_addr(data_region)
            .expect("data region must be mapped before heap init");
        self.brk_mappings.push(Mapping {
            region: data_region,
            guest_addr: guest,
            length: image_size,
            mapped_pages: pages_from_size(image_size),
            prot: ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            flags: MapFlags::MAP_ANONYMOUS,
            fd: -1,
            offset: 0,
        });
        self.curbrk = next_page(guest + image_size as u64);
        self.initial_brk = self.curbrk;
        assert!(
            self.curbrk - 1 < guest + rm.size(data_region) as u64,
            "initial brk address must be in the data region"
        );
    }

    pub fn curbrk(&self) -> GuestPtr {
        self.curbrk
    }

    /// Move the program break. Returns the new break address.
    pub fn brk<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        newbrk: GuestPtr,
    ) -> Result<GuestPtr, MapError> {
        if self.brk_mappings.is_empty() {
            // Nothing writable was loaded; there is no data segment to
            // extend.
            return Err(MapError::NoSuchMapping(newbrk));
        }
        if newbrk < self.initial_brk {
            return Err(MapError::BelowInitialBrk);
        }
        if newbrk < self.curbrk {
            self.shrink(rm, newbrk)?;
            self.curbrk = newbrk;
            return Ok(self.curbrk);
        }
        if newbrk > self.curbrk {
            self.grow(rm, newbrk)?;
        }
        Ok(self.curbrk)
    }

    fn shrink<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        newbrk: GuestPtr,
    ) -> Result<(), MapError> {
        // Drop whole frontier mappings that lie entirely above the new
        // break; the initial data mapping always stays.
        while self.brk_mappings.len() > 1
            && newbrk <= self.brk_mappings.last().unwrap().guest_addr
        {
            let m = self.brk_mappings.pop().unwrap();
            rm.pager_mut()
                .unmap_region(page_begin(m.guest_addr), m.mapped_pages)?;
            rm.free_region(m.region);
        }

        let slice_base = next_page(newbrk);
        let m = self.brk_mappings.last_mut().unwrap();
        let map_end = next_page(m.guest_addr + m.length as u64);
        if map_end <= slice_base {
            return Ok(());
        }

        // Unmap the tail pages and hand the tail of the region back.
        let pages = ((map_end - slice_base) as usize) / PAGE_SIZE;
        rm.pager_mut().unmap_region(slice_base, pages)?;
        m.length = (slice_base - m.guest_addr) as usize;
        m.mapped_pages = pages_from_size(m.length);
        let off = (slice_base - m.guest_addr) as usize;
        let region = m.region;
        if off < rm.size(region) {
            let (tail, _) = rm.slice_center(region, off, rm.size(region) - off)?;
            rm.free_region(tail);
        }
        Ok(())
    }

    fn grow<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        newbrk: GuestPtr,
    ) -> Result<(), MapError> {
        debug_assert!(newbrk > self.curbrk);
        let m = self.brk_mappings.last_mut().unwrap();
        let capacity_end = m.guest_addr + rm.size(m.region) as u64;

        if newbrk - 1 < capacity_end {
            // Fits: grow the frontier mapping in place and re-map.
            m.length = (newbrk - m.guest_addr) as usize;
            m.mapped_pages = pages_from_size(m.length);
            Self::map_mapping(rm, m)?;
            self.curbrk = newbrk;
            return Ok(());
        }

        // Fill the frontier mapping to its region's end, then append a
        // fresh region for the remaining bytes.
        m.length = rm.size(m.region);
        m.mapped_pages = pages_from_size(m.length);
        Self::map_mapping(rm, m)?;
        let frontier = capacity_end;

        let remaining = (newbrk - frontier) as usize;
        let region = rm.allocate_region(remaining, Purpose::Heap)?;
        rm.set_guest_addr(region, frontier);
        let m = Mapping {
            region,
            guest_addr: frontier,
            length: remaining,
            mapped_pages: pages_from_size(remaining),
            prot: ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            flags: MapFlags::MAP_ANONYMOUS,
            fd: -1,
            offset: 0,
        };
        Self::map_mapping(rm, &m)?;
        self.brk_mappings.push(m);
        self.curbrk = newbrk;
        Ok(())
    }

    /// Install (or refresh) the page-table entries for a mapping. A
    /// mapping with no access at all is unmapped instead.
    fn map_mapping<V: VmProvider>(
        rm: &mut RegionManager<V>,
        m: &Mapping,
    ) -> Result<(), MapError> {
        if m.prot & (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC)
            == ProtFlags::PROT_NONE
        {
            rm.pager_mut()
                .unmap_region(page_begin(m.guest_addr), m.mapped_pages)?;
            return Ok(());
        }
        let host = rm.host_base(m.region);
        rm.pager_mut().map_region(
            host,
            page_begin(m.guest_addr),
            m.mapped_pages,
            m.page_opts(),
        )?;
        Ok(())
    }

    /// Create or adjust an `mmap` mapping.
    ///
    /// `backing` is the host buffer the mmap handler produced, if any;
    /// without one the monitor allocates a region itself. Returns the
    /// guest address of the mapping.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        addr: GuestPtr,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        offset: u64,
        backing: Option<*mut u8>,
    ) -> Result<GuestPtr, MapError> {
        let length = pagesize_align(length);

        if flags.contains(MapFlags::MAP_FIXED) && addr != 0 {
            if !crate::mm::page_aligned(addr) {
                return Err(MapError::Unaligned);
            }
            if let Some(i) = self
                .mmap_mappings
                .iter()
                .position(|m| m.guest_addr == addr && m.length == length)
            {
                // Exact match: take over the existing mapping.
                let m = &mut self.mmap_mappings[i];
                m.prot = prot;
                m.flags = flags;
                m.fd = fd;
                m.offset = offset;
                let m = self.mmap_mappings[i].clone();
                Self::map_mapping(rm, &m)?;
                debug_assert!(!rm.is_free(m.region));
                return Ok(addr);
            }
            if let Some(i) = self
                .mmap_mappings
                .iter()
                .position(|m| m.contains_address(addr))
            {
                // The fixed range punches a hole into an existing
                // mapping; slice it first.
                self.slice(rm, Pool::Mmap, i, addr, length)?;
            }
            return self.create_mapping(rm, Some(addr), length, prot, flags, fd, offset, backing);
        }

        self.create_mapping(rm, None, length, prot, flags, fd, offset, backing)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_mapping<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        addr: Option<GuestPtr>,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        offset: u64,
        backing: Option<*mut u8>,
    ) -> Result<GuestPtr, MapError> {
        let region = match backing {
            Some(host_p) => unsafe {
                rm.adopt_foreign_region(host_p, length, Purpose::UserMmap)?
            },
            None => rm.allocate_region(length, Purpose::UserMmap)?,
        };
        let guest_addr = match addr {
            Some(a) => a,
            None => rm.pager_mut().alloc_user_virt(pages_from_size(length)),
        };
        rm.set_guest_addr(region, guest_addr);
        let m = Mapping {
            region,
            guest_addr,
            length,
            mapped_pages: pages_from_size(length),
            prot,
            flags,
            fd,
            offset,
        };
        Self::map_mapping(rm, &m)?;
        debug_assert!(!rm.is_free(m.region));
        self.mmap_mappings.push(m);
        Ok(guest_addr)
    }

    /// Unmap `length` bytes starting at `addr`. When a mapping's last
    /// page goes away its region is freed and the mapping dropped.
    pub fn munmap<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        addr: GuestPtr,
        length: usize,
    ) -> Result<(), MapError> {
        if !crate::mm::page_aligned(addr) {
            return Err(MapError::Unaligned);
        }
        let (pool, i) = self
            .find_mapping(addr)
            .ok_or(MapError::NoSuchMapping(addr))?;
        let pages = pages_from_size(length);
        rm.pager_mut().unmap_region(addr, pages)?;
        let m = self.pool_mut(pool).get_mut(i).unwrap();
        m.mapped_pages = m.mapped_pages.saturating_sub(pages);
        if m.mapped_pages == 0 {
            let region = m.region;
            rm.free_region(region);
            self.pool_mut(pool).remove(i);
        }
        Ok(())
    }

    /// Resize a mapping, moving it if it cannot grow in place.
    /// `MREMAP_FIXED` is not supported.
    pub fn mremap<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        old_addr: GuestPtr,
        new_size: usize,
        flags: MRemapFlags,
    ) -> Result<GuestPtr, MapError> {
        if flags.contains(MRemapFlags::MREMAP_FIXED) {
            return Err(MapError::Unsupported("MREMAP_FIXED"));
        }
        let new_size = pagesize_align(new_size);
        let i = self
            .mmap_mappings
            .iter()
            .position(|m| m.contains_address(old_addr))
            .ok_or(MapError::NoSuchMapping(old_addr))?;

        let (guest_addr, length, capacity) = {
            let m = &self.mmap_mappings[i];
            (m.guest_addr, m.length, rm.size(m.region))
        };

        if new_size < length {
            // Shrink in place: unmap the tail.
            let unmap_addr = guest_addr + new_size as u64;
            let pages = pages_from_size(length - new_size);
            rm.pager_mut().unmap_region(unmap_addr, pages)?;
            let m = &mut self.mmap_mappings[i];
            m.length = new_size;
            m.mapped_pages = pages_from_size(new_size);
            return Ok(guest_addr);
        }

        if new_size <= capacity {
            // Grow in place within the region.
            let m = &mut self.mmap_mappings[i];
            m.length = new_size;
            m.mapped_pages = pages_from_size(new_size);
            let m = self.mmap_mappings[i].clone();
            Self::map_mapping(rm, &m)?;
            return Ok(guest_addr);
        }

        // Move: fresh region and mapping, copy, drop the old one.
        let (prot, mflags, fd, offset) = {
            let m = &self.mmap_mappings[i];
            (m.prot, m.flags, m.fd, m.offset)
        };
        let old_region = self.mmap_mappings[i].region;
        let new_addr = self.create_mapping(rm, None, new_size, prot, mflags, fd, offset, None)?;
        let new_i = self
            .mmap_mappings
            .iter()
            .position(|m| m.guest_addr == new_addr)
            .unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(
                rm.host_base(old_region),
                rm.host_base(self.mmap_mappings[new_i].region),
                length,
            );
        }
        let old = self.mmap_mappings.remove(
            self.mmap_mappings
                .iter()
                .position(|m| m.guest_addr == guest_addr)
                .unwrap(),
        );
        rm.pager_mut()
            .unmap_region(page_begin(old.guest_addr), old.mapped_pages)?;
        rm.free_region(old.region);
        Ok(new_addr)
    }

    /// Cut `[slice_base, slice_base+len)` out of a mapping, freeing the
    /// excised region piece. A remainder above the cut becomes a mapping
    /// of its own over the region tail, keeping its content.
    fn slice<V: VmProvider>(
        &mut self,
        rm: &mut RegionManager<V>,
        pool: Pool,
        i: usize,
        slice_base: GuestPtr,
        len: usize,
    ) -> Result<(), MapError> {
        let m = self.pool_mut(pool).get(i).unwrap().clone();
        debug_assert!(m.contains_address(slice_base));
        let pages = pages_from_size(len);
        rm.pager_mut().unmap_region(slice_base, pages)?;

        let off = (slice_base - m.guest_addr) as usize;
        let cut_end = off + len;

        if off == 0 {
            if len >= m.length {
                // The cut swallows the whole mapping.
                rm.free_region(m.region);
                self.pool_mut(pool).remove(i);
                return Ok(());
            }
            // Head cut: the mapping keeps the region tail.
            let (head, tail) = rm.slice_center(m.region, 0, len)?;
            let m = self.pool_mut(pool).get_mut(i).unwrap();
            m.region = tail.expect("tail exists when len < mapping length");
            m.guest_addr += len as u64;
            m.length -= len;
            m.mapped_pages = m.mapped_pages.saturating_sub(pages);
            m.offset += len as u64;
            rm.set_guest_addr(m.region, m.guest_addr);
            rm.free_region(head);
            return Ok(());
        }

        let (mid, tail) = rm.slice_center(m.region, off, len.min(m.length - off))?;
        {
            let head = self.pool_mut(pool).get_mut(i).unwrap();
            head.length = off;
            head.mapped_pages = pages_from_size(off);
        }
        rm.free_region(mid);

        if cut_end < m.length {
            // Remainder keeps its content; its pages are still mapped.
            let tail = tail.expect("tail region exists below mapping end");
            let rem_guest = m.guest_addr + cut_end as u64;
            rm.set_guest_addr(tail, rem_guest);
            let rem = Mapping {
                region: tail,
                guest_addr: rem_guest,
                length: m.length - cut_end,
                mapped_pages: pages_from_size(m.length - cut_end),
                prot: m.prot,
                flags: m.flags,
                fd: m.fd,
                offset: m.offset + cut_end as u64,
            };
            self.pool_mut(pool).push(rem);
        } else if let Some(tail) = tail {
            rm.free_region(tail);
        }
        Ok(())
    }

    fn pool_mut(&mut self, pool: Pool) -> &mut Vec<Mapping> {
        match pool {
            Pool::Brk => &mut self.brk_mappings,
            Pool::Mmap => &mut self.mmap_mappings,
        }
    }

    fn find_mapping(&self, addr: GuestPtr) -> Option<(Pool, usize)> {
        if let Some(i) = self
            .mmap_mappings
            .iter()
            .position(|m| m.contains_address(addr))
        {
            return Some((Pool::Mmap, i));
        }
        self.brk_mappings
            .iter()
            .position(|m| m.contains_address(addr))
            .map(|i| (Pool::Brk, i))
    }

    /// Whether any brk or mmap mapping covers `addr`.
    pub fn address_mapped(&self, addr: GuestPtr) -> bool {
        self.find_mapping(addr).is_some()
    }

    /// The mapping covering `addr`, if any.
    pub fn mapping_at(&self, addr: GuestPtr) -> Option<&Mapping> {
        let (pool, i) = self.find_mapping(addr)?;
        match pool {
            Pool::Brk => self.brk_mappings.get(i),
            Pool::Mmap => self.mmap_mappings.get(i),
        }
    }

    /// Log every mapping in both pools.
    pub fn dump_mappings(&self) {
        log::debug!("brk mappings (curbrk {:#x}):", self.curbrk);
        for m in &self.brk_mappings {
            log::debug!(
                "  {:#x}+{:#x} pages {} prot {:?}",
                m.guest_addr,
                m.length,
                m.mapped_pages,
                m.prot
            );
        }
        log::debug!("mmap mappings:");
        for m in &self.mmap_mappings {
            log::debug!(
                "  {:#x}+{:#x} pages {} prot {:?} fd {}",
                m.guest_addr,
                m.length,
                m.mapped_pages,
                m.prot,
                m.fd
            );
        }
    }
}
