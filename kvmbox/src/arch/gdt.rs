// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Global Descriptor Table and Task State Segment, written into guest
//! memory.
//!
//! Entry order (selectors are byte offsets into the table):
//!
//! | index | selector | descriptor        |
//! |-------|----------|-------------------|
//! | 0     | 0x00     | null              |
//! | 1     | 0x08     | user stack (SS)   |
//! | 2     | 0x10     | user code (CS)    |
//! | 3     | 0x18     | user data (DS)    |
//! | 4     | 0x20     | TSS, low 8 bytes  |
//! | 5     | 0x28     | TSS, high 8 bytes |
//! | 6     | 0x30     | kernel code       |
//! | 7     | 0x38     | kernel stack      |
//!
//! `MSR_STAR` is derived from this layout so that `syscall` enters on the
//! kernel code selector and `sysret` returns on the user CS/SS pair.

use x86_64::structures::gdt::DescriptorFlags;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::mm::pager::PageOpts;
use crate::mm::region::{RegionError, RegionManager};
use crate::mm::{GuestPtr, Purpose};
use crate::platform::VmProvider;

pub const GDT_NUM_ENTRIES: usize = 8;

pub const USER_SS_SELECTOR: u16 = 0x08 | 3;
pub const USER_CS_SELECTOR: u16 = 0x10 | 3;
pub const USER_DS_SELECTOR: u16 = 0x18 | 3;
pub const TR_SELECTOR: u16 = 0x20;
pub const KERNEL_CS_SELECTOR: u16 = 0x30;

/// Result of building the GDT and TSS.
#[derive(Clone, Copy, Debug)]
pub struct GdtSetup {
    pub gdt_base: GuestPtr,
    pub gdt_limit: u16,
    pub tss_base: GuestPtr,
    pub tss_limit: u32,
    /// Value for `MSR_STAR`.
    pub star: u64,
}

/// 64-bit TSS descriptor, which takes two GDT slots.
fn tss_descriptor(base: u64, limit: u32) -> (u64, u64) {
    let mut low = 0u64;
    low |= (limit as u64) & 0xffff;
    low |= (base & 0xffff) << 16;
    low |= ((base >> 16) & 0xff) << 32;
    low |= 0x89 << 40; // present, available 64-bit TSS
    low |= ((limit as u64 >> 16) & 0xf) << 48;
    low |= ((base >> 24) & 0xff) << 56;
    let high = base >> 32;
    (low, high)
}

/// Lay out the GDT and TSS in fresh kernel-mapped regions.
///
/// `kernel_stack_top` ends up in both `RSP0` and `IST1`, so interrupts
/// and privilege transitions land on the monitor-provided kernel stack.
pub fn setup_gdt<V: VmProvider>(
    rm: &mut RegionManager<V>,
    kernel_stack_top: GuestPtr,
) -> Result<GdtSetup, RegionError> {
    // TSS first, the GDT needs its guest address.
    let tss_region = rm.allocate_region(core::mem::size_of::<TaskStateSegment>(), Purpose::Tss)?;
    let tss_host = rm.host_base(tss_region);
    let tss_base = rm
        .pager_mut()
        .map_kernel_page(tss_host, PageOpts::empty())?;
    rm.set_guest_addr(tss_region, tss_base);

    let mut tss = TaskStateSegment::new();
    tss.privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
    tss.interrupt_stack_table[0] = VirtAddr::new(kernel_stack_top);
    tss.iomap_base = core::mem::size_of::<TaskStateSegment>() as u16;
    unsafe {
        core::ptr::write_unaligned(tss_host.cast::<TaskStateSegment>(), tss);
    }
    let tss_limit = (core::mem::size_of::<TaskStateSegment>() - 1) as u32;

    let gdt_region = rm.allocate_region(GDT_NUM_ENTRIES * 8, Purpose::Gdt)?;
    let gdt_host = rm.host_base(gdt_region);
    let gdt_base = rm
        .pager_mut()
        .map_kernel_page(gdt_host, PageOpts::empty())?;
    rm.set_guest_addr(gdt_region, gdt_base);

    let (tss_low, tss_high) = tss_descriptor(tss_base, tss_limit);
    let entries: [u64; GDT_NUM_ENTRIES] = [
        0,
        DescriptorFlags::USER_DATA.bits(),
        DescriptorFlags::USER_CODE64.bits(),
        DescriptorFlags::USER_DATA.bits(),
        tss_low,
        tss_high,
        DescriptorFlags::KERNEL_CODE64.bits(),
        DescriptorFlags::KERNEL_DATA.bits(),
    ];
    unsafe {
        let table = gdt_host.cast::<u64>();
        for (i, entry) in entries.iter().enumerate() {
            core::ptr::write_unaligned(table.add(i), *entry);
        }
    }

    // SYSCALL loads CS from STAR[47:32]; SYSRET loads CS from
    // STAR[63:48]+16 and SS from STAR[63:48]+8.
    let sysret_star = (USER_SS_SELECTOR as u64 - 0x8) | 0x3;
    let star = (sysret_star << 48) | ((KERNEL_CS_SELECTOR as u64) << 32);

    Ok(GdtSetup {
        gdt_base,
        gdt_limit: (GDT_NUM_ENTRIES * 8 - 1) as u16,
        tss_base,
        tss_limit,
        star,
    })
}
