// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Interrupt Descriptor Table, written into guest memory.
//!
//! The first 48 vectors point into the ISR flat blob, whose stubs are 9
//! bytes apart: each pushes its vector number and jumps to a common trap
//! that hands control to the monitor. All gates run on IST1 (the kernel
//! stack) with the kernel code selector.

use crate::mm::pager::PageOpts;
use crate::mm::region::{RegionError, RegionManager};
use crate::mm::{GuestPtr, Purpose};
use crate::platform::VmProvider;

use super::gdt::KERNEL_CS_SELECTOR;

pub const IDT_NUM_ENTRIES: usize = 256;

/// Vectors covered by the ISR blob's stubs.
pub const ISR_VECTORS: usize = 48;

/// Byte stride between consecutive stubs in the ISR blob.
pub const ISR_STUB_STRIDE: u64 = 9;

/// Result of building the IDT.
#[derive(Clone, Copy, Debug)]
pub struct IdtSetup {
    pub idt_base: GuestPtr,
    pub idt_limit: u16,
}

#[derive(Clone, Copy, Default)]
#[repr(C)]
struct IdtEntry {
    offset1: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset2: u16,
    offset3: u32,
    reserved: u32,
}

const _: () = assert!(core::mem::size_of::<IdtEntry>() == 16);

impl IdtEntry {
    fn trap_gate(offset: u64) -> Self {
        Self {
            offset1: (offset & 0xffff) as u16,
            selector: KERNEL_CS_SELECTOR,
            ist: 1,
            type_attr: 0x8f, // present, trap gate
            offset2: ((offset >> 16) & 0xffff) as u16,
            offset3: (offset >> 32) as u32,
            reserved: 0,
        }
    }
}

/// Lay out the IDT in a fresh kernel-mapped region. `isr_base` is the
/// guest address of the ISR flat blob.
pub fn setup_idt<V: VmProvider>(
    rm: &mut RegionManager<V>,
    isr_base: GuestPtr,
) -> Result<IdtSetup, RegionError> {
    let idt_region =
        rm.allocate_region(IDT_NUM_ENTRIES * core::mem::size_of::<IdtEntry>(), Purpose::Idt)?;
    let idt_host = rm.host_base(idt_region);

    unsafe {
        core::ptr::write_bytes(idt_host, 0, IDT_NUM_ENTRIES * core::mem::size_of::<IdtEntry>());
        let table = idt_host.cast::<IdtEntry>();
        for vector in 0..ISR_VECTORS {
            let offset = isr_base + vector as u64 * ISR_STUB_STRIDE;
            core::ptr::write_unaligned(table.add(vector), IdtEntry::trap_gate(offset));
        }
    }

    let idt_base = rm
        .pager_mut()
        .map_kernel_page(idt_host, PageOpts::empty())?;
    rm.set_guest_addr(idt_region, idt_base);

    Ok(IdtSetup {
        idt_base,
        idt_limit: (IDT_NUM_ENTRIES * core::mem::size_of::<IdtEntry>() - 1) as u16,
    })
}
