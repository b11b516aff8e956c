// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! x86-64 long-mode machine state: descriptor tables and the initial
//! special-register file.

pub mod gdt;
pub mod idt;

use kvm_bindings::{kvm_segment, kvm_sregs};

use self::gdt::GdtSetup;
use self::idt::IdtSetup;

/// Model-specific register indices the monitor programs.
pub mod msr {
    /// STAR - segment selectors for SYSCALL/SYSRET.
    pub const STAR: u32 = 0xc000_0081;
    /// LSTAR - long mode SYSCALL target RIP.
    pub const LSTAR: u32 = 0xc000_0082;
    /// SYSCALL_MASK - RFLAGS mask applied on SYSCALL.
    pub const SFMASK: u32 = 0xc000_0084;
}

const CR0_LONG_MODE: u64 = 0x8005_0033; // PE | MP | ET | NE | WP | AM | PG
const CR4_LONG_MODE: u64 = 0x620; // PAE | OSFXSR | OSXMMEXCPT
const EFER_LONG_MODE: u64 = 0xd01; // SCE | LME | LMA | NXE

fn user_code_segment() -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector: gdt::USER_CS_SELECTOR,
        type_: 0xb,
        present: 1,
        dpl: 3,
        db: 0,
        s: 1,
        l: 1,
        g: 1,
        ..Default::default()
    }
}

fn user_data_segment(selector: u16) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector,
        type_: 0x3,
        present: 1,
        dpl: 3,
        db: 1,
        s: 1,
        l: 0,
        g: 1,
        ..Default::default()
    }
}

/// Build the special-register file for entering ring 3 in long mode with
/// the given descriptor tables and page-table root.
pub fn long_mode_sregs(gdt: &GdtSetup, idt: &IdtSetup, cr3: u64) -> kvm_sregs {
    let mut sregs = kvm_sregs {
        cr0: CR0_LONG_MODE,
        cr3,
        cr4: CR4_LONG_MODE,
        efer: EFER_LONG_MODE,
        ..Default::default()
    };
    sregs.gdt.base = gdt.gdt_base;
    sregs.gdt.limit = gdt.gdt_limit;
    sregs.idt.base = idt.idt_base;
    sregs.idt.limit = idt.idt_limit;

    sregs.cs = user_code_segment();
    sregs.ss = user_data_segment(gdt::USER_SS_SELECTOR);
    sregs.ds = user_data_segment(gdt::USER_DS_SELECTOR);
    sregs.es = user_data_segment(gdt::USER_DS_SELECTOR);
    sregs.fs = user_data_segment(gdt::USER_DS_SELECTOR);
    sregs.gs = user_data_segment(gdt::USER_DS_SELECTOR);

    sregs.tr = kvm_segment {
        base: gdt.tss_base,
        limit: gdt.tss_limit,
        selector: gdt::TR_SELECTOR,
        type_: 0xb, // busy 64-bit TSS
        present: 1,
        dpl: 0,
        s: 0,
        ..Default::default()
    };
    sregs
}
