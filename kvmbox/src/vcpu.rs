// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! vCPU register file and guest-stack primitives.
//!
//! The monitor keeps a host-side copy of the register file, mutates it
//! while handling an exit, and flushes it back before the next entry.
//! Guest-stack pushes and pops go through the pager, so they work on
//! whatever memory currently backs `RSP`.

use kvm_bindings::{kvm_msr_entry, kvm_regs, kvm_sregs};
use num_enum::TryFromPrimitive;
use thiserror::Error;

use crate::mm::pager::Pager;
use crate::mm::GuestPtr;
use crate::platform::{HvError, VcpuProvider, VmExit, VmProvider};

/// Tag pushed by the guest-side trampolines before trapping to the
/// monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum Hypercall {
    /// The syscall entry trampoline: dispatch `RAX` as a syscall.
    Syscall = 1,
    /// The ISR stub: vector and error code follow on the stack.
    Interrupt = 2,
    /// Leave the run loop.
    Exit = 3,
    /// The signal-cleanup trampoline finished a guest signal handler.
    ExitHandler = 4,
}

/// Errors from vCPU state handling.
#[derive(Error, Debug)]
pub enum VcpuError {
    #[error(transparent)]
    Hv(#[from] HvError),
    #[error("guest stack at {0:#x} is not mapped")]
    StackNotMapped(GuestPtr),
}

/// A vCPU with a cached register file.
pub struct Vcpu<C: VcpuProvider> {
    inner: C,
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
}

impl<C: VcpuProvider> Vcpu<C> {
    pub fn new(inner: C) -> Result<Self, HvError> {
        let regs = inner.get_regs()?;
        let sregs = inner.get_sregs()?;
        Ok(Self { inner, regs, sregs })
    }

    /// Direct access to the platform vCPU (tests use this to script the
    /// mock).
    pub fn platform(&mut self) -> &mut C {
        &mut self.inner
    }

    /// Pull the register file from the hypervisor into the cache.
    pub fn fetch(&mut self) -> Result<(), HvError> {
        self.regs = self.inner.get_regs()?;
        self.sregs = self.inner.get_sregs()?;
        Ok(())
    }

    /// Push the cached register file back to the hypervisor.
    pub fn flush(&mut self) -> Result<(), HvError> {
        self.inner.set_regs(&self.regs)?;
        self.inner.set_sregs(&self.sregs)?;
        Ok(())
    }

    pub fn set_msrs(&mut self, entries: &[kvm_msr_entry]) -> Result<(), HvError> {
        self.inner.set_msrs(entries)
    }

    /// Run guest code until the next exit. The cached register file must
    /// have been flushed.
    pub fn run(&mut self) -> Result<VmExit, HvError> {
        self.inner.run()
    }

    pub fn set_guest_debug(&mut self, single_step: bool, sw_bp: bool) -> Result<(), HvError> {
        self.inner.set_guest_debug(single_step, sw_bp)
    }

    /// Syscall arguments in the Linux x86-64 order: `RDI, RSI, RDX, R10,
    /// R8, R9` (`RCX` is clobbered by the `syscall` instruction).
    pub fn syscall_args(&self) -> [u64; 6] {
        [
            self.regs.rdi,
            self.regs.rsi,
            self.regs.rdx,
            self.regs.r10,
            self.regs.r8,
            self.regs.r9,
        ]
    }

    /// Push a quadword onto the guest stack.
    pub fn push<V: VmProvider>(
        &mut self,
        pager: &Pager<V>,
        value: u64,
    ) -> Result<(), VcpuError> {
        self.regs.rsp -= 8;
        let host = pager
            .get_host_p(self.regs.rsp)
            .ok_or(VcpuError::StackNotMapped(self.regs.rsp))?;
        unsafe { core::ptr::write_unaligned(host.cast::<u64>(), value) };
        Ok(())
    }

    /// Pop a quadword off the guest stack.
    pub fn pop<V: VmProvider>(&mut self, pager: &Pager<V>) -> Result<u64, VcpuError> {
        let host = pager
            .get_host_p(self.regs.rsp)
            .ok_or(VcpuError::StackNotMapped(self.regs.rsp))?;
        let value = unsafe { core::ptr::read_unaligned(host.cast::<u64>()) };
        self.regs.rsp += 8;
        Ok(value)
    }

    /// Log the full register file.
    pub fn dump_regs(&self) {
        let r = &self.regs;
        log::error!(
            "rip: {:016x} rsp: {:016x} flags: {:016x}",
            r.rip,
            r.rsp,
            r.rflags
        );
        log::error!("rax: {:016x} rbx: {:016x} rcx: {:016x}", r.rax, r.rbx, r.rcx);
        log::error!("rdx: {:016x} rsi: {:016x} rdi: {:016x}", r.rdx, r.rsi, r.rdi);
        log::error!("rbp: {:016x} r8:  {:016x} r9:  {:016x}", r.rbp, r.r8, r.r9);
        log::error!("r10: {:016x} r11: {:016x} r12: {:016x}", r.r10, r.r11, r.r12);
        log::error!("r13: {:016x} r14: {:016x} r15: {:016x}", r.r13, r.r14, r.r15);
        log::error!(
            "cr0: {:016x} cr2: {:016x} cr3: {:016x} cr4: {:016x}",
            self.sregs.cr0,
            self.sregs.cr2,
            self.sregs.cr3,
            self.sregs.cr4
        );
    }
}
