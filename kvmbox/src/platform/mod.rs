// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Hypervisor abstraction.
//!
//! The monitor consumes a small, fixed set of hypervisor operations:
//! create-VM, vcpu-mmap-size, create-vcpu, set-user-memory-region,
//! get/set registers, get/set special registers, set MSRs, run, and guest
//! debug control. Everything else about the hypervisor is out of scope.
//!
//! Register state is exchanged in the `kvm_bindings` representation
//! (`kvm_regs`/`kvm_sregs`/`kvm_msr_entry`), which doubles as the wire
//! format the real KVM implementation needs and a plain data record for
//! the mock.

#[cfg(target_os = "linux")]
pub mod kvm;
pub mod mock;

use kvm_bindings::{kvm_msr_entry, kvm_regs, kvm_sregs, kvm_userspace_memory_region};
use thiserror::Error;

/// Execution mode requested for a VM. Only long mode is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmMode {
    X86,
    Paging,
    LongMode,
}

/// Reason a vCPU stopped executing guest code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmExit {
    /// The guest executed `hlt`. Treated as a hypercall.
    Hlt,
    /// The guest wrote an I/O port. Treated as a hypercall.
    IoOut { port: u16 },
    /// The guest executed a hypercall instruction (`vmcall`). The monitor
    /// must advance `RIP` past the instruction after handling it.
    Hypercall,
    /// A debug exit (single-step or software breakpoint).
    Debug { pc: u64 },
    /// `run` was interrupted by a host signal before the guest entered.
    Interrupted,
    /// The guest shut down (triple fault or explicit request).
    Shutdown,
    /// An exit reason the monitor does not handle.
    Unsupported(u32),
}

/// Errors from the hypervisor layer.
#[derive(Error, Debug)]
pub enum HvError {
    #[error("hypervisor unavailable: {0}")]
    Unavailable(std::io::Error),
    #[error("hypervisor ioctl failed: {0}")]
    Ioctl(std::io::Error),
    #[error("requested mode is not supported")]
    UnsupportedMode,
    #[error("memory slot {0} is already in use")]
    SlotInUse(u32),
}

/// Entry point to a hypervisor implementation.
pub trait HypervisorProvider {
    type Vm: VmProvider<Vcpu = Self::Vcpu>;
    type Vcpu: VcpuProvider;

    fn create_vm(&self) -> Result<Self::Vm, HvError>;

    /// Size of the shared per-vCPU run structure.
    fn vcpu_mmap_size(&self) -> Result<usize, HvError>;
}

/// A created VM: memory-slot registration and vCPU creation.
pub trait VmProvider {
    type Vcpu: VcpuProvider;

    fn create_vcpu(&mut self, id: u64) -> Result<Self::Vcpu, HvError>;

    /// Register (or update) a userspace memory region.
    ///
    /// # Safety
    ///
    /// `region.userspace_addr` must point at `region.memory_size` bytes of
    /// host memory that stay valid for as long as the slot is installed.
    unsafe fn set_user_memory_region(
        &mut self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), HvError>;
}

/// A created vCPU.
pub trait VcpuProvider {
    fn get_regs(&self) -> Result<kvm_regs, HvError>;
    fn set_regs(&self, regs: &kvm_regs) -> Result<(), HvError>;
    fn get_sregs(&self) -> Result<kvm_sregs, HvError>;
    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), HvError>;
    fn set_msrs(&self, entries: &[kvm_msr_entry]) -> Result<(), HvError>;

    /// Run guest code until the next VM exit.
    fn run(&mut self) -> Result<VmExit, HvError>;

    /// Enable or disable guest-debug (single-step, software breakpoints).
    fn set_guest_debug(&self, single_step: bool, use_sw_breakpoints: bool)
        -> Result<(), HvError>;
}
