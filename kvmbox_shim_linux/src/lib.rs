// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Linux program semantics on top of the `kvmbox` core.
//!
//! This crate owns the [`Vm`] aggregate: it loads an unmodified x86-64
//! ELF binary into a fresh long-mode address space, builds the initial
//! user stack, wires up the descriptor tables and trampolines, and then
//! runs the vCPU, serving every guest syscall from an injected table of
//! host handlers.
//!
//! The embedder supplies the binary path, `argv`/`envp`, a debug flag
//! and the [`SyscallHandlers`] vtable; the monitor does the rest.

use std::ffi::CString;
use std::path::PathBuf;

use kvm_bindings::kvm_msr_entry;
use kvmbox::arch::{self, msr};
use kvmbox::flat::{load_flat, Flat, FlatError};
use kvmbox::mm::heap::HeapManager;
use kvmbox::mm::pager::{Pager, PagerError};
use kvmbox::mm::region::{RegionError, RegionManager};
use kvmbox::mm::Purpose;
use kvmbox::platform::{HvError, HypervisorProvider, VmMode, VmProvider};
use kvmbox::vcpu::Vcpu;
use kvmbox_common_linux::{RLimit, RLIMIT_NLIMITS, RLIMIT_STACK};
use thiserror::Error;

pub mod loader;
pub mod run;
pub mod syscalls;

pub(crate) mod interrupt;
pub(crate) mod signal;

pub use run::{RunError, RunState};
pub use syscalls::{MapRequest, SyscallHandlers};

use loader::elf::{ElfLoadError, LoadedElf};
use loader::stack::StackError;
use run::SyscallFn;
use signal::SignalState;

/// What the embedder tells the monitor about the program to run.
#[derive(Clone, Debug)]
pub struct VmOptions {
    pub binary: PathBuf,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
    pub debug: bool,
    /// Flat blob with the 48 interrupt stubs.
    pub isr_path: PathBuf,
    /// Flat blob with the syscall entry trampoline (`MSR_LSTAR`).
    pub entry_path: PathBuf,
    /// Flat blob with the signal-handler cleanup trampoline.
    pub sighandler_cleanup_path: PathBuf,
}

impl VmOptions {
    /// Options for `binary` with the flat blobs at their installed
    /// locations.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let res = PathBuf::from("/usr/share/kvmbox");
        Self {
            binary: binary.into(),
            argv: Vec::new(),
            envp: Vec::new(),
            debug: false,
            isr_path: res.join("isr"),
            entry_path: res.join("entry"),
            sighandler_cleanup_path: res.join("signal-cleanup"),
        }
    }
}

/// Errors during VM construction.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Hv(#[from] HvError),
    #[error(transparent)]
    Pager(#[from] PagerError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Elf(#[from] ElfLoadError),
    #[error(transparent)]
    Flat(#[from] FlatError),
    #[error(transparent)]
    Stack(#[from] StackError),
}

/// The aggregate root: one guest program in one virtual machine.
pub struct Vm<H: HypervisorProvider> {
    pub(crate) rm: RegionManager<H::Vm>,
    pub(crate) heap: HeapManager,
    pub(crate) vcpu: Vcpu<H::Vcpu>,
    pub(crate) binary: LoadedElf,
    pub(crate) handlers: SyscallHandlers,
    pub(crate) syscall_table: [Option<SyscallFn<H>>; kvmbox_common_linux::nr::SYSCALL_TABLE_SIZE],
    pub(crate) signals: SignalState,
    pub(crate) rlimits: [RLimit; RLIMIT_NLIMITS],
    pub(crate) state: RunState,
    pub(crate) debug: bool,
    #[allow(dead_code)]
    pub(crate) isr_flat: Flat,
    #[allow(dead_code)]
    pub(crate) entry_flat: Flat,
}

impl<H: HypervisorProvider> Vm<H> {
    /// Build a VM ready to run: address space, loaded binary, stack
    /// image, descriptor tables, trampolines, syscall plumbing.
    pub fn new(
        hypervisor: &H,
        opts: &VmOptions,
        handlers: SyscallHandlers,
    ) -> Result<Self, SetupError> {
        let mut platform_vm = hypervisor.create_vm()?;
        // Fail early if the run structure is unusable.
        let _ = hypervisor.vcpu_mmap_size()?;
        let platform_vcpu = platform_vm.create_vcpu(0)?;

        let pager = Pager::initialize(platform_vm, VmMode::LongMode)?;
        let mut rm = RegionManager::new(pager);
        let mut vcpu = Vcpu::new(platform_vcpu)?;
        let mut heap = HeapManager::new();

        let binary = loader::elf::load_binary(&opts.binary, &mut rm, &mut heap)?;

        let isr_flat = load_flat(&mut rm, &opts.isr_path, Purpose::Isr, true)?;
        let entry_flat = load_flat(&mut rm, &opts.entry_path, Purpose::EntryTrampoline, true)?;
        let cleanup_flat = load_flat(
            &mut rm,
            &opts.sighandler_cleanup_path,
            Purpose::EntryTrampoline,
            false,
        )?;

        let stack = loader::stack::setup_stack(
            &mut rm,
            &mut vcpu,
            &binary.auxv,
            &opts.argv,
            &opts.envp,
        )?;

        let gdt = arch::gdt::setup_gdt(&mut rm, stack.kernel_stack_top)?;
        let idt = arch::idt::setup_idt(&mut rm, isr_flat.guest_addr)?;

        vcpu.sregs = arch::long_mode_sregs(&gdt, &idt, rm.pager().pml4_addr());
        vcpu.regs.rip = binary.entry_point;
        vcpu.regs.rflags = 0x2;
        vcpu.set_msrs(&[
            kvm_msr_entry {
                index: msr::STAR,
                data: gdt.star,
                ..Default::default()
            },
            kvm_msr_entry {
                index: msr::LSTAR,
                data: entry_flat.guest_addr,
                ..Default::default()
            },
            kvm_msr_entry {
                index: msr::SFMASK,
                data: 0,
                ..Default::default()
            },
        ])?;
        vcpu.flush()?;

        let mut rlimits = [RLimit::INFINITE; RLIMIT_NLIMITS];
        rlimits[RLIMIT_STACK] = RLimit {
            rlim_cur: 8 * 1024 * 1024,
            rlim_max: RLimit::INFINITE.rlim_max,
        };

        Ok(Self {
            rm,
            heap,
            vcpu,
            binary,
            handlers,
            syscall_table: syscalls::build_table::<H>(),
            signals: SignalState::new(cleanup_flat.guest_addr),
            rlimits,
            state: RunState::Idle,
            debug: opts.debug,
            isr_flat,
            entry_flat,
        })
    }

    /// Put the vCPU in single-step mode.
    pub fn enable_single_step(&mut self) -> Result<(), HvError> {
        self.vcpu.set_guest_debug(true, true)
    }

    pub fn debug_mode(&self) -> bool {
        self.debug
    }

    /// Where the dispatcher state machine currently is.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Entry point the first `run` will start from.
    pub fn entry_point(&self) -> u64 {
        self.binary.entry_point
    }

    /// Whether any brk or mmap mapping covers `addr`.
    pub fn address_mapped(&self, addr: u64) -> bool {
        self.heap.address_mapped(addr)
    }

    /// The region manager (and through it the pager).
    pub fn region_manager(&self) -> &RegionManager<H::Vm> {
        &self.rm
    }

    /// Mutable vCPU access, used by embedders staging test scenarios.
    pub fn vcpu_mut(&mut self) -> &mut Vcpu<H::Vcpu> {
        &mut self.vcpu
    }

    /// Push a value onto the guest stack through the pager.
    pub fn push_guest(&mut self, value: u64) -> Result<(), kvmbox::vcpu::VcpuError> {
        self.vcpu.push(self.rm.pager(), value)
    }

    /// Log the current region and mapping tables.
    pub fn dump_memory(&self) {
        self.rm.dump_regions();
        self.heap.dump_mappings();
    }
}
