// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The run loop and hypercall dispatcher.
//!
//! The dispatcher is an explicit state machine, not a coroutine:
//! `Idle → Running → ExitKnown → Dispatched → Running`, with pending
//! signals delivered on the edge back into `Running`. Each VM exit is
//! classified as a hypercall (the guest trampolines push a tag and
//! trap), a plain resume, or a fatal condition that ends the loop.

use kvmbox::mm::pager::PagerError;
use kvmbox::platform::{HypervisorProvider, HvError, VmExit};
use kvmbox::vcpu::{Hypercall, VcpuError};
use kvmbox_common_linux::errno::Errno;
use kvmbox_common_linux::nr;
use thiserror::Error;

use crate::Vm;

/// Length of the trapping instruction emulated after a VMCALL-style
/// hypercall exit (HLT and I/O exits are completed by the hypervisor).
const VMCALL_INSN_LEN: u64 = 3;

/// Where the dispatcher currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    ExitKnown,
    Dispatched,
}

/// What to do after dispatching an exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Resume,
    Exit(i32),
}

/// One entry in the dispatch table.
pub(crate) type SyscallFn<H> = fn(&mut Vm<H>) -> i64;

/// An interrupt the monitor cannot recover from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestFault {
    StackSegment(u64),
    GeneralProtection(u64),
    PageFault(u64),
    SegfaultNearNull(u64),
    Shutdown,
    UnknownVector(u64),
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Hv(#[from] HvError),
    #[error(transparent)]
    Vcpu(#[from] VcpuError),
    #[error(transparent)]
    Pager(#[from] PagerError),
    #[error("guest fault: {0:?}")]
    GuestFatal(GuestFault),
    #[error("unknown hypercall tag {0:#x}")]
    UnknownHypercall(u64),
    #[error("unsupported VM exit reason {0}")]
    UnsupportedExit(u32),
}

impl<H: HypervisorProvider> Vm<H> {
    /// Run the guest until it exits.
    ///
    /// Returns the guest's exit status on a clean `exit_group` or `Exit`
    /// hypercall; fatal interrupts surface as [`RunError::GuestFatal`]
    /// after a register dump.
    pub fn run(&mut self) -> Result<i32, RunError> {
        loop {
            self.deliver_pending_signal()?;
            self.state = RunState::Running;
            let exit = self.vcpu.run()?;
            self.state = RunState::ExitKnown;
            let flow = match self.dispatch_exit(exit) {
                Ok(flow) => flow,
                Err(e) => {
                    if matches!(e, RunError::GuestFatal(_)) {
                        self.vcpu.dump_regs();
                    }
                    self.state = RunState::Idle;
                    return Err(e);
                }
            };
            self.state = RunState::Dispatched;
            match flow {
                Flow::Resume => continue,
                Flow::Exit(status) => {
                    self.state = RunState::Idle;
                    log::debug!("guest exited with status {}", status);
                    return Ok(status);
                }
            }
        }
    }

    /// Classify and handle one VM exit.
    pub(crate) fn dispatch_exit(&mut self, exit: VmExit) -> Result<Flow, RunError> {
        match exit {
            VmExit::Hlt | VmExit::IoOut { .. } | VmExit::Hypercall => {
                self.vcpu.fetch()?;
                let tag = self.vcpu.pop(self.rm.pager())?;
                let flow = match Hypercall::try_from(tag) {
                    Ok(Hypercall::Syscall) => self.handle_syscall()?,
                    Ok(Hypercall::Interrupt) => self.handle_interrupt()?,
                    Ok(Hypercall::Exit) => Flow::Exit(self.vcpu.regs.rdi as i32),
                    Ok(Hypercall::ExitHandler) => {
                        self.finish_signal_handler()?;
                        Flow::Resume
                    }
                    Err(_) => return Err(RunError::UnknownHypercall(tag)),
                };
                if matches!(exit, VmExit::Hypercall) {
                    self.vcpu.regs.rip += VMCALL_INSN_LEN;
                }
                self.vcpu.flush()?;
                Ok(flow)
            }
            VmExit::Interrupted => Ok(Flow::Resume),
            VmExit::Debug { pc } => {
                if self.debug {
                    log::debug!("debug trap at {:#x}", pc);
                }
                Ok(Flow::Resume)
            }
            VmExit::Shutdown => Err(RunError::GuestFatal(GuestFault::Shutdown)),
            VmExit::Unsupported(reason) => Err(RunError::UnsupportedExit(reason)),
        }
    }

    fn handle_syscall(&mut self) -> Result<Flow, RunError> {
        let num = self.vcpu.regs.rax as usize;
        let entry = self
            .syscall_table
            .get(num)
            .copied()
            .flatten();
        let Some(handler) = entry else {
            log::warn!("invalid syscall {} ({})", num, nr::syscall_name(num));
            self.vcpu.regs.rax = Errno::ENOSYS.as_neg() as u64;
            return Ok(Flow::Resume);
        };
        if self.debug {
            log::debug!("syscall {:3} ({})", num, nr::syscall_name(num));
        }
        let result = handler(self);
        if num == nr::EXIT_GROUP {
            return Ok(Flow::Exit(self.vcpu.regs.rdi as i32));
        }
        // The binary expects the syscall result in RAX.
        self.vcpu.regs.rax = result as u64;
        Ok(Flow::Resume)
    }
}
