// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Guest signal delivery.
//!
//! The guest registers dispositions with `rt_sigaction`; the monitor
//! installs an enqueue-only host handler for each registered number.
//! Between vCPU quanta a pending signal is delivered by saving the
//! register file, synthesizing a frame that runs the guest handler and
//! then the cleanup trampoline, and setting `RDI` to the signal number.
//! The trampoline's `ExitHandler` hypercall restores the saved state.

use kvm_bindings::{kvm_regs, kvm_sregs};
use kvmbox::mm::GuestPtr;
use kvmbox::platform::HypervisorProvider;
use kvmbox_common_linux::errno::Errno;
use kvmbox_common_linux::signal::{SigAction, SigSet, Signal, SIG_DFL, SIG_IGN};

use crate::run::RunError;
use crate::Vm;

const SIG_BLOCK: i32 = 0;
const SIG_UNBLOCK: i32 = 1;
const SIG_SETMASK: i32 = 2;

/// Per-VM signal state.
pub(crate) struct SignalState {
    actions: [SigAction; 64],
    blocked: SigSet,
    saved: Option<(kvm_regs, kvm_sregs)>,
    handler_active: bool,
    cleanup_trampoline: GuestPtr,
}

impl SignalState {
    pub(crate) fn new(cleanup_trampoline: GuestPtr) -> Self {
        Self {
            actions: [SigAction::default(); 64],
            blocked: SigSet::default(),
            saved: None,
            handler_active: false,
            cleanup_trampoline,
        }
    }

    /// Install a guest disposition; returns the previous one. The host
    /// handler is (re)installed so the signal actually reaches the
    /// pending queue.
    pub(crate) fn register_action(
        &mut self,
        signal: Signal,
        act: Option<SigAction>,
    ) -> Result<SigAction, Errno> {
        let old = self.actions[signal.index()];
        if let Some(act) = act {
            self.actions[signal.index()] = act;
            kvmbox::signal::install_host_handler(signal.as_i32())
                .map_err(|_| Errno::EINVAL)?;
        }
        Ok(old)
    }

    pub(crate) fn action(&self, signal: Signal) -> SigAction {
        self.actions[signal.index()]
    }

    pub(crate) fn blocked(&self) -> SigSet {
        self.blocked
    }

    pub(crate) fn set_blocked(&mut self, how: i32, set: SigSet) -> Result<(), ()> {
        match how {
            SIG_BLOCK => self.blocked.0 |= set.0,
            SIG_UNBLOCK => self.blocked.0 &= !set.0,
            SIG_SETMASK => self.blocked = set,
            _ => return Err(()),
        }
        Ok(())
    }

    pub(crate) fn handler_active(&self) -> bool {
        self.handler_active
    }
}

impl<H: HypervisorProvider> Vm<H> {
    /// If a signal is pending and no handler is running, synthesize the
    /// handler frame so the next quantum executes it.
    pub(crate) fn deliver_pending_signal(&mut self) -> Result<(), RunError> {
        if self.signals.handler_active {
            return Ok(());
        }
        let Some(signum) = kvmbox::signal::next_pending() else {
            return Ok(());
        };
        let Ok(signal) = Signal::try_from(signum) else {
            return Ok(());
        };
        let action = self.signals.action(signal);
        if action.sa_handler == SIG_DFL || action.sa_handler == SIG_IGN {
            return Ok(());
        }
        if self.debug {
            log::debug!("delivering signal {} to guest handler {:#x}", signum, action.sa_handler);
        }

        self.vcpu.fetch()?;
        self.signals.saved = Some((self.vcpu.regs, self.vcpu.sregs));
        self.signals.handler_active = true;

        // Frame: saved RAX, then the cleanup trampoline as the handler's
        // return address; the handler itself runs next.
        let rax = self.vcpu.regs.rax;
        self.vcpu.push(self.rm.pager(), rax)?;
        let cleanup = self.signals.cleanup_trampoline;
        self.vcpu.push(self.rm.pager(), cleanup)?;
        self.vcpu.regs.rip = action.sa_handler;
        self.vcpu.regs.rdi = signum as u64;
        self.vcpu.flush()?;
        Ok(())
    }

    /// The cleanup trampoline issued its hypercall: restore the saved
    /// register file.
    pub(crate) fn finish_signal_handler(&mut self) -> Result<(), RunError> {
        if let Some((regs, sregs)) = self.signals.saved.take() {
            self.vcpu.regs = regs;
            self.vcpu.sregs = sregs;
        }
        self.signals.handler_active = false;
        Ok(())
    }
}
