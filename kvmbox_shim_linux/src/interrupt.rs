// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! CPU interrupt routing.
//!
//! The ISR stubs push the vector number and trap to the monitor with an
//! `Interrupt` hypercall; vector and error code are popped off the guest
//! stack here. Stack-growth page faults are the only recoverable case.

use kvmbox::layout::PAGE_SIZE;
use kvmbox::platform::HypervisorProvider;

use crate::run::{Flow, GuestFault, RunError};
use crate::Vm;

pub(crate) mod vector {
    pub const DEBUG_TRAP: u64 = 0x01;
    pub const STACK_SEGMENT_FAULT: u64 = 0x0c;
    pub const GENERAL_PROTECTION_FAULT: u64 = 0x0d;
    pub const PAGE_FAULT: u64 = 0x0e;
}

impl<H: HypervisorProvider> Vm<H> {
    pub(crate) fn handle_interrupt(&mut self) -> Result<Flow, RunError> {
        let interrupt_vector = self.vcpu.pop(self.rm.pager())?;
        if self.debug {
            log::debug!("INTERRUPT with vector {:#x} detected", interrupt_vector);
            self.vcpu.dump_regs();
            self.dump_memory();
        }
        let err_code = self.vcpu.pop(self.rm.pager())?;

        match interrupt_vector {
            vector::DEBUG_TRAP => {
                // The error-code slot carries RIP here; push it back and
                // let the stub IRET.
                log::debug!("debug trap at RIP {:#x}", err_code);
                self.vcpu.push(self.rm.pager(), err_code)?;
                Ok(Flow::Resume)
            }
            vector::STACK_SEGMENT_FAULT => {
                log::error!("STACK SEGMENT FAULT, error code {}", err_code);
                Err(RunError::GuestFatal(GuestFault::StackSegment(err_code)))
            }
            vector::GENERAL_PROTECTION_FAULT => {
                log::error!("GENERAL PROTECTION FAULT, error code {}", err_code);
                Err(RunError::GuestFatal(GuestFault::GeneralProtection(err_code)))
            }
            vector::PAGE_FAULT => {
                let fault_addr = self.vcpu.sregs.cr2;
                if fault_addr <= PAGE_SIZE as u64 {
                    log::error!("SEGMENTATION FAULT at {:#x}", fault_addr);
                    return Err(RunError::GuestFatal(GuestFault::SegfaultNearNull(
                        fault_addr,
                    )));
                }
                if self
                    .rm
                    .pager_mut()
                    .handle_pagefault(fault_addr, err_code as u32)?
                {
                    return Ok(Flow::Resume);
                }
                let host = self.rm.pager().get_host_p(fault_addr);
                log::error!(
                    "page fault at {:#x} (error code {:#x}, host {:?})",
                    fault_addr,
                    err_code,
                    host
                );
                Err(RunError::GuestFatal(GuestFault::PageFault(fault_addr)))
            }
            v => Err(RunError::GuestFatal(GuestFault::UnknownVector(v))),
        }
    }
}
