// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! In-process mock hypervisor.
//!
//! Backs the test suite: memory-slot registrations are recorded, register
//! state is plain data, and `run` pops scripted exits instead of entering
//! a guest. Since every guest-memory access in the monitor goes through
//! host pointers, the whole memory subsystem behaves identically under
//! the mock and under KVM.

use std::collections::VecDeque;

use kvm_bindings::{kvm_msr_entry, kvm_regs, kvm_sregs, kvm_userspace_memory_region};
use std::cell::RefCell;
use std::rc::Rc;

use super::{HvError, HypervisorProvider, VcpuProvider, VmExit, VmProvider};

/// One scripted `run` outcome: optional register state to install before
/// the exit is reported, and the exit itself.
#[derive(Clone, Debug)]
pub struct ScriptedExit {
    pub regs: Option<kvm_regs>,
    pub exit: VmExit,
}

#[derive(Default)]
struct VcpuState {
    regs: kvm_regs,
    sregs: kvm_sregs,
    msrs: Vec<kvm_msr_entry>,
    script: VecDeque<ScriptedExit>,
    single_step: bool,
}

/// Shared handle to a mock vCPU's state, used by tests to stage register
/// values and scripted exits while the monitor owns the vCPU.
#[derive(Clone, Default)]
pub struct MockVcpuHandle {
    state: Rc<RefCell<VcpuState>>,
}

impl MockVcpuHandle {
    pub fn regs(&self) -> kvm_regs {
        self.state.borrow().regs
    }

    pub fn set_regs(&self, regs: kvm_regs) {
        self.state.borrow_mut().regs = regs;
    }

    pub fn sregs(&self) -> kvm_sregs {
        self.state.borrow().sregs
    }

    pub fn push_exit(&self, scripted: ScriptedExit) {
        self.state.borrow_mut().script.push_back(scripted);
    }

    pub fn single_step(&self) -> bool {
        self.state.borrow().single_step
    }
}

/// Mock hypervisor. Hands out one shared vCPU handle per created vCPU.
#[derive(Default)]
pub struct MockHypervisor {
    vcpu_handle: MockVcpuHandle,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the state of the vCPU this hypervisor creates.
    pub fn vcpu_handle(&self) -> MockVcpuHandle {
        self.vcpu_handle.clone()
    }
}

impl HypervisorProvider for MockHypervisor {
    type Vm = MockVm;
    type Vcpu = MockVcpu;

    fn create_vm(&self) -> Result<MockVm, HvError> {
        Ok(MockVm {
            vcpu_handle: self.vcpu_handle.clone(),
            regions: Vec::new(),
        })
    }

    fn vcpu_mmap_size(&self) -> Result<usize, HvError> {
        Ok(crate::layout::PAGE_SIZE)
    }
}

/// Mock VM: records registered memory slots.
pub struct MockVm {
    vcpu_handle: MockVcpuHandle,
    regions: Vec<kvm_userspace_memory_region>,
}

impl MockVm {
    pub fn regions(&self) -> &[kvm_userspace_memory_region] {
        &self.regions
    }
}

impl VmProvider for MockVm {
    type Vcpu = MockVcpu;

    fn create_vcpu(&mut self, _id: u64) -> Result<MockVcpu, HvError> {
        Ok(MockVcpu {
            state: self.vcpu_handle.clone(),
        })
    }

    unsafe fn set_user_memory_region(
        &mut self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), HvError> {
        if let Some(existing) = self.regions.iter_mut().find(|r| r.slot == region.slot) {
            *existing = region;
        } else {
            self.regions.push(region);
        }
        Ok(())
    }
}

/// Mock vCPU: registers are plain data, `run` pops the script.
pub struct MockVcpu {
    state: MockVcpuHandle,
}

impl VcpuProvider for MockVcpu {
    fn get_regs(&self) -> Result<kvm_regs, HvError> {
        Ok(self.state.state.borrow().regs)
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<(), HvError> {
        self.state.state.borrow_mut().regs = *regs;
        Ok(())
    }

    fn get_sregs(&self) -> Result<kvm_sregs, HvError> {
        Ok(self.state.state.borrow().sregs)
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), HvError> {
        self.state.state.borrow_mut().sregs = *sregs;
        Ok(())
    }

    fn set_msrs(&self, entries: &[kvm_msr_entry]) -> Result<(), HvError> {
        self.state.state.borrow_mut().msrs.extend_from_slice(entries);
        Ok(())
    }

    fn run(&mut self) -> Result<VmExit, HvError> {
        let mut state = self.state.state.borrow_mut();
        match state.script.pop_front() {
            Some(scripted) => {
                if let Some(regs) = scripted.regs {
                    state.regs = regs;
                }
                Ok(scripted.exit)
            }
            None => Ok(VmExit::Shutdown),
        }
    }

    fn set_guest_debug(
        &self,
        single_step: bool,
        _use_sw_breakpoints: bool,
    ) -> Result<(), HvError> {
        self.state.state.borrow_mut().single_step = single_step;
        Ok(())
    }
}
