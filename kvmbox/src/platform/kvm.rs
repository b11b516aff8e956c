// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! KVM implementation of the hypervisor traits, via `/dev/kvm`.

use kvm_bindings::{
    kvm_guest_debug, kvm_msr_entry, kvm_regs, kvm_sregs, kvm_userspace_memory_region, Msrs,
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_GUESTDBG_USE_SW_BP,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};

use super::{HvError, HypervisorProvider, VcpuProvider, VmExit, VmProvider};

fn ioctl_err(e: kvm_ioctls::Error) -> HvError {
    HvError::Ioctl(std::io::Error::from_raw_os_error(e.errno()))
}

/// Handle to the KVM subsystem.
pub struct KvmHypervisor {
    kvm: Kvm,
}

impl KvmHypervisor {
    /// Open `/dev/kvm`.
    pub fn new() -> Result<Self, HvError> {
        let kvm = Kvm::new().map_err(|e| {
            HvError::Unavailable(std::io::Error::from_raw_os_error(e.errno()))
        })?;
        Ok(Self { kvm })
    }
}

impl HypervisorProvider for KvmHypervisor {
    type Vm = KvmVm;
    type Vcpu = KvmVcpu;

    fn create_vm(&self) -> Result<KvmVm, HvError> {
        let vm = self.kvm.create_vm().map_err(ioctl_err)?;
        Ok(KvmVm { vm })
    }

    fn vcpu_mmap_size(&self) -> Result<usize, HvError> {
        self.kvm.get_vcpu_mmap_size().map_err(ioctl_err)
    }
}

/// A KVM virtual machine file descriptor.
pub struct KvmVm {
    vm: VmFd,
}

impl VmProvider for KvmVm {
    type Vcpu = KvmVcpu;

    fn create_vcpu(&mut self, id: u64) -> Result<KvmVcpu, HvError> {
        let vcpu = self.vm.create_vcpu(id).map_err(ioctl_err)?;
        Ok(KvmVcpu { vcpu })
    }

    unsafe fn set_user_memory_region(
        &mut self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), HvError> {
        unsafe { self.vm.set_user_memory_region(region) }.map_err(ioctl_err)
    }
}

/// A KVM vCPU file descriptor.
pub struct KvmVcpu {
    vcpu: VcpuFd,
}

impl VcpuProvider for KvmVcpu {
    fn get_regs(&self) -> Result<kvm_regs, HvError> {
        self.vcpu.get_regs().map_err(ioctl_err)
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<(), HvError> {
        self.vcpu.set_regs(regs).map_err(ioctl_err)
    }

    fn get_sregs(&self) -> Result<kvm_sregs, HvError> {
        self.vcpu.get_sregs().map_err(ioctl_err)
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), HvError> {
        self.vcpu.set_sregs(sregs).map_err(ioctl_err)
    }

    fn set_msrs(&self, entries: &[kvm_msr_entry]) -> Result<(), HvError> {
        let msrs = Msrs::from_entries(entries)
            .map_err(|_| HvError::Ioctl(std::io::Error::from_raw_os_error(libc::E2BIG)))?;
        let written = self.vcpu.set_msrs(&msrs).map_err(ioctl_err)?;
        if written != entries.len() {
            return Err(HvError::Ioctl(std::io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        Ok(())
    }

    fn run(&mut self) -> Result<VmExit, HvError> {
        match self.vcpu.run() {
            Ok(VcpuExit::Hlt) => Ok(VmExit::Hlt),
            Ok(VcpuExit::IoOut(port, _data)) => Ok(VmExit::IoOut { port }),
            Ok(VcpuExit::IoIn(port, _data)) => Ok(VmExit::IoOut { port }),
            Ok(VcpuExit::Debug(arch)) => Ok(VmExit::Debug { pc: arch.pc }),
            Ok(VcpuExit::Shutdown) => Ok(VmExit::Shutdown),
            Ok(other) => {
                log::warn!("unhandled KVM exit: {:?}", other);
                Ok(VmExit::Unsupported(kvm_bindings::KVM_EXIT_UNKNOWN))
            }
            Err(e) if e.errno() == libc::EINTR => Ok(VmExit::Interrupted),
            Err(e) => Err(ioctl_err(e)),
        }
    }

    fn set_guest_debug(
        &self,
        single_step: bool,
        use_sw_breakpoints: bool,
    ) -> Result<(), HvError> {
        let mut control = 0;
        if single_step || use_sw_breakpoints {
            control |= KVM_GUESTDBG_ENABLE;
        }
        if single_step {
            control |= KVM_GUESTDBG_SINGLESTEP;
        }
        if use_sw_breakpoints {
            control |= KVM_GUESTDBG_USE_SW_BP;
        }
        let debug = kvm_guest_debug {
            control,
            ..Default::default()
        };
        self.vcpu.set_guest_debug(&debug).map_err(ioctl_err)
    }
}
