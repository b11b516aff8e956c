// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Initial user stack image, per the System V AMD64 start protocol.
//!
//! ```text
//! position            content
//! ------------------------------------------------------------
//! RSP ->            [ argc ]
//!                   [ argv[0] .. argv[n-1], NULL ]
//!                   [ envp[0] .. envp[m-1], NULL ]
//!                   [ auxv pairs .. AT_NULL pair ]
//! ------------------------------------------------------------
//! ```
//!
//! String bodies live in the env region just below the stack base; only
//! their guest addresses are pushed.

use std::ffi::CString;

use thiserror::Error;

use kvmbox::layout::{ENV_REGION_PAGES, PAGE_SIZE, STACK_BASE, STACK_REGION_PAGES};
use kvmbox::mm::pager::{PageOpts, PagerError};
use kvmbox::mm::region::{RegionError, RegionManager};
use kvmbox::mm::{GuestPtr, Purpose};
use kvmbox::platform::{VcpuProvider, VmProvider};
use kvmbox::vcpu::{Vcpu, VcpuError};

use super::auxv::{AuxKey, Auxv};

#[derive(Error, Debug)]
pub enum StackError {
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Pager(#[from] PagerError),
    #[error(transparent)]
    Vcpu(#[from] VcpuError),
    #[error("env region overflow")]
    EnvOverflow,
}

/// Result of stack construction.
pub struct StackSetup {
    /// Top of the one-page kernel stack, mapped in the upper half.
    pub kernel_stack_top: GuestPtr,
    /// Lowest mapped page of the user stack.
    pub stack_low: GuestPtr,
}

/// Build the env region, the initial user stack, and the kernel stack,
/// and leave `RSP` pointing at `argc`.
pub fn setup_stack<V: VmProvider, C: VcpuProvider>(
    rm: &mut RegionManager<V>,
    vcpu: &mut Vcpu<C>,
    auxv: &Auxv,
    argv: &[CString],
    envp: &[CString],
) -> Result<StackSetup, StackError> {
    // Env region directly below the stack base; holds the string bodies.
    let env_size = ENV_REGION_PAGES * PAGE_SIZE;
    let env_region = rm.allocate_region(env_size, Purpose::Env)?;
    let env_base = STACK_BASE - env_size as u64;
    let env_host = rm.host_base(env_region);
    rm.set_guest_addr(env_region, env_base);
    rm.pager_mut()
        .map_region(env_host, env_base, ENV_REGION_PAGES, PageOpts::WRITE)?;

    // The initial stack grows down from the env region.
    let stack_size = STACK_REGION_PAGES * PAGE_SIZE;
    let stack_region = rm.allocate_region(stack_size, Purpose::Stack)?;
    let stack_low = env_base - stack_size as u64;
    let stack_host = rm.host_base(stack_region);
    rm.set_guest_addr(stack_region, stack_low);
    rm.pager_mut()
        .map_region(stack_host, stack_low, STACK_REGION_PAGES, PageOpts::WRITE)?;
    rm.pager_mut().set_stack_window(stack_low);

    // One page of kernel stack for interrupts and privilege switches.
    let kstack_region = rm.allocate_region(PAGE_SIZE, Purpose::KernelStack)?;
    let kstack_host = rm.host_base(kstack_region);
    let kstack_base = rm.pager_mut().map_kernel_page(kstack_host, PageOpts::WRITE)?;
    rm.set_guest_addr(kstack_region, kstack_base);
    let kernel_stack_top = kstack_base + PAGE_SIZE as u64;

    // Copy string bodies into the env region, recording guest addresses.
    let mut cursor = 0usize;
    let mut copy_strings = |strings: &[CString]| -> Result<Vec<u64>, StackError> {
        let mut ptrs = Vec::with_capacity(strings.len());
        for s in strings {
            let bytes = s.as_bytes_with_nul();
            if cursor + bytes.len() > env_size {
                return Err(StackError::EnvOverflow);
            }
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), env_host.add(cursor), bytes.len());
            }
            ptrs.push(env_base + cursor as u64);
            cursor += bytes.len();
        }
        Ok(ptrs)
    };
    let argv_ptrs = copy_strings(argv)?;
    let envp_ptrs = copy_strings(envp)?;

    vcpu.regs.rsp = env_base;

    // Keep RSP 16-byte aligned at the final argc slot.
    let aux_entries = auxv.entries();
    let quads = 2 * (aux_entries.len() + 1) + (envp_ptrs.len() + 1) + (argv_ptrs.len() + 1) + 1;
    if quads % 2 == 1 {
        vcpu.push(rm.pager(), 0)?;
    }

    // Pushes go downward, so everything is emitted in reverse of its
    // final memory order: AT_NULL terminator first, argc last.
    vcpu.push(rm.pager(), 0)?;
    vcpu.push(rm.pager(), AuxKey::AT_NULL as u64)?;
    for (key, value) in aux_entries.iter().rev() {
        vcpu.push(rm.pager(), *value)?;
        vcpu.push(rm.pager(), *key as u64)?;
    }
    vcpu.push(rm.pager(), 0)?;
    for p in envp_ptrs.iter().rev() {
        vcpu.push(rm.pager(), *p)?;
    }
    vcpu.push(rm.pager(), 0)?;
    for p in argv_ptrs.iter().rev() {
        vcpu.push(rm.pager(), *p)?;
    }
    vcpu.push(rm.pager(), argv.len() as u64)?;
    debug_assert_eq!(vcpu.regs.rsp % 16, 0);

    Ok(StackSetup {
        kernel_stack_top,
        stack_low,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvmbox::mm::pager::Pager;
    use kvmbox::platform::mock::MockHypervisor;
    use kvmbox::platform::{HypervisorProvider, VmMode};

    fn read_u64<V: VmProvider>(rm: &RegionManager<V>, gva: u64) -> u64 {
        let host = rm.pager().get_host_p(gva).unwrap();
        unsafe { core::ptr::read_unaligned(host.cast::<u64>()) }
    }

    #[test]
    fn stack_image_follows_the_start_protocol() {
        let hv = MockHypervisor::new();
        let mut vm = hv.create_vm().unwrap();
        let vcpu_raw = vm.create_vcpu(0).unwrap();
        let pager = Pager::initialize(vm, VmMode::LongMode).unwrap();
        let mut rm = RegionManager::new(pager);
        let mut vcpu = Vcpu::new(vcpu_raw).unwrap();

        let argv = vec![
            CString::new("/bin/prog").unwrap(),
            CString::new("arg1").unwrap(),
        ];
        let envp = vec![CString::new("PATH=/bin").unwrap()];
        let auxv = Auxv {
            at_phdr: 0x40_0040,
            at_phent: 56,
            at_phnum: 2,
            at_entry: 0x40_1000,
            at_base: 0,
            valid: true,
        };
        let setup = setup_stack(&mut rm, &mut vcpu, &auxv, &argv, &envp).unwrap();
        assert_eq!(setup.stack_low % PAGE_SIZE as u64, 0);

        let rsp = vcpu.regs.rsp;
        assert_eq!(rsp % 16, 0);
        // argc
        assert_eq!(read_u64(&rm, rsp), 2);
        // argv[0], argv[1], NULL
        let argv0 = read_u64(&rm, rsp + 8);
        let argv1 = read_u64(&rm, rsp + 16);
        assert_eq!(read_u64(&rm, rsp + 24), 0);
        // envp[0], NULL
        let envp0 = read_u64(&rm, rsp + 32);
        assert_eq!(read_u64(&rm, rsp + 40), 0);

        // The pushed addresses point at the copied string bodies.
        let read_cstr = |gva: u64| {
            let mut out = Vec::new();
            let mut p = gva;
            loop {
                let b = unsafe { *rm.pager().get_host_p(p).unwrap() };
                if b == 0 {
                    break;
                }
                out.push(b);
                p += 1;
            }
            out
        };
        assert_eq!(read_cstr(argv0), b"/bin/prog");
        assert_eq!(read_cstr(argv1), b"arg1");
        assert_eq!(read_cstr(envp0), b"PATH=/bin");

        // Auxv block starts after the envp NULL and ends with AT_NULL.
        let mut aux_at = rsp + 48;
        let mut seen_entry = false;
        loop {
            let key = read_u64(&rm, aux_at);
            let value = read_u64(&rm, aux_at + 8);
            if key == AuxKey::AT_NULL as u64 {
                break;
            }
            if key == AuxKey::AT_ENTRY as u64 {
                assert_eq!(value, 0x40_1000);
                seen_entry = true;
            }
            aux_at += 16;
        }
        assert!(seen_entry);
    }
}
