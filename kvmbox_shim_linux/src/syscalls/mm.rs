// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Memory-management syscalls, served by the heap manager.

use kvmbox::mm::heap::MapError;
use kvmbox::platform::HypervisorProvider;
use kvmbox_common_linux::errno::Errno;
use kvmbox_common_linux::{MRemapFlags, MapFlags, ProtFlags};

use super::MapRequest;
use crate::Vm;

fn map_error_to_errno(e: &MapError) -> Errno {
    match e {
        MapError::Unsupported(_) => Errno::EINVAL,
        MapError::NoSuchMapping(_) => Errno::EINVAL,
        MapError::Unaligned => Errno::EINVAL,
        MapError::BelowInitialBrk => Errno::ENOMEM,
        MapError::Region(_) | MapError::Pager(_) => Errno::ENOMEM,
    }
}

pub(crate) fn sys_mmap<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [addr, length, prot, flags, fd, offset] = vm.vcpu.syscall_args();
    if length == 0 {
        return Errno::EINVAL.as_neg();
    }
    let prot_flags = ProtFlags::from_bits_truncate(prot as u32);
    let map_flags = MapFlags::from_bits_truncate(flags as u32);

    // The host handler produces the backing buffer, bringing in file
    // content for file-backed requests. Without a handler the monitor
    // allocates anonymous backing itself.
    let backing = match vm.handlers.mmap {
        Some(handler) => {
            let mut request = MapRequest {
                addr,
                length: length as usize,
                prot: prot as i32,
                flags: flags as i32,
                fd: fd as i32,
                offset: offset as i64,
                host_p: std::ptr::null_mut(),
            };
            let result = handler(&mut request);
            if result < 0 {
                return result;
            }
            (!request.host_p.is_null()).then_some(request.host_p)
        }
        None => None,
    };

    match vm.heap.mmap(
        &mut vm.rm,
        addr,
        length as usize,
        prot_flags,
        map_flags,
        fd as i32,
        offset,
        backing,
    ) {
        Ok(guest_addr) => {
            log::debug!(
                "mmap addr {:#x} len {:#x} prot {:?} -> {:#x}",
                addr,
                length,
                prot_flags,
                guest_addr
            );
            guest_addr as i64
        }
        Err(e) => {
            log::debug!("mmap failed: {}", e);
            map_error_to_errno(&e).as_neg()
        }
    }
}

pub(crate) fn sys_mprotect<H: HypervisorProvider>(_vm: &mut Vm<H>) -> i64 {
    Errno::ENOSYS.as_neg()
}

pub(crate) fn sys_munmap<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [addr, length, ..] = vm.vcpu.syscall_args();
    if length == 0 {
        return Errno::EINVAL.as_neg();
    }
    // Tell the host side first so it can release its file view.
    if let Some(handler) = vm.handlers.munmap {
        if let Some(host) = vm.guest_ptr(addr) {
            handler(host, length as usize);
        }
    }
    match vm.heap.munmap(&mut vm.rm, addr, length as usize) {
        Ok(()) => 0,
        Err(e) => map_error_to_errno(&e).as_neg(),
    }
}

pub(crate) fn sys_brk<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [newbrk, ..] = vm.vcpu.syscall_args();
    if newbrk == 0 {
        return vm.heap.curbrk() as i64;
    }
    match vm.heap.brk(&mut vm.rm, newbrk) {
        Ok(brk) => {
            log::debug!("brk {:#x} -> {:#x}", newbrk, brk);
            brk as i64
        }
        // Linux brk reports failure by returning the unchanged break.
        Err(_) => vm.heap.curbrk() as i64,
    }
}

pub(crate) fn sys_mremap<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [old_addr, _old_size, new_size, flags, _new_addr, ..] = vm.vcpu.syscall_args();
    let flags = MRemapFlags::from_bits_truncate(flags as u32);
    match vm.heap.mremap(&mut vm.rm, old_addr, new_size as usize, flags) {
        Ok(addr) => addr as i64,
        Err(MapError::Unsupported(_)) => Errno::EINVAL.as_neg(),
        Err(e) => map_error_to_errno(&e).as_neg(),
    }
}
