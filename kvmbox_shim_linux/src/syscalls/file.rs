// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! File-descriptor syscalls: argument marshaling in front of the host
//! handler vtable.

use kvmbox::platform::HypervisorProvider;
use kvmbox_common_linux::errno::Errno;

use crate::Vm;

macro_rules! require_handler {
    ($vm:expr, $name:ident) => {
        match $vm.handlers.$name {
            Some(f) => f,
            None => {
                log::warn!(concat!(stringify!($name), " handler not found"));
                return Errno::ENOSYS.as_neg();
            }
        }
    };
}
pub(crate) use require_handler;

pub(crate) fn sys_read<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, read);
    let [fd, buf_p, count, ..] = vm.vcpu.syscall_args();
    let Some(buf) = vm.guest_slice_mut(buf_p, count as usize) else {
        return Errno::EFAULT.as_neg();
    };
    let result = handler(fd as i32, buf);
    log::debug!("read fd {} count {} -> {}", fd as i32, count, result);
    result
}

pub(crate) fn sys_write<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, write);
    let [fd, buf_p, count, ..] = vm.vcpu.syscall_args();
    let Some(buf) = vm.guest_slice_mut(buf_p, count as usize) else {
        return Errno::EFAULT.as_neg();
    };
    let result = handler(fd as i32, buf);
    log::debug!("write fd {} count {} -> {}", fd as i32, count, result);
    result
}

pub(crate) fn sys_open<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, open);
    let [path_p, flags, mode, ..] = vm.vcpu.syscall_args();
    let Some(path) = vm.guest_cstr(path_p) else {
        return Errno::EFAULT.as_neg();
    };
    let result = handler(path, flags as i32, mode as u32);
    log::debug!("open {:?} flags {:#x} -> {}", path, flags, result);
    result
}

pub(crate) fn sys_close<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, close);
    let [fd, ..] = vm.vcpu.syscall_args();
    handler(fd as i32)
}

fn stat_common<H: HypervisorProvider>(
    vm: &mut Vm<H>,
    handler: fn(&std::ffi::CStr, &mut libc::stat) -> i64,
) -> i64 {
    let [path_p, buf_p, ..] = vm.vcpu.syscall_args();
    let Some(path) = vm.guest_cstr(path_p) else {
        return Errno::EFAULT.as_neg();
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let result = handler(path, &mut st);
    if result == 0 && vm.guest_write(buf_p, st).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_stat<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, stat);
    stat_common(vm, handler)
}

pub(crate) fn sys_lstat<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, lstat);
    stat_common(vm, handler)
}

pub(crate) fn sys_fstat<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, fstat);
    let [fd, buf_p, ..] = vm.vcpu.syscall_args();
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let result = handler(fd as i32, &mut st);
    if result == 0 && vm.guest_write(buf_p, st).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_lseek<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, lseek);
    let [fd, offset, whence, ..] = vm.vcpu.syscall_args();
    handler(fd as i32, offset as i64, whence as i32)
}

fn translate_iovecs<H: HypervisorProvider>(
    vm: &Vm<H>,
    iov_p: u64,
    iovcnt: usize,
) -> Option<Vec<libc::iovec>> {
    let mut out = Vec::with_capacity(iovcnt);
    for i in 0..iovcnt {
        let entry: libc::iovec = vm.guest_read(iov_p + (i * 16) as u64)?;
        let host = vm.guest_ptr(entry.iov_base as u64)?;
        out.push(libc::iovec {
            iov_base: host.cast(),
            iov_len: entry.iov_len,
        });
    }
    Some(out)
}

pub(crate) fn sys_readv<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, readv);
    let [fd, iov_p, iovcnt, ..] = vm.vcpu.syscall_args();
    let Some(mut iovs) = translate_iovecs(vm, iov_p, iovcnt as usize) else {
        return Errno::EFAULT.as_neg();
    };
    handler(fd as i32, &mut iovs)
}

pub(crate) fn sys_writev<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, writev);
    let [fd, iov_p, iovcnt, ..] = vm.vcpu.syscall_args();
    let Some(iovs) = translate_iovecs(vm, iov_p, iovcnt as usize) else {
        return Errno::EFAULT.as_neg();
    };
    handler(fd as i32, &iovs)
}

pub(crate) fn sys_access<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, access);
    let [path_p, mode, ..] = vm.vcpu.syscall_args();
    let Some(path) = vm.guest_cstr(path_p) else {
        return Errno::EFAULT.as_neg();
    };
    handler(path, mode as i32)
}

pub(crate) fn sys_pipe<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, pipe);
    let [fds_p, ..] = vm.vcpu.syscall_args();
    let mut fds = [0i32; 2];
    let result = handler(&mut fds);
    if result == 0 && vm.guest_write(fds_p, fds).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_dup<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, dup);
    let [oldfd, ..] = vm.vcpu.syscall_args();
    handler(oldfd as i32)
}

pub(crate) fn sys_fcntl<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, fcntl);
    let [fd, cmd, arg, ..] = vm.vcpu.syscall_args();
    handler(fd as i32, cmd as i32, arg)
}

pub(crate) fn sys_truncate<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, truncate);
    let [path_p, length, ..] = vm.vcpu.syscall_args();
    let Some(path) = vm.guest_cstr(path_p) else {
        return Errno::EFAULT.as_neg();
    };
    handler(path, length as i64)
}

pub(crate) fn sys_ftruncate<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, ftruncate);
    let [fd, length, ..] = vm.vcpu.syscall_args();
    handler(fd as i32, length as i64)
}

pub(crate) fn sys_getcwd<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, getcwd);
    let [buf_p, size, ..] = vm.vcpu.syscall_args();
    let Some(buf) = vm.guest_slice_mut(buf_p, size as usize) else {
        return Errno::EFAULT.as_neg();
    };
    handler(buf)
}

pub(crate) fn sys_mkdir<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, mkdir);
    let [path_p, mode, ..] = vm.vcpu.syscall_args();
    let Some(path) = vm.guest_cstr(path_p) else {
        return Errno::EFAULT.as_neg();
    };
    handler(path, mode as u32)
}

pub(crate) fn sys_unlink<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, unlink);
    let [path_p, ..] = vm.vcpu.syscall_args();
    let Some(path) = vm.guest_cstr(path_p) else {
        return Errno::EFAULT.as_neg();
    };
    handler(path)
}

pub(crate) fn sys_readlink<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, readlink);
    let [path_p, buf_p, bufsiz, ..] = vm.vcpu.syscall_args();
    let Some(path) = vm.guest_cstr(path_p) else {
        return Errno::EFAULT.as_neg();
    };
    let Some(buf) = vm.guest_slice_mut(buf_p, bufsiz as usize) else {
        return Errno::EFAULT.as_neg();
    };
    handler(path, buf)
}
