// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Process, identity, time and signal-registration syscalls.

use kvmbox::platform::HypervisorProvider;
use kvmbox_common_linux::errno::Errno;
use kvmbox_common_linux::signal::{SigAction, SigSet, Signal};
use kvmbox_common_linux::{ArchPrctlCode, RLimit, RLIMIT_NLIMITS};

use super::file::require_handler;
use crate::Vm;

pub(crate) fn sys_getpid<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, getpid);
    handler()
}

pub(crate) fn sys_gettid<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, gettid);
    handler()
}

pub(crate) fn sys_getuid<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, getuid);
    handler()
}

pub(crate) fn sys_getgid<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, getgid);
    handler()
}

pub(crate) fn sys_geteuid<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, geteuid);
    handler()
}

pub(crate) fn sys_getegid<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, getegid);
    handler()
}

pub(crate) fn sys_uname<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, uname);
    let [buf_p, ..] = vm.vcpu.syscall_args();
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    let result = handler(&mut name);
    if result == 0 && vm.guest_write(buf_p, name).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_nanosleep<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, nanosleep);
    let [req_p, rem_p, ..] = vm.vcpu.syscall_args();
    let Some(req) = vm.guest_read::<libc::timespec>(req_p) else {
        return Errno::EFAULT.as_neg();
    };
    let mut rem: libc::timespec = unsafe { std::mem::zeroed() };
    let result = handler(&req, (rem_p != 0).then_some(&mut rem));
    if rem_p != 0 && vm.guest_write(rem_p, rem).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_gettimeofday<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, gettimeofday);
    let [tv_p, ..] = vm.vcpu.syscall_args();
    let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
    let result = handler(&mut tv);
    if result == 0 && tv_p != 0 && vm.guest_write(tv_p, tv).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_time<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, time);
    let [time_p, ..] = vm.vcpu.syscall_args();
    let mut t: i64 = 0;
    let result = handler((time_p != 0).then_some(&mut t));
    if time_p != 0 && vm.guest_write(time_p, t).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_clock_gettime<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, clock_gettime);
    let [clockid, tp_p, ..] = vm.vcpu.syscall_args();
    let mut tp: libc::timespec = unsafe { std::mem::zeroed() };
    let result = handler(clockid as i32, &mut tp);
    if result == 0 && vm.guest_write(tp_p, tp).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_times<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, times);
    let [buf_p, ..] = vm.vcpu.syscall_args();
    let mut tms: libc::tms = unsafe { std::mem::zeroed() };
    let result = handler(&mut tms);
    if result >= 0 && vm.guest_write(buf_p, tms).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_getrusage<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, getrusage);
    let [who, usage_p, ..] = vm.vcpu.syscall_args();
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let result = handler(who as i32, &mut usage);
    if result == 0 && vm.guest_write(usage_p, usage).is_none() {
        return Errno::EFAULT.as_neg();
    }
    result
}

pub(crate) fn sys_getrlimit<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [resource, rlim_p, ..] = vm.vcpu.syscall_args();
    let Some(rlim) = vm.rlimits.get(resource as usize) else {
        return Errno::EINVAL.as_neg();
    };
    match vm.guest_write(rlim_p, *rlim) {
        Some(()) => 0,
        None => Errno::EFAULT.as_neg(),
    }
}

pub(crate) fn sys_setrlimit<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [resource, rlim_p, ..] = vm.vcpu.syscall_args();
    if resource as usize >= RLIMIT_NLIMITS {
        return Errno::EINVAL.as_neg();
    }
    let Some(rlim) = vm.guest_read::<RLimit>(rlim_p) else {
        return Errno::EFAULT.as_neg();
    };
    vm.rlimits[resource as usize] = rlim;
    0
}

/// FS/GS manipulation is served on the vCPU itself, never forwarded.
pub(crate) fn sys_arch_prctl<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [code, addr, ..] = vm.vcpu.syscall_args();
    let Ok(code) = ArchPrctlCode::try_from(code) else {
        return Errno::EINVAL.as_neg();
    };
    match code {
        ArchPrctlCode::ArchSetFs => {
            vm.vcpu.sregs.fs.base = addr;
            0
        }
        ArchPrctlCode::ArchSetGs => {
            vm.vcpu.sregs.gs.base = addr;
            0
        }
        ArchPrctlCode::ArchGetFs => {
            let base = vm.vcpu.sregs.fs.base;
            match vm.guest_write(addr, base) {
                Some(()) => 0,
                None => Errno::EFAULT.as_neg(),
            }
        }
        ArchPrctlCode::ArchGetGs => {
            let base = vm.vcpu.sregs.gs.base;
            match vm.guest_write(addr, base) {
                Some(()) => 0,
                None => Errno::EFAULT.as_neg(),
            }
        }
    }
}

pub(crate) fn sys_rt_sigaction<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [signum, act_p, oldact_p, sigsetsize, ..] = vm.vcpu.syscall_args();
    if sigsetsize != core::mem::size_of::<SigSet>() as u64 {
        return Errno::EINVAL.as_neg();
    }
    let Ok(signal) = Signal::try_from(signum as i32) else {
        return Errno::EINVAL.as_neg();
    };
    let act = if act_p != 0 {
        match vm.guest_read::<SigAction>(act_p) {
            Some(a) => Some(a),
            None => return Errno::EFAULT.as_neg(),
        }
    } else {
        None
    };
    match vm.signals.register_action(signal, act) {
        Ok(old) => {
            if oldact_p != 0 && vm.guest_write(oldact_p, old).is_none() {
                return Errno::EFAULT.as_neg();
            }
            0
        }
        Err(e) => e.as_neg(),
    }
}

pub(crate) fn sys_rt_sigprocmask<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [how, set_p, oldset_p, sigsetsize, ..] = vm.vcpu.syscall_args();
    if sigsetsize != core::mem::size_of::<SigSet>() as u64 {
        return Errno::EINVAL.as_neg();
    }
    let old = vm.signals.blocked();
    if oldset_p != 0 && vm.guest_write(oldset_p, old).is_none() {
        return Errno::EFAULT.as_neg();
    }
    if set_p != 0 {
        let Some(set) = vm.guest_read::<SigSet>(set_p) else {
            return Errno::EFAULT.as_neg();
        };
        if vm.signals.set_blocked(how as i32, set).is_err() {
            return Errno::EINVAL.as_neg();
        }
    }
    0
}

pub(crate) fn sys_exit_group<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let [status, ..] = vm.vcpu.syscall_args();
    if let Some(handler) = vm.handlers.exit_group {
        handler(status as i32);
    }
    // The run loop terminates after this call; the result value is never
    // observed by the guest.
    0
}

pub(crate) fn sys_tgkill<H: HypervisorProvider>(vm: &mut Vm<H>) -> i64 {
    let handler = require_handler!(vm, tgkill);
    let [tgid, tid, sig, ..] = vm.vcpu.syscall_args();
    handler(tgid as i32, tid as i32, sig as i32)
}
