// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Syscall dispatch.
//!
//! The monitor reads the syscall number from `RAX` and its arguments
//! from `RDI, RSI, RDX, R10, R8, R9`, translates guest pointers to host
//! pointers through the pager, and forwards to the embedder's
//! [`SyscallHandlers`] vtable. A missing handler, or a number outside
//! the table, surfaces as `-ENOSYS` in `RAX` — never as a monitor
//! error.

pub(crate) mod file;
pub(crate) mod mm;
pub(crate) mod process;

#[cfg(test)]
mod tests;

use std::ffi::CStr;

use kvmbox::platform::HypervisorProvider;
use kvmbox_common_linux::nr;

use crate::run::SyscallFn;
use crate::Vm;

/// An `mmap` request passed to the host handler. The handler performs
/// the host-side mapping (bringing in file content if `fd` is valid) and
/// fills `host_p` with the page-aligned buffer backing the mapping.
#[derive(Debug)]
pub struct MapRequest {
    pub addr: u64,
    pub length: usize,
    pub prot: i32,
    pub flags: i32,
    pub fd: i32,
    pub offset: i64,
    /// Out: host backing for the mapping.
    pub host_p: *mut u8,
}

/// Host-side syscall handlers, one nullable entry per call the monitor
/// forwards. Pointer arguments arrive already translated to host
/// representations.
#[derive(Clone, Copy, Default)]
pub struct SyscallHandlers {
    pub read: Option<fn(i32, &mut [u8]) -> i64>,
    pub write: Option<fn(i32, &[u8]) -> i64>,
    pub open: Option<fn(&CStr, i32, u32) -> i64>,
    pub close: Option<fn(i32) -> i64>,
    pub stat: Option<fn(&CStr, &mut libc::stat) -> i64>,
    pub fstat: Option<fn(i32, &mut libc::stat) -> i64>,
    pub lstat: Option<fn(&CStr, &mut libc::stat) -> i64>,
    pub lseek: Option<fn(i32, i64, i32) -> i64>,
    pub mmap: Option<fn(&mut MapRequest) -> i64>,
    pub munmap: Option<fn(*mut u8, usize) -> i64>,
    pub readv: Option<fn(i32, &mut [libc::iovec]) -> i64>,
    pub writev: Option<fn(i32, &[libc::iovec]) -> i64>,
    pub access: Option<fn(&CStr, i32) -> i64>,
    pub pipe: Option<fn(&mut [i32; 2]) -> i64>,
    pub dup: Option<fn(i32) -> i64>,
    pub nanosleep: Option<fn(&libc::timespec, Option<&mut libc::timespec>) -> i64>,
    pub getpid: Option<fn() -> i64>,
    pub uname: Option<fn(&mut libc::utsname) -> i64>,
    pub fcntl: Option<fn(i32, i32, u64) -> i64>,
    pub truncate: Option<fn(&CStr, i64) -> i64>,
    pub ftruncate: Option<fn(i32, i64) -> i64>,
    pub getcwd: Option<fn(&mut [u8]) -> i64>,
    pub mkdir: Option<fn(&CStr, u32) -> i64>,
    pub unlink: Option<fn(&CStr) -> i64>,
    pub readlink: Option<fn(&CStr, &mut [u8]) -> i64>,
    pub gettimeofday: Option<fn(&mut libc::timeval) -> i64>,
    pub getrusage: Option<fn(i32, &mut libc::rusage) -> i64>,
    pub times: Option<fn(&mut libc::tms) -> i64>,
    pub getuid: Option<fn() -> i64>,
    pub getgid: Option<fn() -> i64>,
    pub geteuid: Option<fn() -> i64>,
    pub getegid: Option<fn() -> i64>,
    pub gettid: Option<fn() -> i64>,
    pub time: Option<fn(Option<&mut i64>) -> i64>,
    pub clock_gettime: Option<fn(i32, &mut libc::timespec) -> i64>,
    pub exit_group: Option<fn(i32)>,
    pub tgkill: Option<fn(i32, i32, i32) -> i64>,
}

/// The fixed-size dispatch table: one nullable function per syscall
/// number. Empty entries answer `-ENOSYS`.
pub(crate) fn build_table<H: HypervisorProvider>(
) -> [Option<SyscallFn<H>>; nr::SYSCALL_TABLE_SIZE] {
    let mut t: [Option<SyscallFn<H>>; nr::SYSCALL_TABLE_SIZE] = [None; nr::SYSCALL_TABLE_SIZE];
    t[nr::READ] = Some(file::sys_read::<H>);
    t[nr::WRITE] = Some(file::sys_write::<H>);
    t[nr::OPEN] = Some(file::sys_open::<H>);
    t[nr::CLOSE] = Some(file::sys_close::<H>);
    t[nr::STAT] = Some(file::sys_stat::<H>);
    t[nr::FSTAT] = Some(file::sys_fstat::<H>);
    t[nr::LSTAT] = Some(file::sys_lstat::<H>);
    t[nr::LSEEK] = Some(file::sys_lseek::<H>);
    t[nr::MMAP] = Some(mm::sys_mmap::<H>);
    t[nr::MPROTECT] = Some(mm::sys_mprotect::<H>);
    t[nr::MUNMAP] = Some(mm::sys_munmap::<H>);
    t[nr::BRK] = Some(mm::sys_brk::<H>);
    t[nr::RT_SIGACTION] = Some(process::sys_rt_sigaction::<H>);
    t[nr::RT_SIGPROCMASK] = Some(process::sys_rt_sigprocmask::<H>);
    t[nr::READV] = Some(file::sys_readv::<H>);
    t[nr::WRITEV] = Some(file::sys_writev::<H>);
    t[nr::ACCESS] = Some(file::sys_access::<H>);
    t[nr::PIPE] = Some(file::sys_pipe::<H>);
    t[nr::MREMAP] = Some(mm::sys_mremap::<H>);
    t[nr::DUP] = Some(file::sys_dup::<H>);
    t[nr::NANOSLEEP] = Some(process::sys_nanosleep::<H>);
    t[nr::GETPID] = Some(process::sys_getpid::<H>);
    t[nr::UNAME] = Some(process::sys_uname::<H>);
    t[nr::FCNTL] = Some(file::sys_fcntl::<H>);
    t[nr::TRUNCATE] = Some(file::sys_truncate::<H>);
    t[nr::FTRUNCATE] = Some(file::sys_ftruncate::<H>);
    t[nr::GETCWD] = Some(file::sys_getcwd::<H>);
    t[nr::MKDIR] = Some(file::sys_mkdir::<H>);
    t[nr::UNLINK] = Some(file::sys_unlink::<H>);
    t[nr::READLINK] = Some(file::sys_readlink::<H>);
    t[nr::GETTIMEOFDAY] = Some(process::sys_gettimeofday::<H>);
    t[nr::GETRLIMIT] = Some(process::sys_getrlimit::<H>);
    t[nr::GETRUSAGE] = Some(process::sys_getrusage::<H>);
    t[nr::TIMES] = Some(process::sys_times::<H>);
    t[nr::GETUID] = Some(process::sys_getuid::<H>);
    t[nr::GETGID] = Some(process::sys_getgid::<H>);
    t[nr::GETEUID] = Some(process::sys_geteuid::<H>);
    t[nr::GETEGID] = Some(process::sys_getegid::<H>);
    t[nr::ARCH_PRCTL] = Some(process::sys_arch_prctl::<H>);
    t[nr::SETRLIMIT] = Some(process::sys_setrlimit::<H>);
    t[nr::GETTID] = Some(process::sys_gettid::<H>);
    t[nr::TIME] = Some(process::sys_time::<H>);
    t[nr::CLOCK_GETTIME] = Some(process::sys_clock_gettime::<H>);
    t[nr::EXIT_GROUP] = Some(process::sys_exit_group::<H>);
    t[nr::TGKILL] = Some(process::sys_tgkill::<H>);
    t
}

impl<H: HypervisorProvider> Vm<H> {
    /// Translate a guest pointer, or `None` if unmapped.
    pub(crate) fn guest_ptr(&self, addr: u64) -> Option<*mut u8> {
        self.rm.pager().get_host_p(addr)
    }

    /// View `len` guest bytes at `addr` as a host slice. Relies on the
    /// fact that a mapping's backing is host-contiguous.
    pub(crate) fn guest_slice_mut(&self, addr: u64, len: usize) -> Option<&mut [u8]> {
        let host = self.guest_ptr(addr)?;
        Some(unsafe { std::slice::from_raw_parts_mut(host, len) })
    }

    /// Read a nul-terminated guest string.
    pub(crate) fn guest_cstr(&self, addr: u64) -> Option<&CStr> {
        let host = self.guest_ptr(addr)?;
        Some(unsafe { CStr::from_ptr(host.cast()) })
    }

    /// Copy a value out of guest memory.
    pub(crate) fn guest_read<T: Copy>(&self, addr: u64) -> Option<T> {
        let host = self.guest_ptr(addr)?;
        Some(unsafe { core::ptr::read_unaligned(host.cast::<T>()) })
    }

    /// Copy a value into guest memory.
    pub(crate) fn guest_write<T: Copy>(&self, addr: u64, value: T) -> Option<()> {
        let host = self.guest_ptr(addr)?;
        unsafe { core::ptr::write_unaligned(host.cast::<T>(), value) };
        Some(())
    }
}
