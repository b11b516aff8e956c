// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! x86-64 Linux syscall numbers.
//!
//! Only the numbers the monitor dispatches on are named; anything else is
//! answered with `-ENOSYS` by the dispatcher.

pub const READ: usize = 0;
pub const WRITE: usize = 1;
pub const OPEN: usize = 2;
pub const CLOSE: usize = 3;
pub const STAT: usize = 4;
pub const FSTAT: usize = 5;
pub const LSTAT: usize = 6;
pub const POLL: usize = 7;
pub const LSEEK: usize = 8;
pub const MMAP: usize = 9;
pub const MPROTECT: usize = 10;
pub const MUNMAP: usize = 11;
pub const BRK: usize = 12;
pub const RT_SIGACTION: usize = 13;
pub const RT_SIGPROCMASK: usize = 14;
pub const RT_SIGRETURN: usize = 15;
pub const IOCTL: usize = 16;
pub const READV: usize = 19;
pub const WRITEV: usize = 20;
pub const ACCESS: usize = 21;
pub const PIPE: usize = 22;
pub const MREMAP: usize = 25;
pub const DUP: usize = 32;
pub const NANOSLEEP: usize = 35;
pub const GETPID: usize = 39;
pub const UNAME: usize = 63;
pub const FCNTL: usize = 72;
pub const TRUNCATE: usize = 76;
pub const FTRUNCATE: usize = 77;
pub const GETCWD: usize = 79;
pub const MKDIR: usize = 83;
pub const UNLINK: usize = 87;
pub const READLINK: usize = 89;
pub const GETTIMEOFDAY: usize = 96;
pub const GETRLIMIT: usize = 97;
pub const GETRUSAGE: usize = 98;
pub const TIMES: usize = 100;
pub const GETUID: usize = 102;
pub const GETGID: usize = 104;
pub const GETEUID: usize = 107;
pub const GETEGID: usize = 108;
pub const ARCH_PRCTL: usize = 158;
pub const SETRLIMIT: usize = 160;
pub const GETTID: usize = 186;
pub const TIME: usize = 201;
pub const FUTEX: usize = 202;
pub const CLOCK_GETTIME: usize = 228;
pub const EXIT_GROUP: usize = 231;
pub const TGKILL: usize = 234;

/// One past the highest syscall number the dispatch table covers.
pub const SYSCALL_TABLE_SIZE: usize = 256;

/// Name of a syscall number, for tracing.
pub fn syscall_name(nr: usize) -> &'static str {
    match nr {
        READ => "read",
        WRITE => "write",
        OPEN => "open",
        CLOSE => "close",
        STAT => "stat",
        FSTAT => "fstat",
        LSTAT => "lstat",
        POLL => "poll",
        LSEEK => "lseek",
        MMAP => "mmap",
        MPROTECT => "mprotect",
        MUNMAP => "munmap",
        BRK => "brk",
        RT_SIGACTION => "rt_sigaction",
        RT_SIGPROCMASK => "rt_sigprocmask",
        RT_SIGRETURN => "rt_sigreturn",
        IOCTL => "ioctl",
        READV => "readv",
        WRITEV => "writev",
        ACCESS => "access",
        PIPE => "pipe",
        MREMAP => "mremap",
        DUP => "dup",
        NANOSLEEP => "nanosleep",
        GETPID => "getpid",
        UNAME => "uname",
        FCNTL => "fcntl",
        TRUNCATE => "truncate",
        FTRUNCATE => "ftruncate",
        GETCWD => "getcwd",
        MKDIR => "mkdir",
        UNLINK => "unlink",
        READLINK => "readlink",
        GETTIMEOFDAY => "gettimeofday",
        GETRLIMIT => "getrlimit",
        GETRUSAGE => "getrusage",
        TIMES => "times",
        GETUID => "getuid",
        GETGID => "getgid",
        GETEUID => "geteuid",
        GETEGID => "getegid",
        ARCH_PRCTL => "arch_prctl",
        SETRLIMIT => "setrlimit",
        GETTID => "gettid",
        TIME => "time",
        FUTEX => "futex",
        CLOCK_GETTIME => "clock_gettime",
        EXIT_GROUP => "exit_group",
        TGKILL => "tgkill",
        _ => "?",
    }
}
