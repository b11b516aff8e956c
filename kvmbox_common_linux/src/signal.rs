// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Linux signal handling definitions.

use crate::errno::Errno;

/// A Linux signal number guaranteed to be in the range 1..=64.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Signal(i32);

impl Signal {
    pub const SIGHUP: Self = Self(1);
    pub const SIGINT: Self = Self(2);
    pub const SIGQUIT: Self = Self(3);
    pub const SIGILL: Self = Self(4);
    pub const SIGTRAP: Self = Self(5);
    pub const SIGABRT: Self = Self(6);
    pub const SIGBUS: Self = Self(7);
    pub const SIGFPE: Self = Self(8);
    pub const SIGKILL: Self = Self(9);
    pub const SIGUSR1: Self = Self(10);
    pub const SIGSEGV: Self = Self(11);
    pub const SIGUSR2: Self = Self(12);
    pub const SIGPIPE: Self = Self(13);
    pub const SIGALRM: Self = Self(14);
    pub const SIGTERM: Self = Self(15);
    pub const SIGCHLD: Self = Self(17);
    pub const SIGCONT: Self = Self(18);
    pub const SIGSTOP: Self = Self(19);

    /// Get the signal number as an `i32`, the natural representation.
    pub const fn as_i32(&self) -> i32 {
        self.0
    }

    /// Index into a 64-entry disposition table.
    pub const fn index(&self) -> usize {
        (self.0 - 1) as usize
    }
}

impl TryFrom<i32> for Signal {
    type Error = Errno;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if (1..=64).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Errno::EINVAL)
        }
    }
}

/// A guest signal mask.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct SigSet(pub u64);

/// A guest `struct sigaction` as `rt_sigaction` passes it.
///
/// `sa_handler` and `sa_restorer` are guest virtual addresses; the monitor
/// never dereferences them, it only pushes them into synthesized signal
/// frames.
#[derive(Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct SigAction {
    pub sa_handler: u64,
    pub sa_flags: u64,
    pub sa_restorer: u64,
    pub sa_mask: SigSet,
}

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;
