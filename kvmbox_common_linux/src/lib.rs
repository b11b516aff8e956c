// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Common Linux-y items shared by the kvmbox monitor crates.
//!
//! Everything in here describes the guest-facing Linux ABI: protection and
//! mapping flags as the guest passes them in syscall arguments, error
//! numbers as the guest expects them back in `RAX`, syscall numbers, and
//! signal numbers. Nothing in this crate touches the host or the
//! hypervisor.

#![no_std]

pub mod errno;
pub mod nr;
pub mod signal;

use num_enum::TryFromPrimitive;

bitflags::bitflags! {
    /// Desired memory protection of a memory mapping.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ProtFlags: u32 {
        /// Pages cannot be accessed.
        const PROT_NONE = 0;
        /// Pages can be read.
        const PROT_READ = 1 << 0;
        /// Pages can be written.
        const PROT_WRITE = 1 << 1;
        /// Pages can be executed.
        const PROT_EXEC = 1 << 2;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

bitflags::bitflags! {
    /// Additional parameters for `mmap`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MapFlags: u32 {
        /// Share this mapping. Mutually exclusive with `MAP_PRIVATE`.
        const MAP_SHARED = 0x1;
        /// Changes are private.
        const MAP_PRIVATE = 0x2;
        /// Interpret addr exactly.
        const MAP_FIXED = 0x10;
        /// The mapping is not backed by any file.
        const MAP_ANONYMOUS = 0x20;
        /// Used for stacks; the mapping should extend downward in memory.
        const MAP_GROWSDOWN = 0x100;
        /// Do not reserve swap space for this mapping.
        const MAP_NORESERVE = 0x4000;
        /// Populate page tables for the mapping.
        const MAP_POPULATE = 0x8000;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

bitflags::bitflags! {
    /// Flags for `mremap`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MRemapFlags: u32 {
        /// The mapping may be moved if it cannot be grown in place.
        const MREMAP_MAYMOVE = 0x1;
        /// The new mapping must be placed at a caller-chosen address.
        const MREMAP_FIXED = 0x2;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

/// Operation codes for the `arch_prctl` syscall.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u64)]
pub enum ArchPrctlCode {
    ArchSetGs = 0x1001,
    ArchSetFs = 0x1002,
    ArchGetFs = 0x1003,
    ArchGetGs = 0x1004,
}

/// A guest-side resource limit, laid out like the kernel's `struct rlimit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RLimit {
    pub rlim_cur: u64,
    pub rlim_max: u64,
}

/// `RLIM_INFINITY`
pub const RLIM_INFINITY: u64 = !0;

/// Number of `rlimit` slots a process carries.
pub const RLIMIT_NLIMITS: usize = 16;

pub const RLIMIT_STACK: usize = 3;

impl RLimit {
    pub const INFINITE: Self = Self {
        rlim_cur: RLIM_INFINITY,
        rlim_max: RLIM_INFINITY,
    };
}
