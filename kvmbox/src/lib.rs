// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Core of a user-level monitor that executes an unmodified Linux x86-64
//! ELF binary inside a hardware-assisted virtual machine, without a guest
//! operating system.
//!
//! The monitor itself provides the minimal illusion of a kernel: a
//! long-mode address space ([`mm`]), descriptor tables ([`arch`]), a
//! syscall entry trampoline and interrupt stubs loaded as opaque flat
//! blobs ([`flat`]), vCPU register and guest-stack primitives ([`vcpu`]),
//! and host signal plumbing ([`signal`]). The Linux program semantics
//! (ELF loading, syscall dispatch, the run loop) live in the
//! `kvmbox_shim_linux` crate on top of this one.
//!
//! The hypervisor itself is abstracted behind the [`platform`] traits so
//! that everything here runs against either `/dev/kvm` or the in-process
//! mock used by the test suite.

pub mod arch;
pub mod flat;
pub mod layout;
pub mod mm;
pub mod platform;
pub mod signal;
pub mod vcpu;
