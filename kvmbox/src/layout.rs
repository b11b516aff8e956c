// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Guest address-space layout constants.
//!
//! Guest-physical space is carved into chunks: the system chunk sits at
//! physical zero and holds the page tables plus every monitor-allocated
//! region (text, data, stacks, descriptor tables, trampolines); chunks
//! created later for the guest's own `mmap` traffic start at
//! [`USER_CHUNK_OFFSET`].
//!
//! Guest-virtual space follows the canonical x86-64 split: user mappings
//! in the lower half, monitor-owned ("kernel") mappings in the upper half.

/// Size of a guest page. Only 4 KiB pages are used.
pub const PAGE_SIZE: usize = 0x1000;

/// Size of the system chunk allocated at guest-physical zero.
pub const SYSTEM_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Prefix of the system chunk reserved for page-table frames. The PML4
/// occupies the first frame, so CR3 is always zero.
pub const PAGE_TABLE_RESERVE: usize = 0x10_0000;

/// Guest-physical base of the first user (mmap) chunk.
pub const USER_CHUNK_OFFSET: u64 = 1024 * 1024 * 1024;

/// Top of the initial user stack. The env region sits immediately below
/// this address, the stack below the env region.
pub const STACK_BASE: u64 = 0x7fff_ffff_f000;

/// Fixed base at which a dynamic loader (`PT_INTERP`) is placed.
pub const LD_LINUX_SO_BASE: u64 = 0x100_0000;

/// Base of the monitor-owned upper-half mappings (descriptor tables,
/// trampolines, kernel stack).
pub const KERNEL_SPACE_BASE: u64 = 0xffff_8000_0000_0000;

/// Guest-virtual base the monitor hands out for `mmap` regions when the
/// guest lets it choose.
pub const MMAP_AREA_BASE: u64 = 0x2000_0000_0000;

/// Pages in the env region that backs argv/envp string bodies.
pub const ENV_REGION_PAGES: usize = 16;

/// Pages in the initial user stack region.
pub const STACK_REGION_PAGES: usize = 4;

/// How far below the lowest mapped stack page a fault still counts as
/// stack growth.
pub const STACK_GROW_LIMIT: u64 = 64 * PAGE_SIZE as u64;
