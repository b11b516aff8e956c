// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Flat blobs: precompiled position-independent code fragments loaded
//! verbatim at a chosen guest address. The monitor uses three of them —
//! the ISR stub table, the syscall entry trampoline pointed at by
//! `MSR_LSTAR`, and the signal-cleanup trampoline. Their contents are
//! opaque here.

use std::path::Path;

use thiserror::Error;

use crate::mm::pager::{PageOpts, PagerError};
use crate::mm::region::{RegionError, RegionHandle, RegionManager};
use crate::mm::{pages_from_size, GuestPtr, Purpose};
use crate::platform::VmProvider;

/// Guest address a non-kernel flat is placed at (the signal-cleanup
/// trampoline must be executable at CPL 3).
const USER_FLAT_BASE: GuestPtr = 0x1000;

#[derive(Error, Debug)]
pub enum FlatError {
    #[error("could not read flat binary: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Pager(#[from] PagerError),
}

/// A loaded flat blob.
pub struct Flat {
    pub region: RegionHandle,
    pub guest_addr: GuestPtr,
    pub size: usize,
}

/// Read `path` into a fresh region and map it executable; kernel flats
/// go into the upper half at a pager-chosen address, user flats at
/// [`USER_FLAT_BASE`].
pub fn load_flat<V: VmProvider>(
    rm: &mut RegionManager<V>,
    path: &Path,
    purpose: Purpose,
    kernel: bool,
) -> Result<Flat, FlatError> {
    let bytes = std::fs::read(path)?;
    let region = rm.allocate_region(bytes.len(), purpose)?;
    let host = rm.host_base(region);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), host, bytes.len());
    }

    let pages = pages_from_size(bytes.len());
    let guest_addr = if kernel {
        rm.pager_mut()
            .map_kernel_region(host, pages, PageOpts::EXEC)?
    } else {
        rm.pager_mut()
            .map_region(host, USER_FLAT_BASE, pages, PageOpts::EXEC)?;
        USER_FLAT_BASE
    };
    rm.set_guest_addr(region, guest_addr);

    log::debug!(
        "flat {:?} at {:#x} ({} bytes)",
        path.file_name().unwrap_or_default(),
        guest_addr,
        bytes.len()
    );
    Ok(Flat {
        region,
        guest_addr,
        size: bytes.len(),
    })
}
