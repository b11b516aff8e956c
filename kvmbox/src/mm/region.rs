// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Region allocation.
//!
//! A region is a subrange of a chunk owned for one purpose: a loaded
//! segment, a stack, a descriptor table, an `mmap` backing. The manager
//! keeps an arena of region records addressed by stable [`RegionHandle`]s
//! and, per chunk, an ordered map from host offset to record. Mappings
//! and loaded segments hold handles, never pointers, so slicing a region
//! can never invalidate anybody's reference.
//!
//! Free regions coalesce with host-adjacent free neighbors on release.
//! When no free region fits a request, a new chunk is fetched from the
//! pager and seeded with one free region spanning it.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::layout::{PAGE_SIZE, PAGE_TABLE_RESERVE};
use crate::mm::pager::{Pager, PagerError};
use crate::mm::{pagesize_align, GuestPtr, Purpose};
use crate::platform::VmProvider;

/// Smallest chunk the manager asks the pager for when it runs out.
const CHUNK_GROW_MIN: usize = 0x40_0000;

/// Stable index of a region record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionHandle(usize);

#[derive(Debug)]
struct RegionRecord {
    chunk: usize,
    host_off: usize,
    size: usize,
    used: bool,
    guest_addr: Option<GuestPtr>,
    tag: Option<Purpose>,
}

/// Errors from region allocation.
#[derive(Error, Debug)]
pub enum RegionError {
    #[error(transparent)]
    Pager(#[from] PagerError),
    #[error("slice range is outside the region")]
    InvalidSlice,
    #[error("region is not in the expected state")]
    BadState,
}

/// Owner of every guest-visible memory region.
pub struct RegionManager<V: VmProvider> {
    pager: Pager<V>,
    slots: Vec<Option<RegionRecord>>,
    free_slots: Vec<usize>,
    /// Per chunk, host offset of each region in it.
    by_chunk: Vec<BTreeMap<usize, usize>>,
}

impl<V: VmProvider> RegionManager<V> {
    /// Take ownership of the pager and seed the free list with the system
    /// chunk, minus its page-table prefix.
    pub fn new(pager: Pager<V>) -> Self {
        let mut rm = Self {
            pager,
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_chunk: vec![BTreeMap::new()],
        };
        rm.insert_record(RegionRecord {
            chunk: 0,
            host_off: PAGE_TABLE_RESERVE,
            size: rm.pager.system_chunk().size() - PAGE_TABLE_RESERVE,
            used: false,
            guest_addr: None,
            tag: None,
        });
        rm
    }

    pub fn pager(&self) -> &Pager<V> {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut Pager<V> {
        &mut self.pager
    }

    fn insert_record(&mut self, rec: RegionRecord) -> RegionHandle {
        let chunk = rec.chunk;
        let off = rec.host_off;
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(rec);
                id
            }
            None => {
                self.slots.push(Some(rec));
                self.slots.len() - 1
            }
        };
        while self.by_chunk.len() <= chunk {
            self.by_chunk.push(BTreeMap::new());
        }
        self.by_chunk[chunk].insert(off, id);
        RegionHandle(id)
    }

    fn remove_record(&mut self, id: usize) {
        let rec = self.slots[id].take().expect("removing a dead region");
        self.by_chunk[rec.chunk].remove(&rec.host_off);
        self.free_slots.push(id);
    }

    fn rec(&self, h: RegionHandle) -> &RegionRecord {
        self.slots[h.0].as_ref().expect("dead region handle")
    }

    fn rec_mut(&mut self, h: RegionHandle) -> &mut RegionRecord {
        self.slots[h.0].as_mut().expect("dead region handle")
    }

    /// Host pointer to the first byte of a region.
    pub fn host_base(&self, h: RegionHandle) -> *mut u8 {
        let rec = self.rec(h);
        unsafe { self.pager.chunk(rec.chunk).host_base().add(rec.host_off) }
    }

    pub fn size(&self, h: RegionHandle) -> usize {
        self.rec(h).size
    }

    pub fn is_free(&self, h: RegionHandle) -> bool {
        !self.rec(h).used
    }

    pub fn guest_addr(&self, h: RegionHandle) -> Option<GuestPtr> {
        self.rec(h).guest_addr
    }

    pub fn set_guest_addr(&mut self, h: RegionHandle, addr: GuestPtr) {
        self.rec_mut(h).guest_addr = Some(addr);
    }

    pub fn tag(&self, h: RegionHandle) -> Option<Purpose> {
        self.rec(h).tag
    }

    /// Allocate a used region of at least `size` bytes (rounded up to
    /// pages). First fit; a leftover tail of a page or more goes back to
    /// the free list.
    pub fn allocate_region(
        &mut self,
        size: usize,
        tag: Purpose,
    ) -> Result<RegionHandle, RegionError> {
        let size = pagesize_align(size.max(1));
        let found = self.find_free(size);
        let id = match found {
            Some(id) => id,
            None => {
                let chunk = self.pager.create_chunk(size.max(CHUNK_GROW_MIN))?;
                let chunk_size = self.pager.chunk(chunk).size();
                let h = self.insert_record(RegionRecord {
                    chunk,
                    host_off: 0,
                    size: chunk_size,
                    used: false,
                    guest_addr: None,
                    tag: None,
                });
                h.0
            }
        };

        let leftover = self.slots[id].as_ref().unwrap().size - size;
        if leftover >= PAGE_SIZE {
            let (chunk, off) = {
                let rec = self.slots[id].as_mut().unwrap();
                rec.size = size;
                (rec.chunk, rec.host_off)
            };
            self.insert_record(RegionRecord {
                chunk,
                host_off: off + size,
                size: leftover,
                used: false,
                guest_addr: None,
                tag: None,
            });
        }
        let rec = self.slots[id].as_mut().unwrap();
        rec.used = true;
        rec.tag = Some(tag);
        rec.guest_addr = None;
        Ok(RegionHandle(id))
    }

    fn find_free(&self, size: usize) -> Option<usize> {
        for per_chunk in &self.by_chunk {
            for (_, &id) in per_chunk {
                let rec = self.slots[id].as_ref().unwrap();
                if !rec.used && rec.size >= size {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Return a used region to the free list, merging it with
    /// host-adjacent free neighbors.
    pub fn free_region(&mut self, h: RegionHandle) {
        let (chunk, mut off, mut size) = {
            let rec = self.rec_mut(h);
            rec.used = false;
            rec.guest_addr = None;
            rec.tag = None;
            (rec.chunk, rec.host_off, rec.size)
        };

        // Merge the successor first so `off` stays valid.
        if let Some((&succ_off, &succ_id)) = self.by_chunk[chunk].range(off + size..).next() {
            let succ = self.slots[succ_id].as_ref().unwrap();
            if !succ.used && succ_off == off + size {
                size += succ.size;
                self.remove_record(succ_id);
            }
        }
        if let Some((&pred_off, &pred_id)) = self.by_chunk[chunk].range(..off).next_back() {
            let pred = self.slots[pred_id].as_ref().unwrap();
            if !pred.used && pred_off + pred.size == off {
                off = pred_off;
                size += pred.size;
                self.remove_record(pred_id);
            }
        }

        let rec = self.rec_mut(h);
        let old_off = rec.host_off;
        rec.host_off = off;
        rec.size = size;
        if old_off != off {
            self.by_chunk[chunk].remove(&old_off);
            self.by_chunk[chunk].insert(off, h.0);
        }
    }

    /// Split a used region at byte offset `at`; both halves stay used and
    /// keep the original tag. Returns the new tail.
    pub fn split_region(
        &mut self,
        h: RegionHandle,
        at: usize,
    ) -> Result<RegionHandle, RegionError> {
        let (chunk, off, size, used, tag) = {
            let rec = self.rec(h);
            (rec.chunk, rec.host_off, rec.size, rec.used, rec.tag)
        };
        if !used {
            return Err(RegionError::BadState);
        }
        if at == 0 || at >= size || at % PAGE_SIZE != 0 {
            return Err(RegionError::InvalidSlice);
        }
        self.rec_mut(h).size = at;
        Ok(self.insert_record(RegionRecord {
            chunk,
            host_off: off + at,
            size: size - at,
            used: true,
            guest_addr: None,
            tag,
        }))
    }

    /// Slice a used region into up to three used pieces: the head keeps
    /// the handle and covers `[0, off)`, the middle covers `[off,
    /// off+len)`, and the tail (if any bytes remain) covers the rest.
    /// Returns `(middle, tail)`.
    pub fn slice_center(
        &mut self,
        h: RegionHandle,
        off: usize,
        len: usize,
    ) -> Result<(RegionHandle, Option<RegionHandle>), RegionError> {
        let size = self.rec(h).size;
        if off + len > size {
            return Err(RegionError::InvalidSlice);
        }
        let mid = if off > 0 { self.split_region(h, off)? } else { h };
        let tail = if len < self.rec(mid).size {
            Some(self.split_region(mid, len)?)
        } else {
            None
        };
        Ok((mid, tail))
    }

    /// Locate the region containing a host pointer.
    pub fn find_region(&self, host_p: *const u8) -> Option<RegionHandle> {
        let chunk = self.pager.chunk_index_for_host(host_p)?;
        let off = host_p as usize - self.pager.chunk(chunk).host_base() as usize;
        let (&rec_off, &id) = self.by_chunk.get(chunk)?.range(..=off).next_back()?;
        let rec = self.slots[id].as_ref().unwrap();
        (off < rec_off + rec.size).then_some(RegionHandle(id))
    }

    /// Wrap host memory produced by the mmap handler in a chunk of its
    /// own, covered by a single used region.
    ///
    /// # Safety
    ///
    /// `host_p` must point at `size` bytes that stay valid for the life
    /// of the VM.
    pub unsafe fn adopt_foreign_region(
        &mut self,
        host_p: *mut u8,
        size: usize,
        tag: Purpose,
    ) -> Result<RegionHandle, RegionError> {
        let size = pagesize_align(size);
        let chunk = unsafe { self.pager.register_chunk(host_p, size, None) }?;
        let h = self.insert_record(RegionRecord {
            chunk,
            host_off: 0,
            size,
            used: true,
            guest_addr: None,
            tag: Some(tag),
        });
        Ok(h)
    }

    /// Log every region, used and free.
    pub fn dump_regions(&self) {
        log::debug!("regions:");
        for per_chunk in &self.by_chunk {
            for (_, &id) in per_chunk {
                let rec = self.slots[id].as_ref().unwrap();
                log::debug!(
                    "  chunk {} off {:#09x} size {:#09x} {} {:?} guest {:?}",
                    rec.chunk,
                    rec.host_off,
                    rec.size,
                    if rec.used { "used" } else { "free" },
                    rec.tag,
                    rec.guest_addr,
                );
            }
        }
    }

    /// Host ranges of all used regions, for invariant checks.
    pub fn used_host_ranges(&self) -> Vec<(usize, usize)> {
        self.slots
            .iter()
            .flatten()
            .filter(|r| r.used)
            .map(|r| {
                let base = self.pager.chunk(r.chunk).host_base() as usize + r.host_off;
                (base, base + r.size)
            })
            .collect()
    }
}
