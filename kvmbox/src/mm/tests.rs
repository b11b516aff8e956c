// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use kvmbox_common_linux::{MRemapFlags, MapFlags, ProtFlags};

use crate::layout::{PAGE_SIZE, STACK_BASE, STACK_GROW_LIMIT};
use crate::mm::heap::HeapManager;
use crate::mm::pager::{PageOpts, Pager};
use crate::mm::region::RegionManager;
use crate::mm::{page_begin, Purpose};
use crate::platform::mock::{MockHypervisor, MockVm};
use crate::platform::{HypervisorProvider, VmMode};

fn new_rm() -> RegionManager<MockVm> {
    let _ = env_logger::builder().is_test(true).try_init();
    let hv = MockHypervisor::new();
    let vm = hv.create_vm().unwrap();
    let pager = Pager::initialize(vm, VmMode::LongMode).unwrap();
    RegionManager::new(pager)
}

unsafe fn write_guest(rm: &RegionManager<MockVm>, gva: u64, val: u8) {
    let host = rm.pager().get_host_p(gva).expect("address must be mapped");
    unsafe { *host = val };
}

unsafe fn read_guest(rm: &RegionManager<MockVm>, gva: u64) -> u8 {
    let host = rm.pager().get_host_p(gva).expect("address must be mapped");
    unsafe { *host }
}

#[test]
fn pager_rejects_non_long_mode() {
    let hv = MockHypervisor::new();
    let vm = hv.create_vm().unwrap();
    assert!(Pager::initialize(vm, VmMode::X86).is_err());
}

#[test]
fn translation_is_consistent_with_chunks() {
    let mut rm = new_rm();
    let r = rm.allocate_region(2 * PAGE_SIZE, Purpose::Data).unwrap();
    let host = rm.host_base(r);
    let gva = 0x40_0000;
    rm.pager_mut()
        .map_region(host, gva, 2, PageOpts::WRITE)
        .unwrap();

    for page in 0..2u64 {
        let v = gva + page * PAGE_SIZE as u64 + 0x123;
        let p = rm.pager().get_host_p(v).unwrap();
        // The translation lands in exactly one registered chunk.
        assert_eq!(rm.pager().chunk_index_for_host(p), Some(0));
        // And it names the same byte as the underlying allocation.
        unsafe { *p = 0xa5 };
        let direct = unsafe { *host.add((page as usize) * PAGE_SIZE + 0x123) };
        assert_eq!(direct, 0xa5);
    }

    assert!(rm.pager().get_host_p(gva + 2 * PAGE_SIZE as u64).is_none());
}

#[test]
fn kernel_mappings_land_in_the_upper_half() {
    let mut rm = new_rm();
    let r = rm.allocate_region(PAGE_SIZE, Purpose::Isr).unwrap();
    let host = rm.host_base(r);
    let gva = rm.pager_mut().map_kernel_page(host, PageOpts::EXEC).unwrap();
    assert!(gva >= crate::layout::KERNEL_SPACE_BASE);
    assert_eq!(rm.pager().get_host_p(gva), Some(host));
}

#[test]
fn used_regions_are_disjoint() {
    let mut rm = new_rm();
    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(
            rm.allocate_region((i % 3 + 1) * PAGE_SIZE, Purpose::UserMmap)
                .unwrap(),
        );
    }
    rm.free_region(handles[2]);
    rm.free_region(handles[5]);
    let ranges = rm.used_host_ranges();
    for (i, a) in ranges.iter().enumerate() {
        for (j, b) in ranges.iter().enumerate() {
            if i != j {
                assert!(a.1 <= b.0 || b.1 <= a.0, "regions {a:?} and {b:?} overlap");
            }
        }
    }
}

#[test]
fn freed_regions_coalesce() {
    let mut rm = new_rm();
    let a = rm.allocate_region(PAGE_SIZE, Purpose::UserMmap).unwrap();
    let b = rm.allocate_region(PAGE_SIZE, Purpose::UserMmap).unwrap();
    let c = rm.allocate_region(PAGE_SIZE, Purpose::UserMmap).unwrap();
    let base_a = rm.host_base(a) as usize;
    rm.free_region(a);
    rm.free_region(c);
    rm.free_region(b);
    // All three merged back; a fresh three-page allocation reuses the
    // same host range.
    let big = rm.allocate_region(3 * PAGE_SIZE, Purpose::UserMmap).unwrap();
    assert_eq!(rm.host_base(big) as usize, base_a);
}

#[test]
fn slicing_covers_the_region_exactly() {
    let mut rm = new_rm();
    let r = rm.allocate_region(8 * PAGE_SIZE, Purpose::UserMmap).unwrap();
    let base = rm.host_base(r) as usize;

    let (mid, tail) = rm.slice_center(r, 2 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
    let tail = tail.unwrap();
    let (tail_mid, tail_tail) = rm.slice_center(tail, PAGE_SIZE, PAGE_SIZE).unwrap();

    let mut pieces = vec![
        (rm.host_base(r) as usize, rm.size(r)),
        (rm.host_base(mid) as usize, rm.size(mid)),
        (rm.host_base(tail) as usize, rm.size(tail)),
        (rm.host_base(tail_mid) as usize, rm.size(tail_mid)),
    ];
    if let Some(t) = tail_tail {
        pieces.push((rm.host_base(t) as usize, rm.size(t)));
    }
    pieces.sort();
    // Contiguous, non-overlapping, and covering all eight pages.
    let mut cursor = base;
    for (start, size) in &pieces {
        assert_eq!(*start, cursor);
        cursor = start + size;
    }
    assert_eq!(cursor, base + 8 * PAGE_SIZE);

    // A freshly sliced piece is immediately findable by host address.
    assert_eq!(
        rm.find_region((base + 3 * PAGE_SIZE) as *const u8),
        Some(mid)
    );
}

fn heap_fixture() -> (RegionManager<MockVm>, HeapManager, u64) {
    let mut rm = new_rm();
    let data = rm.allocate_region(2 * PAGE_SIZE, Purpose::Data).unwrap();
    let guest = 0x60_0000;
    let host = rm.host_base(data);
    rm.set_guest_addr(data, guest);
    rm.pager_mut()
        .map_region(host, guest, 2, PageOpts::WRITE)
        .unwrap();
    let mut heap = HeapManager::new();
    heap.init(&mut rm, data, PAGE_SIZE + 0x800);
    (rm, heap, guest)
}

#[test]
fn brk_grow_and_shrink() {
    let (mut rm, mut heap, _guest) = heap_fixture();
    let b = heap.curbrk();

    assert_eq!(heap.brk(&mut rm, b + 0x2000).unwrap(), b + 0x2000);
    // Writes to the whole new window succeed.
    for off in (0..0x2000).step_by(PAGE_SIZE) {
        unsafe { write_guest(&rm, b + off, 0x42) };
    }

    assert_eq!(heap.brk(&mut rm, b + 0x800).unwrap(), b + 0x800);
    // The page containing the break survives, the one past it faults.
    assert_eq!(unsafe { read_guest(&rm, b) }, 0x42);
    assert!(rm.pager().get_host_p(b + 0x1000).is_none());
}

#[test]
fn brk_zero_window_retains_content_below() {
    let (mut rm, mut heap, _guest) = heap_fixture();
    let b = heap.curbrk();
    heap.brk(&mut rm, b + 0x4000).unwrap();
    unsafe { write_guest(&rm, b + 0x1000, 0x77) };
    heap.brk(&mut rm, b + 0x2000).unwrap();
    assert_eq!(unsafe { read_guest(&rm, b + 0x1000) }, 0x77);
    assert!(rm.pager().get_host_p(b + 0x3000).is_none());
}

#[test]
fn brk_below_initial_break_fails() {
    let (mut rm, mut heap, guest) = heap_fixture();
    assert!(heap.brk(&mut rm, guest).is_err());
}

#[test]
fn mmap_anonymous_and_munmap_hole() {
    let (mut rm, mut heap, _) = heap_fixture();
    let rw = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let anon = MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE;

    let g = heap
        .mmap(&mut rm, 0, 0x3000, rw, anon, -1, 0, None)
        .unwrap();
    // Fresh anonymous memory reads back zero.
    for off in (0..0x3000).step_by(PAGE_SIZE) {
        assert_eq!(unsafe { read_guest(&rm, g + off) }, 0);
    }
    unsafe { write_guest(&rm, g, 1) };

    let g2 = heap
        .mmap(&mut rm, 0, 0x1000, rw, anon, -1, 0, None)
        .unwrap();
    assert!(g2 >= g + 0x3000 || g2 + 0x1000 <= g, "mappings must be disjoint");

    heap.munmap(&mut rm, g + 0x1000, 0x1000).unwrap();
    assert!(rm.pager().get_host_p(g + 0x1000).is_none());
    assert_eq!(unsafe { read_guest(&rm, g) }, 1);
    assert!(rm.pager().get_host_p(g + 0x2000).is_some());
}

#[test]
fn fixed_mmap_slices_the_middle() {
    let (mut rm, mut heap, _) = heap_fixture();
    let rw = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let rx = ProtFlags::PROT_READ | ProtFlags::PROT_EXEC;
    let anon = MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE;

    let g = heap
        .mmap(&mut rm, 0, 0x3000, rw, anon, -1, 0, None)
        .unwrap();
    let mid = heap
        .mmap(
            &mut rm,
            g + 0x1000,
            0x1000,
            rx,
            anon | MapFlags::MAP_FIXED,
            -1,
            0,
            None,
        )
        .unwrap();
    assert_eq!(mid, g + 0x1000);

    assert!(heap.mapping_at(g + 0x1000).unwrap().prot().contains(ProtFlags::PROT_EXEC));
    assert!(heap.mapping_at(g).unwrap().prot().contains(ProtFlags::PROT_WRITE));
    assert!(heap.mapping_at(g + 0x2000).unwrap().prot().contains(ProtFlags::PROT_WRITE));
}

#[test]
fn fixed_mmap_exact_match_updates_in_place() {
    let (mut rm, mut heap, _) = heap_fixture();
    let rw = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let rx = ProtFlags::PROT_READ | ProtFlags::PROT_EXEC;
    let anon = MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE;

    let g = heap
        .mmap(&mut rm, 0, 0x2000, rw, anon, -1, 0, None)
        .unwrap();
    unsafe { write_guest(&rm, g, 0x11) };
    let g2 = heap
        .mmap(&mut rm, g, 0x2000, rx, anon | MapFlags::MAP_FIXED, -1, 0, None)
        .unwrap();
    assert_eq!(g2, g);
    // Same backing, new permissions.
    assert_eq!(unsafe { read_guest(&rm, g) }, 0x11);
    assert!(heap.mapping_at(g).unwrap().prot().contains(ProtFlags::PROT_EXEC));
}

#[test]
fn mremap_grows_and_moves() {
    let (mut rm, mut heap, _) = heap_fixture();
    let rw = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let anon = MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE;

    let g = heap
        .mmap(&mut rm, 0, 0x2000, rw, anon, -1, 0, None)
        .unwrap();
    unsafe { write_guest(&rm, g + 0x800, 0x5a) };

    // Shrink in place.
    let shrunk = heap
        .mremap(&mut rm, g, 0x1000, MRemapFlags::MREMAP_MAYMOVE)
        .unwrap();
    assert_eq!(shrunk, g);
    assert!(rm.pager().get_host_p(g + 0x1000).is_none());

    // Growing beyond the region moves the mapping and its bytes.
    let moved = heap
        .mremap(&mut rm, g, 0x8000, MRemapFlags::MREMAP_MAYMOVE)
        .unwrap();
    assert_eq!(unsafe { read_guest(&rm, moved + 0x800) }, 0x5a);
    assert!(rm.pager().get_host_p(g).is_none());

    assert!(matches!(
        heap.mremap(&mut rm, moved, 0x1000, MRemapFlags::MREMAP_FIXED),
        Err(crate::mm::heap::MapError::Unsupported(_))
    ));
}

#[test]
fn stack_faults_grow_the_stack() {
    let mut rm = new_rm();
    let stack = rm.allocate_region(4 * PAGE_SIZE, Purpose::Stack).unwrap();
    let stack_low = STACK_BASE - 4 * PAGE_SIZE as u64;
    let host = rm.host_base(stack);
    rm.set_guest_addr(stack, stack_low);
    rm.pager_mut()
        .map_region(host, stack_low, 4, PageOpts::WRITE)
        .unwrap();
    rm.pager_mut().set_stack_window(stack_low);

    // One page below the stack: grown.
    let fault = stack_low - 0x1000;
    assert!(rm.pager_mut().handle_pagefault(fault, 0x6).unwrap());
    assert!(rm.pager().get_host_p(fault).is_some());
    unsafe { write_guest(&rm, fault, 9) };

    // The window follows the growth.
    let fault2 = page_begin(fault) - 0x1000;
    assert!(rm.pager_mut().handle_pagefault(fault2, 0x6).unwrap());

    // Far outside the growth area: fatal.
    let wild = stack_low - STACK_GROW_LIMIT - 0x10_0000;
    assert!(!rm.pager_mut().handle_pagefault(wild, 0x6).unwrap());
}
