// VMM state-machine tests against a real 4 GiB arena.

use ppc2rs_runtime::guest;
use ppc2rs_runtime::vmm::{Allocation, Memory, Protect, VmError};

fn memory() -> Memory {
    Memory::new().expect("arena reservation")
}

#[test]
fn reserve_then_commit_then_free() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();

    // Reserve 64 KiB of small pages somewhere, then commit it in place.
    let addr = heap
        .alloc(0x10000, 0x1000, Allocation::RESERVE, Protect::READ | Protect::WRITE, false)
        .unwrap();
    assert_eq!(addr % 0x1000, 0);
    heap.alloc_fixed(
        addr,
        0x10000,
        0x1000,
        Allocation::COMMIT,
        Protect::READ | Protect::WRITE,
    )
    .unwrap();

    // Committed memory is readable and writable through the arena.
    let base = mem.base();
    guest::store_u32(base, addr, 0xDEAD_BEEF);
    assert_eq!(guest::load_u32(base, addr), 0xDEAD_BEEF);

    // Release reports the original reservation size; a second release
    // fails with MemoryNotAllocated.
    let mut out_size = 0;
    let released = heap.release(addr, Some(&mut out_size)).unwrap();
    assert_eq!(released, 0x10000);
    assert_eq!(out_size, 0x10000);
    assert_eq!(heap.release(addr, None), Err(VmError::MemoryNotAllocated));
}

#[test]
fn protect_splits_a_uniform_region() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();

    let addr = heap
        .alloc(
            0x4000,
            0x1000,
            Allocation::RESERVE | Allocation::COMMIT,
            Protect::READ | Protect::WRITE,
            false,
        )
        .unwrap();

    let mut old = Protect::empty();
    heap.protect(addr + 0x1000, 0x1000, Protect::READ, Some(&mut old))
        .unwrap();
    assert_eq!(old, Protect::READ | Protect::WRITE);

    let first = heap.query_region_info(addr).unwrap();
    assert_eq!(first.base_address, addr);
    assert_eq!(first.region_size, 0x1000);
    assert_eq!(first.protect, Protect::READ | Protect::WRITE);

    let touched = heap.query_region_info(addr + 0x1000).unwrap();
    assert_eq!(touched.base_address, addr + 0x1000);
    assert_eq!(touched.region_size, 0x1000);
    assert_eq!(touched.protect, Protect::READ);

    let rest = heap.query_region_info(addr + 0x2000).unwrap();
    assert_eq!(rest.base_address, addr + 0x2000);
    assert_eq!(rest.region_size, 0x2000);
    assert_eq!(rest.protect, Protect::READ | Protect::WRITE);

    // The split regions still share one allocation base.
    assert_eq!(first.allocation_base, addr);
    assert_eq!(touched.allocation_base, addr);
}

#[test]
fn protect_across_reservation_boundary_fails() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();

    let a = heap
        .alloc_range(
            0x0010_0000,
            0x001F_FFFF,
            0x2000,
            0x1000,
            Allocation::RESERVE | Allocation::COMMIT,
            Protect::READ | Protect::WRITE,
            false,
        )
        .unwrap();
    // Adjacent second reservation.
    heap.alloc_fixed(
        a + 0x2000,
        0x2000,
        0x1000,
        Allocation::RESERVE | Allocation::COMMIT,
        Protect::READ | Protect::WRITE,
    )
    .unwrap();

    assert_eq!(
        heap.protect(a + 0x1000, 0x2000, Protect::READ, None),
        Err(VmError::AccessDenied)
    );
}

#[test]
fn decommit_leaves_pages_reserved() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();

    let addr = heap
        .alloc(
            0x2000,
            0x1000,
            Allocation::RESERVE | Allocation::COMMIT,
            Protect::READ | Protect::WRITE,
            false,
        )
        .unwrap();
    heap.decommit(addr, 0x2000).unwrap();

    let info = heap.query_region_info(addr).unwrap();
    assert_eq!(info.state, Allocation::RESERVE);

    // Reserved pages can be committed again.
    heap.alloc_fixed(
        addr,
        0x2000,
        0x1000,
        Allocation::COMMIT,
        Protect::READ | Protect::WRITE,
    )
    .unwrap();
    guest::store_u32(mem.base(), addr, 1);
}

#[test]
fn commit_without_reservation_fails() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();
    assert_eq!(
        heap.alloc_fixed(
            0x0020_0000,
            0x1000,
            0x1000,
            Allocation::COMMIT,
            Protect::READ | Protect::WRITE
        ),
        Err(VmError::MemoryNotAllocated)
    );
}

#[test]
fn reserve_over_live_pages_fails() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();
    let addr = heap
        .alloc(0x1000, 0x1000, Allocation::RESERVE, Protect::READ, false)
        .unwrap();
    assert_eq!(
        heap.alloc_fixed(addr, 0x1000, 0x1000, Allocation::RESERVE, Protect::READ),
        Err(VmError::AlreadyCommitted)
    );
}

#[test]
fn release_requires_the_reservation_start() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();
    let addr = heap
        .alloc(0x4000, 0x1000, Allocation::RESERVE, Protect::READ, false)
        .unwrap();
    assert_eq!(
        heap.release(addr + 0x1000, None),
        Err(VmError::MemoryNotAllocated)
    );
    assert_eq!(heap.release(addr, None).unwrap(), 0x4000);
}

#[test]
fn top_down_allocation_comes_from_the_high_end() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();
    let low = heap
        .alloc(0x1000, 0x1000, Allocation::RESERVE, Protect::READ, false)
        .unwrap();
    let high = heap
        .alloc(0x1000, 0x1000, Allocation::RESERVE, Protect::READ, true)
        .unwrap();
    assert!(high > low);
    assert_eq!(high, heap.heap_base() + heap.heap_size() - 0x1000);
}

#[test]
fn alloc_range_honors_bounds_and_alignment() {
    let mem = memory();
    let heap = mem.lookup_heap(0xA000_0000).unwrap();
    let addr = heap
        .alloc_range(
            0xA010_0000,
            0xA01F_FFFF,
            0x2_0000,
            0x2_0000,
            Allocation::RESERVE | Allocation::COMMIT,
            Protect::READ | Protect::WRITE,
            true,
        )
        .unwrap();
    assert!(addr >= 0xA010_0000 && addr < 0xA020_0000);
    assert_eq!(addr % 0x2_0000, 0);
}

#[test]
fn wrong_page_size_class_is_rejected() {
    let mem = memory();
    let heap = mem.lookup_heap(0x4000_0000).unwrap();
    assert_eq!(heap.page_size(), 0x1_0000);
    assert_eq!(
        heap.alloc(0x1000, 0x1000, Allocation::RESERVE, Protect::READ, false),
        Err(VmError::InvalidParameter)
    );
}

#[test]
fn query_size_reports_the_whole_reservation() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();
    let addr = heap
        .alloc(0x8000, 0x1000, Allocation::RESERVE, Protect::READ, false)
        .unwrap();
    assert_eq!(heap.query_size(addr).unwrap(), 0x8000);
    assert_eq!(heap.query_size(addr + 0x3000).unwrap(), 0x8000);
}

#[test]
fn zero_writes_through_the_arena() {
    let mem = memory();
    let heap = mem.lookup_heap(0x1000).unwrap();
    let addr = heap
        .alloc(
            0x1000,
            0x1000,
            Allocation::RESERVE | Allocation::COMMIT,
            Protect::READ | Protect::WRITE,
            false,
        )
        .unwrap();
    let base = mem.base();
    guest::store_u64(base, addr, u64::MAX);
    mem.zero(addr, 0x1000);
    assert_eq!(guest::load_u64(base, addr), 0);
}
