// Memory-model, dispatch, and trap behavior of the guest ABI, exercised
// the way emitted code exercises it.

use std::sync::atomic::{AtomicU32, Ordering};

use ppc2rs_runtime::context::GuestContext;
use ppc2rs_runtime::vmm::{Allocation, Memory, Protect};
use ppc2rs_runtime::{dispatch, guest, mmio, simd, traps, FuncMapping};

fn committed_memory() -> Memory {
    let mem = Memory::new().expect("arena");
    let heap = mem.lookup_heap(0x1000).unwrap();
    heap.alloc_fixed(
        0x0,
        0x10000,
        0x1000,
        Allocation::RESERVE | Allocation::COMMIT,
        Protect::READ | Protect::WRITE,
    )
    .expect("commit scratch pages");
    mem
}

#[test]
fn big_endian_store_is_observable_byte_by_byte() {
    // The emitted form of: stw r3, 0(r4) with r3 = 0x11223344, r4 = 0x100,
    // then lhz r5, 2(r4).
    let mem = committed_memory();
    let base = mem.base();
    let mut ctx = GuestContext::new();
    ctx.r[3].set_u32(0x1122_3344);
    ctx.r[4].set_u32(0x100);

    let ea = ctx.r[4].u32().wrapping_add(0);
    guest::store_u32_mmio(base, ea, ctx.r[3].u32());

    // Host bytes are guest big-endian.
    unsafe {
        assert_eq!(*guest::raw_addr(base, 0x100), 0x11);
        assert_eq!(*guest::raw_addr(base, 0x101), 0x22);
        assert_eq!(*guest::raw_addr(base, 0x102), 0x33);
        assert_eq!(*guest::raw_addr(base, 0x103), 0x44);
    }

    let ea = ctx.r[4].u32().wrapping_add(2);
    ctx.r[5].set_u64(guest::load_u16_mmio(base, ea) as u64);
    assert_eq!(ctx.r[5].u32(), 0x3344);
}

#[test]
fn doubleword_store_reads_back_as_word_halves() {
    let mem = committed_memory();
    let base = mem.base();
    guest::store_u64(base, 0x200, 0x1122_3344_5566_7788);
    assert_eq!(guest::load_u32(base, 0x200), 0x1122_3344);
    assert_eq!(guest::load_u32(base, 0x204), 0x5566_7788);
}

#[test]
fn vector_splat_broadcasts_guest_element_zero() {
    // vspltw vD, vA, 0 with guest elements [1, 2, 3, 4] broadcasts the
    // value living in host lane 3.
    let mut ctx = GuestContext::new();
    for (el, v) in [0x1u32, 0x2, 0x3, 0x4].into_iter().enumerate() {
        ctx.v[1].set_u32_el(el, v);
    }
    ctx.v[0] = simd::vspltw(ctx.v[1], 0);
    for lane in 0..4 {
        assert_eq!(ctx.v[0].u32(lane), 0x1);
    }
}

fn stub_sets_r3(ctx: &mut GuestContext, _base: *mut u8) {
    ctx.r[3].set_u32(0xCAFE);
}

#[test]
fn indirect_dispatch_reaches_the_mapped_function() {
    // Populate the table with one entry and transfer through it the way
    // an emitted bctr does.
    dispatch::install(
        0x8000_0000,
        0x0001_0000,
        &[FuncMapping {
            guest: 0x8000_1000,
            host: stub_sets_r3,
        }],
    );
    let mut ctx = GuestContext::new();
    ctx.ctr.set_u32(0x8000_1000);
    let target = ctx.ctr.u32();
    dispatch::dispatch(&mut ctx, std::ptr::null_mut(), target);
    assert_eq!(ctx.r[3].u32(), 0xCAFE);

    assert!(dispatch::lookup(0x8000_1000).is_some());
    assert!(dispatch::lookup(0x8000_2000).is_none());
}

#[test]
fn trap_service_reads_the_debug_string_and_continues() {
    // twi 31, r0, 20 with r3 = string, r4 = length logs and falls
    // through; execution state is untouched.
    let mem = committed_memory();
    let base = mem.base();
    for (i, b) in b"hello".iter().enumerate() {
        guest::store_u8(base, 0x300 + i as u32, *b);
    }
    let mut ctx = GuestContext::new();
    ctx.r[3].set_u32(0x300);
    ctx.r[4].set_u16(5);
    traps::trap_service(&mut ctx, base, 20);
    traps::trap_service(&mut ctx, base, 25);
    traps::trap_service(&mut ctx, base, 22);
    assert_eq!(ctx.r[3].u32(), 0x300);
}

struct CountingHandler {
    loads: AtomicU32,
    stores: AtomicU32,
}

impl mmio::MmioHandler for &'static CountingHandler {
    fn load(&self, _addr: u32) -> u32 {
        self.loads.fetch_add(1, Ordering::SeqCst);
        0x1234_5678
    }

    fn store(&self, _addr: u32, _value: u32) {
        self.stores.fetch_add(1, Ordering::SeqCst);
    }
}

static COUNTER: CountingHandler = CountingHandler {
    loads: AtomicU32::new(0),
    stores: AtomicU32::new(0),
};

#[test]
fn mmio_accesses_dispatch_exactly_once_each() {
    mmio::install(Box::new(&COUNTER));
    let base = std::ptr::null_mut();

    // One emitted store = one handler dispatch.
    guest::store_u32_mmio(base, 0x7F00_0100, 0xAA);
    assert_eq!(COUNTER.stores.load(Ordering::SeqCst), 1);

    // One emitted load = one dispatch.
    assert_eq!(guest::load_u32_mmio(base, 0x7F00_0100), 0x1234_5678);
    assert_eq!(COUNTER.loads.load(Ordering::SeqCst), 1);

    // 64-bit accesses split into two 32-bit transactions, high first.
    guest::store_u64_mmio(base, 0x7F00_0200, 0x1111_2222_3333_4444);
    assert_eq!(COUNTER.stores.load(Ordering::SeqCst), 3);
    let v = guest::load_u64_mmio(base, 0x7F00_0200);
    assert_eq!(v, 0x1234_5678_1234_5678);
    assert_eq!(COUNTER.loads.load(Ordering::SeqCst), 3);
}

#[test]
fn lwarx_stwcx_pair_succeeds_and_detects_interference() {
    let mem = committed_memory();
    let base = mem.base();
    let mut ctx = GuestContext::new();

    guest::store_u32(base, 0x400, 7);

    // lwarx r11, 0, r4
    ctx.r[4].set_u32(0x400);
    let ea = ctx.r[4].u32();
    ctx.reserved.set_u64(guest::load_u32(base, ea) as u64);
    ctx.r[11].set_u64(ctx.reserved.u32() as u64);
    assert_eq!(ctx.r[11].u32(), 7);

    // stwcx. r12, 0, r4 succeeds against an unchanged word.
    ctx.r[12].set_u32(9);
    let ok = guest::atomic_cas_u32(base, ea, ctx.reserved.u32(), ctx.r[12].u32());
    assert!(ok);
    assert_eq!(guest::load_u32(base, 0x400), 9);

    // An intervening store from another thread makes the next pair fail.
    ctx.reserved.set_u64(guest::load_u32(base, ea) as u64);
    guest::store_u32(base, 0x400, 100);
    let ok = guest::atomic_cas_u32(base, ea, ctx.reserved.u32(), 11);
    assert!(!ok);
    assert_eq!(guest::load_u32(base, 0x400), 100);
}
