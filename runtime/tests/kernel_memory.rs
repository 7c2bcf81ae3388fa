// Kernel memory exports driven through the guest calling convention.

use ppc2rs_runtime::context::GuestContext;
use ppc2rs_runtime::kernel::{
    self, KernelState, X_MEM_COMMIT, X_MEM_RELEASE, X_MEM_RESERVE, X_PAGE_READONLY,
    X_PAGE_READWRITE, X_STATUS_MEMORY_NOT_ALLOCATED, X_STATUS_SUCCESS, X_STATUS_UNSUCCESSFUL,
};
use ppc2rs_runtime::guest;
use ppc2rs_runtime::vmm::{Allocation, Protect};

struct Harness {
    state: &'static KernelState,
    ctx: GuestContext,
}

/// Guest addresses of the in-out parameter cells.
const BASE_PTR: u32 = 0x0001_0000;
const SIZE_PTR: u32 = 0x0001_0004;
const OLD_PROT_PTR: u32 = 0x0001_0008;
const INFO_PTR: u32 = 0x0001_0010;

impl Harness {
    fn new() -> Self {
        let state: &'static KernelState = Box::leak(Box::new(KernelState::new().unwrap()));
        // Commit a scratch page holding the by-reference parameters.
        state
            .memory()
            .lookup_heap(BASE_PTR)
            .unwrap()
            .alloc_fixed(
                BASE_PTR & !0xFFF,
                0x1000,
                0x1000,
                Allocation::RESERVE | Allocation::COMMIT,
                Protect::READ | Protect::WRITE,
            )
            .unwrap();
        let mut ctx = GuestContext::new();
        ctx.kernel = state as *const KernelState as *mut KernelState;
        Self { state, ctx }
    }

    fn base(&self) -> *mut u8 {
        self.state.memory().base()
    }

    fn alloc(&mut self, req_base: u32, size: u32, alloc_type: u32, protect: u32) -> (u32, u32, u32) {
        let base = self.base();
        guest::store_u32(base, BASE_PTR, req_base);
        guest::store_u32(base, SIZE_PTR, size);
        self.ctx.r[3].set_u64(BASE_PTR as u64);
        self.ctx.r[4].set_u64(SIZE_PTR as u64);
        self.ctx.r[5].set_u64(alloc_type as u64);
        self.ctx.r[6].set_u64(protect as u64);
        self.ctx.r[7].set_u64(0);
        kernel::nt_allocate_virtual_memory(&mut self.ctx, base);
        (
            self.ctx.r[3].u32(),
            guest::load_u32(base, BASE_PTR),
            guest::load_u32(base, SIZE_PTR),
        )
    }

    fn free(&mut self, addr: u32, size: u32, free_type: u32) -> (u32, u32) {
        let base = self.base();
        guest::store_u32(base, BASE_PTR, addr);
        guest::store_u32(base, SIZE_PTR, size);
        self.ctx.r[3].set_u64(BASE_PTR as u64);
        self.ctx.r[4].set_u64(SIZE_PTR as u64);
        self.ctx.r[5].set_u64(free_type as u64);
        self.ctx.r[6].set_u64(0);
        kernel::nt_free_virtual_memory(&mut self.ctx, base);
        (self.ctx.r[3].u32(), guest::load_u32(base, SIZE_PTR))
    }
}

#[test]
fn allocate_commit_write_and_release() {
    let mut h = Harness::new();
    let (status, addr, size) = h.alloc(0, 0x8000, X_MEM_RESERVE | X_MEM_COMMIT, X_PAGE_READWRITE);
    assert_eq!(status, X_STATUS_SUCCESS);
    assert_ne!(addr, 0);
    assert_eq!(size, 0x8000);

    // Committed memory is zeroed and writable.
    let base = h.base();
    assert_eq!(guest::load_u64(base, addr), 0);
    guest::store_u32(base, addr, 0xDEAD_BEEF);
    assert_eq!(guest::load_u32(base, addr), 0xDEAD_BEEF);

    let (status, freed) = h.free(addr, 0, X_MEM_RELEASE);
    assert_eq!(status, X_STATUS_SUCCESS);
    assert_eq!(freed, 0x8000);

    // Double release surfaces as a failure status.
    let (status, _) = h.free(addr, 0, X_MEM_RELEASE);
    assert_eq!(status, X_STATUS_UNSUCCESSFUL);
}

#[test]
fn sizes_round_up_to_the_page_class() {
    let mut h = Harness::new();
    let (status, _, size) = h.alloc(0, 0x1234, X_MEM_RESERVE | X_MEM_COMMIT, X_PAGE_READWRITE);
    assert_eq!(status, X_STATUS_SUCCESS);
    assert_eq!(size, 0x2000);
}

#[test]
fn protect_reports_the_old_protection() {
    let mut h = Harness::new();
    let (status, addr, _) = h.alloc(0, 0x4000, X_MEM_RESERVE | X_MEM_COMMIT, X_PAGE_READWRITE);
    assert_eq!(status, X_STATUS_SUCCESS);

    let base = h.base();
    guest::store_u32(base, BASE_PTR, addr + 0x1000);
    guest::store_u32(base, SIZE_PTR, 0x1000);
    h.ctx.r[3].set_u64(BASE_PTR as u64);
    h.ctx.r[4].set_u64(SIZE_PTR as u64);
    h.ctx.r[5].set_u64(X_PAGE_READONLY as u64);
    h.ctx.r[6].set_u64(OLD_PROT_PTR as u64);
    h.ctx.r[7].set_u64(0);
    kernel::nt_protect_virtual_memory(&mut h.ctx, base);
    assert_eq!(h.ctx.r[3].u32(), X_STATUS_SUCCESS);
    assert_eq!(guest::load_u32(base, OLD_PROT_PTR), X_PAGE_READWRITE);

    // Query sees the split.
    h.ctx.r[3].set_u64((addr + 0x1000) as u64);
    h.ctx.r[4].set_u64(INFO_PTR as u64);
    kernel::nt_query_virtual_memory(&mut h.ctx, base);
    assert_eq!(h.ctx.r[3].u32(), X_STATUS_SUCCESS);
    assert_eq!(guest::load_u32(base, INFO_PTR), addr + 0x1000); // base_address
    assert_eq!(guest::load_u32(base, INFO_PTR + 12), 0x1000); // region_size
    assert_eq!(guest::load_u32(base, INFO_PTR + 20), X_PAGE_READONLY);
}

#[test]
fn free_of_null_reports_not_allocated() {
    let mut h = Harness::new();
    let (status, _) = h.free(0, 0, X_MEM_RELEASE);
    assert_eq!(status, X_STATUS_MEMORY_NOT_ALLOCATED);
}

#[test]
fn physical_allocation_returns_a_window_address() {
    let mut h = Harness::new();
    let base = h.base();
    // MmAllocatePhysicalMemoryEx(flags=0, size=128K, protect=RW,
    // min=0, max=-1, align=0) should land in the 64K physical heap
    // via X_MEM_LARGE_PAGES.
    h.ctx.r[3].set_u64(0);
    h.ctx.r[4].set_u64(0x2_0000);
    h.ctx.r[5].set_u64((X_PAGE_READWRITE | ppc2rs_runtime::kernel::X_MEM_LARGE_PAGES) as u64);
    h.ctx.r[6].set_u64(0);
    h.ctx.r[7].set_u64(0xFFFF_FFFF);
    h.ctx.r[8].set_u64(0);
    kernel::mm_allocate_physical_memory_ex(&mut h.ctx, base);
    let addr = h.ctx.r[3].u32();
    assert!(addr >= 0xA000_0000 && addr < 0xC000_0000, "addr {addr:#x}");

    // MmGetPhysicalAddress strips the window.
    h.ctx.r[3].set_u64(addr as u64);
    kernel::mm_get_physical_address(&mut h.ctx, base);
    assert_eq!(h.ctx.r[3].u32(), addr & 0x1FFF_FFFF);
}

#[test]
fn pool_allocations_round_trip() {
    let mut h = Harness::new();
    let base = h.base();
    h.ctx.r[3].set_u64(0x100);
    kernel::ex_allocate_pool(&mut h.ctx, base);
    let addr = h.ctx.r[3].u32();
    assert_ne!(addr, 0);
    guest::store_u32(base, addr, 42);

    h.ctx.r[3].set_u64(addr as u64);
    kernel::ex_free_pool(&mut h.ctx, base);
}

#[test]
fn query_statistics_uses_live_counters() {
    let mut h = Harness::new();
    let base = h.base();
    // The struct's size field must be filled in by the caller.
    guest::store_u32(base, INFO_PTR, 104);
    h.ctx.r[3].set_u64(INFO_PTR as u64);
    kernel::mm_query_statistics(&mut h.ctx, base);
    assert_eq!(h.ctx.r[3].u32(), X_STATUS_SUCCESS);
    let total = guest::load_u32(base, INFO_PTR + 4);
    let available = guest::load_u32(base, INFO_PTR + 12);
    assert_eq!(total, 0x2_0000);
    assert!(available <= total);

    // A physical allocation shrinks the available count.
    h.ctx.r[3].set_u64(0);
    h.ctx.r[4].set_u64(0x10_0000);
    h.ctx.r[5].set_u64(X_PAGE_READWRITE as u64);
    h.ctx.r[6].set_u64(0);
    h.ctx.r[7].set_u64(0xFFFF_FFFF);
    h.ctx.r[8].set_u64(0);
    kernel::mm_allocate_physical_memory_ex(&mut h.ctx, base);
    assert_ne!(h.ctx.r[3].u32(), 0);

    guest::store_u32(base, INFO_PTR, 104);
    h.ctx.r[3].set_u64(INFO_PTR as u64);
    kernel::mm_query_statistics(&mut h.ctx, base);
    let available_after = guest::load_u32(base, INFO_PTR + 12);
    assert!(available_after < available);
}
