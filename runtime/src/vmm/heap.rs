//! Heap page-state machine.
//!
//! A heap is a half-open arena [base, base+size) with one fixed page size.
//! Page state follows NT semantics: free -> reserved -> committed, where
//! committed implies reserved. A reservation is a contiguous run recorded
//! on every page (start index + length), which is what lets `release`
//! recover the original extent on hosts whose native primitive does not
//! track it.
//!
//! State-mutating calls serialize on the heap's lock; queries take the
//! same lock but never touch host mappings.

use std::sync::Mutex;

use bitflags::bitflags;

use crate::guest;
use crate::vmm::host::{self, AllocationType, DeallocationType, PageAccess};
use crate::vmm::VmError;

bitflags! {
    /// Abstract page protection shared by the VMM and the kernel exports.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Protect: u32 {
        const READ = 1;
        const WRITE = 2;
        const NO_CACHE = 4;
        const WRITE_COMBINE = 8;
    }
}

bitflags! {
    /// Page allocation state. Empty means free; COMMIT implies RESERVE.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Allocation: u32 {
        const RESERVE = 1;
        const COMMIT = 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapType {
    /// Guest-visible NT virtual space, observable through Nt* calls.
    Virtual,
    /// Physical-alias windows backing MmAllocatePhysicalMemory*.
    Physical,
    /// The loaded image range (read-execute, frozen after load).
    Image,
}

#[derive(Clone, Copy, Default)]
struct PageEntry {
    state: Allocation,
    protect: Protect,
    alloc_protect: Protect,
    /// Page index of the reservation start this page belongs to.
    first_page: u32,
    /// Reservation length in pages, replicated across the run.
    reservation_pages: u32,
}

/// Region description returned by `query_region_info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocationInfo {
    pub base_address: u32,
    pub allocation_base: u32,
    pub allocation_protect: Protect,
    pub region_size: u32,
    pub state: Allocation,
    pub protect: Protect,
}

pub struct Heap {
    base: u32,
    size: u32,
    page_size: u32,
    heap_type: HeapType,
    /// Host arena base, stored as an address so heaps can be shared
    /// across guest threads.
    host_base: usize,
    pages: Mutex<Vec<PageEntry>>,
}

// Heaps only dereference the arena through raw_addr with page-bounded
// offsets, and all mutation is behind the page-table lock.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

fn page_access(heap_type: HeapType, protect: Protect) -> PageAccess {
    let read = protect.contains(Protect::READ);
    let write = protect.contains(Protect::WRITE);
    match (heap_type, read, write) {
        (HeapType::Image, _, true) => PageAccess::ExecuteReadWrite,
        (HeapType::Image, _, false) => PageAccess::ExecuteReadOnly,
        (_, _, true) => PageAccess::ReadWrite,
        (_, true, false) => PageAccess::ReadOnly,
        (_, false, false) => PageAccess::NoAccess,
    }
}

impl Heap {
    pub fn new(
        base: u32,
        size: u32,
        page_size: u32,
        heap_type: HeapType,
        host_base: *mut u8,
    ) -> Self {
        debug_assert_eq!(size % page_size, 0);
        let page_count = (size / page_size) as usize;
        Self {
            base,
            size,
            page_size,
            heap_type,
            host_base: host_base as usize,
            pages: Mutex::new(vec![PageEntry::default(); page_count]),
        }
    }

    pub fn heap_base(&self) -> u32 {
        self.base
    }

    pub fn heap_size(&self) -> u32 {
        self.size
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr as u64) < self.base as u64 + self.size as u64
    }

    pub fn total_page_count(&self) -> u32 {
        (self.size / self.page_size) as u32
    }

    pub fn unreserved_page_count(&self) -> u32 {
        let pages = self.pages.lock().unwrap();
        pages.iter().filter(|p| p.state.is_empty()).count() as u32
    }

    fn page_index(&self, addr: u32) -> Result<usize, VmError> {
        if !self.contains(addr) {
            return Err(VmError::InvalidParameter);
        }
        if (addr - self.base) % self.page_size != 0 {
            return Err(VmError::InvalidParameter);
        }
        Ok(((addr - self.base) / self.page_size) as usize)
    }

    fn page_addr(&self, index: usize) -> u32 {
        self.base + index as u32 * self.page_size
    }

    fn host_ptr(&self, addr: u32) -> *mut u8 {
        guest::raw_addr(self.host_base as *mut u8, addr)
    }

    fn page_span(&self, addr: u32, size: u32) -> Result<(usize, usize), VmError> {
        if size == 0 || size % self.page_size != 0 {
            return Err(VmError::InvalidParameter);
        }
        let start = self.page_index(addr)?;
        let count = (size / self.page_size) as usize;
        let total = self.total_page_count() as usize;
        if start + count > total {
            return Err(VmError::InvalidParameter);
        }
        Ok((start, count))
    }

    /// Reserve and/or commit a specific run of pages.
    ///
    /// Reserving requires every page free. Committing requires every page
    /// to already belong to one reservation; committing over an existing
    /// reservation only updates page state and protection, never the
    /// backing mapping's identity.
    pub fn alloc_fixed(
        &self,
        addr: u32,
        size: u32,
        page_size: u32,
        allocation: Allocation,
        protect: Protect,
    ) -> Result<(), VmError> {
        if page_size != self.page_size || allocation.is_empty() {
            return Err(VmError::InvalidParameter);
        }
        let (start, count) = self.page_span(addr, size)?;
        let mut pages = self.pages.lock().unwrap();

        if allocation.contains(Allocation::RESERVE) {
            if pages[start..start + count].iter().any(|p| !p.state.is_empty()) {
                return Err(VmError::AlreadyCommitted);
            }
        } else {
            // Commit without reserve: every page must be reserved, within
            // a single reservation.
            let first = pages[start].first_page;
            for p in &pages[start..start + count] {
                if !p.state.contains(Allocation::RESERVE) {
                    return Err(VmError::MemoryNotAllocated);
                }
                if p.first_page != first {
                    return Err(VmError::InvalidParameter);
                }
            }
        }

        if allocation.contains(Allocation::COMMIT) {
            let host_ty = if allocation.contains(Allocation::RESERVE) {
                AllocationType::ReserveCommit
            } else {
                AllocationType::Commit
            };
            let access = page_access(self.heap_type, protect);
            if host::alloc_fixed(self.host_ptr(addr), size as usize, host_ty, access).is_none() {
                log::error!(
                    "host commit failed for {addr:#010x}+{size:#x} in heap {:#010x}",
                    self.base
                );
                return Err(VmError::Host("commit failed"));
            }
        }

        for p in pages[start..start + count].iter_mut() {
            if allocation.contains(Allocation::RESERVE) {
                p.first_page = start as u32;
                p.reservation_pages = count as u32;
                p.alloc_protect = protect;
                p.state = Allocation::RESERVE;
                p.protect = Protect::empty();
            }
            if allocation.contains(Allocation::COMMIT) {
                p.state |= Allocation::COMMIT;
                p.protect = protect;
            }
        }
        Ok(())
    }

    /// Find-and-allocate a run anywhere in the heap.
    pub fn alloc(
        &self,
        size: u32,
        page_size: u32,
        allocation: Allocation,
        protect: Protect,
        top_down: bool,
    ) -> Result<u32, VmError> {
        if page_size != self.page_size {
            return Err(VmError::InvalidParameter);
        }
        self.alloc_range(
            self.base,
            (self.base as u64 + self.size as u64 - 1) as u32,
            size,
            page_size,
            allocation,
            protect,
            top_down,
        )
    }

    /// `alloc` constrained to [min_addr, max_addr] with a start-address
    /// alignment (bytes, multiple of the page size).
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_range(
        &self,
        min_addr: u32,
        max_addr: u32,
        size: u32,
        alignment: u32,
        allocation: Allocation,
        protect: Protect,
        top_down: bool,
    ) -> Result<u32, VmError> {
        if size == 0 || size % self.page_size != 0 {
            return Err(VmError::InvalidParameter);
        }
        let alignment = alignment.max(self.page_size);
        if alignment % self.page_size != 0 {
            return Err(VmError::InvalidParameter);
        }
        if min_addr > max_addr || !self.contains(min_addr) || !self.contains(max_addr) {
            return Err(VmError::InvalidParameter);
        }

        let count = (size / self.page_size) as usize;
        let low = ((min_addr - self.base) / self.page_size) as usize;
        let high = ((max_addr - self.base) / self.page_size) as usize; // inclusive page
        if low + count > high + 1 {
            return Err(VmError::OutOfMemory);
        }

        let candidate = {
            let pages = self.pages.lock().unwrap();
            let fits = |start: usize| {
                self.page_addr(start) % alignment == 0
                    && pages[start..start + count].iter().all(|p| p.state.is_empty())
            };
            let mut found = None;
            if top_down {
                let mut start = high + 1 - count;
                loop {
                    if fits(start) {
                        found = Some(start);
                        break;
                    }
                    if start == low {
                        break;
                    }
                    start -= 1;
                }
            } else {
                for start in low..=(high + 1 - count) {
                    if fits(start) {
                        found = Some(start);
                        break;
                    }
                }
            }
            found
        };

        let start = candidate.ok_or(VmError::OutOfMemory)?;
        let addr = self.page_addr(start);
        self.alloc_fixed(addr, size, self.page_size, allocation, protect)?;
        Ok(addr)
    }

    /// Change protection on a run of pages. The run must lie inside a
    /// single reservation; crossing a reservation boundary fails. May
    /// split the region reported by later queries.
    pub fn protect(
        &self,
        addr: u32,
        size: u32,
        protect: Protect,
        out_old: Option<&mut Protect>,
    ) -> Result<(), VmError> {
        let (start, count) = self.page_span(addr, size)?;
        let mut pages = self.pages.lock().unwrap();

        let first = pages[start].first_page;
        for p in &pages[start..start + count] {
            if !p.state.contains(Allocation::RESERVE) {
                return Err(VmError::MemoryNotAllocated);
            }
            if p.first_page != first {
                return Err(VmError::AccessDenied);
            }
        }

        if let Some(old) = out_old {
            *old = pages[start].protect;
        }

        // Host protection only applies to committed pages.
        let access = page_access(self.heap_type, protect);
        let mut i = start;
        while i < start + count {
            if pages[i].state.contains(Allocation::COMMIT) {
                let run_start = i;
                while i < start + count && pages[i].state.contains(Allocation::COMMIT) {
                    i += 1;
                }
                let run_addr = self.page_addr(run_start);
                let run_len = (i - run_start) as u32 * self.page_size;
                if !host::protect(self.host_ptr(run_addr), run_len as usize, access, None) {
                    log::error!("host protect failed for {run_addr:#010x}+{run_len:#x}");
                    return Err(VmError::Host("protect failed"));
                }
            } else {
                i += 1;
            }
        }

        for p in pages[start..start + count].iter_mut() {
            p.protect = protect;
        }
        Ok(())
    }

    /// Decommit a run; the pages stay reserved.
    pub fn decommit(&self, addr: u32, size: u32) -> Result<(), VmError> {
        let (start, count) = self.page_span(addr, size)?;
        let mut pages = self.pages.lock().unwrap();
        for p in &pages[start..start + count] {
            if !p.state.contains(Allocation::RESERVE) {
                return Err(VmError::MemoryNotAllocated);
            }
        }
        if !host::dealloc_fixed(
            self.host_ptr(addr),
            size as usize,
            DeallocationType::Decommit,
        ) {
            log::error!("host decommit failed for {addr:#010x}+{size:#x}");
            return Err(VmError::Host("decommit failed"));
        }
        for p in pages[start..start + count].iter_mut() {
            p.state = Allocation::RESERVE;
            p.protect = Protect::empty();
        }
        Ok(())
    }

    /// Release an entire reservation. `addr` must be the reservation's
    /// start; the whole original run is freed and its size reported back.
    pub fn release(&self, addr: u32, out_size: Option<&mut u32>) -> Result<u32, VmError> {
        let start = self.page_index(addr)?;
        let mut pages = self.pages.lock().unwrap();
        let entry = pages[start];
        if entry.state.is_empty() {
            return Err(VmError::MemoryNotAllocated);
        }
        if entry.first_page as usize != start {
            // Not the start of the original reservation.
            return Err(VmError::MemoryNotAllocated);
        }
        let count = entry.reservation_pages as usize;
        let size = count as u32 * self.page_size;

        // The guest arena must stay mapped for the process lifetime, so
        // releasing inside it decommits and returns the range to the
        // arena's PROT_NONE reservation rather than unmapping it.
        if !host::dealloc_fixed(
            self.host_ptr(addr),
            size as usize,
            DeallocationType::Decommit,
        ) {
            log::error!("host release failed for {addr:#010x}+{size:#x}");
            return Err(VmError::Host("release failed"));
        }

        for p in pages[start..start + count].iter_mut() {
            *p = PageEntry::default();
        }
        if let Some(out) = out_size {
            *out = size;
        }
        Ok(size)
    }

    /// Describe the maximal uniform run containing `addr`.
    pub fn query_region_info(&self, addr: u32) -> Result<HeapAllocationInfo, VmError> {
        if !self.contains(addr) {
            return Err(VmError::InvalidParameter);
        }
        let idx = ((addr - self.base) / self.page_size) as usize;
        let pages = self.pages.lock().unwrap();
        let probe = pages[idx];

        let uniform = |p: &PageEntry| {
            p.state == probe.state
                && p.protect == probe.protect
                && (probe.state.is_empty() || p.first_page == probe.first_page)
        };

        let mut first = idx;
        while first > 0 && uniform(&pages[first - 1]) {
            first -= 1;
        }
        let total = pages.len();
        let mut last = idx;
        while last + 1 < total && uniform(&pages[last + 1]) {
            last += 1;
        }

        let (allocation_base, allocation_protect) = if probe.state.is_empty() {
            (0, Protect::empty())
        } else {
            (
                self.page_addr(probe.first_page as usize),
                pages[probe.first_page as usize].alloc_protect,
            )
        };

        Ok(HeapAllocationInfo {
            base_address: self.page_addr(first),
            allocation_base,
            allocation_protect,
            region_size: (last - first + 1) as u32 * self.page_size,
            state: probe.state,
            protect: probe.protect,
        })
    }

    /// Current protection of the page containing `addr`.
    pub fn query_protect(&self, addr: u32) -> Result<Protect, VmError> {
        if !self.contains(addr) {
            return Err(VmError::InvalidParameter);
        }
        let idx = ((addr - self.base) / self.page_size) as usize;
        let pages = self.pages.lock().unwrap();
        if pages[idx].state.is_empty() {
            return Err(VmError::MemoryNotAllocated);
        }
        Ok(pages[idx].protect)
    }

    /// Size in bytes of the reservation containing `addr`.
    pub fn query_size(&self, addr: u32) -> Result<u32, VmError> {
        if !self.contains(addr) {
            return Err(VmError::InvalidParameter);
        }
        let idx = ((addr - self.base) / self.page_size) as usize;
        let pages = self.pages.lock().unwrap();
        if pages[idx].state.is_empty() {
            return Err(VmError::MemoryNotAllocated);
        }
        Ok(pages[idx].reservation_pages * self.page_size)
    }
}
