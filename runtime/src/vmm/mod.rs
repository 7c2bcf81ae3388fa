//! Guest virtual memory manager.
//!
//! Owns the 4 GiB guest arena and partitions it into heaps with fixed page
//! sizes, mirroring the console's memory map:
//!
//!   0x00000000 - 0x3FFFFFFF  guest virtual, 4 KiB pages
//!   0x40000000 - 0x7EFFFFFF  guest virtual, 64 KiB pages
//!   0x7F000000 - 0x7FFFFFFF  MMIO window (no backing, runtime-handled)
//!   0x80000000 - 0x9FFFFFFF  image, read-execute
//!   0xA0000000 - 0xBFFFFFFF  physical, 64 KiB pages
//!   0xC0000000 - 0xDFFFFFFF  physical, 16 MiB pages
//!   0xE0000000 - 0xFFFFFFFF  physical, 4 KiB pages
//!
//! The physical heaps alias GPU-visible memory; translating between their
//! windows is address arithmetic, never a copy. Every live guest address
//! belongs to exactly one heap.

pub mod heap;
pub mod host;

use std::io;

use thiserror::Error;

use crate::guest;

pub use heap::{Allocation, Heap, HeapAllocationInfo, HeapType, Protect};

/// Runtime memory errors, surfaced to the guest as NTSTATUS equivalents.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("access denied")]
    AccessDenied,
    #[error("memory not allocated")]
    MemoryNotAllocated,
    #[error("already committed")]
    AlreadyCommitted,
    #[error("host primitive failed: {0}")]
    Host(&'static str),
}

/// The contiguous host reservation backing the whole guest address space.
/// Created once at process start; the base pointer is immutable for the
/// process lifetime.
pub struct GuestArena {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for GuestArena {}
unsafe impl Sync for GuestArena {}

impl GuestArena {
    pub fn reserve() -> io::Result<Self> {
        // The extra page absorbs the physical-heap host offset on 64 KiB
        // granularity hosts.
        let len = guest::MEMORY_SIZE as usize + 0x1000;
        let base = host::alloc_fixed(
            std::ptr::null_mut(),
            len,
            host::AllocationType::Reserve,
            host::PageAccess::NoAccess,
        )
        .ok_or_else(io::Error::last_os_error)?;
        Ok(Self { base, len })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for GuestArena {
    fn drop(&mut self) {
        host::dealloc_fixed(self.base, self.len, host::DeallocationType::Release);
    }
}

const HEAP_LAYOUT: &[(u32, u32, u32, HeapType)] = &[
    (0x0000_0000, 0x4000_0000, 0x1000, HeapType::Virtual),
    (0x4000_0000, 0x3F00_0000, 0x1_0000, HeapType::Virtual),
    (0x8000_0000, 0x2000_0000, 0x1000, HeapType::Image),
    (0xA000_0000, 0x2000_0000, 0x1_0000, HeapType::Physical),
    (0xC000_0000, 0x2000_0000, 0x100_0000, HeapType::Physical),
    (0xE000_0000, 0x2000_0000, 0x1000, HeapType::Physical),
];

/// Physical heaps window the same 512 MiB of GPU-visible memory.
const PHYSICAL_MASK: u32 = 0x1FFF_FFFF;

/// The process-wide memory manager: arena plus heap map.
pub struct Memory {
    arena: GuestArena,
    heaps: Vec<Heap>,
}

impl Memory {
    pub fn new() -> io::Result<Self> {
        let arena = GuestArena::reserve()?;
        let heaps = HEAP_LAYOUT
            .iter()
            .map(|&(base, size, page_size, ty)| Heap::new(base, size, page_size, ty, arena.base()))
            .collect();
        Ok(Self { arena, heaps })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.arena.base()
    }

    /// Heap owning `addr`. Addresses in the MMIO window belong to no heap.
    pub fn lookup_heap(&self, addr: u32) -> Option<&Heap> {
        self.heaps.iter().find(|h| h.contains(addr))
    }

    /// Heap of the given visibility class and page size.
    pub fn lookup_heap_by_type(&self, physical: bool, page_size: u32) -> Option<&Heap> {
        self.heaps.iter().find(|h| {
            h.page_size() == page_size
                && match h.heap_type() {
                    HeapType::Physical => physical,
                    HeapType::Virtual => !physical,
                    HeapType::Image => false,
                }
        })
    }

    pub fn heaps(&self) -> &[Heap] {
        &self.heaps
    }

    /// Zero a guest range through the arena.
    pub fn zero(&self, addr: u32, size: u32) {
        unsafe {
            guest::raw_addr(self.base(), addr).write_bytes(0, size as usize);
        }
    }

    /// Physical address for a physical-heap virtual window address, or
    /// u32::MAX for addresses outside the physical windows.
    pub fn get_physical_address(&self, addr: u32) -> u32 {
        match self.lookup_heap(addr).map(|h| h.heap_type()) {
            Some(HeapType::Physical) => addr & PHYSICAL_MASK,
            _ => u32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heaps_do_not_overlap_and_cover_expected_ranges() {
        let addrs = [
            (0x0000_1000u32, 0x1000u32),
            (0x4001_0000, 0x1_0000),
            (0x8000_0000, 0x1000),
            (0xA000_0000, 0x1_0000),
            (0xC000_0000, 0x100_0000),
            (0xE000_0000, 0x1000),
        ];
        let mem = Memory::new().expect("arena");
        for (addr, page) in addrs {
            let matching: Vec<_> = mem.heaps().iter().filter(|h| h.contains(addr)).collect();
            assert_eq!(matching.len(), 1, "address {addr:#010x}");
            assert_eq!(matching[0].page_size(), page);
        }
        // MMIO window belongs to no heap.
        assert!(mem.lookup_heap(0x7F00_0000).is_none());
        assert!(mem.lookup_heap(0x7FFF_FFFF).is_none());
    }

    #[test]
    fn physical_windows_alias_one_physical_space() {
        let mem = Memory::new().expect("arena");
        assert_eq!(mem.get_physical_address(0xA000_2000), 0x2000);
        assert_eq!(mem.get_physical_address(0xE000_2000), 0x2000);
        assert_eq!(mem.get_physical_address(0x1000), u32::MAX);
    }
}
