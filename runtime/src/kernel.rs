//! Kernel-export ABI glue.
//!
//! Recompiled code calls kernel imports through a process-wide registry
//! populated at startup (the moral equivalent of overriding `__imp__*`
//! weak symbols). Arguments arrive in r3..r10 and then on the guest stack
//! at +0x54 in 8-byte slots; results are written back to r3 (r4 carries
//! the low half where the ABI splits 64-bit values).
//!
//! The memory family is implemented here against the VMM; everything it
//! returns to the guest is an NTSTATUS equivalent.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, OnceLock};

use crate::context::{GuestContext, GuestFn};
use crate::guest;
use crate::vmm::{Allocation, HeapType, Memory, Protect, VmError};

// ---------------------------------------------------------------------------
// Guest-visible constants (XDK numbering)
// ---------------------------------------------------------------------------

pub const X_STATUS_SUCCESS: u32 = 0x0000_0000;
pub const X_STATUS_UNSUCCESSFUL: u32 = 0xC000_0001;
pub const X_STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
pub const X_STATUS_NO_MEMORY: u32 = 0xC000_0017;
pub const X_STATUS_ALREADY_COMMITTED: u32 = 0xC000_0021;
pub const X_STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
pub const X_STATUS_BUFFER_TOO_SMALL: u32 = 0xC000_0023;
pub const X_STATUS_MEMORY_NOT_ALLOCATED: u32 = 0xC000_00A0;

pub const X_PAGE_NOACCESS: u32 = 0x001;
pub const X_PAGE_READONLY: u32 = 0x002;
pub const X_PAGE_READWRITE: u32 = 0x004;
pub const X_PAGE_WRITECOPY: u32 = 0x008;
pub const X_PAGE_EXECUTE: u32 = 0x010;
pub const X_PAGE_EXECUTE_READ: u32 = 0x020;
pub const X_PAGE_EXECUTE_READWRITE: u32 = 0x040;
pub const X_PAGE_EXECUTE_WRITECOPY: u32 = 0x080;
pub const X_PAGE_GUARD: u32 = 0x100;
pub const X_PAGE_NOCACHE: u32 = 0x200;
pub const X_PAGE_WRITECOMBINE: u32 = 0x400;

pub const X_MEM_COMMIT: u32 = 0x0000_1000;
pub const X_MEM_RESERVE: u32 = 0x0000_2000;
pub const X_MEM_DECOMMIT: u32 = 0x0000_4000;
pub const X_MEM_RELEASE: u32 = 0x0000_8000;
pub const X_MEM_FREE: u32 = 0x0001_0000;
pub const X_MEM_PRIVATE: u32 = 0x0002_0000;
pub const X_MEM_RESET: u32 = 0x0008_0000;
pub const X_MEM_TOP_DOWN: u32 = 0x0010_0000;
pub const X_MEM_NOZERO: u32 = 0x0080_0000;
pub const X_MEM_LARGE_PAGES: u32 = 0x2000_0000;
pub const X_MEM_16MB_PAGES: u32 = 0x8000_0000;

fn to_xdk_protect_flags(protect: Protect) -> u32 {
    let mut result = if !protect.contains(Protect::READ) && !protect.contains(Protect::WRITE) {
        X_PAGE_NOACCESS
    } else if protect.contains(Protect::READ) && !protect.contains(Protect::WRITE) {
        X_PAGE_READONLY
    } else {
        X_PAGE_READWRITE
    };
    if protect.contains(Protect::NO_CACHE) {
        result |= X_PAGE_NOCACHE;
    }
    if protect.contains(Protect::WRITE_COMBINE) {
        result |= X_PAGE_WRITECOMBINE;
    }
    result
}

fn from_xdk_protect_flags(protect: u32) -> Protect {
    let mut result = Protect::empty();
    if protect & (X_PAGE_READONLY | X_PAGE_EXECUTE_READ) != 0 {
        result |= Protect::READ;
    } else if protect & (X_PAGE_READWRITE | X_PAGE_EXECUTE_READWRITE) != 0 {
        result |= Protect::READ | Protect::WRITE;
    }
    if protect & X_PAGE_NOCACHE != 0 {
        result |= Protect::NO_CACHE;
    }
    if protect & X_PAGE_WRITECOMBINE != 0 {
        result |= Protect::WRITE_COMBINE;
    }
    result
}

fn status_from(err: VmError) -> u32 {
    match err {
        VmError::OutOfMemory => X_STATUS_NO_MEMORY,
        VmError::InvalidParameter => X_STATUS_INVALID_PARAMETER,
        VmError::AccessDenied => X_STATUS_ACCESS_DENIED,
        VmError::MemoryNotAllocated => X_STATUS_MEMORY_NOT_ALLOCATED,
        VmError::AlreadyCommitted => X_STATUS_ALREADY_COMMITTED,
        VmError::Host(_) => X_STATUS_UNSUCCESSFUL,
    }
}

fn round_up(value: u32, multiple: u32) -> u32 {
    value.div_ceil(multiple) * multiple
}

// ---------------------------------------------------------------------------
// Marshalling
// ---------------------------------------------------------------------------

/// Argument reader for the guest call convention: r3..r10, then 8-byte
/// stack slots at r1 + 0x54.
pub struct Args {
    next: usize,
    stack: u32,
}

impl Args {
    pub fn new(ctx: &GuestContext) -> Self {
        Self {
            next: 0,
            stack: ctx.r[1].u32(),
        }
    }

    pub fn dword(&mut self, ctx: &GuestContext, base: *mut u8) -> u32 {
        self.qword(ctx, base) as u32
    }

    pub fn qword(&mut self, ctx: &GuestContext, base: *mut u8) -> u64 {
        let idx = self.next;
        self.next += 1;
        if idx < 8 {
            ctx.r[3 + idx].u64()
        } else {
            guest::load_u64(base, self.stack + 0x54 + (idx as u32 - 8) * 8)
        }
    }
}

/// Guest pointer to a big-endian dword (lpdword_t). Address zero is the
/// null pointer.
#[derive(Clone, Copy)]
pub struct LpDword(pub u32);

impl LpDword {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn read(&self, base: *mut u8) -> u32 {
        guest::load_u32(base, self.0)
    }

    pub fn write(&self, base: *mut u8, value: u32) {
        guest::store_u32(base, self.0, value);
    }
}

/// dword_result: write a 32-bit result to r3.
pub fn ret(ctx: &mut GuestContext, value: u32) {
    ctx.r[3].set_u64(value as u64);
}

/// qword_result: write a 64-bit result to r3, with the low half mirrored
/// into r4 for call sites where the ABI splits it.
pub fn ret_qword(ctx: &mut GuestContext, value: u64) {
    ctx.r[3].set_u64(value);
    ctx.r[4].set_u64(value & 0xFFFF_FFFF);
}

// ---------------------------------------------------------------------------
// Kernel state
// ---------------------------------------------------------------------------

/// Process-lifetime kernel state: the memory manager plus the system-heap
/// bookkeeping used by the pool exports. Initialized before any guest
/// thread runs.
pub struct KernelState {
    memory: Memory,
    pool_sizes: Mutex<HashMap<u32, u32>>,
}

impl KernelState {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            memory: Memory::new()?,
            pool_sizes: Mutex::new(HashMap::new()),
        })
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Allocate from the small-page virtual heap on behalf of the kernel.
    pub fn system_heap_alloc(&self, size: u32, alignment: u32) -> u32 {
        let heap = match self.memory.lookup_heap_by_type(false, 0x1000) {
            Some(h) => h,
            None => return 0,
        };
        let size = round_up(size, heap.page_size());
        match heap.alloc_range(
            heap.heap_base(),
            heap.heap_base() + heap.heap_size() - 1,
            size,
            alignment.max(heap.page_size()),
            Allocation::RESERVE | Allocation::COMMIT,
            Protect::READ | Protect::WRITE,
            false,
        ) {
            Ok(addr) => {
                self.pool_sizes.lock().unwrap().insert(addr, size);
                addr
            }
            Err(err) => {
                log::error!("system heap alloc failed: {err}");
                0
            }
        }
    }

    pub fn system_heap_free(&self, addr: u32) {
        if self.pool_sizes.lock().unwrap().remove(&addr).is_none() {
            log::warn!("system heap free of unknown allocation {addr:#010x}");
        }
        if let Some(heap) = self.memory.lookup_heap(addr) {
            let _ = heap.release(addr, None);
        }
    }
}

static KERNEL: OnceLock<KernelState> = OnceLock::new();

/// Install the process kernel-state singleton. Returns the instance for
/// wiring into per-thread contexts.
pub fn install_kernel_state() -> io::Result<&'static KernelState> {
    if KERNEL.get().is_none() {
        let state = KernelState::new()?;
        let _ = KERNEL.set(state);
    }
    Ok(KERNEL.get().unwrap())
}

// ---------------------------------------------------------------------------
// Import registry
// ---------------------------------------------------------------------------

static IMPORTS: Mutex<Option<HashMap<&'static str, GuestFn>>> = Mutex::new(None);

/// Register a host implementation for a `__imp__` kernel symbol.
pub fn register_import(name: &'static str, f: GuestFn) {
    IMPORTS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .insert(name, f);
}

/// Call a kernel import by name. Emitted code resolves import thunks here;
/// a missing registration is a missing-function trap.
pub fn call_import(ctx: &mut GuestContext, base: *mut u8, name: &str) {
    let f = IMPORTS
        .lock()
        .unwrap()
        .as_ref()
        .and_then(|m| m.get(name).copied());
    match f {
        Some(f) => f(ctx, base),
        None => {
            log::error!("call to unregistered kernel import {name}");
            panic!("call to unregistered kernel import {name}");
        }
    }
}

/// Register the memory-family exports this crate implements.
pub fn register_memory_exports() {
    register_import("__imp__NtAllocateVirtualMemory", nt_allocate_virtual_memory);
    register_import("__imp__NtProtectVirtualMemory", nt_protect_virtual_memory);
    register_import("__imp__NtFreeVirtualMemory", nt_free_virtual_memory);
    register_import("__imp__NtQueryVirtualMemory", nt_query_virtual_memory);
    register_import(
        "__imp__MmAllocatePhysicalMemoryEx",
        mm_allocate_physical_memory_ex,
    );
    register_import("__imp__MmAllocatePhysicalMemory", mm_allocate_physical_memory);
    register_import("__imp__MmFreePhysicalMemory", mm_free_physical_memory);
    register_import("__imp__MmQueryAddressProtect", mm_query_address_protect);
    register_import("__imp__MmSetAddressProtect", mm_set_address_protect);
    register_import("__imp__MmQueryAllocationSize", mm_query_allocation_size);
    register_import("__imp__MmQueryStatistics", mm_query_statistics);
    register_import("__imp__MmGetPhysicalAddress", mm_get_physical_address);
    register_import("__imp__MmMapIoSpace", mm_map_io_space);
    register_import("__imp__ExAllocatePool", ex_allocate_pool);
    register_import(
        "__imp__ExAllocatePoolTypeWithTag",
        ex_allocate_pool_type_with_tag,
    );
    register_import("__imp__ExFreePool", ex_free_pool);
    register_import(
        "__imp__KeGetImagePageTableEntry",
        ke_get_image_page_table_entry,
    );
    register_import("__imp__KeLockL2", ke_lock_l2);
    register_import("__imp__KeUnlockL2", ke_unlock_l2);
    register_import("__imp__MmCreateKernelStack", mm_create_kernel_stack);
    register_import("__imp__MmDeleteKernelStack", mm_delete_kernel_stack);
}

// ---------------------------------------------------------------------------
// Nt* virtual memory
// ---------------------------------------------------------------------------

pub fn nt_allocate_virtual_memory(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_addr_ptr = LpDword(args.dword(ctx, base));
    let region_size_ptr = LpDword(args.dword(ctx, base));
    let alloc_type = args.dword(ctx, base);
    let protect_bits = args.dword(ctx, base);
    let debug_memory = args.dword(ctx, base);

    log::debug!(
        "NtAllocateVirtualMemory base={:#x} size={:#x} type={:#x} protect={:#x}",
        if base_addr_ptr.is_null() { 0 } else { base_addr_ptr.read(base) },
        if region_size_ptr.is_null() { 0 } else { region_size_ptr.read(base) },
        alloc_type,
        protect_bits
    );

    if debug_memory != 0 {
        log::warn!("attempted allocation to devkit memory area (debug_memory={debug_memory})");
    }

    if base_addr_ptr.is_null() || region_size_ptr.is_null() || region_size_ptr.read(base) == 0 {
        return ret(ctx, X_STATUS_INVALID_PARAMETER);
    }
    if alloc_type & (X_MEM_COMMIT | X_MEM_RESET | X_MEM_RESERVE) == 0 {
        return ret(ctx, X_STATUS_INVALID_PARAMETER);
    }
    // If MEM_RESET is set only MEM_RESET can be set.
    if alloc_type & X_MEM_RESET != 0 && alloc_type & !X_MEM_RESET != 0 {
        return ret(ctx, X_STATUS_INVALID_PARAMETER);
    }
    if alloc_type & X_MEM_RESET != 0 {
        // No title has needed it so far; behavior is unspecified.
        log::error!("X_MEM_RESET not implemented");
        return ret(ctx, X_STATUS_INVALID_PARAMETER);
    }
    if protect_bits
        & (X_PAGE_EXECUTE | X_PAGE_EXECUTE_READ | X_PAGE_EXECUTE_READWRITE | X_PAGE_EXECUTE_WRITECOPY)
        != 0
    {
        log::warn!("game setting EXECUTE bit on allocation");
    }

    let kernel = ctx.kernel_state();
    let memory = kernel.memory();

    let requested_base = base_addr_ptr.read(base);
    let page_size = if requested_base != 0 {
        // The heap of the given base decides; its page size wins over flags.
        match memory.lookup_heap(requested_base) {
            Some(h) if h.heap_type() == HeapType::Virtual => h.page_size(),
            _ => return ret(ctx, X_STATUS_INVALID_PARAMETER),
        }
    } else if alloc_type & X_MEM_LARGE_PAGES != 0 {
        64 * 1024
    } else {
        4 * 1024
    };

    let adjusted_base = requested_base - (requested_base % page_size);
    // Some games pass negative sizes.
    let raw_size = region_size_ptr.read(base);
    let adjusted_size = round_up(
        if (raw_size as i32) < 0 {
            (raw_size as i32).unsigned_abs()
        } else {
            raw_size
        },
        page_size,
    );

    let mut allocation = Allocation::empty();
    if alloc_type & X_MEM_RESERVE != 0 {
        allocation |= Allocation::RESERVE;
    }
    if alloc_type & X_MEM_COMMIT != 0 {
        allocation |= Allocation::COMMIT;
    }
    let protect = from_xdk_protect_flags(protect_bits);

    let mut was_committed = false;
    let (heap, address) = if adjusted_base != 0 {
        let heap = match memory.lookup_heap(adjusted_base) {
            Some(h) => h,
            None => return ret(ctx, X_STATUS_INVALID_PARAMETER),
        };
        if heap.page_size() != page_size {
            // Wrong page-size class for this heap.
            return ret(ctx, X_STATUS_ACCESS_DENIED);
        }
        was_committed = heap
            .query_region_info(adjusted_base)
            .map(|info| info.state.contains(Allocation::COMMIT))
            .unwrap_or(false);
        match heap.alloc_fixed(adjusted_base, adjusted_size, page_size, allocation, protect) {
            Ok(()) => (heap, adjusted_base),
            Err(err) => return ret(ctx, status_from(err)),
        }
    } else {
        let top_down = alloc_type & X_MEM_TOP_DOWN != 0;
        let heap = match memory.lookup_heap_by_type(false, page_size) {
            Some(h) => h,
            None => return ret(ctx, X_STATUS_INVALID_PARAMETER),
        };
        match heap.alloc(adjusted_size, page_size, allocation, protect, top_down) {
            Ok(addr) => (heap, addr),
            Err(err) => return ret(ctx, status_from(err)),
        }
    };

    // Zero on commit unless the title opted out. Zeroing a region the
    // caller asked to be write-protected needs a temporary elevation.
    if alloc_type & X_MEM_NOZERO == 0 && allocation.contains(Allocation::COMMIT) {
        if !protect.contains(Protect::WRITE) {
            let _ = heap.protect(address, adjusted_size, Protect::READ | Protect::WRITE, None);
        }
        if !was_committed {
            memory.zero(address, adjusted_size);
        }
        if !protect.contains(Protect::WRITE) {
            let _ = heap.protect(address, adjusted_size, protect, None);
        }
    }

    log::debug!("NtAllocateVirtualMemory = {address:#010x}");

    base_addr_ptr.write(base, address);
    region_size_ptr.write(base, adjusted_size);
    ret(ctx, X_STATUS_SUCCESS)
}

pub fn nt_protect_virtual_memory(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_addr_ptr = LpDword(args.dword(ctx, base));
    let region_size_ptr = LpDword(args.dword(ctx, base));
    let protect_bits = args.dword(ctx, base);
    let old_protect_ptr = LpDword(args.dword(ctx, base));
    let _debug_memory = args.dword(ctx, base);

    if base_addr_ptr.is_null() || region_size_ptr.is_null() || region_size_ptr.read(base) == 0 {
        return ret(ctx, X_STATUS_INVALID_PARAMETER);
    }
    if protect_bits
        & (X_PAGE_EXECUTE | X_PAGE_EXECUTE_READ | X_PAGE_EXECUTE_READWRITE | X_PAGE_EXECUTE_WRITECOPY)
        != 0
    {
        log::warn!("game setting EXECUTE bit on protect");
        return ret(ctx, X_STATUS_ACCESS_DENIED);
    }

    let memory = ctx.kernel_state().memory();
    let addr = base_addr_ptr.read(base);
    let heap = match memory.lookup_heap(addr) {
        Some(h) if h.heap_type() == HeapType::Virtual => h,
        _ => return ret(ctx, X_STATUS_INVALID_PARAMETER),
    };

    let adjusted_base = addr - (addr % heap.page_size());
    let adjusted_size = round_up(region_size_ptr.read(base), heap.page_size());
    let protect = from_xdk_protect_flags(protect_bits);

    let mut old = Protect::empty();
    if heap
        .protect(adjusted_base, adjusted_size, protect, Some(&mut old))
        .is_err()
    {
        return ret(ctx, X_STATUS_ACCESS_DENIED);
    }

    base_addr_ptr.write(base, adjusted_base);
    region_size_ptr.write(base, adjusted_size);
    if !old_protect_ptr.is_null() {
        old_protect_ptr.write(base, to_xdk_protect_flags(old));
    }
    ret(ctx, X_STATUS_SUCCESS)
}

pub fn nt_free_virtual_memory(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_addr_ptr = LpDword(args.dword(ctx, base));
    let region_size_ptr = LpDword(args.dword(ctx, base));
    let free_type = args.dword(ctx, base);
    let _debug_memory = args.dword(ctx, base);

    let base_addr_value = base_addr_ptr.read(base);
    let mut region_size_value = region_size_ptr.read(base);
    log::debug!(
        "NtFreeVirtualMemory base={base_addr_value:#x} size={region_size_value:#x} type={free_type:#x}"
    );

    if base_addr_value == 0 {
        return ret(ctx, X_STATUS_MEMORY_NOT_ALLOCATED);
    }

    let memory = ctx.kernel_state().memory();
    let heap = match memory.lookup_heap(base_addr_value) {
        Some(h) if h.heap_type() == HeapType::Virtual => h,
        _ => return ret(ctx, X_STATUS_INVALID_PARAMETER),
    };

    let result = if free_type == X_MEM_DECOMMIT {
        region_size_value = round_up(region_size_value, heap.page_size());
        heap.decommit(base_addr_value, region_size_value).err()
    } else {
        match heap.release(base_addr_value, None) {
            Ok(size) => {
                region_size_value = size;
                None
            }
            Err(err) => Some(err),
        }
    };
    if result.is_some() {
        return ret(ctx, X_STATUS_UNSUCCESSFUL);
    }

    base_addr_ptr.write(base, base_addr_value);
    region_size_ptr.write(base, region_size_value);
    ret(ctx, X_STATUS_SUCCESS)
}

pub fn nt_query_virtual_memory(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_address = args.dword(ctx, base);
    let info_ptr = args.dword(ctx, base);

    let memory = ctx.kernel_state().memory();
    let info = match memory
        .lookup_heap(base_address)
        .and_then(|h| h.query_region_info(base_address).ok())
    {
        Some(info) => info,
        None => return ret(ctx, X_STATUS_INVALID_PARAMETER),
    };

    let x_state = if info.state.contains(Allocation::COMMIT) {
        X_MEM_COMMIT
    } else if info.state.contains(Allocation::RESERVE) {
        X_MEM_RESERVE
    } else {
        X_MEM_FREE
    };

    // X_MEMORY_BASIC_INFORMATION, all fields big-endian.
    guest::store_u32(base, info_ptr, info.base_address);
    guest::store_u32(base, info_ptr + 4, info.allocation_base);
    guest::store_u32(base, info_ptr + 8, to_xdk_protect_flags(info.allocation_protect));
    guest::store_u32(base, info_ptr + 12, info.region_size);
    guest::store_u32(base, info_ptr + 16, x_state);
    guest::store_u32(base, info_ptr + 20, to_xdk_protect_flags(info.protect));
    guest::store_u32(base, info_ptr + 24, X_MEM_PRIVATE);

    ret(ctx, X_STATUS_SUCCESS)
}

// ---------------------------------------------------------------------------
// Mm* physical memory
// ---------------------------------------------------------------------------

pub fn mm_allocate_physical_memory_ex(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let flags = args.dword(ctx, base);
    let region_size = args.dword(ctx, base);
    let protect_bits = args.dword(ctx, base);
    let min_addr_range = args.dword(ctx, base);
    let max_addr_range = args.dword(ctx, base);
    let alignment = args.dword(ctx, base);

    log::debug!(
        "MmAllocatePhysicalMemoryEx flags={flags:#x} size={region_size:#x} protect={protect_bits:#x} \
         min={min_addr_range:#x} max={max_addr_range:#x} align={alignment:#x}"
    );

    if protect_bits & (X_PAGE_READONLY | X_PAGE_READWRITE) == 0 {
        log::error!("MmAllocatePhysicalMemoryEx: bad protection bits");
        return ret(ctx, 0);
    }

    // Page size: default 4 KiB, X_MEM_LARGE_PAGES 64 KiB, X_MEM_16MB_PAGES
    // 16 MiB. X_PAGE_NOCACHE/WRITECOMBINE ride along in protect_bits and
    // usually mark GPU-synchronized memory.
    let page_size = if protect_bits & X_MEM_LARGE_PAGES != 0 {
        64 * 1024
    } else if protect_bits & X_MEM_16MB_PAGES != 0 {
        16 * 1024 * 1024
    } else {
        4 * 1024
    };

    let adjusted_size = round_up(region_size, page_size);
    let adjusted_alignment = round_up(alignment.max(page_size), page_size);

    let memory = ctx.kernel_state().memory();
    let heap = match memory.lookup_heap_by_type(true, page_size) {
        Some(h) => h,
        None => return ret(ctx, 0),
    };

    // The caller's min/max are bounds in physical memory, not virtual.
    let heap_base = heap.heap_base();
    let heap_size = heap.heap_size();
    let physical_offset = memory.get_physical_address(heap_base);
    let heap_min = min_addr_range.saturating_sub(physical_offset);
    let heap_max = max_addr_range.saturating_sub(physical_offset);
    let heap_min_addr = heap_base + heap_min.min(heap_size - 1);
    let heap_max_addr = heap_base + heap_max.min(heap_size - 1);

    match heap.alloc_range(
        heap_min_addr,
        heap_max_addr,
        adjusted_size,
        adjusted_alignment,
        Allocation::RESERVE | Allocation::COMMIT,
        from_xdk_protect_flags(protect_bits),
        true,
    ) {
        Ok(addr) => {
            log::debug!("MmAllocatePhysicalMemoryEx = {addr:#010x}");
            ret(ctx, addr)
        }
        Err(_) => ret(ctx, 0),
    }
}

pub fn mm_allocate_physical_memory(ctx: &mut GuestContext, base: *mut u8) {
    // (flags, size, protect) forwarded with an unbounded address range.
    let mut args = Args::new(ctx);
    let _flags = args.dword(ctx, base);
    let _size = args.dword(ctx, base);
    let _protect = args.dword(ctx, base);
    ctx.r[6].set_u64(0);
    ctx.r[7].set_u64(0xFFFF_FFFF);
    ctx.r[8].set_u64(0);
    mm_allocate_physical_memory_ex(ctx, base)
}

pub fn mm_free_physical_memory(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let _type = args.dword(ctx, base);
    let base_address = args.dword(ctx, base);
    log::debug!("MmFreePhysicalMemory addr={base_address:#x}");

    if base_address & 0x1F != 0 {
        log::warn!("MmFreePhysicalMemory: misaligned base {base_address:#010x}");
    }

    let memory = ctx.kernel_state().memory();
    if let Some(heap) = memory.lookup_heap(base_address) {
        let _ = heap.release(base_address, None);
    }
}

pub fn mm_query_address_protect(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_address = args.dword(ctx, base);

    let memory = ctx.kernel_state().memory();
    let access = memory
        .lookup_heap(base_address)
        .and_then(|h| h.query_protect(base_address).ok())
        .map(to_xdk_protect_flags)
        .unwrap_or(0);
    ret(ctx, access)
}

pub fn mm_set_address_protect(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_address = args.dword(ctx, base);
    let region_size = args.dword(ctx, base);
    let protect_bits = args.dword(ctx, base);

    if protect_bits == 0 {
        log::error!("MmSetAddressProtect: incorrect protect_bits");
        return;
    }

    let memory = ctx.kernel_state().memory();
    if let Some(heap) = memory.lookup_heap(base_address) {
        let size = round_up(region_size, heap.page_size());
        if let Err(err) = heap.protect(base_address, size, from_xdk_protect_flags(protect_bits), None)
        {
            log::error!("MmSetAddressProtect failed: {err}");
        }
    }
}

pub fn mm_query_allocation_size(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_address = args.dword(ctx, base);

    let memory = ctx.kernel_state().memory();
    let size = memory
        .lookup_heap(base_address)
        .and_then(|h| h.query_size(base_address).ok())
        .unwrap_or(0);
    ret(ctx, size)
}

pub fn mm_query_statistics(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let stats_ptr = args.dword(ctx, base);
    if stats_ptr == 0 {
        return ret(ctx, X_STATUS_INVALID_PARAMETER);
    }

    // X_MM_QUERY_STATISTICS_RESULT is 104 bytes: header, title section,
    // system section, highest physical page.
    const RESULT_SIZE: u32 = 104;
    if guest::load_u32(base, stats_ptr) != RESULT_SIZE {
        return ret(ctx, X_STATUS_BUFFER_TOO_SMALL);
    }

    let memory = ctx.kernel_state().memory();

    // 512 MiB of physical memory in 4 KiB pages.
    let total_physical_pages: u32 = 0x0002_0000;
    let kernel_pages: u32 = 0x0000_0300;

    // Used pages derived from the live physical heaps, normalized to
    // 4 KiB page units.
    let mut used_pages: u32 = 0;
    for heap in memory.heaps() {
        if heap.heap_type() == HeapType::Physical {
            let used = heap.total_page_count() - heap.unreserved_page_count();
            used_pages += (used as u64 * heap.page_size() as u64 / 4096) as u32;
        }
    }
    let available = total_physical_pages.saturating_sub(used_pages);

    for off in (0..RESULT_SIZE).step_by(4) {
        guest::store_u32(base, stats_ptr + off, 0);
    }
    guest::store_u32(base, stats_ptr, RESULT_SIZE);
    guest::store_u32(base, stats_ptr + 4, total_physical_pages);
    guest::store_u32(base, stats_ptr + 8, kernel_pages);
    // Title section.
    guest::store_u32(base, stats_ptr + 12, available);
    guest::store_u32(base, stats_ptr + 16, 0x2FFF_0000); // total virtual bytes
    guest::store_u32(base, stats_ptr + 20, 0x0016_0000); // reserved virtual bytes
    guest::store_u32(base, stats_ptr + 24, used_pages.max(0x1000));
    guest::store_u32(base, stats_ptr + 28, 0x0000_0010); // pool pages
    guest::store_u32(base, stats_ptr + 32, 0x0000_0100); // stack pages
    guest::store_u32(base, stats_ptr + 36, 0x0000_0100); // image pages
    guest::store_u32(base, stats_ptr + 40, 0x0000_0100); // heap pages
    guest::store_u32(base, stats_ptr + 44, 0x0000_0100); // virtual pages
    guest::store_u32(base, stats_ptr + 48, 0x0000_0100); // page table pages
    guest::store_u32(base, stats_ptr + 52, 0x0000_0100); // cache pages
    // System section stays zero.
    guest::store_u32(base, stats_ptr + 100, total_physical_pages - 1);

    ret(ctx, X_STATUS_SUCCESS)
}

pub fn mm_get_physical_address(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_address = args.dword(ctx, base);

    let memory = ctx.kernel_state().memory();
    let mut physical = memory.get_physical_address(base_address);
    if physical == u32::MAX {
        log::warn!("MmGetPhysicalAddress of non-physical address {base_address:#010x}");
        physical = 0;
    }
    log::debug!("MmGetPhysicalAddress {base_address:#x} -> {physical:#x}");
    ret(ctx, physical)
}

pub fn mm_map_io_space(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let unk0 = args.dword(ctx, base);
    let src_address = args.dword(ctx, base);
    let size = args.dword(ctx, base);
    let flags = args.dword(ctx, base);

    // Only seen mapping XMA audio contexts; callers are satisfied with the
    // source address handed back.
    if unk0 != 2 || size != 0x40 || flags != 0x404 {
        log::warn!("MmMapIoSpace with unexpected arguments ({unk0:#x}, {size:#x}, {flags:#x})");
    }
    ret(ctx, src_address)
}

// ---------------------------------------------------------------------------
// Ex* pool
// ---------------------------------------------------------------------------

pub fn ex_allocate_pool_type_with_tag(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let size = args.dword(ctx, base);
    let _tag = args.dword(ctx, base);
    let _zero = args.dword(ctx, base);

    let (adjusted_size, alignment) = if size < 4 * 1024 {
        (round_up(size, 4 * 1024), 8u32)
    } else {
        (size, 4 * 1024)
    };

    let addr = ctx.kernel_state().system_heap_alloc(adjusted_size, alignment);
    ret(ctx, addr)
}

pub fn ex_allocate_pool(ctx: &mut GuestContext, base: *mut u8) {
    const TAG_NONE: u32 = 0x656E_6F4E; // 'None'
    let mut args = Args::new(ctx);
    let _size = args.dword(ctx, base);
    ctx.r[4].set_u64(TAG_NONE as u64);
    ctx.r[5].set_u64(0);
    ex_allocate_pool_type_with_tag(ctx, base)
}

pub fn ex_free_pool(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let base_address = args.dword(ctx, base);
    ctx.kernel_state().system_heap_free(base_address);
}

// ---------------------------------------------------------------------------
// Ke* / kernel stacks
// ---------------------------------------------------------------------------

pub fn ke_get_image_page_table_entry(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let _address = args.dword(ctx, base);
    // Correct semantics unknown; titles only test for non-zero.
    ret(ctx, 1)
}

pub fn ke_lock_l2(ctx: &mut GuestContext, _base: *mut u8) {
    ret(ctx, 0)
}

pub fn ke_unlock_l2(_ctx: &mut GuestContext, _base: *mut u8) {}

pub fn mm_create_kernel_stack(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let stack_size = args.dword(ctx, base);
    let r4 = args.dword(ctx, base);
    if r4 != 0 {
        log::warn!("MmCreateKernelStack: unknown second argument {r4:#x}");
    }

    let memory = ctx.kernel_state().memory();
    let heap = match memory.lookup_heap(0x7000_0000) {
        Some(h) => h,
        None => return ret(ctx, 0),
    };
    let aligned = round_up(round_up(stack_size, 0x1000), heap.page_size());
    let alignment = if stack_size & 0xF000 != 0 { 0x1000 } else { 0x1_0000 };

    match heap.alloc_range(
        0x7000_0000,
        0x7EFF_FFFF,
        aligned,
        alignment.max(heap.page_size()),
        Allocation::RESERVE | Allocation::COMMIT,
        Protect::READ | Protect::WRITE,
        false,
    ) {
        Ok(addr) => ret(ctx, addr + aligned),
        Err(err) => {
            log::error!("MmCreateKernelStack failed: {err}");
            ret(ctx, 0)
        }
    }
}

pub fn mm_delete_kernel_stack(ctx: &mut GuestContext, base: *mut u8) {
    let mut args = Args::new(ctx);
    let _stack_base = args.dword(ctx, base);
    let stack_end = args.dword(ctx, base);

    let memory = ctx.kernel_state().memory();
    let released = memory
        .lookup_heap(stack_end)
        .and_then(|h| h.release(stack_end, None).ok())
        .is_some();
    ret(
        ctx,
        if released {
            X_STATUS_SUCCESS
        } else {
            X_STATUS_UNSUCCESSFUL
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_flags_round_trip() {
        let cases = [
            (X_PAGE_READONLY, Protect::READ),
            (X_PAGE_READWRITE, Protect::READ | Protect::WRITE),
            (
                X_PAGE_READWRITE | X_PAGE_NOCACHE,
                Protect::READ | Protect::WRITE | Protect::NO_CACHE,
            ),
            (
                X_PAGE_READONLY | X_PAGE_WRITECOMBINE,
                Protect::READ | Protect::WRITE_COMBINE,
            ),
        ];
        for (xdk, abstracted) in cases {
            assert_eq!(from_xdk_protect_flags(xdk), abstracted);
            assert_eq!(to_xdk_protect_flags(abstracted), xdk);
        }
        assert_eq!(to_xdk_protect_flags(Protect::empty()), X_PAGE_NOACCESS);
    }

    #[test]
    fn vm_errors_map_to_ntstatus() {
        assert_eq!(status_from(VmError::OutOfMemory), X_STATUS_NO_MEMORY);
        assert_eq!(
            status_from(VmError::MemoryNotAllocated),
            X_STATUS_MEMORY_NOT_ALLOCATED
        );
        assert_eq!(status_from(VmError::AlreadyCommitted), X_STATUS_ALREADY_COMMITTED);
    }

    #[test]
    fn args_read_registers_then_stack() {
        let mut mem = vec![0u8; 0x10000];
        let base = mem.as_mut_ptr();
        let mut ctx = GuestContext::new();
        for i in 0..8 {
            ctx.r[3 + i].set_u64(100 + i as u64);
        }
        ctx.r[1].set_u32(0x8000);
        // Ninth argument lives on the guest stack at +0x54.
        guest::store_u64(base, 0x8000 + 0x54, 0xABCD);

        let mut args = Args::new(&ctx);
        for i in 0..8 {
            assert_eq!(args.dword(&ctx, base), 100 + i);
        }
        assert_eq!(args.dword(&ctx, base), 0xABCD);
    }
}
