//! Host virtual-memory primitives.
//!
//! Emulates Windows VirtualAlloc semantics on POSIX hosts:
//! reserve = PROT_NONE anonymous private mapping, commit = mprotect to the
//! requested access, decommit = mprotect(PROT_NONE) + madvise(DONTNEED),
//! release = munmap. Fixed-address allocation never silently replaces an
//! existing mapping: MAP_FIXED_NOREPLACE is used where available, and a
//! commit that hits EEXIST (a prior reservation) is only downgraded to
//! mprotect after /proc/self/maps confirms the whole range is mapped.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageAccess {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ExecuteReadOnly,
    ExecuteReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationType {
    Reserve,
    Commit,
    ReserveCommit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeallocationType {
    Decommit,
    Release,
}

#[cfg(unix)]
pub use posix::*;

#[cfg(windows)]
pub use windows::*;

#[cfg(unix)]
mod posix {
    use super::*;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    pub fn allocation_granularity() -> usize {
        page_size()
    }

    fn to_prot(access: PageAccess) -> i32 {
        match access {
            PageAccess::NoAccess => libc::PROT_NONE,
            PageAccess::ReadOnly => libc::PROT_READ,
            PageAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            PageAccess::ExecuteReadOnly => libc::PROT_READ | libc::PROT_EXEC,
            PageAccess::ExecuteReadWrite => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    /// Reserve or commit a run at a fixed (or kernel-chosen) address.
    pub fn alloc_fixed(
        base: *mut u8,
        length: usize,
        allocation_type: AllocationType,
        access: PageAccess,
    ) -> Option<*mut u8> {
        let prot_requested = to_prot(access);
        let prot_initial = match allocation_type {
            AllocationType::Reserve => libc::PROT_NONE,
            AllocationType::Commit | AllocationType::ReserveCommit => prot_requested,
        };

        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        #[cfg(target_os = "linux")]
        if !base.is_null() {
            flags |= libc::MAP_FIXED_NOREPLACE;
        }

        let result = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                length,
                prot_initial,
                flags,
                -1,
                0,
            )
        };
        if result != libc::MAP_FAILED {
            return Some(result as *mut u8);
        }

        // EEXIST: the address already has a mapping, e.g. a prior reserve.
        // Commit-over-reservation is legal, but only after verifying the
        // whole range really is mapped, so mprotect cannot widen access on
        // an unrelated hole.
        #[cfg(target_os = "linux")]
        if std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST)
            && !base.is_null()
            && matches!(
                allocation_type,
                AllocationType::Commit | AllocationType::ReserveCommit
            )
            && is_range_fully_mapped(base, length)
        {
            let rc = unsafe { libc::mprotect(base as *mut libc::c_void, length, prot_requested) };
            if rc == 0 {
                return Some(base);
            }
        }

        None
    }

    pub fn dealloc_fixed(
        base: *mut u8,
        length: usize,
        deallocation_type: DeallocationType,
    ) -> bool {
        match deallocation_type {
            DeallocationType::Decommit => {
                // Remove access first, then hand the physical pages back.
                if unsafe { libc::mprotect(base as *mut libc::c_void, length, libc::PROT_NONE) }
                    != 0
                {
                    return false;
                }
                unsafe {
                    libc::madvise(base as *mut libc::c_void, length, libc::MADV_DONTNEED);
                }
                true
            }
            DeallocationType::Release => {
                unsafe { libc::munmap(base as *mut libc::c_void, length) == 0 }
            }
        }
    }

    pub fn protect(
        base: *mut u8,
        length: usize,
        access: PageAccess,
        out_old_access: Option<&mut PageAccess>,
    ) -> bool {
        if let Some(old) = out_old_access {
            *old = find_entry_for_address(base)
                .map(|e| e.access())
                .unwrap_or(PageAccess::NoAccess);
        }
        unsafe { libc::mprotect(base as *mut libc::c_void, length, to_prot(access)) == 0 }
    }

    /// Query the host mapping containing `base`: remaining length of the
    /// entry and its access. Only available where the mapping table is
    /// exposed (/proc/self/maps).
    pub fn query_protect(base: *mut u8) -> Option<(usize, PageAccess)> {
        let entry = find_entry_for_address(base)?;
        let addr = base as usize;
        Some((entry.end - addr, entry.access()))
    }

    #[derive(Default)]
    struct MapEntry {
        start: usize,
        end: usize,
        perms: [u8; 4],
    }

    impl MapEntry {
        fn access(&self) -> PageAccess {
            let r = self.perms[0] == b'r';
            let w = self.perms[1] == b'w';
            let x = self.perms[2] == b'x';
            match (r, w, x) {
                (false, false, false) => PageAccess::NoAccess,
                (_, true, true) => PageAccess::ExecuteReadWrite,
                (_, false, true) => PageAccess::ExecuteReadOnly,
                (_, true, false) => PageAccess::ReadWrite,
                (true, false, false) => PageAccess::ReadOnly,
                _ => PageAccess::NoAccess,
            }
        }
    }

    fn parse_maps_line(line: &str) -> Option<MapEntry> {
        // Format: "start-end perms offset dev inode path"
        let mut parts = line.split_whitespace();
        let range = parts.next()?;
        let perms = parts.next()?.as_bytes();
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if start >= end || perms.len() < 4 {
            return None;
        }
        let mut entry = MapEntry {
            start,
            end,
            perms: [0; 4],
        };
        entry.perms.copy_from_slice(&perms[..4]);
        Some(entry)
    }

    fn find_entry_for_address(address: *mut u8) -> Option<MapEntry> {
        let addr = address as usize;
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        maps.lines()
            .filter_map(parse_maps_line)
            .find(|e| addr >= e.start && addr < e.end)
    }

    /// Check that [base, base+length) is fully covered by existing host
    /// mappings, with no gaps.
    pub fn is_range_fully_mapped(base: *mut u8, length: usize) -> bool {
        if base.is_null() || length == 0 {
            return false;
        }
        let begin = base as usize;
        let end = match begin.checked_add(length) {
            Some(e) => e,
            None => return false,
        };
        let maps = match std::fs::read_to_string("/proc/self/maps") {
            Ok(m) => m,
            Err(_) => return false,
        };
        let mut cursor = begin;
        for entry in maps.lines().filter_map(parse_maps_line) {
            if entry.end <= cursor {
                continue;
            }
            if entry.start > cursor {
                return false; // gap
            }
            cursor = entry.end;
            if cursor >= end {
                return true;
            }
        }
        cursor >= end
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use core::ffi::c_void;

    // Hand-declared Win32 imports; the VMM state machine is a thin shadow
    // of the native semantics here.
    #[link(name = "kernel32")]
    extern "system" {
        fn VirtualAlloc(
            address: *mut c_void,
            size: usize,
            allocation_type: u32,
            protect: u32,
        ) -> *mut c_void;
        fn VirtualFree(address: *mut c_void, size: usize, free_type: u32) -> i32;
        fn VirtualProtect(
            address: *mut c_void,
            size: usize,
            new_protect: u32,
            old_protect: *mut u32,
        ) -> i32;
    }

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_DECOMMIT: u32 = 0x4000;
    const MEM_RELEASE: u32 = 0x8000;

    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READONLY: u32 = 0x02;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE_READ: u32 = 0x20;
    const PAGE_EXECUTE_READWRITE: u32 = 0x40;

    pub fn page_size() -> usize {
        4096
    }

    pub fn allocation_granularity() -> usize {
        0x10000
    }

    fn to_protect(access: PageAccess) -> u32 {
        match access {
            PageAccess::NoAccess => PAGE_NOACCESS,
            PageAccess::ReadOnly => PAGE_READONLY,
            PageAccess::ReadWrite => PAGE_READWRITE,
            PageAccess::ExecuteReadOnly => PAGE_EXECUTE_READ,
            PageAccess::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        }
    }

    fn from_protect(protect: u32) -> PageAccess {
        match protect & 0xFF {
            PAGE_READONLY => PageAccess::ReadOnly,
            PAGE_READWRITE => PageAccess::ReadWrite,
            PAGE_EXECUTE_READ => PageAccess::ExecuteReadOnly,
            PAGE_EXECUTE_READWRITE => PageAccess::ExecuteReadWrite,
            _ => PageAccess::NoAccess,
        }
    }

    pub fn alloc_fixed(
        base: *mut u8,
        length: usize,
        allocation_type: AllocationType,
        access: PageAccess,
    ) -> Option<*mut u8> {
        let ty = match allocation_type {
            AllocationType::Reserve => MEM_RESERVE,
            AllocationType::Commit => MEM_COMMIT,
            AllocationType::ReserveCommit => MEM_RESERVE | MEM_COMMIT,
        };
        let result =
            unsafe { VirtualAlloc(base as *mut c_void, length, ty, to_protect(access)) };
        if result.is_null() {
            None
        } else {
            Some(result as *mut u8)
        }
    }

    pub fn dealloc_fixed(
        base: *mut u8,
        length: usize,
        deallocation_type: DeallocationType,
    ) -> bool {
        let (size, ty) = match deallocation_type {
            DeallocationType::Decommit => (length, MEM_DECOMMIT),
            DeallocationType::Release => (0, MEM_RELEASE),
        };
        unsafe { VirtualFree(base as *mut c_void, size, ty) != 0 }
    }

    pub fn protect(
        base: *mut u8,
        length: usize,
        access: PageAccess,
        out_old_access: Option<&mut PageAccess>,
    ) -> bool {
        let mut old = 0u32;
        let ok =
            unsafe { VirtualProtect(base as *mut c_void, length, to_protect(access), &mut old) }
                != 0;
        if let Some(out) = out_old_access {
            *out = from_protect(old);
        }
        ok
    }

    pub fn query_protect(_base: *mut u8) -> Option<(usize, PageAccess)> {
        None
    }

    pub fn is_range_fully_mapped(_base: *mut u8, _length: usize) -> bool {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_commit_over_reservation() {
        let len = page_size() * 4;
        let base = alloc_fixed(std::ptr::null_mut(), len, AllocationType::Reserve, PageAccess::NoAccess)
            .expect("reserve");
        // Commit-over-existing-reserve takes the EEXIST/mprotect path on
        // Linux and must succeed at the same address.
        let committed = alloc_fixed(base, len, AllocationType::Commit, PageAccess::ReadWrite)
            .expect("commit over reserve");
        assert_eq!(committed, base);
        unsafe {
            *committed = 0xAB;
            assert_eq!(*committed, 0xAB);
        }
        assert!(dealloc_fixed(base, len, DeallocationType::Release));
    }

    #[test]
    fn decommit_keeps_address_reserved() {
        let len = page_size() * 2;
        let base = alloc_fixed(
            std::ptr::null_mut(),
            len,
            AllocationType::ReserveCommit,
            PageAccess::ReadWrite,
        )
        .expect("alloc");
        assert!(dealloc_fixed(base, len, DeallocationType::Decommit));
        // Still mapped (as PROT_NONE): full coverage check holds.
        assert!(is_range_fully_mapped(base, len));
        assert!(dealloc_fixed(base, len, DeallocationType::Release));
    }

    #[test]
    fn full_coverage_check_detects_gaps() {
        let len = page_size() * 4;
        let base = alloc_fixed(
            std::ptr::null_mut(),
            len,
            AllocationType::Reserve,
            PageAccess::NoAccess,
        )
        .expect("reserve");
        // Punch a hole in the middle.
        assert!(dealloc_fixed(
            unsafe { base.add(page_size()) },
            page_size(),
            DeallocationType::Release
        ));
        assert!(!is_range_fully_mapped(base, len));
        // Cleanup what remains.
        dealloc_fixed(base, page_size(), DeallocationType::Release);
        dealloc_fixed(
            unsafe { base.add(page_size() * 2) },
            page_size() * 2,
            DeallocationType::Release,
        );
    }
}
