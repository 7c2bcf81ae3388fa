//! Indirect-call dispatch.
//!
//! Recompiled images produce a flat `FUNC_MAPPINGS` array (guest address,
//! host function). At startup the runtime folds it into a dense table
//! indexed by `(pc - code_base) / 4`; computed branches (`bctr`, `bclr`
//! used as a tail call) and cross-image calls look the target up here.
//! The table is populated once and read-only afterwards.

use std::sync::OnceLock;

use crate::context::{GuestContext, GuestFn};

/// One entry of the emitter-generated mapping array.
#[derive(Clone, Copy)]
pub struct FuncMapping {
    pub guest: u32,
    pub host: GuestFn,
}

struct FuncTable {
    code_base: u32,
    slots: Vec<Option<GuestFn>>,
}

static TABLE: OnceLock<FuncTable> = OnceLock::new();

/// Build the dispatch table from the emitted mapping array. `code_base` and
/// `code_size` bound the image's executable range; mappings outside it are
/// rejected.
pub fn install(code_base: u32, code_size: u32, mappings: &[FuncMapping]) {
    let mut slots: Vec<Option<GuestFn>> = vec![None; (code_size / 4) as usize];
    for m in mappings {
        assert!(
            m.guest >= code_base && m.guest < code_base + code_size,
            "function mapping {:#010x} outside code range",
            m.guest
        );
        slots[((m.guest - code_base) / 4) as usize] = Some(m.host);
    }
    if TABLE.set(FuncTable { code_base, slots }).is_err() {
        panic!("dispatch table installed twice");
    }
}

/// Look up the host function for a guest PC, or None for an empty slot.
pub fn lookup(pc: u32) -> Option<GuestFn> {
    let table = TABLE.get()?;
    let idx = pc.checked_sub(table.code_base)? / 4;
    table.slots.get(idx as usize).copied().flatten()
}

/// Transfer control to a computed guest address. An unmapped target is a
/// missing-function trap: there is no interpreter to fall back to.
pub fn dispatch(ctx: &mut GuestContext, base: *mut u8, pc: u32) {
    match lookup(pc) {
        Some(f) => f(ctx, base),
        None => {
            log::error!("indirect call to unmapped guest address {pc:#010x}");
            panic!("indirect call to unmapped guest address {pc:#010x}");
        }
    }
}
