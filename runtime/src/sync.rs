//! Cross-thread guest primitives: the global MSR lock and the
//! setjmp/longjmp shim.
//!
//! The 360 kernel uses the MSR EE bit as a giant cooperative lock:
//! `mtmsrd` from r13 disables interrupts (enter), from any other register
//! re-enables them (leave). We model it as a re-entrant process-wide
//! critical section; `mfmsr` reports 0x8000 when unlocked and 0 when
//! locked.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::context::{GuestContext, GuestFn};

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

static LOCK: Mutex<LockState> = Mutex::new(LockState {
    owner: None,
    depth: 0,
});
static LOCK_CV: Condvar = Condvar::new();

/// mtmsrd from r13: enter the global critical section. Re-entrant.
pub fn enter_global_lock() {
    let me = thread::current().id();
    let mut state = LOCK.lock().unwrap();
    loop {
        match state.owner {
            Some(owner) if owner == me => {
                state.depth += 1;
                return;
            }
            None => {
                state.owner = Some(me);
                state.depth = 1;
                return;
            }
            Some(_) => {
                state = LOCK_CV.wait(state).unwrap();
            }
        }
    }
}

/// mtmsrd from any other register: leave the critical section.
pub fn leave_global_lock() {
    let me = thread::current().id();
    let mut state = LOCK.lock().unwrap();
    assert_eq!(
        state.owner,
        Some(me),
        "leave_global_lock without matching enter_global_lock"
    );
    state.depth -= 1;
    if state.depth == 0 {
        state.owner = None;
        LOCK_CV.notify_one();
    }
}

/// mfmsr: 0x8000 (EE set) when the lock is free, 0 when held.
pub fn check_global_lock() -> u64 {
    let state = LOCK.lock().unwrap();
    if state.depth == 0 {
        0x8000
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// setjmp/longjmp
//
// The guest jmp_buf layout stores PPC registers and cannot be consumed by
// the host, so the guest buffer address is used purely as a key; its
// contents are ignored. A diverted setjmp call site re-enters the rest of
// its function through a continuation closure, and longjmp unwinds to the
// nearest registration of the key. A longjmp whose key was never
// registered is undefined behavior in the guest, and aborts.
// ---------------------------------------------------------------------------

/// Unwind payload carried from a guest longjmp to its setjmp site.
pub struct GuestLongJmp {
    pub key: u32,
    pub val: i32,
}

thread_local! {
    static JMP_KEYS: RefCell<HashSet<u32>> = RefCell::new(HashSet::new());
}

/// Diverted guest setjmp. `r3` holds the guest jmp_buf address on entry;
/// the continuation is the remainder of the calling function, entered with
/// `r3` = 0 initially and the longjmp value on each non-local return.
pub fn guest_setjmp<F>(ctx: &mut GuestContext, base: *mut u8, cont: F)
where
    F: Fn(&mut GuestContext, *mut u8),
{
    let key = ctx.r[3].u32();
    JMP_KEYS.with(|k| k.borrow_mut().insert(key));
    ctx.r[3].set_u64(0);
    loop {
        match panic::catch_unwind(AssertUnwindSafe(|| cont(ctx, base))) {
            Ok(()) => break,
            Err(payload) => match payload.downcast::<GuestLongJmp>() {
                Ok(lj) if lj.key == key => {
                    // C semantics: longjmp(env, 0) makes setjmp return 1.
                    let val = if lj.val == 0 { 1 } else { lj.val };
                    ctx.r[3].set_u64(val as u32 as u64);
                }
                Ok(lj) => {
                    JMP_KEYS.with(|k| k.borrow_mut().remove(&key));
                    panic::resume_unwind(lj);
                }
                Err(other) => {
                    JMP_KEYS.with(|k| k.borrow_mut().remove(&key));
                    panic::resume_unwind(other);
                }
            },
        }
    }
    JMP_KEYS.with(|k| k.borrow_mut().remove(&key));
}

/// Diverted guest longjmp. `r3` holds the jmp_buf address, `r4` the value.
pub fn guest_longjmp(ctx: &mut GuestContext, _base: *mut u8) -> ! {
    let key = ctx.r[3].u32();
    let val = ctx.r[4].s32();
    let registered = JMP_KEYS.with(|k| k.borrow().contains(&key));
    if !registered {
        log::error!("guest longjmp with unregistered jmp_buf {key:#010x}");
        std::process::abort();
    }
    panic::panic_any(GuestLongJmp { key, val })
}

// ---------------------------------------------------------------------------
// Exception-handler wrappers (opt-in at codegen time)
// ---------------------------------------------------------------------------

static EXCEPTION_HANDLER: Mutex<Option<GuestFn>> = Mutex::new(None);

/// Register the guest exception-handler entry point wrapped functions
/// deliver host faults to.
pub fn set_exception_handler(handler: GuestFn) {
    *EXCEPTION_HANDLER.lock().unwrap() = Some(handler);
}

fn is_longjmp(payload: &(dyn Any + Send)) -> bool {
    payload.is::<GuestLongJmp>()
}

/// Structured-exception prologue emitted around each function when handler
/// generation is enabled. Longjmp unwinds pass through untouched; any
/// other panic is delivered to the registered guest handler, or rethrown
/// if none is installed.
pub fn with_exception_handler<F>(ctx: &mut GuestContext, base: *mut u8, body: F)
where
    F: FnOnce(&mut GuestContext, *mut u8),
{
    match panic::catch_unwind(AssertUnwindSafe(|| body(ctx, base))) {
        Ok(()) => {}
        Err(payload) if is_longjmp(payload.as_ref()) => panic::resume_unwind(payload),
        Err(payload) => {
            let handler = *EXCEPTION_HANDLER.lock().unwrap();
            match handler {
                Some(h) => {
                    log::warn!("host fault in guest code, delivering to guest handler");
                    h(ctx, base);
                }
                None => panic::resume_unwind(payload),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_lock_is_reentrant() {
        enter_global_lock();
        enter_global_lock();
        assert_eq!(check_global_lock(), 0);
        leave_global_lock();
        assert_eq!(check_global_lock(), 0);
        leave_global_lock();
        assert_eq!(check_global_lock(), 0x8000);
    }

    #[test]
    fn setjmp_then_longjmp_reenters_continuation() {
        let mut ctx = GuestContext::new();
        ctx.r[3].set_u32(0x7001_0000); // guest jmp_buf address = key
        let base = std::ptr::null_mut();
        guest_setjmp(&mut ctx, base, |ctx, base| {
            if ctx.r[3].u32() == 0 {
                // First entry: take the longjmp path.
                ctx.r[3].set_u32(0x7001_0000);
                ctx.r[4].set_s32(42);
                guest_longjmp(ctx, base);
            }
            // Second entry: observed the longjmp value.
            assert_eq!(ctx.r[3].u32(), 42);
            ctx.r[5].set_u32(1);
        });
        assert_eq!(ctx.r[5].u32(), 1);
    }

    #[test]
    fn longjmp_zero_returns_one() {
        let mut ctx = GuestContext::new();
        ctx.r[3].set_u32(0x7002_0000);
        let base = std::ptr::null_mut();
        guest_setjmp(&mut ctx, base, |ctx, base| {
            if ctx.r[3].u32() == 0 {
                ctx.r[3].set_u32(0x7002_0000);
                ctx.r[4].set_s32(0);
                guest_longjmp(ctx, base);
            }
            assert_eq!(ctx.r[3].u32(), 1);
        });
    }
}
