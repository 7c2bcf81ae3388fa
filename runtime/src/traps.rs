//! Trap service calls.
//!
//! PPC trap instructions raise a Program exception; the 360 kernel
//! inspects the trap type and dispatches. Unconditional traps
//! (`twi 31, r0, <imm>`) carry a service selector in the immediate:
//!
//!   20, 26  debug print (r3 = string pointer, r4 = length)
//!   0, 22   debug break
//!   25      no-op
//!
//! Conditional traps are inline assertions; execution always continues at
//! the next instruction.

use crate::context::GuestContext;
use crate::guest;

pub const TRAP_DEBUG_PRINT: u16 = 20;
pub const TRAP_DEBUG_PRINT_ALT: u16 = 26;
pub const TRAP_DEBUG_BREAK: u16 = 0;
pub const TRAP_DEBUG_BREAK_ALT: u16 = 22;
pub const TRAP_NOP: u16 = 25;

pub fn trap_service(ctx: &mut GuestContext, base: *mut u8, selector: u16) {
    match selector {
        TRAP_DEBUG_PRINT | TRAP_DEBUG_PRINT_ALT => {
            let text = guest::read_string(base, ctx.r[3].u32(), ctx.r[4].u16() as u32);
            log::debug!("(service trap) {text}");
        }
        TRAP_DEBUG_BREAK | TRAP_DEBUG_BREAK_ALT => {
            log::warn!("tw/td trap hit (type {selector})");
        }
        TRAP_NOP => {}
        _ => {
            log::warn!("unknown trap type {selector}");
        }
    }
}
