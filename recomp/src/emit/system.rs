// System instruction builders: traps, special-register moves, CR logic,
// cache hints, and memory barriers.
//
// PPC trap instructions are assertion/debug checks. The TO field is a
// five-bit mask of trigger conditions; the unconditional encoding
// (twi 31, r0, imm) carries a trap service selector in the immediate.

use anyhow::{bail, Result};

use super::FnEmitter;
use crate::disasm::{Instruction, Opcode};

/// Build the trigger condition for a TO mask over the given signed and
/// unsigned operand expressions.
fn trap_condition(to: u32, s_lhs: &str, u_lhs: &str, s_rhs: &str, u_rhs: &str) -> String {
    let mut parts = Vec::new();
    if to & 0x10 != 0 {
        parts.push(format!("{s_lhs} < {s_rhs}"));
    }
    if to & 0x08 != 0 {
        parts.push(format!("{s_lhs} > {s_rhs}"));
    }
    if to & 0x04 != 0 {
        parts.push(format!("{s_lhs} == {s_rhs}"));
    }
    if to & 0x02 != 0 {
        parts.push(format!("{u_lhs} < {u_rhs}"));
    }
    if to & 0x01 != 0 {
        parts.push(format!("{u_lhs} > {u_rhs}"));
    }
    parts.join(" || ")
}

/// Conditional traps are inline assertions: they invoke the service call
/// and fall through; they never redirect the PC.
fn emit_trap(e: &mut FnEmitter, to: u32, s_lhs: String, u_lhs: String, s_rhs: String, u_rhs: String) {
    if to == 0 {
        return;
    }
    let cond = trap_condition(to, &s_lhs, &u_lhs, &s_rhs, &u_rhs);
    e.line(format!("if {cond} {{"));
    e.line("    traps::trap_service(ctx, base, 0);");
    e.line("}");
}

pub(super) fn emit(e: &mut FnEmitter, insn: &Instruction) -> Result<()> {
    use Opcode::*;
    let d = insn.operands[0];
    let a = insn.operands[1];
    let b = insn.operands[2];

    match insn.opcode {
        // No-ops and hints. sync/lwsync/eieio/isync are fences only on
        // weakly ordered hosts; the helper compiles away on x86-64.
        Nop | Attn | Db16cyc | Cctpl | Cctpm => {}
        Dcbf | Dcbt | Dcbtst | Dcbst | Icbi => {}
        Sync | Lwsync | Eieio | Isync => {
            e.line("guest::memory_fence();");
        }

        // Cache-line zero: compute the EA, align to the line size.
        Dcbz | Dcbzl => {
            let (mask, len) = if insn.opcode == Opcode::Dcbz {
                ("!31", 32)
            } else {
                ("!127", 128)
            };
            e.line(format!("let ea = {} & {mask};", e.ea_x(d, a)));
            e.line(format!("guest::zero_block(base, ea, {len});"));
        }

        // Traps.
        Twi => {
            let to = d;
            let ra = a;
            let simm = insn.operands[2] as i32;
            if to == 0x1F && ra == 0 {
                // Unconditional trap: service code in the immediate.
                e.line(format!(
                    "traps::trap_service(ctx, base, {});",
                    simm as u16
                ));
            } else {
                let s_lhs = format!("{}.s32()", e.r(ra));
                let u_lhs = format!("{}.u32()", e.r(ra));
                emit_trap(
                    e,
                    to,
                    s_lhs,
                    u_lhs,
                    format!("{simm}i32"),
                    format!("{:#x}u32", simm as u32),
                );
            }
        }
        Tdi => {
            let simm = insn.operands[2] as i32 as i64;
            let s_lhs = format!("{}.s64()", e.r(a));
            let u_lhs = format!("{}.u64()", e.r(a));
            emit_trap(
                e,
                d,
                s_lhs,
                u_lhs,
                format!("{simm}i64"),
                format!("{:#x}u64", simm as u64),
            );
        }
        Tw => {
            let (s_lhs, u_lhs) = (format!("{}.s32()", e.r(a)), format!("{}.u32()", e.r(a)));
            let (s_rhs, u_rhs) = (format!("{}.s32()", e.r(b)), format!("{}.u32()", e.r(b)));
            emit_trap(e, d, s_lhs, u_lhs, s_rhs, u_rhs);
        }
        Td => {
            let (s_lhs, u_lhs) = (format!("{}.s64()", e.r(a)), format!("{}.u64()", e.r(a)));
            let (s_rhs, u_rhs) = (format!("{}.s64()", e.r(b)), format!("{}.u64()", e.r(b)));
            emit_trap(e, d, s_lhs, u_lhs, s_rhs, u_rhs);
        }

        // CR field logic (operands are bit numbers 0..31).
        Crand | Crandc | Creqv | Crnand | Crnor | Cror | Crorc | Crxor => {
            let lhs = format!("ctx.cr[{}].bit({})", a / 4, a % 4);
            let rhs = format!("ctx.cr[{}].bit({})", b / 4, b % 4);
            let expr = match insn.opcode {
                Crand => format!("{lhs} & {rhs}"),
                Crandc => format!("{lhs} & !{rhs}"),
                Creqv => format!("!({lhs} ^ {rhs})"),
                Crnand => format!("!({lhs} & {rhs})"),
                Crnor => format!("!({lhs} | {rhs})"),
                Cror => format!("{lhs} | {rhs}"),
                Crorc => format!("{lhs} | !{rhs}"),
                _ => format!("{lhs} ^ {rhs}"),
            };
            e.line(format!("let v = {expr};"));
            e.line(format!("ctx.cr[{}].set_bit({}, v);", d / 4, d % 4));
        }
        Mcrf => {
            e.line(format!("{} = {};", e.cr(d), e.cr(a)));
        }

        // Condition-register moves.
        Mfcr => {
            e.line(format!("{}.set_u64(ctx.cr_bits() as u64);", e.r(d)));
        }
        Mfocrf => {
            // FXM is one-hot: bit 7 selects cr0 .. bit 0 selects cr7.
            let fxm = a;
            let field = (0..8).find(|i| fxm & (0x80 >> i) != 0).unwrap_or(0);
            let shift = 28 - 4 * field;
            e.line(format!(
                "{}.set_u64((ctx.cr_field_nibble({field}) as u64) << {shift});",
                e.r(d)
            ));
        }
        Mtcrf => {
            let fxm = a;
            if fxm == 0xFF {
                e.line(format!("ctx.set_cr_bits({}.u32());", e.r(d)));
            } else {
                for field in 0..8 {
                    if fxm & (0x80 >> field) != 0 {
                        let shift = 28 - 4 * field;
                        e.line(format!(
                            "ctx.set_cr_field({field}, ({}.u32() >> {shift}) & 0xF);",
                            e.r(d)
                        ));
                    }
                }
            }
        }

        // Link/count/fixed-point exception registers.
        Mflr => {
            if !e.config.skip_lr {
                e.line(format!("{}.set_u64(ctx.lr);", e.r(d)));
            }
        }
        Mtlr => {
            if !e.config.skip_lr {
                e.line(format!("ctx.lr = {}.u64();", e.r(d)));
            }
        }
        Mfctr => {
            e.line(format!("{}.set_u64(ctx.ctr.u64());", e.r(d)));
        }
        Mtctr => {
            e.line(format!("ctx.ctr.set_u64({}.u64());", e.r(d)));
        }
        Mfxer => {
            e.line(format!(
                "{}.set_u64(((ctx.xer.so as u64) << 31) | ((ctx.xer.ov as u64) << 30) | ((ctx.xer.ca as u64) << 29));",
                e.r(d)
            ));
        }
        Mtxer => {
            e.line(format!("ctx.xer.so = {}.u64() & 0x8000_0000 != 0;", e.r(d)));
            e.line(format!("ctx.xer.ov = {}.u64() & 0x4000_0000 != 0;", e.r(d)));
            e.line(format!("ctx.xer.ca = {}.u64() & 0x2000_0000 != 0;", e.r(d)));
        }

        // MSR models the EE bit as the process-wide cooperative lock.
        Mfmsr => {
            if !e.config.skip_msr {
                e.line("guest::memory_fence();");
                e.line(format!(
                    "{}.set_u64(sync::check_global_lock());",
                    e.r(d)
                ));
            }
        }
        Mtmsrd => {
            if !e.config.skip_msr {
                e.line("guest::memory_fence();");
                e.line(format!(
                    "ctx.msr = ({}.u32() & 0x8020) | (ctx.msr & !0x8020);",
                    e.r(d)
                ));
                // r13 enters the lock; any other source register leaves.
                if d == 13 {
                    e.line("sync::enter_global_lock();");
                } else {
                    e.line("sync::leave_global_lock();");
                }
            }
        }

        // Timebase: a 50 MHz guest tick counter behind the runtime.
        Mftb => {
            e.line(format!(
                "{}.set_u64(clock::query_guest_tick_count());",
                e.r(d)
            ));
        }

        // FPSCR crossings.
        Mffs => {
            e.line(format!(
                "{}.set_u64(ctx.fpscr.load_from_host());",
                e.f(d)
            ));
        }
        Mtfsf => {
            e.line(format!(
                "ctx.fpscr.store_from_guest({}.u32());",
                e.f(a)
            ));
        }

        other => bail!("system builder called for {other:?}"),
    }
    Ok(())
}
