// Floating-point builders.
//
// Every FP-producing instruction is preceded by a host flush-mode sync
// so denormal handling matches the guest's fpscr NI bit. FPRs hold
// doubles; single-precision forms round the result through f32. Record
// forms on FP instructions copy exception state into cr1, which nothing
// we run has ever read, so they are emitted without it.

use anyhow::{bail, Result};

use super::FnEmitter;
use crate::disasm::{Instruction, Opcode};

fn flush(e: &mut FnEmitter) {
    e.line("ctx.fpscr.set_host_flush_mode(true);");
}

pub(super) fn emit(e: &mut FnEmitter, insn: &Instruction) -> Result<()> {
    use Opcode::*;
    let d = insn.operands[0];
    let a = insn.operands[1];
    let b = insn.operands[2];
    let c = insn.operands[3];

    match insn.opcode {
        // Moves and sign manipulation: pure bit operations, no flush.
        Fmr => {
            e.line(format!("{}.set_u64({}.u64());", e.f(d), e.f(a)));
        }
        Fneg => {
            e.line(format!(
                "{}.set_u64({}.u64() ^ 0x8000_0000_0000_0000);",
                e.f(d),
                e.f(a)
            ));
        }
        Fabs => {
            e.line(format!(
                "{}.set_u64({}.u64() & 0x7FFF_FFFF_FFFF_FFFF);",
                e.f(d),
                e.f(a)
            ));
        }
        Fnabs => {
            e.line(format!(
                "{}.set_u64({}.u64() | 0x8000_0000_0000_0000);",
                e.f(d),
                e.f(a)
            ));
        }

        // Double-precision arithmetic.
        Fadd => {
            flush(e);
            e.line(format!(
                "{}.set_f64({}.f64() + {}.f64());",
                e.f(d),
                e.f(a),
                e.f(b)
            ));
        }
        Fsub => {
            flush(e);
            e.line(format!(
                "{}.set_f64({}.f64() - {}.f64());",
                e.f(d),
                e.f(a),
                e.f(b)
            ));
        }
        Fmul => {
            flush(e);
            // A-form multiply takes frC, not frB.
            e.line(format!(
                "{}.set_f64({}.f64() * {}.f64());",
                e.f(d),
                e.f(a),
                e.f(c)
            ));
        }
        Fdiv => {
            flush(e);
            e.line(format!(
                "{}.set_f64({}.f64() / {}.f64());",
                e.f(d),
                e.f(a),
                e.f(b)
            ));
        }
        Fsqrt => {
            flush(e);
            e.line(format!("{}.set_f64({}.f64().sqrt());", e.f(d), e.f(b)));
        }
        Fmadd => {
            flush(e);
            e.line(format!(
                "{}.set_f64({}.f64() * {}.f64() + {}.f64());",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }
        Fmsub => {
            flush(e);
            e.line(format!(
                "{}.set_f64({}.f64() * {}.f64() - {}.f64());",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }
        Fnmadd => {
            flush(e);
            e.line(format!(
                "{}.set_f64(-({}.f64() * {}.f64() + {}.f64()));",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }
        Fnmsub => {
            flush(e);
            e.line(format!(
                "{}.set_f64(-({}.f64() * {}.f64() - {}.f64()));",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }

        // Single-precision arithmetic rounds through f32.
        Fadds => {
            flush(e);
            e.line(format!(
                "{}.set_f64(({}.f64() + {}.f64()) as f32 as f64);",
                e.f(d),
                e.f(a),
                e.f(b)
            ));
        }
        Fsubs => {
            flush(e);
            e.line(format!(
                "{}.set_f64(({}.f64() - {}.f64()) as f32 as f64);",
                e.f(d),
                e.f(a),
                e.f(b)
            ));
        }
        Fmuls => {
            flush(e);
            e.line(format!(
                "{}.set_f64(({}.f64() * {}.f64()) as f32 as f64);",
                e.f(d),
                e.f(a),
                e.f(c)
            ));
        }
        Fdivs => {
            flush(e);
            e.line(format!(
                "{}.set_f64(({}.f64() / {}.f64()) as f32 as f64);",
                e.f(d),
                e.f(a),
                e.f(b)
            ));
        }
        Fsqrts => {
            flush(e);
            e.line(format!(
                "{}.set_f64({}.f64().sqrt() as f32 as f64);",
                e.f(d),
                e.f(b)
            ));
        }
        Fmadds => {
            flush(e);
            e.line(format!(
                "{}.set_f64(({}.f64() * {}.f64() + {}.f64()) as f32 as f64);",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }
        Fmsubs => {
            flush(e);
            e.line(format!(
                "{}.set_f64(({}.f64() * {}.f64() - {}.f64()) as f32 as f64);",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }
        Fnmadds => {
            flush(e);
            e.line(format!(
                "{}.set_f64(-({}.f64() * {}.f64() + {}.f64()) as f32 as f64);",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }
        Fnmsubs => {
            flush(e);
            e.line(format!(
                "{}.set_f64(-({}.f64() * {}.f64() - {}.f64()) as f32 as f64);",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }

        // Estimates.
        Fres => {
            flush(e);
            e.line(format!(
                "{}.set_f64((1.0f32 / {}.f64() as f32) as f64);",
                e.f(d),
                e.f(b)
            ));
        }
        Frsqrte => {
            flush(e);
            e.line(format!(
                "{}.set_f64(1.0 / {}.f64().sqrt());",
                e.f(d),
                e.f(b)
            ));
        }

        // Select: fsel picks frC when frA >= 0 (or is a positive NaN's
        // quiet compare false path; hardware treats NaN as negative
        // path only when the compare fails).
        Fsel => {
            e.line(format!(
                "{}.set_f64(if {}.f64() >= 0.0 {{ {}.f64() }} else {{ {}.f64() }});",
                e.f(d),
                e.f(a),
                e.f(c),
                e.f(b)
            ));
        }

        // Conversions.
        Frsp => {
            flush(e);
            e.line(format!(
                "{}.set_f64({}.f64() as f32 as f64);",
                e.f(d),
                e.f(b)
            ));
        }
        Fctiw | Fctiwz => {
            // Round-to-nearest for fctiw, truncate for fctiwz; both
            // saturate and send NaN to i32::MIN like the hardware.
            let rounded = if insn.opcode == Opcode::Fctiw {
                "x.round_ties_even()"
            } else {
                "x.trunc()"
            };
            e.line(format!("let x = {}.f64();", e.f(b)));
            e.line(format!(
                "{}.set_u64(if x.is_nan() {{ i32::MIN as u32 as u64 }} else {{ ({rounded} as i32) as u32 as u64 }});",
                e.f(d)
            ));
        }
        Fctid | Fctidz => {
            let rounded = if insn.opcode == Opcode::Fctid {
                "x.round_ties_even()"
            } else {
                "x.trunc()"
            };
            e.line(format!("let x = {}.f64();", e.f(b)));
            e.line(format!(
                "{}.set_u64(if x.is_nan() {{ i64::MIN as u64 }} else {{ ({rounded} as i64) as u64 }});",
                e.f(d)
            ));
        }
        Fcfid => {
            flush(e);
            e.line(format!(
                "{}.set_f64({}.s64() as f64);",
                e.f(d),
                e.f(b)
            ));
        }

        // Compare (operands[0] = crf for fcmpu).
        Fcmpu => {
            e.line(format!(
                "{}.compare_f64({}.f64(), {}.f64());",
                e.cr(d),
                e.f(a),
                e.f(b)
            ));
        }

        other => bail!("fp builder called for {other:?}"),
    }
    Ok(())
}
