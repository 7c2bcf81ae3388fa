// Integer arithmetic, logic, shift/rotate, and compare builders.
//
// Record forms compare the 64-bit result with zero and copy xer.so into
// cr0.so. Carry forms update xer.ca per the architectural rule; overflow
// forms update xer.ov with sticky xer.so through the xer helper.

use anyhow::{bail, Result};

use super::{emit_record, FnEmitter};
use crate::disasm::{Instruction, Opcode};

/// PPC 32-bit mask from mb..me in big-endian bit numbering (bit 0 is the
/// MSB). mb > me wraps.
fn mask32(mb: u32, me: u32) -> u32 {
    let x = 0xFFFF_FFFFu32 >> mb;
    let y = 0xFFFF_FFFFu32 << (31 - me);
    if mb <= me {
        x & y
    } else {
        x | y
    }
}

/// PPC 64-bit mask from mb..me.
fn mask64(mb: u32, me: u32) -> u64 {
    let x = u64::MAX >> mb;
    let y = u64::MAX << (63 - me);
    if mb <= me {
        x & y
    } else {
        x | y
    }
}

/// Signed immediate operand as an i64 literal.
fn simm(insn: &Instruction) -> i64 {
    insn.operands[2] as i32 as i64
}

/// Three-operand add/sub cores share the temp-and-overflow scaffolding.
fn emit_add_core(e: &mut FnEmitter, insn: &Instruction, d: u32, lhs: String, rhs: String) {
    if insn.oe() {
        e.line(format!("let a = {lhs};"));
        e.line(format!("let b = {rhs};"));
        e.line("let r = a.wrapping_add(b);");
        e.line(format!("{}.set_u64(r);", e.r(d)));
        e.line("ctx.xer.set_overflow((((a ^ r) & (b ^ r)) as i64) < 0);");
    } else {
        e.line(format!(
            "{}.set_u64({lhs}.wrapping_add({rhs}));",
            e.r(d)
        ));
    }
    emit_record(e, insn, d);
}

pub(super) fn emit(e: &mut FnEmitter, insn: &Instruction) -> Result<()> {
    let d = insn.operands[0];
    let a = insn.operands[1];
    let b = insn.operands[2];

    match insn.opcode {
        // ------------------------------------------------------------------
        // Add / subtract
        // ------------------------------------------------------------------
        Opcode::Add => {
            let lhs = format!("{}.u64()", e.r(a));
            let rhs = format!("{}.u64()", e.r(b));
            emit_add_core(e, insn, d, lhs, rhs);
        }
        Opcode::Addi => {
            if a == 0 {
                // li
                e.line(format!("{}.set_s64({}i64);", e.r(d), simm(insn)));
            } else {
                e.line(format!(
                    "{}.set_u64({}.u64().wrapping_add({}i64 as u64));",
                    e.r(d),
                    e.r(a),
                    simm(insn)
                ));
            }
        }
        Opcode::Addis => {
            let shifted = (simm(insn) << 16) as i64;
            if a == 0 {
                // lis
                e.line(format!("{}.set_s64({shifted}i64);", e.r(d)));
            } else {
                e.line(format!(
                    "{}.set_u64({}.u64().wrapping_add({shifted}i64 as u64));",
                    e.r(d),
                    e.r(a)
                ));
            }
        }
        Opcode::Addic | Opcode::AddicRecord => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line(format!("let r = a.wrapping_add({}i64 as u64);", simm(insn)));
            e.line(format!("{}.set_u64(r);", e.r(d)));
            e.line("ctx.xer.ca = r < a;");
            if insn.opcode == Opcode::AddicRecord {
                e.line(format!(
                    "ctx.cr[0].compare_s64({}.s64(), 0, &ctx.xer);",
                    e.r(d)
                ));
            }
        }
        Opcode::Addc => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line(format!("let b = {}.u64();", e.r(b)));
            e.line("let r = a.wrapping_add(b);");
            e.line(format!("{}.set_u64(r);", e.r(d)));
            e.line("ctx.xer.ca = r < a;");
            if insn.oe() {
                e.line("ctx.xer.set_overflow((((a ^ r) & (b ^ r)) as i64) < 0);");
            }
            emit_record(e, insn, d);
        }
        Opcode::Adde => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line(format!("let b = {}.u64();", e.r(b)));
            e.line("let (r1, c1) = a.overflowing_add(b);");
            e.line("let (r, c2) = r1.overflowing_add(ctx.xer.ca as u64);");
            e.line(format!("{}.set_u64(r);", e.r(d)));
            e.line("ctx.xer.ca = c1 || c2;");
            if insn.oe() {
                e.line("ctx.xer.set_overflow((((a ^ r) & (b ^ r)) as i64) < 0);");
            }
            emit_record(e, insn, d);
        }
        Opcode::Addze => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line("let (r, c) = a.overflowing_add(ctx.xer.ca as u64);");
            e.line(format!("{}.set_u64(r);", e.r(d)));
            e.line("ctx.xer.ca = c;");
            emit_record(e, insn, d);
        }
        Opcode::Addme => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line("let (r1, c1) = a.overflowing_add(ctx.xer.ca as u64);");
            e.line("let (r, c2) = r1.overflowing_add(u64::MAX);");
            e.line(format!("{}.set_u64(r);", e.r(d)));
            e.line("ctx.xer.ca = c1 || c2;");
            emit_record(e, insn, d);
        }
        Opcode::Subf => {
            // rD = rB - rA
            if insn.oe() {
                e.line(format!("let a = {}.u64();", e.r(a)));
                e.line(format!("let b = {}.u64();", e.r(b)));
                e.line("let r = b.wrapping_sub(a);");
                e.line(format!("{}.set_u64(r);", e.r(d)));
                e.line("ctx.xer.set_overflow((((a ^ b) & (b ^ r)) as i64) < 0);");
            } else {
                e.line(format!(
                    "{}.set_u64({}.u64().wrapping_sub({}.u64()));",
                    e.r(d),
                    e.r(b),
                    e.r(a)
                ));
            }
            emit_record(e, insn, d);
        }
        Opcode::Subfc => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line(format!("let b = {}.u64();", e.r(b)));
            e.line(format!("{}.set_u64(b.wrapping_sub(a));", e.r(d)));
            e.line("ctx.xer.ca = b >= a;");
            emit_record(e, insn, d);
        }
        Opcode::Subfe => {
            // rD = !rA + rB + ca
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line(format!("let b = {}.u64();", e.r(b)));
            e.line("let (r1, c1) = (!a).overflowing_add(b);");
            e.line("let (r, c2) = r1.overflowing_add(ctx.xer.ca as u64);");
            e.line(format!("{}.set_u64(r);", e.r(d)));
            e.line("ctx.xer.ca = c1 || c2;");
            emit_record(e, insn, d);
        }
        Opcode::Subfic => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line(format!("let imm = {}i64 as u64;", simm(insn)));
            e.line(format!("{}.set_u64(imm.wrapping_sub(a));", e.r(d)));
            e.line("ctx.xer.ca = a <= imm;");
        }
        Opcode::Subfze => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line("let (r, c) = (!a).overflowing_add(ctx.xer.ca as u64);");
            e.line(format!("{}.set_u64(r);", e.r(d)));
            e.line("ctx.xer.ca = c;");
            emit_record(e, insn, d);
        }
        Opcode::Subfme => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line("let (r1, c1) = (!a).overflowing_add(ctx.xer.ca as u64);");
            e.line("let (r, c2) = r1.overflowing_add(u64::MAX);");
            e.line(format!("{}.set_u64(r);", e.r(d)));
            e.line("ctx.xer.ca = c1 || c2;");
            emit_record(e, insn, d);
        }
        Opcode::Neg => {
            if insn.oe() {
                e.line(format!("let a = {}.u64();", e.r(a)));
                e.line(format!("{}.set_u64(a.wrapping_neg());", e.r(d)));
                e.line("ctx.xer.set_overflow(a == i64::MIN as u64);");
            } else {
                e.line(format!("{}.set_u64({}.u64().wrapping_neg());", e.r(d), e.r(a)));
            }
            emit_record(e, insn, d);
        }

        // ------------------------------------------------------------------
        // Multiply / divide
        // ------------------------------------------------------------------
        Opcode::Mulli => {
            e.line(format!(
                "{}.set_u64({}.u64().wrapping_mul({}i64 as u64));",
                e.r(d),
                e.r(a),
                simm(insn)
            ));
        }
        Opcode::Mullw => {
            if insn.oe() {
                e.line(format!(
                    "let r = {}.s32() as i64 * {}.s32() as i64;",
                    e.r(a),
                    e.r(b)
                ));
                e.line(format!("{}.set_s64(r);", e.r(d)));
                e.line("ctx.xer.set_overflow(r != r as i32 as i64);");
            } else {
                e.line(format!(
                    "{}.set_s64({}.s32() as i64 * {}.s32() as i64);",
                    e.r(d),
                    e.r(a),
                    e.r(b)
                ));
            }
            emit_record(e, insn, d);
        }
        Opcode::Mulhw => {
            e.line(format!(
                "{}.set_s64(({}.s32() as i64 * {}.s32() as i64) >> 32);",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Mulhwu => {
            e.line(format!(
                "{}.set_u64(({}.u32() as u64 * {}.u32() as u64) >> 32);",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Mulld => {
            e.line(format!(
                "{}.set_u64({}.u64().wrapping_mul({}.u64()));",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Mulhd => {
            e.line(format!(
                "{}.set_s64((({}.s64() as i128 * {}.s64() as i128) >> 64) as i64);",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Mulhdu => {
            e.line(format!(
                "{}.set_u64((({}.u64() as u128 * {}.u64() as u128) >> 64) as u64);",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Divw => {
            // Division faults on the host are pre-checked; the guest sees
            // an undefined (here: zero) result instead.
            e.line(format!("let a = {}.s32();", e.r(a)));
            e.line(format!("let b = {}.s32();", e.r(b)));
            e.line("let ok = b != 0 && !(a == i32::MIN && b == -1);");
            e.line(format!(
                "{}.set_s64(if ok {{ (a / b) as i64 }} else {{ 0 }});",
                e.r(d)
            ));
            if insn.oe() {
                e.line("ctx.xer.set_overflow(!ok);");
            }
            emit_record(e, insn, d);
        }
        Opcode::Divwu => {
            e.line(format!("let a = {}.u32();", e.r(a)));
            e.line(format!("let b = {}.u32();", e.r(b)));
            e.line(format!(
                "{}.set_u64(if b != 0 {{ (a / b) as u64 }} else {{ 0 }});",
                e.r(d)
            ));
            if insn.oe() {
                e.line("ctx.xer.set_overflow(b == 0);");
            }
            emit_record(e, insn, d);
        }
        Opcode::Divd => {
            e.line(format!("let a = {}.s64();", e.r(a)));
            e.line(format!("let b = {}.s64();", e.r(b)));
            e.line("let ok = b != 0 && !(a == i64::MIN && b == -1);");
            e.line(format!(
                "{}.set_s64(if ok {{ a / b }} else {{ 0 }});",
                e.r(d)
            ));
            if insn.oe() {
                e.line("ctx.xer.set_overflow(!ok);");
            }
            emit_record(e, insn, d);
        }
        Opcode::Divdu => {
            e.line(format!("let a = {}.u64();", e.r(a)));
            e.line(format!("let b = {}.u64();", e.r(b)));
            e.line(format!(
                "{}.set_u64(if b != 0 {{ a / b }} else {{ 0 }});",
                e.r(d)
            ));
            if insn.oe() {
                e.line("ctx.xer.set_overflow(b == 0);");
            }
            emit_record(e, insn, d);
        }

        // ------------------------------------------------------------------
        // Logic (dest in operands[0] = rA, source rS in operands[1])
        // ------------------------------------------------------------------
        Opcode::And => {
            e.line(format!(
                "{}.set_u64({}.u64() & {}.u64());",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Andc => {
            e.line(format!(
                "{}.set_u64({}.u64() & !{}.u64());",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Or => {
            e.line(format!(
                "{}.set_u64({}.u64() | {}.u64());",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Orc => {
            e.line(format!(
                "{}.set_u64({}.u64() | !{}.u64());",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Xor => {
            e.line(format!(
                "{}.set_u64({}.u64() ^ {}.u64());",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Nand => {
            e.line(format!(
                "{}.set_u64(!({}.u64() & {}.u64()));",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Nor => {
            e.line(format!(
                "{}.set_u64(!({}.u64() | {}.u64()));",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Eqv => {
            e.line(format!(
                "{}.set_u64(!({}.u64() ^ {}.u64()));",
                e.r(d),
                e.r(a),
                e.r(b)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Mr => {
            e.line(format!("{}.set_u64({}.u64());", e.r(d), e.r(a)));
            emit_record(e, insn, d);
        }
        Opcode::Ori => {
            e.line(format!("{}.set_u64({}.u64() | {:#x});", e.r(d), e.r(a), b));
        }
        Opcode::Oris => {
            e.line(format!(
                "{}.set_u64({}.u64() | {:#x});",
                e.r(d),
                e.r(a),
                (b as u64) << 16
            ));
        }
        Opcode::Xori => {
            e.line(format!("{}.set_u64({}.u64() ^ {:#x});", e.r(d), e.r(a), b));
        }
        Opcode::Xoris => {
            e.line(format!(
                "{}.set_u64({}.u64() ^ {:#x});",
                e.r(d),
                e.r(a),
                (b as u64) << 16
            ));
        }
        Opcode::AndiRecord | Opcode::AndisRecord => {
            let mask = if insn.opcode == Opcode::AndiRecord {
                b as u64
            } else {
                (b as u64) << 16
            };
            e.line(format!("{}.set_u64({}.u64() & {mask:#x});", e.r(d), e.r(a)));
            // andi./andis. always record.
            e.line(format!(
                "ctx.cr[0].compare_s64({}.s64(), 0, &ctx.xer);",
                e.r(d)
            ));
        }
        Opcode::Extsb => {
            e.line(format!("{}.set_s64({}.s8() as i64);", e.r(d), e.r(a)));
            emit_record(e, insn, d);
        }
        Opcode::Extsh => {
            e.line(format!("{}.set_s64({}.s16() as i64);", e.r(d), e.r(a)));
            emit_record(e, insn, d);
        }
        Opcode::Extsw => {
            e.line(format!("{}.set_s64({}.s32() as i64);", e.r(d), e.r(a)));
            emit_record(e, insn, d);
        }
        Opcode::Cntlzw => {
            e.line(format!(
                "{}.set_u64({}.u32().leading_zeros() as u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Cntlzd => {
            e.line(format!(
                "{}.set_u64({}.u64().leading_zeros() as u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }

        // ------------------------------------------------------------------
        // Shifts and rotates
        // ------------------------------------------------------------------
        Opcode::Slw => {
            e.line(format!("let sh = ({}.u64() & 0x3F) as u32;", e.r(b)));
            e.line(format!(
                "{}.set_u64(({}.u32() as u64).wrapping_shl(sh) as u32 as u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Srw => {
            e.line(format!("let sh = ({}.u64() & 0x3F) as u32;", e.r(b)));
            e.line(format!(
                "{}.set_u64(({}.u32() as u64).wrapping_shr(sh) as u32 as u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Sld => {
            e.line(format!("let sh = ({}.u64() & 0x7F) as u32;", e.r(b)));
            e.line(format!(
                "{}.set_u64({}.u64().checked_shl(sh).unwrap_or(0));",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Srd => {
            e.line(format!("let sh = ({}.u64() & 0x7F) as u32;", e.r(b)));
            e.line(format!(
                "{}.set_u64({}.u64().checked_shr(sh).unwrap_or(0));",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Sraw | Opcode::Srawi => {
            if insn.opcode == Opcode::Sraw {
                e.line(format!("let sh = ({}.u64() & 0x3F).min(32) as u32;", e.r(b)));
            } else {
                e.line(format!("let sh = {b}u32;"));
            }
            e.line(format!("let rs = {}.s32() as i64;", e.r(a)));
            e.line("ctx.xer.ca = rs < 0 && (rs & ((1i64 << sh) - 1)) != 0;");
            e.line(format!("{}.set_s64(rs >> sh);", e.r(d)));
            emit_record(e, insn, d);
        }
        Opcode::Srad | Opcode::Sradi => {
            if insn.opcode == Opcode::Srad {
                e.line(format!("let sh = ({}.u64() & 0x7F).min(64) as u32;", e.r(b)));
                e.line("let mask = if sh == 64 { u64::MAX } else { (1u64 << sh) - 1 };");
                e.line(format!("let rs = {}.s64();", e.r(a)));
                e.line("ctx.xer.ca = rs < 0 && (rs as u64 & mask) != 0;");
                e.line(format!(
                    "{}.set_s64(if sh == 64 {{ rs >> 63 }} else {{ rs >> sh }});",
                    e.r(d)
                ));
            } else {
                e.line(format!("let rs = {}.s64();", e.r(a)));
                e.line(format!(
                    "ctx.xer.ca = rs < 0 && (rs as u64 & {:#x}) != 0;",
                    (1u64 << b) - 1
                ));
                e.line(format!("{}.set_s64(rs >> {b});", e.r(d)));
            }
            emit_record(e, insn, d);
        }
        Opcode::Rlwinm => {
            let sh = insn.operands[2];
            let mask = mask32(insn.operands[3], insn.operands[4]);
            e.line(format!(
                "{}.set_u64(({}.u32().rotate_left({sh}) & {mask:#x}u32) as u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Rlwimi => {
            let sh = insn.operands[2];
            let mask = mask32(insn.operands[3], insn.operands[4]);
            e.line(format!(
                "let rot = ({}.u32().rotate_left({sh}) & {mask:#x}u32) as u64;",
                e.r(a)
            ));
            e.line(format!(
                "{}.set_u64(rot | ({}.u64() & !{mask:#x}u64));",
                e.r(d),
                e.r(d)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Rlwnm => {
            let mask = mask32(insn.operands[3], insn.operands[4]);
            e.line(format!("let sh = ({}.u64() & 0x1F) as u32;", e.r(b)));
            e.line(format!(
                "{}.set_u64(({}.u32().rotate_left(sh) & {mask:#x}u32) as u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Rldicl => {
            let sh = insn.operands[2];
            let mask = u64::MAX >> insn.operands[3];
            e.line(format!(
                "{}.set_u64({}.u64().rotate_left({sh}) & {mask:#x}u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Rldicr => {
            let sh = insn.operands[2];
            // Field carries me for this form.
            let mask = u64::MAX << (63 - insn.operands[3]);
            e.line(format!(
                "{}.set_u64({}.u64().rotate_left({sh}) & {mask:#x}u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Rldic => {
            let sh = insn.operands[2];
            let mask = mask64(insn.operands[3], 63 - sh);
            e.line(format!(
                "{}.set_u64({}.u64().rotate_left({sh}) & {mask:#x}u64);",
                e.r(d),
                e.r(a)
            ));
            emit_record(e, insn, d);
        }
        Opcode::Rldimi => {
            let sh = insn.operands[2];
            let mask = mask64(insn.operands[3], 63 - sh);
            e.line(format!(
                "let rot = {}.u64().rotate_left({sh}) & {mask:#x}u64;",
                e.r(a)
            ));
            e.line(format!(
                "{}.set_u64(rot | ({}.u64() & !{mask:#x}u64));",
                e.r(d),
                e.r(d)
            ));
            emit_record(e, insn, d);
        }

        // ------------------------------------------------------------------
        // Compares (operands[0] = crf)
        // ------------------------------------------------------------------
        Opcode::Cmpi => {
            if insn.l64() {
                e.line(format!(
                    "{}.compare_s64({}.s64(), {}i64, &ctx.xer);",
                    e.cr(d),
                    e.r(a),
                    simm(insn)
                ));
            } else {
                e.line(format!(
                    "{}.compare_s32({}.s32(), {}i32, &ctx.xer);",
                    e.cr(d),
                    e.r(a),
                    insn.operands[2] as i32
                ));
            }
        }
        Opcode::Cmp => {
            if insn.l64() {
                e.line(format!(
                    "{}.compare_s64({}.s64(), {}.s64(), &ctx.xer);",
                    e.cr(d),
                    e.r(a),
                    e.r(b)
                ));
            } else {
                e.line(format!(
                    "{}.compare_s32({}.s32(), {}.s32(), &ctx.xer);",
                    e.cr(d),
                    e.r(a),
                    e.r(b)
                ));
            }
        }
        Opcode::Cmpli => {
            if insn.l64() {
                e.line(format!(
                    "{}.compare_u64({}.u64(), {:#x}u64, &ctx.xer);",
                    e.cr(d),
                    e.r(a),
                    b
                ));
            } else {
                e.line(format!(
                    "{}.compare_u32({}.u32(), {:#x}u32, &ctx.xer);",
                    e.cr(d),
                    e.r(a),
                    b
                ));
            }
        }
        Opcode::Cmpl => {
            if insn.l64() {
                e.line(format!(
                    "{}.compare_u64({}.u64(), {}.u64(), &ctx.xer);",
                    e.cr(d),
                    e.r(a),
                    e.r(b)
                ));
            } else {
                e.line(format!(
                    "{}.compare_u32({}.u32(), {}.u32(), &ctx.xer);",
                    e.cr(d),
                    e.r(a),
                    e.r(b)
                ));
            }
        }

        other => bail!("integer builder called for {other:?}"),
    }
    Ok(())
}
