// Load/store builders.
//
// Byte accesses hit the arena directly. Half, word, and doubleword
// accesses go through the MMIO-checked helpers, which test the address
// against the 0x7F000000 window before touching memory; the physical
// heap offset is applied inside every helper, so nothing here computes
// it. Update forms write the effective address back to rA afterwards.

use anyhow::{bail, Result};

use super::FnEmitter;
use crate::disasm::{Instruction, Opcode};

/// Emit the effective-address temp for this access. Update forms always
/// use the register-relative form (rA = 0 is invalid for them).
fn emit_ea(e: &mut FnEmitter, insn: &Instruction, indexed: bool) {
    let a = insn.operands[1];
    let expr = if indexed {
        e.ea_x(a, insn.operands[2])
    } else {
        e.ea_d(a, insn.operands[2])
    };
    e.line(format!("let ea = {expr};"));
}

fn emit_update(e: &mut FnEmitter, insn: &Instruction) {
    let a = insn.operands[1];
    e.line(format!("{}.set_u64(ea as u64);", e.r(a)));
}

pub(super) fn emit(e: &mut FnEmitter, insn: &Instruction) -> Result<()> {
    use Opcode::*;
    let d = insn.operands[0];

    let indexed = matches!(
        insn.opcode,
        Lbzx | Lhzx | Lhax | Lwzx | Lwax | Ldx | Lhbrx | Lwbrx | Lfsx | Lfdx | Stbx | Sthx
            | Stwx | Stdx | Sthbrx | Stwbrx | Stfsx | Stfdx | Stfiwx | Lwarx | Ldarx
            | StwcxRecord | StdcxRecord | Lvx | Lvlx | Lvrx | Stvx | Stvlx | Stvrx | Lvsl | Lvsr
    );
    emit_ea(e, insn, indexed);

    match insn.opcode {
        // Loads
        Lbz | Lbzu | Lbzx => {
            e.line(format!(
                "{}.set_u64(guest::load_u8(base, ea) as u64);",
                e.r(d)
            ));
        }
        Lhz | Lhzu | Lhzx => {
            e.line(format!(
                "{}.set_u64(guest::load_u16_mmio(base, ea) as u64);",
                e.r(d)
            ));
        }
        Lha | Lhau | Lhax => {
            e.line(format!(
                "{}.set_s64(guest::load_u16_mmio(base, ea) as i16 as i64);",
                e.r(d)
            ));
        }
        Lwz | Lwzu | Lwzx => {
            e.line(format!(
                "{}.set_u64(guest::load_u32_mmio(base, ea) as u64);",
                e.r(d)
            ));
        }
        Lwa | Lwax => {
            e.line(format!(
                "{}.set_s64(guest::load_u32_mmio(base, ea) as i32 as i64);",
                e.r(d)
            ));
        }
        Ld | Ldu | Ldx => {
            e.line(format!(
                "{}.set_u64(guest::load_u64_mmio(base, ea));",
                e.r(d)
            ));
        }
        Lhbrx => {
            e.line(format!(
                "{}.set_u64(guest::load_u16_mmio(base, ea).swap_bytes() as u64);",
                e.r(d)
            ));
        }
        Lwbrx => {
            e.line(format!(
                "{}.set_u64(guest::load_u32_mmio(base, ea).swap_bytes() as u64);",
                e.r(d)
            ));
        }

        // Stores
        Stb | Stbu | Stbx => {
            e.line(format!("guest::store_u8(base, ea, {}.u8());", e.r(d)));
        }
        Sth | Sthu | Sthx => {
            e.line(format!(
                "guest::store_u16_mmio(base, ea, {}.u16());",
                e.r(d)
            ));
        }
        Stw | Stwu | Stwx => {
            e.line(format!(
                "guest::store_u32_mmio(base, ea, {}.u32());",
                e.r(d)
            ));
        }
        Std | Stdu | Stdx => {
            e.line(format!(
                "guest::store_u64_mmio(base, ea, {}.u64());",
                e.r(d)
            ));
        }
        Sthbrx => {
            e.line(format!(
                "guest::store_u16_mmio(base, ea, {}.u16().swap_bytes());",
                e.r(d)
            ));
        }
        Stwbrx => {
            e.line(format!(
                "guest::store_u32_mmio(base, ea, {}.u32().swap_bytes());",
                e.r(d)
            ));
        }

        // FP loads/stores (single precision widens to the double the FPR
        // actually holds)
        Lfs | Lfsu | Lfsx => {
            e.line(format!(
                "{}.set_f64(f32::from_bits(guest::load_u32_mmio(base, ea)) as f64);",
                e.f(d)
            ));
        }
        Lfd | Lfdu | Lfdx => {
            e.line(format!(
                "{}.set_u64(guest::load_u64_mmio(base, ea));",
                e.f(d)
            ));
        }
        Stfs | Stfsu | Stfsx => {
            e.line(format!(
                "guest::store_u32_mmio(base, ea, ({}.f64() as f32).to_bits());",
                e.f(d)
            ));
        }
        Stfd | Stfdu | Stfdx => {
            e.line(format!(
                "guest::store_u64_mmio(base, ea, {}.u64());",
                e.f(d)
            ));
        }
        Stfiwx => {
            e.line(format!(
                "guest::store_u32_mmio(base, ea, {}.u32());",
                e.f(d)
            ));
        }

        // Reservations. The reservation value lives in the context and
        // is consumed by the paired store-conditional's compare-and-swap.
        Lwarx => {
            e.line("ctx.reserved.set_u64(guest::load_u32(base, ea) as u64);");
            e.line(format!("{}.set_u64(ctx.reserved.u32() as u64);", e.r(d)));
        }
        Ldarx => {
            e.line("ctx.reserved.set_u64(guest::load_u64(base, ea));");
            e.line(format!("{}.set_u64(ctx.reserved.u64());", e.r(d)));
        }
        StwcxRecord => {
            e.line(format!(
                "let ok = guest::atomic_cas_u32(base, ea, ctx.reserved.u32(), {}.u32());",
                e.r(d)
            ));
            e.line("ctx.cr[0].lt = false;");
            e.line("ctx.cr[0].gt = false;");
            e.line("ctx.cr[0].eq = ok;");
            e.line("ctx.cr[0].so = ctx.xer.so;");
        }
        StdcxRecord => {
            e.line(format!(
                "let ok = guest::atomic_cas_u64(base, ea, ctx.reserved.u64(), {}.u64());",
                e.r(d)
            ));
            e.line("ctx.cr[0].lt = false;");
            e.line("ctx.cr[0].gt = false;");
            e.line("ctx.cr[0].eq = ok;");
            e.line("ctx.cr[0].so = ctx.xer.so;");
        }

        // Vector loads/stores. Alignment faults do not exist on this
        // part; the helpers mask the address down themselves.
        Lvx => {
            e.line(format!("{} = simd::load_vreg(base, ea);", e.v(d)));
        }
        Lvlx => {
            e.line(format!("{} = simd::load_vreg_left(base, ea);", e.v(d)));
        }
        Lvrx => {
            e.line(format!("{} = simd::load_vreg_right(base, ea);", e.v(d)));
        }
        Stvx => {
            e.line(format!("simd::store_vreg(base, ea, {});", e.v(d)));
        }
        Stvlx => {
            e.line(format!("simd::store_vreg_left(base, ea, {});", e.v(d)));
        }
        Stvrx => {
            e.line(format!("simd::store_vreg_right(base, ea, {});", e.v(d)));
        }
        Lvsl => {
            e.line(format!("{} = simd::lvsl(ea & 0xF);", e.v(d)));
        }
        Lvsr => {
            e.line(format!("{} = simd::lvsr(ea & 0xF);", e.v(d)));
        }

        other => bail!("memory builder called for {other:?}"),
    }

    if matches!(
        insn.opcode,
        Lbzu | Lhzu | Lhau | Lwzu | Ldu | Lfsu | Lfdu | Stbu | Sthu | Stwu | Stdu | Stfsu | Stfdu
    ) {
        emit_update(e, insn);
    }

    Ok(())
}
