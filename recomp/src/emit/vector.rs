// Vector (Altivec / VMX128) builders.
//
// Guest vectors use reversed element indexing relative to host lanes,
// which the runtime helpers encapsulate: shuffle and splat constants are
// precomputed against guest element numbers there. Saturating forms fold
// their clamp flag into the sticky vscr_sat bit; compare record forms
// set cr6 from the all-set / all-clear mask reductions.

use anyhow::{bail, Result};

use super::FnEmitter;
use crate::disasm::{Instruction, Opcode};

fn flush(e: &mut FnEmitter) {
    e.line("ctx.fpscr.set_host_flush_mode(true);");
}

/// vD = helper(vA, vB)
fn binary(e: &mut FnEmitter, insn: &Instruction, helper: &str) {
    e.line(format!(
        "{} = simd::{helper}({}, {});",
        e.v(insn.operands[0]),
        e.v(insn.operands[1]),
        e.v(insn.operands[2])
    ));
}

/// vD = helper(vB)
fn unary(e: &mut FnEmitter, insn: &Instruction, helper: &str) {
    e.line(format!(
        "{} = simd::{helper}({});",
        e.v(insn.operands[0]),
        e.v(insn.operands[1])
    ));
}

/// Saturating form: result plus the sticky saturation bit.
fn saturating(e: &mut FnEmitter, insn: &Instruction, helper: &str) {
    e.line(format!(
        "let (res, sat) = simd::{helper}({}, {});",
        e.v(insn.operands[1]),
        e.v(insn.operands[2])
    ));
    e.line(format!("{} = res;", e.v(insn.operands[0])));
    e.line("ctx.vscr_sat |= sat;");
}

/// Compare form: mask result, cr6 reductions on the record bit.
fn compare(e: &mut FnEmitter, insn: &Instruction, helper: &str) {
    e.line(format!(
        "let (res, all_set, all_clear) = simd::{helper}({}, {});",
        e.v(insn.operands[1]),
        e.v(insn.operands[2])
    ));
    e.line(format!("{} = res;", e.v(insn.operands[0])));
    if insn.rc() {
        e.line("ctx.cr[6].set_compare_mask(all_set, all_clear);");
    }
}

pub(super) fn emit(e: &mut FnEmitter, insn: &Instruction) -> Result<()> {
    use Opcode::*;
    let d = insn.operands[0];

    match insn.opcode {
        // FP arithmetic (flush mode synced first).
        Vaddfp => {
            flush(e);
            binary(e, insn, "vaddfp");
        }
        Vsubfp => {
            flush(e);
            binary(e, insn, "vsubfp");
        }
        Vmulfp128 => {
            flush(e);
            binary(e, insn, "vmulfp");
        }
        Vmaxfp => {
            flush(e);
            binary(e, insn, "vmaxfp");
        }
        Vminfp => {
            flush(e);
            binary(e, insn, "vminfp");
        }
        Vmaddfp | Vnmsubfp => {
            flush(e);
            let helper = if insn.opcode == Opcode::Vmaddfp {
                "vmaddfp"
            } else {
                "vnmsubfp"
            };
            e.line(format!(
                "{} = simd::{helper}({}, {}, {});",
                e.v(d),
                e.v(insn.operands[1]),
                e.v(insn.operands[2]),
                e.v(insn.operands[3])
            ));
        }
        Vrefp => {
            flush(e);
            unary(e, insn, "vrefp");
        }
        Vrsqrtefp => {
            flush(e);
            unary(e, insn, "vrsqrtefp");
        }
        Vexptefp => {
            flush(e);
            unary(e, insn, "vexptefp");
        }
        Vlogefp => {
            flush(e);
            unary(e, insn, "vlogefp");
        }
        Vrfim => {
            flush(e);
            unary(e, insn, "vrfim");
        }
        Vrfin => {
            flush(e);
            unary(e, insn, "vrfin");
        }
        Vrfip => {
            flush(e);
            unary(e, insn, "vrfip");
        }
        Vrfiz => {
            flush(e);
            unary(e, insn, "vrfiz");
        }
        Vmsum3fp128 => {
            flush(e);
            binary(e, insn, "vmsum3fp");
        }
        Vmsum4fp128 => {
            flush(e);
            binary(e, insn, "vmsum4fp");
        }

        // Integer arithmetic, modular.
        Vaddubm => binary(e, insn, "vaddubm"),
        Vadduhm => binary(e, insn, "vadduhm"),
        Vadduwm => binary(e, insn, "vadduwm"),
        Vsububm => binary(e, insn, "vsububm"),
        Vsubuhm => binary(e, insn, "vsubuhm"),
        Vsubuwm => binary(e, insn, "vsubuwm"),

        // Integer arithmetic, saturating.
        Vaddsbs => saturating(e, insn, "vaddsbs"),
        Vaddshs => saturating(e, insn, "vaddshs"),
        Vaddsws => saturating(e, insn, "vaddsws"),
        Vaddubs => saturating(e, insn, "vaddubs"),
        Vadduhs => saturating(e, insn, "vadduhs"),
        Vsububs => saturating(e, insn, "vsububs"),
        Vsubshs => saturating(e, insn, "vsubshs"),
        Vsubsws => saturating(e, insn, "vsubsws"),
        Vpkshus => saturating(e, insn, "vpkshus"),

        // Logic.
        Vand => binary(e, insn, "vand"),
        Vandc => binary(e, insn, "vandc"),
        Vor => binary(e, insn, "vor"),
        Vxor => binary(e, insn, "vxor"),
        Vnor => binary(e, insn, "vnor"),
        Vsel | Vperm => {
            let helper = if insn.opcode == Opcode::Vsel {
                "vsel"
            } else {
                "vperm"
            };
            e.line(format!(
                "{} = simd::{helper}({}, {}, {});",
                e.v(d),
                e.v(insn.operands[1]),
                e.v(insn.operands[2]),
                e.v(insn.operands[3])
            ));
        }
        Vsldoi => {
            e.line(format!(
                "{} = simd::vsldoi({}, {}, {});",
                e.v(d),
                e.v(insn.operands[1]),
                e.v(insn.operands[2]),
                insn.operands[3]
            ));
        }

        // Shifts.
        Vrlw => binary(e, insn, "vrlw"),
        Vslb => binary(e, insn, "vslb"),
        Vslh => binary(e, insn, "vslh"),
        Vslw => binary(e, insn, "vslw"),
        Vsl => binary(e, insn, "vsl"),
        Vsrh => binary(e, insn, "vsrh"),
        Vsrw => binary(e, insn, "vsrw"),
        Vsraw => binary(e, insn, "vsraw"),
        Vsr => binary(e, insn, "vsr"),
        Vslo => binary(e, insn, "vslo"),
        Vsro => binary(e, insn, "vsro"),

        // Splats and merges. The splat element is a guest element
        // number; the helper handles the lane reversal.
        Vspltb | Vsplth | Vspltw => {
            let helper = match insn.opcode {
                Opcode::Vspltb => "vspltb",
                Opcode::Vsplth => "vsplth",
                _ => "vspltw",
            };
            e.line(format!(
                "{} = simd::{helper}({}, {});",
                e.v(d),
                e.v(insn.operands[1]),
                insn.operands[2]
            ));
        }
        Vspltisb | Vspltish | Vspltisw => {
            let helper = match insn.opcode {
                Opcode::Vspltisb => "vspltisb",
                Opcode::Vspltish => "vspltish",
                _ => "vspltisw",
            };
            e.line(format!(
                "{} = simd::{helper}({}i32);",
                e.v(d),
                insn.operands[1] as i32
            ));
        }
        Vmrghw => binary(e, insn, "vmrghw"),
        Vmrglw => binary(e, insn, "vmrglw"),
        Vupkhsb => unary(e, insn, "vupkhsb"),
        Vupklsb => unary(e, insn, "vupklsb"),

        // Compares.
        Vcmpequb => compare(e, insn, "vcmpequb"),
        Vcmpequh => compare(e, insn, "vcmpequh"),
        Vcmpequw => compare(e, insn, "vcmpequw"),
        Vcmpgtub => compare(e, insn, "vcmpgtub"),
        Vcmpgtuw => compare(e, insn, "vcmpgtuw"),
        Vcmpgtsb => compare(e, insn, "vcmpgtsb"),
        Vcmpgtsh => compare(e, insn, "vcmpgtsh"),
        Vcmpgtsw => compare(e, insn, "vcmpgtsw"),
        Vcmpeqfp => compare(e, insn, "vcmpeqfp"),
        Vcmpgtfp => compare(e, insn, "vcmpgtfp"),
        Vcmpgefp => compare(e, insn, "vcmpgefp"),

        // Conversions. Saturating float-to-int forms feed vscr_sat.
        Vcfsx | Vcfux => {
            flush(e);
            let helper = if insn.opcode == Opcode::Vcfsx {
                "vcfsx"
            } else {
                "vcfux"
            };
            e.line(format!(
                "{} = simd::{helper}({}, {});",
                e.v(d),
                e.v(insn.operands[1]),
                insn.operands[2]
            ));
        }
        Vctsxs | Vctuxs => {
            flush(e);
            let helper = if insn.opcode == Opcode::Vctsxs {
                "vctsxs"
            } else {
                "vctuxs"
            };
            e.line(format!(
                "let (res, sat) = simd::{helper}({}, {});",
                e.v(insn.operands[1]),
                insn.operands[2]
            ));
            e.line(format!("{} = res;", e.v(d)));
            e.line("ctx.vscr_sat |= sat;");
        }

        other => bail!("vector builder called for {other:?}"),
    }
    Ok(())
}
