// disasm.rs - PowerPC (Xenon) disassembler
//
// Decodes 64-bit PowerPC instructions with Altivec and the VMX128
// extension into structured form for analysis and emission. All Xenon
// instructions are 4 bytes, big-endian.

use crate::image::CodeSection;
use anyhow::Result;

/// A decoded PPC instruction.
///
/// `operands` is filled per instruction form; the layout for each group
/// is documented on the decode helpers below. Flag bits (Rc, OE, AA, LK)
/// stay in `word` and are exposed through accessors.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    /// Virtual address.
    pub addr: u32,
    /// Raw instruction word (host order).
    pub word: u32,
    /// Decoded opcode.
    pub opcode: Opcode,
    /// Form-specific operand slots.
    pub operands: [u32; 5],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Integer arithmetic
    Add,
    Addc,
    Adde,
    Addi,
    Addic,
    AddicRecord,
    Addis,
    Addme,
    Addze,
    Subf,
    Subfc,
    Subfe,
    Subfic,
    Subfme,
    Subfze,
    Neg,
    Mulli,
    Mullw,
    Mulhw,
    Mulhwu,
    Mulld,
    Mulhd,
    Mulhdu,
    Divw,
    Divwu,
    Divd,
    Divdu,

    // Logical / bit ops
    And,
    Andc,
    AndiRecord,
    AndisRecord,
    Or,
    Orc,
    Ori,
    Oris,
    Xor,
    Xori,
    Xoris,
    Nand,
    Nor,
    Eqv,
    Mr,
    Extsb,
    Extsh,
    Extsw,
    Cntlzw,
    Cntlzd,

    // Shifts / rotates
    Slw,
    Srw,
    Sraw,
    Srawi,
    Sld,
    Srd,
    Srad,
    Sradi,
    Rlwinm,
    Rlwimi,
    Rlwnm,
    Rldicl,
    Rldicr,
    Rldic,
    Rldimi,

    // Compares
    Cmp,
    Cmpi,
    Cmpl,
    Cmpli,

    // Loads
    Lbz,
    Lbzu,
    Lbzx,
    Lhz,
    Lhzu,
    Lhzx,
    Lha,
    Lhau,
    Lhax,
    Lwz,
    Lwzu,
    Lwzx,
    Lwa,
    Lwax,
    Ld,
    Ldu,
    Ldx,
    Lhbrx,
    Lwbrx,
    Lfs,
    Lfsu,
    Lfsx,
    Lfd,
    Lfdu,
    Lfdx,

    // Stores
    Stb,
    Stbu,
    Stbx,
    Sth,
    Sthu,
    Sthx,
    Stw,
    Stwu,
    Stwx,
    Std,
    Stdu,
    Stdx,
    Sthbrx,
    Stwbrx,
    Stfs,
    Stfsu,
    Stfsx,
    Stfd,
    Stfdu,
    Stfdx,
    Stfiwx,

    // Atomics
    Lwarx,
    Ldarx,
    StwcxRecord,
    StdcxRecord,

    // Branches
    B,
    Bc,
    Bclr,
    Bcctr,
    Sc,

    // CR ops
    Crand,
    Crandc,
    Creqv,
    Crnand,
    Crnor,
    Cror,
    Crorc,
    Crxor,
    Mcrf,

    // System / special registers
    Mfcr,
    Mfocrf,
    Mtcrf,
    Mflr,
    Mtlr,
    Mfctr,
    Mtctr,
    Mfxer,
    Mtxer,
    Mfmsr,
    Mtmsrd,
    Mftb,
    Mffs,
    Mtfsf,
    Sync,
    Lwsync,
    Eieio,
    Isync,
    Nop,
    Attn,
    Db16cyc,
    Cctpl,
    Cctpm,
    Tdi,
    Twi,
    Td,
    Tw,
    Dcbf,
    Dcbt,
    Dcbtst,
    Dcbst,
    Dcbz,
    Dcbzl,
    Icbi,

    // Floating point
    Fmr,
    Fneg,
    Fabs,
    Fnabs,
    Fadd,
    Fadds,
    Fsub,
    Fsubs,
    Fmul,
    Fmuls,
    Fdiv,
    Fdivs,
    Fsqrt,
    Fsqrts,
    Fmadd,
    Fmadds,
    Fmsub,
    Fmsubs,
    Fnmadd,
    Fnmadds,
    Fnmsub,
    Fnmsubs,
    Fsel,
    Fres,
    Frsqrte,
    Frsp,
    Fctiw,
    Fctiwz,
    Fctid,
    Fctidz,
    Fcfid,
    Fcmpu,

    // Vector (Altivec)
    Vaddfp,
    Vsubfp,
    Vmaddfp,
    Vnmsubfp,
    Vmaxfp,
    Vminfp,
    Vrefp,
    Vrsqrtefp,
    Vexptefp,
    Vlogefp,
    Vrfim,
    Vrfin,
    Vrfip,
    Vrfiz,
    Vaddubm,
    Vadduhm,
    Vadduwm,
    Vaddubs,
    Vadduhs,
    Vaddsbs,
    Vaddshs,
    Vaddsws,
    Vsububm,
    Vsubuhm,
    Vsubuwm,
    Vsububs,
    Vsubshs,
    Vsubsws,
    Vand,
    Vandc,
    Vor,
    Vxor,
    Vnor,
    Vsel,
    Vperm,
    Vsldoi,
    Vrlw,
    Vslb,
    Vslh,
    Vslw,
    Vsl,
    Vsrh,
    Vsrw,
    Vsraw,
    Vsr,
    Vslo,
    Vsro,
    Vmrghw,
    Vmrglw,
    Vspltb,
    Vsplth,
    Vspltw,
    Vspltisb,
    Vspltish,
    Vspltisw,
    Vpkshus,
    Vupkhsb,
    Vupklsb,
    Vcmpequb,
    Vcmpequh,
    Vcmpequw,
    Vcmpgtub,
    Vcmpgtuw,
    Vcmpgtsb,
    Vcmpgtsh,
    Vcmpgtsw,
    Vcmpeqfp,
    Vcmpgtfp,
    Vcmpgefp,
    Vcfsx,
    Vcfux,
    Vctsxs,
    Vctuxs,
    Lvx,
    Lvlx,
    Lvrx,
    Stvx,
    Stvlx,
    Stvrx,
    Lvsl,
    Lvsr,

    // VMX128
    Vmulfp128,
    Vmsum3fp128,
    Vmsum4fp128,

    // Undecodable
    Unknown,
}

impl Opcode {
    /// Conditional or unconditional branch?
    pub fn is_branch(&self) -> bool {
        matches!(self, Opcode::B | Opcode::Bc | Opcode::Bclr | Opcode::Bcctr)
    }

    /// Ends a basic block?
    pub fn is_terminator(&self) -> bool {
        self.is_branch() || matches!(self, Opcode::Sc)
    }

    pub fn is_trap(&self) -> bool {
        matches!(self, Opcode::Twi | Opcode::Tdi | Opcode::Tw | Opcode::Td)
    }
}

impl Instruction {
    /// Record bit (the `.` suffix).
    #[inline]
    pub fn rc(&self) -> bool {
        self.word & 1 != 0
    }

    /// Overflow-enable bit (the `o` suffix on XO-form arithmetic).
    #[inline]
    pub fn oe(&self) -> bool {
        self.word & 0x400 != 0
    }

    /// Link bit on branches.
    #[inline]
    pub fn lk(&self) -> bool {
        self.word & 1 != 0
    }

    /// Absolute-address bit on branches.
    #[inline]
    pub fn aa(&self) -> bool {
        self.word & 2 != 0
    }

    /// L bit on compares: doubleword when set, word otherwise.
    #[inline]
    pub fn l64(&self) -> bool {
        (self.word >> 21) & 1 != 0
    }
}

/// Disassemble a code section. Every word decodes to an `Instruction`;
/// reserved encodings come back as `Opcode::Unknown` and are resolved (or
/// rejected) by the analyzer.
pub fn disassemble(section: &CodeSection) -> Result<Vec<Instruction>> {
    if section.vaddr % 4 != 0 {
        anyhow::bail!(
            "code section {} at {:#x} is not word aligned",
            section.name,
            section.vaddr
        );
    }
    let mut out = Vec::with_capacity(section.data.len() / 4);
    for (i, chunk) in section.data.chunks_exact(4).enumerate() {
        let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let addr = section.vaddr + (i as u32) * 4;
        out.push(decode(addr, word));
    }
    Ok(out)
}

#[inline]
fn rt(w: u32) -> u32 {
    (w >> 21) & 0x1F
}

#[inline]
fn ra(w: u32) -> u32 {
    (w >> 16) & 0x1F
}

#[inline]
fn rb(w: u32) -> u32 {
    (w >> 11) & 0x1F
}

#[inline]
fn simm(w: u32) -> u32 {
    (w as u16 as i16 as i32) as u32
}

#[inline]
fn uimm(w: u32) -> u32 {
    w & 0xFFFF
}

fn insn(addr: u32, word: u32, opcode: Opcode, operands: [u32; 5]) -> Instruction {
    Instruction {
        addr,
        word,
        opcode,
        operands,
    }
}

/// Decode one instruction word.
pub fn decode(addr: u32, w: u32) -> Instruction {
    let primary = w >> 26;
    match primary {
        2 => insn(addr, w, Opcode::Tdi, [rt(w), ra(w), simm(w), 0, 0]),
        3 => insn(addr, w, Opcode::Twi, [rt(w), ra(w), simm(w), 0, 0]),
        7 => insn(addr, w, Opcode::Mulli, [rt(w), ra(w), simm(w), 0, 0]),
        8 => insn(addr, w, Opcode::Subfic, [rt(w), ra(w), simm(w), 0, 0]),
        10 => insn(addr, w, Opcode::Cmpli, [rt(w) >> 2, ra(w), uimm(w), 0, 0]),
        11 => insn(addr, w, Opcode::Cmpi, [rt(w) >> 2, ra(w), simm(w), 0, 0]),
        12 => insn(addr, w, Opcode::Addic, [rt(w), ra(w), simm(w), 0, 0]),
        13 => insn(addr, w, Opcode::AddicRecord, [rt(w), ra(w), simm(w), 0, 0]),
        14 => insn(addr, w, Opcode::Addi, [rt(w), ra(w), simm(w), 0, 0]),
        15 => insn(addr, w, Opcode::Addis, [rt(w), ra(w), simm(w), 0, 0]),
        16 => {
            // bc BO,BI,target
            let bd = ((w & 0xFFFC) as i16 as i32) as u32;
            let target = if w & 2 != 0 { bd } else { addr.wrapping_add(bd) };
            insn(addr, w, Opcode::Bc, [rt(w), ra(w), target, 0, 0])
        }
        17 => insn(addr, w, Opcode::Sc, [0; 5]),
        18 => {
            let li = if w & 0x0200_0000 != 0 {
                (w & 0x03FF_FFFC) | 0xFC00_0000
            } else {
                w & 0x03FF_FFFC
            };
            let target = if w & 2 != 0 { li } else { addr.wrapping_add(li) };
            insn(addr, w, Opcode::B, [target, 0, 0, 0, 0])
        }
        19 => decode_19(addr, w),
        20 => insn(
            addr,
            w,
            Opcode::Rlwimi,
            [ra(w), rt(w), rb(w), (w >> 6) & 0x1F, (w >> 1) & 0x1F],
        ),
        21 => insn(
            addr,
            w,
            Opcode::Rlwinm,
            [ra(w), rt(w), rb(w), (w >> 6) & 0x1F, (w >> 1) & 0x1F],
        ),
        23 => insn(
            addr,
            w,
            Opcode::Rlwnm,
            [ra(w), rt(w), rb(w), (w >> 6) & 0x1F, (w >> 1) & 0x1F],
        ),
        24 => {
            if w == 0x6000_0000 {
                insn(addr, w, Opcode::Nop, [0; 5])
            } else {
                insn(addr, w, Opcode::Ori, [ra(w), rt(w), uimm(w), 0, 0])
            }
        }
        25 => insn(addr, w, Opcode::Oris, [ra(w), rt(w), uimm(w), 0, 0]),
        26 => insn(addr, w, Opcode::Xori, [ra(w), rt(w), uimm(w), 0, 0]),
        27 => insn(addr, w, Opcode::Xoris, [ra(w), rt(w), uimm(w), 0, 0]),
        28 => insn(addr, w, Opcode::AndiRecord, [ra(w), rt(w), uimm(w), 0, 0]),
        29 => insn(addr, w, Opcode::AndisRecord, [ra(w), rt(w), uimm(w), 0, 0]),
        30 => decode_30(addr, w),
        31 => decode_31(addr, w),
        32 => insn(addr, w, Opcode::Lwz, [rt(w), ra(w), simm(w), 0, 0]),
        33 => insn(addr, w, Opcode::Lwzu, [rt(w), ra(w), simm(w), 0, 0]),
        34 => insn(addr, w, Opcode::Lbz, [rt(w), ra(w), simm(w), 0, 0]),
        35 => insn(addr, w, Opcode::Lbzu, [rt(w), ra(w), simm(w), 0, 0]),
        36 => insn(addr, w, Opcode::Stw, [rt(w), ra(w), simm(w), 0, 0]),
        37 => insn(addr, w, Opcode::Stwu, [rt(w), ra(w), simm(w), 0, 0]),
        38 => insn(addr, w, Opcode::Stb, [rt(w), ra(w), simm(w), 0, 0]),
        39 => insn(addr, w, Opcode::Stbu, [rt(w), ra(w), simm(w), 0, 0]),
        40 => insn(addr, w, Opcode::Lhz, [rt(w), ra(w), simm(w), 0, 0]),
        41 => insn(addr, w, Opcode::Lhzu, [rt(w), ra(w), simm(w), 0, 0]),
        42 => insn(addr, w, Opcode::Lha, [rt(w), ra(w), simm(w), 0, 0]),
        43 => insn(addr, w, Opcode::Lhau, [rt(w), ra(w), simm(w), 0, 0]),
        44 => insn(addr, w, Opcode::Sth, [rt(w), ra(w), simm(w), 0, 0]),
        45 => insn(addr, w, Opcode::Sthu, [rt(w), ra(w), simm(w), 0, 0]),
        48 => insn(addr, w, Opcode::Lfs, [rt(w), ra(w), simm(w), 0, 0]),
        49 => insn(addr, w, Opcode::Lfsu, [rt(w), ra(w), simm(w), 0, 0]),
        50 => insn(addr, w, Opcode::Lfd, [rt(w), ra(w), simm(w), 0, 0]),
        51 => insn(addr, w, Opcode::Lfdu, [rt(w), ra(w), simm(w), 0, 0]),
        52 => insn(addr, w, Opcode::Stfs, [rt(w), ra(w), simm(w), 0, 0]),
        53 => insn(addr, w, Opcode::Stfsu, [rt(w), ra(w), simm(w), 0, 0]),
        54 => insn(addr, w, Opcode::Stfd, [rt(w), ra(w), simm(w), 0, 0]),
        55 => insn(addr, w, Opcode::Stfdu, [rt(w), ra(w), simm(w), 0, 0]),
        58 => {
            // DS-form: ld / ldu / lwa
            let ds = ((w & 0xFFFC) as i16 as i32) as u32;
            match w & 3 {
                0 => insn(addr, w, Opcode::Ld, [rt(w), ra(w), ds, 0, 0]),
                1 => insn(addr, w, Opcode::Ldu, [rt(w), ra(w), ds, 0, 0]),
                2 => insn(addr, w, Opcode::Lwa, [rt(w), ra(w), ds, 0, 0]),
                _ => insn(addr, w, Opcode::Unknown, [0; 5]),
            }
        }
        59 => decode_59(addr, w),
        62 => {
            let ds = ((w & 0xFFFC) as i16 as i32) as u32;
            match w & 3 {
                0 => insn(addr, w, Opcode::Std, [rt(w), ra(w), ds, 0, 0]),
                1 => insn(addr, w, Opcode::Stdu, [rt(w), ra(w), ds, 0, 0]),
                _ => insn(addr, w, Opcode::Unknown, [0; 5]),
            }
        }
        63 => decode_63(addr, w),
        4 => decode_vmx(addr, w),
        5 => decode_vmx128(addr, w),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

/// Opcode 19: CR logic, branches through LR/CTR, isync.
fn decode_19(addr: u32, w: u32) -> Instruction {
    let xo = (w >> 1) & 0x3FF;
    let crops = [rt(w), ra(w), rb(w), 0, 0];
    match xo {
        0 => insn(addr, w, Opcode::Mcrf, [rt(w) >> 2, ra(w) >> 2, 0, 0, 0]),
        16 => insn(addr, w, Opcode::Bclr, [rt(w), ra(w), 0, 0, 0]),
        33 => insn(addr, w, Opcode::Crnor, crops),
        129 => insn(addr, w, Opcode::Crandc, crops),
        150 => insn(addr, w, Opcode::Isync, [0; 5]),
        193 => insn(addr, w, Opcode::Crxor, crops),
        225 => insn(addr, w, Opcode::Crnand, crops),
        257 => insn(addr, w, Opcode::Crand, crops),
        289 => insn(addr, w, Opcode::Creqv, crops),
        417 => insn(addr, w, Opcode::Crorc, crops),
        449 => insn(addr, w, Opcode::Cror, crops),
        528 => insn(addr, w, Opcode::Bcctr, [rt(w), ra(w), 0, 0, 0]),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

/// Opcode 30: MD-form 64-bit rotates. sh and mb/me carry split high bits.
fn decode_30(addr: u32, w: u32) -> Instruction {
    let sh = ((w >> 11) & 0x1F) | (((w >> 1) & 1) << 5);
    let mb = ((w >> 6) & 0x1F) | (((w >> 5) & 1) << 5);
    let ops = [ra(w), rt(w), sh, mb, 0];
    match (w >> 2) & 0x7 {
        0 => insn(addr, w, Opcode::Rldicl, ops),
        1 => insn(addr, w, Opcode::Rldicr, ops),
        2 => insn(addr, w, Opcode::Rldic, ops),
        3 => insn(addr, w, Opcode::Rldimi, ops),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

/// Opcode 31: the X/XO catch-all group.
fn decode_31(addr: u32, w: u32) -> Instruction {
    // sradi splits its extended opcode across bit 30.
    if (w >> 2) & 0x1FF == 413 {
        let sh = ((w >> 11) & 0x1F) | (((w >> 1) & 1) << 5);
        return insn(addr, w, Opcode::Sradi, [ra(w), rt(w), sh, 0, 0]);
    }

    let xo = (w >> 1) & 0x3FF;
    let xo_arith = xo & 0x1FF; // OE lives above the nine XO bits
    let dab = [rt(w), ra(w), rb(w), 0, 0];
    let sab = [ra(w), rt(w), rb(w), 0, 0]; // logical: dest is rA

    // XO-form arithmetic first (mask away OE).
    let arith = match xo_arith {
        8 => Some(Opcode::Subfc),
        9 => Some(Opcode::Mulhdu),
        10 => Some(Opcode::Addc),
        11 => Some(Opcode::Mulhwu),
        40 => Some(Opcode::Subf),
        73 => Some(Opcode::Mulhd),
        75 => Some(Opcode::Mulhw),
        104 => Some(Opcode::Neg),
        136 => Some(Opcode::Subfe),
        138 => Some(Opcode::Adde),
        200 => Some(Opcode::Subfze),
        202 => Some(Opcode::Addze),
        232 => Some(Opcode::Subfme),
        233 => Some(Opcode::Mulld),
        234 => Some(Opcode::Addme),
        235 => Some(Opcode::Mullw),
        266 => Some(Opcode::Add),
        457 => Some(Opcode::Divdu),
        459 => Some(Opcode::Divwu),
        489 => Some(Opcode::Divd),
        491 => Some(Opcode::Divw),
        _ => None,
    };
    if let Some(op) = arith {
        return insn(addr, w, op, dab);
    }

    match xo {
        0 => insn(addr, w, Opcode::Cmp, [rt(w) >> 2, ra(w), rb(w), 0, 0]),
        4 => insn(addr, w, Opcode::Tw, [rt(w), ra(w), rb(w), 0, 0]),
        19 => {
            if w & (1 << 20) != 0 {
                insn(addr, w, Opcode::Mfocrf, [rt(w), (w >> 12) & 0xFF, 0, 0, 0])
            } else {
                insn(addr, w, Opcode::Mfcr, [rt(w), 0, 0, 0, 0])
            }
        }
        20 => insn(addr, w, Opcode::Lwarx, dab),
        21 => insn(addr, w, Opcode::Ldx, dab),
        23 => insn(addr, w, Opcode::Lwzx, dab),
        24 => insn(addr, w, Opcode::Slw, sab),
        26 => insn(addr, w, Opcode::Cntlzw, [ra(w), rt(w), 0, 0, 0]),
        27 => insn(addr, w, Opcode::Sld, sab),
        28 => insn(addr, w, Opcode::And, sab),
        32 => insn(addr, w, Opcode::Cmpl, [rt(w) >> 2, ra(w), rb(w), 0, 0]),
        54 => insn(addr, w, Opcode::Dcbst, [ra(w), rb(w), 0, 0, 0]),
        58 => insn(addr, w, Opcode::Cntlzd, [ra(w), rt(w), 0, 0, 0]),
        60 => insn(addr, w, Opcode::Andc, sab),
        68 => insn(addr, w, Opcode::Td, [rt(w), ra(w), rb(w), 0, 0]),
        83 => insn(addr, w, Opcode::Mfmsr, [rt(w), 0, 0, 0, 0]),
        84 => insn(addr, w, Opcode::Ldarx, dab),
        86 => insn(addr, w, Opcode::Dcbf, [ra(w), rb(w), 0, 0, 0]),
        87 => insn(addr, w, Opcode::Lbzx, dab),
        124 => insn(addr, w, Opcode::Nor, sab),
        144 => insn(addr, w, Opcode::Mtcrf, [rt(w), (w >> 12) & 0xFF, 0, 0, 0]),
        149 => insn(addr, w, Opcode::Stdx, dab),
        150 => insn(addr, w, Opcode::StwcxRecord, dab),
        151 => insn(addr, w, Opcode::Stwx, dab),
        178 => insn(addr, w, Opcode::Mtmsrd, [rt(w), 0, 0, 0, 0]),
        214 => insn(addr, w, Opcode::StdcxRecord, dab),
        215 => insn(addr, w, Opcode::Stbx, dab),
        246 => insn(addr, w, Opcode::Dcbtst, [ra(w), rb(w), 0, 0, 0]),
        256 => insn(addr, w, Opcode::Attn, [0; 5]),
        278 => insn(addr, w, Opcode::Dcbt, [ra(w), rb(w), 0, 0, 0]),
        279 => insn(addr, w, Opcode::Lhzx, dab),
        284 => insn(addr, w, Opcode::Eqv, sab),
        316 => insn(addr, w, Opcode::Xor, sab),
        339 => decode_mfspr(addr, w),
        341 => insn(addr, w, Opcode::Lwax, dab),
        343 => insn(addr, w, Opcode::Lhax, dab),
        371 => insn(addr, w, Opcode::Mftb, [rt(w), 0, 0, 0, 0]),
        407 => insn(addr, w, Opcode::Sthx, dab),
        412 => insn(addr, w, Opcode::Orc, sab),
        444 => {
            // `or` with identical source registers encodes the Xenon
            // priority hints; or rA,rS,rS is the canonical mr.
            let (d, s, b) = (ra(w), rt(w), rb(w));
            if d == s && s == b {
                match d {
                    1 => insn(addr, w, Opcode::Cctpl, [0; 5]),
                    2 => insn(addr, w, Opcode::Cctpm, [0; 5]),
                    31 => insn(addr, w, Opcode::Db16cyc, [0; 5]),
                    _ => insn(addr, w, Opcode::Or, sab),
                }
            } else if s == b {
                insn(addr, w, Opcode::Mr, [d, s, 0, 0, 0])
            } else {
                insn(addr, w, Opcode::Or, sab)
            }
        }
        467 => decode_mtspr(addr, w),
        476 => insn(addr, w, Opcode::Nand, sab),
        534 => insn(addr, w, Opcode::Lwbrx, dab),
        535 => insn(addr, w, Opcode::Lfsx, dab),
        536 => insn(addr, w, Opcode::Srw, sab),
        539 => insn(addr, w, Opcode::Srd, sab),
        598 => {
            // sync 0 = heavyweight, sync 1 = lwsync.
            if (w >> 21) & 3 == 1 {
                insn(addr, w, Opcode::Lwsync, [0; 5])
            } else {
                insn(addr, w, Opcode::Sync, [0; 5])
            }
        }
        599 => insn(addr, w, Opcode::Lfdx, dab),
        662 => insn(addr, w, Opcode::Stwbrx, dab),
        663 => insn(addr, w, Opcode::Stfsx, dab),
        727 => insn(addr, w, Opcode::Stfdx, dab),
        790 => insn(addr, w, Opcode::Lhbrx, dab),
        792 => insn(addr, w, Opcode::Sraw, sab),
        794 => insn(addr, w, Opcode::Srad, sab),
        824 => insn(addr, w, Opcode::Srawi, [ra(w), rt(w), rb(w), 0, 0]),
        854 => insn(addr, w, Opcode::Eieio, [0; 5]),
        918 => insn(addr, w, Opcode::Sthbrx, dab),
        922 => insn(addr, w, Opcode::Extsh, [ra(w), rt(w), 0, 0, 0]),
        954 => insn(addr, w, Opcode::Extsb, [ra(w), rt(w), 0, 0, 0]),
        982 => insn(addr, w, Opcode::Icbi, [ra(w), rb(w), 0, 0, 0]),
        983 => insn(addr, w, Opcode::Stfiwx, dab),
        986 => insn(addr, w, Opcode::Extsw, [ra(w), rt(w), 0, 0, 0]),
        1014 => {
            // dcbz; the 128-byte form carries a hint in the RT field.
            if rt(w) == 1 {
                insn(addr, w, Opcode::Dcbzl, [ra(w), rb(w), 0, 0, 0])
            } else {
                insn(addr, w, Opcode::Dcbz, [ra(w), rb(w), 0, 0, 0])
            }
        }
        // Altivec loads/stores live in opcode 31.
        6 => insn(addr, w, Opcode::Lvsl, dab),
        38 => insn(addr, w, Opcode::Lvsr, dab),
        103 => insn(addr, w, Opcode::Lvx, dab),
        231 => insn(addr, w, Opcode::Stvx, dab),
        519 => insn(addr, w, Opcode::Lvlx, dab),
        551 => insn(addr, w, Opcode::Lvrx, dab),
        647 => insn(addr, w, Opcode::Stvlx, dab),
        679 => insn(addr, w, Opcode::Stvrx, dab),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

fn spr_number(w: u32) -> u32 {
    ((w >> 16) & 0x1F) | (((w >> 11) & 0x1F) << 5)
}

fn decode_mfspr(addr: u32, w: u32) -> Instruction {
    let d = [rt(w), 0, 0, 0, 0];
    match spr_number(w) {
        1 => insn(addr, w, Opcode::Mfxer, d),
        8 => insn(addr, w, Opcode::Mflr, d),
        9 => insn(addr, w, Opcode::Mfctr, d),
        268 | 269 => insn(addr, w, Opcode::Mftb, d),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

fn decode_mtspr(addr: u32, w: u32) -> Instruction {
    let d = [rt(w), 0, 0, 0, 0];
    match spr_number(w) {
        1 => insn(addr, w, Opcode::Mtxer, d),
        8 => insn(addr, w, Opcode::Mtlr, d),
        9 => insn(addr, w, Opcode::Mtctr, d),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

/// Opcode 59: single-precision FP arithmetic (A-form).
fn decode_59(addr: u32, w: u32) -> Instruction {
    let abc = [rt(w), ra(w), rb(w), (w >> 6) & 0x1F, 0];
    match (w >> 1) & 0x1F {
        18 => insn(addr, w, Opcode::Fdivs, abc),
        20 => insn(addr, w, Opcode::Fsubs, abc),
        21 => insn(addr, w, Opcode::Fadds, abc),
        22 => insn(addr, w, Opcode::Fsqrts, abc),
        24 => insn(addr, w, Opcode::Fres, abc),
        25 => insn(addr, w, Opcode::Fmuls, abc),
        28 => insn(addr, w, Opcode::Fmsubs, abc),
        29 => insn(addr, w, Opcode::Fmadds, abc),
        30 => insn(addr, w, Opcode::Fnmsubs, abc),
        31 => insn(addr, w, Opcode::Fnmadds, abc),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

/// Opcode 63: double-precision FP (A-form arithmetic plus X-form moves).
fn decode_63(addr: u32, w: u32) -> Instruction {
    let abc = [rt(w), ra(w), rb(w), (w >> 6) & 0x1F, 0];
    match (w >> 1) & 0x1F {
        18 => return insn(addr, w, Opcode::Fdiv, abc),
        20 => return insn(addr, w, Opcode::Fsub, abc),
        21 => return insn(addr, w, Opcode::Fadd, abc),
        22 => return insn(addr, w, Opcode::Fsqrt, abc),
        23 => return insn(addr, w, Opcode::Fsel, abc),
        25 => return insn(addr, w, Opcode::Fmul, abc),
        26 => return insn(addr, w, Opcode::Frsqrte, abc),
        28 => return insn(addr, w, Opcode::Fmsub, abc),
        29 => return insn(addr, w, Opcode::Fmadd, abc),
        30 => return insn(addr, w, Opcode::Fnmsub, abc),
        31 => return insn(addr, w, Opcode::Fnmadd, abc),
        _ => {}
    }
    let db = [rt(w), rb(w), 0, 0, 0];
    match (w >> 1) & 0x3FF {
        0 => insn(addr, w, Opcode::Fcmpu, [rt(w) >> 2, ra(w), rb(w), 0, 0]),
        12 => insn(addr, w, Opcode::Frsp, db),
        14 => insn(addr, w, Opcode::Fctiw, db),
        15 => insn(addr, w, Opcode::Fctiwz, db),
        40 => insn(addr, w, Opcode::Fneg, db),
        72 => insn(addr, w, Opcode::Fmr, db),
        136 => insn(addr, w, Opcode::Fnabs, db),
        264 => insn(addr, w, Opcode::Fabs, db),
        583 => insn(addr, w, Opcode::Mffs, [rt(w), 0, 0, 0, 0]),
        711 => insn(addr, w, Opcode::Mtfsf, [(w >> 17) & 0xFF, rb(w), 0, 0, 0]),
        814 => insn(addr, w, Opcode::Fctid, db),
        815 => insn(addr, w, Opcode::Fctidz, db),
        846 => insn(addr, w, Opcode::Fcfid, db),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

/// Opcode 4: Altivec. VA-form first (6-bit xo), then VC compares, then
/// the VX group (11-bit xo).
fn decode_vmx(addr: u32, w: u32) -> Instruction {
    let vd = rt(w);
    let va = ra(w);
    let vb = rb(w);
    let vc = (w >> 6) & 0x1F;

    match w & 0x3F {
        42 => return insn(addr, w, Opcode::Vsel, [vd, va, vb, vc, 0]),
        43 => return insn(addr, w, Opcode::Vperm, [vd, va, vb, vc, 0]),
        44 => return insn(addr, w, Opcode::Vsldoi, [vd, va, vb, vc & 0xF, 0]),
        46 => return insn(addr, w, Opcode::Vmaddfp, [vd, va, vc, vb, 0]),
        47 => return insn(addr, w, Opcode::Vnmsubfp, [vd, va, vc, vb, 0]),
        _ => {}
    }

    // VC-form compares: Rc in bit 21, xo in the low ten bits.
    let vcmp = [vd, va, vb, 0, 0];
    match w & 0x3FF {
        0x006 => return insn(addr, w, Opcode::Vcmpequb, vcmp),
        0x046 => return insn(addr, w, Opcode::Vcmpequh, vcmp),
        0x086 => return insn(addr, w, Opcode::Vcmpequw, vcmp),
        0x0C6 => return insn(addr, w, Opcode::Vcmpeqfp, vcmp),
        0x1C6 => return insn(addr, w, Opcode::Vcmpgefp, vcmp),
        0x206 => return insn(addr, w, Opcode::Vcmpgtub, vcmp),
        0x286 => return insn(addr, w, Opcode::Vcmpgtuw, vcmp),
        0x2C6 => return insn(addr, w, Opcode::Vcmpgtfp, vcmp),
        0x306 => return insn(addr, w, Opcode::Vcmpgtsb, vcmp),
        0x346 => return insn(addr, w, Opcode::Vcmpgtsh, vcmp),
        0x386 => return insn(addr, w, Opcode::Vcmpgtsw, vcmp),
        _ => {}
    }

    let vab = [vd, va, vb, 0, 0];
    let splat = [vd, vb, va, 0, 0]; // operands[2] is the element / simm field
    match w & 0x7FF {
        0x000 => insn(addr, w, Opcode::Vaddubm, vab),
        0x00A => insn(addr, w, Opcode::Vaddfp, vab),
        0x040 => insn(addr, w, Opcode::Vadduhm, vab),
        0x04A => insn(addr, w, Opcode::Vsubfp, vab),
        0x080 => insn(addr, w, Opcode::Vadduwm, vab),
        0x084 => insn(addr, w, Opcode::Vrlw, vab),
        0x08C => insn(addr, w, Opcode::Vmrghw, vab),
        0x104 => insn(addr, w, Opcode::Vslb, vab),
        0x10A => insn(addr, w, Opcode::Vrefp, [vd, vb, 0, 0, 0]),
        0x10E => insn(addr, w, Opcode::Vpkshus, vab),
        0x144 => insn(addr, w, Opcode::Vslh, vab),
        0x14A => insn(addr, w, Opcode::Vrsqrtefp, [vd, vb, 0, 0, 0]),
        0x184 => insn(addr, w, Opcode::Vslw, vab),
        0x18A => insn(addr, w, Opcode::Vexptefp, [vd, vb, 0, 0, 0]),
        0x18C => insn(addr, w, Opcode::Vmrglw, vab),
        0x1C4 => insn(addr, w, Opcode::Vsl, vab),
        0x1CA => insn(addr, w, Opcode::Vlogefp, [vd, vb, 0, 0, 0]),
        0x200 => insn(addr, w, Opcode::Vaddubs, vab),
        0x20A => insn(addr, w, Opcode::Vrfin, [vd, vb, 0, 0, 0]),
        0x20C => insn(addr, w, Opcode::Vspltb, splat),
        0x20E => insn(addr, w, Opcode::Vupkhsb, [vd, vb, 0, 0, 0]),
        0x240 => insn(addr, w, Opcode::Vadduhs, vab),
        0x244 => insn(addr, w, Opcode::Vsrh, vab),
        0x24A => insn(addr, w, Opcode::Vrfiz, [vd, vb, 0, 0, 0]),
        0x24C => insn(addr, w, Opcode::Vsplth, splat),
        0x284 => insn(addr, w, Opcode::Vsrw, vab),
        0x28A => insn(addr, w, Opcode::Vrfip, [vd, vb, 0, 0, 0]),
        0x28C => insn(addr, w, Opcode::Vspltw, splat),
        0x28E => insn(addr, w, Opcode::Vupklsb, [vd, vb, 0, 0, 0]),
        0x2C4 => insn(addr, w, Opcode::Vsr, vab),
        0x2CA => insn(addr, w, Opcode::Vrfim, [vd, vb, 0, 0, 0]),
        0x300 => insn(addr, w, Opcode::Vaddsbs, vab),
        0x30A => insn(addr, w, Opcode::Vcfux, [vd, vb, va, 0, 0]),
        0x30C => insn(addr, w, Opcode::Vspltisb, [vd, sext5(va), 0, 0, 0]),
        0x340 => insn(addr, w, Opcode::Vaddshs, vab),
        0x34A => insn(addr, w, Opcode::Vcfsx, [vd, vb, va, 0, 0]),
        0x34C => insn(addr, w, Opcode::Vspltish, [vd, sext5(va), 0, 0, 0]),
        0x380 => insn(addr, w, Opcode::Vaddsws, vab),
        0x384 => insn(addr, w, Opcode::Vsraw, vab),
        0x38A => insn(addr, w, Opcode::Vctuxs, [vd, vb, va, 0, 0]),
        0x38C => insn(addr, w, Opcode::Vspltisw, [vd, sext5(va), 0, 0, 0]),
        0x3CA => insn(addr, w, Opcode::Vctsxs, [vd, vb, va, 0, 0]),
        0x400 => insn(addr, w, Opcode::Vsububm, vab),
        0x404 => insn(addr, w, Opcode::Vand, vab),
        0x40A => insn(addr, w, Opcode::Vmaxfp, vab),
        0x40C => insn(addr, w, Opcode::Vslo, vab),
        0x440 => insn(addr, w, Opcode::Vsubuhm, vab),
        0x444 => insn(addr, w, Opcode::Vandc, vab),
        0x44A => insn(addr, w, Opcode::Vminfp, vab),
        0x44C => insn(addr, w, Opcode::Vsro, vab),
        0x480 => insn(addr, w, Opcode::Vsubuwm, vab),
        0x484 => insn(addr, w, Opcode::Vor, vab),
        0x4C4 => insn(addr, w, Opcode::Vxor, vab),
        0x504 => insn(addr, w, Opcode::Vnor, vab),
        0x600 => insn(addr, w, Opcode::Vsububs, vab),
        0x740 => insn(addr, w, Opcode::Vsubshs, vab),
        0x780 => insn(addr, w, Opcode::Vsubsws, vab),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

#[inline]
fn sext5(v: u32) -> u32 {
    if v & 0x10 != 0 {
        v | 0xFFFF_FFE0
    } else {
        v
    }
}

// VX128 register numbers are split: the low five bits sit in the usual
// D/A/B slots and the extension bits (selecting the v32..v127 banks) live
// in the low opcode bits.
#[inline]
fn vx128_vd(w: u32) -> u32 {
    ((w >> 21) & 0x1F) | (((w >> 2) & 0x3) << 5)
}

#[inline]
fn vx128_va(w: u32) -> u32 {
    ((w >> 16) & 0x1F) | (((w >> 10) & 0x1) << 5) | (((w >> 6) & 0x1) << 6)
}

#[inline]
fn vx128_vb(w: u32) -> u32 {
    ((w >> 11) & 0x1F) | ((w & 0x3) << 5)
}

/// Opcode 5: the VX128 FP group (xo under mask 0x3D0).
fn decode_vmx128(addr: u32, w: u32) -> Instruction {
    let ops = [vx128_vd(w), vx128_va(w), vx128_vb(w), 0, 0];
    match w & 0x3D0 {
        144 => insn(addr, w, Opcode::Vmulfp128, ops),
        400 => insn(addr, w, Opcode::Vmsum3fp128, ops),
        464 => insn(addr, w, Opcode::Vmsum4fp128, ops),
        _ => insn(addr, w, Opcode::Unknown, [0; 5]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(word: u32) -> Instruction {
        decode(0x8200_0000, word)
    }

    #[test]
    fn decodes_d_form_arithmetic() {
        // li r3, 1  (addi r3, r0, 1)
        let i = dec(0x3860_0001);
        assert_eq!(i.opcode, Opcode::Addi);
        assert_eq!(i.operands[0], 3);
        assert_eq!(i.operands[1], 0);
        assert_eq!(i.operands[2], 1);
        // addi r4, r3, -4
        let i = dec(0x3883_FFFC);
        assert_eq!(i.opcode, Opcode::Addi);
        assert_eq!(i.operands[2] as i32, -4);
    }

    #[test]
    fn decodes_loads_and_stores() {
        // stw r3, 0(r4)
        let i = dec(0x9064_0000);
        assert_eq!(i.opcode, Opcode::Stw);
        assert_eq!(i.operands, [3, 4, 0, 0, 0]);
        // lhz r5, 2(r4)
        let i = dec(0xA0A4_0002);
        assert_eq!(i.opcode, Opcode::Lhz);
        assert_eq!(i.operands, [5, 4, 2, 0, 0]);
    }

    #[test]
    fn decodes_xo_form() {
        // add r3, r4, r5
        let i = dec(0x7C64_2A14);
        assert_eq!(i.opcode, Opcode::Add);
        assert_eq!(i.operands, [3, 4, 5, 0, 0]);
        assert!(!i.rc());
        assert!(!i.oe());
        // add. r3, r4, r5
        let i = dec(0x7C64_2A15);
        assert_eq!(i.opcode, Opcode::Add);
        assert!(i.rc());
        // addo r3, r4, r5 (OE set)
        let i = dec(0x7C64_2E14);
        assert_eq!(i.opcode, Opcode::Add);
        assert!(i.oe());
        // mullw r3, r4, r5
        let i = dec(0x7C64_29D6);
        assert_eq!(i.opcode, Opcode::Mullw);
    }

    #[test]
    fn decodes_branches_with_targets() {
        // b +8 from 0x82000000
        let i = dec(0x4800_0008);
        assert_eq!(i.opcode, Opcode::B);
        assert_eq!(i.operands[0], 0x8200_0008);
        assert!(!i.lk());
        // bl -4
        let i = dec(0x4BFF_FFFD);
        assert_eq!(i.opcode, Opcode::B);
        assert_eq!(i.operands[0], 0x81FF_FFFC);
        assert!(i.lk());
        // bne +8 (bc 4, 2, +8)
        let i = dec(0x4082_0008);
        assert_eq!(i.opcode, Opcode::Bc);
        assert_eq!(i.operands[0], 4); // BO
        assert_eq!(i.operands[1], 2); // BI = cr0.eq
        assert_eq!(i.operands[2], 0x8200_0008);
        // blr / bctr
        assert_eq!(dec(0x4E80_0020).opcode, Opcode::Bclr);
        assert_eq!(dec(0x4E80_0420).opcode, Opcode::Bcctr);
    }

    #[test]
    fn decodes_special_register_moves() {
        // mtctr r3
        let i = dec(0x7C69_03A6);
        assert_eq!(i.opcode, Opcode::Mtctr);
        assert_eq!(i.operands[0], 3);
        // mflr r12
        let i = dec(0x7D88_02A6);
        assert_eq!(i.opcode, Opcode::Mflr);
        assert_eq!(i.operands[0], 12);
    }

    #[test]
    fn decodes_traps() {
        // twi 31, r0, 20
        let i = dec(0x0FE0_0014);
        assert_eq!(i.opcode, Opcode::Twi);
        assert_eq!(i.operands, [31, 0, 20, 0, 0]);
    }

    #[test]
    fn decodes_nop_and_mr() {
        assert_eq!(dec(0x6000_0000).opcode, Opcode::Nop);
        // mr r3, r4 (or r3, r4, r4)
        let i = dec(0x7C83_2378);
        assert_eq!(i.opcode, Opcode::Mr);
        assert_eq!(i.operands[0], 3);
        assert_eq!(i.operands[1], 4);
    }

    #[test]
    fn decodes_rlwinm_fields() {
        // rlwinm r5, r4, 2, 0, 29
        let w = (21 << 26) | (4 << 21) | (5 << 16) | (2 << 11) | (29 << 1);
        let i = dec(w);
        assert_eq!(i.opcode, Opcode::Rlwinm);
        assert_eq!(i.operands, [5, 4, 2, 0, 29]);
    }

    #[test]
    fn decodes_vector_splat() {
        // vspltw v2, v3, 0: opcode 4, xo 0x28C, UIM in the rA slot
        let w = (4 << 26) | (2 << 21) | (3 << 11) | 0x28C;
        let i = dec(w);
        assert_eq!(i.opcode, Opcode::Vspltw);
        assert_eq!(i.operands[0], 2); // vD
        assert_eq!(i.operands[1], 3); // vB
        assert_eq!(i.operands[2], 0); // element
    }

    #[test]
    fn unknown_word_decodes_to_unknown() {
        assert_eq!(dec(0xFFFF_FFFF).opcode, Opcode::Unknown);
        assert_eq!(dec(0x0000_0000).opcode, Opcode::Unknown);
    }

    #[test]
    fn disassemble_rejects_unaligned_sections() {
        let section = CodeSection {
            vaddr: 0x8200_0002,
            data: vec![0; 8],
            name: ".text".into(),
        };
        assert!(disassemble(&section).is_err());
    }
}
