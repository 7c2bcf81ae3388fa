//! Vector (Altivec / VMX128) operation helpers for recompiled code.
//!
//! Guest vectors use reversed element indexing relative to host lanes
//! (guest element 0 = host lane 3 in a 4 x 32 view), and guest byte 0 is
//! the most significant byte of the 128-bit value. Whole-vector shifts and
//! permutes work on the guest-order `u128`; element-wise arithmetic works
//! on host lanes directly since lane order does not matter there.
//!
//! Saturating operations return the clamped result plus a flag that feeds
//! the sticky `vscr_sat` bit: set iff any element clamped.

use crate::context::VReg;
use crate::guest;

/// Guest-order view: byte 0 of the guest vector is the most significant
/// byte of the returned value.
#[inline]
pub fn guest_u128(v: VReg) -> u128 {
    u128::from_le_bytes(*v.bytes())
}

#[inline]
pub fn from_guest_u128(x: u128) -> VReg {
    let mut v = VReg::default();
    *v.bytes_mut() = x.to_le_bytes();
    v
}

#[inline]
fn guest_byte(v: VReg, i: usize) -> u8 {
    v.bytes()[15 - i]
}

#[inline]
fn set_guest_byte(v: &mut VReg, i: usize, b: u8) {
    v.bytes_mut()[15 - i] = b;
}

// ---------------------------------------------------------------------------
// Vector loads and stores
// ---------------------------------------------------------------------------

/// lvx: 16-byte aligned load. Guest byte 0 comes from the lowest address.
pub fn load_vreg(base: *mut u8, addr: u32) -> VReg {
    let ea = addr & !15;
    let mut v = VReg::default();
    for i in 0..16 {
        set_guest_byte(&mut v, i, guest::load_u8(base, ea + i as u32));
    }
    v
}

/// stvx: 16-byte aligned store.
pub fn store_vreg(base: *mut u8, addr: u32, v: VReg) {
    let ea = addr & !15;
    for i in 0..16 {
        guest::store_u8(base, ea + i as u32, guest_byte(v, i));
    }
}

/// lvlx: load from `ea` to the end of its 16-byte block into the left
/// (low-numbered) guest bytes; the rest reads as zero.
pub fn load_vreg_left(base: *mut u8, addr: u32) -> VReg {
    let sh = (addr & 15) as usize;
    let mut v = VReg::default();
    for i in 0..(16 - sh) {
        set_guest_byte(&mut v, i, guest::load_u8(base, addr + i as u32));
    }
    v
}

/// lvrx: load the bytes of the block before `ea` into the right
/// (high-numbered) guest bytes; zero when `ea` is block-aligned.
pub fn load_vreg_right(base: *mut u8, addr: u32) -> VReg {
    let sh = (addr & 15) as usize;
    let block = addr & !15;
    let mut v = VReg::default();
    for i in 0..sh {
        set_guest_byte(&mut v, 16 - sh + i, guest::load_u8(base, block + i as u32));
    }
    v
}

/// stvlx: store the left guest bytes from `ea` to the end of its block.
pub fn store_vreg_left(base: *mut u8, addr: u32, v: VReg) {
    let sh = (addr & 15) as usize;
    for i in 0..(16 - sh) {
        guest::store_u8(base, addr + i as u32, guest_byte(v, i));
    }
}

/// stvrx: store the right guest bytes into the block bytes before `ea`.
pub fn store_vreg_right(base: *mut u8, addr: u32, v: VReg) {
    let sh = (addr & 15) as usize;
    let block = addr & !15;
    for i in 0..sh {
        guest::store_u8(base, block + i as u32, guest_byte(v, 16 - sh + i));
    }
}

/// lvsl: the alignment permute control for a left-shifted unaligned
/// load; guest byte i reads sh + i.
pub fn lvsl(sh: u32) -> VReg {
    let sh = (sh & 0xF) as u8;
    let mut v = VReg::default();
    for i in 0..16 {
        set_guest_byte(&mut v, i, sh + i as u8);
    }
    v
}

/// lvsr: the right-shift companion; guest byte i reads 16 - sh + i.
pub fn lvsr(sh: u32) -> VReg {
    let sh = (sh & 0xF) as u8;
    let mut v = VReg::default();
    for i in 0..16 {
        set_guest_byte(&mut v, i, 16 - sh + i as u8);
    }
    v
}

// ---------------------------------------------------------------------------
// Floating point (element-wise: lane order is irrelevant)
// ---------------------------------------------------------------------------

macro_rules! fp_binary {
    ($name:ident, |$a:ident, $b:ident| $expr:expr) => {
        pub fn $name(va: VReg, vb: VReg) -> VReg {
            let mut out = VReg::default();
            for lane in 0..4 {
                let $a = va.f32(lane);
                let $b = vb.f32(lane);
                out.set_f32(lane, $expr);
            }
            out
        }
    };
}

fp_binary!(vaddfp, |a, b| a + b);
fp_binary!(vsubfp, |a, b| a - b);
fp_binary!(vmulfp, |a, b| a * b);
fp_binary!(vmaxfp, |a, b| if a > b { a } else { b });
fp_binary!(vminfp, |a, b| if a < b { a } else { b });

pub fn vmaddfp(va: VReg, vb: VReg, vc: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, va.f32(lane) * vb.f32(lane) + vc.f32(lane));
    }
    out
}

/// vnmsubfp: -(vA * vB - vC), negated by sign-bit flip like the hardware.
pub fn vnmsubfp(va: VReg, vb: VReg, vc: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        let r = va.f32(lane) * vb.f32(lane) - vc.f32(lane);
        out.set_u32(lane, r.to_bits() ^ 0x8000_0000);
    }
    out
}

pub fn vrefp(va: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, 1.0 / va.f32(lane));
    }
    out
}

pub fn vrsqrtefp(va: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, 1.0 / va.f32(lane).sqrt());
    }
    out
}

pub fn vexptefp(va: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, va.f32(lane).exp2());
    }
    out
}

pub fn vlogefp(va: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, va.f32(lane).log2());
    }
    out
}

macro_rules! fp_round {
    ($name:ident, $method:ident) => {
        pub fn $name(va: VReg) -> VReg {
            let mut out = VReg::default();
            for lane in 0..4 {
                out.set_f32(lane, va.f32(lane).$method());
            }
            out
        }
    };
}

fp_round!(vrfim, floor);
fp_round!(vrfip, ceil);
fp_round!(vrfiz, trunc);

pub fn vrfin(va: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, va.f32(lane).round_ties_even());
    }
    out
}

/// vmsum3fp128: 3-element dot product over guest elements 0..2, broadcast.
pub fn vmsum3fp(va: VReg, vb: VReg) -> VReg {
    let dot = (0..3)
        .map(|el| va.f32_el(el) * vb.f32_el(el))
        .sum::<f32>();
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, dot);
    }
    out
}

/// vmsum4fp128: full 4-element dot product, broadcast to every element.
pub fn vmsum4fp(va: VReg, vb: VReg) -> VReg {
    let dot = (0..4)
        .map(|lane| va.f32(lane) * vb.f32(lane))
        .sum::<f32>();
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, dot);
    }
    out
}

// ---------------------------------------------------------------------------
// Integer arithmetic
// ---------------------------------------------------------------------------

macro_rules! int_binary {
    ($name:ident, $get:ident, $set:ident, $count:expr, |$a:ident, $b:ident| $expr:expr) => {
        pub fn $name(va: VReg, vb: VReg) -> VReg {
            let mut out = VReg::default();
            for lane in 0..$count {
                let $a = va.$get(lane);
                let $b = vb.$get(lane);
                out.$set(lane, $expr);
            }
            out
        }
    };
}

int_binary!(vaddubm, u8, set_u8, 16, |a, b| a.wrapping_add(b));
int_binary!(vadduhm, u16, set_u16, 8, |a, b| a.wrapping_add(b));
int_binary!(vadduwm, u32, set_u32, 4, |a, b| a.wrapping_add(b));
int_binary!(vsububm, u8, set_u8, 16, |a, b| a.wrapping_sub(b));
int_binary!(vsubuhm, u16, set_u16, 8, |a, b| a.wrapping_sub(b));
int_binary!(vsubuwm, u32, set_u32, 4, |a, b| a.wrapping_sub(b));

int_binary!(vminsw, s32, set_s32, 4, |a, b| a.min(b));
int_binary!(vmaxsw, s32, set_s32, 4, |a, b| a.max(b));

pub fn vaddsbs(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..16 {
        let (a, b) = (va.s8(lane), vb.s8(lane));
        let r = a.saturating_add(b);
        sat |= a.checked_add(b).is_none();
        out.set_s8(lane, r);
    }
    (out, sat)
}

pub fn vaddshs(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..8 {
        let (a, b) = (va.s16(lane), vb.s16(lane));
        let r = a.saturating_add(b);
        sat |= a.checked_add(b).is_none();
        out.set_s16(lane, r);
    }
    (out, sat)
}

/// vaddsws: signed-word saturating add. No direct host intrinsic exists,
/// so this is the overflow-detect-and-blend expansion: same-sign overflow
/// found via XOR, saturation value synthesized as (a >> 31) ^ i32::MAX.
pub fn vaddsws(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..4 {
        let (a, b) = (va.s32(lane), vb.s32(lane));
        let sum = a.wrapping_add(b);
        let overflow = ((a ^ sum) & (b ^ sum)) < 0;
        let sat_val = (a >> 31) ^ i32::MAX;
        out.set_s32(lane, if overflow { sat_val } else { sum });
        sat |= overflow;
    }
    (out, sat)
}

pub fn vaddubs(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..16 {
        let (a, b) = (va.u8(lane), vb.u8(lane));
        let r = a.saturating_add(b);
        sat |= a.checked_add(b).is_none();
        out.set_u8(lane, r);
    }
    (out, sat)
}

pub fn vadduhs(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..8 {
        let (a, b) = (va.u16(lane), vb.u16(lane));
        let r = a.saturating_add(b);
        sat |= a.checked_add(b).is_none();
        out.set_u16(lane, r);
    }
    (out, sat)
}

pub fn vsubsws(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..4 {
        let (a, b) = (va.s32(lane), vb.s32(lane));
        let r = a.saturating_sub(b);
        sat |= a.checked_sub(b).is_none();
        out.set_s32(lane, r);
    }
    (out, sat)
}

pub fn vsubshs(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..8 {
        let (a, b) = (va.s16(lane), vb.s16(lane));
        let r = a.saturating_sub(b);
        sat |= a.checked_sub(b).is_none();
        out.set_s16(lane, r);
    }
    (out, sat)
}

pub fn vsububs(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..16 {
        let (a, b) = (va.u8(lane), vb.u8(lane));
        let r = a.saturating_sub(b);
        sat |= a.checked_sub(b).is_none();
        out.set_u8(lane, r);
    }
    (out, sat)
}

// ---------------------------------------------------------------------------
// Logic
// ---------------------------------------------------------------------------

pub fn vand(va: VReg, vb: VReg) -> VReg {
    from_guest_u128(guest_u128(va) & guest_u128(vb))
}

pub fn vandc(va: VReg, vb: VReg) -> VReg {
    from_guest_u128(guest_u128(va) & !guest_u128(vb))
}

pub fn vor(va: VReg, vb: VReg) -> VReg {
    from_guest_u128(guest_u128(va) | guest_u128(vb))
}

pub fn vxor(va: VReg, vb: VReg) -> VReg {
    from_guest_u128(guest_u128(va) ^ guest_u128(vb))
}

pub fn vnor(va: VReg, vb: VReg) -> VReg {
    from_guest_u128(!(guest_u128(va) | guest_u128(vb)))
}

/// vsel: bit-wise select, vC chooses vB where set.
pub fn vsel(va: VReg, vb: VReg, vc: VReg) -> VReg {
    let (a, b, c) = (guest_u128(va), guest_u128(vb), guest_u128(vc));
    from_guest_u128((a & !c) | (b & c))
}

// ---------------------------------------------------------------------------
// Per-element shifts
// ---------------------------------------------------------------------------

int_binary!(vslw, u32, set_u32, 4, |a, b| a.wrapping_shl(b & 31));
int_binary!(vsrw, u32, set_u32, 4, |a, b| a.wrapping_shr(b & 31));
int_binary!(vslh, u16, set_u16, 8, |a, b| a.wrapping_shl((b & 15) as u32));
int_binary!(vsrh, u16, set_u16, 8, |a, b| a.wrapping_shr((b & 15) as u32));

pub fn vsraw(va: VReg, vb: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_s32(lane, va.s32(lane) >> (vb.u32(lane) & 31));
    }
    out
}

pub fn vrlw(va: VReg, vb: VReg) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_u32(lane, va.u32(lane).rotate_left(vb.u32(lane) & 31));
    }
    out
}

// ---------------------------------------------------------------------------
// Whole-vector shifts (guest orientation: left = toward guest byte 0)
// ---------------------------------------------------------------------------

/// vsl: shift the whole vector left by the low 3 bits of guest byte 15.
pub fn vsl(va: VReg, vb: VReg) -> VReg {
    let shift = (guest_byte(vb, 15) & 7) as u32;
    from_guest_u128(guest_u128(va) << shift)
}

/// vsr: shift the whole vector right by the low 3 bits of guest byte 15.
pub fn vsr(va: VReg, vb: VReg) -> VReg {
    let shift = (guest_byte(vb, 15) & 7) as u32;
    from_guest_u128(guest_u128(va) >> shift)
}

/// vslo: shift left by octets, count in bits 121:124 of vB.
pub fn vslo(va: VReg, vb: VReg) -> VReg {
    let bytes = ((guest_byte(vb, 15) >> 3) & 0xF) as u32;
    from_guest_u128(guest_u128(va) << (bytes * 8))
}

/// vsro: shift right by octets.
pub fn vsro(va: VReg, vb: VReg) -> VReg {
    let bytes = ((guest_byte(vb, 15) >> 3) & 0xF) as u32;
    from_guest_u128(guest_u128(va) >> (bytes * 8))
}

/// vsldoi: take guest bytes sh..sh+15 of the concatenation vA || vB.
pub fn vsldoi(va: VReg, vb: VReg, sh: u32) -> VReg {
    let sh = (sh & 15) as usize;
    let mut out = VReg::default();
    for i in 0..16 {
        let src = i + sh;
        let b = if src < 16 {
            guest_byte(va, src)
        } else {
            guest_byte(vb, src - 16)
        };
        set_guest_byte(&mut out, i, b);
    }
    out
}

// ---------------------------------------------------------------------------
// Splats, merges, permute
// ---------------------------------------------------------------------------

/// vspltb: broadcast guest byte `el` of vB.
pub fn vspltb(vb: VReg, el: u32) -> VReg {
    let b = guest_byte(vb, (el & 15) as usize);
    let mut out = VReg::default();
    out.bytes_mut().fill(b);
    out
}

/// vsplth: broadcast guest halfword `el` of vB.
pub fn vsplth(vb: VReg, el: u32) -> VReg {
    let h = vb.u16_el((el & 7) as usize);
    let mut out = VReg::default();
    for lane in 0..8 {
        out.set_u16(lane, h);
    }
    out
}

/// vspltw: broadcast guest word `el` of vB. Guest element 0 resides in
/// host lane 3, so the splat reads the reversed lane.
pub fn vspltw(vb: VReg, el: u32) -> VReg {
    VReg::splat_u32(vb.u32_el((el & 3) as usize))
}

pub fn vspltisb(imm: i32) -> VReg {
    let mut out = VReg::default();
    out.bytes_mut().fill(imm as i8 as u8);
    out
}

pub fn vspltish(imm: i32) -> VReg {
    let mut out = VReg::default();
    for lane in 0..8 {
        out.set_s16(lane, imm as i16);
    }
    out
}

pub fn vspltisw(imm: i32) -> VReg {
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_s32(lane, imm);
    }
    out
}

/// vmrghw: interleave the high (guest elements 0,1) words of vA and vB.
pub fn vmrghw(va: VReg, vb: VReg) -> VReg {
    let mut out = VReg::default();
    out.set_u32_el(0, va.u32_el(0));
    out.set_u32_el(1, vb.u32_el(0));
    out.set_u32_el(2, va.u32_el(1));
    out.set_u32_el(3, vb.u32_el(1));
    out
}

/// vmrglw: interleave the low (guest elements 2,3) words of vA and vB.
pub fn vmrglw(va: VReg, vb: VReg) -> VReg {
    let mut out = VReg::default();
    out.set_u32_el(0, va.u32_el(2));
    out.set_u32_el(1, vb.u32_el(2));
    out.set_u32_el(2, va.u32_el(3));
    out.set_u32_el(3, vb.u32_el(3));
    out
}

/// vperm: each result guest byte selects from the 32-byte guest-order
/// concatenation vA || vB via the low 5 bits of the control byte.
pub fn vperm(va: VReg, vb: VReg, vc: VReg) -> VReg {
    let mut out = VReg::default();
    for i in 0..16 {
        let sel = (guest_byte(vc, i) & 0x1F) as usize;
        let b = if sel < 16 {
            guest_byte(va, sel)
        } else {
            guest_byte(vb, sel - 16)
        };
        set_guest_byte(&mut out, i, b);
    }
    out
}

// ---------------------------------------------------------------------------
// Compares (record forms feed cr6 with all-set / all-clear)
// ---------------------------------------------------------------------------

macro_rules! int_compare {
    ($name:ident, $get:ident, $set:ident, $count:expr, $mask:expr, |$a:ident, $b:ident| $cond:expr) => {
        pub fn $name(va: VReg, vb: VReg) -> (VReg, bool, bool) {
            let mut out = VReg::default();
            let mut all_set = true;
            let mut all_clear = true;
            for lane in 0..$count {
                let $a = va.$get(lane);
                let $b = vb.$get(lane);
                let hit = $cond;
                out.$set(lane, if hit { $mask } else { 0 });
                all_set &= hit;
                all_clear &= !hit;
            }
            (out, all_set, all_clear)
        }
    };
}

int_compare!(vcmpequb, u8, set_u8, 16, 0xFF, |a, b| a == b);
int_compare!(vcmpequh, u16, set_u16, 8, 0xFFFF, |a, b| a == b);
int_compare!(vcmpequw, u32, set_u32, 4, 0xFFFF_FFFF, |a, b| a == b);
int_compare!(vcmpgtub, u8, set_u8, 16, 0xFF, |a, b| a > b);
int_compare!(vcmpgtuw, u32, set_u32, 4, 0xFFFF_FFFF, |a, b| a > b);

pub fn vcmpgtsb(va: VReg, vb: VReg) -> (VReg, bool, bool) {
    let mut out = VReg::default();
    let (mut all_set, mut all_clear) = (true, true);
    for lane in 0..16 {
        let hit = va.s8(lane) > vb.s8(lane);
        out.set_u8(lane, if hit { 0xFF } else { 0 });
        all_set &= hit;
        all_clear &= !hit;
    }
    (out, all_set, all_clear)
}

pub fn vcmpgtsh(va: VReg, vb: VReg) -> (VReg, bool, bool) {
    let mut out = VReg::default();
    let (mut all_set, mut all_clear) = (true, true);
    for lane in 0..8 {
        let hit = va.s16(lane) > vb.s16(lane);
        out.set_u16(lane, if hit { 0xFFFF } else { 0 });
        all_set &= hit;
        all_clear &= !hit;
    }
    (out, all_set, all_clear)
}

pub fn vcmpgtsw(va: VReg, vb: VReg) -> (VReg, bool, bool) {
    let mut out = VReg::default();
    let (mut all_set, mut all_clear) = (true, true);
    for lane in 0..4 {
        let hit = va.s32(lane) > vb.s32(lane);
        out.set_u32(lane, if hit { 0xFFFF_FFFF } else { 0 });
        all_set &= hit;
        all_clear &= !hit;
    }
    (out, all_set, all_clear)
}

macro_rules! fp_compare {
    ($name:ident, |$a:ident, $b:ident| $cond:expr) => {
        pub fn $name(va: VReg, vb: VReg) -> (VReg, bool, bool) {
            let mut out = VReg::default();
            let (mut all_set, mut all_clear) = (true, true);
            for lane in 0..4 {
                let $a = va.f32(lane);
                let $b = vb.f32(lane);
                let hit = $cond;
                out.set_u32(lane, if hit { 0xFFFF_FFFF } else { 0 });
                all_set &= hit;
                all_clear &= !hit;
            }
            (out, all_set, all_clear)
        }
    };
}

fp_compare!(vcmpeqfp, |a, b| a == b);
fp_compare!(vcmpgtfp, |a, b| a > b);
fp_compare!(vcmpgefp, |a, b| a >= b);

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// vcfsx: signed words to floats, divided by 2^uimm.
pub fn vcfsx(vb: VReg, uimm: u32) -> VReg {
    let scale = (1u64 << uimm) as f32;
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, vb.s32(lane) as f32 / scale);
    }
    out
}

/// vcfux: unsigned words to floats, divided by 2^uimm.
pub fn vcfux(vb: VReg, uimm: u32) -> VReg {
    let scale = (1u64 << uimm) as f32;
    let mut out = VReg::default();
    for lane in 0..4 {
        out.set_f32(lane, vb.u32(lane) as f32 / scale);
    }
    out
}

/// vctsxs: floats times 2^uimm to signed words with saturation. NaN
/// converts to zero; the flag is set iff any element clamped.
pub fn vctsxs(vb: VReg, uimm: u32) -> (VReg, bool) {
    let scale = (1u64 << uimm) as f32;
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..4 {
        let x = vb.f32(lane) * scale;
        let v = if x.is_nan() {
            0
        } else if x >= i32::MAX as f32 {
            sat = true;
            i32::MAX
        } else if x <= i32::MIN as f32 {
            sat = true;
            i32::MIN
        } else {
            x as i32
        };
        out.set_s32(lane, v);
    }
    (out, sat)
}

/// vctuxs: floats times 2^uimm to unsigned words with saturation.
pub fn vctuxs(vb: VReg, uimm: u32) -> (VReg, bool) {
    let scale = (1u64 << uimm) as f32;
    let mut out = VReg::default();
    let mut sat = false;
    for lane in 0..4 {
        let x = vb.f32(lane) * scale;
        let v = if x.is_nan() || x <= 0.0 {
            sat |= x < 0.0;
            0
        } else if x >= u32::MAX as f32 {
            sat = true;
            u32::MAX
        } else {
            x as u32
        };
        out.set_u32(lane, v);
    }
    (out, sat)
}

/// vpkshus: pack signed halfwords to unsigned bytes with saturation.
/// Result guest bytes 0..7 come from vA, 8..15 from vB.
pub fn vpkshus(va: VReg, vb: VReg) -> (VReg, bool) {
    let mut out = VReg::default();
    let mut sat = false;
    for el in 0..8 {
        for (off, src) in [(0usize, va), (8usize, vb)] {
            let h = src.u16_el(el) as i16;
            let b = if h < 0 {
                sat = true;
                0
            } else if h > 0xFF {
                sat = true;
                0xFF
            } else {
                h as u8
            };
            set_guest_byte(&mut out, off + el, b);
        }
    }
    (out, sat)
}

/// vupkhsb: unpack the high (guest bytes 0..7) signed bytes to halfwords.
pub fn vupkhsb(vb: VReg) -> VReg {
    let mut out = VReg::default();
    for el in 0..8 {
        out.set_u16_el(el, guest_byte(vb, el) as i8 as i16 as u16);
    }
    out
}

/// vupklsb: unpack the low (guest bytes 8..15) signed bytes to halfwords.
pub fn vupklsb(vb: VReg) -> VReg {
    let mut out = VReg::default();
    for el in 0..8 {
        out.set_u16_el(el, guest_byte(vb, 8 + el) as i8 as i16 as u16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v_el(words: [u32; 4]) -> VReg {
        let mut v = VReg::default();
        for (el, w) in words.into_iter().enumerate() {
            v.set_u32_el(el, w);
        }
        v
    }

    #[test]
    fn splat_reads_reversed_lane() {
        // Guest elements 0..3 = 1..4. Splatting guest element 0 must
        // broadcast host lane 3.
        let v = v_el([0x1, 0x2, 0x3, 0x4]);
        let out = vspltw(v, 0);
        for lane in 0..4 {
            assert_eq!(out.u32(lane), 0x1);
        }
        // The source value sits in host lane 3.
        assert_eq!(v.u32(3), 0x1);
    }

    #[test]
    fn saturating_word_add_clamps_and_flags() {
        let a = v_el([i32::MAX as u32, 1, (-5i32) as u32, i32::MIN as u32]);
        let b = v_el([1, 2, 3, (-1i32) as u32]);
        let (out, sat) = vaddsws(a, b);
        assert!(sat);
        assert_eq!(out.u32_el(0), i32::MAX as u32);
        assert_eq!(out.s32_el(1), 3);
        assert_eq!(out.s32_el(2), -2);
        assert_eq!(out.u32_el(3), i32::MIN as u32);
    }

    #[test]
    fn saturating_add_without_overflow_keeps_flag_clear() {
        let a = v_el([1, 2, 3, 4]);
        let (out, sat) = vaddsws(a, a);
        assert!(!sat);
        assert_eq!(out.u32_el(2), 6);
    }

    #[test]
    fn compare_reductions_cover_mask_extremes() {
        let a = v_el([1, 2, 3, 4]);
        let (_, all_set, all_clear) = vcmpequw(a, a);
        assert!(all_set && !all_clear);
        let b = v_el([5, 6, 7, 8]);
        let (_, all_set, all_clear) = vcmpequw(a, b);
        assert!(!all_set && all_clear);
        let c = v_el([1, 6, 3, 8]);
        let (mask, all_set, all_clear) = vcmpequw(a, c);
        assert!(!all_set && !all_clear);
        assert_eq!(mask.u32_el(0), 0xFFFF_FFFF);
        assert_eq!(mask.u32_el(1), 0);
    }

    #[test]
    fn perm_indexes_guest_bytes() {
        let mut a = VReg::default();
        let mut b = VReg::default();
        for i in 0..16 {
            set_guest_byte(&mut a, i, i as u8);
            set_guest_byte(&mut b, i, 0x10 + i as u8);
        }
        // Identity control 0..15 reproduces vA; 16..31 selects vB.
        let mut ident = VReg::default();
        let mut swap = VReg::default();
        for i in 0..16 {
            set_guest_byte(&mut ident, i, i as u8);
            set_guest_byte(&mut swap, i, 16 + i as u8);
        }
        assert_eq!(vperm(a, b, ident), a);
        assert_eq!(vperm(a, b, swap), b);
    }

    #[test]
    fn sldoi_concatenates_in_guest_order() {
        let mut a = VReg::default();
        let mut b = VReg::default();
        for i in 0..16 {
            set_guest_byte(&mut a, i, i as u8);
            set_guest_byte(&mut b, i, 0x20 + i as u8);
        }
        let out = vsldoi(a, b, 4);
        assert_eq!(guest_byte(out, 0), 4);
        assert_eq!(guest_byte(out, 11), 15);
        assert_eq!(guest_byte(out, 12), 0x20);
    }

    #[test]
    fn merge_high_takes_guest_elements_0_and_1() {
        let a = v_el([0xA0, 0xA1, 0xA2, 0xA3]);
        let b = v_el([0xB0, 0xB1, 0xB2, 0xB3]);
        let hi = vmrghw(a, b);
        assert_eq!(
            [hi.u32_el(0), hi.u32_el(1), hi.u32_el(2), hi.u32_el(3)],
            [0xA0, 0xB0, 0xA1, 0xB1]
        );
        let lo = vmrglw(a, b);
        assert_eq!(
            [lo.u32_el(0), lo.u32_el(1), lo.u32_el(2), lo.u32_el(3)],
            [0xA2, 0xB2, 0xA3, 0xB3]
        );
    }

    #[test]
    fn ctsxs_saturates_and_zeroes_nan() {
        let mut v = VReg::default();
        v.set_f32_el(0, 3.0e10);
        v.set_f32_el(1, f32::NAN);
        v.set_f32_el(2, -3.0e10);
        v.set_f32_el(3, 2.5);
        let (out, sat) = vctsxs(v, 0);
        assert!(sat);
        assert_eq!(out.s32_el(0), i32::MAX);
        assert_eq!(out.s32_el(1), 0);
        assert_eq!(out.s32_el(2), i32::MIN);
        assert_eq!(out.s32_el(3), 2);
    }
}
