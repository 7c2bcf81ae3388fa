// emit - host source generation
//
// Every guest function becomes a host function
// `fn sub_XXXXXXXX(ctx: &mut GuestContext, base: *mut u8)`. Rust has no
// goto, so intra-function control flow compiles to a block state
// machine: a loop over a match on the current block address. Branches
// assign the next label and continue; fallthrough assigns the next
// sequential block; returns leave the function. Jump tables become a
// plain label assignment from ctr, since every table target is an arm.
//
// Semantic fragments are produced by per-opcode builders grouped the way
// the instruction set groups them: integer, memory, fp, vector, system.

mod fp;
mod integer;
mod memory;
mod system;
mod vector;

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use anyhow::{bail, Result};

use crate::analyze::{BasicBlock, Function, FunctionGraph};
use crate::config::{MidAsmHook, RecompilerConfig};
use crate::disasm::{Instruction, Opcode};

/// Functions per generated source file.
const FUNCS_PER_FILE: usize = 64;

/// What an emitted fragment did with control flow.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum Flow {
    /// Execution continues with the next instruction.
    Continue,
    /// The fragment transferred control (branch, return, dispatch).
    Closed,
}

/// Per-function emission context handed to the opcode builders.
pub struct FnEmitter<'a> {
    out: String,
    indent: usize,
    pub config: &'a RecompilerConfig,
    pub graph: &'a FunctionGraph,
    /// Entry addresses of every emitted function, for direct-call sites.
    pub names: &'a HashMap<u32, String>,
    /// Block labels of the current function.
    pub labels: BTreeSet<u32>,
    /// Name of the resumable body function, when the function contains
    /// diverted setjmp call sites.
    pub at_name: Option<String>,
}

impl<'a> FnEmitter<'a> {
    pub fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if !text.is_empty() {
            for _ in 0..self.indent {
                self.out.push_str("    ");
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    pub fn r(&self, i: u32) -> String {
        format!("ctx.r[{i}]")
    }

    pub fn f(&self, i: u32) -> String {
        format!("ctx.f[{i}]")
    }

    pub fn v(&self, i: u32) -> String {
        format!("ctx.v[{i}]")
    }

    pub fn cr(&self, i: u32) -> String {
        format!("ctx.cr[{i}]")
    }

    /// Effective-address expression for D-form memory access (ra == 0
    /// reads as literal zero).
    pub fn ea_d(&self, ra: u32, disp: u32) -> String {
        if ra == 0 {
            format!("{:#x}u32", disp)
        } else {
            format!("ctx.r[{ra}].u32().wrapping_add({:#x})", disp)
        }
    }

    /// Effective-address expression for X-form (indexed) access.
    pub fn ea_x(&self, ra: u32, rb: u32) -> String {
        if ra == 0 {
            format!("ctx.r[{rb}].u32()")
        } else {
            format!("ctx.r[{ra}].u32().wrapping_add(ctx.r[{rb}].u32())")
        }
    }
}

/// cr0 update for integer record forms: compare the 64-bit result with
/// zero and copy the summary-overflow bit.
pub(super) fn emit_record(e: &mut FnEmitter, insn: &Instruction, reg: u32) {
    if insn.rc() {
        e.line(format!(
            "ctx.cr[0].compare_s64(ctx.r[{reg}].s64(), 0, &ctx.xer);"
        ));
    }
}

/// Emitter output: generated files plus bookkeeping for the manifest.
pub struct Output {
    /// (file name, contents) pairs.
    pub files: Vec<(String, String)>,
    pub function_count: usize,
}

pub struct Recompiler<'a> {
    pub graph: &'a FunctionGraph,
    pub config: &'a RecompilerConfig,
}

impl<'a> Recompiler<'a> {
    pub fn new(graph: &'a FunctionGraph, config: &'a RecompilerConfig) -> Self {
        Self { graph, config }
    }

    pub fn emit(&self) -> Result<Output> {
        let names: HashMap<u32, String> = self
            .graph
            .functions
            .iter()
            .map(|f| (f.entry, f.name.clone()))
            .collect();

        let project = &self.config.project_name;
        let mut files = Vec::new();
        let mut source_names = Vec::new();

        for (file_idx, chunk) in self.graph.functions.chunks(FUNCS_PER_FILE).enumerate() {
            let mut text = String::new();
            for func in chunk {
                let body = self.emit_function(func, &names)?;
                text.push_str(&body);
                text.push('\n');
            }
            let name = format!("{project}_ppc_recomp_{file_idx:03}.rs");
            source_names.push(name.clone());
            files.push((name, text));
        }

        // Function table initialization file.
        let mapping_name = format!("{project}_ppc_func_mapping.rs");
        let mut mapping = String::new();
        writeln!(
            mapping,
            "pub static FUNC_MAPPINGS: &[FuncMapping] = &["
        )?;
        for func in &self.graph.functions {
            writeln!(
                mapping,
                "    FuncMapping {{ guest: {:#010x}, host: {} }},",
                func.entry, func.name
            )?;
        }
        writeln!(mapping, "];")?;
        writeln!(mapping)?;
        writeln!(mapping, "pub const CODE_BASE: u32 = {:#010x};", self.graph.code_base)?;
        writeln!(mapping, "pub const CODE_SIZE: u32 = {:#010x};", self.graph.code_size)?;
        files.push((mapping_name.clone(), mapping));

        // Module root stitching the pieces together.
        let mut root = String::new();
        writeln!(root, "// Generated by ppc2rs. Do not edit.")?;
        writeln!(
            root,
            "#![allow(clippy::all, unused_imports, unused_mut, unused_variables, unreachable_code)]"
        )?;
        writeln!(root)?;
        writeln!(root, "use ppc2rs_runtime::context::GuestContext;")?;
        writeln!(root, "use ppc2rs_runtime::FuncMapping;")?;
        writeln!(
            root,
            "use ppc2rs_runtime::{{clock, dispatch, guest, simd, sync, traps}};"
        )?;
        writeln!(root)?;
        if !self.config.mid_asm_hooks.is_empty() {
            writeln!(root, "// Mid-asm hooks are supplied by the embedding crate.")?;
            writeln!(root, "use super::hooks;")?;
            writeln!(root)?;
        }
        for name in &source_names {
            writeln!(root, "include!(\"{name}\");")?;
        }
        writeln!(root, "include!(\"{mapping_name}\");")?;
        files.push((format!("{project}_ppc_recomp.rs"), root));

        // Build manifest.
        let manifest = serde_json::json!({
            "project": project,
            "root": format!("{project}_ppc_recomp.rs"),
            "sources": source_names,
            "function_mapping": mapping_name,
            "function_count": self.graph.functions.len(),
        });
        files.push((
            format!("{project}_manifest.json"),
            serde_json::to_string_pretty(&manifest)? + "\n",
        ));

        Ok(Output {
            files,
            function_count: self.graph.functions.len(),
        })
    }

    fn emit_function(&self, func: &Function, names: &HashMap<u32, String>) -> Result<String> {
        let blocks = split_for_setjmp(func, self.config);
        if blocks.is_empty() {
            // Forced emission may reach a function whose body failed
            // analysis; keep the symbol so the mapping table stays whole.
            return Ok(format!(
                "pub fn {}(_ctx: &mut GuestContext, _base: *mut u8) {{}}\n",
                func.name
            ));
        }
        let has_setjmp = self.config.set_jmp_address != 0
            && blocks.iter().any(|b| {
                b.instructions.iter().any(|i| {
                    i.opcode == Opcode::B && i.lk() && i.operands[0] == self.config.set_jmp_address
                })
            });

        let mut e = FnEmitter {
            out: String::new(),
            indent: 0,
            config: self.config,
            graph: self.graph,
            names,
            labels: blocks.iter().map(|b| b.start).collect(),
            at_name: has_setjmp.then(|| format!("{}_at", func.name)),
        };

        let with_handlers = self.config.generate_exception_handlers;

        if let Some(at_name) = e.at_name.clone() {
            e.line(format!(
                "pub fn {}(ctx: &mut GuestContext, base: *mut u8) {{",
                func.name
            ));
            e.indent += 1;
            if with_handlers {
                e.line(format!(
                    "sync::with_exception_handler(ctx, base, |ctx, base| {at_name}(ctx, base, {:#010x}));",
                    func.entry
                ));
            } else {
                e.line(format!("{at_name}(ctx, base, {:#010x});", func.entry));
            }
            e.indent -= 1;
            e.line("}");
            e.line("");
            e.line(format!(
                "fn {at_name}(ctx: &mut GuestContext, base: *mut u8, entry: u32) {{"
            ));
            e.indent += 1;
            e.line("debug_assert_eq!(base as usize & 0x1F, 0);");
            e.line("let mut label: u32 = entry;");
        } else {
            e.line(format!(
                "pub fn {}(ctx: &mut GuestContext, base: *mut u8) {{",
                func.name
            ));
            e.indent += 1;
            e.line("debug_assert_eq!(base as usize & 0x1F, 0);");
            if with_handlers {
                e.line("sync::with_exception_handler(ctx, base, |ctx, base| {");
                e.indent += 1;
            }
            e.line(format!("let mut label: u32 = {:#010x};", func.entry));
        }

        e.line("loop {");
        e.indent += 1;
        e.line("match label {");
        e.indent += 1;

        let block_starts: Vec<u32> = blocks.iter().map(|b| b.start).collect();
        for (bi, block) in blocks.iter().enumerate() {
            e.line(format!("{:#010x} => {{", block.start));
            e.indent += 1;
            let mut flow = Flow::Continue;
            for insn in &block.instructions {
                flow = self.emit_with_hooks(&mut e, insn)?;
            }
            if flow == Flow::Continue {
                // Fallthrough into the next sequential block, or off the
                // end of the function.
                let next = block_starts.get(bi + 1).copied().filter(|&n| n == block.end);
                match next {
                    Some(n) => e.line(format!("label = {n:#010x};")),
                    None => e.line("return;"),
                }
            }
            e.indent -= 1;
            e.line("}");
        }

        e.line("_ => unreachable!(\"corrupt block label {label:#010x}\"),");
        e.indent -= 1;
        e.line("}");
        e.indent -= 1;
        e.line("}");

        if e.at_name.is_none() && with_handlers {
            e.indent -= 1;
            e.line("});");
        }
        e.indent -= 1;
        e.line("}");

        Ok(e.out)
    }

    /// Emit one instruction, wrapped by any mid-asm hook declared at its
    /// address.
    fn emit_with_hooks(&self, e: &mut FnEmitter, insn: &Instruction) -> Result<Flow> {
        let hook = self.config.mid_asm_hooks.get(&insn.addr);

        if let Some(hook) = hook {
            if !hook.after_instruction {
                if emit_hook_call(e, hook) == Flow::Closed {
                    return Ok(Flow::Closed);
                }
            }
        }

        let flow = emit_instruction(e, insn)?;

        if let Some(hook) = hook {
            if hook.after_instruction && flow == Flow::Continue {
                if emit_hook_call(e, hook) == Flow::Closed {
                    return Ok(Flow::Closed);
                }
            }
        }

        Ok(flow)
    }
}

/// Emit a hook invocation with its return/jump overrides. Conditional
/// overrides use the hook's boolean result.
fn emit_hook_call(e: &mut FnEmitter, hook: &MidAsmHook) -> Flow {
    let name = &hook.name;
    if hook.ret {
        e.line(format!("hooks::{name}(ctx, base);"));
        e.line("return;");
        return Flow::Closed;
    }
    if hook.jump_address != 0 {
        e.line(format!("hooks::{name}(ctx, base);"));
        e.line(format!("label = {:#010x};", hook.jump_address));
        e.line("continue;");
        return Flow::Closed;
    }
    if hook.ret_on_true || hook.ret_on_false {
        let cond = if hook.ret_on_true { "" } else { "!" };
        e.line(format!("if {cond}hooks::{name}(ctx, base) {{"));
        e.line("    return;");
        e.line("}");
        return Flow::Continue;
    }
    if hook.jump_address_on_true != 0 || hook.jump_address_on_false != 0 {
        let (cond, target) = if hook.jump_address_on_true != 0 {
            ("", hook.jump_address_on_true)
        } else {
            ("!", hook.jump_address_on_false)
        };
        e.line(format!("if {cond}hooks::{name}(ctx, base) {{"));
        e.line(format!("    label = {target:#010x};"));
        e.line("    continue;");
        e.line("}");
        return Flow::Continue;
    }
    e.line(format!("hooks::{name}(ctx, base);"));
    Flow::Continue
}

/// Split blocks after diverted setjmp call sites so the continuation has
/// its own label the setjmp shim can re-enter.
fn split_for_setjmp(func: &Function, config: &RecompilerConfig) -> Vec<BasicBlock> {
    if config.set_jmp_address == 0 {
        return func.blocks.clone();
    }
    let mut out = Vec::with_capacity(func.blocks.len());
    for block in &func.blocks {
        let mut current = BasicBlock {
            start: block.start,
            end: block.end,
            instructions: Vec::new(),
            successors: Vec::new(),
        };
        for insn in &block.instructions {
            let is_setjmp_call = insn.opcode == Opcode::B
                && insn.lk()
                && insn.operands[0] == config.set_jmp_address;
            current.instructions.push(*insn);
            if is_setjmp_call {
                let next = insn.addr + 4;
                current.end = next;
                current.successors = vec![next];
                out.push(std::mem::replace(
                    &mut current,
                    BasicBlock {
                        start: next,
                        end: block.end,
                        instructions: Vec::new(),
                        successors: Vec::new(),
                    },
                ));
            }
        }
        if !current.instructions.is_empty() {
            current.successors = block.successors.clone();
            out.push(current);
        }
    }
    out
}

/// BO field helpers shared with the analyzer.
fn bo_decrements_ctr(bo: u32) -> bool {
    bo & 4 == 0
}

fn bo_tests_condition(bo: u32) -> bool {
    bo & 16 == 0
}

/// Condition expression for a BO/BI pair, None when unconditional.
fn branch_condition(bo: u32, bi: u32) -> Option<String> {
    let mut parts = Vec::new();
    if bo_decrements_ctr(bo) {
        // CTR was decremented just before this test.
        if bo & 2 != 0 {
            parts.push("ctx.ctr.u64() == 0".to_string());
        } else {
            parts.push("ctx.ctr.u64() != 0".to_string());
        }
    }
    if bo_tests_condition(bo) {
        let field = bi / 4;
        let bit = ["lt", "gt", "eq", "so"][(bi % 4) as usize];
        if bo & 8 != 0 {
            parts.push(format!("ctx.cr[{field}].{bit}"));
        } else {
            parts.push(format!("!ctx.cr[{field}].{bit}"));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" && "))
    }
}

fn emit_ctr_decrement(e: &mut FnEmitter, bo: u32) {
    if bo_decrements_ctr(bo) {
        e.line("ctx.ctr.set_u64(ctx.ctr.u64().wrapping_sub(1));");
    }
}

/// Direct call: a known function is called by name, anything else goes
/// through the dispatch table.
fn emit_call(e: &mut FnEmitter, target: u32) {
    match e.names.get(&target) {
        Some(name) => e.line(format!("{name}(ctx, base);")),
        None => e.line(format!("dispatch(ctx, base, {target:#010x});")),
    }
}

fn emit_branch(e: &mut FnEmitter, insn: &Instruction) -> Result<Flow> {
    match insn.opcode {
        Opcode::B => {
            let target = insn.operands[0];
            let next = insn.addr + 4;
            if insn.lk() {
                // Call forms, including the setjmp/longjmp diversions.
                if target == e.config.set_jmp_address && e.config.set_jmp_address != 0 {
                    let at_name = e
                        .at_name
                        .clone()
                        .expect("setjmp call site outside resumable function");
                    if !e.config.skip_lr {
                        e.line(format!("ctx.lr = {next:#010x};"));
                    }
                    e.line(format!(
                        "sync::guest_setjmp(ctx, base, |ctx, base| {at_name}(ctx, base, {next:#010x}));"
                    ));
                    e.line("return;");
                    return Ok(Flow::Closed);
                }
                if target == e.config.long_jmp_address && e.config.long_jmp_address != 0 {
                    e.line("sync::guest_longjmp(ctx, base);");
                    return Ok(Flow::Closed);
                }
                if !e.config.skip_lr {
                    e.line(format!("ctx.lr = {next:#010x};"));
                }
                emit_call(e, target);
                Ok(Flow::Continue)
            } else if e.labels.contains(&target) {
                e.line(format!("label = {target:#010x};"));
                e.line("continue;");
                Ok(Flow::Closed)
            } else {
                // Tail call to another function.
                emit_call(e, target);
                e.line("return;");
                Ok(Flow::Closed)
            }
        }
        Opcode::Bc => {
            let bo = insn.operands[0];
            let bi = insn.operands[1];
            let target = insn.operands[2];
            emit_ctr_decrement(e, bo);
            if insn.lk() {
                // Conditional call: uncommon, but well-defined.
                match branch_condition(bo, bi) {
                    Some(cond) => {
                        e.line(format!("if {cond} {{"));
                        e.indent += 1;
                        if !e.config.skip_lr {
                            e.line(format!("ctx.lr = {:#010x};", insn.addr + 4));
                        }
                        emit_call(e, target);
                        e.indent -= 1;
                        e.line("}");
                    }
                    None => {
                        if !e.config.skip_lr {
                            e.line(format!("ctx.lr = {:#010x};", insn.addr + 4));
                        }
                        emit_call(e, target);
                    }
                }
                return Ok(Flow::Continue);
            }
            if !e.labels.contains(&target) {
                bail!(
                    "conditional branch at {:#010x} targets {target:#010x} outside the function",
                    insn.addr
                );
            }
            match branch_condition(bo, bi) {
                Some(cond) => {
                    e.line(format!("if {cond} {{"));
                    e.line(format!("    label = {target:#010x};"));
                    e.line("    continue;");
                    e.line("}");
                    Ok(Flow::Continue)
                }
                None => {
                    e.line(format!("label = {target:#010x};"));
                    e.line("continue;");
                    Ok(Flow::Closed)
                }
            }
        }
        Opcode::Bclr => {
            let bo = insn.operands[0];
            let bi = insn.operands[1];
            emit_ctr_decrement(e, bo);
            match branch_condition(bo, bi) {
                Some(cond) => {
                    e.line(format!("if {cond} {{"));
                    e.line("    return;");
                    e.line("}");
                    Ok(Flow::Continue)
                }
                None => {
                    e.line("return;");
                    Ok(Flow::Closed)
                }
            }
        }
        Opcode::Bcctr => {
            // bctr: jump table, declared indirect call, or computed call
            // with link.
            if insn.lk() {
                if !e.config.skip_lr {
                    e.line(format!("ctx.lr = {:#010x};", insn.addr + 4));
                }
                e.line("dispatch(ctx, base, ctx.ctr.u32());");
                return Ok(Flow::Continue);
            }
            if e.graph.jump_tables.contains_key(&insn.addr) {
                // Every table target is an arm of this function's match.
                e.line("label = ctx.ctr.u32();");
                e.line("continue;");
                return Ok(Flow::Closed);
            }
            if e.config.known_indirect_call_hints.contains(&insn.addr) {
                e.line("dispatch(ctx, base, ctx.ctr.u32());");
                e.line("return;");
                return Ok(Flow::Closed);
            }
            bail!(
                "bctr at {:#010x} has no jump table and is not a declared indirect call",
                insn.addr
            );
        }
        _ => unreachable!("emit_branch on non-branch"),
    }
}

/// Dispatch one instruction to its builder.
pub fn emit_instruction(e: &mut FnEmitter, insn: &Instruction) -> Result<Flow> {
    use Opcode::*;
    match insn.opcode {
        B | Bc | Bclr | Bcctr => return emit_branch(e, insn),
        Sc => {
            // System calls do not occur in title code; the kernel is
            // reached through imports.
            e.line(format!(
                "traps::trap_service(ctx, base, 0); // sc at {:#010x}",
                insn.addr
            ));
            return Ok(Flow::Continue);
        }
        Unknown => bail!(
            "unknown opcode {:#010x} at {:#010x} reached emission",
            insn.word,
            insn.addr
        ),
        _ => {}
    }

    match insn.opcode {
        // Integer
        Add | Addc | Adde | Addi | Addic | AddicRecord | Addis | Addme | Addze | Subf | Subfc
        | Subfe | Subfic | Subfme | Subfze | Neg | Mulli | Mullw | Mulhw | Mulhwu | Mulld
        | Mulhd | Mulhdu | Divw | Divwu | Divd | Divdu | And | Andc | AndiRecord | AndisRecord
        | Or | Orc | Ori | Oris | Xor | Xori | Xoris | Nand | Nor | Eqv | Mr | Extsb | Extsh
        | Extsw | Cntlzw | Cntlzd | Slw | Srw | Sraw | Srawi | Sld | Srd | Srad | Sradi
        | Rlwinm | Rlwimi | Rlwnm | Rldicl | Rldicr | Rldic | Rldimi | Cmp | Cmpi | Cmpl
        | Cmpli => integer::emit(e, insn)?,

        // Memory
        Lbz | Lbzu | Lbzx | Lhz | Lhzu | Lhzx | Lha | Lhau | Lhax | Lwz | Lwzu | Lwzx | Lwa
        | Lwax | Ld | Ldu | Ldx | Lhbrx | Lwbrx | Lfs | Lfsu | Lfsx | Lfd | Lfdu | Lfdx | Stb
        | Stbu | Stbx | Sth | Sthu | Sthx | Stw | Stwu | Stwx | Std | Stdu | Stdx | Sthbrx
        | Stwbrx | Stfs | Stfsu | Stfsx | Stfd | Stfdu | Stfdx | Stfiwx | Lwarx | Ldarx
        | StwcxRecord | StdcxRecord | Lvx | Lvlx | Lvrx | Stvx | Stvlx | Stvrx | Lvsl | Lvsr => {
            memory::emit(e, insn)?
        }

        // Floating point
        Fmr | Fneg | Fabs | Fnabs | Fadd | Fadds | Fsub | Fsubs | Fmul | Fmuls | Fdiv | Fdivs
        | Fsqrt | Fsqrts | Fmadd | Fmadds | Fmsub | Fmsubs | Fnmadd | Fnmadds | Fnmsub
        | Fnmsubs | Fsel | Fres | Frsqrte | Frsp | Fctiw | Fctiwz | Fctid | Fctidz | Fcfid
        | Fcmpu => fp::emit(e, insn)?,

        // Vector
        Vaddfp | Vsubfp | Vmaddfp | Vnmsubfp | Vmaxfp | Vminfp | Vrefp | Vrsqrtefp | Vexptefp
        | Vlogefp | Vrfim | Vrfin | Vrfip | Vrfiz | Vaddubm | Vadduhm | Vadduwm | Vaddubs
        | Vadduhs | Vaddsbs | Vaddshs | Vaddsws | Vsububm | Vsubuhm | Vsubuwm | Vsububs
        | Vsubshs | Vsubsws | Vand | Vandc | Vor | Vxor | Vnor | Vsel | Vperm | Vsldoi | Vrlw
        | Vslb | Vslh | Vslw | Vsl | Vsrh | Vsrw | Vsraw | Vsr | Vslo | Vsro | Vmrghw | Vmrglw
        | Vspltb | Vsplth | Vspltw | Vspltisb | Vspltish | Vspltisw | Vpkshus | Vupkhsb
        | Vupklsb | Vcmpequb | Vcmpequh | Vcmpequw | Vcmpgtub | Vcmpgtuw | Vcmpgtsb | Vcmpgtsh
        | Vcmpgtsw | Vcmpeqfp | Vcmpgtfp | Vcmpgefp | Vcfsx | Vcfux | Vctsxs | Vctuxs
        | Vmulfp128 | Vmsum3fp128 | Vmsum4fp128 => vector::emit(e, insn)?,

        // System
        _ => system::emit(e, insn)?,
    }

    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze;
    use crate::config::RecompilerConfig;
    use crate::disasm;
    use crate::image::{CodeSection, Image};
    use std::collections::HashSet;

    fn test_config() -> RecompilerConfig {
        RecompilerConfig {
            project_name: "demo".into(),
            file_path: "demo.elf".into(),
            out_directory_path: "out".into(),
            config_dir: ".".into(),
            skip_lr: false,
            skip_msr: false,
            generate_exception_handlers: false,
            max_jump_extension: 65536,
            data_region_threshold: 16,
            large_function_threshold: 1024 * 1024,
            functions: HashMap::new(),
            switch_tables: HashMap::new(),
            mid_asm_hooks: HashMap::new(),
            invalid_instruction_hints: HashMap::new(),
            known_indirect_call_hints: HashSet::new(),
            exception_handler_func_hints: Vec::new(),
            long_jmp_address: 0,
            set_jmp_address: 0,
        }
    }

    fn emit_words(words: &[u32], config: &RecompilerConfig) -> String {
        let mut data = Vec::new();
        for w in words {
            data.extend_from_slice(&w.to_be_bytes());
        }
        let section = CodeSection {
            vaddr: 0x8200_0000,
            data,
            name: ".text".into(),
        };
        let image = Image {
            entry: 0x8200_0000,
            segments: vec![],
            code_base: 0x8200_0000,
            code_size: (words.len() * 4) as u32,
        };
        let insns = disasm::disassemble(&section).unwrap();
        let (graph, diags) = analyze(&image, &[section], insns, config).unwrap();
        assert!(!diags.has_errors(), "analysis errors: {:?}", diags.errors);
        let output = Recompiler::new(&graph, config).emit().unwrap();
        output
            .files
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn add_record_form_updates_cr0() {
        // add. r3, r4, r5 ; blr
        let text = emit_words(&[0x7C64_2A15, 0x4E80_0020], &test_config());
        assert!(text.contains("ctx.r[3].set_u64(ctx.r[4].u64().wrapping_add(ctx.r[5].u64()));"));
        assert!(text.contains("ctx.cr[0].compare_s64(ctx.r[3].s64(), 0, &ctx.xer);"));
    }

    #[test]
    fn stores_go_through_the_mmio_checker() {
        // stw r3, 0(r4) ; lhz r5, 2(r4) ; blr
        let text = emit_words(
            &[0x9064_0000, 0xA0A4_0002, 0x4E80_0020],
            &test_config(),
        );
        assert!(text.contains("guest::store_u32_mmio(base, ea, ctx.r[3].u32());"));
        assert!(text.contains("ctx.r[5].set_u64(guest::load_u16_mmio(base, ea) as u64);"));
        // Byte loads skip the checker.
        assert!(!text.contains("load_u8_mmio"));
    }

    #[test]
    fn conditional_branch_becomes_label_assignment() {
        // cmpwi r3, 0 ; bne +8 ; li r3, 1 ; blr
        let text = emit_words(
            &[0x2C03_0000, 0x4082_0008, 0x3860_0001, 0x4E80_0020],
            &test_config(),
        );
        assert!(text.contains("ctx.cr[0].compare_s32(ctx.r[3].s32(), 0i32, &ctx.xer);"));
        assert!(text.contains("if !ctx.cr[0].eq {"));
        assert!(text.contains("label = 0x82000008;"));
    }

    #[test]
    fn unconditional_trap_carries_its_selector() {
        // twi 31, r0, 20 ; blr
        let text = emit_words(&[0x0FE0_0014, 0x4E80_0020], &test_config());
        assert!(text.contains("traps::trap_service(ctx, base, 20);"));
    }

    #[test]
    fn vector_splat_uses_the_reversing_helper() {
        // vspltw v2, v3, 0 ; blr
        let w = (4 << 26) | (2 << 21) | (3 << 11) | 0x28C;
        let text = emit_words(&[w, 0x4E80_0020], &test_config());
        assert!(text.contains("ctx.v[2] = simd::vspltw(ctx.v[3], 0);"));
    }

    #[test]
    fn divide_pre_checks_the_host_fault() {
        // divw r3, r4, r5 ; blr
        let w = (31 << 26) | (3 << 21) | (4 << 16) | (5 << 11) | (491 << 1);
        let text = emit_words(&[w, 0x4E80_0020], &test_config());
        assert!(text.contains("let ok = b != 0 && !(a == i32::MIN && b == -1);"));
    }

    #[test]
    fn direct_call_sets_lr_and_calls_by_name() {
        // f0: bl +8 ; blr    f1: blr
        let text = emit_words(
            &[0x4800_0009, 0x4E80_0020, 0x4E80_0020],
            &test_config(),
        );
        assert!(text.contains("ctx.lr = 0x82000004;"));
        assert!(text.contains("sub_82000008(ctx, base);"));
    }

    #[test]
    fn mapping_file_lists_every_function() {
        let mut data = Vec::new();
        for w in [0x3860_0001u32, 0x4E80_0020] {
            data.extend_from_slice(&w.to_be_bytes());
        }
        let section = CodeSection {
            vaddr: 0x8200_0000,
            data,
            name: ".text".into(),
        };
        let image = Image {
            entry: 0x8200_0000,
            segments: vec![],
            code_base: 0x8200_0000,
            code_size: 8,
        };
        let config = test_config();
        let insns = disasm::disassemble(&section).unwrap();
        let (graph, _) = analyze(&image, &[section], insns, &config).unwrap();
        let output = Recompiler::new(&graph, &config).emit().unwrap();

        let mapping = output
            .files
            .iter()
            .find(|(n, _)| n == "demo_ppc_func_mapping.rs")
            .unwrap();
        assert!(mapping
            .1
            .contains("FuncMapping { guest: 0x82000000, host: sub_82000000 },"));
        assert!(mapping.1.contains("pub const CODE_BASE: u32 = 0x82000000;"));

        let manifest = output
            .files
            .iter()
            .find(|(n, _)| n == "demo_manifest.json")
            .unwrap();
        assert!(manifest.1.contains("\"function_count\": 1"));
    }

    #[test]
    fn setjmp_call_site_generates_resumable_body() {
        // f0: bl setjmp(+12) ; li r3, 1 ; blr    setjmp stub at +12: blr
        let mut config = test_config();
        config.set_jmp_address = 0x8200_000C;
        let text = emit_words(
            &[0x4800_000D, 0x3860_0001, 0x4E80_0020, 0x4E80_0020],
            &config,
        );
        assert!(text.contains("fn sub_82000000_at(ctx: &mut GuestContext, base: *mut u8, entry: u32)"));
        assert!(text.contains(
            "sync::guest_setjmp(ctx, base, |ctx, base| sub_82000000_at(ctx, base, 0x82000004));"
        ));
    }

    #[test]
    fn mid_asm_hook_runs_before_the_instruction() {
        let mut config = test_config();
        config.mid_asm_hooks.insert(
            0x8200_0000,
            MidAsmHook {
                name: "patch_entry".into(),
                ..Default::default()
            },
        );
        let text = emit_words(&[0x3860_0001, 0x4E80_0020], &config);
        let hook_pos = text.find("hooks::patch_entry(ctx, base);").unwrap();
        let insn_pos = text.find("ctx.r[3].set_s64(1i64);").unwrap();
        assert!(hook_pos < insn_pos);
    }

    #[test]
    fn exception_handlers_wrap_the_body_when_enabled() {
        let mut config = test_config();
        config.generate_exception_handlers = true;
        let text = emit_words(&[0x3860_0001, 0x4E80_0020], &config);
        assert!(text.contains("sync::with_exception_handler(ctx, base, |ctx, base| {"));
    }
}
