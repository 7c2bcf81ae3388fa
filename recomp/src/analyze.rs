// analyze.rs - function discovery and control-flow analysis
//
// Turns disassembled sections into a function graph for the emitter.
// Discovery is seeded by the image entry point, call targets, and user
// hints; each seed is swept linearly, with conditional branches and
// jump-table targets extending the function until its last reachable
// block. Explicit size/end hints always win over inference.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::Result;

use crate::config::{JumpTable, RecompilerConfig};
use crate::disasm::{Instruction, Opcode};
use crate::image::{CodeSection, Image};

/// A basic block of instructions.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: u32,
    /// Address after the last instruction.
    pub end: u32,
    pub instructions: Vec<Instruction>,
    /// Intra-function successor addresses.
    pub successors: Vec<u32>,
}

/// A discovered function, chunks merged in.
#[derive(Debug, Clone)]
pub struct Function {
    pub entry: u32,
    pub size: u32,
    pub name: String,
    /// Non-zero for discontinuous chunks folded into a parent.
    pub parent: u32,
    pub blocks: Vec<BasicBlock>,
}

/// A jump table resolved against image bytes.
#[derive(Debug, Clone)]
pub struct ResolvedJumpTable {
    pub base: u32,
    pub count: u32,
    pub stride: u32,
    /// Register the guarding bounds check tests.
    pub register: u32,
    /// Code targets, one per table element.
    pub targets: Vec<u32>,
}

/// Analyzer output: emitter input.
#[derive(Debug)]
pub struct FunctionGraph {
    pub functions: Vec<Function>,
    /// Resolved jump tables keyed by the bctr address.
    pub jump_tables: HashMap<u32, ResolvedJumpTable>,
    /// Every known function entry (for direct-call vs local-jump tests).
    pub entries: BTreeSet<u32>,
    pub entry: u32,
    pub code_base: u32,
    pub code_size: u32,
}

/// Collected analysis diagnostics. Errors block emission unless forced.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Diagnostics {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn warn(&mut self, msg: String) {
        log::warn!("{msg}");
        self.warnings.push(msg);
    }

    fn error(&mut self, msg: String) {
        log::error!("{msg}");
        self.errors.push(msg);
    }
}

/// BO bit helpers for conditional branches.
fn bo_decrements_ctr(bo: u32) -> bool {
    bo & 4 == 0
}

fn bo_tests_condition(bo: u32) -> bool {
    bo & 16 == 0
}

fn bo_is_unconditional(bo: u32) -> bool {
    !bo_decrements_ctr(bo) && !bo_tests_condition(bo)
}

struct Analyzer<'a> {
    config: &'a RecompilerConfig,
    insns: BTreeMap<u32, Instruction>,
    /// Addresses known to be data (hints plus detected runs).
    data: HashSet<u32>,
    jump_tables: HashMap<u32, ResolvedJumpTable>,
    diags: Diagnostics,
}

/// Analyze an image into a function graph.
pub fn analyze(
    image: &Image,
    sections: &[CodeSection],
    insns: Vec<Instruction>,
    config: &RecompilerConfig,
) -> Result<(FunctionGraph, Diagnostics)> {
    let insn_map: BTreeMap<u32, Instruction> = insns.into_iter().map(|i| (i.addr, i)).collect();

    let mut analyzer = Analyzer {
        config,
        insns: insn_map,
        data: HashSet::new(),
        jump_tables: HashMap::new(),
        diags: Diagnostics::default(),
    };

    // Config-level problems surface alongside analysis diagnostics.
    let validation = config.validate();
    analyzer.diags.warnings.extend(validation.warnings);
    analyzer.diags.errors.extend(validation.errors);

    analyzer.mark_data_regions();
    analyzer.resolve_declared_jump_tables(image, sections);

    // Seeds: image entry, declared functions and exception handlers,
    // then every direct call target found in the instruction stream.
    let mut seeds: BTreeSet<u32> = BTreeSet::new();
    seeds.insert(image.entry);
    for (&addr, func) in &config.functions {
        if !func.is_chunk() {
            seeds.insert(addr);
        }
    }
    seeds.extend(&config.exception_handler_func_hints);
    for insn in analyzer.insns.values() {
        if insn.opcode == Opcode::B && insn.lk() && !analyzer.is_data(insn.addr) {
            seeds.insert(insn.operands[0]);
        }
    }
    // setjmp/longjmp entries are diverted to the runtime shim; do not
    // treat them as recompilable bodies.
    seeds.remove(&config.set_jmp_address);
    seeds.remove(&config.long_jmp_address);

    let mut functions = Vec::new();
    let entries: BTreeSet<u32> = seeds.iter().copied().collect();
    for &entry in &seeds {
        if !analyzer.insns.contains_key(&entry) {
            analyzer
                .diags
                .warn(format!("function seed {entry:#010x} has no code"));
            continue;
        }
        let func = analyzer.build_function(entry, image, sections, &entries);
        functions.push(func);
    }

    // Fold declared chunks into their parents.
    for (&addr, hint) in &config.functions {
        if !hint.is_chunk() {
            continue;
        }
        let size = hint.get_size(addr);
        if size == 0 {
            analyzer
                .diags
                .error(format!("chunk {addr:#010x} has no size or end"));
            continue;
        }
        let blocks = analyzer.sweep_range(addr, addr + size, image, sections, &entries);
        match functions.iter_mut().find(|f| f.entry == hint.parent) {
            Some(parent) => parent.blocks.extend(blocks),
            None => analyzer.diags.error(format!(
                "chunk {addr:#010x} references unknown parent {:#010x}",
                hint.parent
            )),
        }
    }

    let graph = FunctionGraph {
        functions,
        jump_tables: analyzer.jump_tables,
        entries,
        entry: image.entry,
        code_base: image.code_base,
        code_size: image.code_size,
    };
    Ok((graph, analyzer.diags))
}

impl<'a> Analyzer<'a> {
    fn is_data(&self, addr: u32) -> bool {
        self.data.contains(&addr)
    }

    /// Data regions come from explicit hints and from runs of
    /// consecutive undecodable words at least `data_region_threshold`
    /// long.
    fn mark_data_regions(&mut self) {
        for (&addr, &size) in &self.config.invalid_instruction_hints {
            let mut a = addr;
            while a < addr + size {
                self.data.insert(a);
                a += 4;
            }
        }

        let threshold = self.config.data_region_threshold as usize;
        let addrs: Vec<u32> = self.insns.keys().copied().collect();
        let mut run: Vec<u32> = Vec::new();
        for addr in addrs {
            let unknown = self.insns[&addr].opcode == Opcode::Unknown;
            if unknown {
                run.push(addr);
            } else {
                if run.len() >= threshold {
                    self.data.extend(run.iter().copied());
                }
                run.clear();
            }
        }
        if run.len() >= threshold {
            self.data.extend(run);
        }
    }

    fn read_code_u32(sections: &[CodeSection], addr: u32) -> Option<u32> {
        for s in sections {
            let end = s.vaddr + s.data.len() as u32;
            if addr >= s.vaddr && addr + 4 <= end {
                let off = (addr - s.vaddr) as usize;
                return Some(u32::from_be_bytes([
                    s.data[off],
                    s.data[off + 1],
                    s.data[off + 2],
                    s.data[off + 3],
                ]));
            }
        }
        None
    }

    fn resolve_table(
        &mut self,
        bctr_addr: u32,
        table: &JumpTable,
        image: &Image,
        sections: &[CodeSection],
    ) {
        let mut targets = Vec::with_capacity(table.count as usize);
        let mut ok = true;
        for i in 0..table.count {
            let slot = table.base + i * table.stride;
            match Self::read_code_u32(sections, slot) {
                Some(target)
                    if target >= image.code_base
                        && target < image.code_base + image.code_size =>
                {
                    targets.push(target);
                }
                Some(target) => {
                    self.diags.error(format!(
                        "jump table at {bctr_addr:#010x}: element {i} targets non-code address {target:#010x}"
                    ));
                    ok = false;
                    break;
                }
                None => {
                    self.diags.error(format!(
                        "jump table at {bctr_addr:#010x}: element {i} outside image"
                    ));
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            // Table slots are pointer data, never code.
            let mut a = table.base;
            while a < table.base + table.count * table.stride {
                self.data.insert(a);
                a += 4;
            }
            self.jump_tables.insert(
                bctr_addr,
                ResolvedJumpTable {
                    base: table.base,
                    count: table.count,
                    stride: table.stride,
                    register: table.register,
                    targets,
                },
            );
        }
    }

    fn resolve_declared_jump_tables(&mut self, image: &Image, sections: &[CodeSection]) {
        let declared: Vec<(u32, JumpTable)> = self
            .config
            .switch_tables
            .iter()
            .map(|(&a, t)| (a, *t))
            .collect();
        for (addr, table) in declared {
            self.resolve_table(addr, &table, image, sections);
        }
    }

    /// Recognize the canonical switch idiom at an undeclared bctr: a
    /// bounds check, a table base built with lis/addi (or lis/ori), an
    /// index scale, a pointer load, and mtctr.
    fn detect_jump_table(&mut self, bctr_addr: u32, image: &Image, sections: &[CodeSection]) -> bool {
        // Collect the window before the bctr in program order.
        let window_start = bctr_addr.saturating_sub(16 * 4);
        let window: Vec<Instruction> = self
            .insns
            .range(window_start..bctr_addr)
            .map(|(_, i)| *i)
            .collect();

        let mut count = None;
        let mut register = 0;
        let mut base_hi: Option<(u32, u32)> = None; // (reg, value << 16)
        let mut base: Option<u32> = None;
        let mut saw_load = false;
        let mut saw_mtctr = false;

        for insn in window {
            match insn.opcode {
                Opcode::Cmpli => {
                    // cmplwi rX, N guards idx in 0..=N.
                    count = Some(insn.operands[2] + 1);
                    register = insn.operands[1];
                }
                Opcode::Addis if insn.operands[1] == 0 => {
                    base_hi = Some((insn.operands[0], insn.operands[2] << 16));
                }
                Opcode::Addi => {
                    if let Some((reg, hi)) = base_hi {
                        if insn.operands[1] == reg {
                            base = Some(hi.wrapping_add(insn.operands[2]));
                        }
                    }
                }
                Opcode::Ori => {
                    if let Some((reg, hi)) = base_hi {
                        if insn.operands[1] == reg {
                            base = Some(hi | insn.operands[2]);
                        }
                    }
                }
                Opcode::Lwzx => saw_load = true,
                Opcode::Mtctr => saw_mtctr = true,
                _ => {}
            }
        }

        if let (Some(count), Some(base), true, true) = (count, base, saw_load, saw_mtctr) {
            let table = JumpTable {
                base,
                count,
                stride: 4,
                register,
            };
            self.resolve_table(bctr_addr, &table, image, sections);
            return self.jump_tables.contains_key(&bctr_addr);
        }
        false
    }

    /// Sweep [start, limit) into basic blocks, following intra-function
    /// control flow.
    fn sweep_range(
        &mut self,
        start: u32,
        limit: u32,
        image: &Image,
        sections: &[CodeSection],
        entries: &BTreeSet<u32>,
    ) -> Vec<BasicBlock> {
        let mut block_starts: BTreeSet<u32> = BTreeSet::new();
        block_starts.insert(start);
        let mut worklist = vec![start];
        let mut visited: BTreeSet<u32> = BTreeSet::new();
        let mut blocks: Vec<BasicBlock> = Vec::new();

        while let Some(bb_start) = worklist.pop() {
            if !visited.insert(bb_start) {
                continue;
            }
            let mut instructions = Vec::new();
            let mut successors = Vec::new();
            let mut addr = bb_start;

            loop {
                if addr >= limit || self.is_data(addr) {
                    break;
                }
                let insn = match self.insns.get(&addr) {
                    Some(i) => *i,
                    None => {
                        self.diags
                            .error(format!("unresolved address {addr:#010x} in function {start:#010x}"));
                        break;
                    }
                };
                if insn.opcode == Opcode::Unknown {
                    self.diags.error(format!(
                        "unknown opcode {:#010x} at {addr:#010x} (add an invalid-instruction hint if this is data)",
                        insn.word
                    ));
                    break;
                }
                instructions.push(insn);
                let next = addr + 4;

                match insn.opcode {
                    Opcode::Bc => {
                        let target = insn.operands[2];
                        if insn.lk() {
                            // Conditional call: rare, treat like a call.
                            successors.push(next);
                        } else {
                            if target >= start && target < limit {
                                successors.push(target);
                                block_starts.insert(target);
                                worklist.push(target);
                            } else {
                                self.diags.warn(format!(
                                    "conditional branch at {addr:#010x} leaves function {start:#010x}"
                                ));
                            }
                            if !bo_is_unconditional(insn.operands[0]) {
                                successors.push(next);
                                block_starts.insert(next);
                                worklist.push(next);
                            }
                        }
                        break;
                    }
                    Opcode::B => {
                        let target = insn.operands[0];
                        if insn.lk() {
                            // Direct call; fall through in the same block
                            // unless a block boundary follows.
                        } else {
                            let internal =
                                target >= start && target < limit && !entries.contains(&target)
                                    || target == start;
                            if internal {
                                successors.push(target);
                                block_starts.insert(target);
                                worklist.push(target);
                            }
                            // else: tail call, no successors.
                            break;
                        }
                    }
                    Opcode::Bclr => {
                        if !bo_is_unconditional(insn.operands[0]) {
                            successors.push(next);
                            block_starts.insert(next);
                            worklist.push(next);
                        }
                        break;
                    }
                    Opcode::Bcctr => {
                        if insn.lk() {
                            // Computed call returns to the next insn.
                            successors.push(next);
                            block_starts.insert(next);
                            worklist.push(next);
                        } else if self.jump_tables.contains_key(&addr)
                            || self.detect_jump_table(addr, image, sections)
                        {
                            let table = &self.jump_tables[&addr];
                            for &t in &table.targets {
                                if t >= start && t < limit {
                                    successors.push(t);
                                    block_starts.insert(t);
                                    worklist.push(t);
                                }
                            }
                        } else if !self.config.known_indirect_call_hints.contains(&addr) {
                            self.diags.error(format!(
                                "bctr at {addr:#010x} has no jump table and is not a declared indirect call"
                            ));
                        }
                        break;
                    }
                    Opcode::Sc => {
                        successors.push(next);
                        break;
                    }
                    _ => {}
                }

                // A later-discovered block boundary splits the walk.
                if block_starts.contains(&next) && next != bb_start {
                    successors.push(next);
                    break;
                }
                addr = next;
            }

            if !instructions.is_empty() {
                let end = instructions.last().unwrap().addr + 4;
                blocks.push(BasicBlock {
                    start: bb_start,
                    end,
                    instructions,
                    successors,
                });
            }
        }

        // Re-split blocks that a later boundary landed inside, then order
        // by address for emission.
        blocks = split_on_boundaries(blocks, &block_starts);
        blocks.sort_by_key(|b| b.start);
        blocks
    }

    fn build_function(
        &mut self,
        entry: u32,
        image: &Image,
        sections: &[CodeSection],
        entries: &BTreeSet<u32>,
    ) -> Function {
        let hint = self.config.functions.get(&entry);
        let hinted_size = hint.map(|h| h.get_size(entry)).unwrap_or(0);
        let limit = if hinted_size != 0 {
            entry + hinted_size
        } else {
            // Inference may stretch at most the jump-extension bound past
            // the entry to cover branch and jump-table targets.
            let span = image
                .code_base
                .saturating_add(image.code_size)
                .saturating_sub(entry);
            entry + span.min(self.config.max_jump_extension)
        };

        let blocks = self.sweep_range(entry, limit, image, sections, entries);
        let inferred_end = blocks.iter().map(|b| b.end).max().unwrap_or(entry + 4);
        let size = if hinted_size != 0 {
            hinted_size
        } else {
            inferred_end - entry
        };

        if size > self.config.large_function_threshold {
            self.diags.error(format!(
                "function {entry:#010x} is {size:#x} bytes, over the large-function threshold"
            ));
        }

        let name = hint
            .filter(|h| !h.name.is_empty())
            .map(|h| h.name.clone())
            .unwrap_or_else(|| format!("sub_{entry:08X}"));

        Function {
            entry,
            size,
            name,
            parent: 0,
            blocks,
        }
    }
}

/// If any block boundary landed inside an already-built block, split it
/// so every block starts exactly at a boundary.
fn split_on_boundaries(blocks: Vec<BasicBlock>, boundaries: &BTreeSet<u32>) -> Vec<BasicBlock> {
    let mut out = Vec::with_capacity(blocks.len());
    let mut seen: BTreeSet<u32> = BTreeSet::new();
    for block in blocks {
        let inner: Vec<u32> = boundaries
            .range((block.start + 1)..block.end)
            .copied()
            .collect();
        if inner.is_empty() {
            if seen.insert(block.start) {
                out.push(block);
            }
            continue;
        }
        let mut rest = block;
        for boundary in inner {
            let split_at = rest
                .instructions
                .iter()
                .position(|i| i.addr >= boundary)
                .unwrap_or(rest.instructions.len());
            let tail = rest.instructions.split_off(split_at);
            let head = BasicBlock {
                start: rest.start,
                end: boundary,
                instructions: std::mem::take(&mut rest.instructions),
                successors: vec![boundary],
            };
            if !head.instructions.is_empty() && seen.insert(head.start) {
                out.push(head);
            }
            rest = BasicBlock {
                start: boundary,
                end: rest.end,
                instructions: tail,
                successors: rest.successors.clone(),
            };
        }
        if !rest.instructions.is_empty() && seen.insert(rest.start) {
            out.push(rest);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm;

    fn make_image(base: u32, words: &[u32]) -> (Image, Vec<CodeSection>, Vec<Instruction>) {
        let mut data = Vec::new();
        for w in words {
            data.extend_from_slice(&w.to_be_bytes());
        }
        let section = CodeSection {
            vaddr: base,
            data,
            name: ".text".into(),
        };
        let image = Image {
            entry: base,
            segments: vec![],
            code_base: base,
            code_size: (words.len() * 4) as u32,
        };
        let insns = disasm::disassemble(&section).unwrap();
        (image, vec![section], insns)
    }

    fn empty_config() -> RecompilerConfig {
        RecompilerConfig {
            project_name: "test".into(),
            file_path: "test.elf".into(),
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

    #[test]
    fn straight_line_function_is_one_block() {
        // li r3, 1 ; blr
        let (image, sections, insns) = make_image(0x8200_0000, &[0x3860_0001, 0x4E80_0020]);
        let config = empty_config();
        let (graph, diags) = analyze(&image, &sections, insns, &config).unwrap();
        assert!(!diags.has_errors());
        assert_eq!(graph.functions.len(), 1);
        let f = &graph.functions[0];
        assert_eq!(f.entry, 0x8200_0000);
        assert_eq!(f.size, 8);
        assert_eq!(f.blocks.len(), 1);
        assert!(f.blocks[0].successors.is_empty());
    }

    #[test]
    fn conditional_branch_splits_blocks() {
        // cmpwi r3, 0 ; bne +8 ; li r3, 1 ; blr
        let (image, sections, insns) = make_image(
            0x8200_0000,
            &[0x2C03_0000, 0x4082_0008, 0x3860_0001, 0x4E80_0020],
        );
        let config = empty_config();
        let (graph, diags) = analyze(&image, &sections, insns, &config).unwrap();
        assert!(!diags.has_errors());
        let f = &graph.functions[0];
        assert_eq!(f.blocks.len(), 3);
        let first = &f.blocks[0];
        // Both the target and the fallthrough are successors.
        assert!(first.successors.contains(&0x8200_0008));
        assert!(first.successors.contains(&0x8200_000C));
    }

    #[test]
    fn direct_call_seeds_second_function() {
        // f0: bl +8 ; blr     f1: li r3, 2 ; blr
        let (image, sections, insns) = make_image(
            0x8200_0000,
            &[0x4800_0009, 0x4E80_0020, 0x3860_0002, 0x4E80_0020],
        );
        let config = empty_config();
        let (graph, diags) = analyze(&image, &sections, insns, &config).unwrap();
        assert!(!diags.has_errors());
        assert_eq!(graph.functions.len(), 2);
        assert!(graph.entries.contains(&0x8200_0008));
    }

    #[test]
    fn explicit_size_hint_wins() {
        // One function hinted to 8 bytes even though more code follows.
        let (image, sections, insns) = make_image(
            0x8200_0000,
            &[0x3860_0001, 0x4E80_0020, 0x3860_0002, 0x4E80_0020],
        );
        let mut config = empty_config();
        config.functions.insert(
            0x8200_0000,
            crate::config::FunctionConfig {
                size: 8,
                ..Default::default()
            },
        );
        let (graph, _) = analyze(&image, &sections, insns, &config).unwrap();
        let f = graph
            .functions
            .iter()
            .find(|f| f.entry == 0x8200_0000)
            .unwrap();
        assert_eq!(f.size, 8);
    }

    #[test]
    fn undeclared_bctr_is_an_error() {
        // mtctr r3 ; bctr with no hint and no recognizable table
        let (image, sections, insns) =
            make_image(0x8200_0000, &[0x7C69_03A6, 0x4E80_0420]);
        let config = empty_config();
        let (_, diags) = analyze(&image, &sections, insns, &config).unwrap();
        assert!(diags.has_errors());
    }

    #[test]
    fn declared_indirect_call_suppresses_the_error() {
        let (image, sections, insns) =
            make_image(0x8200_0000, &[0x7C69_03A6, 0x4E80_0420]);
        let mut config = empty_config();
        config.known_indirect_call_hints.insert(0x8200_0004);
        let (_, diags) = analyze(&image, &sections, insns, &config).unwrap();
        assert!(!diags.has_errors());
    }

    #[test]
    fn unknown_opcode_inside_function_is_an_error() {
        let (image, sections, insns) =
            make_image(0x8200_0000, &[0xFFFF_FFFF, 0x4E80_0020]);
        let config = empty_config();
        let (_, diags) = analyze(&image, &sections, insns, &config).unwrap();
        assert!(diags.has_errors());
    }

    #[test]
    fn invalid_instruction_hint_marks_data() {
        let (image, sections, insns) = make_image(
            0x8200_0000,
            &[0x3860_0001, 0x4E80_0020, 0xFFFF_FFFF, 0xFFFF_FFFF],
        );
        let mut config = empty_config();
        config.invalid_instruction_hints.insert(0x8200_0008, 8);
        let (_, diags) = analyze(&image, &sections, insns, &config).unwrap();
        assert!(!diags.has_errors());
    }
}
