// config.rs - recompiler configuration and analyzer hints
//
// Loaded from a JSON sidecar next to the image. Addresses appear as hex
// strings ("0x82001000") so configs stay diffable; they are parsed into
// u32 keys after deserialization.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// A user hint inserting a host-side patch around a guest instruction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MidAsmHook {
    pub name: String,
    #[serde(default)]
    pub registers: Vec<String>,

    #[serde(default)]
    pub ret: bool,
    #[serde(default)]
    pub ret_on_true: bool,
    #[serde(default)]
    pub ret_on_false: bool,

    #[serde(default)]
    pub jump_address: u32,
    #[serde(default)]
    pub jump_address_on_true: u32,
    #[serde(default)]
    pub jump_address_on_false: u32,

    /// Run the hook after the instruction instead of before it.
    #[serde(default)]
    pub after_instruction: bool,
}

/// Unified function/chunk configuration. A chunk is simply a function
/// entry with a non-zero parent field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionConfig {
    /// Explicit size in bytes (mutually exclusive with end).
    #[serde(default)]
    pub size: u32,
    /// End address, exclusive (mutually exclusive with size).
    #[serde(default)]
    pub end: u32,
    /// Custom symbol name (empty = auto-generated sub_XXXXXXXX).
    #[serde(default)]
    pub name: String,
    /// Parent function address (0 = standalone).
    #[serde(default)]
    pub parent: u32,
}

impl FunctionConfig {
    /// Effective size; explicit size wins over end.
    pub fn get_size(&self, address: u32) -> u32 {
        if self.size != 0 {
            self.size
        } else if self.end > address {
            self.end - address
        } else {
            0
        }
    }

    pub fn is_chunk(&self) -> bool {
        self.parent != 0
    }
}

/// Jump-table descriptor: base of the pointer table, element count and
/// stride, and the register the guarding bounds check tests.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JumpTable {
    pub base: u32,
    pub count: u32,
    #[serde(default = "default_stride")]
    pub stride: u32,
    #[serde(default)]
    pub register: u32,
}

fn default_stride() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    project_name: String,
    file_path: String,
    out_directory_path: String,

    #[serde(default)]
    skip_lr: bool,
    #[serde(default)]
    skip_msr: bool,
    #[serde(default)]
    generate_exception_handlers: bool,

    #[serde(default = "default_max_jump_extension")]
    max_jump_extension: u32,
    #[serde(default = "default_data_region_threshold")]
    data_region_threshold: u32,
    #[serde(default = "default_large_function_threshold")]
    large_function_threshold: u32,

    #[serde(default)]
    functions: HashMap<String, FunctionConfig>,
    #[serde(default)]
    switch_tables: HashMap<String, JumpTable>,
    #[serde(default)]
    mid_asm_hooks: HashMap<String, MidAsmHook>,
    #[serde(default)]
    invalid_instruction_hints: HashMap<String, u32>,
    #[serde(default)]
    known_indirect_call_hints: Vec<String>,
    #[serde(default)]
    exception_handler_func_hints: Vec<String>,
    #[serde(default)]
    long_jmp_address: String,
    #[serde(default)]
    set_jmp_address: String,
}

fn default_max_jump_extension() -> u32 {
    65536
}

fn default_data_region_threshold() -> u32 {
    16
}

fn default_large_function_threshold() -> u32 {
    1024 * 1024
}

/// Fully parsed recompiler configuration.
#[derive(Debug, Clone)]
pub struct RecompilerConfig {
    pub project_name: String,
    pub file_path: PathBuf,
    pub out_directory_path: PathBuf,
    /// Directory the config file lives in; relative paths resolve here.
    pub config_dir: PathBuf,

    pub skip_lr: bool,
    pub skip_msr: bool,
    pub generate_exception_handlers: bool,

    /// Max bytes a function may stretch to cover a jump-table target.
    pub max_jump_extension: u32,
    /// Consecutive undecodable words that end a function as data.
    pub data_region_threshold: u32,
    /// Functions larger than this raise a diagnostic.
    pub large_function_threshold: u32,

    pub functions: HashMap<u32, FunctionConfig>,
    pub switch_tables: HashMap<u32, JumpTable>,
    pub mid_asm_hooks: HashMap<u32, MidAsmHook>,
    pub invalid_instruction_hints: HashMap<u32, u32>,
    pub known_indirect_call_hints: HashSet<u32>,
    pub exception_handler_func_hints: Vec<u32>,
    pub long_jmp_address: u32,
    pub set_jmp_address: u32,
}

/// Result of config validation. Warnings do not block code generation;
/// errors do unless forced.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn parse_addr(s: &str) -> Result<u32> {
    let t = s.trim();
    let value = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        t.parse::<u32>()
    };
    value.with_context(|| format!("invalid address {s:?}"))
}

fn parse_addr_map<V>(raw: HashMap<String, V>) -> Result<HashMap<u32, V>> {
    raw.into_iter()
        .map(|(k, v)| Ok((parse_addr(&k)?, v)))
        .collect()
}

fn parse_opt_addr(s: &str) -> Result<u32> {
    if s.is_empty() {
        Ok(0)
    } else {
        parse_addr(s)
    }
}

impl RecompilerConfig {
    /// Load and parse a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let raw: RawConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        let config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            project_name: raw.project_name,
            file_path: PathBuf::from(raw.file_path),
            out_directory_path: PathBuf::from(raw.out_directory_path),
            config_dir,
            skip_lr: raw.skip_lr,
            skip_msr: raw.skip_msr,
            generate_exception_handlers: raw.generate_exception_handlers,
            max_jump_extension: raw.max_jump_extension,
            data_region_threshold: raw.data_region_threshold,
            large_function_threshold: raw.large_function_threshold,
            functions: parse_addr_map(raw.functions)?,
            switch_tables: parse_addr_map(raw.switch_tables)?,
            mid_asm_hooks: parse_addr_map(raw.mid_asm_hooks)?,
            invalid_instruction_hints: parse_addr_map(raw.invalid_instruction_hints)?,
            known_indirect_call_hints: raw
                .known_indirect_call_hints
                .iter()
                .map(|s| parse_addr(s))
                .collect::<Result<_>>()?,
            exception_handler_func_hints: raw
                .exception_handler_func_hints
                .iter()
                .map(|s| parse_addr(s))
                .collect::<Result<_>>()?,
            long_jmp_address: parse_opt_addr(&raw.long_jmp_address)?,
            set_jmp_address: parse_opt_addr(&raw.set_jmp_address)?,
        })
    }

    /// Image path resolved against the config directory.
    pub fn image_path(&self) -> PathBuf {
        self.config_dir.join(&self.file_path)
    }

    /// Output directory resolved against the config directory.
    pub fn out_path(&self) -> PathBuf {
        self.config_dir.join(&self.out_directory_path)
    }

    /// Sanity-check addresses and mutually exclusive fields.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.project_name.is_empty() {
            result.errors.push("project_name must not be empty".into());
        }

        let mut declared: Vec<(u32, u32)> = Vec::new();
        for (&addr, func) in &self.functions {
            if addr % 4 != 0 {
                result
                    .errors
                    .push(format!("function {addr:#010x} is not word aligned"));
            }
            if func.size != 0 && func.end != 0 {
                result.errors.push(format!(
                    "function {addr:#010x} declares both size and end"
                ));
            }
            if func.is_chunk() && self.functions.get(&func.parent).is_none() {
                result.warnings.push(format!(
                    "chunk {addr:#010x} names undeclared parent {:#010x}",
                    func.parent
                ));
            }
            let size = func.get_size(addr);
            if size != 0 {
                declared.push((addr, size));
            }
        }

        // Overlapping declared functions are fatal.
        declared.sort_unstable();
        for pair in declared.windows(2) {
            let (a, a_size) = pair[0];
            let (b, _) = pair[1];
            if a + a_size > b {
                result.errors.push(format!(
                    "declared functions {a:#010x} and {b:#010x} overlap"
                ));
            }
        }

        for (&addr, table) in &self.switch_tables {
            if table.count == 0 {
                result
                    .errors
                    .push(format!("switch table at {addr:#010x} has zero entries"));
            }
            if table.stride != 4 {
                result.warnings.push(format!(
                    "switch table at {addr:#010x} uses stride {}",
                    table.stride
                ));
            }
        }

        if self.data_region_threshold == 0 {
            result
                .errors
                .push("data_region_threshold must be at least 1".into());
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_config(json: &str) -> RecompilerConfig {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "ppc2rs-config-test-{}-{}.json",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, json).unwrap();
        let cfg = RecompilerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        cfg
    }

    #[test]
    fn loads_hints_with_hex_keys() {
        let cfg = parse_config(
            r#"{
                "project_name": "demo",
                "file_path": "demo.elf",
                "out_directory_path": "out",
                "functions": {
                    "0x82001000": { "size": 64 },
                    "0x82002000": { "parent": 2181042176 }
                },
                "switch_tables": {
                    "0x82001040": { "base": 2181036096, "count": 4, "register": 11 }
                },
                "known_indirect_call_hints": ["0x82003000"],
                "set_jmp_address": "0x82000100"
            }"#,
        );
        assert_eq!(cfg.functions[&0x8200_1000].size, 64);
        assert!(cfg.functions[&0x8200_2000].is_chunk());
        assert_eq!(cfg.switch_tables[&0x8200_1040].count, 4);
        assert_eq!(cfg.switch_tables[&0x8200_1040].stride, 4);
        assert!(cfg.known_indirect_call_hints.contains(&0x8200_3000));
        assert_eq!(cfg.set_jmp_address, 0x8200_0100);
    }

    #[test]
    fn validation_rejects_overlapping_functions() {
        let cfg = parse_config(
            r#"{
                "project_name": "demo",
                "file_path": "demo.elf",
                "out_directory_path": "out",
                "functions": {
                    "0x82001000": { "size": 256 },
                    "0x82001080": { "size": 64 }
                }
            }"#,
        );
        let result = cfg.validate();
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("overlap"));
    }

    #[test]
    fn validation_rejects_size_and_end_together() {
        let cfg = parse_config(
            r#"{
                "project_name": "demo",
                "file_path": "demo.elf",
                "out_directory_path": "out",
                "functions": {
                    "0x82001000": { "size": 256, "end": 2181042432 }
                }
            }"#,
        );
        assert!(!cfg.validate().is_valid());
    }
}
