// ppc2rs - Xbox 360 PowerPC to Rust AOT recompiler
//
// Statically translates a PowerPC64 big-endian guest image into Rust
// source that executes against ppc2rs-runtime.
//
// # Architecture
//
// The recompiler works in several phases:
//
// 1. **Image parsing** (`image.rs`): load the guest image, extract code
//    sections and segment metadata
// 2. **Disassembly** (`disasm.rs`): decode PPC/Altivec/VMX128
//    instructions to structured form
// 3. **Analysis** (`analyze.rs`): discover functions, build basic-block
//    graphs, resolve jump tables, mark data regions
// 4. **Emission** (`emit/`): produce one host function per guest
//    function, the function mapping table, and the build manifest
//
// Analyzer hints come from a JSON sidecar (`config.rs`); validation
// diagnostics block emission unless forced.

pub mod analyze;
pub mod config;
pub mod disasm;
pub mod emit;
pub mod image;

use std::path::Path;

use anyhow::{Context, Result};

pub use analyze::{analyze, FunctionGraph};
pub use config::RecompilerConfig;
pub use disasm::{Instruction, Opcode};
pub use emit::Recompiler;
pub use image::{CodeSection, Image};

/// Analysis diagnostics that blocked code generation.
#[derive(Debug)]
pub struct ValidationFailed {
    pub errors: Vec<String>,
}

impl std::fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "code generation blocked by {} validation error(s); use --force to override",
            self.errors.len()
        )
    }
}

impl std::error::Error for ValidationFailed {}

/// Codegen result summary for the CLI.
pub struct CodegenSummary {
    pub function_count: usize,
    pub file_count: usize,
}

/// Run the full codegen pipeline for a config file.
pub fn codegen(
    config_path: &Path,
    force: bool,
    enable_exception_handlers: bool,
) -> Result<CodegenSummary> {
    let mut config = RecompilerConfig::load(config_path)?;
    if enable_exception_handlers {
        config.generate_exception_handlers = true;
        log::info!("exception handler generation enabled");
    }

    let image_path = config.image_path();
    let data = std::fs::read(&image_path)
        .with_context(|| format!("failed to read image {}", image_path.display()))?;
    let image = image::parse(&data).context("failed to parse image")?;
    log::info!(
        "image: entry {:#010x}, code {:#010x}+{:#x}",
        image.entry,
        image.code_base,
        image.code_size
    );

    let sections = image::extract_code_sections(&data, &image)?;
    let mut insns = Vec::new();
    for section in &sections {
        insns.extend(disasm::disassemble(section)?);
    }
    log::info!(
        "disassembled {} instructions in {} sections",
        insns.len(),
        sections.len()
    );

    let (graph, diags) = analyze::analyze(&image, &sections, insns, &config)?;
    for warning in &diags.warnings {
        log::warn!("{warning}");
    }
    if diags.has_errors() {
        if !force {
            return Err(ValidationFailed {
                errors: diags.errors,
            }
            .into());
        }
        log::warn!(
            "continuing past {} validation error(s) due to --force",
            diags.errors.len()
        );
    }
    log::info!("analyzed {} functions", graph.functions.len());

    let output = Recompiler::new(&graph, &config).emit()?;

    let out_dir = config.out_path();
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    // Clean up generated files from earlier runs before writing.
    let prefix = format!("{}_", config.project_name);
    for entry in std::fs::read_dir(&out_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && (name.ends_with(".rs") || name.ends_with(".json")) {
            std::fs::remove_file(entry.path()).ok();
        }
    }

    let file_count = output.files.len();
    for (name, contents) in &output.files {
        let path = out_dir.join(name);
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    log::info!(
        "emitted {} functions into {} files under {}",
        output.function_count,
        file_count,
        out_dir.display()
    );

    Ok(CodegenSummary {
        function_count: output.function_count,
        file_count,
    })
}
