// image.rs - guest image parsing
//
// Uses goblin to parse PowerPC64 big-endian ELF images into the `Image`
// interface the analyzer consumes. XEX containers are converted to the
// same interface by an external loader; everything downstream of `Image`
// is format-agnostic.

use anyhow::{Context, Result};
use goblin::elf::{header, program_header, Elf};

/// Segment permission bits as declared by the image.
pub const SEG_X: u32 = 0x1;
pub const SEG_W: u32 = 0x2;
pub const SEG_R: u32 = 0x4;

/// Information about a loaded guest image.
#[derive(Debug, Clone)]
pub struct Image {
    /// Guest entry point.
    pub entry: u32,
    /// Loadable segments.
    pub segments: Vec<Segment>,
    /// Base of the executable range (lowest executable segment).
    pub code_base: u32,
    /// Size of the executable range in bytes.
    pub code_size: u32,
}

/// A loadable segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: u32,
    pub memsz: u32,
    pub filesz: u32,
    pub offset: u64,
    pub flags: u32,
}

/// A code section to disassemble.
#[derive(Debug, Clone)]
pub struct CodeSection {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub name: String,
}

/// Parse an ELF image and extract metadata.
pub fn parse(data: &[u8]) -> Result<Image> {
    let elf = Elf::parse(data).context("invalid ELF image")?;

    if elf.header.e_machine != header::EM_PPC64 {
        anyhow::bail!(
            "not a PowerPC64 image (e_machine={:#x})",
            elf.header.e_machine
        );
    }
    if elf.header.e_ident[header::EI_DATA] != header::ELFDATA2MSB {
        anyhow::bail!("guest images are big-endian");
    }

    let segments: Vec<Segment> = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == program_header::PT_LOAD)
        .map(|ph| Segment {
            vaddr: ph.p_vaddr as u32,
            memsz: ph.p_memsz as u32,
            filesz: ph.p_filesz as u32,
            offset: ph.p_offset,
            flags: ph.p_flags,
        })
        .collect();

    if segments.is_empty() {
        anyhow::bail!("image has no loadable segments");
    }

    let exec: Vec<&Segment> = segments.iter().filter(|s| s.flags & SEG_X != 0).collect();
    if exec.is_empty() {
        anyhow::bail!("image has no executable segments");
    }
    let code_base = exec.iter().map(|s| s.vaddr).min().unwrap();
    let code_end = exec.iter().map(|s| s.vaddr + s.memsz).max().unwrap();

    Ok(Image {
        entry: elf.entry as u32,
        segments,
        code_base,
        code_size: code_end - code_base,
    })
}

/// Extract executable code sections for disassembly.
pub fn extract_code_sections(data: &[u8], image: &Image) -> Result<Vec<CodeSection>> {
    let mut sections = Vec::new();

    for seg in &image.segments {
        if seg.flags & SEG_X != 0 && seg.filesz > 0 {
            let start = seg.offset as usize;
            let end = start + seg.filesz as usize;
            if end <= data.len() {
                sections.push(CodeSection {
                    vaddr: seg.vaddr,
                    data: data[start..end].to_vec(),
                    name: format!("seg_{:#x}", seg.vaddr),
                });
            }
        }
    }

    if sections.is_empty() {
        anyhow::bail!("no executable bytes found in image");
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_elf_bytes() {
        let bad = vec![0u8; 64];
        assert!(parse(&bad).is_err());
    }
}
