//! Minimal PE/COFF header inspection.
//!
//! Only answers two questions: does the image carry a CLI header (is it a
//! managed assembly), and does that header name an entry point.

use std::path::Path;

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const CLI_DIRECTORY_INDEX: usize = 14;
const SECTION_HEADER_SIZE: usize = 40;
const CLI_ENTRY_POINT_OFFSET: usize = 20;

/// What the PE headers say about an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeInfo {
    pub managed: bool,
    pub has_entry_point: bool,
}

/// Inspect a file on disk. Unreadable or non-PE files yield `None`.
pub fn inspect_file(path: &Path) -> Option<PeInfo> {
    let bytes = std::fs::read(path).ok()?;
    inspect(&bytes)
}

/// Inspect raw image bytes.
pub fn inspect(bytes: &[u8]) -> Option<PeInfo> {
    if bytes.get(0..2)? != DOS_MAGIC {
        return None;
    }
    let pe_offset = read_u32(bytes, 0x3c)? as usize;
    if bytes.get(pe_offset..pe_offset + 4)? != PE_SIGNATURE {
        return None;
    }

    let coff = pe_offset + 4;
    let section_count = read_u16(bytes, coff + 2)? as usize;
    let optional_size = read_u16(bytes, coff + 16)? as usize;
    let optional = coff + 20;

    let directories = match read_u16(bytes, optional)? {
        PE32_MAGIC => optional + 96,
        PE32_PLUS_MAGIC => optional + 112,
        _ => return None,
    };
    let directory_count = read_u32(bytes, directories - 4)? as usize;
    if directory_count <= CLI_DIRECTORY_INDEX {
        return Some(PeInfo {
            managed: false,
            has_entry_point: false,
        });
    }

    let cli_rva = read_u32(bytes, directories + CLI_DIRECTORY_INDEX * 8)?;
    if cli_rva == 0 {
        return Some(PeInfo {
            managed: false,
            has_entry_point: false,
        });
    }

    let sections = optional + optional_size;
    let has_entry_point = (0..section_count)
        .filter_map(|i| section_offset(bytes, sections + i * SECTION_HEADER_SIZE, cli_rva))
        .next()
        .and_then(|cli| read_u32(bytes, cli + CLI_ENTRY_POINT_OFFSET))
        .map(|token| token != 0)
        .unwrap_or(false);

    Some(PeInfo {
        managed: true,
        has_entry_point,
    })
}

/// File offset of `rva` if the section header at `header` contains it.
fn section_offset(bytes: &[u8], header: usize, rva: u32) -> Option<usize> {
    let virtual_size = read_u32(bytes, header + 8)?;
    let virtual_address = read_u32(bytes, header + 12)?;
    let raw_size = read_u32(bytes, header + 16)?;
    let raw_pointer = read_u32(bytes, header + 20)?;
    let extent = virtual_size.max(raw_size);
    if rva >= virtual_address && rva < virtual_address.saturating_add(extent) {
        Some((rva - virtual_address + raw_pointer) as usize)
    } else {
        None
    }
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let b = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
