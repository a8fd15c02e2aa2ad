use std::path::Path;

use crate::source::FileSource;

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub enum FileFormat {
    #[default]
    Vcd,
    Fst,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Bytes read from the file at a time while streaming.
    pub chunk_size: usize,
    /// Transitions per message when handing a signal to the viewer.
    pub transfer_chunk_len: usize,
    /// Skip format detection.
    pub format: Option<FileFormat>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1 << 20,
            transfer_chunk_len: 1 << 16,
            format: None,
        }
    }
}

/// Work out the file format from its first block, falling back to the
/// extension. FST files start with a header block (type 0, length 329) or
/// are wrapped whole in a gzip block (type 254).
pub fn detect_format(path: Option<&Path>, source: &mut dyn FileSource) -> FileFormat {
    if let Ok(prefix) = source.read(0, 9) {
        if prefix.len() == 9
            && (prefix[0] == 254 || (prefix[0] == 0 && prefix[1..9] == 329u64.to_be_bytes()))
        {
            return FileFormat::Fst;
        }
    }
    match path
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
    {
        Some(e) if e == "fst" => FileFormat::Fst,
        _ => FileFormat::Vcd,
    }
}
