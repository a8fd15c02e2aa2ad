#![no_main]

use libfuzzer_sys::fuzz_target;
use wavecore::{load_document, FileFormat, LoadOptions, MemorySource};

// Corrupt files must fail or load partially, never panic.
fuzz_target!(|data: &[u8]| {
    let mut source = MemorySource::new(data.to_vec());
    let options = LoadOptions {
        format: Some(FileFormat::Fst),
        ..Default::default()
    };
    let _ = load_document(&mut source, None, &options);
});
