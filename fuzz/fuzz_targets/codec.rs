#![no_main]

use libfuzzer_sys::fuzz_target;
use wavecore::codec::{read_block_header, read_cstring, read_var_int, read_var_uint};

// None of the readers may panic or read past the buffer, whatever the input.
fuzz_target!(|data: &[u8]| {
    let _ = read_block_header(data);
    let mut offset = 0;
    while offset < data.len() {
        offset = match read_var_uint(data, offset) {
            Ok((_, next)) => {
                assert!(next > offset && next <= data.len());
                next
            }
            Err(_) => break,
        };
    }
    let _ = read_var_int(data, 0);
    if let Ok((s, next)) = read_cstring(data, 0) {
        assert!(next <= data.len());
        assert!(s.len() <= data.len() * 3);
    }
});
