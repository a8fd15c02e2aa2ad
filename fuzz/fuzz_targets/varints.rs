#![no_main]

use libfuzzer_sys::fuzz_target;
use wavecore::codec::{encode_svarint, encode_varint, read_var_int, read_var_uint, varint_length};

fuzz_target!(|data: (u64, i64)| {
    let (unsigned, signed) = data;
    let mut output = [0u8; 10];

    let n = encode_varint(&mut output, unsigned);
    assert_eq!(n, varint_length(unsigned));
    assert_eq!(read_var_uint(&output[..n], 0).unwrap(), (unsigned, n));

    let n = encode_svarint(&mut output, signed);
    assert_eq!(read_var_int(&output[..n], 0).unwrap(), (signed, n));
});
