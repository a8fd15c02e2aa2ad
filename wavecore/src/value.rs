use std::fmt;

/// A signal value as a string of bit characters, most significant first.
///
/// Bits use the 4-state alphabet `0 1 x z` or, for FST/VHDL sources, the
/// 9-state extension `u x z w l h -`. Characters are stored lower case.
/// Real and string variables store their textual form.
///
/// With 16 bytes inline this is the same size as a `Vec`, so values up to
/// 16 bits never allocate.
#[derive(Eq, PartialEq, Clone, Debug, Default, Hash)]
pub struct Value(pub tinyvec::TinyVec<[u8; 16]>);

impl Value {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.iter().map(|b| b.to_ascii_lowercase()).collect())
    }

    /// Real and string values keep their text as written.
    pub fn from_text(text: &str) -> Self {
        Self(text.bytes().collect())
    }

    /// All-`x` value used for signals that have not been driven yet.
    pub fn undefined(width: u32) -> Self {
        Self(std::iter::repeat(b'x').take(width.max(1) as usize).collect())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from ASCII, or from `str` for reals and strings.
        std::str::from_utf8(&self.0).unwrap_or("?")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if every bit is a 0 or 1.
    pub fn is_binary(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|b| matches!(b, b'0' | b'1'))
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|b| *b == b'0')
    }

    /// Format the value for display. Non-binary digits make the whole
    /// nibble (or number for decimal) show as `x`, or `z` if every unknown
    /// bit in it is high impedance.
    pub fn format(&self, format: NumericFormat) -> String {
        if !self.0.iter().all(|b| is_bit_char(*b)) {
            return self.as_str().to_owned();
        }
        match format {
            NumericFormat::Binary => self.as_str().to_owned(),
            NumericFormat::Hex => {
                let bits = self.as_bytes();
                let lead = (4 - bits.len() % 4) % 4;
                let mut out = String::with_capacity((bits.len() + 3) / 4);
                let padded: Vec<u8> = std::iter::repeat(b'0')
                    .take(lead)
                    .chain(bits.iter().copied())
                    .collect();
                for nibble in padded.chunks(4) {
                    out.push(nibble_char(nibble));
                }
                out
            }
            NumericFormat::Decimal => {
                if !self.is_binary() {
                    return unknown_char(self.as_bytes()).to_string();
                }
                if self.0.len() <= 128 {
                    let v = self
                        .0
                        .iter()
                        .fold(0u128, |acc, b| (acc << 1) | (*b - b'0') as u128);
                    v.to_string()
                } else {
                    // Too wide for decimal; fall back to hex.
                    self.format(NumericFormat::Hex)
                }
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display-only radix for multi-bit values.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum NumericFormat {
    Binary,
    #[default]
    Hex,
    Decimal,
}

fn is_bit_char(b: u8) -> bool {
    matches!(
        b,
        b'0' | b'1' | b'x' | b'z' | b'u' | b'w' | b'l' | b'h' | b'-'
    )
}

fn unknown_char(bits: &[u8]) -> char {
    let unknown = || bits.iter().filter(|b| !matches!(b, b'0' | b'1'));
    if unknown().all(|b| *b == b'z') {
        'z'
    } else {
        'x'
    }
}

fn nibble_char(nibble: &[u8]) -> char {
    if nibble.iter().all(|b| matches!(b, b'0' | b'1')) {
        let v = nibble.iter().fold(0u32, |acc, b| (acc << 1) | (*b - b'0') as u32);
        char::from_digit(v, 16).unwrap_or('?')
    } else {
        unknown_char(nibble)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalises_case() {
        let v = Value::from("10XZ");
        assert_eq!(v.as_str(), "10xz");
        assert!(!v.is_binary());
        assert_eq!(Value::undefined(3).as_str(), "xxx");
        assert_eq!(Value::undefined(0).as_str(), "x");
    }

    #[test]
    fn test_formats() {
        let v = Value::from("100101");
        assert_eq!(v.format(NumericFormat::Binary), "100101");
        assert_eq!(v.format(NumericFormat::Hex), "25");
        assert_eq!(v.format(NumericFormat::Decimal), "37");

        let v = Value::from("1010zzzz");
        assert_eq!(v.format(NumericFormat::Hex), "az");
        assert_eq!(v.format(NumericFormat::Decimal), "z");

        let v = Value::from("x0010001");
        assert_eq!(v.format(NumericFormat::Hex), "x1");
        assert_eq!(v.format(NumericFormat::Decimal), "x");

        // Reals pass through untouched.
        assert_eq!(Value::from("3.25").format(NumericFormat::Hex), "3.25");
    }
}
