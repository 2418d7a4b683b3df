//! # Compact Text Encoding
//!
//! Chunks are persisted as short ASCII strings. Integers and strings inside
//! those payloads are written with a 64-character alphabet that contains none
//! of the payload delimiters (`,` `:` `/` `#` `{` `}` `[` `]`), so a decoder can
//! always find where a value ends by scanning for the next non-digit.
//!
//! ## Alphabet
//!
//! ```text
//! index  0..25   'A'..'Z'
//! index 26..51   'a'..'z'
//! index 52..61   '0'..'9'
//! index 62       '+'
//! index 63       '_'
//! ```
//!
//! ## Integer Format
//!
//! Signed values are zigzag-mapped (`0, -1, 1, -2, ...` → `0, 1, 2, 3, ...`)
//! and then written as 6-bit digits, most significant first, with no leading
//! zero digits:
//!
//! | Value | Zigzag | Text  |
//! |-------|--------|-------|
//! | 0     | 0      | `A`   |
//! | -1    | 1      | `B`   |
//! | 1     | 2      | `C`   |
//! | 31    | 62     | `+`   |
//! | 32    | 64     | `BA`  |
//! | -1024 | 2047   | `f_`  |
//!
//! An `i64` needs at most [`MAX_LONG_DIGITS`] digits. Small values, which
//! dominate tree indices and counters, take one or two characters.
//!
//! ## String Format
//!
//! UTF-8 bytes are grouped by three into four digits. A trailing group of one
//! or two bytes produces two or three digits; there is no padding.
//!
//! ## Error Handling
//!
//! Decoders return `eyre::Result` with descriptive messages:
//! - Empty input: "empty text for integer decode"
//! - Foreign byte: "invalid digit 0xNN in encoded value"
//! - Overflow: "encoded integer exceeds 64 bits"
//! - Dangling string digit: "truncated encoded string"

use eyre::{bail, ensure, Result};

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+_";

const INVALID: u8 = 0xFF;

const DECODE_TABLE: [u8; 256] = build_decode_table();

/// Longest text an `i64` can encode to.
pub const MAX_LONG_DIGITS: usize = 11;

const fn build_decode_table() -> [u8; 256] {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
}

#[inline]
pub fn is_digit(byte: u8) -> bool {
    DECODE_TABLE[byte as usize] != INVALID
}

#[inline]
fn digit_value(byte: u8) -> Result<u8> {
    let value = DECODE_TABLE[byte as usize];
    ensure!(value != INVALID, "invalid digit 0x{:02X} in encoded value", byte);
    Ok(value)
}

pub fn encode_long(value: i64, out: &mut String) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    let mut buf = [0u8; MAX_LONG_DIGITS];
    let mut pos = MAX_LONG_DIGITS;
    loop {
        pos -= 1;
        buf[pos] = ALPHABET[(zigzag & 0x3F) as usize];
        zigzag >>= 6;
        if zigzag == 0 {
            break;
        }
    }
    out.extend(buf[pos..].iter().map(|&b| b as char));
}

pub fn encode_int(value: i32, out: &mut String) {
    encode_long(value as i64, out);
}

pub fn decode_long(text: &str) -> Result<i64> {
    let bytes = text.as_bytes();
    ensure!(!bytes.is_empty(), "empty text for integer decode");
    ensure!(
        bytes.len() <= MAX_LONG_DIGITS,
        "encoded integer exceeds 64 bits"
    );

    let mut zigzag: u64 = 0;
    for &byte in bytes {
        let digit = digit_value(byte)?;
        if zigzag >> 58 != 0 {
            bail!("encoded integer exceeds 64 bits");
        }
        zigzag = (zigzag << 6) | digit as u64;
    }

    Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}

pub fn decode_int(text: &str) -> Result<i32> {
    let value = decode_long(text)?;
    i32::try_from(value).map_err(|_| eyre::eyre!("encoded value {} exceeds 32 bits", value))
}

pub fn encode_str(value: &str, out: &mut String) {
    let bytes = value.as_bytes();
    let mut chunks = bytes.chunks_exact(3);
    for group in &mut chunks {
        let word = (group[0] as u32) << 16 | (group[1] as u32) << 8 | group[2] as u32;
        out.push(ALPHABET[(word >> 18) as usize & 0x3F] as char);
        out.push(ALPHABET[(word >> 12) as usize & 0x3F] as char);
        out.push(ALPHABET[(word >> 6) as usize & 0x3F] as char);
        out.push(ALPHABET[word as usize & 0x3F] as char);
    }
    match *chunks.remainder() {
        [a] => {
            let word = (a as u32) << 16;
            out.push(ALPHABET[(word >> 18) as usize & 0x3F] as char);
            out.push(ALPHABET[(word >> 12) as usize & 0x3F] as char);
        }
        [a, b] => {
            let word = (a as u32) << 16 | (b as u32) << 8;
            out.push(ALPHABET[(word >> 18) as usize & 0x3F] as char);
            out.push(ALPHABET[(word >> 12) as usize & 0x3F] as char);
            out.push(ALPHABET[(word >> 6) as usize & 0x3F] as char);
        }
        _ => {}
    }
}

pub fn decode_str(text: &str) -> Result<String> {
    let digits = text.as_bytes();
    ensure!(digits.len() % 4 != 1, "truncated encoded string");

    let mut bytes = Vec::with_capacity(digits.len() / 4 * 3 + 2);
    for group in digits.chunks(4) {
        let mut word: u32 = 0;
        for (i, &d) in group.iter().enumerate() {
            word |= (digit_value(d)? as u32) << (18 - 6 * i as u32);
        }
        bytes.push((word >> 16) as u8);
        if group.len() > 2 {
            bytes.push((word >> 8) as u8);
        }
        if group.len() > 3 {
            bytes.push(word as u8);
        }
    }

    String::from_utf8(bytes).map_err(|e| eyre::eyre!("encoded string is not UTF-8: {}", e))
}

/// Forward-only reader over a chunk payload.
///
/// Payload grammars are all "delimiter, then a run of digits", so the cursor
/// only needs to peek at the next byte, consume a known delimiter, and take the
/// longest run of alphabet digits.
#[derive(Debug)]
pub struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    pub fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn advance(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    pub fn expect(&mut self, delimiter: u8) -> Result<()> {
        match self.advance() {
            Some(b) if b == delimiter => Ok(()),
            Some(b) => bail!(
                "expected '{}' at offset {} but found '{}'",
                delimiter as char,
                self.pos - 1,
                b as char
            ),
            None => bail!("expected '{}' but payload ended", delimiter as char),
        }
    }

    /// Consumes `delimiter` if it is the next byte.
    pub fn eat(&mut self, delimiter: u8) -> bool {
        if self.peek() == Some(delimiter) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn take_digits(&mut self) -> &'a str {
        let start = self.pos;
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && is_digit(bytes[self.pos]) {
            self.pos += 1;
        }
        &self.text[start..self.pos]
    }

    pub fn read_long(&mut self) -> Result<i64> {
        let at = self.pos;
        let digits = self.take_digits();
        ensure!(!digits.is_empty(), "expected integer at offset {}", at);
        decode_long(digits)
    }

    pub fn read_int(&mut self) -> Result<i32> {
        let at = self.pos;
        let digits = self.take_digits();
        ensure!(!digits.is_empty(), "expected integer at offset {}", at);
        decode_int(digits)
    }

    pub fn read_str(&mut self) -> Result<String> {
        decode_str(self.take_digits())
    }
}
