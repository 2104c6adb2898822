//! The fixed bijection between raw byte values and printable unicode symbols used
//! by byte-level BPE. Printable Latin-1 ranges map to themselves; every other byte
//! is shifted to a codepoint starting at 256, in ascending byte order.

use std::collections::HashMap;

use once_cell::sync::Lazy;

static BYTE_TO_CHAR: Lazy<[char; 256]> = Lazy::new(|| {
    let mut table = ['\0'; 256];
    let mut shifted = 0u32;
    for byte in 0u16..256 {
        let byte = byte as u8;
        if is_printable(byte) {
            table[byte as usize] = byte as char;
        } else {
            table[byte as usize] =
                char::from_u32(256 + shifted).expect("shifted codepoints stay below 0x200");
            shifted += 1;
        }
    }
    table
});

static CHAR_TO_BYTE: Lazy<HashMap<char, u8>> = Lazy::new(|| {
    BYTE_TO_CHAR
        .iter()
        .enumerate()
        .map(|(byte, &symbol)| (symbol, byte as u8))
        .collect()
});

fn is_printable(byte: u8) -> bool {
    matches!(byte, 33..=126 | 161..=172 | 174..=255)
}

/// Map a raw byte to its single-character surrogate.
pub fn byte_to_char(byte: u8) -> char {
    BYTE_TO_CHAR[byte as usize]
}

/// Map a surrogate character back to its raw byte, if it belongs to the table.
pub fn char_to_byte(symbol: char) -> Option<u8> {
    CHAR_TO_BYTE.get(&symbol).copied()
}
