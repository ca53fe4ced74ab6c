//! String encodings used inside NTLM messages.
//!
//! The Negotiate message and the LM password hash use a single-byte ("OEM") encoding; the
//! Authenticate message uses UTF-16 in little-endian byte order. Proxies have no way of learning
//! the client's ANSI code page, so the single-byte form is fixed to Latin-1.


/// Converts the given Rust string into its single-byte form.
///
/// Characters outside Latin-1 cannot be represented and are replaced by `?`.
pub fn rust_string_to_oem(rust_str: &str) -> Vec<u8> {
    rust_str.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}


/// Converts the given Rust string into UTF-16 little-endian bytes, without a Byte Order Mark.
pub fn rust_string_to_utf16_le(rust_str: &str) -> Vec<u8> {
    rust_str.encode_utf16()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oem_keeps_latin1_and_replaces_the_rest() {
        assert_eq!(rust_string_to_oem("HOST1"), b"HOST1");
        assert_eq!(rust_string_to_oem("M\u{fc}LLER"), b"M\xfcLLER");
        assert_eq!(rust_string_to_oem("\u{20ac}5"), b"?5");
    }

    #[test]
    fn utf16_is_little_endian() {
        assert_eq!(rust_string_to_utf16_le("AB"), [0x41, 0x00, 0x42, 0x00]);
        assert_eq!(rust_string_to_utf16_le("\u{20ac}"), [0xAC, 0x20]);
        assert!(rust_string_to_utf16_le("").is_empty());
    }
}
