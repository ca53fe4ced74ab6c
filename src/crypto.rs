//! The legacy cryptographic primitives behind NTLMv1 challenge responses.
//!
//! Everything here is a pure function over fixed-size buffers. The shapes of keys, hashes and
//! nonces are encoded in the types, so a malformed buffer is a compile-time error rather than a
//! runtime condition.


use cipher::{BlockEncrypt, KeyInit};
use cipher::generic_array::GenericArray;
use des::Des;
use digest::Digest;
use md4::Md4;

use crate::encoding::{rust_string_to_oem, rust_string_to_utf16_le};


/// A DES key in its 8-byte layout (56 key bits plus 8 unused parity positions).
pub type DesKey = [u8; 8];

/// A 16-byte password hash padded with five zero bytes so that it splits evenly into three
/// 7-byte spans.
pub type PasswordHash = [u8; 21];

/// The fixed plaintext encrypted by both halves of the LM password.
const LM_MAGIC: [u8; 8] = *b"KGS!@#$%";

/// The number of password bytes the LM scheme considers.
const LM_PASSWORD_LEN: usize = 14;


/// Spreads 56 key bits over the 8 bytes of a DES key.
///
/// Each output byte takes the next seven bits of the input in its upper bits. Bit 0 of the output
/// bytes is not a computed parity bit; DES ignores it, so no parity correction is performed.
pub fn expand_key(key56: &[u8; 7]) -> DesKey {
    [
        key56[0] & 0xFE,
        (key56[0] << 7) | (key56[1] >> 1),
        (key56[1] << 6) | (key56[2] >> 2),
        (key56[2] << 5) | (key56[3] >> 3),
        (key56[3] << 4) | (key56[4] >> 4),
        (key56[4] << 3) | (key56[5] >> 5),
        (key56[5] << 2) | (key56[6] >> 6),
        key56[6] << 1,
    ]
}


/// Encrypts a single 8-byte block with DES in ECB mode.
pub fn des_encrypt(key: &DesKey, block: &[u8; 8]) -> [u8; 8] {
    let des_state = Des::new(&GenericArray::from(*key));
    let mut buf = GenericArray::from(*block);
    des_state.encrypt_block(&mut buf);

    let mut ret = [0u8; 8];
    ret.copy_from_slice(buf.as_slice());
    ret
}


/// Derives the LM hash of a password.
///
/// ```plain
///            ┌────────────┐  ┌───────────────┐  ┌─────────────┐
/// password ──┤ convert to ├──┤ encode as     ├──┤ truncate or ├──┐
///            │ uppercase  │  │ single bytes  │  │ pad to 14 B │  │
///            └────────────┘  └───────────────┘  └─────────────┘  │
///           ┌────────────────────────────────────────────────────┘
///           │┌───────┐
///           └┤ split │           "KGS!@#$%"
///            └─┬───┬─┘               │ input
///         0..7 │   │ 7..14    key ┌──┴──┐ output
///              │   └──────────────┤ DES ├────────────┐
///              │                  └─────┘            │ 8..16
///              │                                  ┌──┴───┐
///              │                 "KGS!@#$%"       │ join ├──── hash (+ 5 zero bytes)
///              │                     │ input      └──┬───┘
///              │              key ┌──┴──┐ output     │ 0..8
///              └──────────────────┤ DES ├────────────┘
///                                 └─────┘
/// ```
///
/// Each 7-byte half is turned into a DES key using [`expand_key`].
pub fn lm_hash(password: &str) -> PasswordHash {
    let mut password_bytes = rust_string_to_oem(&password.to_uppercase());
    password_bytes.resize(LM_PASSWORD_LEN, 0x00);

    let half0: [u8; 7] = password_bytes[0..7].try_into().unwrap();
    let half1: [u8; 7] = password_bytes[7..14].try_into().unwrap();

    let mut output = [0u8; 21];
    output[0..8].copy_from_slice(&des_encrypt(&expand_key(&half0), &LM_MAGIC));
    output[8..16].copy_from_slice(&des_encrypt(&expand_key(&half1), &LM_MAGIC));
    output
}


/// Derives the NT hash of a password: the MD4 digest of its UTF-16LE encoding.
pub fn nt_hash(password: &str) -> PasswordHash {
    let digest = Md4::digest(rust_string_to_utf16_le(password));

    let mut output = [0u8; 21];
    output[0..16].copy_from_slice(digest.as_slice());
    output
}


/// Pads a 16-byte hash to the 21-byte form expected by [`derive_keys`].
pub fn pad_hash(hash: &[u8; 16]) -> PasswordHash {
    let mut output = [0u8; 21];
    output[0..16].copy_from_slice(hash);
    output
}


/// Splits a padded hash into three 7-byte spans and expands each into a DES key.
pub fn derive_keys(hash: &PasswordHash) -> [DesKey; 3] {
    let span0: [u8; 7] = hash[0..7].try_into().unwrap();
    let span1: [u8; 7] = hash[7..14].try_into().unwrap();
    let span2: [u8; 7] = hash[14..21].try_into().unwrap();
    [expand_key(&span0), expand_key(&span1), expand_key(&span2)]
}


/// Computes the 24-byte response to a server challenge by encrypting the nonce under each of the
/// three keys.
pub fn resolve_challenge(nonce: &[u8; 8], keys: &[DesKey; 3]) -> [u8; 24] {
    let mut ret = [0u8; 24];
    for (chunk, key) in ret.chunks_exact_mut(8).zip(keys.iter()) {
        chunk.copy_from_slice(&des_encrypt(key, nonce));
    }
    ret
}


#[cfg(test)]
mod tests {
    use super::*;

    use hex_literal::hex;
    use proptest::prelude::*;

    const SERVER_CHALLENGE: [u8; 8] = hex!("0123456789abcdef");

    #[test]
    fn lm_hash_of_password() {
        let hash = lm_hash("Password");
        assert_eq!(hash[0..16], hex!("e52cac67419a9a224a3b108f3fa6cb6d"));
        assert_eq!(hash[16..21], [0u8; 5]);
    }

    #[test]
    fn lm_hash_of_empty_password() {
        assert_eq!(lm_hash("")[0..16], hex!("aad3b435b51404eeaad3b435b51404ee"));
    }

    #[test]
    fn lm_hash_ignores_case_and_truncates() {
        assert_eq!(lm_hash("password"), lm_hash("PASSWORD"));
        assert_eq!(lm_hash("ABCDEFGHIJKLMN"), lm_hash("ABCDEFGHIJKLMNOPQ"));
    }

    #[test]
    fn nt_hash_of_password() {
        let hash = nt_hash("Password");
        assert_eq!(hash[0..16], hex!("a4f49c406510bdcab6824ee7c30fd852"));
        assert_eq!(hash[16..21], [0u8; 5]);
    }

    #[test]
    fn nt_hash_of_empty_password() {
        assert_eq!(nt_hash("")[0..16], hex!("31d6cfe0d16ae931b73c59d7e0c089c0"));
    }

    #[test]
    fn ntlm_v1_responses() {
        let nt_response = resolve_challenge(&SERVER_CHALLENGE, &derive_keys(&nt_hash("Password")));
        assert_eq!(nt_response, hex!("67c43011f30298a2ad35ece64f16331c44bdbed927841f94"));

        let lm_response = resolve_challenge(&SERVER_CHALLENGE, &derive_keys(&lm_hash("Password")));
        assert_eq!(lm_response, hex!("98def7b87f88aa5dafe2df779688a172def11c7d5ccdef13"));
    }

    #[test]
    fn expand_key_spreads_bits() {
        assert_eq!(expand_key(&[0xFF; 7]), hex!("fefffffffffffffe"));
        assert_eq!(expand_key(&[0x00; 7]), [0x00; 8]);
        assert_eq!(expand_key(&hex!("80000000000000")), hex!("8000000000000000"));
        assert_eq!(expand_key(&hex!("01000000000000")), hex!("0080000000000000"));
    }

    #[test]
    fn derive_keys_uses_overlapping_spans() {
        let hash = pad_hash(&hex!("000102030405060708090a0b0c0d0e0f"));
        let keys = derive_keys(&hash);
        assert_eq!(keys[0], expand_key(&hex!("00010203040506")));
        assert_eq!(keys[1], expand_key(&hex!("0708090a0b0c0d")));
        assert_eq!(keys[2], expand_key(&hex!("0e0f0000000000")));
    }

    proptest! {
        #[test]
        fn nt_hash_is_padded_md4(password in "\\PC{0,32}") {
            let hash = nt_hash(&password);
            prop_assert_eq!(hash.len(), 21);
            prop_assert_eq!(&hash[16..21], &[0u8; 5]);
            let digest = Md4::digest(rust_string_to_utf16_le(&password));
            prop_assert_eq!(&hash[0..16], digest.as_slice());
        }

        #[test]
        fn expand_key_is_deterministic(key56 in any::<[u8; 7]>()) {
            prop_assert_eq!(expand_key(&key56), expand_key(&key56));
        }

        #[test]
        fn expand_key_keeps_all_56_bits(key56 in any::<[u8; 7]>()) {
            // reassemble the upper seven bits of each output byte
            let expanded = expand_key(&key56);
            let mut bits: u64 = 0;
            for byte in expanded {
                bits = (bits << 7) | u64::from(byte >> 1);
            }
            let mut original: u64 = 0;
            for byte in key56 {
                original = (original << 8) | u64::from(byte);
            }
            prop_assert_eq!(bits, original);
        }
    }
}
