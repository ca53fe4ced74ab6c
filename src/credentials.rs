//! Credential material: the identity presented to the proxy and the DES keys derived from the
//! user's password.


use std::fmt;

use thiserror::Error;

use crate::crypto::{derive_keys, lm_hash, nt_hash, pad_hash, DesKey, PasswordHash};
use crate::encoding::rust_string_to_utf16_le;
use crate::message::MAX_FIELD_LEN;


/// An error that may occur while constructing credentials.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CredentialsError {
    /// A hash is not a valid hexadecimal string.
    #[error("{which} hash is not valid hex: {source}")]
    InvalidHex { which: &'static str, source: hex::FromHexError },

    /// A hash has neither 16 bytes nor 16 bytes followed by five zero bytes.
    #[error("{which} hash has {obtained} bytes (expected 16)")]
    HashLength { which: &'static str, obtained: usize },

    /// A name does not fit into an NTLM message field.
    #[error("{which} name takes {encoded_len} bytes in UTF-16 (at most {} allowed)", MAX_FIELD_LEN)]
    NameTooLong { which: &'static str, encoded_len: usize },
}


/// The LM and NT hashes of a password, as lowercase hex strings.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HashPair {
    pub lm_hash_hex: String,
    pub nt_hash_hex: String,
}


/// The identity and key material used to answer an NTLM challenge.
///
/// Constructed once and never modified; one handshake engine owns one instance. Every name is
/// known to fit into the message fields it is sent in.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Credentials {
    pub(crate) domain: String,
    pub(crate) user: String,
    pub(crate) hostname: String,

    /// Keys derived from the LM hash; they produce the LM response.
    pub(crate) lm_keys: [DesKey; 3],

    /// Keys derived from the NT hash; they produce the NT response.
    pub(crate) nt_keys: [DesKey; 3],
}

impl Credentials {
    /// Derives credential material from a plaintext password.
    pub fn from_password(domain: &str, user: &str, password: &str, hostname: &str) -> Result<Self, CredentialsError> {
        Self::from_padded_hashes(domain, user, &lm_hash(password), &nt_hash(password), hostname)
    }

    /// Derives credential material from hex-encoded LM and NT hashes, as produced by [`hashes_of`]
    /// or by other tools.
    ///
    /// Each hash may be given as 16 bytes or as 21 bytes whose last five bytes are zero.
    pub fn from_hashes(domain: &str, user: &str, lm_hash_hex: &str, nt_hash_hex: &str, hostname: &str) -> Result<Self, CredentialsError> {
        let lm = parse_hash("LM", lm_hash_hex)?;
        let nt = parse_hash("NT", nt_hash_hex)?;
        Self::from_padded_hashes(domain, user, &lm, &nt, hostname)
    }

    fn from_padded_hashes(domain: &str, user: &str, lm: &PasswordHash, nt: &PasswordHash, hostname: &str) -> Result<Self, CredentialsError> {
        check_name_len("domain", domain)?;
        check_name_len("user", user)?;
        check_name_len("host", hostname)?;
        Ok(Self {
            domain: domain.to_owned(),
            user: user.to_owned(),
            hostname: hostname.to_owned(),
            lm_keys: derive_keys(lm),
            nt_keys: derive_keys(nt),
        })
    }

    /// The domain the user belongs to. May be empty.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The NT hostname of the client machine.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("user", &self.user)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}


/// Names are sent upper-cased, once as UTF-16 and, for domain and host, once in the single-byte
/// encoding, which is never longer.
fn check_name_len(which: &'static str, name: &str) -> Result<(), CredentialsError> {
    let encoded_len = rust_string_to_utf16_le(&name.to_uppercase()).len();
    if encoded_len > MAX_FIELD_LEN {
        return Err(CredentialsError::NameTooLong { which, encoded_len });
    }
    Ok(())
}


fn parse_hash(which: &'static str, hash_hex: &str) -> Result<PasswordHash, CredentialsError> {
    let bytes = hex::decode(hash_hex.trim())
        .map_err(|source| CredentialsError::InvalidHex { which, source })?;

    let trailer_is_zero = bytes.get(16..).map_or(false, |rest| rest.iter().all(|b| *b == 0));
    if bytes.len() != 16 && !(bytes.len() == 21 && trailer_is_zero) {
        return Err(CredentialsError::HashLength { which, obtained: bytes.len() });
    }

    let hash: [u8; 16] = bytes[0..16].try_into().unwrap();
    Ok(pad_hash(&hash))
}


/// Computes the LM and NT hashes of a password, for later use with [`Credentials::from_hashes`].
pub fn hashes_of(password: &str) -> HashPair {
    HashPair {
        lm_hash_hex: hex::encode(&lm_hash(password)[0..16]),
        nt_hash_hex: hex::encode(&nt_hash(password)[0..16]),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_of_password() {
        assert_eq!(hashes_of("Password"), HashPair {
            lm_hash_hex: "e52cac67419a9a224a3b108f3fa6cb6d".to_owned(),
            nt_hash_hex: "a4f49c406510bdcab6824ee7c30fd852".to_owned(),
        });
    }

    #[test]
    fn hashes_and_password_give_same_keys() {
        let from_password = Credentials::from_password("WORKGROUP", "alice", "hunter2", "HOST1").unwrap();
        let pair = hashes_of("hunter2");
        let from_hashes = Credentials::from_hashes("WORKGROUP", "alice", &pair.lm_hash_hex, &pair.nt_hash_hex, "HOST1")
            .unwrap();
        assert_eq!(from_password, from_hashes);
    }

    #[test]
    fn padded_hashes_are_accepted() {
        let pair = hashes_of("hunter2");
        let lm = format!("{}0000000000", pair.lm_hash_hex);
        let nt = format!("{}0000000000", pair.nt_hash_hex.to_uppercase());
        let creds = Credentials::from_hashes("", "bob", &lm, &nt, "HOST1").unwrap();
        assert_eq!(creds, Credentials::from_password("", "bob", "hunter2", "HOST1").unwrap());
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        let pair = hashes_of("hunter2");

        let err = Credentials::from_hashes("", "bob", "zz", &pair.nt_hash_hex, "HOST1").unwrap_err();
        assert!(matches!(err, CredentialsError::InvalidHex { which: "LM", .. }));

        let err = Credentials::from_hashes("", "bob", &pair.lm_hash_hex, "00112233", "HOST1").unwrap_err();
        assert_eq!(err, CredentialsError::HashLength { which: "NT", obtained: 4 });

        let trailing = format!("{}0000000001", pair.nt_hash_hex);
        let err = Credentials::from_hashes("", "bob", &pair.lm_hash_hex, &trailing, "HOST1").unwrap_err();
        assert_eq!(err, CredentialsError::HashLength { which: "NT", obtained: 21 });
    }

    #[test]
    fn debug_output_hides_keys() {
        let creds = Credentials::from_password("WORKGROUP", "alice", "hunter2", "HOST1").unwrap();
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("keys"));
    }

    #[test]
    fn over_long_names_are_rejected() {
        let long = "A".repeat(40_000);

        let err = Credentials::from_password("D", &long, "pw", "H").unwrap_err();
        assert_eq!(err, CredentialsError::NameTooLong { which: "user", encoded_len: 80_000 });

        let pair = hashes_of("pw");
        let err = Credentials::from_hashes("D", "u", &pair.lm_hash_hex, &pair.nt_hash_hex, &long).unwrap_err();
        assert_eq!(err, CredentialsError::NameTooLong { which: "host", encoded_len: 80_000 });

        // 32767 UTF-16 units is the most a field can carry
        let longest = "d".repeat(32_767);
        let creds = Credentials::from_password(&longest, "u", "pw", "H").unwrap();
        assert_eq!(creds.domain(), longest);
        assert!(Credentials::from_password(&format!("{}d", longest), "u", "pw", "H").is_err());
    }
}
