//! The NTLMSSP binary message layouts.
//!
//! All multi-byte integers are little-endian. Variable-length fields are referenced from the fixed
//! part of a message through [`SecurityBuffer`]s whose offsets count from the start of the message.


use bitflags::bitflags;
use thiserror::Error;

use crate::credentials::Credentials;
use crate::crypto::resolve_challenge;
use crate::encoding::{rust_string_to_oem, rust_string_to_utf16_le};


/// The magic value at the start of every NTLMSSP data packet.
pub const NTLMSSP_MAGIC: [u8; 8] = *b"NTLMSSP\0";

/// The largest payload a single security buffer can describe.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// The size of the fixed part of a Negotiate message.
pub const NEGOTIATE_HEADER_LEN: usize
    = 8 // magic
    + 4 // message type
    + 4 // flags
    + 8 // domain secbuffer
    + 8 // workstation secbuffer
    ;

/// The size of the part of a Challenge message that is read: everything up to and including the
/// server challenge.
pub const CHALLENGE_MIN_LEN: usize
    = 8 // magic
    + 4 // message type
    + 8 // target name secbuffer
    + 4 // flags
    + 8 // challenge
    ;

/// The size of the fixed part of an Authenticate message.
pub const AUTHENTICATE_HEADER_LEN: usize
    = 8 // magic
    + 4 // message type
    + 8 // LM response secbuffer
    + 8 // NT response secbuffer
    + 8 // domain name secbuffer
    + 8 // user name secbuffer
    + 8 // workstation name secbuffer
    + 8 // session key secbuffer
    + 4 // flags
    ;


bitflags! {
    /// NTLM operation flags.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct Flags: u32 {
        const NEGOTIATE_UNICODE = 0x0000_0001;
        const NEGOTIATE_OEM = 0x0000_0002;
        const REQUEST_TARGET = 0x0000_0004;
        const UNKNOWN_8 = 0x0000_0008;
        const NEGOTIATE_SIGN = 0x0000_0010;
        const NEGOTIATE_SEAL = 0x0000_0020;
        const NEGOTIATE_DATAGRAM = 0x0000_0040;
        const NEGOTIATE_LANMAN_KEY = 0x0000_0080;
        const NEGOTIATE_NETWARE = 0x0000_0100;
        const NEGOTIATE_NTLM = 0x0000_0200;
        const UNKNOWN_400 = 0x0000_0400;
        const NEGOTIATE_ANONYMOUS = 0x0000_0800;
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x0000_1000;
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NEGOTIATE_LOCAL_CALL = 0x0000_4000;
        const NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const TARGET_TYPE_SHARE = 0x0004_0000;
        const NEGOTIATE_NTLM2_KEY = 0x0008_0000;
        const REQUEST_INIT_RESPONSE = 0x0010_0000;
        const REQUEST_ACCEPT_RESPONSE = 0x0020_0000;
        const REQUEST_NON_NT_SESSION_KEY = 0x0040_0000;
        const NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const UNKNOWN_1000000 = 0x0100_0000;
        const NEGOTIATE_VERSION = 0x0200_0000;
        const UNKNOWN_4000000 = 0x0400_0000;
        const UNKNOWN_8000000 = 0x0800_0000;
        const UNKNOWN_10000000 = 0x1000_0000;
        const NEGOTIATE_128BIT = 0x2000_0000;
        const NEGOTIATE_KEY_EXCHANGE = 0x4000_0000;
        const NEGOTIATE_56BIT = 0x8000_0000;
    }
}

impl Flags {
    /// The flags announced in every Negotiate message (`0x0000_B207`).
    pub const NEGOTIATE_DEFAULT: Flags = Flags::NEGOTIATE_UNICODE
        .union(Flags::NEGOTIATE_OEM)
        .union(Flags::REQUEST_TARGET)
        .union(Flags::NEGOTIATE_NTLM)
        .union(Flags::NEGOTIATE_DOMAIN_SUPPLIED)
        .union(Flags::NEGOTIATE_WORKSTATION_SUPPLIED)
        .union(Flags::NEGOTIATE_ALWAYS_SIGN);
}


/// An error that may occur while decoding a Challenge message.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum DecodeError {
    /// The message is shorter than its fixed part.
    #[error("message too short (expected at least {expected_min_len} bytes, obtained {obtained_len})")]
    ShortMessage { expected_min_len: usize, obtained_len: usize },

    /// The message does not start with `NTLMSSP\0`.
    #[error("mismatched signature (expected {:?}, obtained {obtained:?})", NTLMSSP_MAGIC)]
    SignatureMismatch { obtained: Vec<u8> },

    /// The message type is not the one expected at this point of the handshake.
    #[error("wrong message type (expected {expected}, obtained {obtained})")]
    WrongMessageType { expected: u32, obtained: u32 },
}


/// An NTLM security buffer, pointing to data contained later in the message.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SecurityBuffer {
    pub length: u16,
    pub capacity: u16,
    pub offset: u32,
}

impl SecurityBuffer {
    /// Generates a security buffer for the given slice of bytes at the given offset.
    ///
    /// The length and capacity are both set to the length of the slice.
    ///
    /// # Panics
    ///
    /// Panics if the slice is longer than [`MAX_FIELD_LEN`].
    pub fn for_slice(slice: &[u8], offset: u32) -> Self {
        let len_u16: u16 = slice.len()
            .try_into().expect("buffer too long for u16 length");
        Self {
            length: len_u16,
            capacity: len_u16,
            offset,
        }
    }

    /// Serializes the security buffer into bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut ret = [0u8; 8];
        ret[0..2].copy_from_slice(&self.length.to_le_bytes());
        ret[2..4].copy_from_slice(&self.capacity.to_le_bytes());
        ret[4..8].copy_from_slice(&self.offset.to_le_bytes());
        ret
    }

    /// Deserializes a security buffer from exactly eight bytes.
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            length: u16::from_le_bytes([bytes[0], bytes[1]]),
            capacity: u16::from_le_bytes([bytes[2], bytes[3]]),
            offset: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Returns the region of `message` this buffer points at, if it lies within the message.
    pub fn slice_of<'a>(&self, message: &'a [u8]) -> Option<&'a [u8]> {
        let start = usize::try_from(self.offset).ok()?;
        let end = start.checked_add(usize::from(self.length))?;
        message.get(start..end)
    }
}


/// Assembles a message whose fixed part is followed by the payload of its security buffers.
///
/// Field descriptors are appended to the fixed part while their data goes to a separate payload
/// block that is joined at the end. The total size is known up front, so the output is allocated
/// once.
struct MessageWriter {
    bytes: Vec<u8>,
    payload: Vec<u8>,
    header_len: usize,
    next_offset: u32,
}

impl MessageWriter {
    fn new(message_type: u32, header_len: usize, payload_len: usize) -> Self {
        let mut bytes = Vec::with_capacity(header_len + payload_len);
        bytes.extend_from_slice(&NTLMSSP_MAGIC);
        bytes.extend_from_slice(&message_type.to_le_bytes());
        Self {
            bytes,
            payload: Vec::with_capacity(payload_len),
            header_len,
            next_offset: header_len.try_into().expect("header too long for u32 offset"),
        }
    }

    fn append_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn append_bytes(&mut self, value: &[u8]) {
        self.bytes.extend_from_slice(value);
    }

    /// Appends a security buffer pointing at `data`, which is queued for the payload block.
    fn append_sec_buffer(&mut self, data: &[u8]) {
        let sb = SecurityBuffer::for_slice(data, self.next_offset);
        self.bytes.extend_from_slice(&sb.to_bytes());
        self.payload.extend_from_slice(data);
        self.next_offset += u32::from(sb.length);
    }

    fn finish(mut self) -> Vec<u8> {
        assert_eq!(self.bytes.len(), self.header_len, "fixed part does not match its declared size");
        let expected_len = self.header_len + self.payload.len();
        assert_eq!(self.next_offset as usize, expected_len, "payload offsets out of step with payload");

        self.bytes.append(&mut self.payload);
        self.bytes
    }
}


/// The contents of an NTLM Negotiate message.
///
/// The Negotiate message is the first message of the handshake; the server is expected to respond
/// with a Challenge message.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NegotiateMessage {
    pub flags: Flags,

    /// The domain against which the client wishes to authenticate.
    pub supplied_domain: String,

    /// The NT hostname of the client.
    pub supplied_workstation: String,
}

impl NegotiateMessage {
    /// Creates a Negotiate message with the default flags.
    pub fn new(domain: &str, workstation: &str) -> Self {
        Self {
            flags: Flags::NEGOTIATE_DEFAULT,
            supplied_domain: domain.to_owned(),
            supplied_workstation: workstation.to_owned(),
        }
    }

    /// Serializes the Negotiate message into bytes.
    ///
    /// Domain and workstation are upper-cased and stored in the single-byte encoding.
    ///
    /// # Panics
    ///
    /// Panics if an encoded name is longer than [`MAX_FIELD_LEN`]; names held by
    /// [`Credentials`] never are.
    pub fn to_bytes(&self) -> Vec<u8> {
        let domain = rust_string_to_oem(&self.supplied_domain.to_uppercase());
        let workstation = rust_string_to_oem(&self.supplied_workstation.to_uppercase());

        let mut writer = MessageWriter::new(0x0000_0001, NEGOTIATE_HEADER_LEN, domain.len() + workstation.len());
        writer.append_u32(self.flags.bits());
        writer.append_sec_buffer(&domain);
        writer.append_sec_buffer(&workstation);
        writer.finish()
    }
}


/// The parts of an NTLM Challenge message needed to answer it.
///
/// The target name and everything following the server challenge are not retained.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChallengeMessage {
    /// The flags the server has accepted; echoed back in the Authenticate message.
    pub flags: Flags,

    /// The challenge value.
    pub challenge: [u8; 8],
}

impl ChallengeMessage {
    /// Serializes the Challenge message into bytes, with an empty target name and eight zero
    /// context bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new(0x0000_0002, CHALLENGE_MIN_LEN + 8, 0);
        writer.append_sec_buffer(&[]);
        writer.append_u32(self.flags.bits());
        writer.append_bytes(&self.challenge);
        writer.append_bytes(&[0u8; 8]);
        writer.finish()
    }
}

impl TryFrom<&[u8]> for ChallengeMessage {
    type Error = DecodeError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 12 {
            return Err(DecodeError::ShortMessage { expected_min_len: CHALLENGE_MIN_LEN, obtained_len: value.len() });
        }
        if value[0..8] != NTLMSSP_MAGIC {
            return Err(DecodeError::SignatureMismatch { obtained: Vec::from(&value[0..8]) });
        }
        let message_type = u32::from_le_bytes(value[8..12].try_into().unwrap());
        if message_type != 0x0000_0002 {
            return Err(DecodeError::WrongMessageType { expected: 0x0000_0002, obtained: message_type });
        }
        if value.len() < CHALLENGE_MIN_LEN {
            return Err(DecodeError::ShortMessage { expected_min_len: CHALLENGE_MIN_LEN, obtained_len: value.len() });
        }

        // 12..20 is the target name secbuffer, which is not needed
        let flags = Flags::from_bits_retain(u32::from_le_bytes(value[20..24].try_into().unwrap()));
        let challenge = value[24..32].try_into().unwrap();

        Ok(Self {
            flags,
            challenge,
        })
    }
}


/// The contents of an NTLM Authenticate message.
///
/// The Authenticate message is sent by the client in response to the server's Challenge message;
/// once it is accepted by the server, the authentication has succeeded.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AuthenticateMessage {
    pub lm_response: [u8; 24],
    pub nt_response: [u8; 24],
    pub domain_name: String,
    pub user_name: String,
    pub workstation_name: String,
    pub flags: Flags,
}

impl AuthenticateMessage {
    /// Answers a challenge using the given credential material.
    pub fn respond(creds: &Credentials, challenge: &ChallengeMessage) -> Self {
        Self {
            lm_response: resolve_challenge(&challenge.challenge, &creds.lm_keys),
            nt_response: resolve_challenge(&challenge.challenge, &creds.nt_keys),
            domain_name: creds.domain.clone(),
            user_name: creds.user.clone(),
            workstation_name: creds.hostname.clone(),
            flags: challenge.flags,
        }
    }

    /// Serializes the Authenticate message into bytes.
    ///
    /// Names are upper-cased and stored as UTF-16LE. The session key field is always empty.
    ///
    /// # Panics
    ///
    /// Panics if an encoded name is longer than [`MAX_FIELD_LEN`]; names taken from
    /// [`Credentials`] never are.
    pub fn to_bytes(&self) -> Vec<u8> {
        let domain = rust_string_to_utf16_le(&self.domain_name.to_uppercase());
        let user = rust_string_to_utf16_le(&self.user_name.to_uppercase());
        let workstation = rust_string_to_utf16_le(&self.workstation_name.to_uppercase());
        let payload_len = self.lm_response.len()
            + self.nt_response.len()
            + domain.len()
            + user.len()
            + workstation.len()
            ;

        let mut writer = MessageWriter::new(0x0000_0003, AUTHENTICATE_HEADER_LEN, payload_len);
        writer.append_sec_buffer(&self.lm_response);
        writer.append_sec_buffer(&self.nt_response);
        writer.append_sec_buffer(&domain);
        writer.append_sec_buffer(&user);
        writer.append_sec_buffer(&workstation);
        writer.append_sec_buffer(&[]);
        writer.append_u32(self.flags.bits());
        writer.finish()
    }
}


/// Encodes the Negotiate message for the given domain and workstation.
pub fn encode_negotiate(domain: &str, workstation: &str) -> Vec<u8> {
    NegotiateMessage::new(domain, workstation).to_bytes()
}

/// Decodes a Challenge message, keeping its flags and server challenge.
pub fn decode_challenge(bytes: &[u8]) -> Result<ChallengeMessage, DecodeError> {
    ChallengeMessage::try_from(bytes)
}

/// Encodes the Authenticate message answering `nonce`, echoing the server's `flags`.
pub fn encode_authenticate(creds: &Credentials, nonce: [u8; 8], flags: Flags) -> Vec<u8> {
    let challenge = ChallengeMessage {
        flags,
        challenge: nonce,
    };
    AuthenticateMessage::respond(creds, &challenge).to_bytes()
}


#[cfg(test)]
mod tests {
    use super::*;

    use hex_literal::hex;
    use proptest::prelude::*;

    fn sec_buffer_at(message: &[u8], pos: usize) -> SecurityBuffer {
        SecurityBuffer::from_bytes(message[pos..pos + 8].try_into().unwrap())
    }

    fn test_credentials() -> Credentials {
        Credentials::from_password("Domain", "User", "Password", "COMPUTER").unwrap()
    }

    #[test]
    fn negotiate_layout() {
        let message = encode_negotiate("WORKGROUP", "HOST1");
        assert_eq!(message.len(), 32 + 9 + 5);
        assert_eq!(message[0..8], NTLMSSP_MAGIC);
        assert_eq!(message[8..12], 1u32.to_le_bytes());
        assert_eq!(message[12..16], 0x0000_B207u32.to_le_bytes());

        let domain = sec_buffer_at(&message, 16);
        assert_eq!(domain, SecurityBuffer { length: 9, capacity: 9, offset: 32 });
        let workstation = sec_buffer_at(&message, 24);
        assert_eq!(workstation, SecurityBuffer { length: 5, capacity: 5, offset: 32 + 9 });

        assert_eq!(domain.slice_of(&message), Some(&b"WORKGROUP"[..]));
        assert_eq!(workstation.slice_of(&message), Some(&b"HOST1"[..]));
    }

    #[test]
    fn negotiate_upper_cases_names() {
        let message = encode_negotiate("workgroup", "host1");
        assert_eq!(message[32..], *b"WORKGROUPHOST1");
    }

    #[test]
    fn longest_names_fit() {
        let host = "h".repeat(32_767);
        let creds = Credentials::from_password("", "u", "pw", &host).unwrap();

        let negotiate = encode_negotiate(creds.domain(), creds.hostname());
        assert_eq!(sec_buffer_at(&negotiate, 24).length, 32_767);

        let message = encode_authenticate(&creds, [0; 8], Flags::NEGOTIATE_NTLM);
        assert_eq!(usize::from(sec_buffer_at(&message, 44).length), MAX_FIELD_LEN - 1);
    }

    #[test]
    fn negotiate_flags_constant() {
        assert_eq!(Flags::NEGOTIATE_DEFAULT.bits(), 0x0000_B207);
    }

    #[test]
    fn decode_known_challenge() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"NTLMSSP\0");
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 8]);
        raw.extend_from_slice(&0x0000_8206u32.to_le_bytes());
        raw.extend_from_slice(&hex!("0102030405060708"));
        raw.extend_from_slice(&[0u8; 8]);

        let challenge = decode_challenge(&raw).unwrap();
        assert_eq!(challenge.flags.bits(), 0x0000_8206);
        assert_eq!(challenge.challenge, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn decode_keeps_unknown_flag_bits() {
        let challenge = ChallengeMessage {
            flags: Flags::from_bits_retain(0xFFFF_FFFF),
            challenge: [9; 8],
        };
        assert_eq!(decode_challenge(&challenge.to_bytes()).unwrap(), challenge);
    }

    #[test]
    fn decode_rejects_bad_signature() {
        let mut raw = ChallengeMessage { flags: Flags::empty(), challenge: [0; 8] }.to_bytes();
        raw[7] = b'X';
        assert_eq!(
            decode_challenge(&raw),
            Err(DecodeError::SignatureMismatch { obtained: Vec::from(&b"NTLMSSPX"[..]) }),
        );
    }

    #[test]
    fn decode_rejects_other_message_types() {
        let raw = encode_negotiate("WORKGROUP", "HOST1");
        assert_eq!(
            decode_challenge(&raw),
            Err(DecodeError::WrongMessageType { expected: 2, obtained: 1 }),
        );
    }

    #[test]
    fn decode_rejects_truncated_messages() {
        let raw = ChallengeMessage { flags: Flags::empty(), challenge: [0; 8] }.to_bytes();
        assert_eq!(
            decode_challenge(&raw[..30]),
            Err(DecodeError::ShortMessage { expected_min_len: 32, obtained_len: 30 }),
        );
        assert_eq!(
            decode_challenge(&raw[..4]),
            Err(DecodeError::ShortMessage { expected_min_len: 32, obtained_len: 4 }),
        );
    }

    #[test]
    fn authenticate_layout() {
        let creds = test_credentials();
        let nonce = hex!("0123456789abcdef");
        let message = encode_authenticate(&creds, nonce, Flags::from_bits_retain(0x0000_8206));

        let expected_len = 64 + 2 * 6 + 2 * 4 + 2 * 8 + 24 + 24;
        assert_eq!(message.len(), expected_len);
        assert_eq!(message[0..8], NTLMSSP_MAGIC);
        assert_eq!(message[8..12], 3u32.to_le_bytes());
        assert_eq!(message[60..64], 0x0000_8206u32.to_le_bytes());

        let lm = sec_buffer_at(&message, 12);
        let nt = sec_buffer_at(&message, 20);
        let domain = sec_buffer_at(&message, 28);
        let user = sec_buffer_at(&message, 36);
        let workstation = sec_buffer_at(&message, 44);
        let session_key = sec_buffer_at(&message, 52);

        assert_eq!(lm.slice_of(&message), Some(&hex!("98def7b87f88aa5dafe2df779688a172def11c7d5ccdef13")[..]));
        assert_eq!(nt.slice_of(&message), Some(&hex!("67c43011f30298a2ad35ece64f16331c44bdbed927841f94")[..]));
        assert_eq!(domain.slice_of(&message), Some(&rust_string_to_utf16_le("DOMAIN")[..]));
        assert_eq!(user.slice_of(&message), Some(&rust_string_to_utf16_le("USER")[..]));
        assert_eq!(workstation.slice_of(&message), Some(&rust_string_to_utf16_le("COMPUTER")[..]));
        assert_eq!(session_key, SecurityBuffer { length: 0, capacity: 0, offset: expected_len as u32 });
    }

    proptest! {
        #[test]
        fn challenge_fields_survive_decoding(flags in any::<u32>(), nonce in any::<[u8; 8]>()) {
            let challenge = ChallengeMessage { flags: Flags::from_bits_retain(flags), challenge: nonce };
            let decoded = decode_challenge(&challenge.to_bytes()).unwrap();
            prop_assert_eq!(decoded.flags.bits(), flags);
            prop_assert_eq!(decoded.challenge, nonce);
        }

        #[test]
        fn authenticate_offsets_match_payload(
            domain in "[A-Z]{0,15}",
            user in "[A-Z0-9]{0,20}",
            hostname in "[A-Z0-9-]{0,15}",
            nonce in any::<[u8; 8]>(),
        ) {
            let creds = Credentials::from_password(&domain, &user, "secret", &hostname).unwrap();
            let message = encode_authenticate(&creds, nonce, Flags::NEGOTIATE_NTLM);
            prop_assert_eq!(
                message.len(),
                64 + 2 * domain.len() + 2 * user.len() + 2 * hostname.len() + 24 + 24,
            );

            let mut expected_offset = 64usize;
            for (i, pos) in (12..60).step_by(8).enumerate() {
                let sb = sec_buffer_at(&message, pos);
                prop_assert_eq!(sb.length, sb.capacity);
                prop_assert_eq!(sb.offset as usize, expected_offset);
                prop_assert!(sb.slice_of(&message).is_some() || sb.length == 0);
                expected_offset += usize::from(sb.length);
                if i < 2 {
                    prop_assert_eq!(sb.length, 24);
                }
            }
            prop_assert_eq!(expected_offset, message.len());
        }
    }
}
