//! RADIUS wire format (RFC 2865, RFC 2866, RFC 2869).
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      |  Identifier   |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                     Authenticator (16)                        |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Attributes ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-
//! ```

use std::net::Ipv4Addr;

use md5::{Digest, Md5};

use crate::error::{Error, Result};

pub const HEADER_LENGTH: usize = 20;
pub const MAX_PACKET_LENGTH: usize = 4096;
pub const MAX_ATTRIBUTE_VALUE_LENGTH: usize = 253;
const MAX_PASSWORD_LENGTH: usize = 128;
const PASSWORD_BLOCK: usize = 16;

pub type Authenticator = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccountingRequest = 4,
    AccountingResponse = 5,
    AccessChallenge = 11,
}

impl TryFrom<u8> for Code {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AccessRequest),
            2 => Ok(Self::AccessAccept),
            3 => Ok(Self::AccessReject),
            4 => Ok(Self::AccountingRequest),
            5 => Ok(Self::AccountingResponse),
            11 => Ok(Self::AccessChallenge),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessRequest => write!(f, "Access-Request"),
            Self::AccessAccept => write!(f, "Access-Accept"),
            Self::AccessReject => write!(f, "Access-Reject"),
            Self::AccountingRequest => write!(f, "Accounting-Request"),
            Self::AccountingResponse => write!(f, "Accounting-Response"),
            Self::AccessChallenge => write!(f, "Access-Challenge"),
        }
    }
}

/// Attribute types sent by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeType {
    UserName = 1,
    UserPassword = 2,
    NasIpAddress = 4,
    NasPort = 5,
    FramedIpAddress = 8,
    CalledStationId = 30,
    CallingStationId = 31,
    NasIdentifier = 32,
    AcctStatusType = 40,
    AcctSessionId = 44,
    AcctSessionTime = 46,
    EventTimestamp = 55,
    NasPortType = 61,
    NasPortId = 87,
}

/// NAS-Port-Type value for Ethernet (RFC 2865 §5.41).
pub const NAS_PORT_TYPE_ETHERNET: u32 = 15;

/// Acct-Status-Type values (RFC 2866 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcctStatusType {
    Start = 1,
    Stop = 2,
    InterimUpdate = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u8,
    pub value: Vec<u8>,
}

impl Attribute {
    /// Values longer than 253 bytes cannot be encoded.
    pub fn new(kind: u8, value: Vec<u8>) -> Result<Self> {
        if value.len() > MAX_ATTRIBUTE_VALUE_LENGTH {
            return Err(Error::InvalidPacket(format!(
                "attribute {} value too long: {} bytes",
                kind,
                value.len()
            )));
        }
        Ok(Self { kind, value })
    }

    pub fn string(kind: AttributeType, value: &str) -> Result<Self> {
        Self::new(kind as u8, value.as_bytes().to_vec())
    }

    pub fn integer(kind: AttributeType, value: u32) -> Self {
        Self {
            kind: kind as u8,
            value: value.to_be_bytes().to_vec(),
        }
    }

    pub fn ipv4(kind: AttributeType, value: Ipv4Addr) -> Self {
        Self {
            kind: kind as u8,
            value: value.octets().to_vec(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.value.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind);
        buf.push(self.encoded_len() as u8);
        buf.extend_from_slice(&self.value);
    }

    /// Lowercase hex of the value, for logging.
    pub fn hex_value(&self) -> String {
        use std::fmt::Write;
        let mut result = String::with_capacity(self.value.len() * 2);
        for byte in &self.value {
            let _ = write!(result, "{:02x}", byte);
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: Code,
    pub identifier: u8,
    pub authenticator: Authenticator,
    pub attributes: Vec<Attribute>,
}

impl Packet {
    pub fn new(code: Code, identifier: u8, authenticator: Authenticator) -> Self {
        Self {
            code,
            identifier,
            authenticator,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// First attribute of the given type.
    pub fn attribute(&self, kind: u8) -> Option<&Attribute> {
        self.attributes.iter().find(|attribute| attribute.kind == kind)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH
            + self
                .attributes
                .iter()
                .map(Attribute::encoded_len)
                .sum::<usize>()
    }

    /// Encodes the packet with its current authenticator.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let length = self.encoded_len();
        if length > MAX_PACKET_LENGTH {
            return Err(Error::InvalidPacket(format!(
                "packet too long: {} bytes",
                length
            )));
        }

        let mut buf = Vec::with_capacity(length);
        buf.push(self.code as u8);
        buf.push(self.identifier);
        buf.extend_from_slice(&(length as u16).to_be_bytes());
        buf.extend_from_slice(&self.authenticator);
        for attribute in &self.attributes {
            attribute.encode_into(&mut buf);
        }
        Ok(buf)
    }

    /// Encodes the packet for sending with `secret`.
    ///
    /// Accounting-Request authenticators are derived from the packet itself
    /// (RFC 2866 §3), so the stored authenticator is replaced. Other codes
    /// are sent with the authenticator they carry.
    pub fn encode_request(&mut self, secret: &[u8]) -> Result<Vec<u8>> {
        if self.code != Code::AccountingRequest {
            return self.encode();
        }

        self.authenticator = [0u8; 16];
        let mut buf = self.encode()?;
        let authenticator = md5_of(&[buf.as_slice(), secret]);
        buf[4..HEADER_LENGTH].copy_from_slice(&authenticator);
        self.authenticator = authenticator;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LENGTH {
            return Err(Error::InvalidPacket(format!(
                "RADIUS packet too short: {} bytes",
                data.len()
            )));
        }

        let code = Code::try_from(data[0])
            .map_err(|code| Error::InvalidPacket(format!("unknown RADIUS code {}", code)))?;
        let identifier = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if !(HEADER_LENGTH..=MAX_PACKET_LENGTH).contains(&length) || length > data.len() {
            return Err(Error::InvalidPacket(format!(
                "invalid RADIUS length {} for {} received bytes",
                length,
                data.len()
            )));
        }

        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&data[4..HEADER_LENGTH]);

        // Bytes past the length field are padding and ignored.
        let mut attributes = Vec::new();
        let mut index = HEADER_LENGTH;
        while index < length {
            if index + 2 > length {
                return Err(Error::InvalidPacket("attribute header truncated".to_string()));
            }
            let kind = data[index];
            let attribute_length = data[index + 1] as usize;
            if attribute_length < 2 || index + attribute_length > length {
                return Err(Error::InvalidPacket(format!(
                    "attribute {} has invalid length {}",
                    kind, attribute_length
                )));
            }
            attributes.push(Attribute {
                kind,
                value: data[index + 2..index + attribute_length].to_vec(),
            });
            index += attribute_length;
        }

        Ok(Self {
            code,
            identifier,
            authenticator,
            attributes,
        })
    }
}

pub(crate) fn md5_of(parts: &[&[u8]]) -> Authenticator {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Random 16-byte Request Authenticator.
pub fn generate_request_authenticator() -> Authenticator {
    rand::random()
}

/// Hides a User-Password value (RFC 2865 §5.2).
///
/// The password is zero-padded to a multiple of 16 bytes (at least 16,
/// at most 128) and chained through MD5 of the secret.
pub fn encrypt_user_password(
    password: &[u8],
    secret: &[u8],
    request_authenticator: &Authenticator,
) -> Vec<u8> {
    let password = &password[..password.len().min(MAX_PASSWORD_LENGTH)];
    let padded_len = password.len().div_ceil(PASSWORD_BLOCK).max(1) * PASSWORD_BLOCK;
    let mut result = password.to_vec();
    result.resize(padded_len, 0);

    let mut previous: Vec<u8> = request_authenticator.to_vec();
    for block in result.chunks_mut(PASSWORD_BLOCK) {
        let key = md5_of(&[secret, previous.as_slice()]);
        for (byte, mask) in block.iter_mut().zip(key.iter()) {
            *byte ^= mask;
        }
        previous = block.to_vec();
    }
    result
}

/// Expected Response Authenticator for a raw response (RFC 2865 §3).
///
/// MD5(Code + Identifier + Length + Request Authenticator + Attributes + Secret)
pub fn response_authenticator(
    response: &[u8],
    request_authenticator: &Authenticator,
    secret: &[u8],
) -> Result<Authenticator> {
    if response.len() < HEADER_LENGTH {
        return Err(Error::InvalidPacket("response shorter than header".to_string()));
    }
    let length = (u16::from_be_bytes([response[2], response[3]]) as usize).min(response.len());
    Ok(md5_of(&[
        &response[..4],
        request_authenticator.as_slice(),
        &response[HEADER_LENGTH..length.max(HEADER_LENGTH)],
        secret,
    ]))
}

/// True when `response` was produced by a server holding `secret` for the
/// request carrying `request_authenticator`.
pub fn verify_response(
    response: &[u8],
    request_authenticator: &Authenticator,
    secret: &[u8],
) -> bool {
    match response_authenticator(response, request_authenticator, secret) {
        Ok(expected) => response[4..HEADER_LENGTH] == expected,
        Err(_) => false,
    }
}
