//! DHCP options sent by the simulated client.
//!
//! Options come from configuration as a JSON array of entries:
//!
//! ```json
//! [{"option": 12, "value": "sim-host", "type": "string"},
//!  {"option": 50, "value": "10.0.0.50", "type": "ipaddr"},
//!  {"option": 51, "value": "3600", "type": "int"},
//!  {"option": 55, "value": "1,3,6,15", "type": "bytes"}]
//! ```
//!
//! Each entry's `type` selects an [`OptionValue`] variant. Values that do
//! not parse degrade to a zero encoding instead of rejecting the whole
//! list. Entries with an unknown `type` are skipped with a warning.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions

use std::net::Ipv4Addr;

use serde::Deserialize;
use tracing::warn;

use crate::error::Result;

/// Maximum payload of a single option (1-byte length field).
const MAX_OPTION_LENGTH: usize = 255;

/// Option codes the packet builder writes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding (no operation).
    Pad = 0,
    /// DHCP message type (RFC 2132 §9.6).
    MessageType = 53,
    /// End of options marker.
    End = 255,
}

/// DHCP message types (Option 53, RFC 2132 §9.6) the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Request),
            other => Err(other),
        }
    }
}

/// One configured option as it appears in the JSON array.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionEntry {
    pub option: u8,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Typed option payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// `ipaddr`: 4-byte IPv4 address.
    IpAddr(Ipv4Addr),
    /// `string`: raw bytes of the text.
    Text(String),
    /// `int`: 4-byte big-endian unsigned integer.
    Integer(u32),
    /// `bytes`: comma-separated decimal byte literals.
    ByteList(Vec<u8>),
}

impl OptionValue {
    /// Interprets `value` according to `kind`. Returns `None` for unknown kinds.
    ///
    /// Malformed values never fail: an unparsable address becomes
    /// `0.0.0.0`, an unparsable integer or byte literal becomes 0.
    pub fn parse(kind: &str, value: &str) -> Option<Self> {
        let parsed = match kind {
            "ipaddr" => Self::IpAddr(value.trim().parse().unwrap_or_else(|_| {
                warn!("Invalid ipaddr option value '{}', encoding 0.0.0.0", value);
                Ipv4Addr::UNSPECIFIED
            })),
            "string" => Self::Text(value.to_string()),
            "int" => Self::Integer(parse_wrapping_u32(value).unwrap_or_else(|| {
                warn!("Invalid int option value '{}', encoding 0", value);
                0
            })),
            "bytes" => Self::ByteList(
                value
                    .split(',')
                    .map(|literal| {
                        parse_wrapping_u32(literal).map_or(0, |byte| byte as u8)
                    })
                    .collect(),
            ),
            _ => return None,
        };
        Some(parsed)
    }

    /// Wire bytes of the value, without code and length.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::IpAddr(addr) => addr.octets().to_vec(),
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Integer(value) => value.to_be_bytes().to_vec(),
            Self::ByteList(bytes) => bytes.clone(),
        }
    }
}

/// Integers wrap into 32 bits, so `-1` encodes as `0xffffffff`.
fn parse_wrapping_u32(value: &str) -> Option<u32> {
    value.trim().parse::<i64>().ok().map(|parsed| parsed as u32)
}

/// A DHCP option ready to be appended to a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub value: OptionValue,
}

impl DhcpOption {
    pub fn new(code: u8, value: OptionValue) -> Self {
        Self { code, value }
    }

    /// Encodes the option to its wire format (code + length + data).
    ///
    /// Payloads longer than 255 bytes are truncated.
    pub fn encode(&self) -> Vec<u8> {
        let data = self.value.to_bytes();
        let len = data.len().min(MAX_OPTION_LENGTH);
        let mut result = Vec::with_capacity(len + 2);
        result.push(self.code);
        result.push(len as u8);
        result.extend_from_slice(&data[..len]);
        result
    }
}

/// Parses the configured option list.
///
/// An empty string means no options. JSON that is not an array of entries
/// is an error; entries with an unknown `type` are skipped and logged.
pub fn parse_options(json: &str) -> Result<Vec<DhcpOption>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<OptionEntry> = serde_json::from_str(json)?;
    let options = entries
        .into_iter()
        .filter_map(|entry| match OptionValue::parse(&entry.kind, &entry.value) {
            Some(value) => Some(DhcpOption::new(entry.option, value)),
            None => {
                warn!(
                    "Skipping option {} with unknown type '{}'",
                    entry.option, entry.kind
                );
                None
            }
        })
        .collect();

    Ok(options)
}
