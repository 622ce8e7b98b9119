//! DHCP request construction per RFC 2131, wrapped in a link-layer frame.
//!
//! A DHCP packet consists of a fixed 236-byte header followed by a 4-byte
//! magic cookie and variable-length options. The simulator only ever sends
//! client requests, so this module builds packets and never parses them.
//!
//! # Packet Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                          sname (64)                           |
//! +---------------------------------------------------------------+
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! Because the packet leaves through a raw link socket, [`EthernetFrame`]
//! adds the Ethernet II, IPv4 and UDP headers by hand.
//!
//! # References
//!
//! - RFC 2131: Dynamic Host Configuration Protocol
//! - RFC 791: Internet Protocol
//! - RFC 768: User Datagram Protocol

use std::net::Ipv4Addr;

use crate::mac::MacAddr;
use crate::options::{DhcpOption, MessageType, OptionCode, OptionValue};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Minimum DHCP packet size per RFC 2131 §2.
///
/// DHCP requires packets to be at least 300 bytes for compatibility
/// with BOOTP relay agents.
pub const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Initial capacity for packet encoding buffer.
///
/// 576 bytes is the minimum MTU that all hosts must accept per RFC 791.
const DHCP_ENCODE_CAPACITY: usize = 576;

/// Offset of the options area (fixed header plus magic cookie).
pub const DHCP_OPTIONS_OFFSET: usize = 240;

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// Hardware type for Ethernet (most common).
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet (6 bytes).
pub const HLEN_ETHERNET: u8 = 6;

/// Broadcast bit of the `flags` field.
pub const FLAG_BROADCAST: u16 = 0x8000;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERNET_HEADER_SIZE: usize = 14;
const IPV4_HEADER_SIZE: usize = 20;
const UDP_HEADER_SIZE: usize = 8;
const IPV4_VERSION_IHL: u8 = 0x45;
const IPV4_DEFAULT_TTL: u8 = 64;
const IPPROTO_UDP: u8 = 17;

/// A DHCP client request.
///
/// Built once with [`request`](Self::request) and re-encoded unchanged for
/// every renewal.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    /// Operation code, always [`BOOTREQUEST`] for packets built here.
    pub op: u8,

    /// Hardware address type. [`HTYPE_ETHERNET`] (1) for Ethernet.
    pub htype: u8,

    /// Hardware address length. [`HLEN_ETHERNET`] (6) for Ethernet.
    pub hlen: u8,

    /// Hop count, incremented by relay agents.
    pub hops: u8,

    /// Transaction ID chosen by the client.
    pub xid: u32,

    /// Seconds elapsed since client began address acquisition.
    pub secs: u16,

    /// Flags. Bit 15 (0x8000) = broadcast flag.
    pub flags: u16,

    /// Client IP address (set by client in RENEWING/REBINDING states).
    pub ciaddr: Ipv4Addr,

    /// "Your" IP address, zero in client requests.
    pub yiaddr: Ipv4Addr,

    /// Server IP address, zero in client requests.
    pub siaddr: Ipv4Addr,

    /// Gateway IP address. Non-zero makes the request look relayed.
    pub giaddr: Ipv4Addr,

    /// Client hardware address (MAC for Ethernet).
    pub chaddr: [u8; 16],

    /// Options in the order they are written, Option 53 first.
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Creates a client request.
    ///
    /// `ciaddr` is written only when present and not `0.0.0.0`. The message
    /// type option always precedes the configured `options`.
    pub fn request(
        message_type: MessageType,
        chaddr: MacAddr,
        giaddr: Ipv4Addr,
        ciaddr: Option<Ipv4Addr>,
        xid: u32,
        broadcast: bool,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut hardware = [0u8; 16];
        hardware[..6].copy_from_slice(&chaddr.octets());

        let mut all_options = Vec::with_capacity(options.len() + 1);
        all_options.push(DhcpOption::new(
            OptionCode::MessageType as u8,
            OptionValue::ByteList(vec![message_type as u8]),
        ));
        all_options.extend(options);

        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: if broadcast { FLAG_BROADCAST } else { 0 },
            ciaddr: ciaddr
                .filter(|ip| !ip.is_unspecified())
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr,
            chaddr: hardware,
            options: all_options,
        }
    }

    /// Encodes the packet to bytes for transmission.
    ///
    /// The returned buffer is at least 300 bytes (padded per RFC 2131).
    /// Options are encoded in TLV format with an End marker. `sname` and
    /// `file` are always zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(DHCP_ENCODE_CAPACITY);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&[0u8; 64]);
        packet.extend_from_slice(&[0u8; 128]);

        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }

        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, OptionCode::Pad as u8);
        }

        packet
    }

    /// Returns the DHCP message type (Option 53) if present.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options
            .iter()
            .filter(|opt| opt.code == OptionCode::MessageType as u8)
            .find_map(|opt| match opt.value.to_bytes().as_slice() {
                [value] => MessageType::try_from(*value).ok(),
                _ => None,
            })
    }

    /// Returns true if the broadcast flag (bit 15) is set.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & FLAG_BROADCAST) != 0
    }
}

/// A UDP datagram inside IPv4 inside Ethernet II.
#[derive(Debug, Clone)]
pub struct EthernetFrame {
    pub destination: MacAddr,
    pub source: MacAddr,
    pub ip_source: Ipv4Addr,
    pub ip_destination: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    pub fn new(
        destination: MacAddr,
        source: MacAddr,
        ip_source: Ipv4Addr,
        ip_destination: Ipv4Addr,
        source_port: u16,
        destination_port: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            destination,
            source,
            ip_source,
            ip_destination,
            source_port,
            destination_port,
            payload,
        }
    }

    /// Wraps a DHCP request for delivery to `server`.
    ///
    /// The IP source is the packet's `giaddr`. A non-zero `giaddr` emulates a
    /// relay agent, so the frame leaves from the server port (67); otherwise
    /// from the client port (68).
    pub fn dhcp(
        destination: MacAddr,
        source: MacAddr,
        server: Ipv4Addr,
        packet: &DhcpPacket,
    ) -> Self {
        let source_port = if packet.giaddr.is_unspecified() {
            DHCP_CLIENT_PORT
        } else {
            DHCP_SERVER_PORT
        };

        Self::new(
            destination,
            source,
            packet.giaddr,
            server,
            source_port,
            DHCP_SERVER_PORT,
            packet.encode(),
        )
    }

    /// Serializes all three headers and the payload.
    pub fn encode(&self) -> Vec<u8> {
        let udp_length = UDP_HEADER_SIZE + self.payload.len();
        let ip_length = IPV4_HEADER_SIZE + udp_length;
        let mut frame = Vec::with_capacity(ETHERNET_HEADER_SIZE + ip_length);

        frame.extend_from_slice(&self.destination.octets());
        frame.extend_from_slice(&self.source.octets());
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip_header = [0u8; IPV4_HEADER_SIZE];
        ip_header[0] = IPV4_VERSION_IHL;
        ip_header[2..4].copy_from_slice(&(ip_length as u16).to_be_bytes());
        ip_header[8] = IPV4_DEFAULT_TTL;
        ip_header[9] = IPPROTO_UDP;
        ip_header[12..16].copy_from_slice(&self.ip_source.octets());
        ip_header[16..20].copy_from_slice(&self.ip_destination.octets());
        let checksum = ipv4_checksum(&ip_header);
        ip_header[10..12].copy_from_slice(&checksum.to_be_bytes());
        frame.extend_from_slice(&ip_header);

        frame.extend_from_slice(&self.source_port.to_be_bytes());
        frame.extend_from_slice(&self.destination_port.to_be_bytes());
        frame.extend_from_slice(&(udp_length as u16).to_be_bytes());
        // UDP checksum is optional over IPv4.
        frame.extend_from_slice(&0u16.to_be_bytes());

        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// RFC 1071 one's complement checksum over a header with a zeroed
/// checksum field.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| match pair {
            [high, low] => u16::from_be_bytes([*high, *low]) as u32,
            [high] => (*high as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
