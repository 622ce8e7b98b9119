//! IPFIX (RFC 7011) flow export.
//!
//! Every message carries its own template, so a collector can decode any
//! single datagram without prior state:
//!
//! ```text
//! +--------------------------+  16 bytes
//! | Message header           |  version 10, length, export time,
//! |                          |  sequence, observation domain
//! +--------------------------+  116 bytes
//! | Template set (ID 2)      |  template 257, 23 field specifiers
//! +--------------------------+  97 bytes
//! | Data set (ID 257)        |  one 93-byte record
//! +--------------------------+
//! ```
//!
//! The layout of a record is fixed by [`TEMPLATE_FIELDS`]. Four fields are
//! enterprise-specific and take 8 bytes in the template instead of 4.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DeviceIdentity, IpfixSettings};
use crate::cycle::{Cycle, Outcome, sleep_or_cancel};
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::metrics::Observer;
use crate::rate_limit::RateLimiter;

pub const IPFIX_VERSION: u16 = 10;
pub const TEMPLATE_SET_ID: u16 = 2;
pub const TEMPLATE_ID: u16 = 257;
pub const OBSERVATION_DOMAIN_ID: u32 = 257;
pub const SEQUENCE_NUMBER: u32 = 1;

pub const MESSAGE_HEADER_LENGTH: usize = 16;
const SET_HEADER_LENGTH: usize = 4;
const TEMPLATE_RECORD_HEADER_LENGTH: usize = 4;

/// Enterprise bit of an Information Element ID.
pub const ENTERPRISE_BIT: u16 = 0x8000;

/// Private Enterprise Number qualifying the connection fields.
pub const CONNECTION_FIELDS_PEN: u32 = 9;

/// Placeholder MACs for endpoints that are not the simulated device
/// (RFC 7042 documentation range).
pub const PLACEHOLDER_SOURCE_MAC: MacAddr = MacAddr([0x00, 0x00, 0x5e, 0x00, 0x53, 0x01]);
pub const PLACEHOLDER_DESTINATION_MAC: MacAddr = MacAddr([0x00, 0x00, 0x5e, 0x00, 0x53, 0x02]);

const TCP_FLAGS_PSH_ACK: u8 = 0x18;
const BIFLOW_INITIATOR: u8 = 1;
const NEW_CONNECTION_DELTA: u32 = 1;
const OBSERVATION_POINT_ID: u64 = 1;
/// IANA-L4 classification engine (3), selector 80.
const APPLICATION_ID: u32 = 0x0300_0050;
const FLOW_DURATION_MS: i64 = 1000;

/// One field specifier of the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub element_id: u16,
    pub length: u16,
    pub enterprise: Option<u32>,
}

impl Field {
    pub const fn new(element_id: u16, length: u16) -> Self {
        Self {
            element_id,
            length,
            enterprise: None,
        }
    }

    pub const fn enterprise(element_id: u16, length: u16, number: u32) -> Self {
        Self {
            element_id,
            length,
            enterprise: Some(number),
        }
    }

    /// Size of this specifier inside the template record.
    pub const fn specifier_length(&self) -> usize {
        if self.enterprise.is_some() { 8 } else { 4 }
    }
}

/// Record layout, in wire order.
pub const TEMPLATE_FIELDS: [Field; 23] = [
    Field::new(56, 6),  // sourceMacAddress
    Field::new(81, 6),  // postSourceMacAddress
    Field::new(80, 6),  // destinationMacAddress
    Field::new(57, 6),  // postDestinationMacAddress
    Field::new(8, 4),   // sourceIPv4Address
    Field::new(12, 4),  // destinationIPv4Address
    Field::new(7, 2),   // sourceTransportPort
    Field::new(11, 2),  // destinationTransportPort
    Field::new(6, 1),   // tcpControlBits
    Field::new(61, 1),  // flowDirection
    Field::new(2, 8),   // packetDeltaCount
    Field::new(152, 8), // flowStartMilliseconds
    Field::new(153, 8), // flowEndMilliseconds
    Field::new(239, 1), // biflowDirection
    Field::new(278, 4), // newConnectionDeltaCount
    Field::enterprise(12236, 4, CONNECTION_FIELDS_PEN), // connectionClientIPv4Address
    Field::enterprise(12237, 2, CONNECTION_FIELDS_PEN), // connectionClientTransportPort
    Field::enterprise(12240, 4, CONNECTION_FIELDS_PEN), // connectionServerIPv4Address
    Field::enterprise(12241, 2, CONNECTION_FIELDS_PEN), // connectionServerTransportPort
    Field::new(138, 8), // observationPointId
    Field::new(60, 1),  // ipVersion
    Field::new(4, 1),   // protocolIdentifier
    Field::new(95, 4),  // applicationId
];

/// Bytes of one data record (93).
pub const RECORD_LENGTH: usize = {
    let mut total = 0;
    let mut index = 0;
    while index < TEMPLATE_FIELDS.len() {
        total += TEMPLATE_FIELDS[index].length as usize;
        index += 1;
    }
    total
};

/// Bytes of the template set including its header (116).
pub const TEMPLATE_SET_LENGTH: usize = {
    let mut total = SET_HEADER_LENGTH + TEMPLATE_RECORD_HEADER_LENGTH;
    let mut index = 0;
    while index < TEMPLATE_FIELDS.len() {
        total += TEMPLATE_FIELDS[index].specifier_length();
        index += 1;
    }
    total
};

/// Bytes of the data set including its header (97).
pub const DATA_SET_LENGTH: usize = SET_HEADER_LENGTH + RECORD_LENGTH;

/// Bytes of a complete message (229).
pub const MESSAGE_LENGTH: usize = MESSAGE_HEADER_LENGTH + TEMPLATE_SET_LENGTH + DATA_SET_LENGTH;

/// IP protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Case-insensitive. Anything other than `udp` is treated as TCP.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("udp") {
            Self::Udp
        } else {
            Self::Tcp
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

/// One flow to report, as configured in the `traffic` JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    #[serde(rename = "SourceIP")]
    pub source_ip: Ipv4Addr,
    #[serde(rename = "DestinationIP")]
    pub destination_ip: Ipv4Addr,
    #[serde(rename = "SourcePort", default)]
    pub source_port: u16,
    #[serde(rename = "DestinationPort", default)]
    pub destination_port: u16,
    #[serde(rename = "Packets", default)]
    pub packets: u32,
    #[serde(rename = "Octets", default)]
    pub octets: u32,
    #[serde(rename = "Protocol", default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

impl TrafficRecord {
    pub fn protocol(&self) -> Protocol {
        Protocol::from_name(&self.protocol)
    }
}

/// Parses the configured traffic list. Malformed JSON and an empty list are
/// both errors.
pub fn parse_traffic(json: &str) -> Result<Vec<TrafficRecord>> {
    let records: Vec<TrafficRecord> =
        serde_json::from_str(json).map_err(|error| Error::Traffic(error.to_string()))?;
    if records.is_empty() {
        return Err(Error::Traffic("no traffic records configured".to_string()));
    }
    Ok(records)
}

/// Builds IPFIX messages on behalf of one device.
#[derive(Debug, Clone)]
pub struct IpfixEncoder {
    device_mac: MacAddr,
    device_ip: Ipv4Addr,
}

impl IpfixEncoder {
    pub fn new(device_mac: MacAddr, device_ip: Ipv4Addr) -> Self {
        Self {
            device_mac,
            device_ip,
        }
    }

    /// Encodes `record` with the current time.
    pub fn encode(&self, record: &TrafficRecord) -> Vec<u8> {
        self.encode_at(record, Utc::now())
    }

    /// Encodes `record` as if exported at `now`. Identical inputs give
    /// identical bytes.
    pub fn encode_at(&self, record: &TrafficRecord, now: DateTime<Utc>) -> Vec<u8> {
        let mut message = Vec::with_capacity(MESSAGE_LENGTH);

        message.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        message.extend_from_slice(&(MESSAGE_LENGTH as u16).to_be_bytes());
        message.extend_from_slice(&(now.timestamp() as u32).to_be_bytes());
        message.extend_from_slice(&SEQUENCE_NUMBER.to_be_bytes());
        message.extend_from_slice(&OBSERVATION_DOMAIN_ID.to_be_bytes());

        write_template_set(&mut message);
        self.write_data_set(&mut message, record, now);

        debug_assert_eq!(message.len(), MESSAGE_LENGTH);
        message
    }

    fn mac_for(&self, ip: Ipv4Addr, placeholder: MacAddr) -> MacAddr {
        if ip == self.device_ip {
            self.device_mac
        } else {
            placeholder
        }
    }

    fn write_data_set(&self, buf: &mut Vec<u8>, record: &TrafficRecord, now: DateTime<Utc>) {
        let start = buf.len();
        buf.extend_from_slice(&TEMPLATE_ID.to_be_bytes());
        buf.extend_from_slice(&(DATA_SET_LENGTH as u16).to_be_bytes());

        let source_mac = self.mac_for(record.source_ip, PLACEHOLDER_SOURCE_MAC);
        let destination_mac = self.mac_for(record.destination_ip, PLACEHOLDER_DESTINATION_MAC);
        // 0 = ingress, 1 = egress, seen from the device.
        let direction = u8::from(record.source_ip == self.device_ip);
        let flow_start = now.timestamp_millis();
        let flow_end = flow_start + FLOW_DURATION_MS;

        buf.extend_from_slice(&source_mac.octets());
        buf.extend_from_slice(&source_mac.octets());
        buf.extend_from_slice(&destination_mac.octets());
        buf.extend_from_slice(&destination_mac.octets());
        buf.extend_from_slice(&record.source_ip.octets());
        buf.extend_from_slice(&record.destination_ip.octets());
        buf.extend_from_slice(&record.source_port.to_be_bytes());
        buf.extend_from_slice(&record.destination_port.to_be_bytes());
        buf.push(TCP_FLAGS_PSH_ACK);
        buf.push(direction);
        buf.extend_from_slice(&u64::from(record.packets).to_be_bytes());
        buf.extend_from_slice(&(flow_start as u64).to_be_bytes());
        buf.extend_from_slice(&(flow_end as u64).to_be_bytes());
        buf.push(BIFLOW_INITIATOR);
        buf.extend_from_slice(&NEW_CONNECTION_DELTA.to_be_bytes());
        buf.extend_from_slice(&record.source_ip.octets());
        buf.extend_from_slice(&record.source_port.to_be_bytes());
        buf.extend_from_slice(&record.destination_ip.octets());
        buf.extend_from_slice(&record.destination_port.to_be_bytes());
        buf.extend_from_slice(&OBSERVATION_POINT_ID.to_be_bytes());
        buf.push(4);
        buf.push(record.protocol().number());
        buf.extend_from_slice(&APPLICATION_ID.to_be_bytes());

        debug_assert_eq!(buf.len() - start, DATA_SET_LENGTH);
    }
}

fn write_template_set(buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
    buf.extend_from_slice(&(TEMPLATE_SET_LENGTH as u16).to_be_bytes());
    buf.extend_from_slice(&TEMPLATE_ID.to_be_bytes());
    buf.extend_from_slice(&(TEMPLATE_FIELDS.len() as u16).to_be_bytes());

    for field in &TEMPLATE_FIELDS {
        match field.enterprise {
            Some(number) => {
                buf.extend_from_slice(&(field.element_id | ENTERPRISE_BIT).to_be_bytes());
                buf.extend_from_slice(&field.length.to_be_bytes());
                buf.extend_from_slice(&number.to_be_bytes());
            }
            None => {
                buf.extend_from_slice(&field.element_id.to_be_bytes());
                buf.extend_from_slice(&field.length.to_be_bytes());
            }
        }
    }

    debug_assert_eq!(buf.len() - start, TEMPLATE_SET_LENGTH);
}

/// Sends one message per traffic record to a collector.
pub struct IpfixExporter {
    encoder: IpfixEncoder,
    collector: SocketAddr,
    traffic: String,
    interval: Duration,
    limiter: Arc<RateLimiter>,
    observer: Arc<dyn Observer>,
}

impl IpfixExporter {
    pub fn new(
        settings: &IpfixSettings,
        device: &DeviceIdentity,
        limiter: Arc<RateLimiter>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            encoder: IpfixEncoder::new(device.mac, device.ip),
            collector: SocketAddr::V4(SocketAddrV4::new(
                settings.destination_ip,
                settings.destination_port,
            )),
            traffic: settings.traffic.clone(),
            interval: settings.interval,
            limiter,
            observer,
        }
    }

    pub fn collector(&self) -> SocketAddr {
        self.collector
    }

    /// Sends one message per record, taking a rate-limiter token for each.
    ///
    /// Returns how many messages were sent. Individual send failures are
    /// logged and counted; a closed limiter ends the batch early.
    pub async fn export(&self, socket: &UdpSocket, records: &[TrafficRecord]) -> Result<usize> {
        let mut sent = 0;
        for record in records {
            if !self.limiter.wait().await {
                return Err(Error::Shutdown);
            }

            let message = self.encoder.encode(record);
            match socket.send_to(&message, self.collector).await {
                Ok(_) => {
                    sent += 1;
                    self.observer.ipfix_packet_sent();
                    debug!(
                        "IPFIX flow {}:{} -> {}:{} exported to {}",
                        record.source_ip,
                        record.source_port,
                        record.destination_ip,
                        record.destination_port,
                        self.collector
                    );
                }
                Err(error) => {
                    self.observer.error();
                    warn!("Error sending IPFIX packet to {}: {}", self.collector, error);
                }
            }
        }
        Ok(sent)
    }

    /// Exports every record each interval until cancelled.
    ///
    /// A malformed or empty traffic list ends this task only.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let records = parse_traffic(&self.traffic)?;
        let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
            .await?;
        info!(
            "IPFIX exporter started - {} records to {} every {:?}",
            records.len(),
            self.collector,
            self.interval
        );

        let mut cycle = Cycle::fixed(self.interval);
        while !cancel.is_cancelled() {
            cycle.begin();
            let result = tokio::select! {
                result = self.export(&socket, &records) => result,
                _ = cancel.cancelled() => break,
            };
            let outcome = match result {
                Ok(sent) => {
                    if sent > 0 {
                        cycle.sent();
                    }
                    if sent == records.len() {
                        Outcome::Completed
                    } else {
                        Outcome::Failed
                    }
                }
                Err(Error::Shutdown) => break,
                Err(error) => {
                    warn!("IPFIX export failed: {}", error);
                    Outcome::Failed
                }
            };

            let delay = cycle.finish(outcome);
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
            cycle.wake();
        }

        info!(
            "IPFIX exporter stopped after {} rounds ({} incomplete)",
            cycle.iterations(),
            cycle.failures()
        );
        Ok(())
    }
}
