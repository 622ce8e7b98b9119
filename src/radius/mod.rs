//! RADIUS client side of the simulator.
//!
//! - [`packet`]: wire format, authenticators and User-Password hiding
//! - [`client`]: retried UDP exchange
//! - [`auth`]: periodic Access-Request loop
//! - [`accounting`]: periodic Accounting-Request loop

pub mod accounting;
pub mod auth;
pub mod client;
pub mod packet;

pub use accounting::Accountant;
pub use auth::Authenticator;
pub use client::RadiusClient;
pub use packet::{AttributeType, Code, Packet};

use std::net::{SocketAddr, SocketAddrV4};

use tracing::{info, warn};

use crate::config::{DeviceIdentity, RadiusSettings};
use crate::error::{Error, Result};
use packet::{Attribute, NAS_PORT_TYPE_ETHERNET};

pub(crate) fn server_address(settings: &RadiusSettings) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(settings.server, settings.port))
}

/// Pushes a string attribute, skipping empty or oversized values.
pub(crate) fn push_string(attributes: &mut Vec<Attribute>, kind: AttributeType, value: &str) {
    if value.is_empty() {
        return;
    }
    match Attribute::string(kind, value) {
        Ok(attribute) => attributes.push(attribute),
        Err(error) => warn!("Skipping {:?}: {}", kind, error),
    }
}

/// NAS and station attributes shared by authentication and accounting.
///
/// Order: NAS-IP-Address, Calling-Station-Id, Called-Station-Id,
/// NAS-Port-Type, NAS-Port, Framed-IP-Address, NAS-Identifier, NAS-Port-Id.
pub(crate) fn nas_attributes(settings: &RadiusSettings, device: &DeviceIdentity) -> Vec<Attribute> {
    let mut attributes = Vec::new();

    if let Some(ip) = settings.nas_ip_address {
        attributes.push(Attribute::ipv4(AttributeType::NasIpAddress, ip));
    }
    push_string(
        &mut attributes,
        AttributeType::CallingStationId,
        &device.mac.to_string(),
    );
    push_string(
        &mut attributes,
        AttributeType::CalledStationId,
        &settings.called_station_id,
    );
    attributes.push(Attribute::integer(
        AttributeType::NasPortType,
        NAS_PORT_TYPE_ETHERNET,
    ));
    attributes.push(Attribute::integer(AttributeType::NasPort, settings.nas_port));
    if let Some(ip) = settings.framed_ip_address {
        attributes.push(Attribute::ipv4(AttributeType::FramedIpAddress, ip));
    }
    push_string(
        &mut attributes,
        AttributeType::NasIdentifier,
        &settings.nas_identifier,
    );
    push_string(&mut attributes, AttributeType::NasPortId, &settings.nas_port_id);

    attributes
}

/// Logs every attribute of a response as type and hex value.
pub(crate) fn log_attributes(response: &Packet) {
    for attribute in &response.attributes {
        info!(
            "  Attribute: Type={}, Value={}",
            attribute.kind,
            attribute.hex_value()
        );
    }
}

/// Whether an exchange got as far as putting the request on the wire.
///
/// Answers, timeouts and rejected replies all follow a send; encoding and
/// socket errors do not.
pub(crate) fn request_went_out<T>(result: &Result<T>) -> bool {
    matches!(result, Ok(_) | Err(Error::Timeout(_) | Error::Radius { .. }))
}
