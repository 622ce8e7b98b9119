//! DHCP lease renewal loop.
//!
//! The client builds one DHCP REQUEST at startup and re-sends the identical
//! frame every renew interval. The transaction ID is drawn once and reused
//! for every renewal, so a server sees the same transaction repeated.
//!
//! Send failures are fatal: the error propagates to the supervisor, which
//! stops the process.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{DeviceIdentity, DhcpSettings};
use crate::cycle::{Cycle, Outcome, sleep_or_cancel};
use crate::error::{Error, Result};
use crate::interface::NetworkInterface;
use crate::link::RawLinkSocket;
use crate::mac::MacAddr;
use crate::metrics::Observer;
use crate::options::{MessageType, parse_options};
use crate::packet::{DhcpPacket, EthernetFrame};

/// Anything a finished frame can be written to.
pub trait FrameSink {
    fn send_frame(&self, frame: &[u8]) -> Result<()>;
}

impl FrameSink for RawLinkSocket {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.send(frame)
    }
}

pub struct DhcpClient {
    interface: NetworkInterface,
    packet: DhcpPacket,
    frame: Vec<u8>,
    renew: Duration,
    observer: Arc<dyn Observer>,
}

impl DhcpClient {
    /// Builds the request frame.
    ///
    /// The Ethernet source is the configured `srcmac`, else the interface
    /// MAC, else the device MAC. Options JSON that does not parse is a fatal
    /// configuration error.
    pub fn new(
        settings: &DhcpSettings,
        device: &DeviceIdentity,
        interface: NetworkInterface,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        let options = parse_options(&settings.options)
            .map_err(|error| Error::Config(format!("invalid DHCP options: {}", error)))?;

        let xid = rand::random::<u32>();
        let source_mac: MacAddr = settings.src_mac.or(interface.mac).unwrap_or(device.mac);

        let packet = DhcpPacket::request(
            MessageType::Request,
            device.mac,
            settings.giaddr,
            settings.ciaddr,
            xid,
            settings.broadcast(),
            options,
        );
        let frame =
            EthernetFrame::dhcp(settings.dst_mac, source_mac, settings.server, &packet).encode();

        info!(
            "DHCP request prepared - xid: {:#010x}, chaddr: {}, src: {}, dst: {}, {} options",
            xid,
            device.mac,
            source_mac,
            settings.dst_mac,
            packet.options.len() - 1
        );

        Ok(Self {
            interface,
            packet,
            frame,
            renew: settings.renew,
            observer,
        })
    }

    pub fn xid(&self) -> u32 {
        self.packet.xid
    }

    pub fn packet(&self) -> &DhcpPacket {
        &self.packet
    }

    /// The complete link-layer frame sent on every renewal.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Opens the raw socket and runs the renewal loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let socket = RawLinkSocket::open(&self.interface)?;
        info!(
            "DHCP client started on {} - renew every {:?}",
            socket.interface(),
            self.renew
        );
        self.run_with(&socket, cancel).await
    }

    /// Renewal loop over any sink. Returns the first send error.
    pub async fn run_with<S: FrameSink>(&self, sink: &S, cancel: CancellationToken) -> Result<()> {
        let mut cycle = Cycle::fixed(self.renew);

        while !cancel.is_cancelled() {
            cycle.begin();
            if let Err(err) = sink.send_frame(&self.frame) {
                self.observer.error();
                error!("DHCP send failed: {}", err);
                return Err(err);
            }
            cycle.sent();
            self.observer.dhcp_request_sent();
            debug!("DHCP request {:#010x} sent", self.packet.xid);

            let delay = cycle.finish(Outcome::Completed);
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
            cycle.wake();
        }

        info!("DHCP client stopped after {} requests", cycle.iterations());
        Ok(())
    }
}
