//! UPnP/SSDP discovery client.
//!
//! Every interval the device multicasts one `M-SEARCH` for its configured
//! device type and listens for answers until the listen window closes.
//! Answers are counted and discarded; the point is the traffic itself.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UpnpSettings;
use crate::cycle::{Cycle, Outcome, sleep_or_cancel};
use crate::error::Result;
use crate::interface::NetworkInterface;
use crate::metrics::Observer;

const RECV_BUFFER_SIZE: usize = 65536;

/// Builds an SSDP search request. Lines end in CRLF and a blank line
/// terminates the message.
pub fn search_request(host: SocketAddrV4, st: &str, mx: u64, user_agent: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         ST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         USER-AGENT: {}\r\n\
         \r\n",
        host, st, mx, user_agent
    )
}

pub struct UpnpDiscovery {
    settings: UpnpSettings,
    interface: NetworkInterface,
    target: SocketAddrV4,
    observer: Arc<dyn Observer>,
}

impl UpnpDiscovery {
    pub fn new(
        settings: UpnpSettings,
        interface: NetworkInterface,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            target: SocketAddrV4::new(settings.group, settings.port),
            settings,
            interface,
            observer,
        }
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    /// Ephemeral UDP socket that has joined the search group on the
    /// configured interface. Unicast targets skip the join.
    fn open_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;

        let group = *self.target.ip();
        if group.is_multicast() {
            let local = self.interface.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&group, &local)?;
            socket.set_multicast_if_v4(&local)?;
        }

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Sends one search and reads answers until `listen` elapses.
    ///
    /// Returns how many answers arrived. Running out of time is the normal
    /// end of a discovery.
    pub async fn discover(&self, listen: Duration) -> Result<usize> {
        let search = self.search(listen).await?;
        Ok(self.collect(search).await)
    }

    async fn search(&self, listen: Duration) -> Result<Search> {
        let request = search_request(
            self.target,
            &self.settings.device_type,
            listen.as_secs(),
            &self.settings.user_agent,
        );

        info!(
            "Starting discovery of device type {} on {}",
            self.settings.device_type, self.interface.name
        );
        let socket = self.open_socket()?;
        let deadline = Instant::now() + listen;

        socket.send_to(request.as_bytes(), self.target).await?;
        debug!("M-SEARCH sent to {}", self.target);
        Ok(Search { socket, deadline })
    }

    async fn collect(&self, search: Search) -> usize {
        let mut responses = 0;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match timeout_at(search.deadline, search.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    responses += 1;
                    debug!("UPnP response from {} ({} bytes)", from, len);
                }
                Ok(Err(error)) => {
                    warn!("UPnP read: {}", error);
                    break;
                }
                Err(_) => break,
            }
        }

        self.observer.upnp_discovery_done();
        info!(
            "Discovery for device type {} on {} finished - {} responses",
            self.settings.device_type, self.interface.name, responses
        );
        responses
    }

    /// Discovers every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "UPnP discovery started - target: {}, every {:?}",
            self.target, self.settings.interval
        );

        let mut cycle = Cycle::fixed(self.settings.interval);
        while !cancel.is_cancelled() {
            cycle.begin();
            let outcome = match self.search(self.settings.listen).await {
                Ok(search) => {
                    cycle.sent();
                    tokio::select! {
                        _ = self.collect(search) => Outcome::Completed,
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(error) => {
                    self.observer.error();
                    warn!("UPnP discovery failed: {}", error);
                    Outcome::Failed
                }
            };

            let delay = cycle.finish(outcome);
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
            cycle.wake();
        }

        info!("UPnP discovery stopped after {} searches", cycle.iterations());
        Ok(())
    }
}

/// A search on the wire and the socket its answers arrive on.
struct Search {
    socket: UdpSocket,
    deadline: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::metrics::Metrics;

    fn loopback() -> NetworkInterface {
        NetworkInterface {
            name: "lo".to_string(),
            index: 1,
            mac: None,
            ipv4: Some(Ipv4Addr::LOCALHOST),
        }
    }

    #[test]
    fn test_search_request_text() {
        let request = search_request(
            SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900),
            "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
            10,
            "siemens ag simatic s7",
        );
        assert_eq!(
            request,
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 10\r\n\
             USER-AGENT: siemens ag simatic s7\r\n\
             \r\n"
        );
        assert!(!request.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn test_default_target() {
        let settings = UpnpSettings::from_store(&ConfigStore::parse("").unwrap());
        let discovery = UpnpDiscovery::new(settings, loopback(), Arc::new(Metrics::new()));
        assert_eq!(
            discovery.target(),
            SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900)
        );
    }

    #[tokio::test]
    async fn test_discover_counts_responses_until_deadline() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, peer) = responder.recv_from(&mut buf).await.unwrap();
            assert!(buf[..len].starts_with(b"M-SEARCH * HTTP/1.1\r\n"));
            for _ in 0..2 {
                responder
                    .send_to(b"HTTP/1.1 200 OK\r\n\r\n", peer)
                    .await
                    .unwrap();
            }
        });

        let store = ConfigStore::parse(&format!(
            "[upnp]\nenabled = true\nipaddr = 127.0.0.1\nudpport = {}\n",
            port
        ))
        .unwrap();
        let metrics = Arc::new(Metrics::new());
        let discovery = UpnpDiscovery::new(
            UpnpSettings::from_store(&store),
            loopback(),
            metrics.clone(),
        );

        let responses = discovery
            .discover(Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(responses, 2);
        assert_eq!(metrics.snapshot().upnp_discoveries, 1);
    }

    #[tokio::test]
    async fn test_run_repeats_search_until_cancelled() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();
        let store = ConfigStore::parse(&format!(
            "[upnp]\nenabled = true\nipaddr = 127.0.0.1\nudpport = {}\n",
            port
        ))
        .unwrap();
        let mut settings = UpnpSettings::from_store(&store);
        settings.listen = Duration::from_millis(50);
        settings.interval = Duration::from_millis(20);
        let metrics = Arc::new(Metrics::new());
        let discovery = UpnpDiscovery::new(settings, loopback(), metrics.clone());
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { discovery.run(cancel).await })
        };

        let mut buf = [0u8; 2048];
        for _ in 0..2 {
            let (len, peer) = tokio::time::timeout(Duration::from_secs(2), responder.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(buf[..len].starts_with(b"M-SEARCH"));
            responder.send_to(b"HTTP/1.1 200 OK\r\n\r\n", peer).await.unwrap();
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(metrics.snapshot().upnp_discoveries >= 1);
        assert_eq!(metrics.snapshot().errors, 0);
    }
}
