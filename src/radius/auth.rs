//! Periodic RADIUS Access-Request loop.
//!
//! The device authenticates with its MAC as both User-Name and
//! User-Password (MAC authentication bypass). Every outcome, including a
//! timeout, is logged and retried; nothing here stops the process.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::RadiusClient;
use super::packet::{
    Attribute, AttributeType, Code, Packet, encrypt_user_password,
    generate_request_authenticator,
};
use super::{log_attributes, nas_attributes, push_string, request_went_out, server_address};
use crate::config::{DeviceIdentity, RadiusSettings};
use crate::cycle::{Cycle, Outcome, sleep_or_cancel};
use crate::error::{Error, Result};
use crate::metrics::Observer;
use crate::pool::ClientPool;

pub struct Authenticator {
    settings: RadiusSettings,
    device: DeviceIdentity,
    server: SocketAddr,
    pool: Arc<ClientPool<RadiusClient>>,
    observer: Arc<dyn Observer>,
}

impl Authenticator {
    pub fn new(
        settings: RadiusSettings,
        device: DeviceIdentity,
        pool: Arc<ClientPool<RadiusClient>>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            server: server_address(&settings),
            settings,
            device,
            pool,
            observer,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Builds a fresh Access-Request with a new Request Authenticator.
    ///
    /// The identifier is left at zero; the exchanging client assigns it.
    pub fn access_request(&self) -> Packet {
        let authenticator = generate_request_authenticator();
        let mac = self.device.mac.to_string();

        let mut packet = Packet::new(Code::AccessRequest, 0, authenticator);
        let mut attributes = Vec::new();
        push_string(&mut attributes, AttributeType::UserName, &mac);
        attributes.push(Attribute {
            kind: AttributeType::UserPassword as u8,
            value: encrypt_user_password(
                mac.as_bytes(),
                self.settings.secret.as_bytes(),
                &authenticator,
            ),
        });
        attributes.extend(nas_attributes(&self.settings, &self.device));

        for attribute in attributes {
            packet.add_attribute(attribute);
        }
        packet
    }

    /// Runs one exchange and logs the result.
    ///
    /// Accept, Reject and Challenge are all answers and return `Ok`.
    pub async fn authenticate_once(&self) -> Result<Code> {
        let mut client = self.pool.get();
        let request = self.access_request();
        self.observer.radius_request_sent();

        let result = client
            .exchange(request, self.settings.secret.as_bytes(), self.server)
            .await;
        self.pool.put(client);

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                self.observer.error();
                return Err(error);
            }
        };

        match response.code {
            Code::AccessAccept => info!("Authentication successful for {}", self.device.mac),
            Code::AccessReject => warn!("Authentication rejected for {}", self.device.mac),
            other => warn!("Unexpected RADIUS response code: {}", other),
        }
        log_attributes(&response);

        Ok(response.code)
    }

    /// Authenticates every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "RADIUS authentication started - server: {}, user: {}",
            self.server, self.device.mac
        );

        let mut cycle = Cycle::new(self.settings.interval, self.settings.backoff);
        while !cancel.is_cancelled() {
            cycle.begin();
            let result = tokio::select! {
                result = self.authenticate_once() => result,
                _ = cancel.cancelled() => break,
            };

            if request_went_out(&result) {
                cycle.sent();
            }
            let outcome = match result {
                Ok(_) => Outcome::Completed,
                Err(Error::Timeout(server)) => {
                    warn!("No response from RADIUS server {}", server);
                    Outcome::TimedOut
                }
                Err(error) => {
                    warn!("Error sending RADIUS request: {}", error);
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
            "RADIUS authentication stopped after {} requests ({} timeouts, {} failures)",
            cycle.iterations(),
            cycle.timeouts(),
            cycle.failures()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::mac::MacAddr;
    use crate::metrics::Metrics;
    use crate::radius::packet::response_authenticator;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    const SECRET: &str = "testing123";

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            interface: "eth0".to_string(),
            mac: MacAddr::DEFAULT_CLIENT,
            ip: Ipv4Addr::new(10, 0, 0, 50),
        }
    }

    fn settings(server: SocketAddr, extra: &str) -> RadiusSettings {
        let ini = format!(
            "[authentication]\nenabled = true\nserver = {}\nport = {}\nsecret = {}\n{}",
            server.ip(),
            server.port(),
            SECRET,
            extra
        );
        RadiusSettings::authentication(&ConfigStore::parse(&ini).unwrap())
    }

    fn authenticator(server: SocketAddr, extra: &str, metrics: Arc<Metrics>) -> Authenticator {
        Authenticator::new(
            settings(server, extra),
            device(),
            Arc::new(ClientPool::new(2)),
            metrics,
        )
    }

    /// Answers every request with `code`, signed with `SECRET`.
    async fn radius_server(code: Code) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let request = Packet::decode(&buf[..len]).unwrap();
                let mut response = Packet::new(code, request.identifier, request.authenticator);
                response.add_attribute(Attribute::integer(AttributeType::NasPort, 1));
                let mut bytes = response.encode().unwrap();
                let signed =
                    response_authenticator(&bytes, &request.authenticator, SECRET.as_bytes())
                        .unwrap();
                bytes[4..20].copy_from_slice(&signed);
                let _ = socket.send_to(&bytes, peer).await;
            }
        });
        addr
    }

    #[test]
    fn test_access_request_attributes() {
        let server: SocketAddr = "10.0.0.2:1812".parse().unwrap();
        let auth = authenticator(
            server,
            "NAS-IP-Address = 10.0.0.3\nNAS-Port = 9\nNAS-Identifier = sim\n",
            Arc::new(Metrics::new()),
        );
        let packet = auth.access_request();

        assert_eq!(packet.code, Code::AccessRequest);
        let kinds: Vec<u8> = packet.attributes.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![1, 2, 4, 31, 61, 5, 32]);

        assert_eq!(packet.attributes[0].value, b"de:ad:be:ef:de:ad");
        assert_eq!(packet.attributes[1].value.len(), 32);
        assert_eq!(
            packet.attributes[1].value,
            encrypt_user_password(
                b"de:ad:be:ef:de:ad",
                SECRET.as_bytes(),
                &packet.authenticator
            )
        );
        assert_eq!(packet.attributes[2].value, vec![10, 0, 0, 3]);
        assert_eq!(packet.attributes[5].value, vec![0, 0, 0, 9]);
    }

    #[test]
    fn test_fresh_authenticator_each_request() {
        let server: SocketAddr = "10.0.0.2:1812".parse().unwrap();
        let auth = authenticator(server, "", Arc::new(Metrics::new()));
        let first = auth.access_request();
        let second = auth.access_request();
        assert_ne!(first.authenticator, second.authenticator);
        assert_ne!(first.attributes[1].value, second.attributes[1].value);
    }

    #[tokio::test]
    async fn test_authenticate_accept_returns_client_to_pool() {
        let server = radius_server(Code::AccessAccept).await;
        let metrics = Arc::new(Metrics::new());
        let auth = authenticator(server, "", metrics.clone());

        assert_eq!(auth.authenticate_once().await.unwrap(), Code::AccessAccept);
        assert_eq!(auth.pool.len(), 1);
        assert_eq!(auth.authenticate_once().await.unwrap(), Code::AccessAccept);
        assert_eq!(auth.pool.len(), 1);
        assert_eq!(metrics.snapshot().radius_requests, 2);
        assert_eq!(metrics.snapshot().errors, 0);
    }

    #[tokio::test]
    async fn test_reject_is_not_an_error() {
        let server = radius_server(Code::AccessReject).await;
        let auth = authenticator(server, "", Arc::new(Metrics::new()));
        assert_eq!(auth.authenticate_once().await.unwrap(), Code::AccessReject);
    }

    #[tokio::test]
    async fn test_client_returned_to_pool_after_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let auth = authenticator(silent.local_addr().unwrap(), "", metrics.clone());
        auth.pool.put(RadiusClient::new(1, Duration::from_millis(100), 0));

        let error = auth.authenticate_once().await.unwrap_err();
        assert!(matches!(error, Error::Timeout(_)));
        assert_eq!(auth.pool.len(), 1);
        assert_eq!(metrics.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_run_keeps_going_after_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let auth = Arc::new(authenticator(silent.local_addr().unwrap(), "", metrics.clone()));
        auth.pool.put(RadiusClient::new(1, Duration::from_millis(50), 0));
        let cancel = CancellationToken::new();

        let task = {
            let auth = Arc::clone(&auth);
            let cancel = cancel.clone();
            tokio::spawn(async move { auth.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(metrics.snapshot().errors, 1);
        assert_eq!(auth.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let server = radius_server(Code::AccessAccept).await;
        let metrics = Arc::new(Metrics::new());
        let auth = Arc::new(authenticator(server, "", metrics.clone()));
        let cancel = CancellationToken::new();

        let task = {
            let auth = Arc::clone(&auth);
            let cancel = cancel.clone();
            tokio::spawn(async move { auth.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(metrics.snapshot().radius_requests, 1);
    }
}
