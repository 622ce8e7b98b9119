//! Periodic RADIUS Accounting-Request loop (RFC 2866).
//!
//! The session opens with Acct-Status-Type Start and continues with
//! Interim-Update records carrying the elapsed session time. Start is
//! repeated until a server acknowledges it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::RadiusClient;
use super::packet::{AcctStatusType, Attribute, AttributeType, Code, Packet};
use super::{log_attributes, nas_attributes, push_string, request_went_out, server_address};
use crate::config::{DeviceIdentity, RadiusSettings};
use crate::cycle::{Cycle, Outcome, sleep_or_cancel};
use crate::error::{Error, Result};
use crate::metrics::Observer;
use crate::pool::ClientPool;

pub struct Accountant {
    settings: RadiusSettings,
    device: DeviceIdentity,
    server: SocketAddr,
    session_id: String,
    started: Instant,
    pool: Arc<ClientPool<RadiusClient>>,
    observer: Arc<dyn Observer>,
}

impl Accountant {
    /// Uses the configured Acct-Session-Id, or a random 8-digit hex one.
    pub fn new(
        settings: RadiusSettings,
        device: DeviceIdentity,
        pool: Arc<ClientPool<RadiusClient>>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let session_id = if settings.acct_session_id.is_empty() {
            format!("{:08X}", rand::random::<u32>())
        } else {
            settings.acct_session_id.clone()
        };

        Self {
            server: server_address(&settings),
            settings,
            device,
            session_id,
            started: Instant::now(),
            pool,
            observer,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Builds an Accounting-Request. The authenticator is filled in when
    /// the request is encoded.
    pub fn accounting_request(&self, status: AcctStatusType) -> Packet {
        let mut attributes = vec![Attribute::integer(
            AttributeType::AcctStatusType,
            status as u32,
        )];
        push_string(&mut attributes, AttributeType::AcctSessionId, &self.session_id);
        push_string(
            &mut attributes,
            AttributeType::UserName,
            &self.device.mac.to_string(),
        );
        attributes.extend(nas_attributes(&self.settings, &self.device));

        if status != AcctStatusType::Start {
            let elapsed = u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX);
            attributes.push(Attribute::integer(AttributeType::AcctSessionTime, elapsed));
        }
        let timestamp = u32::try_from(Utc::now().timestamp()).unwrap_or(0);
        attributes.push(Attribute::integer(AttributeType::EventTimestamp, timestamp));

        let mut packet = Packet::new(Code::AccountingRequest, 0, [0u8; 16]);
        for attribute in attributes {
            packet.add_attribute(attribute);
        }
        packet
    }

    /// Sends one record and waits for the Accounting-Response.
    pub async fn account_once(&self, status: AcctStatusType) -> Result<()> {
        let mut client = self.pool.get();
        let request = self.accounting_request(status);
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

        info!(
            "Accounting {:?} acknowledged for session {}",
            status, self.session_id
        );
        log_attributes(&response);
        Ok(())
    }

    /// Sends Start, then Interim-Update every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "RADIUS accounting started - server: {}, session: {}",
            self.server, self.session_id
        );

        let mut status = AcctStatusType::Start;
        let mut cycle = Cycle::new(self.settings.interval, self.settings.backoff);
        while !cancel.is_cancelled() {
            cycle.begin();
            let result = tokio::select! {
                result = self.account_once(status) => result,
                _ = cancel.cancelled() => break,
            };

            if request_went_out(&result) {
                cycle.sent();
            }
            let outcome = match result {
                Ok(()) => {
                    status = AcctStatusType::InterimUpdate;
                    Outcome::Completed
                }
                Err(Error::Timeout(server)) => {
                    warn!("No accounting response from {}", server);
                    Outcome::TimedOut
                }
                Err(error) => {
                    warn!("Error sending accounting request: {}", error);
                    Outcome::Failed
                }
            };
            debug!("Next accounting record: {:?}", status);

            let delay = cycle.finish(outcome);
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
            cycle.wake();
        }

        info!(
            "RADIUS accounting stopped after {} records",
            cycle.iterations()
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
    use crate::radius::packet::{HEADER_LENGTH, md5_of, response_authenticator};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    const SECRET: &str = "acctsecret";

    fn accountant(server: SocketAddr, extra: &str) -> Accountant {
        let ini = format!(
            "[accounting]\nenabled = true\nserver = {}\nport = {}\nsecret = {}\n{}",
            server.ip(),
            server.port(),
            SECRET,
            extra
        );
        let settings = RadiusSettings::accounting(&ConfigStore::parse(&ini).unwrap());
        let device = DeviceIdentity {
            interface: "eth0".to_string(),
            mac: MacAddr::DEFAULT_CLIENT,
            ip: Ipv4Addr::new(10, 0, 0, 50),
        };
        Accountant::new(
            settings,
            device,
            Arc::new(ClientPool::new(1)),
            Arc::new(Metrics::new()),
        )
    }

    fn status_of(packet: &Packet) -> u32 {
        let value = &packet.attribute(AttributeType::AcctStatusType as u8).unwrap().value;
        u32::from_be_bytes([value[0], value[1], value[2], value[3]])
    }

    /// Acknowledges every request after checking its authenticator and
    /// records the Acct-Status-Type values seen.
    async fn accounting_server(code: Code) -> (SocketAddr, Arc<Mutex<Vec<u32>>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let data = &buf[..len];
                let mut zeroed = data.to_vec();
                zeroed[4..HEADER_LENGTH].fill(0);
                let expected = md5_of(&[zeroed.as_slice(), SECRET.as_bytes()]);
                assert_eq!(&data[4..HEADER_LENGTH], expected.as_slice());

                let request = Packet::decode(data).unwrap();
                record.lock().unwrap().push(status_of(&request));

                let response = Packet::new(code, request.identifier, request.authenticator);
                let mut bytes = response.encode().unwrap();
                let signed =
                    response_authenticator(&bytes, &request.authenticator, SECRET.as_bytes())
                        .unwrap();
                bytes[4..20].copy_from_slice(&signed);
                let _ = socket.send_to(&bytes, peer).await;
            }
        });

        (addr, seen)
    }

    #[test]
    fn test_start_record_attributes() {
        let server: SocketAddr = "10.0.0.2:1813".parse().unwrap();
        let accountant = accountant(server, "Acct-Session-Id = sess-1\nNAS-Identifier = sim\n");
        let packet = accountant.accounting_request(AcctStatusType::Start);

        assert_eq!(packet.code, Code::AccountingRequest);
        let kinds: Vec<u8> = packet.attributes.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![40, 44, 1, 31, 61, 5, 32, 55]);
        assert_eq!(status_of(&packet), 1);
        assert_eq!(
            packet.attribute(AttributeType::AcctSessionId as u8).unwrap().value,
            b"sess-1"
        );
    }

    #[test]
    fn test_interim_update_carries_session_time() {
        let server: SocketAddr = "10.0.0.2:1813".parse().unwrap();
        let accountant = accountant(server, "");
        let packet = accountant.accounting_request(AcctStatusType::InterimUpdate);
        assert_eq!(status_of(&packet), 3);
        assert!(packet.attribute(AttributeType::AcctSessionTime as u8).is_some());
    }

    #[test]
    fn test_generated_session_id() {
        let server: SocketAddr = "10.0.0.2:1813".parse().unwrap();
        let accountant = accountant(server, "");
        assert_eq!(accountant.session_id().len(), 8);
        assert!(
            accountant
                .session_id()
                .chars()
                .all(|c| c.is_ascii_hexdigit())
        );
    }

    #[tokio::test]
    async fn test_account_once_acknowledged() {
        let (server, seen) = accounting_server(Code::AccountingResponse).await;
        let accountant = accountant(server, "");
        accountant.account_once(AcctStatusType::Start).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_wrong_response_code_is_error() {
        let (server, _) = accounting_server(Code::AccessAccept).await;
        let accountant = accountant(server, "");
        accountant
            .pool
            .put(RadiusClient::new(1, Duration::from_millis(100), 0));

        let error = accountant
            .account_once(AcctStatusType::Start)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Radius { .. }));
        assert_eq!(accountant.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_client_returned_to_pool_after_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let accountant = accountant(silent.local_addr().unwrap(), "");
        accountant
            .pool
            .put(RadiusClient::new(1, Duration::from_millis(100), 0));

        let error = accountant
            .account_once(AcctStatusType::Start)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Timeout(_)));
        assert_eq!(accountant.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_run_retries_start_after_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut accountant = accountant(silent.local_addr().unwrap(), "");
        accountant.settings.interval = Duration::from_millis(20);
        accountant
            .pool
            .put(RadiusClient::new(1, Duration::from_millis(50), 0));
        let accountant = Arc::new(accountant);
        let cancel = CancellationToken::new();

        let task = {
            let accountant = Arc::clone(&accountant);
            let cancel = cancel.clone();
            tokio::spawn(async move { accountant.run(cancel).await })
        };

        let mut buf = [0u8; 4096];
        for _ in 0..2 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), silent.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(status_of(&Packet::decode(&buf[..len]).unwrap()), 1);
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(accountant.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_run_sends_start_then_interim() {
        let (server, seen) = accounting_server(Code::AccountingResponse).await;
        let mut accountant = accountant(server, "");
        accountant.settings.interval = Duration::from_millis(50);
        let accountant = Arc::new(accountant);
        let cancel = CancellationToken::new();

        let task = {
            let accountant = Arc::clone(&accountant);
            let cancel = cancel.clone();
            tokio::spawn(async move { accountant.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 2);
        assert_eq!(seen[0], 1);
        assert!(seen[1..].iter().all(|status| *status == 3));
    }
}
