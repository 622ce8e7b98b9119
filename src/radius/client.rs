//! Retried RADIUS request/response exchange over UDP.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use super::packet::{Code, HEADER_LENGTH, MAX_PACKET_LENGTH, Packet, verify_response};
use crate::error::{Error, Result};

pub const DEFAULT_RETRY: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_PACKET_ERRORS: u32 = 2;

/// A reusable RADIUS client.
///
/// The UDP socket is bound on first use and kept for later exchanges, so
/// pooled clients avoid re-binding. Each exchange takes the next packet
/// identifier.
#[derive(Debug)]
pub struct RadiusClient {
    socket: Option<UdpSocket>,
    next_identifier: u8,
    /// Number of sends per exchange.
    pub retry: u32,
    /// How long each send waits for an answer.
    pub timeout: Duration,
    /// Malformed or unauthenticated responses tolerated per exchange.
    pub max_packet_errors: u32,
}

impl Default for RadiusClient {
    fn default() -> Self {
        Self {
            socket: None,
            next_identifier: rand::random(),
            retry: DEFAULT_RETRY,
            timeout: DEFAULT_TIMEOUT,
            max_packet_errors: DEFAULT_MAX_PACKET_ERRORS,
        }
    }
}

impl RadiusClient {
    pub fn new(retry: u32, timeout: Duration, max_packet_errors: u32) -> Self {
        Self {
            retry,
            timeout,
            max_packet_errors,
            ..Self::default()
        }
    }

    async fn socket(&mut self) -> Result<&UdpSocket> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
                UdpSocket::bind(local).await?
            }
        };
        Ok(self.socket.insert(socket))
    }

    /// Sends `request` to `server` and waits for the matching response.
    ///
    /// The request is re-sent up to `retry` times, each send waiting
    /// `timeout`. Responses from other addresses or with another identifier
    /// are ignored. Responses that fail to decode or authenticate count as
    /// packet errors; more than `max_packet_errors` of them abort the
    /// exchange.
    pub async fn exchange(
        &mut self,
        mut request: Packet,
        secret: &[u8],
        server: SocketAddr,
    ) -> Result<Packet> {
        request.identifier = self.next_identifier;
        self.next_identifier = self.next_identifier.wrapping_add(1);

        let wire = request.encode_request(secret)?;
        let request_authenticator = request.authenticator;
        let identifier = request.identifier;
        let attempts = self.retry.max(1);
        let per_try = self.timeout;
        let max_packet_errors = self.max_packet_errors;

        let socket = self.socket().await?;
        let mut packet_errors = 0;
        let mut buf = vec![0u8; MAX_PACKET_LENGTH];

        for attempt in 1..=attempts {
            socket.send_to(&wire, server).await?;
            debug!(
                "{} {} sent to {} (attempt {}/{})",
                request.code, identifier, server, attempt, attempts
            );

            let deadline = Instant::now() + per_try;
            loop {
                let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => break,
                };

                if from != server {
                    debug!("Ignoring RADIUS datagram from unexpected peer {}", from);
                    continue;
                }
                let data = &buf[..len];
                if len >= HEADER_LENGTH && data[1] != identifier {
                    debug!("Ignoring RADIUS response with identifier {}", data[1]);
                    continue;
                }

                let verdict = if !verify_response(data, &request_authenticator, secret) {
                    Err(Error::InvalidPacket(
                        "response authenticator mismatch".to_string(),
                    ))
                } else {
                    Packet::decode(data)
                };

                match verdict {
                    Ok(response) if is_response_to(request.code, response.code) => {
                        return Ok(response);
                    }
                    Ok(response) => {
                        packet_errors += 1;
                        warn!(
                            "Unexpected {} in reply to {} from {}",
                            response.code, request.code, server
                        );
                    }
                    Err(error) => {
                        packet_errors += 1;
                        warn!("Bad RADIUS response from {}: {}", server, error);
                    }
                }

                if packet_errors > max_packet_errors {
                    return Err(Error::Radius {
                        server,
                        reason: format!("{} invalid responses", packet_errors),
                    });
                }
            }
        }

        Err(Error::Timeout(server))
    }
}

fn is_response_to(request: Code, response: Code) -> bool {
    match request {
        Code::AccessRequest => matches!(
            response,
            Code::AccessAccept | Code::AccessReject | Code::AccessChallenge
        ),
        Code::AccountingRequest => response == Code::AccountingResponse,
        _ => false,
    }
}
