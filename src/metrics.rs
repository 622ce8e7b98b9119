//! Runtime counters.
//!
//! Protocol loops report what they did through the [`Observer`] trait and
//! never read anything back. [`Metrics`] is the in-process implementation
//! backed by atomics; [`report_periodically`] logs a snapshot on a timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Passive sink for protocol events.
pub trait Observer: Send + Sync {
    fn dhcp_request_sent(&self);
    fn radius_request_sent(&self);
    fn ipfix_packet_sent(&self);
    fn upnp_discovery_done(&self);
    fn error(&self);
}

#[derive(Debug)]
pub struct Metrics {
    dhcp_requests: AtomicU64,
    radius_requests: AtomicU64,
    ipfix_packets: AtomicU64,
    upnp_discoveries: AtomicU64,
    errors: AtomicU64,
    started: Instant,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub dhcp_requests: u64,
    pub radius_requests: u64,
    pub ipfix_packets: u64,
    pub upnp_discoveries: u64,
    pub errors: u64,
    pub uptime_seconds: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            dhcp_requests: AtomicU64::new(0),
            radius_requests: AtomicU64::new(0),
            ipfix_packets: AtomicU64::new(0),
            upnp_discoveries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            dhcp_requests: self.dhcp_requests.load(Ordering::Relaxed),
            radius_requests: self.radius_requests.load(Ordering::Relaxed),
            ipfix_packets: self.ipfix_packets.load(Ordering::Relaxed),
            upnp_discoveries: self.upnp_discoveries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_seconds: self.uptime().as_secs(),
        }
    }

    pub fn log_stats(&self) {
        let snapshot = self.snapshot();
        info!(
            uptime_seconds = snapshot.uptime_seconds,
            dhcp_requests = snapshot.dhcp_requests,
            radius_requests = snapshot.radius_requests,
            ipfix_packets = snapshot.ipfix_packets,
            upnp_discoveries = snapshot.upnp_discoveries,
            errors = snapshot.errors,
            "Simulator statistics"
        );
    }
}

impl Observer for Metrics {
    fn dhcp_request_sent(&self) {
        self.dhcp_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn radius_request_sent(&self) {
        self.radius_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn ipfix_packet_sent(&self) {
        self.ipfix_packets.fetch_add(1, Ordering::Relaxed);
    }

    fn upnp_discovery_done(&self) {
        self.upnp_discoveries.fetch_add(1, Ordering::Relaxed);
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Logs the counters every `interval` until cancelled. A zero interval
/// returns immediately.
pub async fn report_periodically(
    metrics: Arc<Metrics>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => metrics.log_stats(),
            _ = cancel.cancelled() => {
                debug!("Statistics reporter stopped");
                return;
            }
        }
    }
}
