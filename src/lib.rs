//! # devsim
//!
//! A network endpoint simulator for exercising access-control and telemetry
//! infrastructure. One process plays a single device on the wire.
//!
//! ## Features
//!
//! - DHCP REQUEST renewals sent as raw Ethernet frames (RFC 2131, RFC 2132),
//!   with spoofable source MAC and relay agent address
//! - RADIUS MAC authentication (RFC 2865) and accounting (RFC 2866)
//! - UPnP/SSDP `M-SEARCH` discovery
//! - IPFIX flow export with a fixed 23-field template (RFC 7011)
//! - Shared token-bucket rate limiting and pooled RADIUS clients
//! - Async/await with Tokio, one supervised task per protocol
//!
//! ## Quick Start
//!
//! ```no_run
//! use devsim::{ConfigStore, Context, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> devsim::Result<()> {
//!     let store = ConfigStore::load("/usr/local/etc/config.ini")?;
//!     let mut supervisor = Supervisor::start(Context::new(store))?;
//!     let result = supervisor.run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await;
//!     supervisor.shutdown().await;
//!     result
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`ConfigStore`] / [`Settings`] - INI configuration and resolved settings
//! - [`Context`] - Shared components handed to every task
//! - [`Supervisor`] - Starts enabled protocols and propagates fatal errors
//! - [`DhcpClient`] - Raw-socket DHCP renewal loop
//! - [`radius`] - RADIUS wire format, client, authentication and accounting
//! - [`UpnpDiscovery`] - SSDP search client
//! - [`IpfixExporter`] - IPFIX encoder and UDP exporter

pub mod config;
pub mod context;
pub mod cycle;
pub mod dhcp;
pub mod error;
pub mod interface;
pub mod ipfix;
pub mod link;
pub mod mac;
pub mod metrics;
pub mod options;
pub mod packet;
pub mod pool;
pub mod radius;
pub mod rate_limit;
pub mod supervisor;
pub mod upnp;

pub use config::{ConfigStore, Settings};
pub use context::Context;
pub use dhcp::DhcpClient;
pub use error::{Error, Result};
pub use ipfix::{IpfixEncoder, IpfixExporter, TrafficRecord};
pub use mac::MacAddr;
pub use metrics::{Metrics, Observer};
pub use options::{DhcpOption, MessageType, OptionValue};
pub use packet::{DhcpPacket, EthernetFrame};
pub use supervisor::{Service, Supervisor};
pub use upnp::UpnpDiscovery;
