//! Configuration loading and typed access.
//!
//! The simulator reads a single INI file. [`ConfigStore`] owns the parsed
//! file behind a read/write lock and exposes typed getters that never fail:
//! missing keys silently yield the default, invalid or out-of-range values
//! log a warning and yield the default. Only an unreadable file is fatal.
//!
//! The per-protocol `*Settings` structs are resolved once at startup from
//! the store and handed to the protocol loops.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use ini::{Ini, ParseOption};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::mac::MacAddr;

pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/config.ini";

const DEFAULT_RENEW_SECS: u64 = 30;
const DEFAULT_SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const DEFAULT_SSDP_PORT: i64 = 1900;
const DEFAULT_USER_AGENT: &str = "siemens ag simatic s7";
const DEFAULT_DEVICE_TYPE: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";
const DEFAULT_IPFIX_PORT: i64 = 4739;
const DEFAULT_RADIUS_AUTH_PORT: i64 = 1812;
const DEFAULT_RADIUS_ACCT_PORT: i64 = 1813;
const DEFAULT_RADIUS_SECRET: &str = "secret";
const DEFAULT_RATE_LIMIT: i64 = 100;
const DEFAULT_POOL_SIZE: i64 = 4;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 300;

const UPNP_INTERVAL: Duration = Duration::from_secs(30);
const UPNP_LISTEN_WINDOW: Duration = Duration::from_secs(10);
const IPFIX_INTERVAL: Duration = Duration::from_secs(10);
const RADIUS_INTERVAL: Duration = Duration::from_secs(30);
const RADIUS_BACKOFF: Duration = Duration::from_secs(30);

/// Values carry raw JSON, so quotes and backslashes must survive untouched.
fn parse_option() -> ParseOption {
    ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    }
}

/// Thread-safe, reloadable view of the INI configuration file.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    ini: RwLock<Ini>,
}

impl ConfigStore {
    /// Loads the configuration file. A missing or unparsable file is fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!(
                "configuration file does not exist: {}",
                path.display()
            )));
        }

        let ini = Ini::load_from_file_opt(path, parse_option())?;
        info!("Configuration loaded from {}", path.display());

        Ok(Self {
            path: Some(path.to_path_buf()),
            ini: RwLock::new(ini),
        })
    }

    /// Builds a store from in-memory INI text.
    pub fn parse(content: &str) -> Result<Self> {
        let ini = Ini::load_from_str_opt(content, parse_option())
            .map_err(|error| Error::Config(format!("cannot parse configuration: {}", error)))?;

        Ok(Self {
            path: None,
            ini: RwLock::new(ini),
        })
    }

    /// Re-reads the backing file, replacing the current contents atomically.
    ///
    /// Stores built with [`parse`](Self::parse) have no backing file and
    /// keep their contents.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let fresh = Ini::load_from_file_opt(path, parse_option())?;
        *self.ini.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        info!("Configuration reloaded from {}", path.display());
        Ok(())
    }

    fn raw(&self, section: &str, key: &str) -> Option<String> {
        let ini = self.ini.read().unwrap_or_else(PoisonError::into_inner);
        ini.section(Some(section))
            .and_then(|properties| properties.get(key))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        let Some(value) = self.raw(section, key) else {
            return default;
        };

        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                warn!(
                    "Invalid boolean value '{}' for {}.{}, using default {}",
                    value, section, key, default
                );
                default
            }
        }
    }

    pub fn get_string(&self, section: &str, key: &str, default: &str) -> String {
        self.raw(section, key)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, section: &str, key: &str, default: i64, min: i64, max: i64) -> i64 {
        let Some(value) = self.raw(section, key) else {
            return default;
        };

        match value.parse::<i64>() {
            Ok(parsed) if (min..=max).contains(&parsed) => parsed,
            Ok(parsed) => {
                warn!(
                    "Integer value {} for {}.{} out of range [{},{}], using default {}",
                    parsed, section, key, min, max, default
                );
                default
            }
            Err(_) => {
                warn!(
                    "Invalid integer value '{}' for {}.{}, using default {}",
                    value, section, key, default
                );
                default
            }
        }
    }

    pub fn get_ip(&self, section: &str, key: &str, default: Ipv4Addr) -> Ipv4Addr {
        self.get_optional_ip(section, key).unwrap_or(default)
    }

    /// Like [`get_ip`](Self::get_ip) but distinguishes "not configured".
    pub fn get_optional_ip(&self, section: &str, key: &str) -> Option<Ipv4Addr> {
        let value = self.raw(section, key)?;
        match value.parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("Invalid IPv4 address '{}' for {}.{}", value, section, key);
                None
            }
        }
    }

    pub fn get_mac(&self, section: &str, key: &str, default: MacAddr) -> MacAddr {
        self.get_optional_mac(section, key).unwrap_or(default)
    }

    pub fn get_optional_mac(&self, section: &str, key: &str) -> Option<MacAddr> {
        let value = self.raw(section, key)?;
        match value.parse::<MacAddr>() {
            Ok(mac) => Some(mac),
            Err(_) => {
                warn!("Invalid MAC address '{}' for {}.{}", value, section, key);
                None
            }
        }
    }

    pub fn get_duration(&self, section: &str, key: &str, default: Duration) -> Duration {
        let Some(value) = self.raw(section, key) else {
            return default;
        };

        parse_duration(&value).unwrap_or_else(|| {
            warn!(
                "Invalid duration '{}' for {}.{}, using default {:?}",
                value, section, key, default
            );
            default
        })
    }
}

/// Parses a bare integer as seconds, or a unit string such as `1m30s`.
///
/// Supported units: `ms`, `s`, `m`, `h`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .filter(|&end| end > 0)?;
        let amount: u64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];

        let unit_end = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_end] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.checked_mul(60)?),
            "h" => Duration::from_secs(amount.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_end..];
    }

    Some(total)
}

/// Identity of the simulated device, loaded once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentity {
    /// Network interface the raw DHCP and multicast traffic leaves from.
    pub interface: String,
    /// Client hardware address placed in DHCP, RADIUS and IPFIX.
    pub mac: MacAddr,
    /// The device's own IPv4 address, used to pick MACs in flow records.
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneralSettings {
    pub device: DeviceIdentity,
    /// Token bucket capacity (tokens per second) shared by exporters.
    pub rate_limit: u32,
    /// Maximum number of idle RADIUS clients kept for reuse.
    pub pool_size: usize,
    /// Statistics reporter period. Zero disables the reporter.
    pub stats_interval: Duration,
}

impl GeneralSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let interface = store.get_string("general", "interface", "");
        let mac = store.get_optional_mac("general", "clientmac").unwrap_or_else(|| {
            warn!("Using default MAC address: {}", MacAddr::DEFAULT_CLIENT);
            MacAddr::DEFAULT_CLIENT
        });
        let ip = store
            .get_optional_ip("general", "clientip")
            .or_else(|| store.get_optional_ip("dhcp", "ciaddr"))
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        Self {
            device: DeviceIdentity { interface, mac, ip },
            rate_limit: store.get_int("general", "rate_limit", DEFAULT_RATE_LIMIT, 1, 100_000)
                as u32,
            pool_size: store.get_int("general", "pool_size", DEFAULT_POOL_SIZE, 1, 1024) as usize,
            stats_interval: store.get_duration(
                "general",
                "stats_interval",
                Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DhcpSettings {
    pub enabled: bool,
    /// DHCP server (IP destination). Broadcast when unset.
    pub server: Ipv4Addr,
    /// Relay agent address; non-zero makes the frame look relayed.
    pub giaddr: Ipv4Addr,
    /// Client address placed in `ciaddr` when set.
    pub ciaddr: Option<Ipv4Addr>,
    /// Ethernet source. Falls back to the interface MAC.
    pub src_mac: Option<MacAddr>,
    /// Ethernet destination. Broadcast implies the DHCP broadcast flag.
    pub dst_mac: MacAddr,
    pub renew: Duration,
    /// JSON array of option entries.
    pub options: String,
}

impl DhcpSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            enabled: store.get_bool("dhcp", "enabled", false),
            server: store.get_ip("dhcp", "server", Ipv4Addr::BROADCAST),
            giaddr: store.get_ip("dhcp", "giaddr", Ipv4Addr::UNSPECIFIED),
            ciaddr: store
                .get_optional_ip("dhcp", "ciaddr")
                .filter(|ip| !ip.is_unspecified()),
            src_mac: store.get_optional_mac("dhcp", "srcmac"),
            dst_mac: store.get_mac("dhcp", "dstmac", MacAddr::BROADCAST),
            renew: store.get_duration("dhcp", "renew", Duration::from_secs(DEFAULT_RENEW_SECS)),
            options: store.get_string("dhcp", "options", "[]"),
        }
    }

    pub fn broadcast(&self) -> bool {
        self.dst_mac.is_broadcast()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpnpSettings {
    pub enabled: bool,
    pub user_agent: String,
    pub device_type: String,
    pub group: Ipv4Addr,
    pub port: u16,
    pub interval: Duration,
    pub listen: Duration,
}

impl UpnpSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            enabled: store.get_bool("upnp", "enabled", false),
            user_agent: store.get_string("upnp", "useragent", DEFAULT_USER_AGENT),
            device_type: store.get_string("upnp", "devicetype", DEFAULT_DEVICE_TYPE),
            group: store.get_ip("upnp", "ipaddr", DEFAULT_SSDP_GROUP),
            port: store.get_int("upnp", "udpport", DEFAULT_SSDP_PORT, 1, 65535) as u16,
            interval: UPNP_INTERVAL,
            listen: UPNP_LISTEN_WINDOW,
        }
    }
}

/// RADIUS client settings, shared by the authentication and accounting
/// sections.
#[derive(Debug, Clone, Serialize)]
pub struct RadiusSettings {
    pub enabled: bool,
    pub server: Ipv4Addr,
    pub port: u16,
    #[serde(skip_serializing)]
    pub secret: String,
    pub nas_ip_address: Option<Ipv4Addr>,
    pub called_station_id: String,
    pub nas_port: u32,
    pub framed_ip_address: Option<Ipv4Addr>,
    pub nas_identifier: String,
    pub nas_port_id: String,
    pub acct_session_id: String,
    pub interval: Duration,
    pub backoff: Duration,
}

impl RadiusSettings {
    pub fn authentication(store: &ConfigStore) -> Self {
        Self::from_section(store, "authentication", DEFAULT_RADIUS_AUTH_PORT)
    }

    pub fn accounting(store: &ConfigStore) -> Self {
        Self::from_section(store, "accounting", DEFAULT_RADIUS_ACCT_PORT)
    }

    fn from_section(store: &ConfigStore, section: &str, default_port: i64) -> Self {
        let mut enabled = store.get_bool(section, "enabled", false);

        let server = store.get_optional_ip(section, "server");
        if enabled && server.is_none() {
            warn!("No usable {} server configured, disabling", section);
            enabled = false;
        }

        let secret = store.get_string(section, "secret", DEFAULT_RADIUS_SECRET);

        let nas_port = store.get_string(section, "NAS-Port", "");
        let nas_port = match nas_port.parse::<u32>() {
            Ok(port) => port,
            Err(_) => {
                if !nas_port.is_empty() {
                    warn!("Invalid NAS-Port '{}' for {}, using 0", nas_port, section);
                }
                0
            }
        };

        Self {
            enabled,
            server: server.unwrap_or(Ipv4Addr::UNSPECIFIED),
            port: store.get_int(section, "port", default_port, 1, 65535) as u16,
            secret,
            nas_ip_address: store.get_optional_ip(section, "NAS-IP-Address"),
            called_station_id: store.get_string(section, "Called-Station-Id", ""),
            nas_port,
            framed_ip_address: store.get_optional_ip(section, "Framed-IP-Address"),
            nas_identifier: store.get_string(section, "NAS-Identifier", ""),
            nas_port_id: store.get_string(section, "NAS-Port-Id", ""),
            acct_session_id: store.get_string(section, "Acct-Session-Id", ""),
            interval: RADIUS_INTERVAL,
            backoff: RADIUS_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IpfixSettings {
    pub enabled: bool,
    pub destination_ip: Ipv4Addr,
    pub destination_port: u16,
    /// JSON array of traffic records.
    pub traffic: String,
    pub interval: Duration,
}

impl IpfixSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            enabled: store.get_bool("ipfix", "enabled", false),
            destination_ip: store.get_ip("ipfix", "destination_ip", Ipv4Addr::LOCALHOST),
            destination_port: store.get_int(
                "ipfix",
                "destination_port",
                DEFAULT_IPFIX_PORT,
                1,
                65535,
            ) as u16,
            traffic: store.get_string("ipfix", "traffic", "[]"),
            interval: IPFIX_INTERVAL,
        }
    }
}

/// Every resolved setting, as used by the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub general: GeneralSettings,
    pub dhcp: DhcpSettings,
    pub upnp: UpnpSettings,
    pub authentication: RadiusSettings,
    pub accounting: RadiusSettings,
    pub ipfix: IpfixSettings,
}

impl Settings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let settings = Self {
            general: GeneralSettings::from_store(store),
            dhcp: DhcpSettings::from_store(store),
            upnp: UpnpSettings::from_store(store),
            authentication: RadiusSettings::authentication(store),
            accounting: RadiusSettings::accounting(store),
            ipfix: IpfixSettings::from_store(store),
        };

        info!(
            "DHCP configured - enabled: {}, server: {}, renew: {:?}",
            settings.dhcp.enabled, settings.dhcp.server, settings.dhcp.renew
        );
        info!(
            "UPnP configured - enabled: {}, group: {}:{}",
            settings.upnp.enabled, settings.upnp.group, settings.upnp.port
        );
        info!(
            "RADIUS authentication configured - enabled: {}, server: {}:{}",
            settings.authentication.enabled,
            settings.authentication.server,
            settings.authentication.port
        );
        info!(
            "RADIUS accounting configured - enabled: {}, server: {}:{}",
            settings.accounting.enabled, settings.accounting.server, settings.accounting.port
        );
        info!(
            "IPFIX configured - enabled: {}, destination: {}:{}",
            settings.ipfix.enabled, settings.ipfix.destination_ip, settings.ipfix.destination_port
        );

        settings
    }
}
