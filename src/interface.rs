//! Network interface resolution with a shared cache.
//!
//! Every protocol that touches the link (raw DHCP frames, SSDP multicast)
//! needs the interface index, hardware address and IPv4 address. Lookups go
//! through [`InterfaceCache`], which takes a read lock for the common hit
//! path and only promotes to a write lock on a miss, re-checking before the
//! system lookup so concurrent misses resolve the interface once.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::if_nametoindex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mac::MacAddr;

/// A resolved network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    /// Kernel interface index, used to bind raw sockets.
    pub index: u32,
    /// Hardware address, absent on interfaces without a link layer.
    pub mac: Option<MacAddr>,
    /// First IPv4 address assigned to the interface.
    pub ipv4: Option<Ipv4Addr>,
}

impl NetworkInterface {
    /// Queries the kernel for the named interface.
    pub fn lookup(name: &str) -> Result<Self> {
        let interface_error = |reason: String| Error::Interface {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(interface_error("no interface specified".to_string()));
        }

        let index = if_nametoindex(name).map_err(|error| interface_error(error.to_string()))?;

        let mut mac = None;
        let mut ipv4 = None;
        let addresses = getifaddrs().map_err(|error| interface_error(error.to_string()))?;
        for address in addresses.filter(|address| address.interface_name == name) {
            let Some(storage) = address.address else {
                continue;
            };
            if mac.is_none()
                && let Some(octets) = storage.as_link_addr().and_then(|link| link.addr())
            {
                mac = Some(MacAddr(octets));
            }
            if ipv4.is_none()
                && let Some(inet) = storage.as_sockaddr_in()
            {
                ipv4 = Some(Ipv4Addr::from(inet.ip()));
            }
        }

        debug!(
            "Resolved interface {} (index {}, mac {:?}, ipv4 {:?})",
            name, index, mac, ipv4
        );

        Ok(Self {
            name: name.to_string(),
            index,
            mac,
            ipv4,
        })
    }
}

/// Concurrency-safe cache of resolved interfaces keyed by name.
#[derive(Debug, Default)]
pub struct InterfaceCache {
    interfaces: RwLock<HashMap<String, NetworkInterface>>,
}

impl InterfaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached interface, resolving it on first use.
    pub fn get(&self, name: &str) -> Result<NetworkInterface> {
        self.get_with(name, NetworkInterface::lookup)
    }

    fn get_with<F>(&self, name: &str, lookup: F) -> Result<NetworkInterface>
    where
        F: FnOnce(&str) -> Result<NetworkInterface>,
    {
        {
            let interfaces = self.interfaces.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(interface) = interfaces.get(name) {
                return Ok(interface.clone());
            }
        }

        let mut interfaces = self.interfaces.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(interface) = interfaces.get(name) {
            return Ok(interface.clone());
        }

        let interface = lookup(name)?;
        interfaces.insert(name.to_string(), interface.clone());
        Ok(interface)
    }

    /// Drops every cached entry so the next lookup hits the kernel.
    pub fn clear(&self) {
        self.interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_interface(name: &str) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            index: 7,
            mac: Some(MacAddr([0x02, 0, 0, 0, 0, 0x07])),
            ipv4: Some(Ipv4Addr::new(10, 0, 0, 7)),
        }
    }

    #[test]
    fn test_cache_hit_skips_lookup() {
        let cache = InterfaceCache::new();
        let lookups = AtomicUsize::new(0);

        for _ in 0..5 {
            let interface = cache
                .get_with("eth0", |name| {
                    lookups.fetch_add(1, Ordering::SeqCst);
                    Ok(fake_interface(name))
                })
                .unwrap();
            assert_eq!(interface.index, 7);
        }

        assert_eq!(lookups.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_misses_resolve_once() {
        let cache = Arc::new(InterfaceCache::new());
        let lookups = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let lookups = Arc::clone(&lookups);
                std::thread::spawn(move || {
                    cache
                        .get_with("eth1", |name| {
                            lookups.fetch_add(1, Ordering::SeqCst);
                            Ok(fake_interface(name))
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().name, "eth1");
        }
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_lookup_is_not_cached() {
        let cache = InterfaceCache::new();
        let result = cache.get("devsim-does-not-exist0");
        assert!(matches!(result, Err(Error::Interface { .. })));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(NetworkInterface::lookup("").unwrap_err().is_fatal());
    }

    #[test]
    fn test_clear() {
        let cache = InterfaceCache::new();
        cache.get_with("eth0", |name| Ok(fake_interface(name))).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }
}
