//! Raw link-layer socket for sending hand-built Ethernet frames.
//!
//! DHCP requests must leave with a spoofed source MAC and a relay `giaddr`
//! as source IP, which a regular UDP socket cannot express. The frame is
//! written whole to an `AF_PACKET`/`SOCK_RAW` socket bound to one interface.

use std::mem;

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::debug;

use crate::error::{Error, Result};
use crate::interface::NetworkInterface;

#[derive(Debug)]
pub struct RawLinkSocket {
    socket: Socket,
    interface: String,
}

impl RawLinkSocket {
    /// Opens a raw socket bound to `interface`. Needs `CAP_NET_RAW`.
    pub fn open(interface: &NetworkInterface) -> Result<Self> {
        let socket = Socket::new(Domain::PACKET, Type::RAW, None)
            .map_err(|error| Error::Socket(format!("Failed to create raw socket: {}", error)))?;

        let address = link_address(interface.index)?;
        socket.bind(&address).map_err(|error| {
            Error::Socket(format!(
                "Failed to bind raw socket to {}: {}",
                interface.name, error
            ))
        })?;

        debug!(
            "Raw link socket bound to {} (index {})",
            interface.name, interface.index
        );

        Ok(Self {
            socket,
            interface: interface.name.clone(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Writes one complete frame. A short write is an error.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        let sent = self.socket.send(frame).map_err(|error| {
            Error::Socket(format!("Failed to send on {}: {}", self.interface, error))
        })?;

        if sent != frame.len() {
            return Err(Error::Socket(format!(
                "Short write on {}: {} of {} bytes",
                self.interface,
                sent,
                frame.len()
            )));
        }
        Ok(())
    }
}

/// Builds a `sockaddr_ll` selecting every protocol on the given interface.
fn link_address(index: u32) -> Result<SockAddr> {
    let ifindex = i32::try_from(index)
        .map_err(|_| Error::Socket(format!("Interface index {} out of range", index)))?;

    // SAFETY: sockaddr_storage is plain old data and is large enough for a
    // sockaddr_ll; only the sockaddr_ll prefix is written and passed on.
    let address = unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let link = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll;
        (*link).sll_family = libc::AF_PACKET as libc::sa_family_t;
        (*link).sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        (*link).sll_ifindex = ifindex;
        SockAddr::new(
            storage,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };

    Ok(address)
}
