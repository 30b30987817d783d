//! VXLAN overlay interface lifecycle and peer (FDB) management
//!
//! Multicast is rarely available in cluster networks, so flooding is done with
//! one static all-zero MAC FDB entry per peer VTEP (`bridge fdb append
//! 00:00:00:00:00:00 dev <iface> dst <peer>`). Broadcast and unknown-unicast
//! frames are replicated to every such entry, and the receiving kernel learns
//! the real MAC-to-VTEP mapping from the first frame.

use crate::config::MtuSetting;
use crate::error::{KubelanError, Result};
use std::net::IpAddr;
use tracing::{debug, info, instrument, trace, warn};

/// Encapsulation overhead subtracted from the underlay MTU
/// (outer IPv4 20 + UDP 8 + VXLAN 8 + inner Ethernet 14)
pub const VXLAN_OVERHEAD: u32 = 50;

/// Attributes of the VXLAN link to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanLinkSpec {
    pub name: String,
    pub vni: u32,
    pub local: IpAddr,
    pub port: u16,
    /// None lets the kernel pick its default
    pub mtu: Option<u32>,
}

/// An address configured on a host interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub name: String,
    pub index: u32,
    pub address: IpAddr,
    pub mtu: u32,
}

/// Kernel operations needed by [`OverlayInterface`]
#[cfg_attr(test, mockall::automock)]
pub trait LinkDriver {
    /// Index of the link called `name`, if it exists
    fn link_index(&mut self, name: &str) -> Result<Option<u32>>;

    fn add_vxlan(&mut self, spec: &VxlanLinkSpec) -> Result<()>;

    fn set_link_up(&mut self, index: u32) -> Result<()>;

    fn delete_link(&mut self, index: u32) -> Result<()>;

    /// Append a permanent zero-MAC flood entry towards `ip`
    fn append_fdb(&mut self, index: u32, ip: IpAddr) -> Result<()>;

    fn delete_fdb(&mut self, index: u32, ip: IpAddr) -> Result<()>;

    /// Addresses configured on the host, with the MTU of their interface
    fn host_interfaces(&mut self) -> Result<Vec<HostInterface>>;
}

/// Forwarding-table primitives driven by the membership reconciler
#[cfg_attr(test, mockall::automock)]
pub trait PeerTable {
    fn add_peer(&mut self, ip: IpAddr) -> Result<()>;

    fn remove_peer(&mut self, ip: IpAddr) -> Result<()>;
}

/// Infers the overlay MTU from the host interface carrying `source`.
pub fn infer_mtu(source: IpAddr, host: &[HostInterface]) -> Option<u32> {
    host.iter()
        .find(|iface| iface.address == source)
        .map(|iface| iface.mtu.saturating_sub(VXLAN_OVERHEAD))
}

/// The kernel VXLAN interface implementing the overlay
#[derive(Debug)]
pub struct OverlayInterface<D: LinkDriver> {
    name: String,
    vni: u32,
    mtu: Option<u32>,
    index: u32,
    driver: D,
}

impl<D: LinkDriver> OverlayInterface<D> {
    /// Create the interface, replacing any leftover link of the same name,
    /// and bring it up.
    #[instrument(skip(driver))]
    pub fn create(
        mut driver: D,
        name: &str,
        vni: u32,
        source: IpAddr,
        port: u16,
        mtu: MtuSetting,
    ) -> Result<Self> {
        debug!("Creating VXLAN interface");

        if let Some(existing) = driver.link_index(name)? {
            warn!(interface = name, index = existing, "Deleting existing VXLAN interface");
            driver.delete_link(existing)?;
        }

        let mtu = match mtu {
            MtuSetting::Fixed(mtu) => Some(mtu),
            MtuSetting::Auto => {
                let host = driver.host_interfaces()?;
                let inferred = infer_mtu(source, &host);
                match inferred {
                    Some(mtu) => debug!(mtu, "Inferred VXLAN MTU from source interface"),
                    None => warn!(
                        source = %source,
                        "No interface carries the source address, leaving MTU unset"
                    ),
                }
                inferred
            }
        };

        let spec = VxlanLinkSpec {
            name: name.to_string(),
            vni,
            local: source,
            port,
            mtu,
        };
        driver.add_vxlan(&spec)?;

        let index = driver
            .link_index(name)?
            .ok_or_else(|| KubelanError::InterfaceNotFound(name.to_string()))?;
        driver.set_link_up(index)?;

        info!(interface = name, index, vni, mtu = ?mtu, "VXLAN interface up");

        Ok(Self {
            name: name.to_string(),
            vni,
            mtu,
            index,
            driver,
        })
    }

    pub fn vni(&self) -> u32 {
        self.vni
    }

    pub fn mtu(&self) -> Option<u32> {
        self.mtu
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Remove the kernel interface
    pub fn delete(mut self) -> Result<()> {
        info!(interface = %self.name, "Deleting VXLAN interface");
        self.driver.delete_link(self.index)
    }
}

impl<D: LinkDriver> PeerTable for OverlayInterface<D> {
    fn add_peer(&mut self, ip: IpAddr) -> Result<()> {
        trace!(interface = %self.name, ip = %ip, "Adding peer to VXLAN");

        match self.driver.append_fdb(self.index, ip) {
            Err(e) if e.is_already_exists() => {
                debug!(interface = %self.name, ip = %ip, "Peer already present");
                Ok(())
            }
            other => other,
        }
    }

    fn remove_peer(&mut self, ip: IpAddr) -> Result<()> {
        trace!(interface = %self.name, ip = %ip, "Removing peer from VXLAN");

        match self.driver.delete_fdb(self.index, ip) {
            Err(e) if e.is_not_found() => {
                debug!(interface = %self.name, ip = %ip, "Peer already absent");
                Ok(())
            }
            other => other,
        }
    }
}
