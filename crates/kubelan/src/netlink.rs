//! Netlink plumbing for the overlay interface
//!
//! Creates and deletes the VXLAN link and manages its bridge-family FDB
//! entries over a `NETLINK_ROUTE` socket. Every request asks for an ACK and
//! blocks until the kernel answers, so errors surface on the calling thread.
//! Host addresses, link MTUs and the default route are read with dumps on
//! the same socket. On non-Linux platforms a no-op implementation is used for
//! development.

#[cfg(target_os = "linux")]
mod linux {
    use crate::error::{KubelanError, Result};
    use crate::vxlan::{HostInterface, LinkDriver, VxlanLinkSpec};
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_APPEND, NLM_F_CREATE,
        NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST,
    };
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::link::{
        InfoData, InfoKind, InfoVxlan, LinkAttribute, LinkFlags, LinkInfo, LinkMessage,
    };
    use netlink_packet_route::neighbour::{
        NeighbourAddress, NeighbourAttribute, NeighbourFlags, NeighbourMessage, NeighbourState,
    };
    use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use nix::errno::Errno;
    use std::collections::HashMap;
    use std::io;
    use std::net::IpAddr;
    use tracing::{debug, instrument, trace};

    /// Receive buffer size, large enough for one dump datagram
    const RECV_BUFFER_SIZE: usize = 65536;

    /// All-zero link-layer address used for flood entries
    const ZERO_MAC: [u8; 6] = [0; 6];

    /// Main routing table id
    const RT_TABLE_MAIN: u8 = 254;

    /// Blocking netlink route socket
    pub struct RouteSocket {
        socket: Socket,
        sequence: u32,
    }

    impl RouteSocket {
        /// Open a route socket connected to the kernel
        #[instrument]
        pub fn new() -> Result<Self> {
            let mut socket =
                Socket::new(NETLINK_ROUTE).map_err(|e| KubelanError::netlink("open socket", e))?;
            socket
                .bind_auto()
                .map_err(|e| KubelanError::netlink("bind socket", e))?;
            socket
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| KubelanError::netlink("connect socket", e))?;

            debug!("Netlink route socket connected");
            Ok(Self {
                socket,
                sequence: 0,
            })
        }

        /// Preferred source address of the IPv4 default route
        #[instrument(skip(self))]
        pub fn default_source(&mut self) -> Result<Option<IpAddr>> {
            let mut message = RouteMessage::default();
            message.header.address_family = AddressFamily::Inet;

            let routes: Vec<RouteMessage> = self
                .dump("dump routes", RouteNetlinkMessage::GetRoute(message))?
                .into_iter()
                .filter_map(|msg| match msg {
                    RouteNetlinkMessage::NewRoute(route) => Some(route),
                    _ => None,
                })
                .collect();

            Ok(default_route_source(&routes))
        }

        fn send(
            &mut self,
            operation: &'static str,
            message: RouteNetlinkMessage,
            flags: u16,
        ) -> Result<()> {
            self.sequence = self.sequence.wrapping_add(1);

            let mut header = NetlinkHeader::default();
            header.flags = flags;
            header.sequence_number = self.sequence;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
            packet.finalize();

            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            trace!(operation, sequence = self.sequence, "Sending netlink request");
            self.socket
                .send(&buf, 0)
                .map_err(|e| KubelanError::netlink(operation, e))?;
            Ok(())
        }

        /// Send one request and wait for the kernel's ACK
        fn request(
            &mut self,
            operation: &'static str,
            message: RouteNetlinkMessage,
            flags: u16,
        ) -> Result<()> {
            self.send(operation, message, flags | NLM_F_REQUEST | NLM_F_ACK)?;
            self.receive(operation, |_| {})
        }

        /// Send a dump request and collect every reply until `NLMSG_DONE`
        fn dump(
            &mut self,
            operation: &'static str,
            message: RouteNetlinkMessage,
        ) -> Result<Vec<RouteNetlinkMessage>> {
            self.send(operation, message, NLM_F_REQUEST | NLM_F_DUMP)?;

            let mut replies = Vec::new();
            self.receive(operation, |msg| replies.push(msg))?;
            trace!(operation, count = replies.len(), "Netlink dump complete");
            Ok(replies)
        }

        /// Read replies to the current sequence until an ACK, error or done
        fn receive(
            &mut self,
            operation: &'static str,
            mut on_message: impl FnMut(RouteNetlinkMessage),
        ) -> Result<()> {
            loop {
                let mut buf = Vec::with_capacity(RECV_BUFFER_SIZE);
                let len = self
                    .socket
                    .recv(&mut buf, 0)
                    .map_err(|e| KubelanError::netlink(operation, e))?;

                let mut offset = 0;
                while offset < len {
                    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..len])
                        .map_err(|e| KubelanError::NetlinkDecode(e.to_string()))?;

                    let msg_len = msg.header.length as usize;
                    if msg_len == 0 {
                        return Err(KubelanError::NetlinkDecode(
                            "zero-length netlink message".to_string(),
                        ));
                    }
                    // Align to 4 bytes (netlink alignment requirement)
                    offset += (msg_len + 3) & !3;

                    if msg.header.sequence_number != self.sequence {
                        continue;
                    }

                    match msg.payload {
                        NetlinkPayload::Error(err) => {
                            return match err.code {
                                None => Ok(()),
                                Some(code) => Err(KubelanError::netlink(
                                    operation,
                                    io::Error::from_raw_os_error(-code.get()),
                                )),
                            };
                        }
                        NetlinkPayload::Done(_) => return Ok(()),
                        NetlinkPayload::InnerMessage(inner) => on_message(inner),
                        _ => {}
                    }
                }
            }
        }

        fn fdb_message(index: u32, ip: IpAddr) -> NeighbourMessage {
            let mut message = NeighbourMessage::default();
            message.header.family = AddressFamily::Bridge;
            message.header.ifindex = index;
            message.header.state = NeighbourState::Permanent;
            message.header.flags = NeighbourFlags::Own;
            message
                .attributes
                .push(NeighbourAttribute::LinkLocalAddress(ZERO_MAC.to_vec()));
            message
                .attributes
                .push(NeighbourAttribute::Destination(match ip {
                    IpAddr::V4(v4) => NeighbourAddress::Inet(v4),
                    IpAddr::V6(v6) => NeighbourAddress::Inet6(v6),
                }));
            message
        }
    }

    impl LinkDriver for RouteSocket {
        fn link_index(&mut self, name: &str) -> Result<Option<u32>> {
            match nix::net::if_::if_nametoindex(name) {
                Ok(index) => Ok(Some(index)),
                Err(Errno::ENODEV) => Ok(None),
                Err(e) => Err(KubelanError::netlink("lookup link", io::Error::from(e))),
            }
        }

        #[instrument(skip(self), fields(name = %spec.name, vni = spec.vni))]
        fn add_vxlan(&mut self, spec: &VxlanLinkSpec) -> Result<()> {
            let mut message = LinkMessage::default();
            message
                .attributes
                .push(LinkAttribute::IfName(spec.name.clone()));
            if let Some(mtu) = spec.mtu {
                message.attributes.push(LinkAttribute::Mtu(mtu));
            }

            let mut vxlan = vec![
                InfoVxlan::Id(spec.vni),
                InfoVxlan::Port(spec.port),
                InfoVxlan::Learning(true),
            ];
            match spec.local {
                IpAddr::V4(v4) => vxlan.push(InfoVxlan::Local(v4)),
                IpAddr::V6(v6) => vxlan.push(InfoVxlan::Local6(v6)),
            }
            message.attributes.push(LinkAttribute::LinkInfo(vec![
                LinkInfo::Kind(InfoKind::Vxlan),
                LinkInfo::Data(InfoData::Vxlan(vxlan)),
            ]));

            self.request(
                "add link",
                RouteNetlinkMessage::NewLink(message),
                NLM_F_CREATE | NLM_F_EXCL,
            )
        }

        fn set_link_up(&mut self, index: u32) -> Result<()> {
            let mut message = LinkMessage::default();
            message.header.index = index;
            message.header.flags = LinkFlags::Up;
            message.header.change_mask = LinkFlags::Up;

            self.request("set link up", RouteNetlinkMessage::SetLink(message), 0)
        }

        fn delete_link(&mut self, index: u32) -> Result<()> {
            let mut message = LinkMessage::default();
            message.header.index = index;

            self.request("delete link", RouteNetlinkMessage::DelLink(message), 0)
        }

        fn append_fdb(&mut self, index: u32, ip: IpAddr) -> Result<()> {
            self.request(
                "append fdb",
                RouteNetlinkMessage::NewNeighbour(Self::fdb_message(index, ip)),
                NLM_F_CREATE | NLM_F_APPEND,
            )
        }

        fn delete_fdb(&mut self, index: u32, ip: IpAddr) -> Result<()> {
            self.request(
                "delete fdb",
                RouteNetlinkMessage::DelNeighbour(Self::fdb_message(index, ip)),
                0,
            )
        }

        #[instrument(skip(self))]
        fn host_interfaces(&mut self) -> Result<Vec<HostInterface>> {
            let links: Vec<LinkMessage> = self
                .dump("dump links", RouteNetlinkMessage::GetLink(LinkMessage::default()))?
                .into_iter()
                .filter_map(|msg| match msg {
                    RouteNetlinkMessage::NewLink(link) => Some(link),
                    _ => None,
                })
                .collect();

            let request = RouteNetlinkMessage::GetAddress(AddressMessage::default());
            let addresses: Vec<AddressMessage> = self
                .dump("dump addresses", request)?
                .into_iter()
                .filter_map(|msg| match msg {
                    RouteNetlinkMessage::NewAddress(address) => Some(address),
                    _ => None,
                })
                .collect();

            Ok(join_host_interfaces(&links, &addresses))
        }
    }

    /// Pairs every address with the name and MTU of the link carrying it.
    ///
    /// Links are matched by index; address labels are ignored. Addresses on
    /// links missing from the dump are skipped.
    pub fn join_host_interfaces(
        links: &[LinkMessage],
        addresses: &[AddressMessage],
    ) -> Vec<HostInterface> {
        let mut by_index: HashMap<u32, (String, u32)> = HashMap::new();
        for link in links {
            let mut name = None;
            let mut mtu = None;
            for attr in &link.attributes {
                match attr {
                    LinkAttribute::IfName(n) => name = Some(n.clone()),
                    LinkAttribute::Mtu(m) => mtu = Some(*m),
                    _ => {}
                }
            }
            if let (Some(name), Some(mtu)) = (name, mtu) {
                by_index.insert(link.header.index, (name, mtu));
            }
        }

        let mut interfaces = Vec::new();
        for address in addresses {
            let mut local = None;
            let mut peer = None;
            for attr in &address.attributes {
                match attr {
                    AddressAttribute::Local(ip) => local = Some(*ip),
                    AddressAttribute::Address(ip) => peer = Some(*ip),
                    _ => {}
                }
            }
            // IFA_LOCAL is the local end on point-to-point links
            let Some(ip) = local.or(peer) else {
                continue;
            };

            let index = address.header.index;
            match by_index.get(&index) {
                Some((name, mtu)) => interfaces.push(HostInterface {
                    name: name.clone(),
                    index,
                    address: ip,
                    mtu: *mtu,
                }),
                None => trace!(index, address = %ip, "Address on unknown link, skipping"),
            }
        }

        interfaces
    }

    /// Preferred source of the first main-table route with a gateway
    pub fn default_route_source(routes: &[RouteMessage]) -> Option<IpAddr> {
        routes
            .iter()
            .filter(|route| route.header.table == RT_TABLE_MAIN)
            .find(|route| {
                route
                    .attributes
                    .iter()
                    .any(|attr| matches!(attr, RouteAttribute::Gateway(_)))
            })
            .and_then(|route| {
                route.attributes.iter().find_map(|attr| match attr {
                    RouteAttribute::PrefSource(RouteAddress::Inet(v4)) => Some(IpAddr::V4(*v4)),
                    RouteAttribute::PrefSource(RouteAddress::Inet6(v6)) => Some(IpAddr::V6(*v6)),
                    _ => None,
                })
            })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::net::Ipv4Addr;

        fn link(index: u32, name: &str, mtu: u32) -> LinkMessage {
            let mut message = LinkMessage::default();
            message.header.index = index;
            message
                .attributes
                .push(LinkAttribute::IfName(name.to_string()));
            message.attributes.push(LinkAttribute::Mtu(mtu));
            message
        }

        fn address(index: u32, ip: &str, label: &str) -> AddressMessage {
            let ip: IpAddr = ip.parse().unwrap();
            let mut message = AddressMessage::default();
            message.header.index = index;
            message.attributes.push(AddressAttribute::Address(ip));
            message.attributes.push(AddressAttribute::Local(ip));
            message
                .attributes
                .push(AddressAttribute::Label(label.to_string()));
            message
        }

        fn route(table: u8, gateway: Option<&str>, source: Option<&str>) -> RouteMessage {
            let mut message = RouteMessage::default();
            message.header.address_family = AddressFamily::Inet;
            message.header.table = table;
            if let Some(gateway) = gateway {
                let gateway = RouteAddress::Inet(gateway.parse().unwrap());
                message.attributes.push(RouteAttribute::Gateway(gateway));
            }
            if let Some(source) = source {
                let source = RouteAddress::Inet(source.parse().unwrap());
                message.attributes.push(RouteAttribute::PrefSource(source));
            }
            message
        }

        #[test]
        fn test_join_uses_link_index_not_label() {
            let links = vec![link(1, "lo", 65536), link(2, "eth0", 1500)];
            let addresses = vec![
                address(1, "127.0.0.1", "lo"),
                address(1, "10.99.0.1", "lo:kl"),
                address(2, "192.168.1.10", "eth0"),
                address(2, "192.168.1.11", "eth0:1"),
            ];

            let interfaces = join_host_interfaces(&links, &addresses);
            assert_eq!(interfaces.len(), 4);

            let labeled = interfaces
                .iter()
                .find(|iface| iface.address == "10.99.0.1".parse::<IpAddr>().unwrap())
                .unwrap();
            assert_eq!(labeled.name, "lo");
            assert_eq!(labeled.mtu, 65536);

            let secondary = interfaces
                .iter()
                .find(|iface| iface.address == "192.168.1.11".parse::<IpAddr>().unwrap())
                .unwrap();
            assert_eq!(secondary.name, "eth0");
            assert_eq!(secondary.index, 2);
            assert_eq!(secondary.mtu, 1500);
        }

        #[test]
        fn test_join_skips_addresses_on_unknown_links() {
            let links = vec![link(2, "eth0", 1500)];
            let addresses = vec![
                address(7, "10.0.0.1", "gone0"),
                address(2, "10.0.0.2", "eth0"),
            ];

            let interfaces = join_host_interfaces(&links, &addresses);
            assert_eq!(interfaces.len(), 1);
            assert_eq!(interfaces[0].address, "10.0.0.2".parse::<IpAddr>().unwrap());
        }

        #[test]
        fn test_join_prefers_local_address() {
            let mut p2p = AddressMessage::default();
            p2p.header.index = 3;
            p2p.attributes
                .push(AddressAttribute::Address("10.8.0.2".parse().unwrap()));
            p2p.attributes
                .push(AddressAttribute::Local("10.8.0.1".parse().unwrap()));

            let interfaces = join_host_interfaces(&[link(3, "tun0", 1400)], &[p2p]);
            assert_eq!(interfaces[0].address, "10.8.0.1".parse::<IpAddr>().unwrap());
        }

        #[test]
        fn test_default_route_source_uses_preferred_source() {
            let routes = vec![
                route(RT_TABLE_MAIN, None, Some("10.0.0.5")),
                route(RT_TABLE_MAIN, Some("10.0.0.1"), Some("10.0.0.6")),
            ];
            assert_eq!(
                default_route_source(&routes),
                Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)))
            );
        }

        #[test]
        fn test_default_route_source_ignores_other_tables() {
            let routes = vec![
                route(100, Some("172.16.0.1"), Some("172.16.0.2")),
                route(RT_TABLE_MAIN, Some("10.0.0.1"), Some("10.0.0.6")),
            ];
            assert_eq!(
                default_route_source(&routes),
                Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)))
            );
        }

        #[test]
        fn test_default_route_source_without_gateway_or_source() {
            assert_eq!(default_route_source(&[]), None);
            assert_eq!(
                default_route_source(&[route(RT_TABLE_MAIN, None, Some("10.0.0.5"))]),
                None
            );
            assert_eq!(
                default_route_source(&[route(RT_TABLE_MAIN, Some("10.0.0.1"), None)]),
                None
            );
        }

        #[test]
        fn test_host_interfaces_from_kernel() {
            let mut socket = RouteSocket::new().unwrap();
            let interfaces = socket.host_interfaces().unwrap();

            let loopback = interfaces
                .iter()
                .find(|iface| iface.address == IpAddr::V4(Ipv4Addr::LOCALHOST))
                .unwrap();
            assert!(loopback.mtu > 0);
            assert_eq!(Some(loopback.index), socket.link_index(&loopback.name).unwrap());
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Mock implementation for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod mock {
    use crate::error::Result;
    use crate::vxlan::{HostInterface, LinkDriver, VxlanLinkSpec};
    use std::net::IpAddr;

    pub struct RouteSocket {
        next_index: u32,
        links: Vec<(String, u32)>,
    }

    impl RouteSocket {
        pub fn new() -> Result<Self> {
            Ok(Self {
                next_index: 100,
                links: Vec::new(),
            })
        }

        pub fn default_source(&mut self) -> Result<Option<IpAddr>> {
            Ok(None)
        }
    }

    impl LinkDriver for RouteSocket {
        fn link_index(&mut self, name: &str) -> Result<Option<u32>> {
            Ok(self
                .links
                .iter()
                .find(|(link, _)| link == name)
                .map(|(_, index)| *index))
        }

        fn add_vxlan(&mut self, spec: &VxlanLinkSpec) -> Result<()> {
            self.next_index += 1;
            self.links.push((spec.name.clone(), self.next_index));
            Ok(())
        }

        fn set_link_up(&mut self, _index: u32) -> Result<()> {
            Ok(())
        }

        fn delete_link(&mut self, index: u32) -> Result<()> {
            self.links.retain(|(_, i)| *i != index);
            Ok(())
        }

        fn append_fdb(&mut self, _index: u32, _ip: IpAddr) -> Result<()> {
            Ok(())
        }

        fn delete_fdb(&mut self, _index: u32, _ip: IpAddr) -> Result<()> {
            Ok(())
        }

        fn host_interfaces(&mut self) -> Result<Vec<HostInterface>> {
            Ok(Vec::new())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
