//! Route netlink transport
//!
//! Two sockets are used: a request socket for dumps and route mutations,
//! with replies correlated by sequence number, and a multicast socket that
//! delivers link/neighbour/address/route notifications. Everything crossing
//! this boundary is decoded into owned values from `types.rs`.

#[cfg(target_os = "linux")]
mod linux {
    use crate::channel::{Reply, RouteChannel};
    use crate::error::{DefaultconfError, Result};
    use crate::reconciler::kernel_rejection;
    use crate::types::{AddressState, KernelEvent, KernelRoute, LinkState};
    use defaultconf_types::{AddressFamily, IpPrefix};
    use netlink_packet_core::{
        NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_MULTIPART, NLM_F_REPLACE, NLM_F_REQUEST,
        NetlinkHeader, NetlinkMessage, NetlinkPayload,
    };
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
    use netlink_packet_route::route::{
        RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType,
    };
    use netlink_packet_route::AddressFamily as NlFamily;
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use std::net::IpAddr;
    use std::os::fd::AsRawFd;
    use std::time::{Duration, Instant};
    use tracing::{debug, instrument, trace, warn};

    const RTNLGRP_LINK: u32 = 1;
    const RTNLGRP_NEIGH: u32 = 3;
    const RTNLGRP_IPV4_IFADDR: u32 = 5;
    const RTNLGRP_IPV4_ROUTE: u32 = 7;
    const RTNLGRP_IPV6_IFADDR: u32 = 9;
    const RTNLGRP_IPV6_ROUTE: u32 = 11;

    /// Groups the notification socket subscribes to.
    pub const NOTIFICATION_GROUPS: [u32; 6] = [
        RTNLGRP_LINK,
        RTNLGRP_NEIGH,
        RTNLGRP_IPV4_IFADDR,
        RTNLGRP_IPV4_ROUTE,
        RTNLGRP_IPV6_IFADDR,
        RTNLGRP_IPV6_ROUTE,
    ];

    /// Receive buffer for the notification socket (1MB)
    const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

    /// How long the notification socket blocks before returning an empty batch
    const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    const RT_TABLE_UNSPEC: u8 = 0;

    fn netlink_err(context: &str, err: impl std::fmt::Display) -> DefaultconfError {
        DefaultconfError::Netlink(format!("{}: {}", context, err))
    }

    fn is_timeout(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )
    }

    fn set_socket_option<T>(socket: &Socket, level: libc::c_int, name: libc::c_int, value: &T) -> Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(netlink_err("setsockopt failed", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn set_receive_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        set_socket_option(socket, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
    }

    /// Splits a receive buffer into netlink messages.
    pub fn parse_messages(buffer: &[u8]) -> Result<Vec<NetlinkMessage<RouteNetlinkMessage>>> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < buffer.len() {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buffer[offset..])
                .map_err(|e| netlink_err("Failed to parse message", e))?;
            let length = msg.header.length as usize;
            if length == 0 {
                break;
            }
            // Netlink messages are 4-byte aligned
            offset = (offset + length + 3) & !3;
            messages.push(msg);
        }
        Ok(messages)
    }

    fn to_family(family: NlFamily) -> Option<AddressFamily> {
        match family {
            NlFamily::Inet => Some(AddressFamily::Inet),
            NlFamily::Inet6 => Some(AddressFamily::Inet6),
            _ => None,
        }
    }

    fn to_nl_family(family: AddressFamily) -> NlFamily {
        match family {
            AddressFamily::Inet => NlFamily::Inet,
            AddressFamily::Inet6 => NlFamily::Inet6,
        }
    }

    fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
        match addr {
            RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
            RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
            _ => None,
        }
    }

    fn to_route_address(addr: IpAddr) -> RouteAddress {
        match addr {
            IpAddr::V4(v4) => RouteAddress::Inet(v4),
            IpAddr::V6(v6) => RouteAddress::Inet6(v6),
        }
    }

    pub fn decode_link(msg: &LinkMessage) -> LinkState {
        let name = msg.attributes.iter().find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        });
        LinkState {
            index: msg.header.index,
            name,
            up: msg.header.flags.contains(LinkFlags::Up),
        }
    }

    pub fn decode_address(msg: &AddressMessage) -> Option<AddressState> {
        to_family(msg.header.family)?;
        // On point-to-point links IFA_ADDRESS is the peer; IFA_LOCAL is ours.
        let mut local = None;
        let mut address = None;
        for attr in &msg.attributes {
            match attr {
                AddressAttribute::Local(ip) => local = Some(*ip),
                AddressAttribute::Address(ip) => address = Some(*ip),
                _ => {}
            }
        }
        let ip = local.or(address)?;
        let prefix = IpPrefix::new(ip, msg.header.prefix_len).ok()?;
        Some(AddressState::new(msg.header.index, prefix))
    }

    /// Unicast routes only; local, broadcast and multicast entries are
    /// irrelevant to gateway selection.
    pub fn decode_route(msg: &RouteMessage) -> Option<KernelRoute> {
        let family = to_family(msg.header.address_family)?;
        if msg.header.kind != RouteType::Unicast {
            return None;
        }

        let mut destination = None;
        let mut gateway = None;
        let mut oif = None;
        let mut table = u32::from(msg.header.table);
        let mut metric = 0;
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => destination = route_address(addr),
                RouteAttribute::Gateway(addr) => gateway = route_address(addr),
                RouteAttribute::Oif(index) => oif = Some(*index),
                RouteAttribute::Table(id) => table = *id,
                RouteAttribute::Priority(prio) => metric = *prio,
                _ => {}
            }
        }

        let address = destination.unwrap_or_else(|| family.unspecified());
        let destination = IpPrefix::new(address, msg.header.destination_prefix_length).ok()?;
        Some(KernelRoute {
            destination,
            gateway,
            oif,
            table,
            metric,
        })
    }

    /// Builds the RTM_NEWROUTE/RTM_DELROUTE body for a route we manage.
    pub fn encode_route(route: &KernelRoute, delete: bool) -> RouteMessage {
        let mut msg = RouteMessage::default();
        msg.header.address_family = to_nl_family(route.family());
        msg.header.destination_prefix_length = route.destination.prefix_len();
        msg.header.table = u8::try_from(route.table).unwrap_or(RT_TABLE_UNSPEC);
        msg.header.protocol = RouteProtocol::Static;
        msg.header.scope = if delete {
            RouteScope::NoWhere
        } else {
            RouteScope::Universe
        };
        msg.header.kind = RouteType::Unicast;

        if !route.is_default() {
            msg.attributes
                .push(RouteAttribute::Destination(to_route_address(route.destination.network())));
        }
        msg.attributes.push(RouteAttribute::Table(route.table));
        if let Some(gateway) = route.gateway {
            msg.attributes.push(RouteAttribute::Gateway(to_route_address(gateway)));
        }
        if let Some(oif) = route.oif {
            msg.attributes.push(RouteAttribute::Oif(oif));
        }
        if route.metric != 0 {
            msg.attributes.push(RouteAttribute::Priority(route.metric));
        }
        msg
    }

    /// Maps a notification onto a kernel event. Messages the engine does
    /// not track (neighbours, other families) yield `None`.
    pub fn decode_event(msg: &NetlinkMessage<RouteNetlinkMessage>) -> Option<KernelEvent> {
        let NetlinkPayload::InnerMessage(inner) = &msg.payload else {
            return None;
        };
        match inner {
            RouteNetlinkMessage::NewLink(link) => {
                let state = decode_link(link);
                if link.header.change_mask.contains(LinkFlags::Up) {
                    if state.up {
                        Some(KernelEvent::LinkUp(state))
                    } else {
                        Some(KernelEvent::LinkDown(state))
                    }
                } else {
                    Some(KernelEvent::LinkAdd(state))
                }
            }
            RouteNetlinkMessage::DelLink(link) => Some(KernelEvent::LinkDelete {
                index: link.header.index,
            }),
            RouteNetlinkMessage::NewAddress(addr) => decode_address(addr).map(KernelEvent::AddressAdd),
            RouteNetlinkMessage::DelAddress(addr) => {
                decode_address(addr).map(KernelEvent::AddressDelete)
            }
            RouteNetlinkMessage::NewRoute(route) => {
                let route = decode_route(route)?;
                if msg.header.flags & NLM_F_REPLACE != 0 {
                    Some(KernelEvent::RouteChange(route))
                } else {
                    Some(KernelEvent::RouteAdd(route))
                }
            }
            RouteNetlinkMessage::DelRoute(route) => decode_route(route).map(KernelEvent::RouteDelete),
            _ => None,
        }
    }

    /// Request/reply socket for dumps and route mutations.
    pub struct NetlinkChannel {
        socket: Socket,
        sequence: u32,
        timeout: Duration,
    }

    impl NetlinkChannel {
        #[instrument]
        pub fn open(timeout: Duration) -> Result<Self> {
            let socket = Self::connect(timeout)?;
            debug!("Netlink request socket opened");
            Ok(Self {
                socket,
                sequence: 0,
                timeout,
            })
        }

        fn connect(timeout: Duration) -> Result<Socket> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| netlink_err("Failed to create socket", e))?;
            socket
                .bind_auto()
                .map_err(|e| netlink_err("Failed to bind socket", e))?;
            socket
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| netlink_err("Failed to connect socket", e))?;
            set_receive_timeout(&socket, timeout)?;
            Ok(socket)
        }

        /// Serializes and sends one request; returns its sequence number.
        pub fn send_request(&mut self, message: RouteNetlinkMessage, flags: u16) -> Result<u32> {
            self.sequence = self.sequence.wrapping_add(1).max(1);
            let mut header = NetlinkHeader::default();
            header.flags = flags;
            header.sequence_number = self.sequence;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket
                .send(&buf, 0)
                .map_err(|e| netlink_err("Failed to send request", e))?;
            trace!(seq = self.sequence, "Sent netlink request");
            Ok(self.sequence)
        }

        /// Reads until the reply for `seq` completes. Messages carrying other
        /// sequence numbers are stale replies and are discarded.
        pub fn read_reply(&mut self, seq: u32) -> Result<Reply<RouteNetlinkMessage>> {
            let deadline = Instant::now() + self.timeout;
            let mut records = Vec::new();
            loop {
                if Instant::now() >= deadline {
                    return Err(DefaultconfError::Timeout(self.timeout));
                }
                let (buf, _) = self.socket.recv_from_full().map_err(|e| {
                    if is_timeout(&e) {
                        DefaultconfError::Timeout(self.timeout)
                    } else {
                        netlink_err("Failed to receive reply", e)
                    }
                })?;

                for msg in parse_messages(&buf)? {
                    if msg.header.sequence_number != seq {
                        trace!(seq = msg.header.sequence_number, expected = seq, "Discarding stale reply");
                        continue;
                    }
                    let multipart = msg.header.flags & NLM_F_MULTIPART != 0;
                    match msg.payload {
                        NetlinkPayload::Done(_) => return Ok(Reply::Records(records)),
                        NetlinkPayload::Error(err) => {
                            return Ok(match err.code {
                                Some(code) => Reply::Error(code.get()),
                                None if records.is_empty() => Reply::Ack,
                                None => Reply::Records(records),
                            });
                        }
                        NetlinkPayload::InnerMessage(inner) => {
                            records.push(inner);
                            if !multipart {
                                return Ok(Reply::Records(records));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        fn dump(&mut self, message: RouteNetlinkMessage) -> Result<Vec<RouteNetlinkMessage>> {
            let seq = self.send_request(message, NLM_F_REQUEST | NLM_F_DUMP)?;
            match self.read_reply(seq)? {
                Reply::Records(records) => Ok(records),
                Reply::Ack => Ok(Vec::new()),
                Reply::Error(code) => Err(kernel_rejection("dump", code)),
            }
        }

        fn mutate(&mut self, operation: &'static str, message: RouteNetlinkMessage, flags: u16) -> Result<()> {
            let seq = self.send_request(message, NLM_F_REQUEST | NLM_F_ACK | flags)?;
            match self.read_reply(seq)? {
                Reply::Ack | Reply::Records(_) => Ok(()),
                Reply::Error(code) => Err(kernel_rejection(operation, code)),
            }
        }
    }

    impl RouteChannel for NetlinkChannel {
        fn dump_links(&mut self) -> Result<Vec<LinkState>> {
            let records = self.dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))?;
            Ok(records
                .iter()
                .filter_map(|record| match record {
                    RouteNetlinkMessage::NewLink(link) => Some(decode_link(link)),
                    _ => None,
                })
                .collect())
        }

        fn dump_addresses(&mut self) -> Result<Vec<AddressState>> {
            let records = self.dump(RouteNetlinkMessage::GetAddress(AddressMessage::default()))?;
            Ok(records
                .iter()
                .filter_map(|record| match record {
                    RouteNetlinkMessage::NewAddress(addr) => decode_address(addr),
                    _ => None,
                })
                .collect())
        }

        fn dump_routes(&mut self, family: Option<AddressFamily>) -> Result<Vec<KernelRoute>> {
            let mut request = RouteMessage::default();
            request.header.address_family = family.map_or(NlFamily::Unspec, to_nl_family);
            let records = self.dump(RouteNetlinkMessage::GetRoute(request))?;
            Ok(records
                .iter()
                .filter_map(|record| match record {
                    RouteNetlinkMessage::NewRoute(route) => decode_route(route),
                    _ => None,
                })
                .filter(|route| family.is_none_or(|f| route.family() == f))
                .collect())
        }

        #[instrument(skip(self), fields(route = %route))]
        fn add_route(&mut self, route: &KernelRoute) -> Result<()> {
            self.mutate(
                "add route",
                RouteNetlinkMessage::NewRoute(encode_route(route, false)),
                NLM_F_CREATE | NLM_F_EXCL,
            )
        }

        #[instrument(skip(self), fields(route = %route))]
        fn replace_route(&mut self, route: &KernelRoute) -> Result<()> {
            self.mutate(
                "replace route",
                RouteNetlinkMessage::NewRoute(encode_route(route, false)),
                NLM_F_CREATE | NLM_F_REPLACE,
            )
        }

        #[instrument(skip(self), fields(route = %route))]
        fn delete_route(&mut self, route: &KernelRoute) -> Result<()> {
            self.mutate(
                "delete route",
                RouteNetlinkMessage::DelRoute(encode_route(route, true)),
                0,
            )
        }

        fn reopen(&mut self) -> Result<()> {
            warn!("Reopening netlink request socket");
            self.socket = Self::connect(self.timeout)?;
            Ok(())
        }
    }

    /// Multicast notification socket.
    pub struct EventStream {
        socket: Socket,
    }

    impl EventStream {
        #[instrument]
        pub fn open() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| netlink_err("Failed to create socket", e))?;
            let groups = NOTIFICATION_GROUPS
                .iter()
                .fold(0u32, |mask, group| mask | (1 << (group - 1)));
            socket
                .bind(&SocketAddr::new(0, groups))
                .map_err(|e| netlink_err("Failed to bind socket", e))?;

            let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
            if let Err(e) = set_socket_option(&socket, libc::SOL_SOCKET, libc::SO_RCVBUF, &size) {
                warn!(error = %e, "Failed to set SO_RCVBUF, using default buffer size");
            }
            // ENOBUFS stays enabled: it is how we learn notifications were lost.
            set_receive_timeout(&socket, EVENT_POLL_INTERVAL)?;

            debug!(groups, "Netlink notification socket bound");
            Ok(Self { socket })
        }

        /// Blocks for up to one poll interval; an empty batch means nothing
        /// arrived. An error means notifications may have been lost.
        pub fn next_events(&mut self) -> Result<Vec<KernelEvent>> {
            let buf = match self.socket.recv_from_full() {
                Ok((buf, _)) => buf,
                Err(e) if is_timeout(&e) => return Ok(Vec::new()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
                Err(e) => return Err(netlink_err("Failed to receive notification", e)),
            };
            let events: Vec<KernelEvent> = parse_messages(&buf)?
                .iter()
                .filter_map(decode_event)
                .collect();
            trace!(count = events.len(), "Received kernel events");
            Ok(events)
        }
    }

}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Stand-in for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod mock {
    use crate::channel::RouteChannel;
    use crate::error::{DefaultconfError, Result};
    use crate::types::{AddressState, KernelEvent, KernelRoute, LinkState};
    use defaultconf_types::AddressFamily;
    use std::time::Duration;

    fn unsupported() -> DefaultconfError {
        DefaultconfError::Netlink("route netlink is only available on Linux".to_string())
    }

    pub struct NetlinkChannel;

    impl NetlinkChannel {
        pub fn open(_timeout: Duration) -> Result<Self> {
            Err(unsupported())
        }
    }

    impl RouteChannel for NetlinkChannel {
        fn dump_links(&mut self) -> Result<Vec<LinkState>> {
            Err(unsupported())
        }

        fn dump_addresses(&mut self) -> Result<Vec<AddressState>> {
            Err(unsupported())
        }

        fn dump_routes(&mut self, _family: Option<AddressFamily>) -> Result<Vec<KernelRoute>> {
            Err(unsupported())
        }

        fn add_route(&mut self, _route: &KernelRoute) -> Result<()> {
            Err(unsupported())
        }

        fn replace_route(&mut self, _route: &KernelRoute) -> Result<()> {
            Err(unsupported())
        }

        fn delete_route(&mut self, _route: &KernelRoute) -> Result<()> {
            Err(unsupported())
        }

        fn reopen(&mut self) -> Result<()> {
            Err(unsupported())
        }
    }

    pub struct EventStream;

    impl EventStream {
        pub fn open() -> Result<Self> {
            Err(unsupported())
        }

        pub fn next_events(&mut self) -> Result<Vec<KernelEvent>> {
            Err(unsupported())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
