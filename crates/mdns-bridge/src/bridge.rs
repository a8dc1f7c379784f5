//! The per-family bridge worker.
//!
//! One worker per IP family owns the family's sockets, a receive and a send
//! buffer, and the reusable codec state. It waits for any socket to become
//! readable, pulls one datagram, and fans it out: unfiltered peers get either
//! the original bytes or a single re-encode, and each distinct outbound
//! filter among the peers gets one re-encode shared by every peer carrying
//! that filter.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use futures_util::future::select_all;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use mb_dns::{DnsState, FilterList, InboundFilters, MAX_PACKET_SIZE};

use crate::interface::{Family, Interface};
use crate::net::{MDNS_GROUP_V4, MDNS_GROUP_V6, MDNS_PORT};

/// One interface's socket on this family's bridge, with its fan-out plan.
pub struct Port {
    pub iface: Arc<Interface>,
    pub socket: UdpSocket,
    pub peers: Vec<usize>,
    pub peer_filters: Vec<Arc<FilterList>>,
    pub peer_nofilter_count: usize,
}

pub struct Bridge {
    family: Family,
    ports: Vec<Port>,
    filtering_enabled: bool,
    global_filter: Option<Arc<FilterList>>,
    state: DnsState,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
}

impl Bridge {
    pub fn new(
        family: Family,
        ports: Vec<Port>,
        filtering_enabled: bool,
        global_filter: Option<Arc<FilterList>>,
        warn_unknown: bool,
    ) -> Bridge {
        Bridge {
            family,
            ports,
            filtering_enabled,
            global_filter,
            state: DnsState::new(warn_unknown),
            recv_buf: vec![0; MAX_PACKET_SIZE],
            send_buf: Vec::with_capacity(MAX_PACKET_SIZE),
        }
    }

    /// Wait for any of this family's sockets to become readable, then pull
    /// and forward one datagram from it. Runs until the process exits.
    pub async fn run(mut self) {
        info!(
            "{} bridge running on {} interfaces",
            self.family,
            self.ports.len()
        );

        loop {
            let waits = self.ports.iter().map(|port| Box::pin(port.socket.readable()));
            let (result, index, _) = select_all(waits).await;
            match result {
                Ok(()) => self.receive(index),
                Err(e) => warn!("{} readiness wait failed: {}", self.family, e),
            }
        }
    }

    /// Receive one datagram from the interface behind `ports[index]` and fan
    /// it out to that interface's peers.
    fn receive(&mut self, index: usize) {
        let Bridge {
            family,
            ports,
            filtering_enabled,
            global_filter,
            state,
            recv_buf,
            send_buf,
        } = self;
        let port = &ports[index];

        let (len, src) = match port.socket.try_recv_from(recv_buf) {
            Ok(received) => received,
            // Another wakeup already drained the socket.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("recvfrom error on interface {}: {}", port.iface.name, e);
                return;
            }
        };
        let packet = &recv_buf[..len];

        // With filtering disabled the packet is never decoded; every peer is
        // unfiltered (the configuration forbids the combination) and gets
        // the bytes verbatim.
        let mut decoded = false;
        if *filtering_enabled {
            let filters = InboundFilters {
                global: global_filter.as_deref(),
                interface: port.iface.inbound_filter.as_deref(),
            };
            match state.decode(packet, filters) {
                Ok(true) => decoded = true,
                Ok(false) => {
                    debug!("packet from {} fully filtered inbound", src.ip());
                    return;
                }
                Err(e) => {
                    warn!("host {} error decoding packet: {}", src.ip(), e);
                    return;
                }
            }
        }

        // Peers without an outbound filter share one payload: the received
        // bytes verbatim when inbound filtering changed nothing, otherwise a
        // single filterless re-encode.
        if port.peer_nofilter_count > 0 {
            let payload: &[u8] = if decoded && state.modified() {
                state.encode(packet, send_buf, None);
                &send_buf[..]
            } else {
                packet
            };
            if payload.len() > MAX_PACKET_SIZE {
                warn!(
                    "re-encoded packet from {} exceeds {} bytes (dropped)",
                    src.ip(),
                    MAX_PACKET_SIZE
                );
            } else {
                for &peer_index in &port.peers {
                    let peer = &ports[peer_index];
                    if peer.iface.outbound_filter.is_none() {
                        send_to_peer(*family, peer, payload);
                    }
                }
            }
        }

        // One encoder pass per distinct outbound filter among the peers; the
        // result goes to every peer carrying that filter.
        if decoded {
            for filter in &port.peer_filters {
                if !state.encode(packet, send_buf, Some(filter.as_ref())) {
                    continue;
                }
                if send_buf.len() > MAX_PACKET_SIZE {
                    warn!(
                        "re-encoded packet from {} exceeds {} bytes (dropped)",
                        src.ip(),
                        MAX_PACKET_SIZE
                    );
                    continue;
                }
                for &peer_index in &port.peers {
                    let peer = &ports[peer_index];
                    let carries_filter = peer
                        .iface
                        .outbound_filter
                        .as_ref()
                        .is_some_and(|f| Arc::ptr_eq(f, filter));
                    if carries_filter {
                        send_to_peer(*family, peer, &send_buf[..]);
                    }
                }
            }
        }
    }
}

/// Send one packet out a peer's socket. IPv6 destinations carry the peer's
/// interface index as scope id so the datagram leaves on the right link.
/// Sockets are non-blocking; failures are logged and cost only this peer.
fn send_to_peer(family: Family, peer: &Port, payload: &[u8]) {
    let dst = match family {
        Family::V4 => SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT)),
        Family::V6 => SocketAddr::V6(SocketAddrV6::new(
            MDNS_GROUP_V6,
            MDNS_PORT,
            0,
            peer.iface.if_index,
        )),
    };

    if let Err(e) = peer.socket.try_send_to(payload, dst) {
        warn!("sendto error on interface {}: {}", peer.iface.name, e);
    }
}
