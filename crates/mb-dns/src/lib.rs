//! DNS wire codec and name filtering for the mDNS bridge.
//!
//! The bridge never routes packets: every datagram received on one interface
//! is decoded (with name compression expanded), filtered, and re-encoded from
//! scratch before being sent out the peer interfaces. This crate holds that
//! pipeline: decoded names and match names, allow/deny filter lists, the
//! packet decoder with inbound filtering, and the packet encoder that rebuilds
//! name compression per outgoing packet.
//!
//! All per-packet work runs against a reusable [`DnsState`], one per bridge
//! worker, so the hot path performs no allocations after warmup.

pub mod decode;
pub mod encode;
pub mod filter;
pub mod name;

pub use decode::{DnsState, PacketError, Section};
pub use filter::{FilterList, FilterMode, InboundFilters, allowed_outbound};
pub use name::{DnsName, MatchName, MatchNameError};

/// Maximum mDNS datagram size per RFC 6762 §18. The limit includes the IP and
/// UDP headers, so actual payloads are smaller.
pub const MAX_PACKET_SIZE: usize = 9000;

// DNS record types that appear in mDNS traffic.
pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_HINFO: u16 = 13;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_DNAME: u16 = 39;
pub const TYPE_OPT: u16 = 41;
pub const TYPE_NSEC: u16 = 47;
pub const TYPE_SVCB: u16 = 64;
pub const TYPE_HTTPS: u16 = 65;
pub const TYPE_ANY: u16 = 255;
