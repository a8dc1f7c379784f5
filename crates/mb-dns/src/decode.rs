//! DNS packet decoding with inbound filtering.
//!
//! The decoder walks a received datagram once, expanding compressed names
//! into the worker's reusable record lists and dropping entries the inbound
//! filters disallow. Record bodies are not copied: each entry keeps offsets
//! into the receive buffer, which the encoder reads back when rebuilding the
//! outgoing packet.

use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::encode::Compressor;
use crate::filter::InboundFilters;
use crate::name::{DnsName, MAX_LABELS, MAX_NAME_LEN};
use crate::{
    TYPE_A, TYPE_AAAA, TYPE_ANY, TYPE_CNAME, TYPE_DNAME, TYPE_HINFO, TYPE_HTTPS, TYPE_NSEC,
    TYPE_OPT, TYPE_PTR, TYPE_SRV, TYPE_SVCB, TYPE_TXT,
};

/// Fixed DNS header size; compression pointers may not point before it.
pub(crate) const HEADER_LEN: usize = 12;
/// Type and class following a query name.
pub(crate) const QUERY_FIXED_LEN: usize = 4;
/// Type, class, ttl and rdata length following an owner name.
pub(crate) const RR_FIXED_LEN: usize = 10;
/// Priority, weight and port preceding an SRV target name.
pub(crate) const SRV_FIXED_LEN: usize = 6;

// More queries or resource records than a 9000 byte datagram can carry.
const MAX_QUERY_COUNT: usize = 1498;
const MAX_RESOURCE_COUNT: usize = 749;

const INITIAL_QUERY_COUNT: usize = 25;
const INITIAL_RESOURCE_COUNT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

impl Section {
    pub const ALL: [Section; 3] = [Section::Answer, Section::Authority, Section::Additional];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Section::Answer => "answer",
            Section::Authority => "authority",
            Section::Additional => "additional",
        })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too small for a DNS header")]
    HeaderTooShort,
    #[error("bad label pointer in a name")]
    BadPointer,
    #[error("reserved label type in a name")]
    BadLabel,
    #[error("too many labels in a name")]
    TooManyLabels,
    #[error("name overrun")]
    NameOverrun,
    #[error("too many queries ({0})")]
    TooManyQueries(usize),
    #[error("too many resource records ({0})")]
    TooManyRecords(usize),
    #[error("malformed query")]
    MalformedQuery,
    #[error("malformed {0} record")]
    MalformedRecord(Section),
    #[error("invalid rdata length in {0} record")]
    BadRdataLength(Section),
    #[error("rdata name corruption in {0} record")]
    RdataNameMismatch(Section),
    #[error("decoded length does not match packet length")]
    LengthMismatch,
}

/// Decode (decompress) a label sequence starting at `packet_offset`, writing
/// into `name`. Returns the offset of the first byte after the name on the
/// wire; pointer hops past the first do not advance it.
pub(crate) fn decode_name(
    buf: &[u8],
    packet_offset: usize,
    name: &mut DnsName,
) -> Result<usize, PacketError> {
    let mut packet_offset = packet_offset;
    let mut label_offset = packet_offset;
    let mut compressed = false;
    let mut name_offset = 0;
    let mut label_count = 0;

    loop {
        let len = *buf.get(label_offset).ok_or(PacketError::NameOverrun)? as usize;

        if len & 0xC0 == 0xC0 {
            let low = *buf.get(label_offset + 1).ok_or(PacketError::NameOverrun)? as usize;
            let pointer = (len & 0x3F) << 8 | low;

            // A pointer must land past the header and strictly before the
            // label that referenced it.
            if pointer < HEADER_LEN || pointer >= label_offset {
                return Err(PacketError::BadPointer);
            }

            if !compressed {
                packet_offset += 2;
            }
            compressed = true;
            label_offset = pointer;
            continue;
        }

        // 0b01 / 0b10 label types are reserved.
        if len & 0xC0 != 0 {
            return Err(PacketError::BadLabel);
        }

        name.offsets[label_count] = name_offset as u8;
        label_count += 1;
        if label_count > MAX_LABELS {
            return Err(PacketError::TooManyLabels);
        }

        if len == 0 {
            name.labels[name_offset] = 0;
            name.length = (name_offset + 1) as u16;
            name.count = label_count as u8;
            if !compressed {
                packet_offset += 1;
            }
            return Ok(packet_offset);
        }

        // The +1 keeps room for the terminating empty label.
        let copy_len = len + 1;
        if label_offset + copy_len + 1 > buf.len() || name_offset + copy_len + 1 > MAX_NAME_LEN {
            return Err(PacketError::NameOverrun);
        }

        name.labels[name_offset..name_offset + copy_len]
            .copy_from_slice(&buf[label_offset..label_offset + copy_len]);
        name_offset += copy_len;
        label_offset += copy_len;
        if !compressed {
            packet_offset += copy_len;
        }
    }
}

fn be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[derive(Default)]
pub(crate) struct DecodedQuery {
    pub(crate) name: DnsName,
    pub(crate) qtype: u16,
    /// Offset of the type/class block in the receive buffer.
    pub(crate) data_off: usize,
}

#[derive(Default)]
pub(crate) struct DecodedRr {
    pub(crate) name: DnsName,
    pub(crate) rdata_name: DnsName,
    pub(crate) rtype: u16,
    /// Offset of the fixed RR header in the receive buffer.
    pub(crate) header_off: usize,
    pub(crate) rdata_len: usize,
    /// Bytes of non-name RDATA for mixed-layout types (SRV, NSEC).
    pub(crate) secondary_len: usize,
}

/// Reusable decode/encode state, one per bridge worker.
///
/// Record lists and the compression dictionary grow to the largest packet
/// observed and are never shrunk, so steady-state traffic decodes and
/// re-encodes without allocating.
pub struct DnsState {
    pub(crate) queries: Vec<DecodedQuery>,
    pub(crate) rrs: Vec<DecodedRr>,

    pub(crate) query_count: usize,
    pub(crate) rr_index: [usize; 3],
    pub(crate) rr_count: [usize; 3],
    pub(crate) total_rr_count: usize,

    pub(crate) recv_query_count: usize,
    pub(crate) recv_rr_count: [usize; 3],
    pub(crate) modified: bool,
    pub(crate) warn_unknown: bool,

    pub(crate) compressor: Compressor,
}

impl DnsState {
    /// `warn_unknown` raises the log level for dropped unknown-type records,
    /// which are silent (debug) by default.
    pub fn new(warn_unknown: bool) -> DnsState {
        DnsState {
            queries: Vec::with_capacity(INITIAL_QUERY_COUNT),
            rrs: Vec::with_capacity(INITIAL_RESOURCE_COUNT),
            query_count: 0,
            rr_index: [0; 3],
            rr_count: [0; 3],
            total_rr_count: 0,
            recv_query_count: 0,
            recv_rr_count: [0; 3],
            modified: false,
            warn_unknown,
            compressor: Compressor::new(),
        }
    }

    /// Queries that survived the last decode.
    pub fn query_count(&self) -> usize {
        self.query_count
    }

    /// Records of one section that survived the last decode.
    pub fn rr_count(&self, section: Section) -> usize {
        self.rr_count[section.index()]
    }

    /// Whether the last decode dropped anything. When it did not, the
    /// received bytes can be forwarded verbatim to unfiltered peers.
    pub fn modified(&self) -> bool {
        self.modified
    }

    /// Decode one received datagram, applying inbound filtering as the
    /// sections are walked. `Ok(false)` means every entry was filtered out
    /// and there is nothing to forward; errors describe malformed packets
    /// and drop the datagram.
    pub fn decode(&mut self, buf: &[u8], filters: InboundFilters<'_>) -> Result<bool, PacketError> {
        self.query_count = 0;
        self.rr_index = [0; 3];
        self.rr_count = [0; 3];
        self.total_rr_count = 0;
        self.modified = false;

        let mut offset = self.decode_header(buf)?;
        if self.recv_query_count > 0 {
            offset = self.decode_queries(buf, offset, filters)?;
        }
        for section in Section::ALL {
            if self.recv_rr_count[section.index()] > 0 {
                offset = self.decode_rrs(buf, offset, section, filters)?;
            }
        }

        if offset != buf.len() {
            return Err(PacketError::LengthMismatch);
        }

        Ok(self.query_count != 0 || self.total_rr_count != 0)
    }

    fn decode_header(&mut self, buf: &[u8]) -> Result<usize, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::HeaderTooShort);
        }

        self.recv_query_count = be16(buf, 4) as usize;
        self.recv_rr_count = [
            be16(buf, 6) as usize,
            be16(buf, 8) as usize,
            be16(buf, 10) as usize,
        ];

        if self.recv_query_count > MAX_QUERY_COUNT {
            return Err(PacketError::TooManyQueries(self.recv_query_count));
        }
        let total_rr: usize = self.recv_rr_count.iter().sum();
        if total_rr > MAX_RESOURCE_COUNT {
            return Err(PacketError::TooManyRecords(total_rr));
        }

        if self.queries.len() < self.recv_query_count {
            self.queries.resize_with(self.recv_query_count, Default::default);
        }
        if self.rrs.len() < total_rr {
            self.rrs.resize_with(total_rr, Default::default);
        }

        Ok(HEADER_LEN)
    }

    fn decode_queries(
        &mut self,
        buf: &[u8],
        mut offset: usize,
        filters: InboundFilters<'_>,
    ) -> Result<usize, PacketError> {
        let warn_unknown = self.warn_unknown;

        for _ in 0..self.recv_query_count {
            let query = &mut self.queries[self.query_count];

            offset = decode_name(buf, offset, &mut query.name)?;
            if offset + QUERY_FIXED_LEN > buf.len() {
                return Err(PacketError::MalformedQuery);
            }
            query.qtype = be16(buf, offset);
            query.data_off = offset;
            offset += QUERY_FIXED_LEN;

            let allowed = match query.qtype {
                // Filtered on the owner name.
                TYPE_SRV | TYPE_TXT | TYPE_SVCB | TYPE_HTTPS | TYPE_ANY => {
                    filters.allowed(&query.name)
                }
                // Not filtered.
                TYPE_A | TYPE_AAAA | TYPE_PTR | TYPE_OPT => true,
                // Unknown query types drop the query, not the packet.
                other => {
                    if warn_unknown {
                        warn!("unsupported query type {} (dropped, name {})", other, query.name);
                    } else {
                        debug!("unsupported query type {} (dropped, name {})", other, query.name);
                    }
                    false
                }
            };

            if allowed {
                self.query_count += 1;
            } else {
                self.modified = true;
            }
        }

        Ok(offset)
    }

    fn decode_rrs(
        &mut self,
        buf: &[u8],
        mut offset: usize,
        section: Section,
        filters: InboundFilters<'_>,
    ) -> Result<usize, PacketError> {
        let warn_unknown = self.warn_unknown;
        self.rr_index[section.index()] = self.total_rr_count;

        for _ in 0..self.recv_rr_count[section.index()] {
            let rr = &mut self.rrs[self.total_rr_count];

            offset = decode_name(buf, offset, &mut rr.name)?;
            if offset + RR_FIXED_LEN > buf.len() {
                return Err(PacketError::MalformedRecord(section));
            }
            rr.rtype = be16(buf, offset);
            rr.header_off = offset;
            rr.rdata_len = be16(buf, offset + 8) as usize;
            rr.secondary_len = 0;
            offset += RR_FIXED_LEN;

            if rr.rdata_len == 0 || offset + rr.rdata_len > buf.len() {
                return Err(PacketError::BadRdataLength(section));
            }

            let allowed = match rr.rtype {
                // Filtered on the owner name.
                TYPE_SRV | TYPE_TXT | TYPE_HINFO | TYPE_SVCB | TYPE_HTTPS => {
                    filters.allowed(&rr.name)
                }
                // Filtered on the name in the RDATA section, which must
                // consume the RDATA exactly.
                TYPE_PTR | TYPE_CNAME | TYPE_DNAME => {
                    let end = decode_name(buf, offset, &mut rr.rdata_name)?;
                    if end != offset + rr.rdata_len {
                        return Err(PacketError::RdataNameMismatch(section));
                    }
                    filters.allowed(&rr.rdata_name)
                }
                // Not filtered.
                TYPE_A | TYPE_AAAA | TYPE_OPT | TYPE_NSEC => true,
                // Unknown resource types drop the record, not the packet.
                other => {
                    if warn_unknown {
                        warn!(
                            "unsupported type {} in {} record (dropped, name {})",
                            other, section, rr.name
                        );
                    } else {
                        debug!(
                            "unsupported type {} in {} record (dropped, name {})",
                            other, section, rr.name
                        );
                    }
                    false
                }
            };

            // Kept records with mixed RDATA layouts need the embedded name
            // located so the encoder can recompress it.
            if allowed {
                match rr.rtype {
                    TYPE_SRV => {
                        // Fixed priority/weight/port block, then the target.
                        rr.secondary_len = SRV_FIXED_LEN;
                        let end = decode_name(buf, offset + SRV_FIXED_LEN, &mut rr.rdata_name)?;
                        if end != offset + rr.rdata_len {
                            return Err(PacketError::RdataNameMismatch(section));
                        }
                    }
                    TYPE_NSEC => {
                        // Next-domain name, then an opaque type bitmap.
                        let end = decode_name(buf, offset, &mut rr.rdata_name)?;
                        if end > offset + rr.rdata_len {
                            return Err(PacketError::RdataNameMismatch(section));
                        }
                        rr.secondary_len = rr.rdata_len - (end - offset);
                    }
                    _ => {}
                }
            }

            offset += rr.rdata_len;

            if allowed {
                self.rr_count[section.index()] += 1;
                self.total_rr_count += 1;
            } else {
                self.modified = true;
            }
        }

        Ok(offset)
    }
}
