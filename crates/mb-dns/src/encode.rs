//! DNS packet encoding with name compression rebuilt from scratch.
//!
//! The compression dictionary is a tree keyed by labels walking the name
//! right to left, stored as a flat array with u16 child ranges so ranges can
//! be moved when they fill up without invalidating references. Every label
//! written to the outgoing packet is registered with its pointer-form offset;
//! later names reuse the longest suffix already present.

use crate::decode::{DnsState, HEADER_LEN, QUERY_FIXED_LEN, RR_FIXED_LEN};
use crate::filter::{FilterList, allowed_outbound};
use crate::name::DnsName;
use crate::{TYPE_ANY, TYPE_CNAME, TYPE_DNAME, TYPE_HINFO, TYPE_NSEC, TYPE_PTR, TYPE_SRV, TYPE_TXT};

// One label with its leading length byte.
const LABEL_STORE: usize = 64;

const LOCAL_LABEL: &[u8] = b"\x05local";
const TCP_LABEL: &[u8] = b"\x04_tcp";

// Seed entries plus reserved child slots (see `Compressor::reset`).
const SEED_LEN: usize = 8;

#[derive(Clone)]
struct CompressionEntry {
    label: [u8; LABEL_STORE],
    child_index: u16,
    child_allocated: u16,
    child_used: u16,
    /// Pointer-form offset (`0xC000 | position`) of this label's first write
    /// into the current packet; 0 while it has not been written.
    pointer: u16,
}

impl Default for CompressionEntry {
    fn default() -> Self {
        CompressionEntry {
            label: [0; LABEL_STORE],
            child_index: 0,
            child_allocated: 0,
            child_used: 0,
            pointer: 0,
        }
    }
}

impl CompressionEntry {
    fn label(&self) -> &[u8] {
        &self.label[..1 + self.label[0] as usize]
    }

    fn set_label(&mut self, label: &[u8]) {
        self.label[..label.len()].copy_from_slice(label);
    }
}

fn pointer_to(offset: usize) -> u16 {
    0xC000 | (offset as u16 & 0x3FFF)
}

pub(crate) struct Compressor {
    entries: Vec<CompressionEntry>,
}

impl Compressor {
    pub(crate) fn new() -> Compressor {
        Compressor {
            entries: Vec::with_capacity(SEED_LEN * 16),
        }
    }

    /// Reset for a new packet, reinstating the seeded `local` / `_tcp.local`
    /// suffixes with cleared positions. The reserved child slots mean typical
    /// mDNS traffic never has to move a child range.
    fn reset(&mut self) {
        self.entries.clear();
        self.entries.resize(SEED_LEN, CompressionEntry::default());

        // 0: root, with "local" as its only child.
        self.entries[0].child_index = 1;
        self.entries[0].child_allocated = 1;
        self.entries[0].child_used = 1;

        // 1: "local", with "_tcp" present and one spare slot at 2..4.
        self.entries[1].set_label(LOCAL_LABEL);
        self.entries[1].child_index = 2;
        self.entries[1].child_allocated = 2;
        self.entries[1].child_used = 1;

        // 2: "_tcp", with four reserved child slots at 4..8.
        self.entries[2].set_label(TCP_LABEL);
        self.entries[2].child_index = 4;
        self.entries[2].child_allocated = 4;
        self.entries[2].child_used = 0;
    }

    /// Insert `count` blank entries at `index`, shifting later entries and
    /// fixing up every child range that points at or past the spot.
    fn open(&mut self, index: usize, count: usize) -> usize {
        if index < self.entries.len() {
            for entry in self.entries.iter_mut() {
                if entry.child_index as usize >= index {
                    entry.child_index += count as u16;
                }
            }
            self.entries.splice(
                index..index,
                std::iter::repeat_with(CompressionEntry::default).take(count),
            );
        } else {
            self.entries
                .resize(self.entries.len() + count, CompressionEntry::default());
        }
        index
    }

    /// Find `label` among `parent`'s children, adding it (and growing the
    /// child range, doubling each time) when absent.
    fn get_child(&mut self, parent: usize, label: &[u8]) -> usize {
        let start = self.entries[parent].child_index as usize;
        let used = self.entries[parent].child_used as usize;
        for index in start..start + used {
            if self.entries[index].label() == label {
                return index;
            }
        }

        if self.entries[parent].child_allocated == 0 {
            self.entries[parent].child_index = self.entries.len() as u16;
        }

        let mut index =
            (self.entries[parent].child_index + self.entries[parent].child_used) as usize;
        if self.entries[parent].child_used >= self.entries[parent].child_allocated {
            let count = (self.entries[parent].child_allocated as usize).max(1);
            index = self.open(index, count);
            self.entries[parent].child_allocated += count as u16;
        }

        self.entries[parent].child_used += 1;
        self.entries[index].set_label(label);
        index
    }

    /// Append `name` at the current end of `out`, compressed against
    /// everything already written to this packet.
    fn encode_name(&mut self, out: &mut Vec<u8>, name: &DnsName) {
        // The root label alone cannot be compressed.
        if name.label_count() <= 1 {
            out.push(0);
            return;
        }

        let mut parent = 0;
        let mut remaining = name.label_count() - 1;
        let (mut child, mut name_index);

        // Walk right to left while the suffix is already in the packet.
        loop {
            remaining -= 1;
            name_index = remaining;
            child = self.get_child(parent, name.label(name_index));

            if self.entries[child].pointer == 0 {
                // First label not yet in the packet: everything from here
                // leftward gets written out verbatim below.
                break;
            }

            if remaining == 0 {
                // The whole name is already present; a single pointer does.
                let pointer = self.entries[child].pointer;
                out.extend_from_slice(&pointer.to_be_bytes());
                return;
            }

            parent = child;
        }

        let ancestor = parent;
        let base = out.len();

        // Labels 0..=name_index verbatim, registering each write position.
        let copy_len = name.label_offset(name_index) + name.label(name_index).len();
        out.extend_from_slice(&name.wire()[..copy_len]);
        self.entries[child].pointer = pointer_to(base + name.label_offset(name_index));

        while remaining > 0 {
            remaining -= 1;
            parent = child;
            name_index = remaining;
            child = self.get_child(parent, name.label(name_index));
            self.entries[child].pointer = pointer_to(base + name.label_offset(name_index));
        }

        // Close with a pointer to the matched ancestor suffix, or the root.
        if self.entries[ancestor].pointer != 0 {
            let pointer = self.entries[ancestor].pointer;
            out.extend_from_slice(&pointer.to_be_bytes());
        } else {
            out.push(0);
        }
    }
}

impl DnsState {
    /// Re-encode the records that survived the last decode into `out`,
    /// applying `filter` to the types it governs and rebuilding name
    /// compression from scratch. Returns false when every section filtered
    /// down to zero, in which case no datagram should be sent.
    pub fn encode(&mut self, recv: &[u8], out: &mut Vec<u8>, filter: Option<&FilterList>) -> bool {
        use crate::decode::Section;

        let query_total = self.query_count;
        let rr_index = self.rr_index;
        let rr_count = self.rr_count;
        let DnsState {
            queries,
            rrs,
            compressor,
            ..
        } = self;

        compressor.reset();
        out.clear();
        out.resize(HEADER_LEN, 0);

        let mut kept_queries: u16 = 0;
        for query in &queries[..query_total] {
            let allowed = match query.qtype {
                TYPE_SRV | TYPE_TXT | TYPE_ANY => allowed_outbound(filter, &query.name),
                _ => true,
            };
            if !allowed {
                continue;
            }

            compressor.encode_name(out, &query.name);
            out.extend_from_slice(&recv[query.data_off..query.data_off + QUERY_FIXED_LEN]);
            kept_queries += 1;
        }

        let mut kept_rrs = [0u16; 3];
        for section in Section::ALL {
            let s = section.index();
            for rr in &rrs[rr_index[s]..rr_index[s] + rr_count[s]] {
                let allowed = match rr.rtype {
                    TYPE_SRV | TYPE_TXT | TYPE_HINFO => allowed_outbound(filter, &rr.name),
                    TYPE_PTR | TYPE_CNAME | TYPE_DNAME => {
                        allowed_outbound(filter, &rr.rdata_name)
                    }
                    _ => true,
                };
                if !allowed {
                    continue;
                }

                compressor.encode_name(out, &rr.name);

                // Type, class and ttl come over verbatim; the rdata length
                // is patched once the RDATA has been written.
                let header_at = out.len();
                out.extend_from_slice(&recv[rr.header_off..rr.header_off + 8]);
                out.extend_from_slice(&[0, 0]);

                let rdata_at = out.len();
                let rdata_off = rr.header_off + RR_FIXED_LEN;
                match rr.rtype {
                    TYPE_PTR | TYPE_CNAME | TYPE_DNAME => {
                        compressor.encode_name(out, &rr.rdata_name);
                    }
                    TYPE_SRV => {
                        out.extend_from_slice(&recv[rdata_off..rdata_off + rr.secondary_len]);
                        compressor.encode_name(out, &rr.rdata_name);
                    }
                    TYPE_NSEC => {
                        compressor.encode_name(out, &rr.rdata_name);
                        let tail = rdata_off + rr.rdata_len - rr.secondary_len;
                        out.extend_from_slice(&recv[tail..tail + rr.secondary_len]);
                    }
                    _ => {
                        out.extend_from_slice(&recv[rdata_off..rdata_off + rr.rdata_len]);
                    }
                }

                let rdata_len = (out.len() - rdata_at) as u16;
                out[header_at + 8..header_at + 10].copy_from_slice(&rdata_len.to_be_bytes());
                kept_rrs[s] += 1;
            }
        }

        if kept_queries == 0 && kept_rrs == [0, 0, 0] {
            return false;
        }

        // Transaction id and flags carry over unchanged; the counts reflect
        // what survived.
        out[..4].copy_from_slice(&recv[..4]);
        out[4..6].copy_from_slice(&kept_queries.to_be_bytes());
        out[6..8].copy_from_slice(&kept_rrs[0].to_be_bytes());
        out[8..10].copy_from_slice(&kept_rrs[1].to_be_bytes());
        out[10..12].copy_from_slice(&kept_rrs[2].to_be_bytes());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{header, push_query, push_rr, wire_name};
    use crate::decode::{Section, decode_name};
    use crate::filter::{FilterMode, InboundFilters};
    use crate::{MAX_PACKET_SIZE, TYPE_A, TYPE_AAAA, TYPE_TXT};
    use proptest::prelude::*;

    fn allow(names: &[&str]) -> FilterList {
        FilterList::new(
            FilterMode::Allow,
            names.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    fn decode_ok(state: &mut DnsState, buf: &[u8]) {
        assert!(state.decode(buf, InboundFilters::default()).unwrap());
    }

    /// Decode `buf` and collect every name in it, queries and RRs alike,
    /// so differently-compressed encodings can be compared semantically.
    fn names_of(buf: &[u8]) -> Vec<String> {
        let mut state = DnsState::new(false);
        decode_ok(&mut state, buf);
        let mut names: Vec<String> = (0..state.query_count())
            .map(|i| state.queries[i].name.to_string())
            .collect();
        for section in Section::ALL {
            let s = section.index();
            for i in state.rr_index[s]..state.rr_index[s] + state.rr_count[s] {
                names.push(state.rrs[i].name.to_string());
            }
        }
        names
    }

    #[test]
    fn single_query_roundtrips() {
        let mut buf = header(1, 0, 0, 0);
        push_query(&mut buf, "_http._tcp.local", crate::TYPE_PTR);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);
        let mut out = Vec::new();
        assert!(state.encode(&buf, &mut out, None));

        // Nothing to compress against: the packet reproduces byte for byte.
        assert_eq!(out, buf);
    }

    #[test]
    fn repeated_owner_compresses_to_pointer() {
        let mut buf = header(0, 2, 0, 0);
        push_rr(&mut buf, "host.local", TYPE_A, &[10, 0, 0, 1]);
        push_rr(&mut buf, "host.local", TYPE_AAAA, &[0x20; 16]);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);
        let mut out = Vec::new();
        assert!(state.encode(&buf, &mut out, None));

        // The second owner is a single pointer to the first at offset 12.
        assert!(out.len() < buf.len());
        let second_owner = HEADER_LEN + 12 + RR_FIXED_LEN + 4;
        assert_eq!(&out[second_owner..second_owner + 2], &[0xC0, 12]);

        let mut redecoded = DnsState::new(false);
        decode_ok(&mut redecoded, &out);
        assert_eq!(redecoded.rr_count(Section::Answer), 2);
        assert_eq!(redecoded.rrs[0].name.to_string(), "host.local");
        assert_eq!(redecoded.rrs[1].name.to_string(), "host.local");
    }

    #[test]
    fn shared_suffix_compresses_to_ancestor_pointer() {
        let mut buf = header(2, 0, 0, 0);
        push_query(&mut buf, "_http._tcp.local", crate::TYPE_PTR);
        push_query(&mut buf, "_ipp._tcp.local", crate::TYPE_PTR);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);
        let mut out = Vec::new();
        assert!(state.encode(&buf, &mut out, None));

        // The second query writes "_ipp" then points at "_tcp.local".
        let second = HEADER_LEN + 18 + QUERY_FIXED_LEN;
        assert_eq!(&out[second..second + 5], b"\x04_ipp");
        assert_eq!(&out[second + 5..second + 7], &[0xC0, (HEADER_LEN + 6) as u8]);
        assert_eq!(names_of(&out), names_of(&buf));
    }

    #[test]
    fn pointers_always_point_backwards() {
        let mut buf = header(2, 2, 0, 0);
        push_query(&mut buf, "_services._dns-sd._udp.local", crate::TYPE_PTR);
        push_query(&mut buf, "_http._tcp.local", crate::TYPE_PTR);
        push_rr(
            &mut buf,
            "_http._tcp.local",
            crate::TYPE_PTR,
            &wire_name("printer._http._tcp.local"),
        );
        push_rr(&mut buf, "printer._http._tcp.local", TYPE_A, &[10, 0, 0, 9]);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);
        let mut out = Vec::new();
        assert!(state.encode(&buf, &mut out, None));

        // Walk every name in the re-encoded packet and check each pointer.
        let mut offset = HEADER_LEN;
        let mut scratch = DnsName::default();
        for _ in 0..2 {
            let pointer_check = check_pointers(&out, offset);
            assert!(pointer_check);
            offset = decode_name(&out, offset, &mut scratch).unwrap() + QUERY_FIXED_LEN;
        }
        for _ in 0..2 {
            assert!(check_pointers(&out, offset));
            offset = decode_name(&out, offset, &mut scratch).unwrap();
            let rdata_len = u16::from_be_bytes([out[offset + 8], out[offset + 9]]) as usize;
            offset += RR_FIXED_LEN + rdata_len;
        }
        assert_eq!(offset, out.len());
    }

    fn check_pointers(buf: &[u8], mut offset: usize) -> bool {
        loop {
            let len = buf[offset] as usize;
            if len & 0xC0 == 0xC0 {
                let target = (len & 0x3F) << 8 | buf[offset + 1] as usize;
                return target < offset;
            }
            if len == 0 {
                return true;
            }
            offset += len + 1;
        }
    }

    #[test]
    fn unfiltered_reencode_preserves_section_counts() {
        let mut buf = header(1, 1, 0, 2);
        push_query(&mut buf, "_http._tcp.local", crate::TYPE_PTR);
        push_rr(
            &mut buf,
            "_http._tcp.local",
            crate::TYPE_PTR,
            &wire_name("printer._http._tcp.local"),
        );
        push_rr(&mut buf, "host.local", TYPE_A, &[10, 0, 0, 1]);
        push_rr(&mut buf, "host.local", TYPE_AAAA, &[0x20; 16]);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);
        let mut out = Vec::new();
        assert!(state.encode(&buf, &mut out, None));

        let mut redecoded = DnsState::new(false);
        decode_ok(&mut redecoded, &out);
        assert_eq!(redecoded.query_count(), 1);
        assert_eq!(redecoded.rr_count(Section::Answer), 1);
        assert_eq!(redecoded.rr_count(Section::Authority), 0);
        assert_eq!(redecoded.rr_count(Section::Additional), 2);
        // Transaction id and flags carry over.
        assert_eq!(&out[..4], &buf[..4]);
    }

    #[test]
    fn srv_survives_allow_filter_on_owner_suffix() {
        // SRV answer for printer._http._tcp.local with target host.local,
        // under an outbound allow filter for _http._tcp.local.
        let mut rdata = vec![0, 0, 0, 0, 0x1F, 0x91];
        rdata.extend_from_slice(&wire_name("host.local"));
        let mut buf = header(0, 1, 0, 0);
        push_rr(&mut buf, "printer._http._tcp.local", TYPE_SRV, &rdata);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);

        let filter = allow(&["_http._tcp.local"]);
        let mut filtered = Vec::new();
        assert!(state.encode(&buf, &mut filtered, Some(&filter)));
        let mut plain = Vec::new();
        assert!(state.encode(&buf, &mut plain, None));

        for out in [&filtered, &plain] {
            let mut redecoded = DnsState::new(false);
            decode_ok(&mut redecoded, out);
            assert_eq!(redecoded.rr_count(Section::Answer), 1);
            assert_eq!(redecoded.rrs[0].rdata_name.to_string(), "host.local");
            // The priority/weight/port block is carried verbatim.
            let rdata_off = out.len() - redecoded.rrs[0].rdata_len;
            assert_eq!(&out[rdata_off..rdata_off + 6], &[0, 0, 0, 0, 0x1F, 0x91]);
        }
    }

    #[test]
    fn outbound_filter_can_drop_everything() {
        let mut buf = header(1, 0, 0, 0);
        push_query(&mut buf, "printer._ipp._tcp.local", TYPE_TXT);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);

        let filter = allow(&["_http._tcp.local"]);
        let mut out = Vec::new();
        assert!(!state.encode(&buf, &mut out, Some(&filter)));
    }

    #[test]
    fn outbound_filter_leaves_passthrough_types_alone() {
        let mut buf = header(1, 1, 0, 0);
        push_query(&mut buf, "printer._ipp._tcp.local", crate::TYPE_PTR);
        push_rr(&mut buf, "printer._ipp._tcp.local", TYPE_A, &[10, 0, 0, 1]);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);

        // PTR queries and A records are not outbound-filtered.
        let filter = allow(&["_http._tcp.local"]);
        let mut out = Vec::new();
        assert!(state.encode(&buf, &mut out, Some(&filter)));
        let mut redecoded = DnsState::new(false);
        decode_ok(&mut redecoded, &out);
        assert_eq!(redecoded.query_count(), 1);
        assert_eq!(redecoded.rr_count(Section::Answer), 1);
    }

    #[test]
    fn compressed_rdata_expands_and_reencodes() {
        // PTR record whose RDATA is a bare pointer back to the owner name at
        // offset 12.
        let mut buf = header(0, 1, 0, 0);
        push_rr(
            &mut buf,
            "_services._dns-sd._udp.local",
            crate::TYPE_PTR,
            &[0xC0, 12],
        );

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);
        assert_eq!(
            state.rrs[0].rdata_name.to_string(),
            "_services._dns-sd._udp.local"
        );

        let mut out = Vec::new();
        assert!(state.encode(&buf, &mut out, None));
        let mut redecoded = DnsState::new(false);
        decode_ok(&mut redecoded, &out);
        assert_eq!(
            redecoded.rrs[0].rdata_name.to_string(),
            "_services._dns-sd._udp.local"
        );
    }

    #[test]
    fn nsec_rdata_keeps_bitmap_after_name() {
        let mut rdata = wire_name("host.local");
        rdata.extend_from_slice(&[0x00, 0x04, 0x40, 0x00, 0x00, 0x08]);
        let mut buf = header(0, 0, 0, 1);
        push_rr(&mut buf, "host.local", TYPE_NSEC, &rdata);

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);
        let mut out = Vec::new();
        assert!(state.encode(&buf, &mut out, None));

        // The bitmap tail survives re-encoding; the name now compresses
        // against the owner, so the RDATA shrinks but ends identically.
        assert_eq!(&out[out.len() - 6..], &[0x00, 0x04, 0x40, 0x00, 0x00, 0x08]);
        let mut redecoded = DnsState::new(false);
        decode_ok(&mut redecoded, &out);
        assert_eq!(redecoded.rrs[0].secondary_len, 6);
        assert_eq!(redecoded.rrs[0].rdata_name.to_string(), "host.local");
    }

    #[test]
    fn encode_is_stable_across_reencoding() {
        let mut buf = header(1, 2, 0, 0);
        push_query(&mut buf, "_http._tcp.local", crate::TYPE_PTR);
        push_rr(
            &mut buf,
            "_http._tcp.local",
            crate::TYPE_PTR,
            &wire_name("printer._http._tcp.local"),
        );
        push_rr(&mut buf, "printer._http._tcp.local", TYPE_TXT, b"\x04path");

        let mut state = DnsState::new(false);
        decode_ok(&mut state, &buf);
        let mut once = Vec::new();
        assert!(state.encode(&buf, &mut once, None));

        let mut state2 = DnsState::new(false);
        decode_ok(&mut state2, &once);
        let mut twice = Vec::new();
        assert!(state2.encode(&once, &mut twice, None));

        // A packet the encoder produced re-encodes to itself.
        assert_eq!(once, twice);
        assert!(once.len() <= MAX_PACKET_SIZE);
    }

    proptest! {
        // Random single-name packets round-trip through decode + encode
        // whatever the label bytes are.
        #[test]
        fn random_names_survive_the_pipeline(
            labels in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..=20), 1..=8)
        ) {
            let mut wire = Vec::new();
            for label in &labels {
                wire.push(label.len() as u8);
                wire.extend_from_slice(label);
            }
            wire.push(0);

            let mut buf = header(0, 1, 0, 0);
            buf.extend_from_slice(&wire);
            buf.extend_from_slice(&TYPE_A.to_be_bytes());
            buf.extend_from_slice(&1u16.to_be_bytes());
            buf.extend_from_slice(&120u32.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&[10, 0, 0, 1]);

            let mut state = DnsState::new(false);
            prop_assert!(state.decode(&buf, InboundFilters::default()).unwrap());
            let mut out = Vec::new();
            prop_assert!(state.encode(&buf, &mut out, None));

            let mut redecoded = DnsState::new(false);
            prop_assert!(redecoded.decode(&out, InboundFilters::default()).unwrap());
            prop_assert_eq!(redecoded.rrs[0].name.wire(), &wire[..]);
        }
    }
}
