//! Interface table assembly.
//!
//! Built once at startup and never mutated afterwards: filter coalescing,
//! per-family participation, and the peer lists each bridge worker fans out
//! to. Workers share the result through an `Arc` with no locking.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{info, warn};

use mb_dns::FilterList;

use crate::config::Config;
use crate::net::OsInterface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        })
    }
}

/// One configured interface after validation against the OS.
#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub if_index: u32,
    /// Selected address per family; `None` when the family is disabled or
    /// the interface has no usable address.
    pub addr: [Option<IpAddr>; 2],
    pub inbound_filter: Option<Arc<FilterList>>,
    pub outbound_filter: Option<Arc<FilterList>>,
}

/// One interface's place on a family bridge: the peers it forwards to, the
/// distinct outbound filters among them (so the encoder runs once per filter,
/// not once per peer), and how many peers take unfiltered packets.
#[derive(Debug)]
pub struct Member {
    pub iface: Arc<Interface>,
    pub peers: Vec<usize>,
    pub peer_filters: Vec<Arc<FilterList>>,
    pub peer_nofilter_count: usize,
}

/// Everything the bridge workers read, assembled before they start.
#[derive(Debug)]
pub struct Runtime {
    pub filtering_enabled: bool,
    pub global_filter: Option<Arc<FilterList>>,
    pub interfaces: Vec<Arc<Interface>>,
    pub families: [Vec<Member>; 2],
}

/// Combine the parsed configuration with the validated OS interface data
/// into the runtime tables.
pub fn build_runtime(config: Config, os: Vec<OsInterface>) -> Result<Runtime> {
    let global_filter = config.global_filter.map(Arc::new);

    // Coalesce structurally identical filter lists so that peers sharing a
    // filter share one encoder pass (compared by pointer later).
    let mut interfaces: Vec<Arc<Interface>> = Vec::with_capacity(config.interfaces.len());
    for (iface_config, os_iface) in config.interfaces.into_iter().zip(&os) {
        let inbound_filter = iface_config.inbound_filter.and_then(|list| {
            if global_filter.as_deref() == Some(&list) {
                info!(
                    "interface {} inbound filter discarded (duplicate of the global filter)",
                    iface_config.name
                );
                return None;
            }
            Some(coalesce(list, interfaces.iter().map(|i| &i.inbound_filter)))
        });
        let outbound_filter = iface_config
            .outbound_filter
            .map(|list| coalesce(list, interfaces.iter().map(|i| &i.outbound_filter)));

        let mut addr = [None; 2];
        for family in Family::ALL {
            let found = os_iface.addr[family.index()];
            if iface_config.disabled[family.index()] {
                continue;
            }
            if found.is_none() {
                warn!(
                    "interface {:?} does not have an {} address (disabled)",
                    iface_config.name, family
                );
            }
            addr[family.index()] = found;
        }

        interfaces.push(Arc::new(Interface {
            name: iface_config.name,
            if_index: os_iface.if_index,
            addr,
            inbound_filter,
            outbound_filter,
        }));
    }

    // Per family, an interface participates when it has an address, and a
    // family needs at least two participants to bridge anything.
    let mut families: [Vec<Member>; 2] = [Vec::new(), Vec::new()];
    for family in Family::ALL {
        let members: Vec<Arc<Interface>> = interfaces
            .iter()
            .filter(|iface| iface.addr[family.index()].is_some())
            .cloned()
            .collect();

        if members.len() == 1 {
            warn!(
                "interface {:?} does not have any {} peers (disabled)",
                members[0].name, family
            );
            continue;
        }

        families[family.index()] = members
            .iter()
            .enumerate()
            .map(|(index, iface)| {
                let peers: Vec<usize> =
                    (0..members.len()).filter(|&peer| peer != index).collect();

                let mut peer_filters: Vec<Arc<FilterList>> = Vec::new();
                let mut peer_nofilter_count = 0;
                for &peer in &peers {
                    match &members[peer].outbound_filter {
                        Some(filter) => {
                            if !peer_filters.iter().any(|f| Arc::ptr_eq(f, filter)) {
                                peer_filters.push(filter.clone());
                            }
                        }
                        None => peer_nofilter_count += 1,
                    }
                }

                Member {
                    iface: iface.clone(),
                    peers,
                    peer_filters,
                    peer_nofilter_count,
                }
            })
            .collect();
    }

    if families.iter().all(|members| members.is_empty()) {
        bail!("no active IPv4 or IPv6 interfaces");
    }

    Ok(Runtime {
        filtering_enabled: config.filtering_enabled,
        global_filter,
        interfaces,
        families,
    })
}

/// Reuse an earlier interface's `Arc` when `list` is structurally equal to
/// it, so identical filters become pointer-identical.
fn coalesce<'a>(
    list: FilterList,
    existing: impl Iterator<Item = &'a Option<Arc<FilterList>>>,
) -> Arc<FilterList> {
    for candidate in existing.flatten() {
        if **candidate == list {
            return candidate.clone();
        }
    }
    Arc::new(list)
}
