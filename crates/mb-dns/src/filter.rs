//! Allow/deny name filtering.

use crate::name::{DnsName, MatchName, MatchNameError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Allow,
    Deny,
}

/// An ordered, duplicate-free set of match names with an allow or deny mode.
///
/// Construction sorts and deduplicates the configured strings, so two lists
/// naming the same entries in different order compare equal; the bridge uses
/// that to coalesce structurally identical filters at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterList {
    mode: FilterMode,
    names: Vec<MatchName>,
}

impl FilterList {
    pub fn new(mode: FilterMode, mut names: Vec<String>) -> Result<FilterList, MatchNameError> {
        names.sort();
        names.dedup();
        let names = names
            .iter()
            .map(|name| MatchName::build(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterList { mode, names })
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn names(&self) -> &[MatchName] {
        &self.names
    }

    /// Whether `name` passes this list. A match on any member allows under
    /// ALLOW and denies under DENY; no match inverts that, so an empty list
    /// is deny-all under ALLOW and allow-all under DENY.
    pub fn allowed(&self, name: &DnsName) -> bool {
        let matched = self.names.iter().any(|m| name.contains(m));
        matched == (self.mode == FilterMode::Allow)
    }
}

/// The inbound decision for one interface: the global list and the interface
/// list must both pass. An absent list passes everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct InboundFilters<'a> {
    pub global: Option<&'a FilterList>,
    pub interface: Option<&'a FilterList>,
}

impl InboundFilters<'_> {
    pub fn allowed(&self, name: &DnsName) -> bool {
        self.global.is_none_or(|list| list.allowed(name))
            && self.interface.is_none_or(|list| list.allowed(name))
    }
}

/// The outbound decision for one peer filter. An absent filter passes.
pub fn allowed_outbound(filter: Option<&FilterList>, name: &DnsName) -> bool {
    filter.is_none_or(|list| list.allowed(name))
}
