//! Configuration file parsing.
//!
//! The format is INI-like: a mandatory `[global]` section first, then one
//! optional section per bridged interface. Values are plain tokens or comma
//! separated lists, `#` starts a comment, and whitespace around tokens is
//! ignored. The grammar is not TOML (list values are unquoted), so it is
//! parsed by hand.
//!
//! ```text
//! [global]
//! interfaces = eth0, eth1
//! deny-inbound-filters = _ipp._tcp.local
//!
//! [eth1]
//! disable-ipv6 = yes
//! allow-outbound-filters = _http._tcp.local
//! ```

use std::fs;
use std::path::Path;

use thiserror::Error;

use mb_dns::{FilterList, FilterMode};

use crate::interface::Family;

const KEY_INTERFACES: &str = "interfaces";
const KEY_DISABLE_IPV4: &str = "disable-ipv4";
const KEY_DISABLE_IPV6: &str = "disable-ipv6";
const KEY_DISABLE_PACKET_FILTERING: &str = "disable-packet-filtering";
const KEY_ALLOW_INBOUND: &str = "allow-inbound-filters";
const KEY_DENY_INBOUND: &str = "deny-inbound-filters";
const KEY_ALLOW_OUTBOUND: &str = "allow-outbound-filters";
const KEY_DENY_OUTBOUND: &str = "deny-outbound-filters";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to open config file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("{file}: file does not contain [global] as the first section")]
    MissingGlobal { file: String },
    #[error("{file} line {line}: {message}")]
    Invalid {
        file: String,
        line: usize,
        message: String,
    },
}

#[derive(Debug)]
pub struct InterfaceConfig {
    pub name: String,
    pub disabled: [bool; 2],
    pub inbound_filter: Option<FilterList>,
    pub outbound_filter: Option<FilterList>,
}

#[derive(Debug)]
pub struct Config {
    pub interfaces: Vec<InterfaceConfig>,
    pub filtering_enabled: bool,
    pub global_filter: Option<FilterList>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let file = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Open {
            path: file.clone(),
            source,
        })?;
        Config::parse(&file, &text)
    }

    pub fn parse(file: &str, text: &str) -> Result<Config, ConfigError> {
        Parser {
            file,
            lines: text.lines().enumerate(),
            lineno: 0,
        }
        .parse()
    }
}

struct Parser<'a> {
    file: &'a str,
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    lineno: usize,
}

impl<'a> Parser<'a> {
    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            file: self.file.to_string(),
            line: self.lineno,
            message: message.into(),
        }
    }

    /// Next non-blank, non-comment line with surrounding whitespace removed.
    fn next_line(&mut self) -> Option<&'a str> {
        for (index, raw) in self.lines.by_ref() {
            self.lineno = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            return Some(line);
        }
        None
    }

    fn split_keyvalue(&self, line: &'a str) -> Result<(&'a str, &'a str), ConfigError> {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| self.invalid("syntax error - missing assignment"))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(self.invalid("syntax error - missing value"));
        }
        Ok((key.trim(), value))
    }

    fn split_comma_list(&self, value: &str) -> Result<Vec<String>, ConfigError> {
        value
            .split(',')
            .map(|element| {
                let element = element.trim();
                if element.is_empty() {
                    Err(self.invalid("invalid list - empty element"))
                } else {
                    Ok(element.to_string())
                }
            })
            .collect()
    }

    fn yes_no(&self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match value {
            "yes" => Ok(true),
            "no" => Ok(false),
            _ => Err(self.invalid(format!("invalid value for {key} {value:?}"))),
        }
    }

    fn filter_list(&self, mode: FilterMode, value: &str) -> Result<FilterList, ConfigError> {
        let names = self.split_comma_list(value)?;
        FilterList::new(mode, names).map_err(|e| self.invalid(e.to_string()))
    }

    fn parse(mut self) -> Result<Config, ConfigError> {
        match self.next_line() {
            Some("[global]") => {}
            _ => {
                return Err(ConfigError::MissingGlobal {
                    file: self.file.to_string(),
                });
            }
        }

        let mut interfaces: Option<Vec<String>> = None;
        let mut global_disable = [false; 2];
        let mut filtering_enabled = true;
        let mut global_filter: Option<FilterList> = None;

        // Global section.
        let mut line = loop {
            let Some(line) = self.next_line() else {
                break None;
            };
            if line.starts_with('[') {
                break Some(line);
            }

            let (key, value) = self.split_keyvalue(line)?;
            match key {
                KEY_INTERFACES => {
                    let list = self.split_comma_list(value)?;
                    if list.len() < 2 {
                        return Err(self.invalid("a minimum of 2 interfaces are required"));
                    }
                    if interfaces.replace(list).is_some() {
                        return Err(self.invalid("only one interface list is allowed"));
                    }
                }
                KEY_DISABLE_IPV4 => {
                    global_disable[Family::V4.index()] = self.yes_no(key, value)?;
                }
                KEY_DISABLE_IPV6 => {
                    global_disable[Family::V6.index()] = self.yes_no(key, value)?;
                }
                KEY_DISABLE_PACKET_FILTERING => {
                    if self.yes_no(key, value)? {
                        if global_filter.is_some() {
                            return Err(self.invalid(format!(
                                "{KEY_DISABLE_PACKET_FILTERING} cannot be combined with \
                                 {KEY_ALLOW_INBOUND} or {KEY_DENY_INBOUND}"
                            )));
                        }
                        filtering_enabled = false;
                    } else {
                        filtering_enabled = true;
                    }
                }
                KEY_ALLOW_INBOUND | KEY_DENY_INBOUND => {
                    if !filtering_enabled {
                        return Err(self.invalid(format!(
                            "{key} cannot be combined with {KEY_DISABLE_PACKET_FILTERING}"
                        )));
                    }
                    let mode = if key == KEY_ALLOW_INBOUND {
                        FilterMode::Allow
                    } else {
                        FilterMode::Deny
                    };
                    let list = self.filter_list(mode, value)?;
                    if global_filter.replace(list).is_some() {
                        return Err(self.invalid("only one global filter list is allowed"));
                    }
                }
                _ => {
                    return Err(self.invalid(format!("unknown [global] parameter {key:?}")));
                }
            }
        };

        let Some(names) = interfaces else {
            return Err(self.invalid(format!(
                "[global] section missing required parameter {KEY_INTERFACES:?}"
            )));
        };

        let mut interfaces: Vec<InterfaceConfig> = names
            .into_iter()
            .map(|name| InterfaceConfig {
                name,
                disabled: global_disable,
                inbound_filter: None,
                outbound_filter: None,
            })
            .collect();

        // Interface sections.
        while let Some(section) = line {
            let name = section
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .map(str::trim)
                .ok_or_else(|| self.invalid("syntax error"))?;
            if name.is_empty() || name.contains(['[', ']']) {
                return Err(self.invalid("syntax error"));
            }
            let Some(interface) = interfaces.iter_mut().find(|i| i.name == name) else {
                return Err(self.invalid(format!(
                    "interface {name:?} is not in the [global] interfaces list"
                )));
            };

            line = loop {
                let Some(line) = self.next_line() else {
                    break None;
                };
                if line.starts_with('[') {
                    break Some(line);
                }

                let (key, value) = self.split_keyvalue(line)?;
                match key {
                    KEY_DISABLE_IPV4 | KEY_DISABLE_IPV6 => {
                        let family = if key == KEY_DISABLE_IPV4 {
                            Family::V4
                        } else {
                            Family::V6
                        };
                        if self.yes_no(key, value)? {
                            interface.disabled[family.index()] = true;
                        } else {
                            if global_disable[family.index()] {
                                return Err(
                                    self.invalid(format!("{family} is globally disabled"))
                                );
                            }
                            interface.disabled[family.index()] = false;
                        }
                    }
                    KEY_ALLOW_INBOUND | KEY_DENY_INBOUND | KEY_ALLOW_OUTBOUND
                    | KEY_DENY_OUTBOUND => {
                        if !filtering_enabled {
                            return Err(self.invalid(format!(
                                "{key} cannot be combined with {KEY_DISABLE_PACKET_FILTERING}"
                            )));
                        }
                        let mode = if key == KEY_ALLOW_INBOUND || key == KEY_ALLOW_OUTBOUND {
                            FilterMode::Allow
                        } else {
                            FilterMode::Deny
                        };
                        let list = self.filter_list(mode, value)?;
                        let slot = if key == KEY_ALLOW_INBOUND || key == KEY_DENY_INBOUND {
                            &mut interface.inbound_filter
                        } else {
                            &mut interface.outbound_filter
                        };
                        let direction = if key == KEY_ALLOW_INBOUND || key == KEY_DENY_INBOUND {
                            "inbound"
                        } else {
                            "outbound"
                        };
                        if slot.replace(list).is_some() {
                            return Err(self.invalid(format!(
                                "only one {direction} filter list per interface is allowed"
                            )));
                        }
                    }
                    _ => {
                        return Err(
                            self.invalid(format!("unknown interface parameter {key:?}"))
                        );
                    }
                }
            };
        }

        Ok(Config {
            interfaces,
            filtering_enabled,
            global_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config, ConfigError> {
        Config::parse("test.conf", text)
    }

    #[test]
    fn minimal_config() {
        let config = parse("[global]\ninterfaces = eth0, eth1\n").unwrap();
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interfaces[0].name, "eth0");
        assert_eq!(config.interfaces[1].name, "eth1");
        assert!(config.filtering_enabled);
        assert!(config.global_filter.is_none());
    }

    #[test]
    fn comments_and_whitespace_are_ignored() {
        let config = parse(
            "# bridge the lab\n\n  [global]  \n   interfaces =  eth0 ,eth1  \n\n# done\n",
        )
        .unwrap();
        assert_eq!(config.interfaces[0].name, "eth0");
        assert_eq!(config.interfaces[1].name, "eth1");
    }

    #[test]
    fn global_must_come_first() {
        assert!(matches!(
            parse("[eth0]\n[global]\ninterfaces = eth0, eth1\n"),
            Err(ConfigError::MissingGlobal { .. })
        ));
        assert!(matches!(parse(""), Err(ConfigError::MissingGlobal { .. })));
    }

    #[test]
    fn at_least_two_interfaces() {
        assert!(parse("[global]\ninterfaces = eth0\n").is_err());
        assert!(parse("[global]\n").is_err());
    }

    #[test]
    fn global_filters_and_flags() {
        let config = parse(
            "[global]\n\
             interfaces = eth0, eth1\n\
             disable-ipv6 = yes\n\
             deny-inbound-filters = _ipp._tcp.local, _airplay._tcp.local\n",
        )
        .unwrap();
        assert!(config.interfaces.iter().all(|i| i.disabled[1]));
        assert!(config.interfaces.iter().all(|i| !i.disabled[0]));
        let filter = config.global_filter.unwrap();
        assert_eq!(filter.mode(), FilterMode::Deny);
        assert_eq!(filter.names().len(), 2);
    }

    #[test]
    fn interface_sections() {
        let config = parse(
            "[global]\n\
             interfaces = eth0, eth1\n\
             [ eth1 ]\n\
             disable-ipv6 = yes\n\
             allow-outbound-filters = _http._tcp.local\n",
        )
        .unwrap();
        let eth1 = &config.interfaces[1];
        assert!(eth1.disabled[1]);
        let outbound = eth1.outbound_filter.as_ref().unwrap();
        assert_eq!(outbound.mode(), FilterMode::Allow);
        assert!(config.interfaces[0].outbound_filter.is_none());
    }

    #[test]
    fn unknown_interface_section_is_fatal() {
        assert!(parse("[global]\ninterfaces = eth0, eth1\n[eth2]\n").is_err());
    }

    #[test]
    fn unknown_keys_are_fatal() {
        assert!(parse("[global]\ninterfaces = eth0, eth1\nttl = 3\n").is_err());
        assert!(
            parse("[global]\ninterfaces = eth0, eth1\n[eth0]\ninterfaces = eth0\n").is_err()
        );
    }

    #[test]
    fn filters_conflict_with_disabled_filtering() {
        assert!(parse(
            "[global]\n\
             interfaces = eth0, eth1\n\
             disable-packet-filtering = yes\n\
             deny-inbound-filters = _ipp._tcp.local\n"
        )
        .is_err());
        assert!(parse(
            "[global]\n\
             interfaces = eth0, eth1\n\
             deny-inbound-filters = _ipp._tcp.local\n\
             disable-packet-filtering = yes\n"
        )
        .is_err());
        assert!(parse(
            "[global]\n\
             interfaces = eth0, eth1\n\
             disable-packet-filtering = yes\n\
             [eth0]\n\
             allow-outbound-filters = _http._tcp.local\n"
        )
        .is_err());
    }

    #[test]
    fn one_filter_list_per_direction() {
        assert!(parse(
            "[global]\n\
             interfaces = eth0, eth1\n\
             allow-inbound-filters = a.local\n\
             deny-inbound-filters = b.local\n"
        )
        .is_err());
        assert!(parse(
            "[global]\n\
             interfaces = eth0, eth1\n\
             [eth0]\n\
             allow-inbound-filters = a.local\n\
             deny-inbound-filters = b.local\n"
        )
        .is_err());
    }

    #[test]
    fn interface_cannot_reenable_globally_disabled_family() {
        assert!(parse(
            "[global]\n\
             interfaces = eth0, eth1\n\
             disable-ipv4 = yes\n\
             [eth0]\n\
             disable-ipv4 = no\n"
        )
        .is_err());
    }

    #[test]
    fn bad_values_are_fatal() {
        assert!(parse("[global]\ninterfaces = eth0, eth1\ndisable-ipv4 = maybe\n").is_err());
        assert!(parse("[global]\ninterfaces = eth0,, eth1\n").is_err());
        assert!(parse("[global]\ninterfaces =\n").is_err());
        assert!(parse("[global]\ninterfaces eth0 eth1\n").is_err());
        assert!(parse("[global]\ninterfaces = eth0, eth1\ndeny-inbound-filters = a..b\n").is_err());
    }
}
