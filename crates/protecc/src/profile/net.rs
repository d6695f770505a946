//! `PRNT` — the network profile.
//!
//! Fixed-size rule records plus a NUL-terminated strings blob. Rules are
//! scanned in declaration order; the first rule whose fields all match
//! decides the action, so deny rules placed first win.

use serde::{Deserialize, Serialize};

use crate::error::ProteccError;
use crate::matcher;
use crate::pattern::Trie;
use crate::profile::{
    check_preamble, pattern_trie, write_preamble, Reader, StringTable, Writer, OFFSET_NONE,
};
use containerv_common::{ACTION_ALLOW, ACTION_DENY};

pub const NET_MAGIC: [u8; 4] = *b"PRNT";
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;

/// Verifier-facing cap on the rule array.
pub const MAX_NET_RULES: usize = 256;

const HEADER_SIZE: usize = 20;
const RULE_RECORD_SIZE: usize = 24;

const WIRE_ANY: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    fn to_wire(self) -> u32 {
        match self {
            Action::Allow => ACTION_ALLOW,
            Action::Deny => ACTION_DENY,
        }
    }

    fn from_wire(v: u32) -> Result<Self, ProteccError> {
        match v {
            ACTION_ALLOW => Ok(Action::Allow),
            ACTION_DENY => Ok(Action::Deny),
            other => Err(ProteccError::InvalidProfile(format!(
                "unknown action {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn to_wire(self) -> u32 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    fn from_wire(v: u32) -> Result<Option<Self>, ProteccError> {
        match v {
            WIRE_ANY => Ok(None),
            6 => Ok(Some(Protocol::Tcp)),
            17 => Ok(Some(Protocol::Udp)),
            other => Err(ProteccError::InvalidProfile(format!(
                "unknown protocol {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Unix,
    Inet,
    Inet6,
}

impl Family {
    fn to_wire(self) -> u32 {
        match self {
            Family::Unix => 1,
            Family::Inet => 2,
            Family::Inet6 => 10,
        }
    }

    fn from_wire(v: u32) -> Result<Option<Self>, ProteccError> {
        match v {
            WIRE_ANY => Ok(None),
            1 => Ok(Some(Family::Unix)),
            2 => Ok(Some(Family::Inet)),
            10 => Ok(Some(Family::Inet6)),
            other => Err(ProteccError::InvalidProfile(format!(
                "unknown family {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRule {
    pub action: Action,
    /// `None` matches any protocol.
    pub protocol: Option<Protocol>,
    /// `None` matches any family.
    pub family: Option<Family>,
    pub port_from: u16,
    pub port_to: u16,
    /// Glob over the textual remote address for inet families.
    pub ip_pattern: Option<String>,
    /// Glob over the socket path for the unix family.
    pub unix_pattern: Option<String>,
}

pub struct NetworkQuery<'a> {
    pub protocol: Protocol,
    pub family: Family,
    pub port: u16,
    /// Textual remote address: dotted quad, IPv6 form, or unix path.
    pub address: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub flags: u32,
    rules: Vec<NetworkRule>,
    ip_tries: Vec<Option<Trie>>,
    unix_tries: Vec<Option<Trie>>,
}

impl NetworkProfile {
    pub fn new(rules: Vec<NetworkRule>, flags: u32) -> Result<Self, ProteccError> {
        if rules.len() > MAX_NET_RULES {
            return Err(ProteccError::InvalidArgument(format!(
                "{} rules exceed the cap of {MAX_NET_RULES}",
                rules.len()
            )));
        }
        for rule in &rules {
            if rule.port_from > rule.port_to {
                return Err(ProteccError::InvalidArgument(format!(
                    "inverted port range [{}, {}]",
                    rule.port_from, rule.port_to
                )));
            }
        }
        let ip_tries = rules
            .iter()
            .map(|r| r.ip_pattern.as_deref().map(pattern_trie).transpose())
            .collect::<Result<_, _>>()?;
        let unix_tries = rules
            .iter()
            .map(|r| r.unix_pattern.as_deref().map(pattern_trie).transpose())
            .collect::<Result<_, _>>()?;
        Ok(Self {
            flags,
            rules,
            ip_tries,
            unix_tries,
        })
    }

    pub fn rules(&self) -> &[NetworkRule] {
        &self.rules
    }

    /// First matching rule decides; `None` when no rule applies.
    pub fn evaluate(&self, query: &NetworkQuery<'_>) -> Option<Action> {
        for (i, rule) in self.rules.iter().enumerate() {
            if let Some(p) = rule.protocol {
                if p != query.protocol {
                    continue;
                }
            }
            if let Some(f) = rule.family {
                if f != query.family {
                    continue;
                }
            }
            if query.port < rule.port_from || query.port > rule.port_to {
                continue;
            }
            let trie = match query.family {
                Family::Unix => &self.unix_tries[i],
                Family::Inet | Family::Inet6 => &self.ip_tries[i],
            };
            if let Some(trie) = trie {
                if !matcher::matches(trie, query.address, 0) {
                    continue;
                }
            }
            return Some(rule.action);
        }
        None
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut strings = StringTable::default();
        let offsets: Vec<(u32, u32)> = self
            .rules
            .iter()
            .map(|r| {
                (
                    strings.intern(r.ip_pattern.as_deref()),
                    strings.intern(r.unix_pattern.as_deref()),
                )
            })
            .collect();
        let blob = strings.into_blob();

        let mut w = Writer::default();
        write_preamble(&mut w, NET_MAGIC, VERSION_MAJOR, VERSION_MINOR);
        w.u32(self.flags);
        w.u32(self.rules.len() as u32);
        w.u32(blob.len() as u32);
        for (rule, (ip_off, unix_off)) in self.rules.iter().zip(&offsets) {
            w.u32(rule.action.to_wire());
            w.u32(rule.protocol.map_or(WIRE_ANY, Protocol::to_wire));
            w.u32(rule.family.map_or(WIRE_ANY, Family::to_wire));
            w.u16(rule.port_from);
            w.u16(rule.port_to);
            w.u32(*ip_off);
            w.u32(*unix_off);
        }
        w.raw(&blob);
        w.into_vec()
    }

    pub fn export_into(&self, buf: &mut [u8]) -> Result<usize, ProteccError> {
        let bytes = self.to_bytes();
        if buf.len() < bytes.len() {
            return Err(ProteccError::InvalidArgument(format!(
                "buffer too small: {} < {}",
                buf.len(),
                bytes.len()
            )));
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProteccError> {
        let mut r = Reader::new(buf);
        check_preamble(&mut r, NET_MAGIC, VERSION_MAJOR)?;
        let flags = r.u32()?;
        let rule_count = r.u32()? as usize;
        let strings_size = r.u32()? as usize;

        if rule_count > MAX_NET_RULES {
            return Err(ProteccError::InvalidProfile(format!(
                "rule count {rule_count} exceeds cap"
            )));
        }
        let expected = HEADER_SIZE + rule_count * RULE_RECORD_SIZE + strings_size;
        if buf.len() != expected {
            return Err(ProteccError::InvalidProfile(format!(
                "size mismatch: {} != {expected}",
                buf.len()
            )));
        }

        let mut raw_rules = Vec::with_capacity(rule_count);
        for _ in 0..rule_count {
            let action = Action::from_wire(r.u32()?)?;
            let protocol = Protocol::from_wire(r.u32()?)?;
            let family = Family::from_wire(r.u32()?)?;
            let port_from = r.u16()?;
            let port_to = r.u16()?;
            let ip_off = r.u32()?;
            let unix_off = r.u32()?;
            raw_rules.push((action, protocol, family, port_from, port_to, ip_off, unix_off));
        }
        let blob = r.bytes(strings_size)?;
        r.finish()?;

        let mut rules = Vec::with_capacity(rule_count);
        for (action, protocol, family, port_from, port_to, ip_off, unix_off) in raw_rules {
            if port_from > port_to {
                return Err(ProteccError::InvalidProfile(format!(
                    "inverted port range [{port_from}, {port_to}]"
                )));
            }
            check_offset(ip_off, strings_size)?;
            check_offset(unix_off, strings_size)?;
            rules.push(NetworkRule {
                action,
                protocol,
                family,
                port_from,
                port_to,
                ip_pattern: StringTable::lookup(blob, ip_off)?,
                unix_pattern: StringTable::lookup(blob, unix_off)?,
            });
        }
        Self::new(rules, flags)
    }
}

pub(crate) fn check_offset(offset: u32, strings_size: usize) -> Result<(), ProteccError> {
    if offset != OFFSET_NONE && offset as usize >= strings_size {
        return Err(ProteccError::InvalidProfile(format!(
            "string offset {offset} out of range"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_rule() -> NetworkRule {
        NetworkRule {
            action: Action::Allow,
            protocol: Some(Protocol::Tcp),
            family: Some(Family::Inet),
            port_from: 80,
            port_to: 443,
            ip_pattern: Some("10.*.*.*".to_string()),
            unix_pattern: None,
        }
    }

    #[test]
    fn first_match_wins() {
        let profile = NetworkProfile::new(
            vec![
                NetworkRule {
                    action: Action::Deny,
                    protocol: None,
                    family: None,
                    port_from: 22,
                    port_to: 22,
                    ip_pattern: None,
                    unix_pattern: None,
                },
                NetworkRule {
                    action: Action::Allow,
                    protocol: None,
                    family: None,
                    port_from: 0,
                    port_to: 65535,
                    ip_pattern: None,
                    unix_pattern: None,
                },
            ],
            0,
        )
        .unwrap();
        let deny = profile.evaluate(&NetworkQuery {
            protocol: Protocol::Tcp,
            family: Family::Inet,
            port: 22,
            address: "10.0.0.1",
        });
        assert_eq!(deny, Some(Action::Deny));
        let allow = profile.evaluate(&NetworkQuery {
            protocol: Protocol::Tcp,
            family: Family::Inet,
            port: 23,
            address: "10.0.0.1",
        });
        assert_eq!(allow, Some(Action::Allow));
    }

    #[test]
    fn tuple_matching() {
        let profile = NetworkProfile::new(vec![web_rule()], 0).unwrap();
        let hit = |protocol, port, address| {
            profile.evaluate(&NetworkQuery {
                protocol,
                family: Family::Inet,
                port,
                address,
            })
        };
        assert_eq!(hit(Protocol::Tcp, 443, "10.0.0.1"), Some(Action::Allow));
        assert_eq!(hit(Protocol::Tcp, 80, "10.9.8.7"), Some(Action::Allow));
        assert_eq!(hit(Protocol::Udp, 443, "10.0.0.1"), None);
        assert_eq!(hit(Protocol::Tcp, 80, "192.168.0.1"), None);
        assert_eq!(hit(Protocol::Tcp, 8080, "10.0.0.1"), None);
    }

    #[test]
    fn unix_pattern_applies_to_unix_family() {
        let profile = NetworkProfile::new(
            vec![NetworkRule {
                action: Action::Allow,
                protocol: None,
                family: Some(Family::Unix),
                port_from: 0,
                port_to: 65535,
                ip_pattern: None,
                unix_pattern: Some("/run/chef/*.sock".to_string()),
            }],
            0,
        )
        .unwrap();
        let hit = |address| {
            profile.evaluate(&NetworkQuery {
                protocol: Protocol::Tcp,
                family: Family::Unix,
                port: 0,
                address,
            })
        };
        assert_eq!(hit("/run/chef/build.sock"), Some(Action::Allow));
        assert_eq!(hit("/run/other/build.sock"), None);
    }

    #[test]
    fn round_trip() {
        let profile = NetworkProfile::new(
            vec![
                web_rule(),
                NetworkRule {
                    action: Action::Deny,
                    protocol: Some(Protocol::Udp),
                    family: None,
                    port_from: 0,
                    port_to: 1023,
                    ip_pattern: None,
                    unix_pattern: Some("/run/**".to_string()),
                },
            ],
            0,
        )
        .unwrap();
        let bytes = profile.to_bytes();
        let back = NetworkProfile::from_bytes(&bytes).unwrap();
        assert_eq!(profile, back);
    }

    #[test]
    fn rejects_bad_buffers() {
        let profile = NetworkProfile::new(vec![web_rule()], 0).unwrap();
        let bytes = profile.to_bytes();

        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'Z';
        assert!(NetworkProfile::from_bytes(&wrong_magic).is_err());

        assert!(NetworkProfile::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut bad_action = bytes.clone();
        bad_action[HEADER_SIZE] = 77;
        assert!(NetworkProfile::from_bytes(&bad_action).is_err());
    }

    #[test]
    fn rejects_rule_cap_overflow() {
        let rules = vec![web_rule(); MAX_NET_RULES + 1];
        assert!(NetworkProfile::new(rules, 0).is_err());
    }
}
