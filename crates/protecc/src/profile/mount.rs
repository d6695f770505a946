//! `PRMT` — the mount profile.
//!
//! Same shape as the network format: fixed rule records, strings blob,
//! declaration-order scan with first match deciding.

use crate::error::ProteccError;
use crate::matcher;
use crate::pattern::Trie;
use crate::profile::net::check_offset;
use crate::profile::{
    check_preamble, pattern_trie, write_preamble, Action, Reader, StringTable, Writer, OFFSET_NONE,
};

pub const MOUNT_MAGIC: [u8; 4] = *b"PRMT";
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;

/// Verifier-facing cap on the rule array.
pub const MAX_MOUNT_RULES: usize = 256;

const HEADER_SIZE: usize = 20;
const RULE_RECORD_SIZE: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRule {
    pub action: Action,
    /// Mount flags the rule constrains (0 matches any flag set).
    pub flags: u32,
    pub source: Option<String>,
    pub target: Option<String>,
    pub fstype: Option<String>,
    pub options: Option<String>,
}

pub struct MountQuery<'a> {
    pub source: &'a str,
    pub target: &'a str,
    pub fstype: &'a str,
    pub options: &'a str,
    pub flags: u32,
}

struct RuleTries {
    source: Option<Trie>,
    target: Option<Trie>,
    fstype: Option<Trie>,
    options: Option<Trie>,
}

pub struct MountProfile {
    pub flags: u32,
    rules: Vec<MountRule>,
    tries: Vec<RuleTries>,
}

impl PartialEq for MountProfile {
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags && self.rules == other.rules
    }
}

impl Eq for MountProfile {}

impl std::fmt::Debug for MountProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountProfile")
            .field("flags", &self.flags)
            .field("rules", &self.rules)
            .finish()
    }
}

impl MountProfile {
    pub fn new(rules: Vec<MountRule>, flags: u32) -> Result<Self, ProteccError> {
        if rules.len() > MAX_MOUNT_RULES {
            return Err(ProteccError::InvalidArgument(format!(
                "{} rules exceed the cap of {MAX_MOUNT_RULES}",
                rules.len()
            )));
        }
        let tries = rules
            .iter()
            .map(|r| {
                Ok(RuleTries {
                    source: r.source.as_deref().map(pattern_trie).transpose()?,
                    target: r.target.as_deref().map(pattern_trie).transpose()?,
                    fstype: r.fstype.as_deref().map(pattern_trie).transpose()?,
                    options: r.options.as_deref().map(pattern_trie).transpose()?,
                })
            })
            .collect::<Result<_, ProteccError>>()?;
        Ok(Self { flags, rules, tries })
    }

    pub fn rules(&self) -> &[MountRule] {
        &self.rules
    }

    pub fn evaluate(&self, query: &MountQuery<'_>) -> Option<Action> {
        for (rule, tries) in self.rules.iter().zip(&self.tries) {
            if rule.flags != 0 && rule.flags & query.flags != rule.flags {
                continue;
            }
            let field_ok = |trie: &Option<Trie>, value: &str| match trie {
                None => true,
                Some(t) => matcher::matches(t, value, 0),
            };
            if !field_ok(&tries.source, query.source)
                || !field_ok(&tries.target, query.target)
                || !field_ok(&tries.fstype, query.fstype)
                || !field_ok(&tries.options, query.options)
            {
                continue;
            }
            return Some(rule.action);
        }
        None
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut strings = StringTable::default();
        let offsets: Vec<[u32; 4]> = self
            .rules
            .iter()
            .map(|r| {
                [
                    strings.intern(r.source.as_deref()),
                    strings.intern(r.target.as_deref()),
                    strings.intern(r.fstype.as_deref()),
                    strings.intern(r.options.as_deref()),
                ]
            })
            .collect();
        let blob = strings.into_blob();

        let mut w = Writer::default();
        write_preamble(&mut w, MOUNT_MAGIC, VERSION_MAJOR, VERSION_MINOR);
        w.u32(self.flags);
        w.u32(self.rules.len() as u32);
        w.u32(blob.len() as u32);
        for (rule, offs) in self.rules.iter().zip(&offsets) {
            w.u32(match rule.action {
                Action::Allow => containerv_common::ACTION_ALLOW,
                Action::Deny => containerv_common::ACTION_DENY,
            });
            w.u32(rule.flags);
            for &off in offs {
                w.u32(off);
            }
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
        check_preamble(&mut r, MOUNT_MAGIC, VERSION_MAJOR)?;
        let flags = r.u32()?;
        let rule_count = r.u32()? as usize;
        let strings_size = r.u32()? as usize;

        if rule_count > MAX_MOUNT_RULES {
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

        let mut raw = Vec::with_capacity(rule_count);
        for _ in 0..rule_count {
            let action = r.u32()?;
            let rule_flags = r.u32()?;
            let offs = [r.u32()?, r.u32()?, r.u32()?, r.u32()?];
            raw.push((action, rule_flags, offs));
        }
        let blob = r.bytes(strings_size)?;
        r.finish()?;

        let mut rules = Vec::with_capacity(rule_count);
        for (action, rule_flags, offs) in raw {
            let action = match action {
                containerv_common::ACTION_ALLOW => Action::Allow,
                containerv_common::ACTION_DENY => Action::Deny,
                other => {
                    return Err(ProteccError::InvalidProfile(format!(
                        "unknown action {other}"
                    )))
                }
            };
            for off in offs {
                check_offset(off, strings_size)?;
            }
            rules.push(MountRule {
                action,
                flags: rule_flags,
                source: StringTable::lookup(blob, offs[0])?,
                target: StringTable::lookup(blob, offs[1])?,
                fstype: StringTable::lookup(blob, offs[2])?,
                options: StringTable::lookup(blob, offs[3])?,
            });
        }
        Self::new(rules, flags)
    }
}
