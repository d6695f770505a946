//! Human-written rulesets (YAML) that compile into profiles.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compile::PathRule;
use crate::error::ProteccError;
use crate::profile::{Action, Family, MountRule, NetworkRule, Protocol};
use containerv_common::{PERM_ALL, PERM_EXEC, PERM_READ, PERM_WRITE};

/// Top-level ruleset a policy file declares.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ruleset {
    #[serde(default)]
    pub paths: Vec<PathRuleSpec>,

    /// Paths refused outright, whatever the access; consumers layer
    /// these above the allows.
    #[serde(default)]
    pub deny_paths: Vec<String>,

    #[serde(default)]
    pub network: Vec<NetworkRuleSpec>,

    #[serde(default)]
    pub mounts: Vec<MountRuleSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Exec,
}

impl Permission {
    pub fn bit(self) -> u32 {
        match self {
            Permission::Read => PERM_READ,
            Permission::Write => PERM_WRITE,
            Permission::Exec => PERM_EXEC,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRuleSpec {
    pub pattern: String,
    #[serde(default)]
    pub allow: Vec<Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRuleSpec {
    pub action: Action,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub family: Option<Family>,
    /// `[from, to]`, or a single port as `[p, p]`.
    #[serde(default = "any_ports")]
    pub ports: [u16; 2],
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub unix: Option<String>,
}

fn any_ports() -> [u16; 2] {
    [0, 65535]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRuleSpec {
    pub action: Action,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub options: Option<String>,
}

impl Ruleset {
    /// Load a ruleset from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ProteccError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn path_rules(&self) -> Vec<PathRule> {
        Self::to_path_rules(&self.paths)
    }

    pub fn deny_path_rules(&self) -> Vec<PathRule> {
        self.deny_paths
            .iter()
            .map(|pattern| PathRule::new(pattern.clone(), PERM_ALL))
            .collect()
    }

    fn to_path_rules(specs: &[PathRuleSpec]) -> Vec<PathRule> {
        specs
            .iter()
            .map(|spec| {
                let perms = spec.allow.iter().fold(0, |acc, p| acc | p.bit());
                PathRule::new(spec.pattern.clone(), perms)
            })
            .collect()
    }

    pub fn network_rules(&self) -> Vec<NetworkRule> {
        self.network
            .iter()
            .map(|spec| NetworkRule {
                action: spec.action,
                protocol: spec.protocol,
                family: spec.family,
                port_from: spec.ports[0],
                port_to: spec.ports[1],
                ip_pattern: spec.ip.clone(),
                unix_pattern: spec.unix.clone(),
            })
            .collect()
    }

    pub fn mount_rules(&self) -> Vec<MountRule> {
        self.mounts
            .iter()
            .map(|spec| MountRule {
                action: spec.action,
                flags: spec.flags,
                source: spec.source.clone(),
                target: spec.target.clone(),
                fstype: spec.fstype.clone(),
                options: spec.options.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
paths:
  - pattern: /usr/bin/**
    allow: [read, exec]
  - pattern: /var/log/**/*.log
    allow: [read]
deny_paths:
  - /etc/shadow
network:
  - action: allow
    protocol: tcp
    family: inet
    ports: [80, 443]
    ip: "10.*.*.*"
mounts:
  - action: deny
    target: /proc/**
"#;

    #[test]
    fn parses_sample() {
        let ruleset: Ruleset = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(ruleset.paths.len(), 2);
        assert_eq!(ruleset.network.len(), 1);
        assert_eq!(ruleset.mounts.len(), 1);

        let paths = ruleset.path_rules();
        assert_eq!(paths[0].perms, PERM_READ | PERM_EXEC);
        assert_eq!(paths[1].perms, PERM_READ);

        let net = ruleset.network_rules();
        assert_eq!(net[0].port_from, 80);
        assert_eq!(net[0].port_to, 443);
        assert_eq!(net[0].ip_pattern.as_deref(), Some("10.*.*.*"));

        let mounts = ruleset.mount_rules();
        assert_eq!(mounts[0].action, Action::Deny);

        let denies = ruleset.deny_path_rules();
        assert_eq!(denies.len(), 1);
        assert_eq!(denies[0].perms, PERM_ALL);
    }

    #[test]
    fn defaults_apply() {
        let ruleset: Ruleset = serde_yaml::from_str("network:\n  - action: deny\n").unwrap();
        let net = ruleset.network_rules();
        assert_eq!(net[0].port_from, 0);
        assert_eq!(net[0].port_to, 65535);
        assert!(net[0].protocol.is_none());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let ruleset = Ruleset::load(&path).unwrap();
        assert_eq!(ruleset.paths.len(), 2);
    }
}
