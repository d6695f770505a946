//! Access-rule compiler for the containerv policy layer.
//!
//! Human-written rules (path globs, network tuples, mount specs) compile
//! into compact binary profiles that in-kernel matchers consume. Path
//! patterns become a shared-prefix trie, optionally determinized into a
//! table-driven DFA; network and mount rules become fixed records over a
//! strings blob. Exported profiles round-trip through `from_bytes`
//! unchanged.

mod compile;
mod dfa;
mod error;
mod matcher;
mod pattern;
mod profile;
mod ruleset;

pub use compile::{compile, CompileConfig, CompileFlags, CompileMode, PathRule};
pub use dfa::{Dfa, DfaConfig, INVALID_STATE};
pub use error::ProteccError;
pub use matcher::{matched_perms, matches};
pub use pattern::{Modifier, Node, Token, Trie};
pub use profile::{
    Action, Family, MountProfile, MountQuery, MountRule, NetworkProfile, NetworkQuery, NetworkRule,
    PathForm, PathProfile, Protocol, FLAG_CASE_INSENSITIVE, FLAG_DENY_PRECEDENCE, FLAG_DFA,
    MAX_MOUNT_RULES, MAX_NET_RULES, MAX_PATH_NODES, MOUNT_MAGIC, NET_MAGIC, OFFSET_NONE,
    PATH_MAGIC,
};
pub use ruleset::{MountRuleSpec, NetworkRuleSpec, PathRuleSpec, Permission, Ruleset};
