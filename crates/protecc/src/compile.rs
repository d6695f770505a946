//! Public compile entry point: `(glob, perms)` rules into a path profile.

use crate::dfa::{determinize, DfaConfig};
use crate::error::ProteccError;
use crate::pattern::Trie;
use crate::profile::{PathForm, PathProfile, FLAG_CASE_INSENSITIVE, FLAG_DENY_PRECEDENCE, FLAG_DFA};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub pattern: String,
    pub perms: u32,
}

impl PathRule {
    pub fn new(pattern: impl Into<String>, perms: u32) -> Self {
        Self {
            pattern: pattern.into(),
            perms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileFlags {
    pub case_insensitive: bool,
    /// Recorded in the profile header; readers that layer deny rules on
    /// top of the mask honor it.
    pub deny_precedence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    Trie,
    Dfa,
}

#[derive(Debug, Clone, Copy)]
pub struct CompileConfig {
    pub max_dfa_states: usize,
    pub max_classes: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        let dfa = DfaConfig::default();
        Self {
            max_dfa_states: dfa.max_states,
            max_classes: dfa.max_classes,
        }
    }
}

/// Compile a pattern set. The empty set is rejected, as is any rule with
/// an empty permission mask; a failed determinization is reported as
/// `CompileFailed` so the caller can fall back to the trie form.
pub fn compile(
    rules: &[PathRule],
    flags: CompileFlags,
    mode: CompileMode,
    config: &CompileConfig,
) -> Result<PathProfile, ProteccError> {
    if rules.is_empty() {
        return Err(ProteccError::InvalidArgument("empty pattern set".into()));
    }

    let mut trie = Trie::new(flags.case_insensitive);
    for rule in rules {
        if rule.perms == 0 {
            return Err(ProteccError::InvalidArgument(format!(
                "pattern '{}' has an empty permission mask",
                rule.pattern
            )));
        }
        trie.insert(&rule.pattern, rule.perms)?;
    }

    let mut header_flags = 0u32;
    if flags.case_insensitive {
        header_flags |= FLAG_CASE_INSENSITIVE;
    }
    if flags.deny_precedence {
        header_flags |= FLAG_DENY_PRECEDENCE;
    }

    let form = match mode {
        CompileMode::Trie => PathForm::Trie(trie),
        CompileMode::Dfa => {
            let dfa_config = DfaConfig {
                max_states: config.max_dfa_states,
                max_classes: config.max_classes,
            };
            header_flags |= FLAG_DFA;
            PathForm::Dfa(determinize(&trie, &dfa_config)?)
        }
    };

    Ok(PathProfile {
        flags: header_flags,
        form,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use containerv_common::{PERM_EXEC, PERM_READ};

    #[test]
    fn empty_set_is_invalid_argument() {
        let err = compile(
            &[],
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ProteccError::InvalidArgument(_)));
    }

    #[test]
    fn empty_mask_is_invalid_argument() {
        let err = compile(
            &[PathRule::new("/bin/sh", 0)],
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ProteccError::InvalidArgument(_)));
    }

    #[test]
    fn syntax_error_is_invalid_pattern() {
        let err = compile(
            &[PathRule::new("/dev/tty[9-0]", PERM_READ)],
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ProteccError::InvalidPattern { .. }));
    }

    #[test]
    fn dfa_state_cap_is_compile_failed() {
        let rules = vec![PathRule::new("/a/**/b/**/c", PERM_READ)];
        let config = CompileConfig {
            max_dfa_states: 1,
            max_classes: 32,
        };
        let err = compile(&rules, CompileFlags::default(), CompileMode::Dfa, &config).unwrap_err();
        assert!(matches!(err, ProteccError::CompileFailed(_)));

        // Retrying with the trie form succeeds.
        assert!(compile(&rules, CompileFlags::default(), CompileMode::Trie, &config).is_ok());
    }

    #[test]
    fn flags_land_in_the_header() {
        let profile = compile(
            &[PathRule::new("/usr/bin/**", PERM_READ | PERM_EXEC)],
            CompileFlags {
                case_insensitive: true,
                deny_precedence: true,
            },
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap();
        assert_ne!(profile.flags & FLAG_CASE_INSENSITIVE, 0);
        assert_ne!(profile.flags & FLAG_DENY_PRECEDENCE, 0);
        assert_eq!(profile.flags & FLAG_DFA, 0);
    }
}
