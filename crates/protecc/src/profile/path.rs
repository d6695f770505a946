//! `PROT` — the path profile.
//!
//! Header, then either the trie arrays (fixed 48-byte node records plus a
//! flat `u32` edge array) or the DFA payload (class map, accept bitmap,
//! permission vector, transition table). Which one is present is carried
//! in the flags.

use crate::dfa::{Dfa, INVALID_STATE};
use crate::error::ProteccError;
use crate::matcher;
use crate::pattern::{Modifier, Node, Token, Trie, CHARSET_WORDS};
use crate::profile::{check_preamble, write_preamble, Reader, Writer};

pub const PATH_MAGIC: [u8; 4] = *b"PROT";
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 1;

pub const FLAG_CASE_INSENSITIVE: u32 = 1 << 0;
pub const FLAG_DFA: u32 = 1 << 1;
/// Deny rules take precedence over allow rules for readers that layer an
/// action on top of the mask.
pub const FLAG_DENY_PRECEDENCE: u32 = 1 << 2;

/// Verifier-facing cap on the node array.
pub const MAX_PATH_NODES: usize = 65536;

const NODE_RECORD_SIZE: usize = 48;
const NODE_DATA_SIZE: usize = 32;

const KIND_ROOT: u8 = 0;
const KIND_LITERAL: u8 = 1;
const KIND_ANY: u8 = 2;
const KIND_SPAN: u8 = 3;
const KIND_RECURSIVE: u8 = 4;
const KIND_CHARSET: u8 = 5;
const KIND_RANGE: u8 = 6;

const NODE_FLAG_TERMINAL: u8 = 1 << 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathForm {
    Trie(Trie),
    Dfa(Dfa),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathProfile {
    pub flags: u32,
    pub form: PathForm,
}

impl PathProfile {
    pub fn matched_perms(&self, path: &str) -> Option<u32> {
        match &self.form {
            PathForm::Trie(trie) => matcher::matched_perms(trie, path),
            PathForm::Dfa(dfa) => dfa.matched_perms(path),
        }
    }

    /// `true` iff some pattern set accepts `path` with a mask covering
    /// `required`.
    pub fn matches(&self, path: &str, required: u32) -> bool {
        match self.matched_perms(path) {
            Some(perms) => perms & required == required,
            None => false,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::default();
        write_preamble(&mut w, PATH_MAGIC, VERSION_MAJOR, VERSION_MINOR);
        match &self.form {
            PathForm::Trie(trie) => {
                let num_edges: usize = trie.nodes.iter().map(|n| n.children.len()).sum();
                w.u32(self.flags & !FLAG_DFA);
                w.u32(trie.nodes.len() as u32);
                w.u32(num_edges as u32);
                w.u32(trie.root);
                w.u32(trie.pattern_count);
                w.u32(trie.max_depth);

                let mut edge_start = 0u32;
                for node in &trie.nodes {
                    write_node(&mut w, node, edge_start);
                    edge_start += node.children.len() as u32;
                }
                for node in &trie.nodes {
                    for &child in &node.children {
                        w.u32(child);
                    }
                }
            }
            PathForm::Dfa(dfa) => {
                w.u32(self.flags | FLAG_DFA);
                w.u32(0); // num_nodes
                w.u32(0); // num_edges
                w.u32(0); // root_index
                w.u32(0); // pattern_count (not tracked in DFA form)
                w.u32(0); // max_depth
                w.raw(&dfa.class_map);
                w.u32(dfa.num_classes);
                w.u32(dfa.num_states);
                w.u32(dfa.start);
                w.raw(&dfa.accept);
                for &p in &dfa.perms {
                    w.u32(p);
                }
                for &t in &dfa.trans {
                    w.u32(t);
                }
            }
        }
        w.into_vec()
    }

    /// Serialize into a caller buffer; returns bytes written.
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
        check_preamble(&mut r, PATH_MAGIC, VERSION_MAJOR)?;
        let flags = r.u32()?;
        let num_nodes = r.u32()? as usize;
        let num_edges = r.u32()? as usize;
        let root = r.u32()?;
        let pattern_count = r.u32()?;
        let max_depth = r.u32()?;

        let form = if flags & FLAG_DFA != 0 {
            PathForm::Dfa(read_dfa(&mut r, flags)?)
        } else {
            if num_nodes == 0 || num_nodes > MAX_PATH_NODES {
                return Err(ProteccError::InvalidProfile(format!(
                    "node count {num_nodes} out of range"
                )));
            }
            if root as usize >= num_nodes {
                return Err(ProteccError::InvalidProfile("root index out of range".into()));
            }
            let mut nodes = Vec::with_capacity(num_nodes);
            let mut spans = Vec::with_capacity(num_nodes);
            for _ in 0..num_nodes {
                let (node, edge_start, edge_count) = read_node(&mut r)?;
                let end = edge_start
                    .checked_add(edge_count)
                    .filter(|&e| e as usize <= num_edges)
                    .ok_or_else(|| {
                        ProteccError::InvalidProfile("edge span out of range".into())
                    })?;
                spans.push((edge_start, end));
                nodes.push(node);
            }
            let mut edges = Vec::with_capacity(num_edges);
            for _ in 0..num_edges {
                let child = r.u32()?;
                if child as usize >= num_nodes {
                    return Err(ProteccError::InvalidProfile(format!(
                        "edge target {child} out of range"
                    )));
                }
                edges.push(child);
            }
            for (node, (start, end)) in nodes.iter_mut().zip(&spans) {
                node.children = edges[*start as usize..*end as usize].to_vec();
            }
            PathForm::Trie(Trie {
                nodes,
                root,
                case_insensitive: flags & FLAG_CASE_INSENSITIVE != 0,
                pattern_count,
                max_depth,
            })
        };

        r.finish()?;
        Ok(Self { flags, form })
    }
}

fn write_node(w: &mut Writer, node: &Node, edge_start: u32) {
    let (kind, data) = encode_token(&node.token);
    w.u8(kind);
    w.u8(node.modifier as u8);
    w.u8(if node.terminal { NODE_FLAG_TERMINAL } else { 0 });
    w.u8(0);
    w.u32(if node.terminal { node.perms } else { 0 });
    w.u32(edge_start);
    w.u32(node.children.len() as u32);
    w.raw(&data);
}

fn encode_token(token: &Token) -> (u8, [u8; NODE_DATA_SIZE]) {
    let mut data = [0u8; NODE_DATA_SIZE];
    let kind = match token {
        Token::Root => KIND_ROOT,
        Token::Literal(c) => {
            data[0] = *c;
            KIND_LITERAL
        }
        Token::Any => KIND_ANY,
        Token::Span => KIND_SPAN,
        Token::Recursive => KIND_RECURSIVE,
        Token::Charset(words) => {
            for (i, word) in words.iter().enumerate() {
                data[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
            }
            KIND_CHARSET
        }
        Token::Range(lo, hi) => {
            data[0] = *lo;
            data[1] = *hi;
            KIND_RANGE
        }
    };
    (kind, data)
}

fn read_node(r: &mut Reader<'_>) -> Result<(Node, u32, u32), ProteccError> {
    let kind = r.u8()?;
    let modifier = match r.u8()? {
        0 => Modifier::None,
        1 => Modifier::Optional,
        2 => Modifier::OneOrMore,
        3 => Modifier::ZeroOrMore,
        m => {
            return Err(ProteccError::InvalidProfile(format!(
                "unknown modifier {m}"
            )))
        }
    };
    let node_flags = r.u8()?;
    let _pad = r.u8()?;
    let perms = r.u32()?;
    let edge_start = r.u32()?;
    let edge_count = r.u32()?;
    let data = r.bytes(NODE_DATA_SIZE)?;

    let token = match kind {
        KIND_ROOT => Token::Root,
        KIND_LITERAL => Token::Literal(data[0]),
        KIND_ANY => Token::Any,
        KIND_SPAN => Token::Span,
        KIND_RECURSIVE => Token::Recursive,
        KIND_CHARSET => {
            let mut words = [0u64; CHARSET_WORDS];
            for (i, word) in words.iter_mut().enumerate() {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[i * 8..i * 8 + 8]);
                *word = u64::from_le_bytes(raw);
            }
            Token::Charset(words)
        }
        KIND_RANGE => {
            if data[0] > data[1] {
                return Err(ProteccError::InvalidProfile("inverted range".into()));
            }
            Token::Range(data[0], data[1])
        }
        k => return Err(ProteccError::InvalidProfile(format!("unknown kind {k}"))),
    };

    let terminal = node_flags & NODE_FLAG_TERMINAL != 0;
    if !terminal && perms != 0 {
        return Err(ProteccError::InvalidProfile(
            "permissions on non-terminal node".into(),
        ));
    }

    Ok((
        Node {
            token,
            modifier,
            terminal,
            perms,
            children: Vec::new(),
        },
        edge_start,
        edge_count,
    ))
}

fn read_dfa(r: &mut Reader<'_>, flags: u32) -> Result<Dfa, ProteccError> {
    let mut class_map = [0u8; 256];
    class_map.copy_from_slice(r.bytes(256)?);
    let num_classes = r.u32()?;
    let num_states = r.u32()?;
    let start = r.u32()?;

    if num_classes == 0 || num_classes > 256 {
        return Err(ProteccError::InvalidProfile("class count out of range".into()));
    }
    if num_states == 0 || num_states > 1 << 20 {
        return Err(ProteccError::InvalidProfile("state count out of range".into()));
    }
    if start >= num_states {
        return Err(ProteccError::InvalidProfile("start state out of range".into()));
    }
    for (b, &class) in class_map.iter().enumerate() {
        if class as u32 >= num_classes {
            return Err(ProteccError::InvalidProfile(format!(
                "class of byte {b} out of range"
            )));
        }
    }

    let accept = r.bytes((num_states as usize).div_ceil(8))?.to_vec();
    let mut perms = Vec::with_capacity(num_states as usize);
    for _ in 0..num_states {
        perms.push(r.u32()?);
    }
    let total = num_states as u64 * num_classes as u64;
    let mut trans = Vec::with_capacity(total as usize);
    for _ in 0..total {
        let t = r.u32()?;
        if t != INVALID_STATE && t >= num_states {
            return Err(ProteccError::InvalidProfile(format!(
                "transition {t} out of range"
            )));
        }
        trans.push(t);
    }

    let dfa = Dfa {
        class_map,
        num_classes,
        num_states,
        start,
        accept,
        perms,
        trans,
        case_insensitive: flags & FLAG_CASE_INSENSITIVE != 0,
    };
    for state in 0..num_states {
        let accepting = dfa.is_accepting(state);
        let mask = dfa.perms[state as usize];
        if accepting && mask == 0 {
            return Err(ProteccError::InvalidProfile(format!(
                "accepting state {state} with empty mask"
            )));
        }
        if !accepting && mask != 0 {
            return Err(ProteccError::InvalidProfile(format!(
                "mask on non-accepting state {state}"
            )));
        }
    }
    Ok(dfa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{compile, CompileConfig, CompileFlags, CompileMode, PathRule};
    use containerv_common::{PERM_EXEC, PERM_READ, PERM_WRITE};

    fn rules() -> Vec<PathRule> {
        vec![
            PathRule::new("/var/log/**/*.log", PERM_READ),
            PathRule::new("/dev/tty[0-9]+", PERM_READ | PERM_WRITE),
            PathRule::new("/usr/bin/**", PERM_READ | PERM_EXEC),
        ]
    }

    fn assert_same_matches(a: &PathProfile, b: &PathProfile) {
        let probes = [
            "/var/log/app.log",
            "/var/log/a/b/c.log",
            "/var/log/a/b/c.txt",
            "/dev/tty7",
            "/dev/tty",
            "/usr/bin/true",
            "/usr/bin/x/y",
            "/etc/shadow",
        ];
        for p in probes {
            assert_eq!(a.matched_perms(p), b.matched_perms(p), "probe {p:?}");
        }
    }

    #[test]
    fn trie_profile_round_trips() {
        let profile = compile(
            &rules(),
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap();
        let bytes = profile.to_bytes();
        let back = PathProfile::from_bytes(&bytes).unwrap();
        assert_eq!(profile, back);
        assert_same_matches(&profile, &back);
    }

    #[test]
    fn dfa_profile_round_trips() {
        let profile = compile(
            &rules(),
            CompileFlags::default(),
            CompileMode::Dfa,
            &CompileConfig::default(),
        )
        .unwrap();
        assert!(matches!(profile.form, PathForm::Dfa(_)));
        let bytes = profile.to_bytes();
        let back = PathProfile::from_bytes(&bytes).unwrap();
        assert_eq!(profile, back);
        assert_same_matches(&profile, &back);
    }

    #[test]
    fn export_into_reports_written_length() {
        let profile = compile(
            &rules(),
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap();
        let expected = profile.to_bytes();
        let mut buf = vec![0u8; expected.len() + 64];
        let written = profile.export_into(&mut buf).unwrap();
        assert_eq!(written, expected.len());
        assert_eq!(&buf[..written], &expected[..]);

        let mut small = vec![0u8; 8];
        assert!(profile.export_into(&mut small).is_err());
    }

    #[test]
    fn rejects_unknown_magic_and_major() {
        let profile = compile(
            &rules(),
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap();
        let mut bytes = profile.to_bytes();
        bytes[0] = b'X';
        assert!(PathProfile::from_bytes(&bytes).is_err());

        let mut bytes = profile.to_bytes();
        bytes[4] = 9; // major
        assert!(PathProfile::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_truncation_and_trailing_garbage() {
        let profile = compile(
            &rules(),
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap();
        let bytes = profile.to_bytes();
        assert!(PathProfile::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(PathProfile::from_bytes(&padded).is_err());
    }

    #[test]
    fn rejects_out_of_range_edge() {
        let profile = compile(
            &[PathRule::new("/ab", PERM_READ)],
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap();
        let mut bytes = profile.to_bytes();
        // Last four bytes are the final edge target; point it past the
        // node array.
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(PathProfile::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_perms_on_non_terminal() {
        let profile = compile(
            &[PathRule::new("/ab", PERM_READ)],
            CompileFlags::default(),
            CompileMode::Trie,
            &CompileConfig::default(),
        )
        .unwrap();
        let mut bytes = profile.to_bytes();
        // Header is 32 bytes; first node record is the root. Set a perm
        // mask without the terminal flag.
        bytes[32 + 4] = 0xFF;
        assert!(PathProfile::from_bytes(&bytes).is_err());
    }
}
