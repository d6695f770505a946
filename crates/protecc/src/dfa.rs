//! Subset-construction determinization of a pattern trie.
//!
//! The byte alphabet is partitioned into equivalence classes induced by
//! every distinct byte predicate the pattern set contains (literals,
//! charsets, ranges, the `*` no-separator run, the `**` run). States are
//! interned sets of trie nodes. Construction fails with `CompileFailed`
//! when the class or state caps are exceeded; callers keep the trie form
//! in that case.

use std::collections::{BTreeSet, HashMap};

use crate::error::ProteccError;
use crate::pattern::{Token, Trie};

pub const INVALID_STATE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
pub struct DfaConfig {
    pub max_states: usize,
    pub max_classes: usize,
}

impl Default for DfaConfig {
    fn default() -> Self {
        Self {
            max_states: 4096,
            max_classes: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dfa {
    /// byte → class, all entries `< num_classes`.
    pub class_map: [u8; 256],
    pub num_classes: u32,
    pub num_states: u32,
    pub start: u32,
    /// One bit per state.
    pub accept: Vec<u8>,
    /// Per-state permission mask; non-zero exactly on accepting states.
    pub perms: Vec<u32>,
    /// `num_states × num_classes`, entries `< num_states` or INVALID_STATE.
    pub trans: Vec<u32>,
    pub case_insensitive: bool,
}

impl Dfa {
    pub fn is_accepting(&self, state: u32) -> bool {
        self.accept[(state / 8) as usize] & (1 << (state % 8)) != 0
    }

    /// Union of accepting masks for `path`, or `None` on no match.
    pub fn matched_perms(&self, path: &str) -> Option<u32> {
        let mut state = self.start;
        for mut b in path.bytes() {
            if self.case_insensitive {
                b = b.to_ascii_lowercase();
            }
            let class = self.class_map[b as usize] as u32;
            state = self.trans[(state * self.num_classes + class) as usize];
            if state == INVALID_STATE {
                return None;
            }
        }
        self.is_accepting(state).then(|| self.perms[state as usize])
    }

    pub fn matches(&self, path: &str, required: u32) -> bool {
        match self.matched_perms(path) {
            Some(perms) => perms & required == required,
            None => false,
        }
    }
}

/// Determinize `trie`.
pub fn determinize(trie: &Trie, config: &DfaConfig) -> Result<Dfa, ProteccError> {
    let (class_map, num_classes) = byte_classes(trie, config)?;

    // One representative byte per class keeps the transition computation
    // on the class alphabet instead of all 256 bytes.
    let mut class_repr = vec![0u8; num_classes];
    for b in (0u16..256).rev() {
        class_repr[class_map[b as usize] as usize] = b as u8;
    }

    let start_set = closure(trie, BTreeSet::from([trie.root]));

    let mut states: HashMap<BTreeSet<u32>, u32> = HashMap::new();
    let mut order: Vec<BTreeSet<u32>> = Vec::new();
    let mut trans: Vec<u32> = Vec::new();
    let mut worklist: Vec<u32> = Vec::new();

    states.insert(start_set.clone(), 0);
    order.push(start_set);
    trans.extend(std::iter::repeat(INVALID_STATE).take(num_classes));
    worklist.push(0);

    while let Some(sid) = worklist.pop() {
        let set = order[sid as usize].clone();
        for class in 0..num_classes {
            let byte = class_repr[class];
            let next = step(trie, &set, byte);
            if next.is_empty() {
                continue;
            }
            let next = closure(trie, next);
            let next_id = match states.get(&next) {
                Some(&id) => id,
                None => {
                    let id = order.len() as u32;
                    if order.len() >= config.max_states {
                        return Err(ProteccError::CompileFailed(format!(
                            "state limit exceeded ({} states)",
                            config.max_states
                        )));
                    }
                    states.insert(next.clone(), id);
                    order.push(next);
                    trans.extend(std::iter::repeat(INVALID_STATE).take(num_classes));
                    worklist.push(id);
                    id
                }
            };
            trans[sid as usize * num_classes + class] = next_id;
        }
    }

    let num_states = order.len() as u32;
    let mut accept = vec![0u8; order.len().div_ceil(8)];
    let mut perms = vec![0u32; order.len()];
    for (sid, set) in order.iter().enumerate() {
        let mask = accept_mask(trie, set);
        if mask != 0 {
            accept[sid / 8] |= 1 << (sid % 8);
            perms[sid] = mask;
        }
    }

    Ok(Dfa {
        class_map,
        num_classes: num_classes as u32,
        num_states,
        start: 0,
        accept,
        perms,
        trans,
        case_insensitive: trie.case_insensitive,
    })
}

/// Partition bytes by their signature across every predicate in the trie.
fn byte_classes(trie: &Trie, config: &DfaConfig) -> Result<([u8; 256], usize), ProteccError> {
    let mut tables: Vec<[bool; 256]> = Vec::new();

    for node in &trie.nodes {
        let mut table = [false; 256];
        match &node.token {
            Token::Root => continue,
            Token::Any | Token::Recursive => {
                table = [true; 256];
            }
            Token::Span => {
                table = [true; 256];
                table[b'/' as usize] = false;
            }
            token => {
                for b in 0u16..256 {
                    table[b as usize] = token.matches_byte(b as u8);
                }
            }
        }
        if !tables.contains(&table) {
            tables.push(table);
        }
    }

    let mut class_map = [0u8; 256];
    let mut signatures: HashMap<Vec<bool>, u8> = HashMap::new();
    for b in 0..256usize {
        let sig: Vec<bool> = tables.iter().map(|t| t[b]).collect();
        let next = signatures.len() as u8;
        let class = *signatures.entry(sig).or_insert(next);
        class_map[b] = class;
    }
    let num_classes = signatures.len();
    if num_classes > config.max_classes {
        return Err(ProteccError::CompileFailed(format!(
            "byte class limit exceeded ({num_classes} > {})",
            config.max_classes
        )));
    }
    Ok((class_map, num_classes))
}

/// Zero-width closure: entering a node set also enters every run
/// wildcard reachable without consuming input, through zero-occurrence
/// children.
fn closure(trie: &Trie, mut set: BTreeSet<u32>) -> BTreeSet<u32> {
    let mut work: Vec<u32> = set.iter().copied().collect();
    while let Some(idx) = work.pop() {
        for child in entry_children(trie, idx) {
            if matches!(trie.node(child).token, Token::Span | Token::Recursive)
                && set.insert(child)
            {
                work.push(child);
            }
        }
    }
    set
}

/// Children enterable from `idx`: direct children plus, transitively, the
/// children of any child whose modifier admits zero occurrences.
fn entry_children(trie: &Trie, idx: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut work: Vec<u32> = trie.node(idx).children.clone();
    let mut seen = BTreeSet::new();
    while let Some(child) = work.pop() {
        if !seen.insert(child) {
            continue;
        }
        out.push(child);
        if trie.node(child).modifier.allows_zero() {
            work.extend(trie.node(child).children.iter().copied());
        }
    }
    out
}

/// All nodes reachable from `set` by consuming `byte`.
fn step(trie: &Trie, set: &BTreeSet<u32>, byte: u8) -> BTreeSet<u32> {
    let mut next = BTreeSet::new();
    for &idx in set {
        let node = trie.node(idx);

        // Run wildcards and repeat modifiers keep the automaton in place.
        let self_loop = match node.token {
            Token::Span | Token::Recursive => node.token.matches_byte(byte),
            _ => node.modifier.allows_repeat() && node.token.matches_byte(byte),
        };
        if self_loop {
            next.insert(idx);
        }

        for child in entry_children(trie, idx) {
            let token = &trie.node(child).token;
            if token.consumes_one() && token.matches_byte(byte) {
                next.insert(child);
            }
        }
    }
    next
}

/// Union of terminal masks in `set`, including terminals reachable by
/// skipping zero-occurrence children at end of input.
fn accept_mask(trie: &Trie, set: &BTreeSet<u32>) -> u32 {
    let mut mask = 0u32;
    for &idx in set {
        end_perms(trie, idx, &mut mask);
    }
    mask
}

fn end_perms(trie: &Trie, idx: u32, mask: &mut u32) {
    let node = trie.node(idx);
    if node.terminal {
        *mask |= node.perms;
    }
    for &child in &node.children {
        if trie.node(child).modifier.allows_zero() {
            end_perms(trie, child, mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher;
    use containerv_common::{PERM_EXEC, PERM_READ, PERM_WRITE};

    fn trie_of(patterns: &[(&str, u32)]) -> Trie {
        let mut trie = Trie::new(false);
        for (p, perms) in patterns {
            trie.insert(p, *perms).unwrap();
        }
        trie
    }

    fn assert_equivalent(trie: &Trie, dfa: &Dfa, paths: &[&str], required: u32) {
        for path in paths {
            assert_eq!(
                matcher::matches(trie, path, required),
                dfa.matches(path, required),
                "trie/dfa disagree on {path:?}"
            );
        }
    }

    #[test]
    fn dfa_matches_simple_literals() {
        let trie = trie_of(&[("/etc/passwd", PERM_READ)]);
        let dfa = determinize(&trie, &DfaConfig::default()).unwrap();
        assert!(dfa.matches("/etc/passwd", PERM_READ));
        assert!(!dfa.matches("/etc/passw", PERM_READ));
        assert!(!dfa.matches("/etc/passwd2", PERM_READ));
    }

    #[test]
    fn dfa_equivalence_on_globs() {
        let trie = trie_of(&[
            ("/var/log/**/*.log", PERM_READ),
            ("/dev/tty[0-9]+", PERM_READ | PERM_WRITE),
            ("/usr/bin/**", PERM_READ | PERM_EXEC),
            ("/tmp/file?.txt", PERM_WRITE),
        ]);
        let dfa = determinize(&trie, &DfaConfig::default()).unwrap();
        let paths = [
            "/var/log/app.log",
            "/var/log/sub/dir/app.log",
            "/var/log/sub/app.txt",
            "/dev/tty0",
            "/dev/tty123",
            "/dev/tty",
            "/dev/ttya",
            "/usr/bin/true",
            "/usr/bin/a/b/c",
            "/usr/sbin/true",
            "/tmp/file1.txt",
            "/tmp/file.txt",
            "",
            "/",
        ];
        assert_equivalent(&trie, &dfa, &paths, PERM_READ);
        assert_equivalent(&trie, &dfa, &paths, PERM_WRITE);
        assert_equivalent(&trie, &dfa, &paths, 0);
    }

    #[test]
    fn dfa_unions_coincident_terminals() {
        let trie = trie_of(&[("/bin/*", PERM_READ), ("/bin/sh", PERM_EXEC)]);
        let dfa = determinize(&trie, &DfaConfig::default()).unwrap();
        assert_eq!(dfa.matched_perms("/bin/sh"), Some(PERM_READ | PERM_EXEC));
        assert_eq!(dfa.matched_perms("/bin/ls"), Some(PERM_READ));
    }

    #[test]
    fn state_cap_fails_compile() {
        let trie = trie_of(&[("/a/**/b/**/c/**/d", PERM_READ)]);
        let tight = DfaConfig {
            max_states: 2,
            max_classes: 32,
        };
        assert!(matches!(
            determinize(&trie, &tight),
            Err(ProteccError::CompileFailed(_))
        ));
    }

    #[test]
    fn class_map_is_dense() {
        let trie = trie_of(&[("/dev/tty[0-9]+", PERM_READ)]);
        let dfa = determinize(&trie, &DfaConfig::default()).unwrap();
        for b in 0..256usize {
            assert!((dfa.class_map[b] as u32) < dfa.num_classes);
        }
    }

    #[test]
    fn case_insensitive_dfa() {
        let mut trie = Trie::new(true);
        trie.insert("/tmp/File", PERM_READ).unwrap();
        let dfa = determinize(&trie, &DfaConfig::default()).unwrap();
        assert!(dfa.matches("/tmp/FILE", PERM_READ));
        assert!(dfa.matches("/tmp/file", PERM_READ));
        assert!(!dfa.matches("/tmp/filet", PERM_READ));
    }
}
