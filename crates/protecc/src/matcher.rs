//! Trie matching with an explicit work stack.
//!
//! A frame `(node, pos)` records that `node`'s token has been consumed and
//! `pos` bytes of the input are behind us. Wildcard runs branch on every
//! admissible end position; a visited set keeps the walk linear in
//! `nodes × positions`.

use std::collections::HashSet;

use crate::pattern::{Modifier, Token, Trie};

/// Union of the permission masks of every pattern accepting `path`, or
/// `None` when no pattern accepts.
pub fn matched_perms(trie: &Trie, path: &str) -> Option<u32> {
    let input: Vec<u8> = path.bytes().map(|b| trie.normalize(b)).collect();
    let len = input.len();

    let mut stack: Vec<(u32, usize)> = vec![(trie.root, 0)];
    let mut seen: HashSet<(u32, usize)> = HashSet::new();
    let mut accepted = false;
    let mut perms = 0u32;

    while let Some((idx, pos)) = stack.pop() {
        if !seen.insert((idx, pos)) {
            continue;
        }
        let node = trie.node(idx);

        if pos == len {
            collect_end_perms(trie, idx, &mut accepted, &mut perms);
        }

        // Repetition of the node's own token (`+` / `*` modifiers).
        if node.modifier.allows_repeat()
            && node.token.consumes_one()
            && pos < len
            && node.token.matches_byte(input[pos])
        {
            stack.push((idx, pos + 1));
        }

        push_children(trie, idx, pos, &input, &mut stack);
    }

    accepted.then_some(perms)
}

/// `true` iff some accepted pattern set covers `required`.
///
/// The effective mask is the OR across every accepting pattern, so two
/// patterns granting read and write separately satisfy read+write.
pub fn matches(trie: &Trie, path: &str, required: u32) -> bool {
    match matched_perms(trie, path) {
        Some(perms) => perms & required == required,
        None => false,
    }
}

/// Expand `parent`'s children (and the children of zero-occurrence
/// charset/range children, transitively) against the input at `pos`.
fn push_children(trie: &Trie, parent: u32, pos: usize, input: &[u8], stack: &mut Vec<(u32, usize)>) {
    let len = input.len();
    let mut work: Vec<u32> = trie.node(parent).children.iter().rev().copied().collect();
    let mut expanded: HashSet<u32> = HashSet::new();

    while let Some(child) = work.pop() {
        let node = trie.node(child);
        match &node.token {
            Token::Root => {}
            Token::Span => {
                // Every split point up to the next separator, empty run
                // included.
                let mut end = pos;
                stack.push((child, end));
                while end < len && input[end] != b'/' {
                    end += 1;
                    stack.push((child, end));
                }
            }
            Token::Recursive => {
                for end in pos..=len {
                    stack.push((child, end));
                }
            }
            token => {
                if pos < len && token.matches_byte(input[pos]) {
                    stack.push((child, pos + 1));
                }
            }
        }

        // A zero-occurrence child exposes its own children at this
        // position.
        if node.modifier.allows_zero() && expanded.insert(child) {
            work.extend(node.children.iter().rev().copied());
        }
    }
}

/// Accumulate terminal masks reachable at end-of-input from `idx`: the
/// node itself plus any chain of children whose modifiers admit zero
/// occurrences.
fn collect_end_perms(trie: &Trie, idx: u32, accepted: &mut bool, perms: &mut u32) {
    let node = trie.node(idx);
    if node.terminal {
        *accepted = true;
        *perms |= node.perms;
    }
    for &child in &node.children {
        if trie.node(child).modifier.allows_zero() {
            collect_end_perms(trie, child, accepted, perms);
        }
    }
}
