//! Glob pattern parsing into a shared-prefix trie.
//!
//! One left-to-right pass per pattern. `*` and `**` are told apart with a
//! two-character lookahead; `**` is only legal before a `/` or the end of
//! the pattern. A `?`, `+` or `*` directly after a charset or range token
//! attaches to that token as a modifier instead of starting a new token.

use crate::error::ProteccError;

/// 256-bit membership bitmap for `[...]` tokens.
pub const CHARSET_WORDS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Synthetic root; matches nothing, owns the top-level children.
    Root,
    /// One exact byte.
    Literal(u8),
    /// `?` — exactly one byte, any value.
    Any,
    /// `*` — any run of bytes not containing `/` (may be empty).
    Span,
    /// `**` — any run of bytes, `/` allowed (may be empty).
    Recursive,
    /// `[abc0-9]` — membership bitmap.
    Charset([u64; CHARSET_WORDS]),
    /// `[a-z]` — single inclusive range.
    Range(u8, u8),
}

impl Token {
    /// Whether this token consumes exactly one byte per occurrence.
    pub fn consumes_one(&self) -> bool {
        matches!(
            self,
            Token::Literal(_) | Token::Any | Token::Charset(_) | Token::Range(_, _)
        )
    }

    /// Single-byte match test. Span/recursive runs are handled by the
    /// matcher, not here.
    pub fn matches_byte(&self, b: u8) -> bool {
        match self {
            Token::Root => false,
            Token::Literal(c) => *c == b,
            Token::Any => true,
            Token::Span => b != b'/',
            Token::Recursive => true,
            Token::Charset(words) => words[(b >> 6) as usize] & (1u64 << (b & 63)) != 0,
            Token::Range(lo, hi) => *lo <= b && b <= *hi,
        }
    }
}

/// Occurrence modifier attached to a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modifier {
    #[default]
    None,
    /// `?` — zero or one occurrence.
    Optional,
    /// `+` — one or more occurrences.
    OneOrMore,
    /// `*` — zero or more occurrences.
    ZeroOrMore,
}

impl Modifier {
    pub fn allows_zero(self) -> bool {
        matches!(self, Modifier::Optional | Modifier::ZeroOrMore)
    }

    pub fn allows_repeat(self) -> bool {
        matches!(self, Modifier::OneOrMore | Modifier::ZeroOrMore)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub token: Token,
    pub modifier: Modifier,
    pub terminal: bool,
    /// Permission mask; meaningful only on terminal nodes.
    pub perms: u32,
    /// Ordered child indices into the owning trie's node arena.
    pub children: Vec<u32>,
}

impl Node {
    fn new(token: Token, modifier: Modifier) -> Self {
        Self {
            token,
            modifier,
            terminal: false,
            perms: 0,
            children: Vec::new(),
        }
    }
}

/// Pattern trie. Nodes live in one arena; patterns share prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trie {
    pub nodes: Vec<Node>,
    pub root: u32,
    pub case_insensitive: bool,
    pub pattern_count: u32,
    pub max_depth: u32,
}

impl Trie {
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            nodes: vec![Node::new(Token::Root, Modifier::None)],
            root: 0,
            case_insensitive,
            pattern_count: 0,
            max_depth: 0,
        }
    }

    pub fn node(&self, idx: u32) -> &Node {
        &self.nodes[idx as usize]
    }

    fn fold(&self, b: u8) -> u8 {
        if self.case_insensitive {
            b.to_ascii_lowercase()
        } else {
            b
        }
    }

    /// Insert one pattern with its permission mask.
    pub fn insert(&mut self, pattern: &str, perms: u32) -> Result<(), ProteccError> {
        if pattern.is_empty() {
            return Err(ProteccError::pattern(pattern, "empty pattern"));
        }
        let tokens = tokenize(pattern, self.case_insensitive)?;
        let mut cur = self.root;
        let mut depth = 0u32;
        for (token, modifier) in tokens {
            cur = self.child_or_insert(cur, token, modifier);
            depth += 1;
        }
        let node = &mut self.nodes[cur as usize];
        node.terminal = true;
        node.perms |= perms;
        self.pattern_count += 1;
        self.max_depth = self.max_depth.max(depth);
        Ok(())
    }

    fn child_or_insert(&mut self, parent: u32, token: Token, modifier: Modifier) -> u32 {
        let existing = self.nodes[parent as usize]
            .children
            .iter()
            .copied()
            .find(|&c| {
                let n = &self.nodes[c as usize];
                n.token == token && n.modifier == modifier
            });
        if let Some(idx) = existing {
            return idx;
        }
        let idx = self.nodes.len() as u32;
        self.nodes.push(Node::new(token, modifier));
        self.nodes[parent as usize].children.push(idx);
        idx
    }

    /// Byte folded according to the trie's case flag; inputs to the
    /// matcher go through this so compile and match agree.
    pub fn normalize(&self, b: u8) -> u8 {
        self.fold(b)
    }
}

fn tokenize(pattern: &str, fold_case: bool) -> Result<Vec<(Token, Modifier)>, ProteccError> {
    let bytes = pattern.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        let token = match bytes[i] {
            b'*' if bytes.get(i + 1) == Some(&b'*') => {
                // `**` must stand alone in its component: end of pattern
                // or a component separator which the wildcard absorbs.
                match bytes.get(i + 2) {
                    None => i += 2,
                    Some(b'/') => i += 3,
                    Some(_) => {
                        return Err(ProteccError::pattern(
                            pattern,
                            "'**' must be followed by '/' or end of pattern",
                        ))
                    }
                }
                Token::Recursive
            }
            b'*' => {
                i += 1;
                Token::Span
            }
            b'?' => {
                i += 1;
                Token::Any
            }
            b'[' => {
                let (token, next) = parse_bracket(pattern, bytes, i, fold_case)?;
                i = next;
                token
            }
            c => {
                i += 1;
                Token::Literal(if fold_case { c.to_ascii_lowercase() } else { c })
            }
        };

        // Post-quantifiers bind to the charset/range just produced.
        let modifier = if matches!(token, Token::Charset(_) | Token::Range(_, _)) {
            match bytes.get(i) {
                Some(b'?') => {
                    i += 1;
                    Modifier::Optional
                }
                Some(b'+') => {
                    i += 1;
                    Modifier::OneOrMore
                }
                Some(b'*') => {
                    i += 1;
                    Modifier::ZeroOrMore
                }
                _ => Modifier::None,
            }
        } else {
            Modifier::None
        };

        out.push((token, modifier));
    }
    Ok(out)
}

fn parse_bracket(
    pattern: &str,
    bytes: &[u8],
    start: usize,
    fold_case: bool,
) -> Result<(Token, usize), ProteccError> {
    let mut i = start + 1;
    let mut words = [0u64; CHARSET_WORDS];
    let mut single_range: Option<(u8, u8)> = None;
    let mut items = 0usize;

    let fold = |b: u8| if fold_case { b.to_ascii_lowercase() } else { b };
    let mut set = |words: &mut [u64; CHARSET_WORDS], b: u8| {
        words[(b >> 6) as usize] |= 1u64 << (b & 63);
    };

    while i < bytes.len() && bytes[i] != b']' {
        let lo = bytes[i];
        if bytes.get(i + 1) == Some(&b'-') && bytes.get(i + 2).is_some_and(|&b| b != b']') {
            let hi = bytes[i + 2];
            if lo > hi {
                return Err(ProteccError::pattern(pattern, "range start exceeds end"));
            }
            let (lo, hi) = (fold(lo), fold(hi));
            for b in lo..=hi {
                set(&mut words, b);
            }
            single_range = if items == 0 { Some((lo, hi)) } else { None };
            i += 3;
        } else {
            set(&mut words, fold(lo));
            single_range = None;
            i += 1;
        }
        items += 1;
    }
    if i >= bytes.len() {
        return Err(ProteccError::pattern(pattern, "unterminated '['"));
    }
    if items == 0 {
        return Err(ProteccError::pattern(pattern, "empty charset"));
    }

    let token = match single_range {
        Some((lo, hi)) if items == 1 => Token::Range(lo, hi),
        _ => Token::Charset(words),
    };
    Ok((token, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(p: &str) -> Vec<(Token, Modifier)> {
        tokenize(p, false).unwrap()
    }

    #[test]
    fn literal_run() {
        let t = toks("/dev");
        assert_eq!(t.len(), 4);
        assert_eq!(t[0].0, Token::Literal(b'/'));
        assert_eq!(t[3].0, Token::Literal(b'v'));
    }

    #[test]
    fn star_vs_double_star() {
        let t = toks("/a/*");
        assert_eq!(t.last().unwrap().0, Token::Span);

        let t = toks("/a/**");
        assert_eq!(t.last().unwrap().0, Token::Recursive);

        // '**' absorbs the separator that follows it
        let t = toks("/a/**/b");
        assert!(matches!(t[3].0, Token::Recursive));
        assert_eq!(t[4].0, Token::Literal(b'b'));
    }

    #[test]
    fn double_star_must_end_component() {
        assert!(tokenize("/a/**x", false).is_err());
    }

    #[test]
    fn range_with_quantifier() {
        let t = toks("tty[0-9]+");
        let (token, modifier) = t.last().unwrap();
        assert_eq!(*token, Token::Range(b'0', b'9'));
        assert_eq!(*modifier, Modifier::OneOrMore);
    }

    #[test]
    fn charset_combination() {
        let t = toks("[a-z0-9_]");
        match &t[0].0 {
            Token::Charset(_) => {}
            other => panic!("expected charset, got {other:?}"),
        }
        assert!(t[0].0.matches_byte(b'q'));
        assert!(t[0].0.matches_byte(b'7'));
        assert!(t[0].0.matches_byte(b'_'));
        assert!(!t[0].0.matches_byte(b'-'));
    }

    #[test]
    fn bad_range_rejected() {
        assert!(tokenize("[z-a]", false).is_err());
        assert!(tokenize("[abc", false).is_err());
        assert!(tokenize("[]", false).is_err());
    }

    #[test]
    fn insert_shares_prefixes() {
        let mut trie = Trie::new(false);
        trie.insert("/dev/tty0", 1).unwrap();
        trie.insert("/dev/tty1", 1).unwrap();
        // "/dev/tty" shared (8 nodes) + root + 2 leaves
        assert_eq!(trie.nodes.len(), 1 + 8 + 2);
        assert_eq!(trie.pattern_count, 2);
    }

    #[test]
    fn empty_pattern_rejected() {
        let mut trie = Trie::new(false);
        assert!(trie.insert("", 1).is_err());
    }

    #[test]
    fn case_fold_applies_to_literals_and_ranges() {
        let mut trie = Trie::new(true);
        trie.insert("/Tmp/[A-F]", 1).unwrap();
        let has_upper = trie.nodes.iter().any(|n| match n.token {
            Token::Literal(c) => c.is_ascii_uppercase(),
            Token::Range(lo, hi) => lo.is_ascii_uppercase() || hi.is_ascii_uppercase(),
            _ => false,
        });
        assert!(!has_upper);
    }
}
