//! Regex terminals backed by anchored dense DFAs.
//!
//! A [`RegexTerminal`] lives in either the string domain (Unicode patterns
//! matched against UTF-8 text) or the byte domain (patterns matched against
//! arbitrary bytes). Matching walks the DFA directly so that the parser can
//! distinguish a definite mismatch from an input that is merely a prefix of
//! some matching word, which the plain find APIs cannot report.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rand::Rng;
use regex_automata::dfa::dense;
use regex_automata::dfa::Automaton;
use regex_automata::dfa::StartKind;
use regex_automata::util::primitives::StateID;
use regex_automata::util::start;
use regex_automata::util::syntax;
use regex_automata::Anchored;
use regex_syntax::hir::{Class, Hir, HirKind};
use regex_syntax::ParserBuilder;

use crate::utils::dispatch_by_dfa_state_status;

#[derive(Debug, thiserror::Error)]
/// The error type for errors in [`RegexTerminal`] creation.
pub enum CompileRegexError {
    #[error("regex compilation error: {0}")]
    /// Error due to building the DFA from the pattern.
    Build(#[from] dense::BuildError),
    #[error("regex initialization error: {0}")]
    /// Error when computing the start state for the DFA.
    DfaStart(#[from] regex_automata::dfa::StartError),
    #[error("regex syntax error: {0}")]
    /// Error due to parsing the pattern for the sampler.
    Syntax(#[from] Box<regex_syntax::Error>),
}

/// A compiled regex terminal, in the string or byte domain.
#[derive(Clone)]
pub struct RegexTerminal {
    pattern: String,
    bytes: bool,
    dfa: Arc<dense::DFA<Vec<u32>>>,
    start: StateID,
    nullable: bool,
    hir: Arc<Hir>,
}

impl RegexTerminal {
    /// Compile `pattern` in the string domain.
    pub fn new(pattern: &str) -> Result<Self, CompileRegexError> {
        Self::compile(pattern, false)
    }

    /// Compile `pattern` in the byte domain. The pattern is matched against
    /// raw bytes; `.` and classes range over `0..=255`.
    pub fn new_bytes(pattern: &str) -> Result<Self, CompileRegexError> {
        Self::compile(pattern, true)
    }

    fn compile(pattern: &str, bytes: bool) -> Result<Self, CompileRegexError> {
        let dfa = dense::Builder::new()
            .configure(dense::Config::new().start_kind(StartKind::Anchored))
            .syntax(syntax::Config::new().unicode(!bytes).utf8(!bytes))
            .build(pattern)?;
        let start = dfa.start_state(&start::Config::new().anchored(Anchored::Yes))?;
        let nullable = dfa.is_match_state(dfa.next_eoi_state(start));
        let hir = ParserBuilder::new()
            .unicode(!bytes)
            .utf8(!bytes)
            .build()
            .parse(pattern)
            .map_err(Box::new)?;
        Ok(Self {
            pattern: pattern.to_string(),
            bytes,
            dfa: Arc::new(dfa),
            start,
            nullable,
            hir: Arc::new(hir),
        })
    }

    /// The pattern text this terminal was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether this terminal lives in the byte domain.
    pub fn is_bytes(&self) -> bool {
        self.bytes
    }

    /// Match at the head of `word`. Returns the length of the longest
    /// anchored match, or `None`.
    ///
    /// In incomplete mode, returns `Some(word.len())` iff `word` is a prefix
    /// of some matching word (the whole remainder is consumed), `None`
    /// otherwise.
    pub(crate) fn check(&self, word: &[u8], incomplete: bool) -> Option<usize> {
        if incomplete {
            return self.check_prefix(word);
        }
        let dfa = &*self.dfa;
        let mut state = self.start;
        let mut last_match = if self.nullable { Some(0) } else { None };
        // Matches reported by the DFA are delayed by one byte: a match ending
        // at offset i is flagged on the transition consuming byte i, and a
        // match ending at the end of the word is flagged on the EOI
        // transition.
        for (i, &b) in word.iter().enumerate() {
            state = dfa.next_state(state, b);
            if dfa.is_special_state(state) {
                if dfa.is_match_state(state) {
                    last_match = Some(i);
                } else if dfa.is_dead_state(state) || dfa.is_quit_state(state) {
                    return last_match;
                }
            }
        }
        let eoi = dfa.next_eoi_state(state);
        if dfa.is_match_state(eoi) {
            last_match = Some(word.len());
        }
        last_match
    }

    fn check_prefix(&self, word: &[u8]) -> Option<usize> {
        let dfa = &*self.dfa;
        let mut state = self.start;
        for &b in word {
            state = dfa.next_state(state, b);
            dispatch_by_dfa_state_status!(state, dfa,
                accept => {},
                reject => { return None; },
                in_progress => {}
            );
        }
        Some(word.len())
    }

    /// Sample one word matching the pattern. Unbounded repetitions are capped
    /// at `min + max_repetitions` copies.
    pub(crate) fn sample<R: Rng + ?Sized>(&self, rng: &mut R, max_repetitions: usize) -> Vec<u8> {
        let mut out = Vec::new();
        sample_hir(&self.hir, rng, max_repetitions as u32, &mut out);
        out
    }
}

impl PartialEq for RegexTerminal {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.bytes == other.bytes
    }
}

impl Eq for RegexTerminal {}

impl Hash for RegexTerminal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
        self.bytes.hash(state);
    }
}

impl fmt::Debug for RegexTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegexTerminal")
            .field("pattern", &self.pattern)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl fmt::Display for RegexTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes {
            write!(f, "rb\"{}\"", self.pattern)
        } else {
            write!(f, "r\"{}\"", self.pattern)
        }
    }
}

fn sample_hir<R: Rng + ?Sized>(hir: &Hir, rng: &mut R, max_rep: u32, out: &mut Vec<u8>) {
    match hir.kind() {
        HirKind::Empty | HirKind::Look(_) => {}
        HirKind::Literal(lit) => out.extend_from_slice(&lit.0),
        HirKind::Class(Class::Unicode(class)) => {
            let ranges = class.ranges();
            if ranges.is_empty() {
                return;
            }
            let range = &ranges[rng.random_range(0..ranges.len())];
            let cp = rng.random_range(range.start() as u32..=range.end() as u32);
            let c = char::from_u32(cp).unwrap_or(range.start());
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
        HirKind::Class(Class::Bytes(class)) => {
            let ranges = class.ranges();
            if ranges.is_empty() {
                return;
            }
            let range = &ranges[rng.random_range(0..ranges.len())];
            out.push(rng.random_range(range.start()..=range.end()));
        }
        HirKind::Repetition(rep) => {
            let min = rep.min;
            let max = rep.max.unwrap_or_else(|| min.saturating_add(max_rep));
            let count = rng.random_range(min..=max.max(min));
            for _ in 0..count {
                sample_hir(&rep.sub, rng, max_rep, out);
            }
        }
        HirKind::Capture(capture) => sample_hir(&capture.sub, rng, max_rep, out),
        HirKind::Concat(parts) => {
            for part in parts {
                sample_hir(part, rng, max_rep, out);
            }
        }
        HirKind::Alternation(parts) => {
            if parts.is_empty() {
                return;
            }
            sample_hir(&parts[rng.random_range(0..parts.len())], rng, max_rep, out);
        }
    }
}
