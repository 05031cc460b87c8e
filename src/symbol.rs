//! Grammar symbols: nonterminals and the four kinds of terminals.
use std::fmt;

use smol_str::SmolStr;

use crate::regex::{CompileRegexError, RegexTerminal};

/// A nonterminal symbol. Names are conventionally surrounded by `<…>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonTerminal(SmolStr);

impl NonTerminal {
    /// Create a nonterminal from its name.
    pub fn new(name: impl AsRef<str>) -> Self {
        NonTerminal(SmolStr::new(name.as_ref()))
    }

    /// The name of this nonterminal, including the surrounding `<…>`.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Whether this is one of the parser-internal nonterminals (`<__…>` or
    /// `<*…>`) that [`collapse`](crate::grammar::Grammar::collapse) splices
    /// out of final trees.
    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with("<__") || self.0.starts_with("<*")
    }
}

impl From<&str> for NonTerminal {
    fn from(name: &str) -> Self {
        NonTerminal::new(name)
    }
}

impl fmt::Display for NonTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A terminal symbol: a literal string, a literal byte sequence, a single
/// bit, or a compiled regex pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Terminal {
    /// A literal UTF-8 string.
    Str(String),
    /// A literal byte sequence.
    Bytes(Vec<u8>),
    /// A single bit, `0` or `1`.
    Bit(u8),
    /// A compiled regex pattern, string- or byte-domain.
    Regex(RegexTerminal),
}

impl Terminal {
    /// A literal string terminal.
    pub fn str(s: impl Into<String>) -> Self {
        Terminal::Str(s.into())
    }

    /// A literal byte-sequence terminal.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Terminal::Bytes(bytes.into())
    }

    /// A single-bit terminal. Any nonzero `bit` means 1.
    pub fn bit(bit: u8) -> Self {
        Terminal::Bit(if bit == 0 { 0 } else { 1 })
    }

    /// A string-domain regex terminal.
    pub fn regex(pattern: &str) -> Result<Self, CompileRegexError> {
        Ok(Terminal::Regex(RegexTerminal::new(pattern)?))
    }

    /// A byte-domain regex terminal.
    pub fn regex_bytes(pattern: &str) -> Result<Self, CompileRegexError> {
        Ok(Terminal::Regex(RegexTerminal::new_bytes(pattern)?))
    }

    /// Whether this terminal is a regex pattern.
    pub fn is_regex(&self) -> bool {
        matches!(self, Terminal::Regex(_))
    }

    /// Whether this terminal is a single bit.
    pub fn is_bit(&self) -> bool {
        matches!(self, Terminal::Bit(_))
    }

    /// The length in input units the literal occupies: bytes for strings and
    /// byte sequences, one for a bit. Zero for regexes, whose match length
    /// depends on the input.
    pub fn literal_len(&self) -> usize {
        match self {
            Terminal::Str(s) => s.len(),
            Terminal::Bytes(b) => b.len(),
            Terminal::Bit(_) => 1,
            Terminal::Regex(_) => 0,
        }
    }

    /// Check this terminal against the head of `word` and return the number
    /// of bytes matched. In incomplete mode a `word` that is a prefix of the
    /// literal (or of some word matching the regex) is accepted, consuming
    /// the whole remainder.
    ///
    /// Bit terminals are never matched against a byte stream; use
    /// [`Terminal::check_bit`].
    pub fn check(&self, word: &[u8], incomplete: bool) -> Option<usize> {
        match self {
            Terminal::Str(s) => check_literal(s.as_bytes(), word, incomplete),
            Terminal::Bytes(b) => check_literal(b, word, incomplete),
            Terminal::Bit(_) => None,
            Terminal::Regex(r) => r.check(word, incomplete),
        }
    }

    /// Check this terminal against a single bit.
    pub fn check_bit(&self, bit: u8) -> bool {
        matches!(self, Terminal::Bit(b) if *b == bit)
    }
}

fn check_literal(literal: &[u8], word: &[u8], incomplete: bool) -> Option<usize> {
    if !incomplete {
        word.starts_with(literal).then_some(literal.len())
    } else {
        literal.starts_with(word).then_some(word.len())
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Str(s) => write!(f, "{:?}", s),
            Terminal::Bytes(b) => {
                write!(f, "b\"")?;
                for &byte in b {
                    write!(f, "{}", std::ascii::escape_default(byte))?;
                }
                write!(f, "\"")
            }
            Terminal::Bit(bit) => write!(f, "{}", bit),
            Terminal::Regex(r) => write!(f, "{}", r),
        }
    }
}

/// A grammar symbol: a nonterminal or a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// A nonterminal.
    NonTerminal(NonTerminal),
    /// A terminal.
    Terminal(Terminal),
}

impl Symbol {
    /// Whether this symbol is a nonterminal.
    pub fn is_non_terminal(&self) -> bool {
        matches!(self, Symbol::NonTerminal(_))
    }

    /// Whether this symbol is a terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Symbol::Terminal(_))
    }

    /// The nonterminal, if this symbol is one.
    pub fn as_non_terminal(&self) -> Option<&NonTerminal> {
        match self {
            Symbol::NonTerminal(nt) => Some(nt),
            Symbol::Terminal(_) => None,
        }
    }

    /// The terminal, if this symbol is one.
    pub fn as_terminal(&self) -> Option<&Terminal> {
        match self {
            Symbol::Terminal(t) => Some(t),
            Symbol::NonTerminal(_) => None,
        }
    }
}

impl From<NonTerminal> for Symbol {
    fn from(nt: NonTerminal) -> Self {
        Symbol::NonTerminal(nt)
    }
}

impl From<Terminal> for Symbol {
    fn from(t: Terminal) -> Self {
        Symbol::Terminal(t)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::NonTerminal(nt) => write!(f, "{}", nt),
            Symbol::Terminal(t) => write!(f, "{}", t),
        }
    }
}
