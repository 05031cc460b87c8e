//! The configuration module of the weft engine.
use serde::{Deserialize, Serialize};

/// How fuzzing interprets party annotations on nonterminal references.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
pub enum FuzzingMode {
    /// Produce complete inputs; party annotations are carried but ignored.
    Complete,
    /// Produce protocol exchanges; party annotations split the derivation
    /// into per-party messages.
    Io,
}

/// The configuration of a [`Grammar`](crate::grammar::Grammar).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Config {
    /// The number of repetitions an unbounded repetition (`*`, `+`, or an
    /// omitted upper bound) expands to when fuzzing.
    /// The default is `5`.
    pub max_repetitions: usize,
    /// The fuzzing mode. The default is [`FuzzingMode::Complete`].
    pub fuzzing_mode: FuzzingMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_repetitions: 5,
            fuzzing_mode: FuzzingMode::Complete,
        }
    }
}
