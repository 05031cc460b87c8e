/*!
# Weft

This crate provides a constraint-guided input generator: given a context-free
grammar with optional semantic generator functions attached to selected
nonterminals, it produces syntactically valid inputs — strings, byte
sequences, or bit sequences, freely mixed — and parses inputs back into
derivation trees. It is meant as the core of grammar-based fuzzers and
structured test-data generators: an outer search loop fuzzes trees, mutates
them, and re-parses the results; this crate owns the trees, the grammar
representation, the fuzzer, and the parser.

Here is a quick example of how this crate works:

```rust
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use weft::Grammar;

// <start> ::= <digit>+ ; <digit> ::= "0" | ... | "9"
let mut builder = Grammar::builder();
let digits: Vec<_> = (0..10).map(|d| builder.literal(&d.to_string())).collect();
let digit = builder.alternative(digits);
builder.rule("<digit>", digit);
let digit_ref = builder.nonterminal("<digit>");
let body = builder.plus(digit_ref);
builder.rule("<start>", body);
let mut grammar = builder.build().unwrap();
grammar.prime().unwrap();

let mut rng = ChaCha8Rng::seed_from_u64(1);
let tree = grammar.fuzz(&mut rng, "<start>", 50).unwrap();
assert!(!tree.to_bytes().is_empty());

let parsed = grammar.parse(tree.to_bytes(), "<start>").unwrap();
assert_eq!(parsed.to_bytes(), tree.to_bytes());
```

# Overview

The primary types in this crate are [`Grammar`] and [`DerivationTree`].

- [`Grammar::new`] constructs a grammar in one call from assembled
  [`Rule`] bodies, generators, and an environment; [`Grammar::builder`]
  builds the same IR incrementally: alternatives, concatenations,
  repetitions (optionally with data-dependent bounds), nonterminal
  references, literal/bit/regex terminals and character sets.
  [`Grammar::prime`] computes, once, how far every IR node is from a
  finished derivation; it must run before fuzzing and rejects
  non-terminating grammars.
- [`Grammar::fuzz`] expands a nonterminal into a random [`DerivationTree`]
  under a node budget, consulting the primed distances to finish cheaply
  when the budget runs out. The RNG is threaded explicitly, so a seeded run
  is reproducible.
- [`Grammar::parse`] runs an Earley-style chart parser generalised over a
  mixed byte/bit unit stream. Incomplete mode
  ([`ParseOptions::incomplete`]) accepts prefixes of valid inputs and
  yields partial derivations; [`Grammar::parse_forest`] yields every parse
  lazily.
- Generators ([`Generator`]) attach a closure to a nonterminal. When the
  fuzzer reaches it, the generator's parameter nonterminals are fuzzed
  first, handed to the closure, and the closure's output is re-parsed under
  the nonterminal; the parameter trees are recorded as the result's
  *sources*, and the generated children are locked read-only so mutation
  cannot tear output and sources apart.
- Repetition bounds may be expressions over the tree parsed or fuzzed so
  far ([`BoundExpr::with_query`]), which is how length-prefixed formats
  (`<len> <byte>{int(len)}`) are expressed.

# Performance

Parsing cost is Earley-scale; that is the price for data-dependent
repetitions and mixed bit/byte grammars. Grammar ambiguity is the dominant
factor for long inputs. Right-recursive repetitions (`+`, `*`) are
compacted by a per-column shortcut, so repetitions tens of thousands of
elements long parse without a quadratic chart walk. Fully drained parse
forests are cached by input hash; [`Grammar::update`] rebuilds the tables
and drops the cache.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod config;
mod coverage;
pub mod expr;
mod fuzzer;
pub mod grammar;
pub mod parser;
pub mod regex;
pub mod symbol;
pub mod tree;
mod utils;

pub use config::{Config, FuzzingMode};
pub use expr::{Environment, Expr, ExprError, Scope, TreeQuery, Value};
pub use grammar::{
    BoundError, BoundExpr, FuzzError, Generator, GeneratorArgs, GeneratorValue, Grammar,
    GrammarBuilder, GrammarError, IrId, Rule, Suggestion,
};
pub use parser::{ParseError, ParseForest, ParseInput, ParseOptions, ParsingMode};
pub use regex::{CompileRegexError, RegexTerminal};
pub use symbol::{NonTerminal, Symbol, Terminal};
pub use tree::{DerivationTree, NodeId, ProtocolMessage, ValueError};
