//! The grammar: an arena of IR nodes behind per-nonterminal rules, optional
//! generator closures, the evaluation environment, and the compiled parser.
use std::fmt;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use rand::Rng;
use smol_str::SmolStr;

use crate::config::{Config, FuzzingMode};
use crate::expr::{Environment, Expr, ExprError, TreeQuery, Value};
use crate::fuzzer;
use crate::parser::{ParseError, ParseForest, ParseInput, ParseOptions, Parser};
use crate::symbol::{NonTerminal, Terminal};
use crate::tree::{DerivationTree, NodeId, ValueError};

/// Index of a node within a grammar's IR arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrId(pub(crate) u32);

impl IrId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The grammar IR. Nodes reference each other by [`IrId`], so rule bodies
/// form a graph owned by the grammar.
#[derive(Debug, Clone)]
pub(crate) enum IrNode {
    Alternative(Vec<IrId>),
    Concatenation(Vec<IrId>),
    Repetition(RepetitionNode),
    NonTerminalRef(NonTerminalRef),
    Terminal(Terminal),
    CharSet(Vec<char>),
}

#[derive(Debug, Clone)]
pub(crate) struct NonTerminalRef {
    pub symbol: NonTerminal,
    pub sender: Option<SmolStr>,
    pub recipient: Option<SmolStr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum RepetitionKind {
    Repetition,
    Star,
    Plus,
    Option,
}

#[derive(Debug, Clone)]
pub(crate) struct RepetitionNode {
    pub inner: IrId,
    pub kind: RepetitionKind,
    pub min: BoundExpr,
    pub max: BoundExpr,
    /// Cached value of a pure `min` bound, filled in by priming. `max` is
    /// deliberately never cached so environment updates keep taking effect.
    pub static_min: Option<usize>,
}

impl RepetitionNode {
    pub(crate) fn min_count(
        &self,
        env: &Environment,
        config: &Config,
        tree: Option<(&mut DerivationTree, NodeId)>,
    ) -> Result<usize, BoundError> {
        if let Some(cached) = self.static_min {
            return Ok(cached);
        }
        self.min.evaluate(env, config, tree).map(|(n, _)| n)
    }

    pub(crate) fn max_count(
        &self,
        env: &Environment,
        config: &Config,
        tree: Option<(&mut DerivationTree, NodeId)>,
    ) -> Result<usize, BoundError> {
        self.max.evaluate(env, config, tree).map(|(n, _)| n)
    }

    pub(crate) fn has_searches(&self) -> bool {
        self.min.has_searches() || self.max.has_searches()
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for evaluating repetition bounds.
pub enum BoundError {
    /// The bound expression failed to parse or evaluate.
    #[error(transparent)]
    Expr(#[from] ExprError),
    /// A computed bound must use exactly one search.
    #[error("computed repetition requires exactly one or zero searches")]
    MultipleSearches,
    /// The bound needs a surrounding derivation tree to resolve its search.
    #[error("bound expression {0:?} needs a derivation tree context")]
    NeedsTree(String),
    /// The search did not match anything in the surrounding tree.
    #[error("couldn't find search target {0} for computed repetition")]
    TargetNotFound(String),
    /// The search target aggregates to no value.
    #[error("search target {0} has no value")]
    NoValue(String),
    /// The bound evaluated to a negative number.
    #[error("repetition bound evaluated to {0}")]
    Negative(i128),
    /// Aggregating the search target's value failed.
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// A repetition bound: expression source text, the parsed expression, and
/// the tree searches binding its identifiers. The source text `"None"`
/// stands for the configured maximum repetition count.
#[derive(Debug, Clone)]
pub struct BoundExpr {
    source: String,
    expr: Option<Expr>,
    searches: Vec<(String, TreeQuery)>,
}

impl BoundExpr {
    /// A constant bound.
    pub fn literal(n: usize) -> Self {
        BoundExpr {
            source: n.to_string(),
            expr: Some(Expr::Int(n as i128)),
            searches: Vec::new(),
        }
    }

    /// The unbounded sentinel, standing for
    /// [`Config::max_repetitions`](crate::config::Config::max_repetitions).
    pub fn unbounded() -> Self {
        BoundExpr {
            source: "None".to_string(),
            expr: None,
            searches: Vec::new(),
        }
    }

    /// Parse a pure bound expression. Identifiers resolve against the
    /// grammar environment.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        if source == "None" {
            return Ok(Self::unbounded());
        }
        Ok(BoundExpr {
            source: source.to_string(),
            expr: Some(Expr::parse(source)?),
            searches: Vec::new(),
        })
    }

    /// Parse a bound expression whose identifier `name` is bound to the
    /// value of the subtree located by `query` in the surrounding
    /// derivation.
    pub fn with_query(
        source: &str,
        name: impl Into<String>,
        query: TreeQuery,
    ) -> Result<Self, ExprError> {
        Ok(BoundExpr {
            source: source.to_string(),
            expr: Some(Expr::parse(source)?),
            searches: vec![(name.into(), query)],
        })
    }

    /// The source text of this bound.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether this bound depends on the surrounding derivation tree.
    pub fn has_searches(&self) -> bool {
        !self.searches.is_empty()
    }

    /// Evaluate the bound. Returns the count and whether the result is
    /// static (no searches involved). When searches are present, the target
    /// subtree and the paths leading to it are marked read-only, locking the
    /// dependency against later mutation.
    pub(crate) fn evaluate(
        &self,
        env: &Environment,
        config: &Config,
        tree: Option<(&mut DerivationTree, NodeId)>,
    ) -> Result<(usize, bool), BoundError> {
        let Some(expr) = &self.expr else {
            return Ok((config.max_repetitions, true));
        };
        let mut scope = env.scope();
        if self.searches.is_empty() {
            let n = expr.eval(&scope)?.as_int()?;
            let n = usize::try_from(n).map_err(|_| BoundError::Negative(n))?;
            return Ok((n, true));
        }
        let Some((tree, node)) = tree else {
            return Err(BoundError::NeedsTree(self.source.clone()));
        };
        if self.searches.len() != 1 {
            return Err(BoundError::MultipleSearches);
        }
        let (name, query) = &self.searches[0];
        let matches = query.find(tree, tree.root());
        let &target = matches
            .last()
            .ok_or_else(|| BoundError::TargetNotFound(name.clone()))?;
        let value = tree
            .value(target)?
            .ok_or_else(|| BoundError::NoValue(name.clone()))?;

        // Lock the dependency: the searched subtree and the ancestor chains
        // diverging from the common prefix must not be mutated afterwards,
        // or the bound would no longer hold.
        tree.set_all_read_only(target, true);
        let target_path = tree.path(target);
        let node_path = tree.path(node);
        let mut first_uncommon = 0;
        for (i, (&a, &b)) in target_path.iter().zip(node_path.iter()).enumerate() {
            if tree.symbol(a) == tree.symbol(b) {
                first_uncommon = i + 1;
            } else {
                break;
            }
        }
        for &p in target_path.get(first_uncommon..).unwrap_or_default() {
            tree.set_read_only(p, true);
        }
        for &p in node_path.get(first_uncommon..).unwrap_or_default() {
            tree.set_read_only(p, true);
        }

        scope.bind(name.clone(), value);
        let n = expr.eval(&scope)?.as_int()?;
        let n = usize::try_from(n).map_err(|_| BoundError::Negative(n))?;
        Ok((n, false))
    }
}

/// A suggestion attached to name-lookup errors, produced by fuzzy matching
/// against the defined nonterminals.
#[derive(Debug, Clone, Default)]
pub struct Suggestion(pub Option<String>);

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(name) => write!(f, ". Did you mean {}?", name),
            None => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for grammar validation at construction and priming time.
pub enum GrammarError {
    /// A referenced nonterminal has no rule.
    #[error("symbol {symbol} not defined in grammar{suggestion}")]
    UnknownNonTerminal {
        /// The undefined nonterminal.
        symbol: NonTerminal,
        /// The closest defined name, if any.
        suggestion: Suggestion,
    },
    /// No finite derivation exists from the named nonterminal.
    #[error("grammar cannot produce a finite derivation from {0}")]
    NonTerminating(NonTerminal),
    /// A generator was invoked without one of its parameters.
    #[error("{symbol}: missing generator parameter {param}")]
    MissingGeneratorParameter {
        /// The generator's nonterminal.
        symbol: NonTerminal,
        /// The missing parameter name.
        param: String,
    },
    /// A generator parameter needs a converter generator of its own.
    #[error("{symbol}: missing converter from {dependency} ({symbol} ::= ... := f({dependency}))")]
    MissingConverter {
        /// The parameter's nonterminal.
        symbol: NonTerminal,
        /// The generator this parameter feeds.
        dependency: NonTerminal,
    },
    /// The generator dependency graph has a cycle.
    #[error("cycle in generator dependencies involving {0}")]
    GeneratorCycle(NonTerminal),
    /// A nonterminal has no generator attached.
    #[error("{0}: no generator")]
    NoGenerator(NonTerminal),
    /// A message definition nests inside another message definition.
    #[error("found nested message definition under {0}")]
    NestedMessages(NonTerminal),
    /// A static repetition bound failed to evaluate at compile time.
    #[error("repetition bound {source:?} failed to evaluate")]
    Bound {
        /// The bound's source text.
        source: String,
        /// The evaluation failure.
        #[source]
        error: BoundError,
    },
    /// The grammar has no k-paths of the requested length.
    #[error("no {0}-paths found in the grammar")]
    EmptyKPaths(usize),
}

#[derive(Debug, thiserror::Error)]
/// The error type for fuzzing.
pub enum FuzzError {
    /// Grammar validation failed during expansion.
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    /// A repetition bound could not be evaluated.
    #[error(transparent)]
    Bound(#[from] BoundError),
    /// A generator closure reported a failure.
    #[error("generator for {symbol} failed: {reason}")]
    GeneratorFailed {
        /// The generator's nonterminal.
        symbol: NonTerminal,
        /// The closure's error message.
        reason: String,
    },
    /// A generator's output does not parse under its declared nonterminal.
    #[error("could not parse {output:?} (produced by the generator) into {symbol}")]
    GeneratorProduce {
        /// The generator's nonterminal.
        symbol: NonTerminal,
        /// The offending output, rendered for display.
        output: String,
    },
}

/// The value produced by a generator closure. The output is re-parsed under
/// the generator's nonterminal; integers parse via their decimal form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorValue {
    /// A string surface.
    Str(String),
    /// A byte surface.
    Bytes(Vec<u8>),
    /// An integer, rendered in decimal.
    Int(i128),
}

impl GeneratorValue {
    fn surface(&self) -> Vec<u8> {
        match self {
            GeneratorValue::Str(s) => s.as_bytes().to_vec(),
            GeneratorValue::Bytes(b) => b.clone(),
            GeneratorValue::Int(i) => i.to_string().into_bytes(),
        }
    }
}

impl fmt::Display for GeneratorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratorValue::Str(s) => write!(f, "{:?}", s),
            GeneratorValue::Bytes(b) => write!(f, "{}", Terminal::Bytes(b.clone())),
            GeneratorValue::Int(i) => write!(f, "{}", i),
        }
    }
}

/// The arguments handed to a generator closure: one derivation tree per
/// declared parameter, addressed by the parameter's identifier.
pub struct GeneratorArgs<'a> {
    values: AHashMap<&'a str, &'a DerivationTree>,
}

impl<'a> GeneratorArgs<'a> {
    /// The parameter's derivation tree.
    pub fn tree(&self, name: &str) -> Option<&'a DerivationTree> {
        self.values.get(name).copied()
    }

    /// The parameter's aggregate value.
    pub fn value(&self, name: &str) -> Option<Value> {
        let tree = self.tree(name)?;
        tree.value(tree.root()).ok().flatten()
    }

    /// The parameter's value as an integer.
    pub fn int(&self, name: &str) -> Option<i128> {
        self.value(name)?.as_int().ok()
    }

    /// The parameter's surface as a string.
    pub fn string(&self, name: &str) -> Option<String> {
        Some(self.tree(name)?.to_string())
    }
}

/// The closure type backing a [`Generator`].
pub type GeneratorFn =
    Arc<dyn Fn(&GeneratorArgs<'_>) -> Result<GeneratorValue, String> + Send + Sync>;

/// A semantic generator attached to a nonterminal: a typed closure over the
/// derivations of other nonterminals, whose output becomes the surface of
/// the generated subtree.
#[derive(Clone)]
pub struct Generator {
    name: String,
    params: Vec<(String, NonTerminal)>,
    call: GeneratorFn,
}

impl Generator {
    /// Create a generator. `params` maps the closure's parameter
    /// identifiers to the nonterminals whose derivations feed them.
    pub fn new(
        name: impl Into<String>,
        params: Vec<(String, NonTerminal)>,
        call: impl Fn(&GeneratorArgs<'_>) -> Result<GeneratorValue, String> + Send + Sync + 'static,
    ) -> Self {
        Generator {
            name: name.into(),
            params,
            call: Arc::new(call),
        }
    }

    /// The display name of this generator.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameter identifiers and the nonterminals feeding them.
    pub fn params(&self) -> &[(String, NonTerminal)] {
        &self.params
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

impl PartialEq for Generator {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.params == other.params
    }
}

pub(crate) fn closest_match<'a>(
    word: &str,
    candidates: impl Iterator<Item = &'a NonTerminal>,
) -> Option<String> {
    candidates
        .map(|c| (c, strsim::normalized_levenshtein(word, c.name())))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c.name().to_string())
}

/// A read-only view of the grammar pieces the parser needs at runtime.
#[derive(Clone, Copy)]
pub(crate) struct GrammarView<'g> {
    pub nodes: &'g [IrNode],
    pub rules: &'g AHashMap<NonTerminal, IrId>,
    pub env: &'g Environment,
    pub config: &'g Config,
}

impl GrammarView<'_> {
    pub(crate) fn ir(&self, id: IrId) -> &IrNode {
        &self.nodes[id.index()]
    }
}

/// A rule body assembled as a plain tree, for [`Grammar::new`]. Lowered
/// into the grammar's IR arena on construction; [`GrammarBuilder`]'s node
/// constructors produce the same IR incrementally.
#[derive(Debug, Clone)]
pub enum Rule {
    /// One of several alternatives.
    Alternative(Vec<Rule>),
    /// A sequence.
    Concatenation(Vec<Rule>),
    /// `min..=max` copies of the inner rule; the bounds may be
    /// data-dependent.
    Repetition {
        /// The repeated rule.
        inner: Box<Rule>,
        /// The lower bound.
        min: BoundExpr,
        /// The upper bound.
        max: BoundExpr,
    },
    /// Zero or more copies.
    Star(Box<Rule>),
    /// One or more copies.
    Plus(Box<Rule>),
    /// Zero or one copy.
    Option(Box<Rule>),
    /// A reference to another nonterminal.
    Ref(NonTerminal),
    /// A reference annotated with protocol parties.
    Message {
        /// The referenced nonterminal.
        symbol: NonTerminal,
        /// The sending party.
        sender: String,
        /// The receiving party, if addressed.
        recipient: Option<String>,
    },
    /// A terminal.
    Terminal(Terminal),
    /// A character set.
    CharSet(Vec<char>),
}

/// Builds a [`Grammar`] rule by rule. Node constructors return [`IrId`]s
/// that later constructors and [`GrammarBuilder::rule`] consume.
#[derive(Default)]
pub struct GrammarBuilder {
    nodes: Vec<IrNode>,
    rules: Vec<(NonTerminal, IrId)>,
    generators: Vec<(NonTerminal, Generator)>,
    env: Environment,
    config: Config,
}

impl GrammarBuilder {
    /// An empty builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: IrNode) -> IrId {
        let id = IrId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// A terminal node.
    pub fn terminal(&mut self, terminal: Terminal) -> IrId {
        self.push(IrNode::Terminal(terminal))
    }

    /// A literal string terminal node.
    pub fn literal(&mut self, s: &str) -> IrId {
        self.terminal(Terminal::str(s))
    }

    /// A literal byte-sequence terminal node.
    pub fn byte_literal(&mut self, bytes: impl Into<Vec<u8>>) -> IrId {
        self.terminal(Terminal::bytes(bytes))
    }

    /// A single-bit terminal node.
    pub fn bit(&mut self, bit: u8) -> IrId {
        self.terminal(Terminal::bit(bit))
    }

    /// A reference to a nonterminal.
    pub fn nonterminal(&mut self, name: &str) -> IrId {
        self.push(IrNode::NonTerminalRef(NonTerminalRef {
            symbol: NonTerminal::new(name),
            sender: None,
            recipient: None,
        }))
    }

    /// A reference to a nonterminal carrying protocol party annotations.
    pub fn message(&mut self, name: &str, sender: &str, recipient: Option<&str>) -> IrId {
        self.push(IrNode::NonTerminalRef(NonTerminalRef {
            symbol: NonTerminal::new(name),
            sender: Some(SmolStr::new(sender)),
            recipient: recipient.map(SmolStr::new),
        }))
    }

    /// An alternative over `children`.
    pub fn alternative(&mut self, children: Vec<IrId>) -> IrId {
        self.push(IrNode::Alternative(children))
    }

    /// A concatenation of `children`.
    pub fn concatenation(&mut self, children: Vec<IrId>) -> IrId {
        self.push(IrNode::Concatenation(children))
    }

    /// A character set.
    pub fn charset(&mut self, chars: &str) -> IrId {
        self.push(IrNode::CharSet(chars.chars().collect()))
    }

    /// A repetition with constant bounds, `min..=max` copies.
    pub fn repeat(&mut self, inner: IrId, min: usize, max: usize) -> IrId {
        self.push(IrNode::Repetition(RepetitionNode {
            inner,
            kind: RepetitionKind::Repetition,
            min: BoundExpr::literal(min),
            max: BoundExpr::literal(max),
            static_min: None,
        }))
    }

    /// A repetition with expression bounds, possibly data-dependent.
    pub fn repeat_bounds(&mut self, inner: IrId, min: BoundExpr, max: BoundExpr) -> IrId {
        self.push(IrNode::Repetition(RepetitionNode {
            inner,
            kind: RepetitionKind::Repetition,
            min,
            max,
            static_min: None,
        }))
    }

    /// Zero or more copies of `inner`.
    pub fn star(&mut self, inner: IrId) -> IrId {
        self.push(IrNode::Repetition(RepetitionNode {
            inner,
            kind: RepetitionKind::Star,
            min: BoundExpr::literal(0),
            max: BoundExpr::unbounded(),
            static_min: None,
        }))
    }

    /// One or more copies of `inner`.
    pub fn plus(&mut self, inner: IrId) -> IrId {
        self.push(IrNode::Repetition(RepetitionNode {
            inner,
            kind: RepetitionKind::Plus,
            min: BoundExpr::literal(1),
            max: BoundExpr::unbounded(),
            static_min: None,
        }))
    }

    /// Zero or one copy of `inner`.
    pub fn optional(&mut self, inner: IrId) -> IrId {
        self.push(IrNode::Repetition(RepetitionNode {
            inner,
            kind: RepetitionKind::Option,
            min: BoundExpr::literal(0),
            max: BoundExpr::literal(1),
            static_min: None,
        }))
    }

    fn lower_rule(&mut self, rule: Rule) -> IrId {
        match rule {
            Rule::Alternative(children) => {
                let ids = children.into_iter().map(|c| self.lower_rule(c)).collect();
                self.alternative(ids)
            }
            Rule::Concatenation(children) => {
                let ids = children.into_iter().map(|c| self.lower_rule(c)).collect();
                self.concatenation(ids)
            }
            Rule::Repetition { inner, min, max } => {
                let inner = self.lower_rule(*inner);
                self.repeat_bounds(inner, min, max)
            }
            Rule::Star(inner) => {
                let inner = self.lower_rule(*inner);
                self.star(inner)
            }
            Rule::Plus(inner) => {
                let inner = self.lower_rule(*inner);
                self.plus(inner)
            }
            Rule::Option(inner) => {
                let inner = self.lower_rule(*inner);
                self.optional(inner)
            }
            Rule::Ref(symbol) => self.push(IrNode::NonTerminalRef(NonTerminalRef {
                symbol,
                sender: None,
                recipient: None,
            })),
            Rule::Message {
                symbol,
                sender,
                recipient,
            } => self.push(IrNode::NonTerminalRef(NonTerminalRef {
                symbol,
                sender: Some(SmolStr::new(sender)),
                recipient: recipient.map(SmolStr::new),
            })),
            Rule::Terminal(t) => self.terminal(t),
            Rule::CharSet(chars) => self.push(IrNode::CharSet(chars)),
        }
    }

    /// Define (or redefine) the rule for `name`.
    pub fn rule(&mut self, name: &str, body: IrId) -> &mut Self {
        self.rules.push((NonTerminal::new(name), body));
        self
    }

    /// Attach a generator to `name`.
    pub fn generator(&mut self, name: &str, generator: Generator) -> &mut Self {
        self.generators.push((NonTerminal::new(name), generator));
        self
    }

    /// Replace the grammar environment.
    pub fn environment(&mut self, env: Environment) -> &mut Self {
        self.env = env;
        self
    }

    /// Replace the configuration.
    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// Compile the parser tables and produce the grammar.
    /// [`Grammar::prime`] must still be called before fuzzing.
    pub fn build(self) -> Result<Grammar, GrammarError> {
        let mut rules = AHashMap::new();
        let mut rule_order = Vec::new();
        for (name, body) in self.rules {
            if rules.insert(name.clone(), body).is_none() {
                rule_order.push(name);
            }
        }
        let generators = self.generators.into_iter().collect();
        let view = GrammarView {
            nodes: &self.nodes,
            rules: &rules,
            env: &self.env,
            config: &self.config,
        };
        let parser = Parser::compile(view, &rule_order)?;
        let distances = vec![f64::INFINITY; self.nodes.len()];
        Ok(Grammar {
            nodes: self.nodes,
            distances,
            rules,
            rule_order,
            generators,
            env: self.env,
            config: self.config,
            parser,
        })
    }
}

/// A context-free grammar with generator functions, ready for fuzzing and
/// parsing.
pub struct Grammar {
    pub(crate) nodes: Vec<IrNode>,
    pub(crate) distances: Vec<f64>,
    pub(crate) rules: AHashMap<NonTerminal, IrId>,
    pub(crate) rule_order: Vec<NonTerminal>,
    pub(crate) generators: AHashMap<NonTerminal, Generator>,
    pub(crate) env: Environment,
    pub(crate) config: Config,
    pub(crate) parser: Parser,
}

impl Grammar {
    /// Create a grammar directly from assembled [`Rule`] bodies, generators,
    /// a fuzzing mode, and an evaluation environment, compiling the parser
    /// tables in one step. [`Grammar::prime`] must still be called before
    /// fuzzing.
    pub fn new(
        rules: Vec<(NonTerminal, Rule)>,
        generators: Vec<(NonTerminal, Generator)>,
        fuzzing_mode: FuzzingMode,
        env: Environment,
    ) -> Result<Grammar, GrammarError> {
        let mut builder = GrammarBuilder::new();
        builder.env = env;
        builder.config.fuzzing_mode = fuzzing_mode;
        for (name, rule) in rules {
            let body = builder.lower_rule(rule);
            builder.rules.push((name, body));
        }
        builder.generators = generators;
        builder.build()
    }

    /// Start building a grammar.
    pub fn builder() -> GrammarBuilder {
        GrammarBuilder::new()
    }

    pub(crate) fn ir(&self, id: IrId) -> &IrNode {
        &self.nodes[id.index()]
    }

    pub(crate) fn view(&self) -> GrammarView<'_> {
        GrammarView {
            nodes: &self.nodes,
            rules: &self.rules,
            env: &self.env,
            config: &self.config,
        }
    }

    /// The defined nonterminals, in definition order.
    pub fn non_terminals(&self) -> impl Iterator<Item = &NonTerminal> {
        self.rule_order.iter()
    }

    /// Whether `name` has a rule.
    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(&NonTerminal::new(name))
    }

    /// The grammar configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The number of repetitions unbounded repetitions expand to.
    pub fn max_repetitions(&self) -> usize {
        self.config.max_repetitions
    }

    /// Change the number of repetitions unbounded repetitions expand to.
    pub fn set_max_repetitions(&mut self, max_repetitions: usize) {
        self.config.max_repetitions = max_repetitions;
    }

    /// The evaluation environment for bounds and generators.
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Mutable access to the evaluation environment.
    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub(crate) fn suggestion_for(&self, name: &str) -> Suggestion {
        Suggestion(closest_match(name, self.rule_order.iter()))
    }

    pub(crate) fn unknown_non_terminal(&self, symbol: &NonTerminal) -> GrammarError {
        GrammarError::UnknownNonTerminal {
            symbol: symbol.clone(),
            suggestion: self.suggestion_for(symbol.name()),
        }
    }

    /// Compute `distance_to_completion` for every reachable IR node via a
    /// worklist fixed point. Fails if a referenced nonterminal is undefined
    /// or if some reachable node cannot reach a finite derivation.
    pub fn prime(&mut self) -> Result<(), GrammarError> {
        for (i, node) in self.nodes.iter().enumerate() {
            if matches!(node, IrNode::Terminal(_) | IrNode::CharSet(_)) {
                self.distances[i] = 0.0;
            } else {
                self.distances[i] = f64::INFINITY;
            }
        }
        let mut work = std::collections::VecDeque::new();
        for name in &self.rule_order {
            collect_prime_work(&self.nodes, self.rules[name], &mut work);
        }
        enum Step {
            Skip,
            Requeue,
            Done(f64),
            Rep(BoundExpr, f64),
        }
        let mut since_progress = 0usize;
        while let Some(id) = work.pop_front() {
            if since_progress > work.len() + 1 {
                let offender = self
                    .rule_order
                    .iter()
                    .find(|name| self.distances[self.rules[*name].index()].is_infinite())
                    .cloned()
                    .unwrap_or_else(|| NonTerminal::new("<start>"));
                return Err(GrammarError::NonTerminating(offender));
            }
            let step = match &self.nodes[id.index()] {
                IrNode::Terminal(_) | IrNode::CharSet(_) => Step::Skip,
                IrNode::NonTerminalRef(r) => {
                    let Some(&rule) = self.rules.get(&r.symbol) else {
                        return Err(self.unknown_non_terminal(&r.symbol));
                    };
                    let d = self.distances[rule.index()];
                    if d.is_infinite() {
                        Step::Requeue
                    } else {
                        Step::Done(d + 1.0)
                    }
                }
                IrNode::Alternative(children) => {
                    let d = children
                        .iter()
                        .map(|c| self.distances[c.index()])
                        .fold(f64::INFINITY, f64::min);
                    if d.is_infinite() {
                        Step::Requeue
                    } else {
                        Step::Done(d + 1.0)
                    }
                }
                IrNode::Concatenation(children) => {
                    if children
                        .iter()
                        .any(|c| self.distances[c.index()].is_infinite())
                    {
                        Step::Requeue
                    } else {
                        Step::Done(
                            children.iter().map(|c| self.distances[c.index()]).sum::<f64>() + 1.0,
                        )
                    }
                }
                IrNode::Repetition(rep) => {
                    let d = self.distances[rep.inner.index()];
                    if d.is_infinite() {
                        Step::Requeue
                    } else {
                        Step::Rep(rep.min.clone(), d)
                    }
                }
            };
            match step {
                Step::Skip => {}
                Step::Requeue => {
                    work.push_back(id);
                    since_progress += 1;
                }
                Step::Done(distance) => {
                    if self.distances[id.index()].is_infinite() {
                        since_progress = 0;
                    }
                    self.distances[id.index()] = distance;
                }
                Step::Rep(min_bound, inner_distance) => {
                    // Bounds that need runtime data contribute zero copies.
                    let (min_count, is_static) =
                        match min_bound.evaluate(&self.env, &self.config, None) {
                            Ok((n, is_static)) => (n, is_static),
                            Err(_) => (0, false),
                        };
                    if is_static {
                        if let IrNode::Repetition(rep) = &mut self.nodes[id.index()] {
                            rep.static_min = Some(min_count);
                        }
                    }
                    if self.distances[id.index()].is_infinite() {
                        since_progress = 0;
                    }
                    self.distances[id.index()] = inner_distance * min_count as f64 + 1.0;
                }
            }
        }
        Ok(())
    }

    /// Merge `other` into this grammar: rules override, generators merge
    /// (rules arriving without a generator drop any existing one), the
    /// environments merge, and the parser is rebuilt and re-primed.
    pub fn update(&mut self, other: Grammar) -> Result<(), GrammarError> {
        let offset = self.nodes.len() as u32;
        let remap = |id: IrId| IrId(id.0 + offset);
        for node in other.nodes {
            let node = match node {
                IrNode::Alternative(children) => {
                    IrNode::Alternative(children.into_iter().map(remap).collect())
                }
                IrNode::Concatenation(children) => {
                    IrNode::Concatenation(children.into_iter().map(remap).collect())
                }
                IrNode::Repetition(mut rep) => {
                    rep.inner = remap(rep.inner);
                    IrNode::Repetition(rep)
                }
                other => other,
            };
            self.nodes.push(node);
        }
        self.distances.resize(self.nodes.len(), f64::INFINITY);
        for name in &other.rule_order {
            let body = remap(other.rules[name]);
            if self.rules.insert(name.clone(), body).is_none() {
                self.rule_order.push(name.clone());
            } else {
                log::debug!("rule {} overridden by update", name);
            }
            // An updated rule without a generator sheds any previous one.
            if !other.generators.contains_key(name) {
                self.generators.remove(name);
            }
        }
        for (name, generator) in other.generators {
            self.generators.insert(name, generator);
        }
        self.env.merge(&other.env);
        self.config.fuzzing_mode = other.config.fuzzing_mode;
        self.rebuild_parser()?;
        self.prime()
    }

    /// Rebuild the parser tables, dropping the parse cache.
    pub fn rebuild_parser(&mut self) -> Result<(), GrammarError> {
        self.parser = Parser::compile(self.view(), &self.rule_order)?;
        Ok(())
    }

    /// Fuzz a derivation tree rooted at `start`, containing at most
    /// `max_nodes` nodes whenever the grammar admits such a tree.
    /// [`Grammar::prime`] must have been called.
    pub fn fuzz<R: Rng>(
        &mut self,
        rng: &mut R,
        start: &str,
        max_nodes: usize,
    ) -> Result<DerivationTree, FuzzError> {
        fuzzer::fuzz(self, rng, &NonTerminal::new(start), max_nodes, None)
    }

    /// Fuzz under a pre-existing prefix tree: the new derivation is appended
    /// to the prefix root, which provides context for data-dependent bounds.
    pub fn fuzz_with_prefix<R: Rng>(
        &mut self,
        rng: &mut R,
        start: &str,
        max_nodes: usize,
        prefix: &DerivationTree,
    ) -> Result<DerivationTree, FuzzError> {
        fuzzer::fuzz(self, rng, &NonTerminal::new(start), max_nodes, Some(prefix))
    }

    /// Parse `word` into a derivation tree rooted at `start`, complete mode.
    /// Returns the first parse; ambiguity resolves first-in-column.
    pub fn parse(
        &mut self,
        word: impl Into<ParseInput>,
        start: &str,
    ) -> Result<DerivationTree, ParseError> {
        self.parse_with(word, start, ParseOptions::default())
    }

    /// Parse with explicit options (mode, hookin parent, controlflow).
    pub fn parse_with(
        &mut self,
        word: impl Into<ParseInput>,
        start: &str,
        options: ParseOptions,
    ) -> Result<DerivationTree, ParseError> {
        let start_nt = NonTerminal::new(start);
        if !self.rules.contains_key(&start_nt) {
            return Err(ParseError::UnknownStart {
                symbol: start_nt.clone(),
                suggestion: self.suggestion_for(start_nt.name()),
            });
        }
        let input: ParseInput = word.into();
        let error_input = input.clone();
        let mut forest = self.parse_forest(input, start, options);
        let first = forest.next();
        drop(forest);
        first.ok_or_else(|| self.parser.no_parse_error(&error_input))
    }

    /// Lazily yield every parse of `word` under `start`. Results are cached
    /// by the structural hash of `(word, start, mode, hookin)` once the
    /// forest has been fully drained.
    pub fn parse_forest(
        &mut self,
        word: impl Into<ParseInput>,
        start: &str,
        options: ParseOptions,
    ) -> ParseForest<'_> {
        let view = GrammarView {
            nodes: &self.nodes,
            rules: &self.rules,
            env: &self.env,
            config: &self.config,
        };
        ParseForest::new(
            &mut self.parser,
            view,
            word.into(),
            NonTerminal::new(start),
            options,
        )
    }

    /// Same as [`Grammar::parse_forest`]; kept for symmetry with incomplete
    /// inputs, where several partial derivations are commonly consumed.
    pub fn parse_multiple(
        &mut self,
        word: impl Into<ParseInput>,
        start: &str,
        options: ParseOptions,
    ) -> ParseForest<'_> {
        self.parse_forest(word, start, options)
    }

    /// The maximum input position reached during the last parse, for error
    /// reporting. `None` if nothing was scanned.
    pub fn max_position(&self) -> Option<usize> {
        self.parser.max_position()
    }

    /// Splice every synthetic (`<__…>`, `<*…>`) node out of `tree`,
    /// promoting its children.
    pub fn collapse(&self, tree: &DerivationTree) -> DerivationTree {
        crate::parser::collapse(tree)
    }

    /// Attach a generator to `name`.
    pub fn set_generator(&mut self, name: &str, generator: Generator) {
        self.generators.insert(NonTerminal::new(name), generator);
    }

    /// Remove the generator attached to `name`, if any.
    pub fn remove_generator(&mut self, name: &str) -> Option<Generator> {
        self.generators.remove(&NonTerminal::new(name))
    }

    /// Whether `name` has a generator attached.
    pub fn has_generator(&self, symbol: &NonTerminal) -> bool {
        self.generators.contains_key(symbol)
    }

    /// The generator attached to `symbol`, if any.
    pub fn get_generator(&self, symbol: &NonTerminal) -> Option<&Generator> {
        self.generators.get(symbol)
    }

    /// The nonterminals whose derivations feed `symbol`'s generator.
    pub fn generator_dependencies(&self, symbol: &NonTerminal) -> AHashSet<NonTerminal> {
        self.generators
            .get(symbol)
            .map(|g| g.params().iter().map(|(_, nt)| nt.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether the node at `id` should be produced by its generator: it has
    /// one, and no ancestor (itself included) is one of the generator's own
    /// dependencies, which would cycle.
    pub fn is_use_generator(&self, tree: &DerivationTree, id: NodeId) -> bool {
        let Some(symbol) = tree.symbol(id).as_non_terminal() else {
            return false;
        };
        if !self.generators.contains_key(symbol) {
            return false;
        }
        let dependencies = self.generator_dependencies(symbol);
        !tree
            .path(id)
            .iter()
            .filter_map(|&p| tree.symbol(p).as_non_terminal())
            .any(|nt| dependencies.contains(nt))
    }

    /// Run `symbol`'s generator over `sources` and parse its output into a
    /// derivation tree. The sources are recorded on the resulting tree.
    pub fn generate(
        &mut self,
        symbol: &NonTerminal,
        sources: &[DerivationTree],
    ) -> Result<DerivationTree, FuzzError> {
        let generator = self
            .generators
            .get(symbol)
            .cloned()
            .ok_or_else(|| GrammarError::NoGenerator(symbol.clone()))?;
        let by_symbol: AHashMap<&NonTerminal, &DerivationTree> = sources
            .iter()
            .filter_map(|t| t.symbol(t.root()).as_non_terminal().map(|nt| (nt, t)))
            .collect();
        let mut values = AHashMap::new();
        for (ident, nt) in generator.params() {
            let Some(&tree) = by_symbol.get(nt) else {
                return Err(GrammarError::MissingGeneratorParameter {
                    symbol: symbol.clone(),
                    param: ident.clone(),
                }
                .into());
            };
            values.insert(ident.as_str(), tree);
        }
        let args = GeneratorArgs { values };
        let output = (generator.call)(&args).map_err(|reason| FuzzError::GeneratorFailed {
            symbol: symbol.clone(),
            reason,
        })?;
        let mut tree = self
            .parse(output.surface(), symbol.name())
            .map_err(|_| FuzzError::GeneratorProduce {
                symbol: symbol.clone(),
                output: output.to_string(),
            })?;
        let root = tree.root();
        for source in sources {
            tree.graft_source(root, source, source.root());
        }
        Ok(tree)
    }

    /// Re-derive the sources of a generated subtree from its surface, using
    /// the converse generators of the parameters.
    pub(crate) fn derive_sources_at(
        &mut self,
        tree: &DerivationTree,
        id: NodeId,
    ) -> Result<Vec<DerivationTree>, FuzzError> {
        let Some(gen_symbol) = tree.symbol(id).as_non_terminal().cloned() else {
            return Ok(Vec::new());
        };
        let generator = self
            .generators
            .get(&gen_symbol)
            .cloned()
            .ok_or_else(|| GrammarError::NoGenerator(gen_symbol.clone()))?;
        if !self.is_use_generator(tree, id) {
            return Ok(Vec::new());
        }

        let mut graph: AHashMap<NonTerminal, AHashSet<NonTerminal>> = AHashMap::new();
        graph.insert(gen_symbol.clone(), AHashSet::new());
        for (_, nt) in generator.params() {
            if !self.rules.contains_key(nt) {
                return Err(self.unknown_non_terminal(nt).into());
            }
            if !self.generators.contains_key(nt) {
                return Err(GrammarError::MissingConverter {
                    symbol: nt.clone(),
                    dependency: gen_symbol.clone(),
                }
                .into());
            }
            graph.insert(nt.clone(), self.generator_dependencies(nt));
        }
        let mut order = topological_sort(&graph)
            .ok_or_else(|| GrammarError::GeneratorCycle(gen_symbol.clone()))?;
        order.retain(|nt| nt != &gen_symbol);

        let mut args = vec![tree.deepcopy(id)];
        for symbol in order {
            let mut generated = self.generate(&symbol, &args)?;
            let root = generated.root();
            generated.set_sources(root, Vec::new());
            let children: Vec<NodeId> = generated.children(root).to_vec();
            for child in children {
                self.populate_sources_at(&mut generated, child)?;
            }
            args.push(generated);
        }
        args.remove(0);
        Ok(args)
    }

    /// Re-run the generator of the subtree at `id` against its recorded
    /// sources and swap the generated children in.
    pub(crate) fn derive_generator_output_at(
        &mut self,
        tree: &mut DerivationTree,
        id: NodeId,
    ) -> Result<(), FuzzError> {
        let Some(symbol) = tree.symbol(id).as_non_terminal().cloned() else {
            return Ok(());
        };
        let sources: Vec<DerivationTree> = tree
            .sources(id)
            .iter()
            .map(|&s| tree.deepcopy(s))
            .collect();
        let generated = self.generate(&symbol, &sources)?;
        let generated_children: Vec<NodeId> = generated.children(generated.root()).to_vec();
        let mut new_children = Vec::with_capacity(generated_children.len());
        for child in generated_children {
            new_children.push(tree.copy_subtree(&generated, child));
        }
        tree.set_children(id, new_children);
        Ok(())
    }

    /// Discard and re-derive every source edge in `tree`: generated
    /// subtrees get fresh sources from their surfaces, and their children
    /// are locked read-only.
    pub fn populate_sources(&mut self, tree: &mut DerivationTree) -> Result<(), FuzzError> {
        self.populate_sources_at(tree, tree.root())
    }

    pub(crate) fn populate_sources_at(
        &mut self,
        tree: &mut DerivationTree,
        id: NodeId,
    ) -> Result<(), FuzzError> {
        clear_sources(tree, id);
        self.populate_sources_rec(tree, id)
    }

    fn populate_sources_rec(
        &mut self,
        tree: &mut DerivationTree,
        id: NodeId,
    ) -> Result<(), FuzzError> {
        if self.is_use_generator(tree, id) {
            let sources = self.derive_sources_at(tree, id)?;
            for source in sources {
                tree.graft_source(id, &source, source.root());
            }
            let children: Vec<NodeId> = tree.children(id).to_vec();
            for child in children {
                tree.set_all_read_only(child, true);
            }
            return Ok(());
        }
        let children: Vec<NodeId> = tree.children(id).to_vec();
        for child in children {
            self.populate_sources_rec(tree, child)?;
        }
        Ok(())
    }

    /// All protocol parties mentioned by the grammar.
    pub fn msg_parties(&self, include_recipients: bool) -> AHashSet<SmolStr> {
        let mut parties = AHashSet::new();
        for name in &self.rule_order {
            // A fresh `seen` set per start rule keeps the result a pure
            // function of the rule.
            let mut seen = AHashSet::new();
            self.ir_msg_parties(self.rules[name], &mut seen, include_recipients, &mut parties);
        }
        parties
    }

    fn ir_msg_parties(
        &self,
        id: IrId,
        seen: &mut AHashSet<NonTerminal>,
        include_recipients: bool,
        out: &mut AHashSet<SmolStr>,
    ) {
        match self.ir(id) {
            IrNode::NonTerminalRef(r) => {
                if let Some(sender) = &r.sender {
                    out.insert(sender.clone());
                    if include_recipients {
                        if let Some(recipient) = &r.recipient {
                            out.insert(recipient.clone());
                        }
                    }
                }
                if seen.insert(r.symbol.clone()) {
                    if let Some(&rule) = self.rules.get(&r.symbol) {
                        self.ir_msg_parties(rule, seen, include_recipients, out);
                    }
                }
            }
            IrNode::Alternative(children) | IrNode::Concatenation(children) => {
                for &child in children {
                    self.ir_msg_parties(child, seen, include_recipients, out);
                }
            }
            IrNode::Repetition(rep) => {
                self.ir_msg_parties(rep.inner, seen, include_recipients, out)
            }
            IrNode::Terminal(_) | IrNode::CharSet(_) => {}
        }
    }

    /// Verify that message definitions do not nest: a nonterminal reference
    /// annotated with a sender must not derive further annotated references.
    pub fn check_message_nesting(&self, start: &str) -> Result<(), GrammarError> {
        let start_nt = NonTerminal::new(start);
        let Some(&rule) = self.rules.get(&start_nt) else {
            return Err(self.unknown_non_terminal(&start_nt));
        };
        let mut seen = AHashSet::new();
        let mut path = vec![start_nt];
        self.check_nesting_rec(rule, &mut seen, &mut path)
    }

    fn check_nesting_rec(
        &self,
        id: IrId,
        seen: &mut AHashSet<NonTerminal>,
        path: &mut Vec<NonTerminal>,
    ) -> Result<(), GrammarError> {
        match self.ir(id) {
            IrNode::NonTerminalRef(r) => {
                if !seen.insert(r.symbol.clone()) {
                    if r.sender.is_some() && path.contains(&r.symbol) {
                        return Err(GrammarError::NestedMessages(r.symbol.clone()));
                    }
                    return Ok(());
                }
                let Some(&rule) = self.rules.get(&r.symbol) else {
                    return Err(self.unknown_non_terminal(&r.symbol));
                };
                if r.sender.is_some() {
                    let mut parties = AHashSet::new();
                    let mut inner_seen = AHashSet::new();
                    self.ir_msg_parties(rule, &mut inner_seen, false, &mut parties);
                    if !parties.is_empty() {
                        return Err(GrammarError::NestedMessages(r.symbol.clone()));
                    }
                    return Ok(());
                }
                path.push(r.symbol.clone());
                let result = self.check_nesting_rec(rule, seen, path);
                path.pop();
                result
            }
            IrNode::Alternative(children) | IrNode::Concatenation(children) => {
                for &child in children {
                    self.check_nesting_rec(child, seen, path)?;
                }
                Ok(())
            }
            IrNode::Repetition(rep) => self.check_nesting_rec(rep.inner, seen, path),
            IrNode::Terminal(_) | IrNode::CharSet(_) => Ok(()),
        }
    }

    fn contains_terminal_matching(
        &self,
        start: &str,
        pred: impl Fn(&Terminal) -> bool,
    ) -> Result<bool, GrammarError> {
        let start_nt = NonTerminal::new(start);
        let Some(&rule) = self.rules.get(&start_nt) else {
            return Err(self.unknown_non_terminal(&start_nt));
        };
        let mut seen = AHashSet::new();
        let mut stack = vec![rule];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.ir(id) {
                IrNode::Terminal(t) => {
                    if pred(t) {
                        return Ok(true);
                    }
                }
                IrNode::CharSet(_) => {}
                IrNode::Alternative(children) | IrNode::Concatenation(children) => {
                    stack.extend(children.iter().copied());
                }
                IrNode::Repetition(rep) => stack.push(rep.inner),
                IrNode::NonTerminalRef(r) => {
                    let Some(&rule) = self.rules.get(&r.symbol) else {
                        return Err(self.unknown_non_terminal(&r.symbol));
                    };
                    stack.push(rule);
                }
            }
        }
        Ok(false)
    }

    /// Whether the grammar can produce a bit element from `start`.
    pub fn contains_bits(&self, start: &str) -> Result<bool, GrammarError> {
        self.contains_terminal_matching(start, Terminal::is_bit)
    }

    /// Whether the grammar can produce a byte-sequence element from `start`.
    pub fn contains_bytes(&self, start: &str) -> Result<bool, GrammarError> {
        self.contains_terminal_matching(start, |t| matches!(t, Terminal::Bytes(_)))
    }

    /// Whether the grammar can produce a string element from `start`.
    pub fn contains_strings(&self, start: &str) -> Result<bool, GrammarError> {
        self.contains_terminal_matching(start, |t| matches!(t, Terminal::Str(_)))
    }

    /// All length-`k` IR paths reachable in the grammar.
    pub fn compute_k_paths(&self, k: usize) -> AHashSet<Vec<IrId>> {
        crate::coverage::all_k_paths(self, k)
    }

    /// The IR paths `tree` exercises, resolved through the disambiguator.
    pub fn traverse_derivation(
        &self,
        tree: &DerivationTree,
    ) -> Result<AHashSet<Vec<IrId>>, GrammarError> {
        let mut disambiguator = crate::coverage::Disambiguator::new(self);
        let mut paths = AHashSet::new();
        crate::coverage::traverse_derivation(
            self,
            &mut disambiguator,
            tree,
            tree.root(),
            &mut paths,
            Vec::new(),
        )?;
        Ok(paths)
    }

    /// The k-path coverage of `trees`: `(ratio, covered, total)`, with the
    /// ratio always within `[0, 1]`.
    pub fn compute_grammar_coverage(
        &self,
        trees: &[DerivationTree],
        k: usize,
    ) -> Result<(f64, usize, usize), GrammarError> {
        crate::coverage::compute_grammar_coverage(self, trees, k)
    }

    fn render_ir(&self, id: IrId) -> String {
        match self.ir(id) {
            IrNode::Alternative(children) => {
                let parts: Vec<String> = children.iter().map(|&c| self.render_ir(c)).collect();
                format!("({})", parts.join(" | "))
            }
            IrNode::Concatenation(children) => {
                let parts: Vec<String> = children.iter().map(|&c| self.render_ir(c)).collect();
                parts.join(" ")
            }
            IrNode::Repetition(rep) => match rep.kind {
                RepetitionKind::Star => format!("{}*", self.render_ir(rep.inner)),
                RepetitionKind::Plus => format!("{}+", self.render_ir(rep.inner)),
                RepetitionKind::Option => format!("{}?", self.render_ir(rep.inner)),
                RepetitionKind::Repetition => {
                    if rep.min.source() == rep.max.source() {
                        format!("{}{{{}}}", self.render_ir(rep.inner), rep.min.source())
                    } else {
                        format!(
                            "{}{{{},{}}}",
                            self.render_ir(rep.inner),
                            rep.min.source(),
                            rep.max.source()
                        )
                    }
                }
            },
            IrNode::NonTerminalRef(r) => match (&r.sender, &r.recipient) {
                (Some(sender), Some(recipient)) => {
                    format!(
                        "<{}:{}:{}>",
                        sender,
                        recipient,
                        r.symbol.name().trim_start_matches('<').trim_end_matches('>')
                    )
                }
                (Some(sender), None) => format!(
                    "<{}:{}>",
                    sender,
                    r.symbol.name().trim_start_matches('<').trim_end_matches('>')
                ),
                _ => r.symbol.name().to_string(),
            },
            IrNode::Terminal(t) => t.to_string(),
            IrNode::CharSet(chars) => format!("[{}]", chars.iter().collect::<String>()),
        }
    }

    /// Render the rule for `name` as text.
    pub fn rule_to_string(&self, name: &str) -> Option<String> {
        let nt = NonTerminal::new(name);
        let &body = self.rules.get(&nt)?;
        let generator = self
            .generators
            .get(&nt)
            .map(|g| format!(" := {}", g.name()))
            .unwrap_or_default();
        Some(format!("{} ::= {}{}", nt, self.render_ir(body), generator))
    }
}

impl fmt::Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in &self.rule_order {
            if let Some(line) = self.rule_to_string(name.name()) {
                writeln!(f, "{}", line)?;
            }
        }
        Ok(())
    }
}

fn collect_prime_work(
    nodes: &[IrNode],
    id: IrId,
    work: &mut std::collections::VecDeque<IrId>,
) {
    match &nodes[id.index()] {
        IrNode::Terminal(_) | IrNode::CharSet(_) => {}
        IrNode::NonTerminalRef(_) => work.push_back(id),
        IrNode::Alternative(children) | IrNode::Concatenation(children) => {
            for &child in children {
                collect_prime_work(nodes, child, work);
            }
            work.push_back(id);
        }
        IrNode::Repetition(rep) => {
            collect_prime_work(nodes, rep.inner, work);
            work.push_back(id);
        }
    }
}

fn clear_sources(tree: &mut DerivationTree, id: NodeId) {
    tree.set_sources(id, Vec::new());
    let children: Vec<NodeId> = tree.children(id).to_vec();
    for child in children {
        clear_sources(tree, child);
    }
}

fn topological_sort(
    graph: &AHashMap<NonTerminal, AHashSet<NonTerminal>>,
) -> Option<Vec<NonTerminal>> {
    let mut indegree: AHashMap<&NonTerminal, usize> = AHashMap::new();
    for neighbours in graph.values() {
        for n in neighbours {
            *indegree.entry(n).or_default() += 1;
        }
    }
    let mut queue: Vec<&NonTerminal> = graph
        .keys()
        .filter(|n| indegree.get(*n).copied().unwrap_or(0) == 0)
        .collect();
    let mut order = Vec::with_capacity(graph.len());
    while let Some(node) = queue.pop() {
        order.push(node.clone());
        if let Some(neighbours) = graph.get(node) {
            for n in neighbours {
                if let Some(d) = indegree.get_mut(n) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push(n);
                    }
                }
            }
        }
    }
    if order.len() != graph.len() {
        return None;
    }
    order.reverse();
    Some(order)
}
