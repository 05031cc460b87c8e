//! The Earley-style chart parser over a mixed byte/bit unit stream.
//!
//! Grammar rules are normalised into flat alternations over synthetic
//! nonterminals (`<__kind:id>` intermediates and `<*i*>` implicit rules)
//! before parsing; data-dependent repetitions compile into `<*ctx_k*>`
//! context rules whose bodies are only built when the predictor reaches
//! them, with the partially parsed tree available for bound evaluation.
//! Synthetic nodes are spliced out of final trees by
//! [`Grammar::collapse`](crate::grammar::Grammar::collapse).
use std::collections::VecDeque;
use std::hash::{BuildHasher, Hash, Hasher};
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use smol_str::SmolStr;

use crate::grammar::{
    BoundError, GrammarError, GrammarView, IrId, IrNode, RepetitionKind, Suggestion,
};
use crate::symbol::{NonTerminal, Symbol, Terminal};
use crate::tree::{DerivationTree, NodeId};

/// How the parser treats input that ends prematurely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum ParsingMode {
    /// The whole input must be consumed by a complete derivation.
    #[default]
    Complete,
    /// The input may be a prefix of a valid word; partial derivations are
    /// yielded with their unfinished states marked incomplete.
    Incomplete,
}

/// Options for [`Grammar::parse_with`](crate::grammar::Grammar::parse_with)
/// and the forest entry points.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// The parsing mode.
    pub mode: ParsingMode,
    /// A surrounding tree the parsed fragment hooks into; it provides
    /// context for data-dependent repetition bounds.
    pub hookin_parent: Option<DerivationTree>,
    /// Keep synthetic control-flow nonterminals in the result instead of
    /// collapsing them away.
    pub include_controlflow: bool,
}

impl ParseOptions {
    /// Options for incomplete-mode parsing.
    pub fn incomplete() -> Self {
        ParseOptions {
            mode: ParsingMode::Incomplete,
            ..Default::default()
        }
    }
}

/// Parser input: a flat byte word. Strings encode as UTF-8; derivation
/// trees linearise through their byte surface.
#[derive(Debug, Clone)]
pub struct ParseInput {
    pub(crate) bytes: Vec<u8>,
}

impl From<&str> for ParseInput {
    fn from(s: &str) -> Self {
        ParseInput {
            bytes: s.as_bytes().to_vec(),
        }
    }
}

impl From<String> for ParseInput {
    fn from(s: String) -> Self {
        ParseInput {
            bytes: s.into_bytes(),
        }
    }
}

impl From<&[u8]> for ParseInput {
    fn from(bytes: &[u8]) -> Self {
        ParseInput {
            bytes: bytes.to_vec(),
        }
    }
}

impl<const N: usize> From<&[u8; N]> for ParseInput {
    fn from(bytes: &[u8; N]) -> Self {
        ParseInput {
            bytes: bytes.to_vec(),
        }
    }
}

impl From<Vec<u8>> for ParseInput {
    fn from(bytes: Vec<u8>) -> Self {
        ParseInput { bytes }
    }
}

impl From<&DerivationTree> for ParseInput {
    fn from(tree: &DerivationTree) -> Self {
        ParseInput {
            bytes: tree.to_bytes(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for parsing.
pub enum ParseError {
    /// The start symbol has no rule.
    #[error("start symbol {symbol} not defined in grammar{suggestion}")]
    UnknownStart {
        /// The undefined start symbol.
        symbol: NonTerminal,
        /// The closest defined name, if any.
        suggestion: Suggestion,
    },
    /// No parse covers the input; scanning got as far as `max_position`.
    #[error("syntax error at position {max_position}, near {offending}")]
    NoParse {
        /// The maximum input position reached by any scan.
        max_position: usize,
        /// The input slice at the failure point, rendered for display.
        offending: String,
    },
    /// No parse exists and not a single input unit could be consumed.
    #[error("syntax error, no input could be consumed")]
    NoProgress,
}

impl ParseError {
    /// The maximum input position reached, if any scanning happened.
    pub fn max_position(&self) -> Option<usize> {
        match self {
            ParseError::NoParse { max_position, .. } => Some(*max_position),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub(crate) struct SymbolParams {
    pub sender: Option<SmolStr>,
    pub recipient: Option<SmolStr>,
}

type RuleSymbol = (Symbol, SymbolParams);
type Alternation = Rc<[RuleSymbol]>;

/// Parse-time tree nodes, shared between chart states via `Rc` so that
/// advancing a state is cheap.
#[derive(Debug)]
pub(crate) struct PTree {
    symbol: Symbol,
    sender: Option<SmolStr>,
    recipient: Option<SmolStr>,
    children: Vec<Rc<PTree>>,
}

impl PTree {
    fn leaf(terminal: Terminal) -> Rc<PTree> {
        Rc::new(PTree {
            symbol: Symbol::Terminal(terminal),
            sender: None,
            recipient: None,
            children: Vec::new(),
        })
    }

    fn node(
        nonterminal: NonTerminal,
        params: &SymbolParams,
        children: Vec<Rc<PTree>>,
    ) -> Rc<PTree> {
        Rc::new(PTree {
            symbol: Symbol::NonTerminal(nonterminal),
            sender: params.sender.clone(),
            recipient: params.recipient.clone(),
            children,
        })
    }
}

pub(crate) fn to_derivation_tree(ptree: &PTree) -> DerivationTree {
    let mut out = DerivationTree::empty();
    build_tree(ptree, &mut out);
    out
}

fn build_tree(ptree: &PTree, out: &mut DerivationTree) -> NodeId {
    let id = out.alloc(ptree.symbol.clone());
    out.set_sender(id, ptree.sender.as_deref());
    out.set_recipient(id, ptree.recipient.as_deref());
    let mut children = Vec::with_capacity(ptree.children.len());
    for child in &ptree.children {
        children.push(build_tree(child, out));
    }
    out.set_children(id, children);
    id
}

/// Splice every synthetic (`<__…>`, `<*…>`) node out of `tree`, promoting
/// its children into the parent's position. Party tags and read-only flags
/// on surviving nodes are preserved; the root always survives.
pub(crate) fn collapse(tree: &DerivationTree) -> DerivationTree {
    let mut out = DerivationTree::empty();
    let root = out.alloc(tree.symbol(tree.root()).clone());
    out.copy_meta_from(root, tree, tree.root());
    let children = collapse_children(tree, tree.root(), &mut out);
    out.set_children(root, children);
    for &source in tree.sources(tree.root()) {
        out.graft_source(root, tree, source);
    }
    out
}

fn collapse_children(
    src: &DerivationTree,
    src_id: NodeId,
    out: &mut DerivationTree,
) -> Vec<NodeId> {
    let mut result = Vec::new();
    for &child in src.children(src_id) {
        let reduced = collapse_children(src, child, out);
        if let Symbol::NonTerminal(nt) = src.symbol(child) {
            if nt.is_synthetic() {
                result.extend(reduced);
                continue;
            }
        }
        let id = out.alloc(src.symbol(child).clone());
        out.copy_meta_from(id, src, child);
        out.set_children(id, reduced);
        for &source in src.sources(child) {
            out.graft_source(id, src, source);
        }
        result.push(id);
    }
    result
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct StateKey {
    nonterminal: NonTerminal,
    position: usize,
    dot: usize,
    symbols: Alternation,
}

/// One Earley item: a dotted alternation with the children parsed so far.
/// Equality and hashing ignore the children, so duplicate items are
/// suppressed while the first occurrence keeps collecting completions.
#[derive(Debug, Clone)]
pub(crate) struct ParseState {
    nonterminal: NonTerminal,
    position: usize,
    symbols: Alternation,
    dot: usize,
    children: Vec<Rc<PTree>>,
    is_incomplete: bool,
}

impl ParseState {
    fn new(nonterminal: NonTerminal, position: usize, symbols: Alternation) -> Self {
        ParseState {
            nonterminal,
            position,
            symbols,
            dot: 0,
            children: Vec::new(),
            is_incomplete: false,
        }
    }

    fn key(&self) -> StateKey {
        StateKey {
            nonterminal: self.nonterminal.clone(),
            position: self.position,
            dot: self.dot,
            symbols: self.symbols.clone(),
        }
    }

    fn dot_symbol(&self) -> Option<&Symbol> {
        self.symbols.get(self.dot).map(|(s, _)| s)
    }

    fn dot_params(&self) -> Option<&SymbolParams> {
        self.symbols.get(self.dot).map(|(_, p)| p)
    }

    fn finished(&self) -> bool {
        self.dot >= self.symbols.len() && !self.is_incomplete
    }

    fn next(&self) -> ParseState {
        ParseState {
            nonterminal: self.nonterminal.clone(),
            position: self.position,
            symbols: self.symbols.clone(),
            dot: self.dot + 1,
            children: self.children.clone(),
            is_incomplete: self.is_incomplete,
        }
    }
}

/// An insertion-ordered set of unique states with an index by the next
/// expected symbol, so completion does not rescan the whole column.
struct Column {
    states: Vec<ParseState>,
    unique: AHashSet<StateKey>,
    dot_map: AHashMap<Symbol, Vec<usize>>,
}

impl Column {
    fn new() -> Self {
        Column {
            states: Vec::new(),
            unique: AHashSet::new(),
            dot_map: AHashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.states.len()
    }

    fn state(&self, index: usize) -> &ParseState {
        &self.states[index]
    }

    fn add(&mut self, state: ParseState) -> bool {
        if !self.unique.insert(state.key()) {
            return false;
        }
        let index = self.states.len();
        if let Some(symbol) = state.dot_symbol() {
            self.dot_map.entry(symbol.clone()).or_default().push(index);
        }
        self.states.push(state);
        true
    }

    fn replace(&mut self, index: usize, new_state: ParseState) {
        let old = &self.states[index];
        self.unique.remove(&old.key());
        if let Some(symbol) = old.dot_symbol() {
            if let Some(indices) = self.dot_map.get_mut(symbol) {
                indices.retain(|&i| i != index);
            }
        }
        self.unique.insert(new_state.key());
        if let Some(symbol) = new_state.dot_symbol() {
            self.dot_map.entry(symbol.clone()).or_default().push(index);
        }
        self.states[index] = new_state;
    }

    fn dot_index(&self, symbol: &Symbol, nth: usize) -> Option<usize> {
        self.dot_map.get(symbol).and_then(|v| v.get(nth)).copied()
    }

    fn dot_indices(&self, symbol: &Symbol) -> Vec<usize> {
        self.dot_map.get(symbol).cloned().unwrap_or_default()
    }

    fn make_incomplete(&mut self, index: usize) {
        self.states[index].is_incomplete = true;
    }
}

pub(crate) enum RepCompileError {
    Grammar(GrammarError),
    Bound(BoundError),
}

impl From<GrammarError> for RepCompileError {
    fn from(e: GrammarError) -> Self {
        RepCompileError::Grammar(e)
    }
}

impl From<BoundError> for RepCompileError {
    fn from(e: BoundError) -> Self {
        RepCompileError::Bound(e)
    }
}

/// The compiled rule tables and caches of one grammar.
pub(crate) struct Parser {
    implicit_start: NonTerminal,
    rules: AHashMap<NonTerminal, Vec<Alternation>>,
    implicit_rules: AHashMap<NonTerminal, Vec<Alternation>>,
    context_rules: AHashMap<NonTerminal, (IrId, RuleSymbol)>,
    tmp_rules: AHashMap<NonTerminal, Vec<Alternation>>,
    implicit_count: usize,
    context_count: usize,
    tmp_count: usize,
    cache: AHashMap<u64, Vec<DerivationTree>>,
    max_position: Option<usize>,
}

fn to_alternations(alternatives: Vec<Vec<RuleSymbol>>) -> Vec<Alternation> {
    alternatives.into_iter().map(Rc::from).collect()
}

impl Parser {
    /// Normalise every grammar rule into flat alternations.
    pub(crate) fn compile(
        view: GrammarView<'_>,
        rule_order: &[NonTerminal],
    ) -> Result<Parser, GrammarError> {
        let mut parser = Parser {
            implicit_start: NonTerminal::new("<*start*>"),
            rules: AHashMap::new(),
            implicit_rules: AHashMap::new(),
            context_rules: AHashMap::new(),
            tmp_rules: AHashMap::new(),
            implicit_count: 0,
            context_count: 0,
            tmp_count: 0,
            cache: AHashMap::new(),
            max_position: None,
        };
        for name in rule_order {
            let body = view.rules[name];
            let alternatives = parser.visit(view, body)?;
            parser.set_rule(name.clone(), alternatives);
        }
        Ok(parser)
    }

    pub(crate) fn max_position(&self) -> Option<usize> {
        self.max_position
    }

    pub(crate) fn no_parse_error(&self, input: &ParseInput) -> ParseError {
        match self.max_position {
            Some(position) => {
                let from = position.min(input.bytes.len());
                let to = (from + 16).min(input.bytes.len());
                ParseError::NoParse {
                    max_position: position,
                    offending: Terminal::Bytes(input.bytes[from..to].to_vec()).to_string(),
                }
            }
            None => ParseError::NoProgress,
        }
    }

    fn set_rule(&mut self, nonterminal: NonTerminal, alternatives: Vec<Vec<RuleSymbol>>) {
        self.rules
            .insert(nonterminal, to_alternations(alternatives));
    }

    fn fresh_implicit_name(&mut self) -> NonTerminal {
        let nt = NonTerminal::new(format!("<*{}*>", self.implicit_count));
        self.implicit_count += 1;
        nt
    }

    fn set_implicit_rule(&mut self, alternatives: Vec<Vec<RuleSymbol>>) -> RuleSymbol {
        let nt = self.fresh_implicit_name();
        self.implicit_rules
            .insert(nt.clone(), to_alternations(alternatives));
        (Symbol::NonTerminal(nt), SymbolParams::default())
    }

    fn set_context_rule(&mut self, repetition: IrId, inner: RuleSymbol) -> NonTerminal {
        let nt = NonTerminal::new(format!("<*ctx_{}*>", self.context_count));
        self.context_count += 1;
        self.context_rules.insert(nt.clone(), (repetition, inner));
        nt
    }

    fn set_tmp_rule(&mut self, alternatives: Vec<Vec<RuleSymbol>>) -> RuleSymbol {
        let nt = NonTerminal::new(format!("<*tmp_{}*>", self.tmp_count));
        self.tmp_count += 1;
        self.tmp_rules
            .insert(nt.clone(), to_alternations(alternatives));
        (Symbol::NonTerminal(nt), SymbolParams::default())
    }

    fn clear_tmp(&mut self) {
        self.tmp_rules.clear();
        self.tmp_count = 0;
    }

    fn visit(
        &mut self,
        view: GrammarView<'_>,
        id: IrId,
    ) -> Result<Vec<Vec<RuleSymbol>>, GrammarError> {
        match view.ir(id) {
            IrNode::Alternative(children) => {
                let children = children.clone();
                let mut result = Vec::new();
                for child in children {
                    result.extend(self.visit(view, child)?);
                }
                let nt = NonTerminal::new(format!("<__alternative:{}>", id.0));
                self.set_rule(nt.clone(), result);
                Ok(vec![vec![(Symbol::NonTerminal(nt), SymbolParams::default())]])
            }
            IrNode::Concatenation(children) => {
                let children = children.clone();
                let mut result: Vec<Vec<RuleSymbol>> = vec![Vec::new()];
                for child in children {
                    let to_add = self.visit(view, child)?;
                    let mut next = Vec::with_capacity(result.len() * to_add.len());
                    for r in &result {
                        for a in &to_add {
                            let mut row = r.clone();
                            row.extend(a.iter().cloned());
                            next.push(row);
                        }
                    }
                    result = next;
                }
                let nt = NonTerminal::new(format!("<__concatenation:{}>", id.0));
                self.set_rule(nt.clone(), result);
                Ok(vec![vec![(Symbol::NonTerminal(nt), SymbolParams::default())]])
            }
            IrNode::Repetition(rep) => match rep.kind {
                RepetitionKind::Star => {
                    let inner = self.visit(view, rep.inner)?;
                    let nt = self.fresh_implicit_name();
                    let nt_sym = (Symbol::NonTerminal(nt.clone()), SymbolParams::default());
                    let mut alternatives: Vec<Vec<RuleSymbol>> = vec![Vec::new()];
                    for row in inner {
                        let mut recursive = row;
                        recursive.push(nt_sym.clone());
                        alternatives.push(recursive);
                    }
                    self.implicit_rules
                        .insert(nt, to_alternations(alternatives));
                    let star_nt = NonTerminal::new(format!("<__star:{}>", id.0));
                    self.set_rule(star_nt.clone(), vec![vec![nt_sym]]);
                    Ok(vec![vec![(
                        Symbol::NonTerminal(star_nt),
                        SymbolParams::default(),
                    )]])
                }
                RepetitionKind::Plus => {
                    let inner = self.visit(view, rep.inner)?;
                    let nt = self.fresh_implicit_name();
                    let nt_sym = (Symbol::NonTerminal(nt.clone()), SymbolParams::default());
                    let mut alternatives = Vec::with_capacity(inner.len() * 2);
                    for row in inner {
                        alternatives.push(row.clone());
                        let mut recursive = row;
                        recursive.push(nt_sym.clone());
                        alternatives.push(recursive);
                    }
                    self.implicit_rules
                        .insert(nt, to_alternations(alternatives));
                    let plus_nt = NonTerminal::new(format!("<__plus:{}>", id.0));
                    self.set_rule(plus_nt.clone(), vec![vec![nt_sym]]);
                    Ok(vec![vec![(
                        Symbol::NonTerminal(plus_nt),
                        SymbolParams::default(),
                    )]])
                }
                RepetitionKind::Option => {
                    let mut result = vec![Vec::new()];
                    result.extend(self.visit(view, rep.inner)?);
                    let nt = NonTerminal::new(format!("<__option:{}>", id.0));
                    self.set_rule(nt.clone(), result);
                    Ok(vec![vec![(Symbol::NonTerminal(nt), SymbolParams::default())]])
                }
                RepetitionKind::Repetition => {
                    let min_source = rep.min.source().to_string();
                    self.compile_repetition(view, id, None, None)
                        .map_err(|e| match e {
                            RepCompileError::Grammar(e) => e,
                            RepCompileError::Bound(error) => GrammarError::Bound {
                                source: min_source,
                                error,
                            },
                        })
                }
            },
            IrNode::NonTerminalRef(r) => Ok(vec![vec![(
                Symbol::NonTerminal(r.symbol.clone()),
                SymbolParams {
                    sender: r.sender.clone(),
                    recipient: r.recipient.clone(),
                },
            )]]),
            IrNode::Terminal(t) => Ok(vec![vec![(
                Symbol::Terminal(t.clone()),
                SymbolParams::default(),
            )]]),
            IrNode::CharSet(chars) => {
                let result: Vec<Vec<RuleSymbol>> = chars
                    .iter()
                    .map(|c| {
                        vec![(
                            Symbol::Terminal(Terminal::Str(c.to_string())),
                            SymbolParams::default(),
                        )]
                    })
                    .collect();
                let nt = NonTerminal::new(format!("<__char_set:{}>", id.0));
                self.set_rule(nt.clone(), result);
                Ok(vec![vec![(Symbol::NonTerminal(nt), SymbolParams::default())]])
            }
        }
    }

    /// Compile a bounded repetition into a chain of implicit rules allowing
    /// `min..=max` copies of the inner rule. At grammar-compile time a
    /// data-dependent repetition becomes a context rule instead; when the
    /// predictor later reaches it, this function runs again with the
    /// partial `tree` available and emits per-parse temporary rules.
    fn compile_repetition(
        &mut self,
        view: GrammarView<'_>,
        id: IrId,
        inner_nt: Option<RuleSymbol>,
        mut tree: Option<(&mut DerivationTree, NodeId)>,
    ) -> Result<Vec<Vec<RuleSymbol>>, RepCompileError> {
        let IrNode::Repetition(rep) = view.ir(id) else {
            return Ok(Vec::new());
        };
        let is_context = rep.has_searches();
        let (nt, fresh) = match inner_nt {
            Some(nt) => (nt, false),
            None => {
                let inner = self.visit(view, rep.inner)?;
                (self.set_implicit_rule(inner), true)
            }
        };
        if is_context && fresh {
            let ctx_nt = self.set_context_rule(id, nt);
            let rep_nt = NonTerminal::new(format!("<__repetition:{}>", id.0));
            self.set_rule(
                rep_nt.clone(),
                vec![vec![(Symbol::NonTerminal(ctx_nt), SymbolParams::default())]],
            );
            return Ok(vec![vec![(
                Symbol::NonTerminal(rep_nt),
                SymbolParams::default(),
            )]]);
        }

        let node_min = match &mut tree {
            Some((t, n)) => rep.min_count(view.env, view.config, Some((&mut **t, *n)))?,
            None => rep.min_count(view.env, view.config, None)?,
        };
        let node_max = match &mut tree {
            Some((t, n)) => rep.max_count(view.env, view.config, Some((&mut **t, *n)))?,
            None => rep.max_count(view.env, view.config, None)?,
        };

        let mut prev: Option<RuleSymbol> = None;
        for _ in node_min..node_max {
            let mut alternatives = vec![vec![nt.clone()]];
            if let Some(p) = &prev {
                alternatives.push(vec![nt.clone(), p.clone()]);
            }
            prev = Some(if is_context {
                self.set_tmp_rule(alternatives)
            } else {
                self.set_implicit_rule(alternatives)
            });
        }
        let mut alternatives = vec![vec![nt.clone(); node_min]];
        if let Some(p) = &prev {
            let mut row = vec![nt.clone(); node_min];
            row.push(p.clone());
            alternatives.push(row);
        }
        if is_context {
            return Ok(vec![vec![self.set_tmp_rule(alternatives)]]);
        }
        let min_nt = self.set_implicit_rule(alternatives);
        let rep_nt = NonTerminal::new(format!("<__repetition:{}>", id.0));
        self.set_rule(rep_nt.clone(), vec![vec![min_nt]]);
        Ok(vec![vec![(
            Symbol::NonTerminal(rep_nt),
            SymbolParams::default(),
        )]])
    }

    fn compile_repetition_ctx(
        &mut self,
        view: GrammarView<'_>,
        id: IrId,
        inner_nt: RuleSymbol,
        tree: &mut DerivationTree,
        node: NodeId,
    ) -> Result<RuleSymbol, RepCompileError> {
        let mut rows = self.compile_repetition(view, id, Some(inner_nt), Some((tree, node)))?;
        let row = rows.pop().unwrap_or_default();
        row.into_iter()
            .next()
            .ok_or(RepCompileError::Bound(BoundError::MultipleSearches))
    }
}

fn cache_key(
    word: &[u8],
    start: &NonTerminal,
    mode: ParsingMode,
    hookin: Option<&DerivationTree>,
) -> u64 {
    let mut hasher = ahash::RandomState::with_seeds(
        0x1fd7_02c3_88ab_44e0,
        0x6a95_be31_c077_d2f8,
        0x03e8_49d1_72b6_5a9c,
        0xd414_87f0_2e6b_913a,
    )
    .build_hasher();
    word.hash(&mut hasher);
    start.hash(&mut hasher);
    (mode as u8).hash(&mut hasher);
    hookin.map(|t| t.hash(t.root())).hash(&mut hasher);
    hasher.finish()
}

/// A lazy iterator over the parses of one word. Dropping it midway leaves
/// the parser cache untouched; draining it caches the forest.
pub struct ParseForest<'g> {
    parser: &'g mut Parser,
    view: GrammarView<'g>,
    word: Vec<u8>,
    mode: ParsingMode,
    include_controlflow: bool,
    hookin: Option<DerivationTree>,
    table: Vec<Column>,
    k: usize,
    w: usize,
    bit_count: i32,
    nr_bits_scanned: usize,
    pending: VecDeque<Rc<PTree>>,
    drained: Vec<DerivationTree>,
    seen_incomplete: AHashSet<u64>,
    done: bool,
    cached: bool,
    key: u64,
    from_cache: Option<std::vec::IntoIter<DerivationTree>>,
}

impl<'g> ParseForest<'g> {
    pub(crate) fn new(
        parser: &'g mut Parser,
        view: GrammarView<'g>,
        input: ParseInput,
        start: NonTerminal,
        options: ParseOptions,
    ) -> Self {
        parser.clear_tmp();
        parser.max_position = None;
        let key = cache_key(
            &input.bytes,
            &start,
            options.mode,
            options.hookin_parent.as_ref(),
        );
        let from_cache = parser.cache.get(&key).map(|f| f.clone().into_iter());
        let mut table: Vec<Column> = (0..input.bytes.len() + 1).map(|_| Column::new()).collect();
        let start_symbols: Vec<RuleSymbol> =
            vec![(Symbol::NonTerminal(start), SymbolParams::default())];
        let implicit_start = parser.implicit_start.clone();
        table[0].add(ParseState::new(implicit_start, 0, Rc::from(start_symbols)));
        ParseForest {
            parser,
            view,
            word: input.bytes,
            mode: options.mode,
            include_controlflow: options.include_controlflow,
            hookin: options.hookin_parent,
            table,
            k: 0,
            w: 0,
            bit_count: -1,
            nr_bits_scanned: 0,
            pending: VecDeque::new(),
            drained: Vec::new(),
            seen_incomplete: AHashSet::new(),
            done: false,
            cached: false,
            key,
            from_cache,
        }
    }

    fn update_max_position(&mut self, position: usize) {
        self.parser.max_position = Some(
            self.parser
                .max_position
                .map_or(position, |p| p.max(position)),
        );
    }

    fn process_column(&mut self) {
        if self.k >= self.table.len() {
            self.done = true;
            return;
        }
        let k = self.k;
        let at_end = self.w >= self.word.len();
        let mut i = 0;
        while i < self.table[k].len() {
            let state = self.table[k].state(i).clone();
            if state.finished() {
                if state.nonterminal == self.parser.implicit_start && at_end {
                    for child in &state.children {
                        self.pending.push_back(child.clone());
                    }
                }
                self.complete(&state, k);
            } else if !state.is_incomplete {
                match state.dot_symbol().cloned() {
                    Some(Symbol::NonTerminal(_)) => self.predict(i, &state, k),
                    Some(Symbol::Terminal(t)) => {
                        if t.is_bit() {
                            if self.bit_count < 0 {
                                self.bit_count = 7;
                            }
                            self.scan_bit(&state, k);
                        } else {
                            if (0..=7).contains(&self.bit_count) {
                                // A bit was peeked at but never committed, or
                                // the grammar's bits do not come in multiples
                                // of eight. Either way, back to bytes.
                                log::warn!(
                                    "position {:#06x} ({}): scanning bytes while expecting bit {}; check that bits come in multiples of eight",
                                    self.w,
                                    self.w,
                                    self.bit_count
                                );
                                self.bit_count = -1;
                            }
                            if t.is_regex() {
                                self.scan_regex(i, &state, k);
                            } else {
                                self.scan_bytes(i, &state, k);
                            }
                        }
                    }
                    None => {}
                }
            } else if matches!(state.dot_symbol(), Some(Symbol::NonTerminal(_))) {
                self.predict(i, &state, k);
            }
            i += 1;
        }

        if self.mode == ParsingMode::Incomplete && at_end {
            let mut i = 0;
            while i < self.table[k].len() {
                self.table[k].make_incomplete(i);
                let state = self.table[k].state(i).clone();
                if state.dot == 0 {
                    i += 1;
                    continue;
                }
                if state.nonterminal == self.parser.implicit_start {
                    for child in &state.children {
                        let tree = to_derivation_tree(child);
                        if self.seen_incomplete.insert(tree.hash(tree.root())) {
                            self.pending.push_back(child.clone());
                        }
                    }
                }
                self.complete(&state, k);
                i += 1;
            }
        }

        if self.bit_count >= 0 {
            self.bit_count -= 1;
            self.nr_bits_scanned += 1;
        }
        if self.bit_count < 0 {
            self.w += 1;
        }
        self.place_repetition_shortcut(k);
        self.k += 1;
        if self.k >= self.table.len() {
            self.done = true;
        }
    }

    /// Advance every state in the completed nonterminal's start column that
    /// expects it. User and intermediate rules wrap their children in a
    /// fresh node; implicit rules splice them in place.
    fn complete(&mut self, state: &ParseState, k: usize) {
        let symbol = Symbol::NonTerminal(state.nonterminal.clone());
        let wrap = self.parser.rules.contains_key(&state.nonterminal);
        let mut nth = 0;
        loop {
            let Some(index) = self.table[state.position].dot_index(&symbol, nth) else {
                break;
            };
            let s = self.table[state.position].state(index).clone();
            let dot_params = s.dot_params().cloned().unwrap_or_default();
            let mut next = s.next();
            if wrap {
                next.children.push(PTree::node(
                    state.nonterminal.clone(),
                    &dot_params,
                    state.children.clone(),
                ));
            } else {
                next.children.extend(state.children.iter().cloned());
            }
            self.table[k].add(next);
            nth += 1;
        }
    }

    fn predict(&mut self, state_index: usize, state: &ParseState, k: usize) {
        let Some(Symbol::NonTerminal(nt)) = state.dot_symbol() else {
            return;
        };
        let nt = nt.clone();
        let alternations = self
            .parser
            .rules
            .get(&nt)
            .or_else(|| self.parser.implicit_rules.get(&nt))
            .or_else(|| self.parser.tmp_rules.get(&nt))
            .cloned();
        if let Some(alternations) = alternations {
            for alternation in alternations {
                self.table[k].add(ParseState::new(nt.clone(), k, alternation));
            }
        } else if self.parser.context_rules.contains_key(&nt) {
            self.predict_context_rule(state_index, state, k, &nt);
        }
    }

    /// Lazily build the body of a context rule: reconstruct the partial
    /// tree parsed so far, resolve the repetition bounds against it, and
    /// swap the context nonterminal for the freshly built rule. A bound
    /// that cannot be resolved kills this derivation branch silently.
    fn predict_context_rule(
        &mut self,
        state_index: usize,
        state: &ParseState,
        k: usize,
        ctx_nt: &NonTerminal,
    ) {
        let Some((rep_id, inner_nt)) = self.parser.context_rules.get(ctx_nt).cloned() else {
            return;
        };
        let partial = self.construct_incomplete_tree(state);
        let mut dtree = collapse(&to_derivation_tree(&partial));
        let compiled = match &self.hookin {
            Some(hookin) => {
                let mut host = hookin.clone();
                host.graft(host.root(), &dtree, dtree.root());
                let root = host.root();
                self.parser
                    .compile_repetition_ctx(self.view, rep_id, inner_nt, &mut host, root)
            }
            None => {
                let root = dtree.root();
                self.parser
                    .compile_repetition_ctx(self.view, rep_id, inner_nt, &mut dtree, root)
            }
        };
        let Ok(ctx_symbol) = compiled else {
            return;
        };
        let mut new_symbols: Vec<RuleSymbol> = state.symbols.iter().cloned().collect();
        if state.dot < new_symbols.len() {
            new_symbols[state.dot] = ctx_symbol;
        }
        let mut new_state = state.clone();
        new_state.symbols = Rc::from(new_symbols);
        self.table[k].replace(state_index, new_state.clone());
        self.predict(state_index, &new_state, k);
    }

    /// Rebuild the tree parsed into `state` by following the chain of
    /// states whose next expected symbol produced it, outwards to the
    /// start. Implicit nonterminals merge their children into the parent.
    fn construct_incomplete_tree(&self, state: &ParseState) -> Rc<PTree> {
        let mut current_tree = PTree::node(
            state.nonterminal.clone(),
            &SymbolParams::default(),
            state.children.clone(),
        );
        let mut current = state.clone();
        let mut visited: AHashSet<(NonTerminal, usize)> = AHashSet::new();
        loop {
            if !visited.insert((current.nonterminal.clone(), current.position)) {
                break;
            }
            let symbol = Symbol::NonTerminal(current.nonterminal.clone());
            let Some(index) = self.table[current.position].dot_index(&symbol, 0) else {
                break;
            };
            let next_state = self.table[current.position].state(index).clone();
            let dot_params = next_state.dot_params().cloned().unwrap_or_default();
            let merge = matches!(
                &current_tree.symbol,
                Symbol::NonTerminal(nt) if nt.name().starts_with("<*")
            );
            let mut children = next_state.children.clone();
            if merge {
                children.extend(current_tree.children.iter().cloned());
            } else {
                children.push(current_tree.clone());
            }
            current_tree = PTree::node(next_state.nonterminal.clone(), &dot_params, children);
            current = next_state;
        }
        current_tree
            .children
            .first()
            .cloned()
            .unwrap_or(current_tree)
    }

    fn scan_bit(&mut self, state: &ParseState, k: usize) {
        let w = self.w;
        if w >= self.word.len() {
            return;
        }
        debug_assert!((0..=7).contains(&self.bit_count));
        let bit = (self.word[w] >> self.bit_count) & 1;
        let Some(Symbol::Terminal(terminal)) = state.dot_symbol() else {
            return;
        };
        if !terminal.check_bit(bit) {
            return;
        }
        let mut next = state.next();
        next.children.push(PTree::leaf(Terminal::Bit(bit)));
        // The initial chart has one column per input byte; grow it on
        // demand as bits are consumed.
        if self.table.len() <= self.word.len() + 1 + self.nr_bits_scanned {
            self.table.insert(k + 1, Column::new());
        }
        self.table[k + 1].add(next);
        self.update_max_position(w);
    }

    fn scan_bytes(&mut self, state_index: usize, state: &ParseState, k: usize) {
        let w = self.w.min(self.word.len());
        let Some(Symbol::Terminal(terminal)) = state.dot_symbol().cloned() else {
            return;
        };
        let remaining = &self.word[w..];
        let mut is_incomplete = false;
        let match_length = match terminal.check(remaining, false) {
            Some(n) => n,
            None => {
                if self.mode != ParsingMode::Incomplete
                    || w + terminal.literal_len() < self.word.len()
                {
                    return;
                }
                match terminal.check(remaining, true) {
                    Some(n) if n > 0 => {
                        is_incomplete = true;
                        n
                    }
                    _ => return,
                }
            }
        };
        if is_incomplete {
            self.table[k].make_incomplete(state_index);
        }
        let matched = &remaining[..match_length];
        let leaf = match &terminal {
            Terminal::Bytes(_) => Terminal::Bytes(matched.to_vec()),
            _ => Terminal::Str(String::from_utf8_lossy(matched).into_owned()),
        };
        let mut next = state.next();
        next.is_incomplete = next.is_incomplete || is_incomplete;
        next.children.push(PTree::leaf(leaf));
        if k + match_length < self.table.len() {
            self.table[k + match_length].add(next);
        }
        self.update_max_position(w + match_length);
    }

    fn scan_regex(&mut self, state_index: usize, state: &ParseState, k: usize) {
        let w = self.w.min(self.word.len());
        let Some(Symbol::Terminal(terminal)) = state.dot_symbol().cloned() else {
            return;
        };
        let Terminal::Regex(regex) = &terminal else {
            return;
        };
        let remaining = &self.word[w..];
        let mut is_incomplete = false;
        let match_length = match terminal.check(remaining, false) {
            Some(n) => n,
            None => {
                if self.mode != ParsingMode::Incomplete {
                    return;
                }
                match terminal.check(remaining, true) {
                    Some(n) if w + n >= self.word.len() => {
                        is_incomplete = true;
                        n
                    }
                    _ => return,
                }
            }
        };
        if is_incomplete {
            self.table[k].make_incomplete(state_index);
        }
        let matched = &remaining[..match_length];
        let leaf = if regex.is_bytes() {
            Terminal::Bytes(matched.to_vec())
        } else {
            Terminal::Str(String::from_utf8_lossy(matched).into_owned())
        };
        let mut next = state.next();
        next.is_incomplete = next.is_incomplete || is_incomplete;
        next.children.push(PTree::leaf(leaf));
        if k + match_length < self.table.len() {
            self.table[k + match_length].add(next);
        }
        self.update_max_position(w + match_length);
    }

    /// Collapse the backpointer chain of a right-recursive `+`/`*` state
    /// into a single state whose children concatenate the chain's children.
    /// Keeps long repetitions from walking a quadratic completion chain.
    /// Only fires when exactly one backpointer chain exists.
    fn place_repetition_shortcut(&mut self, k: usize) {
        let is_beginner_rule =
            |nt: &NonTerminal| nt.name().starts_with("<__plus:") || nt.name().starts_with("<__star:");
        let mut found_beginners: AHashSet<NonTerminal> = AHashSet::new();
        for i in 0..self.table[k].len() {
            let state = self.table[k].state(i);
            if is_beginner_rule(&state.nonterminal) {
                if let Some((Symbol::NonTerminal(first), _)) = state.symbols.first() {
                    found_beginners.insert(first.clone());
                }
            }
        }

        for beginner in found_beginners {
            let beginner_symbol = Symbol::NonTerminal(beginner.clone());
            let mut current: Option<(usize, ParseState)> = None;
            for i in 0..self.table[k].len() {
                let state = self.table[k].state(i);
                if state.nonterminal == beginner
                    && !state.finished()
                    && state.symbols.len() == 2
                    && state.dot_symbol() == Some(&beginner_symbol)
                {
                    current = Some((i, state.clone()));
                    break;
                }
            }
            let Some((index, current_state)) = current else {
                continue;
            };
            let mut new_state = current_state;
            let origins = self.table[new_state.position].dot_indices(&beginner_symbol);
            if origins.len() != 1 {
                continue;
            }
            let mut origin = self.table[new_state.position].state(origins[0]).clone();
            let mut merged = Some(new_state.clone());
            let mut hops = 0;
            while !is_beginner_rule(&origin.nonterminal) {
                hops += 1;
                if hops > self.table.len() {
                    merged = None;
                    break;
                }
                let mut children = origin.children.clone();
                children.extend(new_state.children.iter().cloned());
                new_state = ParseState {
                    nonterminal: new_state.nonterminal.clone(),
                    position: origin.position,
                    symbols: new_state.symbols.clone(),
                    dot: new_state.dot,
                    children,
                    is_incomplete: new_state.is_incomplete,
                };
                merged = Some(new_state.clone());
                let origins = self.table[new_state.position].dot_indices(&beginner_symbol);
                if origins.len() != 1 {
                    merged = None;
                    break;
                }
                origin = self.table[new_state.position].state(origins[0]).clone();
            }
            if let Some(merged) = merged {
                self.table[k].replace(index, merged);
            }
        }
    }
}

impl Iterator for ParseForest<'_> {
    type Item = DerivationTree;

    fn next(&mut self) -> Option<DerivationTree> {
        if let Some(iter) = &mut self.from_cache {
            let tree = iter.next()?;
            return Some(if self.include_controlflow {
                tree
            } else {
                collapse(&tree)
            });
        }
        loop {
            if let Some(ptree) = self.pending.pop_front() {
                let tree = to_derivation_tree(&ptree);
                self.drained.push(tree.clone());
                return Some(if self.include_controlflow {
                    tree
                } else {
                    collapse(&tree)
                });
            }
            if self.done {
                if !self.cached {
                    self.cached = true;
                    self.parser
                        .cache
                        .insert(self.key, std::mem::take(&mut self.drained));
                }
                return None;
            }
            self.process_column();
        }
    }
}
