//! Disambiguation and k-path coverage scoring.
//!
//! The [`Disambiguator`] maps, per IR node, every observable flat sequence
//! of child symbols back to the IR paths that could have produced it; a
//! concrete derivation tree is then traversed against these maps to
//! enumerate the IR paths it exercises. Grammar k-paths are enumerated
//! separately through the `descendents` relation, and coverage is the
//! fraction of them exercised by a set of trees.
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use crate::grammar::{Grammar, GrammarError, IrId, IrNode, RepetitionKind};
use crate::symbol::{Symbol, Terminal};
use crate::tree::{DerivationTree, NodeId};

pub(crate) type IrPath = Vec<IrId>;
type DisambMap = AHashMap<Vec<Symbol>, Vec<IrPath>>;

pub(crate) struct Disambiguator<'g> {
    grammar: &'g Grammar,
    memo: AHashMap<IrId, Rc<DisambMap>>,
}

impl<'g> Disambiguator<'g> {
    pub(crate) fn new(grammar: &'g Grammar) -> Self {
        Disambiguator {
            grammar,
            memo: AHashMap::new(),
        }
    }

    pub(crate) fn visit(&mut self, id: IrId) -> Rc<DisambMap> {
        if let Some(known) = self.memo.get(&id) {
            return known.clone();
        }
        let result = Rc::new(self.compute(id));
        self.memo.insert(id, result.clone());
        result
    }

    fn compute(&mut self, id: IrId) -> DisambMap {
        match self.grammar.ir(id) {
            IrNode::Alternative(children) => {
                let children = children.clone();
                let mut endpoints: DisambMap = AHashMap::new();
                for child in children {
                    let child_endpoints = self.visit(child);
                    for (symbols, paths) in child_endpoints.iter() {
                        let entry = endpoints.entry(symbols.clone()).or_default();
                        // Paths through different alternatives that yield
                        // the same children cannot be told apart; keep all.
                        entry.extend(paths.iter().map(|p| prefixed(id, p)));
                    }
                }
                endpoints
            }
            IrNode::Concatenation(children) => {
                let children = children.clone();
                let mut acc: Vec<(Vec<Symbol>, Vec<IrPath>)> = vec![(Vec::new(), Vec::new())];
                for child in children {
                    let child_endpoints = self.visit(child);
                    let mut next = Vec::new();
                    for (existing, existing_paths) in &acc {
                        for (symbols, paths) in child_endpoints.iter() {
                            let mut key = existing.clone();
                            key.extend(symbols.iter().cloned());
                            let mut merged = existing_paths.clone();
                            merged.extend(paths.iter().cloned());
                            next.push((key, merged));
                        }
                    }
                    acc = next;
                }
                let mut endpoints: DisambMap = AHashMap::new();
                for (symbols, paths) in acc {
                    endpoints
                        .entry(symbols)
                        .or_default()
                        .extend(paths.iter().map(|p| prefixed(id, p)));
                }
                endpoints
            }
            IrNode::Repetition(rep) => {
                let inner = rep.inner;
                let (min, max) = self.repetition_counts(id);
                let inner_map = self.visit(inner);
                let mut endpoints: DisambMap = AHashMap::new();
                for count in min..=max {
                    let mut acc: Vec<(Vec<Symbol>, Vec<IrPath>)> =
                        vec![(Vec::new(), Vec::new())];
                    for _ in 0..count {
                        let mut next = Vec::new();
                        for (existing, existing_paths) in &acc {
                            for (symbols, paths) in inner_map.iter() {
                                let mut key = existing.clone();
                                key.extend(symbols.iter().cloned());
                                let mut merged = existing_paths.clone();
                                merged.extend(paths.iter().map(|p| prefixed(id, p)));
                                next.push((key, merged));
                            }
                        }
                        acc = next;
                    }
                    for (symbols, paths) in acc {
                        endpoints.entry(symbols).or_default().extend(paths);
                    }
                }
                endpoints
            }
            IrNode::NonTerminalRef(r) => {
                let mut endpoints = DisambMap::new();
                endpoints.insert(
                    vec![Symbol::NonTerminal(r.symbol.clone())],
                    vec![vec![id]],
                );
                endpoints
            }
            IrNode::Terminal(t) => {
                let mut endpoints = DisambMap::new();
                endpoints.insert(vec![Symbol::Terminal(t.clone())], vec![vec![id]]);
                endpoints
            }
            IrNode::CharSet(chars) => {
                let mut endpoints = DisambMap::new();
                for c in chars {
                    endpoints.insert(
                        vec![Symbol::Terminal(Terminal::Str(c.to_string()))],
                        vec![vec![id]],
                    );
                }
                endpoints
            }
        }
    }

    fn repetition_counts(&self, id: IrId) -> (usize, usize) {
        let IrNode::Repetition(rep) = self.grammar.ir(id) else {
            return (0, 0);
        };
        let fallback_max = self.grammar.config().max_repetitions;
        match rep.kind {
            RepetitionKind::Option => (0, 1),
            RepetitionKind::Star => (0, fallback_max),
            RepetitionKind::Plus => (1, fallback_max),
            RepetitionKind::Repetition => {
                let min = rep
                    .min_count(self.grammar.env(), self.grammar.config(), None)
                    .unwrap_or(0);
                let max = rep
                    .max_count(self.grammar.env(), self.grammar.config(), None)
                    .unwrap_or(fallback_max)
                    .max(min);
                (min, max)
            }
        }
    }
}

fn prefixed(id: IrId, path: &IrPath) -> IrPath {
    let mut out = Vec::with_capacity(path.len() + 1);
    out.push(id);
    out.extend(path.iter().copied());
    out
}

/// The nodes reachable from `id` in one expansion step.
pub(crate) fn descendents(grammar: &Grammar, id: IrId) -> Vec<IrId> {
    match grammar.ir(id) {
        IrNode::Alternative(children) | IrNode::Concatenation(children) => children.clone(),
        IrNode::Repetition(rep) => vec![rep.inner],
        IrNode::NonTerminalRef(r) => grammar
            .rules
            .get(&r.symbol)
            .map(|&rule| vec![rule])
            .unwrap_or_default(),
        IrNode::Terminal(_) | IrNode::CharSet(_) => Vec::new(),
    }
}

/// All length-`k` IR paths reachable in the grammar.
pub(crate) fn all_k_paths(grammar: &Grammar, k: usize) -> AHashSet<IrPath> {
    if k == 0 {
        return AHashSet::new();
    }
    let mut initial: AHashSet<IrId> = AHashSet::new();
    let mut work: Vec<IrId> = grammar
        .rule_order
        .iter()
        .map(|name| grammar.rules[name])
        .collect();
    while let Some(id) = work.pop() {
        if initial.insert(id) {
            work.extend(descendents(grammar, id));
        }
    }
    let mut paths: AHashSet<IrPath> = initial.into_iter().map(|id| vec![id]).collect();
    for _ in 1..k {
        let mut next = AHashSet::new();
        for base in &paths {
            let Some(&last) = base.last() else {
                continue;
            };
            for descendent in descendents(grammar, last) {
                let mut extended = base.clone();
                extended.push(descendent);
                next.insert(extended);
            }
        }
        paths = next;
    }
    paths
}

/// Enumerate the IR paths `tree` exercises.
pub(crate) fn traverse_derivation(
    grammar: &Grammar,
    disambiguator: &mut Disambiguator<'_>,
    tree: &DerivationTree,
    id: NodeId,
    paths: &mut AHashSet<IrPath>,
    current: IrPath,
) -> Result<(), GrammarError> {
    let symbol = tree.symbol(id);
    let Symbol::NonTerminal(nt) = symbol else {
        if !current.is_empty() {
            paths.insert(current);
        }
        return Ok(());
    };
    let Some(&rule) = grammar.rules.get(nt) else {
        return Err(grammar.unknown_non_terminal(nt));
    };
    let map = disambiguator.visit(rule);
    let key: Vec<Symbol> = tree
        .children(id)
        .iter()
        .map(|&c| tree.symbol(c).clone())
        .collect();
    let Some(child_paths) = map.get(&key) else {
        // The children are not derivable from the recorded expansions
        // (regex matches, foreign subtrees); keep what we have.
        if !current.is_empty() {
            paths.insert(current);
        }
        return Ok(());
    };
    for (&child, path) in tree.children(id).iter().zip(child_paths.iter()) {
        let mut extended = current.clone();
        extended.extend(path.iter().copied());
        traverse_derivation(grammar, disambiguator, tree, child, paths, extended)?;
    }
    Ok(())
}

/// Coverage of length-`k` IR paths by a set of derivation trees. Covered
/// paths are intersected with the enumerated universe, so the ratio stays
/// within `[0, 1]`.
pub(crate) fn compute_grammar_coverage(
    grammar: &Grammar,
    trees: &[DerivationTree],
    k: usize,
) -> Result<(f64, usize, usize), GrammarError> {
    let all = all_k_paths(grammar, k);
    if all.is_empty() {
        return Err(GrammarError::EmptyKPaths(k));
    }
    let mut disambiguator = Disambiguator::new(grammar);
    let mut covered: AHashSet<IrPath> = AHashSet::new();
    for tree in trees {
        let mut tree_paths = AHashSet::new();
        traverse_derivation(
            grammar,
            &mut disambiguator,
            tree,
            tree.root(),
            &mut tree_paths,
            Vec::new(),
        )?;
        for path in tree_paths {
            if path.len() < k {
                continue;
            }
            for window in path.windows(k) {
                if all.contains(window) {
                    covered.insert(window.to_vec());
                }
            }
        }
    }
    Ok((
        covered.len() as f64 / all.len() as f64,
        covered.len(),
        all.len(),
    ))
}
