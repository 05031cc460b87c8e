//! Budgeted top-down random expansion of grammar rules.
//!
//! Expansion consumes a node budget: every node spent by a child is
//! subtracted from the budget handed to its siblings, and once a node's
//! `distance_to_completion` exceeds what is left, expansion switches to the
//! shortest completion (budget zero picks only minimum-distance
//! alternatives and minimum repetition counts). The budget is a target, not
//! a hard cap: a grammar whose smallest tree is larger than the budget
//! still produces that smallest tree.
use rand::Rng;

use crate::grammar::{FuzzError, Grammar, IrId, IrNode, NonTerminalRef};
use crate::symbol::{NonTerminal, Symbol, Terminal};
use crate::tree::{DerivationTree, NodeId};

pub(crate) fn fuzz<R: Rng>(
    grammar: &mut Grammar,
    rng: &mut R,
    start: &NonTerminal,
    max_nodes: usize,
    prefix: Option<&DerivationTree>,
) -> Result<DerivationTree, FuzzError> {
    let mut root = match prefix {
        Some(p) => p.clone(),
        None => DerivationTree::new(Symbol::NonTerminal(start.clone())),
    };
    let root_id = root.root();
    let fuzzed_index = root.children(root_id).len();
    let start_ref = NonTerminalRef {
        symbol: start.clone(),
        sender: None,
        recipient: None,
    };
    fuzz_non_terminal_ref(
        grammar,
        rng,
        &start_ref,
        &mut root,
        root_id,
        max_nodes as i64,
        false,
    )?;
    let child = root.children(root_id)[fuzzed_index];
    Ok(root.deepcopy(child))
}

fn fuzz_ir<R: Rng>(
    grammar: &mut Grammar,
    rng: &mut R,
    id: IrId,
    tree: &mut DerivationTree,
    parent: NodeId,
    max_nodes: i64,
    in_message: bool,
) -> Result<(), FuzzError> {
    let node = grammar.ir(id).clone();
    match node {
        IrNode::Alternative(children) => {
            if grammar.distances[id.index()] >= max_nodes as f64 {
                let min_distance = children
                    .iter()
                    .map(|c| grammar.distances[c.index()])
                    .fold(f64::INFINITY, f64::min);
                let candidates: Vec<IrId> = children
                    .into_iter()
                    .filter(|c| grammar.distances[c.index()] <= min_distance)
                    .collect();
                let pick = candidates[rng.random_range(0..candidates.len())];
                return fuzz_ir(grammar, rng, pick, tree, parent, 0, in_message);
            }
            let pick = children[rng.random_range(0..children.len())];
            fuzz_ir(grammar, rng, pick, tree, parent, max_nodes - 1, in_message)
        }
        IrNode::Concatenation(children) => {
            let mut budget = max_nodes;
            let mut prev_size = tree.size(parent) as i64;
            for child in children {
                if grammar.distances[child.index()] >= budget as f64 {
                    fuzz_ir(grammar, rng, child, tree, parent, 0, in_message)?;
                } else {
                    fuzz_ir(grammar, rng, child, tree, parent, budget - 1, in_message)?;
                }
                let size = tree.size(parent) as i64;
                budget -= size - prev_size;
                prev_size = size;
            }
            Ok(())
        }
        IrNode::Repetition(rep) => {
            let mut budget = max_nodes;
            let mut prev_size = tree.size(parent) as i64;
            let current_min =
                rep.min_count(&grammar.env, &grammar.config, Some((&mut *tree, parent)))?;
            let current_max =
                rep.max_count(&grammar.env, &grammar.config, Some((&mut *tree, parent)))?;
            let count = rng.random_range(current_min..=current_max.max(current_min));
            for done in 0..count {
                if grammar.distances[rep.inner.index()] >= budget as f64 {
                    if done >= current_min {
                        break;
                    }
                    fuzz_ir(grammar, rng, rep.inner, tree, parent, 0, in_message)?;
                } else {
                    fuzz_ir(grammar, rng, rep.inner, tree, parent, budget - 1, in_message)?;
                }
                let size = tree.size(parent) as i64;
                budget -= size - prev_size;
                prev_size = size;
            }
            Ok(())
        }
        IrNode::NonTerminalRef(r) => {
            fuzz_non_terminal_ref(grammar, rng, &r, tree, parent, max_nodes, in_message)
        }
        IrNode::Terminal(terminal) => {
            match terminal {
                Terminal::Regex(regex) => {
                    let sample = regex.sample(rng, grammar.config.max_repetitions);
                    let leaf = if regex.is_bytes() {
                        Terminal::Bytes(sample)
                    } else {
                        Terminal::Str(String::from_utf8_lossy(&sample).into_owned())
                    };
                    tree.add_child(parent, Symbol::Terminal(leaf));
                }
                literal => {
                    tree.add_child(parent, Symbol::Terminal(literal));
                }
            }
            Ok(())
        }
        IrNode::CharSet(chars) => {
            if !chars.is_empty() {
                let c = chars[rng.random_range(0..chars.len())];
                tree.add_child(parent, Symbol::Terminal(Terminal::Str(c.to_string())));
            }
            Ok(())
        }
    }
}

fn fuzz_non_terminal_ref<R: Rng>(
    grammar: &mut Grammar,
    rng: &mut R,
    node: &NonTerminalRef,
    tree: &mut DerivationTree,
    parent: NodeId,
    max_nodes: i64,
    mut in_message: bool,
) -> Result<(), FuzzError> {
    let Some(&rule) = grammar.rules.get(&node.symbol) else {
        return Err(grammar.unknown_non_terminal(&node.symbol).into());
    };
    let dummy = tree.add_child(parent, Symbol::NonTerminal(node.symbol.clone()));

    if grammar.is_use_generator(tree, dummy) {
        // Fuzz the generator's inputs first, in declared parameter order so
        // a seeded run stays reproducible; they become the sources of the
        // generated subtree.
        let mut fuzzed: Vec<NonTerminal> = Vec::new();
        let params: Vec<NonTerminal> = grammar
            .get_generator(&node.symbol)
            .map(|g| g.params().iter().map(|(_, nt)| nt.clone()).collect())
            .unwrap_or_default();
        for dependency in params {
            if fuzzed.contains(&dependency) {
                continue;
            }
            fuzzed.push(dependency.clone());
            let dep_ref = NonTerminalRef {
                symbol: dependency,
                sender: None,
                recipient: None,
            };
            fuzz_non_terminal_ref(grammar, rng, &dep_ref, tree, dummy, max_nodes - 1, in_message)?;
        }
        let sources: Vec<DerivationTree> = tree
            .children(dummy)
            .iter()
            .map(|&c| tree.deepcopy(c))
            .collect();
        let mut generated = grammar.generate(&node.symbol, &sources)?;
        let generated_root = generated.root();
        // The generated surface must survive mutation untouched, or it
        // would no longer match its sources.
        let generated_children: Vec<NodeId> = generated.children(generated_root).to_vec();
        for child in generated_children {
            generated.set_all_read_only(child, true);
        }
        generated.set_sender(generated_root, node.sender.as_deref());
        generated.set_recipient(generated_root, node.recipient.as_deref());
        tree.remove_last_child(parent);
        tree.graft(parent, &generated, generated_root);
        return Ok(());
    }

    tree.remove_last_child(parent);
    let mut sender = None;
    let mut recipient = None;
    if !in_message && node.sender.is_some() {
        sender = node.sender.clone();
        recipient = node.recipient.clone();
        in_message = true;
    }
    let current = tree.add_child(parent, Symbol::NonTerminal(node.symbol.clone()));
    if sender.is_some() {
        tree.set_sender(current, sender.as_deref());
        tree.set_recipient(current, recipient.as_deref());
    }
    fuzz_ir(grammar, rng, rule, tree, current, max_nodes - 1, in_message)
}
