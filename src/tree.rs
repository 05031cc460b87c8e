//! Derivation trees.
//!
//! A [`DerivationTree`] is an arena of nodes addressed by [`NodeId`]s: the
//! root is always node 0, parents are index back-links, and every mutation
//! goes through the arena so that cached sizes and structural hashes stay
//! consistent. Besides the phrase structure (`children`), nodes carry
//! auxiliary `sources` edges recording the subtrees a generator consumed to
//! produce them; sources are not part of the surface, do not count towards
//! sizes, and are excluded from structural hashes.
use std::cell::Cell;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::{AHashMap, AHashSet, RandomState};
use displaydoc::Display;
use nonmax::NonMaxU32;
use smol_str::SmolStr;

use crate::expr::Value;
use crate::grammar::{FuzzError, Grammar};
use crate::symbol::{NonTerminal, Symbol, Terminal};
use crate::utils::{latin1_decode, pack_bits};

/// Index of a node within a [`DerivationTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A message boundary found in a protocol-style derivation tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    /// The party that sends this message.
    pub sender: SmolStr,
    /// The party the message is addressed to, if annotated.
    pub recipient: Option<SmolStr>,
    /// The root of the message subtree.
    pub node: NodeId,
}

#[derive(Debug, Display)]
/// The error type for value aggregation over derivation trees.
pub enum ValueError {
    /// Cannot combine {0} and {1} into one value.
    Combine(String, String),
    /// A bit run exceeds the supported integer width.
    TooWide,
    /// Bit value {0} does not name a valid code point or byte.
    OutOfRange(i128),
}

impl std::error::Error for ValueError {}

#[derive(Debug, Clone)]
struct TreeNode {
    symbol: Symbol,
    parent: Option<NonMaxU32>,
    children: Vec<NodeId>,
    sources: Vec<NodeId>,
    sender: Option<SmolStr>,
    recipient: Option<SmolStr>,
    read_only: bool,
    size: u32,
    hash_cache: Cell<Option<u64>>,
}

impl TreeNode {
    fn new(symbol: Symbol) -> Self {
        TreeNode {
            symbol,
            parent: None,
            children: Vec::new(),
            sources: Vec::new(),
            sender: None,
            recipient: None,
            read_only: false,
            size: 1,
            hash_cache: Cell::new(None),
        }
    }
}

fn tree_hasher() -> impl Hasher {
    // Fixed seeds: structural hashes must be comparable across trees and
    // usable as cache keys within one process.
    RandomState::with_seeds(
        0x7b1c_03a9_95e1_6c4d,
        0x2d8f_4ab0_11c7_92e3,
        0x90d3_57f2_6b08_eea1,
        0x4c61_2e9d_a8f5_0b72,
    )
    .build_hasher()
}

/// An ordered tree of [`Symbol`]s with parent links, source edges, party
/// tags, read-only flags, and cached sizes and structural hashes.
#[derive(Debug, Clone)]
pub struct DerivationTree {
    nodes: Vec<TreeNode>,
}

impl DerivationTree {
    /// Create a tree consisting of a single root node.
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        DerivationTree {
            nodes: vec![TreeNode::new(symbol.into())],
        }
    }

    pub(crate) fn empty() -> Self {
        DerivationTree { nodes: Vec::new() }
    }

    /// The root node. The tree always has one.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.index()]
    }

    pub(crate) fn alloc(&mut self, symbol: Symbol) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(TreeNode::new(symbol));
        id
    }

    /// The symbol at `id`.
    pub fn symbol(&self, id: NodeId) -> &Symbol {
        &self.node(id).symbol
    }

    /// The children of `id`, in phrase order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// The source subtrees captured when `id` was produced by a generator.
    pub fn sources(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).sources
    }

    /// The parent of `id`, or `None` at the root.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent.map(|p| NodeId(p.get()))
    }

    /// The sending party tag, if any.
    pub fn sender(&self, id: NodeId) -> Option<&str> {
        self.node(id).sender.as_deref()
    }

    /// The receiving party tag, if any.
    pub fn recipient(&self, id: NodeId) -> Option<&str> {
        self.node(id).recipient.as_deref()
    }

    /// Whether the subtree at `id` must be skipped by replacement.
    pub fn read_only(&self, id: NodeId) -> bool {
        self.node(id).read_only
    }

    /// The number of nodes in the subtree at `id`, sources excluded.
    pub fn size(&self, id: NodeId) -> usize {
        self.node(id).size as usize
    }

    /// The number of nodes in the whole tree, sources excluded.
    pub fn len(&self) -> usize {
        self.size(self.root())
    }

    /// Whether the tree consists of the root node only.
    pub fn is_empty(&self) -> bool {
        self.node(self.root()).children.is_empty()
    }

    fn invalidate_hash(&self, id: NodeId) {
        let mut current = Some(id);
        while let Some(c) = current {
            let node = self.node(c);
            node.hash_cache.set(None);
            current = node.parent.map(|p| NodeId(p.get()));
        }
    }

    fn update_size(&mut self, id: NodeId, new_size: u32) {
        let delta = i64::from(new_size) - i64::from(self.node(id).size);
        self.node_mut(id).size = new_size;
        let mut current = self.parent(id);
        while let Some(p) = current {
            let node = self.node_mut(p);
            node.size = (i64::from(node.size) + delta) as u32;
            current = node.parent.map(|q| NodeId(q.get()));
        }
    }

    fn set_parent(&mut self, child: NodeId, parent: NodeId) {
        self.node_mut(child).parent = NonMaxU32::new(parent.0);
    }

    /// Append a fresh node under `parent` and return it.
    pub fn add_child(&mut self, parent: NodeId, symbol: impl Into<Symbol>) -> NodeId {
        let child = self.alloc(symbol.into());
        self.attach_child(parent, child);
        child
    }

    /// Append an existing (detached) node under `parent`.
    pub fn attach_child(&mut self, parent: NodeId, child: NodeId) {
        self.set_parent(child, parent);
        let grown = self.node(parent).size + self.node(child).size;
        self.node_mut(parent).children.push(child);
        self.update_size(parent, grown);
        self.invalidate_hash(parent);
    }

    /// Detach and return the last child of `parent`.
    pub fn remove_last_child(&mut self, parent: NodeId) -> Option<NodeId> {
        let child = self.node_mut(parent).children.pop()?;
        self.node_mut(child).parent = None;
        let shrunk = self.node(parent).size - self.node(child).size;
        self.update_size(parent, shrunk);
        self.invalidate_hash(parent);
        Some(child)
    }

    /// Replace the children of `id`. The new children must be nodes of this
    /// arena; previous children become unreachable.
    pub fn set_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        let new_size = 1 + children.iter().map(|&c| self.node(c).size).sum::<u32>();
        for &child in &children {
            self.set_parent(child, id);
        }
        self.node_mut(id).children = children;
        self.update_size(id, new_size);
        self.invalidate_hash(id);
    }

    /// Replace the symbol at `id`.
    pub fn set_symbol(&mut self, id: NodeId, symbol: impl Into<Symbol>) {
        self.node_mut(id).symbol = symbol.into();
        self.invalidate_hash(id);
    }

    /// Set the sending party tag.
    pub fn set_sender(&mut self, id: NodeId, sender: Option<&str>) {
        self.node_mut(id).sender = sender.map(SmolStr::new);
        self.invalidate_hash(id);
    }

    /// Set the receiving party tag.
    pub fn set_recipient(&mut self, id: NodeId, recipient: Option<&str>) {
        self.node_mut(id).recipient = recipient.map(SmolStr::new);
        self.invalidate_hash(id);
    }

    /// Mark only this node read-only (or writable).
    pub fn set_read_only(&mut self, id: NodeId, read_only: bool) {
        self.node_mut(id).read_only = read_only;
    }

    /// Mark the whole subtree at `id`, sources included.
    pub fn set_all_read_only(&mut self, id: NodeId, read_only: bool) {
        self.node_mut(id).read_only = read_only;
        let nested: Vec<NodeId> = self
            .node(id)
            .children
            .iter()
            .chain(self.node(id).sources.iter())
            .copied()
            .collect();
        for child in nested {
            self.set_all_read_only(child, read_only);
        }
    }

    /// Replace the sources of `id`. Sources do not count towards sizes and
    /// do not participate in structural hashes.
    pub fn set_sources(&mut self, id: NodeId, sources: Vec<NodeId>) {
        for &source in &sources {
            self.set_parent(source, id);
        }
        self.node_mut(id).sources = sources;
    }

    /// Deep-copy the subtree rooted at `src_id` in `src` into this arena and
    /// attach it under `parent`.
    pub fn graft(&mut self, parent: NodeId, src: &DerivationTree, src_id: NodeId) -> NodeId {
        let copied = self.copy_subtree(src, src_id);
        self.attach_child(parent, copied);
        copied
    }

    /// Deep-copy the subtree rooted at `src_id` in `src` into this arena and
    /// record it as a source of `owner`.
    pub fn graft_source(&mut self, owner: NodeId, src: &DerivationTree, src_id: NodeId) -> NodeId {
        let copied = self.copy_subtree(src, src_id);
        self.set_parent(copied, owner);
        self.node_mut(owner).sources.push(copied);
        copied
    }

    pub(crate) fn copy_meta_from(&mut self, id: NodeId, src: &DerivationTree, src_id: NodeId) {
        let source_node = src.node(src_id);
        let node = self.node_mut(id);
        node.sender = source_node.sender.clone();
        node.recipient = source_node.recipient.clone();
        node.read_only = source_node.read_only;
    }

    pub(crate) fn copy_subtree(&mut self, src: &DerivationTree, src_id: NodeId) -> NodeId {
        let source_node = src.node(src_id);
        let id = self.alloc(source_node.symbol.clone());
        {
            let node = self.node_mut(id);
            node.sender = source_node.sender.clone();
            node.recipient = source_node.recipient.clone();
            node.read_only = source_node.read_only;
            node.size = source_node.size;
        }
        for &child in &source_node.children {
            let copied = self.copy_subtree(src, child);
            self.set_parent(copied, id);
            self.node_mut(id).children.push(copied);
        }
        for &source in &source_node.sources {
            let copied = self.copy_subtree(src, source);
            self.set_parent(copied, id);
            self.node_mut(id).sources.push(copied);
        }
        id
    }

    /// A standalone deep copy of the subtree at `id`, parent link dropped.
    pub fn deepcopy(&self, id: NodeId) -> DerivationTree {
        let mut out = DerivationTree::empty();
        out.copy_subtree(self, id);
        out
    }

    /// The structural hash of the subtree at `id`, over
    /// `(symbol, sender, recipient, child hashes)`. Cached; any mutation
    /// through the arena invalidates the cache up the ancestor chain.
    pub fn hash(&self, id: NodeId) -> u64 {
        let node = self.node(id);
        if let Some(h) = node.hash_cache.get() {
            return h;
        }
        let mut hasher = tree_hasher();
        node.symbol.hash(&mut hasher);
        node.sender.hash(&mut hasher);
        node.recipient.hash(&mut hasher);
        for &child in &node.children {
            hasher.write_u64(self.hash(child));
        }
        let h = hasher.finish();
        node.hash_cache.set(Some(h));
        h
    }

    /// The nodes from the root down to `id`, inclusive.
    pub fn path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = self.parent(id);
        while let Some(p) = current {
            path.push(p);
            current = self.parent(p);
        }
        path.reverse();
        path
    }

    /// The subtree at `id` in pre-order, children only.
    pub fn flatten(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.size(id));
        self.flatten_into(id, &mut out);
        out
    }

    fn flatten_into(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        for &child in &self.node(id).children {
            self.flatten_into(child, out);
        }
    }

    /// All proper descendants of `id`, pre-order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut flat = self.flatten(id);
        flat.remove(0);
        flat
    }

    /// The number of terminal leaves under `id`.
    pub fn count_terminals(&self, id: NodeId) -> usize {
        if self.node(id).symbol.is_terminal() {
            return 1;
        }
        self.node(id)
            .children
            .iter()
            .map(|&c| self.count_terminals(c))
            .sum()
    }

    fn contains_terminal(&self, id: NodeId, pred: &impl Fn(&Terminal) -> bool) -> bool {
        if let Symbol::Terminal(t) = &self.node(id).symbol {
            return pred(t);
        }
        self.node(id)
            .children
            .iter()
            .any(|&c| self.contains_terminal(c, pred))
    }

    /// Whether the subtree contains any bit terminals.
    pub fn contains_bits(&self, id: NodeId) -> bool {
        self.contains_terminal(id, &|t| t.is_bit())
    }

    /// Whether the subtree contains any byte-sequence terminals.
    pub fn contains_bytes(&self, id: NodeId) -> bool {
        self.contains_terminal(id, &|t| matches!(t, Terminal::Bytes(_)))
    }

    /// Whether the subtree contains any string terminals.
    pub fn contains_strings(&self, id: NodeId) -> bool {
        self.contains_terminal(id, &|t| matches!(t, Terminal::Str(_)))
    }

    /// All subtrees under `from` (inclusive, sources included) labelled with
    /// `symbol`, innermost first.
    pub fn find_all_trees(&self, from: NodeId, symbol: &NonTerminal) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.find_all_trees_into(from, symbol, &mut out);
        out
    }

    fn find_all_trees_into(&self, id: NodeId, symbol: &NonTerminal, out: &mut Vec<NodeId>) {
        let node = self.node(id);
        for &child in node.children.iter().chain(node.sources.iter()) {
            if self.node(child).symbol.is_non_terminal() {
                self.find_all_trees_into(child, symbol, out);
            }
        }
        if node.symbol.as_non_terminal() == Some(symbol) {
            out.push(id);
        }
    }

    /// All nodes under `from` (inclusive, sources included) labelled with
    /// `symbol`, outermost first. Read-only nodes are skipped when
    /// `exclude_read_only` is set.
    pub fn find_all_nodes(
        &self,
        from: NodeId,
        symbol: &NonTerminal,
        exclude_read_only: bool,
    ) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.find_all_nodes_into(from, symbol, exclude_read_only, &mut out);
        out
    }

    fn find_all_nodes_into(
        &self,
        id: NodeId,
        symbol: &NonTerminal,
        exclude_read_only: bool,
        out: &mut Vec<NodeId>,
    ) {
        let node = self.node(id);
        if node.symbol.as_non_terminal() == Some(symbol) && !(exclude_read_only && node.read_only)
        {
            out.push(id);
        }
        for &child in node.children.iter().chain(node.sources.iter()) {
            self.find_all_nodes_into(child, symbol, exclude_read_only, out);
        }
    }

    /// The direct children and sources of `id` labelled with `symbol`.
    pub fn find_direct_trees(&self, id: NodeId, symbol: &NonTerminal) -> Vec<NodeId> {
        let node = self.node(id);
        node.children
            .iter()
            .chain(node.sources.iter())
            .copied()
            .filter(|&c| self.node(c).symbol.as_non_terminal() == Some(symbol))
            .collect()
    }

    /// All nonterminal symbols present under `id`, sources included.
    pub fn get_non_terminal_symbols(
        &self,
        id: NodeId,
        exclude_read_only: bool,
    ) -> AHashSet<NonTerminal> {
        let mut out = AHashSet::new();
        self.collect_non_terminals(id, exclude_read_only, &mut out);
        out
    }

    fn collect_non_terminals(
        &self,
        id: NodeId,
        exclude_read_only: bool,
        out: &mut AHashSet<NonTerminal>,
    ) {
        let node = self.node(id);
        if let Symbol::NonTerminal(nt) = &node.symbol {
            if !(exclude_read_only && node.read_only) {
                out.insert(nt.clone());
            }
        }
        for &child in node.children.iter().chain(node.sources.iter()) {
            self.collect_non_terminals(child, exclude_read_only, out);
        }
    }

    /// The protocol messages of this tree: subtrees annotated with a sender,
    /// outermost-first, one entry per message boundary.
    pub fn protocol_msgs(&self) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        self.collect_protocol_msgs(self.root(), &mut out);
        out
    }

    fn collect_protocol_msgs(&self, id: NodeId, out: &mut Vec<ProtocolMessage>) {
        let node = self.node(id);
        if !node.symbol.is_non_terminal() {
            return;
        }
        if let Some(sender) = &node.sender {
            out.push(ProtocolMessage {
                sender: sender.clone(),
                recipient: node.recipient.clone(),
                node: id,
            });
            return;
        }
        for &child in &node.children {
            self.collect_protocol_msgs(child, out);
        }
    }

    /// The surface of the whole tree as bytes. Bit runs are packed MSB-first;
    /// a trailing run shorter than eight bits is right-aligned in the final
    /// byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.subtree_bytes(self.root())
    }

    /// The surface of the subtree at `id` as bytes.
    pub fn subtree_bytes(&self, id: NodeId) -> Vec<u8> {
        if self.contains_bits(id) {
            let mut bits = Vec::new();
            self.collect_bits(id, &mut bits);
            return pack_bits(&bits);
        }
        let mut out = Vec::new();
        self.write_stream(id, &mut out);
        out
    }

    fn write_stream(&self, id: NodeId, out: &mut Vec<u8>) {
        match &self.node(id).symbol {
            Symbol::NonTerminal(_) => {
                for &child in &self.node(id).children {
                    self.write_stream(child, out);
                }
            }
            Symbol::Terminal(Terminal::Str(s)) => out.extend_from_slice(s.as_bytes()),
            Symbol::Terminal(Terminal::Bytes(b)) => out.extend_from_slice(b),
            // Bit leaves are handled by the bit-stream path; regex terminals
            // never appear as leaves.
            Symbol::Terminal(_) => {}
        }
    }

    /// The surface of the whole tree as a string of `0`s and `1`s.
    pub fn to_bits(&self) -> String {
        self.subtree_bits(self.root())
    }

    /// The surface of the subtree at `id` as a string of `0`s and `1`s.
    pub fn subtree_bits(&self, id: NodeId) -> String {
        let mut bits = Vec::new();
        self.collect_bits(id, &mut bits);
        bits.iter().map(|&b| if b == 0 { '0' } else { '1' }).collect()
    }

    fn collect_bits(&self, id: NodeId, out: &mut Vec<u8>) {
        match &self.node(id).symbol {
            Symbol::NonTerminal(_) => {
                for &child in &self.node(id).children {
                    self.collect_bits(child, out);
                }
            }
            Symbol::Terminal(Terminal::Bit(bit)) => out.push(*bit),
            Symbol::Terminal(_) => {
                let mut bytes = Vec::new();
                self.write_stream(id, &mut bytes);
                for byte in bytes {
                    for shift in (0..8).rev() {
                        out.push((byte >> shift) & 1);
                    }
                }
            }
        }
    }

    /// Aggregate the subtree at `id` into a single [`Value`].
    ///
    /// Strings and byte sequences concatenate (promoting to bytes on
    /// mixing); runs of bits accumulate into an integer, most significant
    /// bit first; an integer followed by a string or bytes is demoted to a
    /// byte. A childless nonterminal aggregates to `None`.
    pub fn value(&self, id: NodeId) -> Result<Option<Value>, ValueError> {
        Ok(self.value_bits(id)?.map(|(v, _)| v))
    }

    fn value_bits(&self, id: NodeId) -> Result<Option<(Value, u32)>, ValueError> {
        let node = self.node(id);
        if let Symbol::Terminal(t) = &node.symbol {
            return Ok(match t {
                Terminal::Str(s) => Some((Value::Str(s.clone()), 0)),
                Terminal::Bytes(b) => Some((Value::Bytes(b.clone()), 0)),
                Terminal::Bit(bit) => Some((Value::Int(i128::from(*bit)), 1)),
                Terminal::Regex(_) => None,
            });
        }
        let mut aggregate: Option<(Value, u32)> = None;
        for &child in &node.children {
            let Some((value, child_bits)) = self.value_bits(child)? else {
                continue;
            };
            aggregate = Some(match aggregate {
                None => (value, child_bits),
                Some((Value::Str(mut s), _)) => match value {
                    Value::Str(v) => {
                        s.push_str(&v);
                        (Value::Str(s), 0)
                    }
                    Value::Bytes(v) => {
                        let mut bytes = s.into_bytes();
                        bytes.extend_from_slice(&v);
                        (Value::Bytes(bytes), 0)
                    }
                    Value::Int(i) => {
                        let c = u32::try_from(i)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or(ValueError::OutOfRange(i))?;
                        s.push(c);
                        (Value::Str(s), 0)
                    }
                },
                Some((Value::Bytes(mut b), _)) => match value {
                    Value::Str(v) => {
                        b.extend_from_slice(v.as_bytes());
                        (Value::Bytes(b), 0)
                    }
                    Value::Bytes(v) => {
                        b.extend_from_slice(&v);
                        (Value::Bytes(b), 0)
                    }
                    Value::Int(i) => {
                        b.push(u8::try_from(i).map_err(|_| ValueError::OutOfRange(i))?);
                        (Value::Bytes(b), 0)
                    }
                },
                Some((Value::Int(i), bits)) => match value {
                    Value::Str(v) => {
                        let mut bytes =
                            vec![u8::try_from(i).map_err(|_| ValueError::OutOfRange(i))?];
                        bytes.extend_from_slice(v.as_bytes());
                        (Value::Bytes(bytes), 0)
                    }
                    Value::Bytes(v) => {
                        let mut bytes =
                            vec![u8::try_from(i).map_err(|_| ValueError::OutOfRange(i))?];
                        bytes.extend_from_slice(&v);
                        (Value::Bytes(bytes), 0)
                    }
                    Value::Int(j) => {
                        if bits + child_bits > 126 {
                            return Err(ValueError::TooWide);
                        }
                        (Value::Int((i << child_bits) + j), bits + child_bits)
                    }
                },
            });
        }
        Ok(aggregate)
    }

    /// Pretty-print the tree for visualization.
    pub fn to_tree(&self) -> String {
        self.format_tree(self.root(), 0, 0)
    }

    fn format_tree(&self, id: NodeId, indent: usize, start_indent: usize) -> String {
        let node = self.node(id);
        let mut s = format!("{}Tree({}", "  ".repeat(start_indent), node.symbol);
        if node.children.len() == 1 && node.sources.is_empty() {
            s += ", ";
            s += &self.format_tree(node.children[0], indent, 0);
        } else {
            let mut has_children = false;
            for &child in &node.children {
                s += ",\n";
                s += &self.format_tree(child, indent + 1, indent + 1);
                has_children = true;
            }
            if !node.sources.is_empty() {
                s += ",\n";
                s += &"  ".repeat(indent + 1);
                s += "sources=[\n";
                for &source in &node.sources {
                    s += &self.format_tree(source, indent + 2, indent + 2);
                    s += ",\n";
                    has_children = true;
                }
                s += &"  ".repeat(indent + 1);
                s += "]";
            }
            if has_children {
                s += "\n";
                s += &"  ".repeat(indent);
            }
        }
        s += ")";
        s
    }

    /// Dump the tree as a specialized grammar, one rule per nonterminal
    /// node, annotated with byte/bit positions and aggregate values.
    pub fn to_grammar(&self) -> String {
        self.to_grammar_with(true, true)
    }

    /// [`DerivationTree::to_grammar`] with position and value annotations
    /// individually toggled.
    pub fn to_grammar_with(&self, include_position: bool, include_value: bool) -> String {
        self.grammar_line(self.root(), 0, 0, -1, 0, include_position, include_value)
            .0
    }

    #[allow(clippy::too_many_arguments)]
    fn grammar_line(
        &self,
        id: NodeId,
        indent: usize,
        start_indent: usize,
        mut bit_count: i32,
        mut byte_count: usize,
        include_position: bool,
        include_value: bool,
    ) -> (String, i32, usize) {
        let node = self.node(id);
        let mut s = format!("{}{} ::=", "  ".repeat(start_indent), node.symbol);
        let mut terminal_symbols = 0;
        let position = format!("  # Position {:#06x} ({})", byte_count, byte_count);
        let mut max_bit_count = bit_count - 1;

        for &child in &node.children {
            let child_node = self.node(child);
            match &child_node.symbol {
                Symbol::NonTerminal(nt) => {
                    s += " ";
                    s += nt.name();
                }
                Symbol::Terminal(t) => {
                    s += &format!(" {}", t);
                    terminal_symbols += 1;
                    if t.is_bit() {
                        if bit_count <= 0 {
                            bit_count = 7;
                            max_bit_count = 7;
                        } else {
                            bit_count -= 1;
                            if bit_count == 0 {
                                byte_count += 1;
                            }
                        }
                    } else {
                        byte_count += t.literal_len();
                        bit_count = -1;
                    }
                }
            }
        }

        if !node.sources.is_empty() {
            let params: Vec<&str> = node
                .sources
                .iter()
                .filter_map(|&p| self.node(p).symbol.as_non_terminal())
                .map(NonTerminal::name)
                .collect();
            s += &format!(" := f({})", params.join(", "));
        }

        let mut have_position = false;
        if include_position && terminal_symbols > 0 {
            have_position = true;
            s += &position;
            if bit_count >= 0 {
                if max_bit_count != bit_count {
                    s += &format!(", bits {}-{}", max_bit_count, bit_count);
                } else {
                    s += &format!(", bit {}", bit_count);
                }
            }
        }

        if include_value && node.children.len() >= 2 {
            s += if have_position { "; " } else { "  # " };
            s += &self.to_value(id);
        }

        for &child in &node.children {
            if self.node(child).symbol.is_non_terminal() {
                let (child_str, new_bit_count, new_byte_count) = self.grammar_line(
                    child,
                    indent + 1,
                    indent + 1,
                    bit_count,
                    byte_count,
                    include_position,
                    include_value,
                );
                bit_count = new_bit_count;
                byte_count = new_byte_count;
                s += "\n";
                s += &child_str;
            }
            for &source in &self.node(child).sources.clone() {
                let (child_str, _, _) = self.grammar_line(
                    source,
                    indent + 2,
                    indent + 1,
                    -1,
                    0,
                    include_position,
                    include_value,
                );
                s += "\n  ";
                s += &child_str;
            }
        }

        (s, bit_count, byte_count)
    }

    fn to_value(&self, id: NodeId) -> String {
        match self.value(id) {
            Ok(Some(Value::Int(i))) => format!("0b{:b} ({})", i, i),
            Ok(Some(Value::Str(s))) => format!("{:?}", s),
            Ok(Some(Value::Bytes(b))) => format!("{}", Terminal::Bytes(b)),
            _ => String::from("<no value>"),
        }
    }

    /// Replace the subtree `old` with `replacement`, returning the new tree.
    /// Read-only targets are skipped silently.
    pub fn replace(
        &self,
        grammar: &mut Grammar,
        old: NodeId,
        replacement: &DerivationTree,
    ) -> Result<DerivationTree, FuzzError> {
        self.replace_multiple(grammar, &[(old, replacement)])
    }

    /// Replace several subtrees at once, returning the new tree. Read-only
    /// targets are skipped silently. Where replacements touch the inputs or
    /// outputs of generator-produced subtrees, the affected children and
    /// sources are re-derived through the grammar's generators.
    pub fn replace_multiple(
        &self,
        grammar: &mut Grammar,
        replacements: &[(NodeId, &DerivationTree)],
    ) -> Result<DerivationTree, FuzzError> {
        let by_id: AHashMap<NodeId, &DerivationTree> = replacements.iter().copied().collect();
        let mut out = DerivationTree::empty();
        self.replace_rec(grammar, self.root(), &by_id, &mut out)?;
        Ok(out)
    }

    fn replace_rec(
        &self,
        grammar: &mut Grammar,
        id: NodeId,
        replacements: &AHashMap<NodeId, &DerivationTree>,
        out: &mut DerivationTree,
    ) -> Result<NodeId, FuzzError> {
        if let Some(replacement) = replacements.get(&id) {
            if !self.read_only(id) {
                let new_id = out.copy_subtree(replacement, replacement.root());
                grammar.populate_sources_at(out, new_id)?;
                return Ok(new_id);
            }
        }

        let node = self.node(id);
        let new_id = out.alloc(node.symbol.clone());
        {
            let new_node = out.node_mut(new_id);
            new_node.sender = node.sender.clone();
            new_node.recipient = node.recipient.clone();
            new_node.read_only = node.read_only;
        }

        let mut regen_children = false;
        let mut regen_sources = false;
        for &source in &node.sources {
            let new_source = self.replace_rec(grammar, source, replacements, out)?;
            if DerivationTree::hash(out, new_source) != self.hash(source) {
                regen_children = true;
            }
            out.set_parent(new_source, new_id);
            out.node_mut(new_id).sources.push(new_source);
        }
        let mut new_size = 1u32;
        for &child in &node.children {
            let new_child = self.replace_rec(grammar, child, replacements, out)?;
            if DerivationTree::hash(out, new_child) != self.hash(child) {
                regen_sources = true;
            }
            out.set_parent(new_child, new_id);
            new_size += out.node(new_child).size;
            out.node_mut(new_id).children.push(new_child);
        }
        out.node_mut(new_id).size = new_size;

        let Some(symbol) = node.symbol.as_non_terminal() else {
            return Ok(new_id);
        };
        if !grammar.has_generator(symbol) {
            out.node_mut(new_id).sources.clear();
            return Ok(new_id);
        }

        if regen_children {
            // A tree nested inside another generator's output does not carry
            // its own sources.
            if self.inside_generator_output(grammar, id) {
                out.node_mut(new_id).sources.clear();
            } else {
                grammar.derive_generator_output_at(out, new_id)?;
            }
        } else if regen_sources {
            let sources = grammar.derive_sources_at(out, new_id)?;
            out.node_mut(new_id).sources.clear();
            for source in sources {
                out.graft_source(new_id, &source, source.root());
            }
        }
        Ok(new_id)
    }

    fn inside_generator_output(&self, grammar: &Grammar, id: NodeId) -> bool {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if self.node(parent).sources.contains(&current) {
                return false;
            }
            if self.node(parent).children.contains(&current)
                && grammar.is_use_generator(self, parent)
            {
                return true;
            }
            current = parent;
        }
        false
    }
}

impl PartialEq for DerivationTree {
    fn eq(&self, other: &Self) -> bool {
        self.hash(self.root()) == other.hash(other.root())
    }
}

impl Eq for DerivationTree {}

impl Hash for DerivationTree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(DerivationTree::hash(self, self.root()));
    }
}

impl fmt::Display for DerivationTree {
    /// The surface of the tree: strings as-is, bytes decoded byte-per-char,
    /// bit runs converted to their byte representation first.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value(self.root()) {
            Ok(Some(Value::Str(s))) => write!(f, "{}", s),
            Ok(Some(Value::Bytes(b))) => write!(f, "{}", latin1_decode(&b)),
            Ok(Some(Value::Int(i))) => {
                let mut bytes = Vec::new();
                let mut v = i.max(0) as u128;
                loop {
                    bytes.push((v & 0xFF) as u8);
                    v >>= 8;
                    if v == 0 {
                        break;
                    }
                }
                bytes.reverse();
                write!(f, "{}", latin1_decode(&bytes))
            }
            _ => write!(f, "{}", latin1_decode(&self.to_bytes())),
        }
    }
}
