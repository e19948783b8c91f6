//! The inspection forest: a mutable, ordered tree of analyzed nodes.
//!
//! Realized as an arena (a flat `Vec<Node>` addressed by [`NodeId`]) rather
//! than an owning-pointer tree, per the "no owning pointers, no cycles"
//! guidance for this component: nodes never move once allocated, so a
//! `NodeId` stays valid for the life of the forest, and nothing here needs
//! `Rc`/`RefCell` to let the analyzer hold onto a node while mutating
//! siblings elsewhere in the tree.

use crate::expr::{Program, Value};
use crate::position::Position;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub is_atom: bool,
    pub is_const: bool,
    pub is_skip: bool,
    pub is_slot: bool,
    pub is_struct: bool,
    pub is_array_root: bool,
    pub is_array_element: bool,
}

/// Source-order discovered legal values for an enumerated atom. Values are
/// expression results, i.e. `f64`; kept as bit patterns in a `BTreeSet` so the
/// set is both hashable-by-value and iterates in a stable (numeric) order for
/// diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet(BTreeSet<u64>);

impl OptionSet {
    pub fn insert(&mut self, value: f64) {
        self.0.insert(value.to_bits());
    }

    pub fn contains(&self, value: f64) -> bool {
        self.0.contains(&value.to_bits())
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.0.iter().map(|bits| f64::from_bits(*bits))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,

    pub flags: NodeFlags,
    pub name: String,
    pub summary: Option<String>,
    pub struct_name: Option<String>,

    pub start_offset: Position,
    pub end_offset: Position,

    /// Array element count (array root) or element position (array element).
    pub cardinal: u64,
    pub shuffle: bool,

    pub bit_count: u32,
    pub location: Position,
    pub base_type: Option<crate::value::AtomBaseType>,
    pub big_endian: bool,

    pub use_count: u64,

    pub expression: Option<Program>,
    pub evaluated: bool,
    pub evaluated_value: Option<Value>,

    pub option_set: Option<OptionSet>,
}

impl Node {
    fn leaf(name: impl Into<String>) -> Self {
        Node {
            parent: None,
            children: Vec::new(),
            flags: NodeFlags::default(),
            name: name.into(),
            summary: None,
            struct_name: None,
            start_offset: Position::default(),
            end_offset: Position::default(),
            cardinal: 0,
            shuffle: false,
            bit_count: 0,
            location: Position::default(),
            base_type: None,
            big_endian: true,
            use_count: 0,
            expression: None,
            evaluated: false,
            evaluated_value: None,
            option_set: None,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_array_index_holder(&self) -> bool {
        self.flags.is_array_element
    }
}

/// An arena of [`Node`]s, append-only except for `detach`, which the
/// analyzer's EOF handling uses to excise an offending node without
/// invalidating the `NodeId`s other code may still hold.
#[derive(Debug, Default)]
pub struct Forest {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl Forest {
    pub fn new() -> Self {
        Forest::default()
    }

    /// Creates the synthetic `main` root node (see `analyze_binary` in the
    /// analyzer). Panics if called twice on the same forest.
    pub fn set_root(&mut self, name: impl Into<String>, struct_name: impl Into<String>) -> NodeId {
        assert!(self.root.is_none(), "forest root already created");
        let mut node = Node::leaf(name);
        node.flags.is_struct = true;
        node.struct_name = Some(struct_name.into());
        let id = self.push(node);
        self.root = Some(id);
        id
    }

    pub fn root(&self) -> NodeId {
        self.root.expect("forest root not created yet")
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn insert_child(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        let mut node = Node::leaf(name);
        node.parent = Some(parent);
        let id = self.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Detaches `id` from its parent's child list. The node stays resident in
    /// the arena (so `NodeId`s elsewhere don't dangle) but is no longer
    /// reachable from any traversal rooted at the forest root.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent {
            self.nodes[parent.0].children.retain(|&c| c != id);
        }
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// First-time sets `start_offset`; always refreshes `end_offset`. Called
    /// by the analyzer after every field is parsed under `parent`.
    pub fn extend_span(&mut self, parent: NodeId, start: Position, end: Position) {
        let node = &mut self.nodes[parent.0];
        if node.start_offset == Position::default() && node.end_offset == Position::default() {
            node.start_offset = start;
        }
        node.end_offset = end;
    }

    pub fn preorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.preorder_into(root, &mut out);
        out
    }

    fn preorder_into(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        for &child in self.children(id) {
            self.preorder_into(child, out);
        }
    }

    /// Each node visited twice: `(id, depth, is_leading_edge)`. Needed for
    /// pretty-printers (out of scope here) and for scans that need to know
    /// when a subtree has closed.
    pub fn full_order(&self, root: NodeId) -> Vec<(NodeId, usize, bool)> {
        let mut out = Vec::new();
        self.full_order_into(root, 0, &mut out);
        out
    }

    fn full_order_into(&self, id: NodeId, depth: usize, out: &mut Vec<(NodeId, usize, bool)>) {
        out.push((id, depth, true));
        for &child in self.children(id) {
            self.full_order_into(child, depth + 1, out);
        }
        out.push((id, depth, false));
    }

    /// Walks from `id` to the root, rendering `.name` for named nodes and
    /// `[cardinal]` for array elements (no separator before `[`).
    pub fn build_path(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = &self.nodes[n.0];
            segments.push((node.name.clone(), node.flags.is_array_element, node.cardinal));
            cur = node.parent;
        }
        segments.reverse();

        let mut path = String::new();
        for (i, (name, is_element, index)) in segments.iter().enumerate() {
            if *is_element {
                path.push_str(&format!("[{}]", index));
            } else {
                if i > 0 {
                    path.push('.');
                }
                path.push_str(name);
            }
        }
        path
    }

    /// Array-element nodes carry no type information of their own; they
    /// delegate these properties to the array-root parent (invariant 6).
    pub fn effective_bit_count(&self, id: NodeId) -> u32 {
        let node = &self.nodes[id.0];
        if node.flags.is_array_element {
            node.parent.map(|p| self.effective_bit_count(p)).unwrap_or(node.bit_count)
        } else {
            node.bit_count
        }
    }

    pub fn effective_base_type(&self, id: NodeId) -> Option<crate::value::AtomBaseType> {
        let node = &self.nodes[id.0];
        if node.flags.is_array_element {
            node.parent.and_then(|p| self.effective_base_type(p))
        } else {
            node.base_type
        }
    }

    pub fn effective_big_endian(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.0];
        if node.flags.is_array_element {
            node.parent.map(|p| self.effective_big_endian(p)).unwrap_or(node.big_endian)
        } else {
            node.big_endian
        }
    }

    pub fn effective_struct_name(&self, id: NodeId) -> Option<String> {
        let node = &self.nodes[id.0];
        if node.flags.is_array_element {
            node.parent.and_then(|p| self.effective_struct_name(p))
        } else {
            node.struct_name.clone()
        }
    }

    /// Array-root nodes carry no location/index of their own; they delegate
    /// to their first child, mirroring the original's `node_value` dispatch
    /// (as opposed to `node_property`, the inverse direction above).
    pub fn effective_location(&self, id: NodeId) -> Position {
        let node = &self.nodes[id.0];
        if node.flags.is_array_root {
            node.children.first().map(|&c| self.effective_location(c)).unwrap_or(node.location)
        } else {
            node.location
        }
    }

    pub fn effective_index(&self, id: NodeId) -> u64 {
        let node = &self.nodes[id.0];
        if node.flags.is_array_root {
            node.children.first().map(|&c| self.effective_index(c)).unwrap_or(0)
        } else {
            node.cardinal
        }
    }
}

impl std::ops::Index<NodeId> for Forest {
    type Output = Node;
    fn index(&self, id: NodeId) -> &Node {
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preorder_visits_parent_before_children() {
        let mut f = Forest::new();
        let root = f.set_root("main", "main");
        let a = f.insert_child(root, "a");
        let _b = f.insert_child(a, "b");
        let order = f.preorder(root);
        assert_eq!(order, vec![root, a, _b]);
    }

    #[test]
    fn full_order_visits_each_node_twice() {
        let mut f = Forest::new();
        let root = f.set_root("main", "main");
        let _a = f.insert_child(root, "a");
        let order = f.full_order(root);
        assert_eq!(order.len(), 4);
        assert!(order[0].2 && !order.last().unwrap().2);
    }

    #[test]
    fn build_path_omits_dot_before_bracket() {
        let mut f = Forest::new();
        let root = f.set_root("main", "main");
        let arr = f.insert_child(root, "data");
        f.get_mut(arr).flags.is_array_root = true;
        let elem = f.insert_child(arr, "data");
        f.get_mut(elem).flags.is_array_element = true;
        f.get_mut(elem).cardinal = 2;
        assert_eq!(f.build_path(elem), "main.data[2]");
    }

    #[test]
    fn detach_removes_node_from_traversal_but_keeps_id_valid() {
        let mut f = Forest::new();
        let root = f.set_root("main", "main");
        let a = f.insert_child(root, "a");
        f.detach(a);
        assert_eq!(f.preorder(root), vec![root]);
        assert_eq!(f.get(a).name, "a");
    }

    #[test]
    fn array_element_delegates_properties_to_root() {
        let mut f = Forest::new();
        let root = f.set_root("main", "main");
        let arr = f.insert_child(root, "data");
        f.get_mut(arr).flags.is_array_root = true;
        f.get_mut(arr).bit_count = 8;
        f.get_mut(arr).big_endian = true;
        let elem = f.insert_child(arr, "data");
        f.get_mut(elem).flags.is_array_element = true;
        assert_eq!(f.effective_bit_count(elem), 8);
        assert!(f.effective_big_endian(elem));
    }

    #[test]
    fn array_root_delegates_location_to_first_child() {
        let mut f = Forest::new();
        let root = f.set_root("main", "main");
        let arr = f.insert_child(root, "data");
        f.get_mut(arr).flags.is_array_root = true;
        let elem = f.insert_child(arr, "data");
        f.get_mut(elem).location = Position::new(5, 0);
        assert_eq!(f.effective_location(arr), Position::new(5, 0));
    }

    #[test]
    fn extend_span_sets_start_once_and_end_repeatedly() {
        let mut f = Forest::new();
        let root = f.set_root("main", "main");
        f.extend_span(root, Position::new(0, 0), Position::new(1, 0));
        f.extend_span(root, Position::new(5, 0), Position::new(2, 0));
        assert_eq!(f.get(root).start_offset, Position::new(0, 0));
        assert_eq!(f.get(root).end_offset, Position::new(2, 0));
    }
}
