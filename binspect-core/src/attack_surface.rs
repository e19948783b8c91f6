//! Attack-surface builder (`spec.md` §4.G).
//!
//! A preorder scan of a finished [`Forest`] that picks out the two kinds of
//! node the fuzzer can act on: atoms that were actually read during analysis
//! (`atom_usage`) and shuffleable arrays (`array_shuffle`). Each entry carries
//! a *copy* of the node rather than just its [`NodeId`], so the fuzzer can run
//! against a stable snapshot even though nothing mutates the forest again
//! after analysis finishes.

use crate::forest::{Forest, Node, NodeId};

#[derive(Debug, Clone)]
pub struct AtomUsage {
    pub path: String,
    pub node_id: NodeId,
    pub node: Node,
    pub use_count: u64,
}

#[derive(Debug, Clone)]
pub struct ArrayShuffle {
    pub path: String,
    pub node_id: NodeId,
    pub node: Node,
}

/// The fuzzer's view of a finished analysis: every atom worth mutating and
/// every array worth shuffling, both sorted by path for determinism.
#[derive(Debug, Clone, Default)]
pub struct AttackSurface {
    pub atom_usage: Vec<AtomUsage>,
    pub array_shuffle: Vec<ArrayShuffle>,
}

impl AttackSurface {
    pub fn build(forest: &Forest) -> Self {
        let mut atom_usage = Vec::new();
        let mut array_shuffle = Vec::new();

        for id in forest.preorder(forest.root()) {
            let node = forest.get(id);
            if node.flags.is_atom && node.use_count > 0 && node.bit_count > 0 {
                atom_usage.push(AtomUsage {
                    path: forest.build_path(id),
                    node_id: id,
                    node: node.clone(),
                    use_count: node.use_count,
                });
            }
            if node.flags.is_array_root && node.cardinal > 0 && node.shuffle {
                array_shuffle.push(ArrayShuffle {
                    path: forest.build_path(id),
                    node_id: id,
                    node: node.clone(),
                });
            }
        }

        atom_usage.sort_by(|a, b| a.path.cmp(&b.path));
        array_shuffle.sort_by(|a, b| a.path.cmp(&b.path));

        AttackSurface {
            atom_usage,
            array_shuffle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    #[test]
    fn collects_used_atoms_sorted_by_path() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let b = forest.insert_child(root, "b");
        {
            let node = forest.get_mut(b);
            node.flags.is_atom = true;
            node.bit_count = 8;
            node.use_count = 2;
        }
        let a = forest.insert_child(root, "a");
        {
            let node = forest.get_mut(a);
            node.flags.is_atom = true;
            node.bit_count = 8;
            node.use_count = 1;
        }

        let surface = AttackSurface::build(&forest);
        assert_eq!(surface.atom_usage.len(), 2);
        assert_eq!(surface.atom_usage[0].path, "main.a");
        assert_eq!(surface.atom_usage[1].path, "main.b");
    }

    #[test]
    fn ignores_atoms_never_read() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let a = forest.insert_child(root, "a");
        forest.get_mut(a).flags.is_atom = true;
        forest.get_mut(a).bit_count = 8;

        let surface = AttackSurface::build(&forest);
        assert!(surface.atom_usage.is_empty());
    }

    #[test]
    fn collects_shuffleable_arrays_only() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let arr = forest.insert_child(root, "data");
        {
            let node = forest.get_mut(arr);
            node.flags.is_array_root = true;
            node.cardinal = 3;
            node.shuffle = true;
            node.start_offset = Position::from_bytes(0);
            node.end_offset = Position::from_bytes(2);
        }
        let not_shuffled = forest.insert_child(root, "other");
        {
            let node = forest.get_mut(not_shuffled);
            node.flags.is_array_root = true;
            node.cardinal = 2;
            node.shuffle = false;
        }

        let surface = AttackSurface::build(&forest);
        assert_eq!(surface.array_shuffle.len(), 1);
        assert_eq!(surface.array_shuffle[0].path, "main.data");
    }
}
