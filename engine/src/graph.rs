//! The declared nested object graph.
//!
//! A channel declares a tree of instance types rooted at the anchor type.
//! Every node belongs to exactly one parent edge; cross-links between
//! unrelated branches are expressed only through foreign-key scalars on the
//! flat document, never as a second parent edge. The snapshot loader walks
//! this tree in declaration order to build the initial state; the delta
//! writer and subscription router use the per-type index to resolve which
//! anchor(s) an arbitrary incoming object belongs to.

use crate::error::{Error, Result};
use crate::InstanceType;
use std::collections::HashMap;

/// One node in the declared graph: an instance type, the field on its
/// children that points back to it (the foreign key), and the field on this
/// node itself that resolves up to the anchor id (empty for the anchor node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub instance_type: InstanceType,
    pub children: Vec<GraphEdge>,
}

/// An edge from a parent node to a child node, named by the foreign-key
/// field children carry (e.g. `"room_id"` linking `Message` back to `Room`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub foreign_key: String,
    pub child: GraphNode,
}

impl GraphNode {
    pub fn leaf(instance_type: impl Into<InstanceType>) -> Self {
        Self {
            instance_type: instance_type.into(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, foreign_key: impl Into<String>, child: GraphNode) -> Self {
        self.children.push(GraphEdge {
            foreign_key: foreign_key.into(),
            child,
        });
        self
    }
}

/// A channel's full declared graph, rooted at the anchor's own instance
/// type, plus the type -> node index used for O(1) alias resolution.
#[derive(Debug, Clone)]
pub struct SchemaGraph {
    root: GraphNode,
    index: HashMap<InstanceType, Vec<InstanceType>>, // type -> path of foreign keys not needed here; index tracks known types only
}

impl SchemaGraph {
    pub fn new(root: GraphNode) -> Result<Self> {
        let mut seen = HashMap::new();
        Self::index_node(&root, &mut seen)?;
        Ok(Self { root, index: seen })
    }

    fn index_node(
        node: &GraphNode,
        seen: &mut HashMap<InstanceType, Vec<InstanceType>>,
    ) -> Result<()> {
        if seen.contains_key(&node.instance_type) {
            return Err(Error::GraphCycle(node.instance_type.clone()));
        }
        seen.insert(node.instance_type.clone(), Vec::new());
        for edge in &node.children {
            Self::index_node(&edge.child, seen)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &GraphNode {
        &self.root
    }

    pub fn contains_type(&self, instance_type: &str) -> bool {
        self.index.contains_key(instance_type)
    }

    pub fn node_for(&self, instance_type: &str) -> Option<&GraphNode> {
        fn find<'a>(node: &'a GraphNode, target: &str) -> Option<&'a GraphNode> {
            if node.instance_type == target {
                return Some(node);
            }
            for edge in &node.children {
                if let Some(found) = find(&edge.child, target) {
                    return Some(found);
                }
            }
            None
        }
        find(&self.root, instance_type)
    }

    /// Every node in the graph, parent before children, depth-first — the
    /// order the snapshot loader's cold-start build walks the tree in.
    pub fn nodes_in_declaration_order(&self) -> Vec<&GraphNode> {
        let mut out = Vec::new();
        fn walk<'a>(node: &'a GraphNode, out: &mut Vec<&'a GraphNode>) {
            out.push(node);
            for edge in &node.children {
                walk(&edge.child, out);
            }
        }
        walk(&self.root, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> SchemaGraph {
        let message = GraphNode::leaf("Message");
        let participant = GraphNode::leaf("Participant");
        let room = GraphNode::leaf("Room")
            .with_child("room_id", message)
            .with_child("room_id", participant);
        SchemaGraph::new(room).unwrap()
    }

    #[test]
    fn declaration_order_is_parent_before_children() {
        let graph = sample_graph();
        let order: Vec<_> = graph
            .nodes_in_declaration_order()
            .into_iter()
            .map(|n| n.instance_type.as_str())
            .collect();
        assert_eq!(order, vec!["Room", "Message", "Participant"]);
    }

    #[test]
    fn node_lookup_by_type() {
        let graph = sample_graph();
        assert!(graph.node_for("Message").is_some());
        assert!(graph.node_for("Nonexistent").is_none());
        assert!(graph.contains_type("Participant"));
    }

    #[test]
    fn duplicate_instance_type_is_a_cycle_error() {
        let dup = GraphNode::leaf("Room").with_child("room_id", GraphNode::leaf("Room"));
        let err = SchemaGraph::new(dup).unwrap_err();
        assert_eq!(err, Error::GraphCycle("Room".into()));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        /// Build a tree of distinct instance-type names, `depth` levels of a
        /// root-plus-up-to-3-children shape, so every generated graph is
        /// guaranteed acyclic by construction.
        fn arb_graph(max_children: usize) -> impl Strategy<Value = (GraphNode, usize)> {
            (1usize..=8, 0usize..max_children.max(1)).prop_map(|(leaf_count, fan_out)| {
                let mut leaves: Vec<GraphNode> = (0..leaf_count)
                    .map(|i| GraphNode::leaf(format!("Type{i}")))
                    .collect();
                let mut root = leaves.remove(0);
                for (i, leaf) in leaves.into_iter().enumerate() {
                    if i < fan_out.max(leaf_count) {
                        root = root.with_child(format!("fk{i}"), leaf);
                    }
                }
                let total = root.children.len() + 1;
                (root, total)
            })
        }

        proptest! {
            /// Every node the tree was built with shows up exactly once in
            /// declaration order, and `node_for` can find each of them.
            #[test]
            fn every_declared_type_is_reachable((root, total) in arb_graph(8)) {
                let graph = SchemaGraph::new(root).unwrap();
                let order = graph.nodes_in_declaration_order();
                prop_assert_eq!(order.len(), total);

                for node in &order {
                    prop_assert!(graph.node_for(&node.instance_type).is_some());
                    prop_assert!(graph.contains_type(&node.instance_type));
                }
            }

            /// The root is always first in declaration order, matching how
            /// the snapshot loader's cold-path builder walks the graph.
            #[test]
            fn root_is_first_in_declaration_order((root, _total) in arb_graph(8)) {
                let root_type = root.instance_type.clone();
                let graph = SchemaGraph::new(root).unwrap();
                let order = graph.nodes_in_declaration_order();
                prop_assert_eq!(&order[0].instance_type, &root_type);
            }
        }
    }
}
