//! Token tree storage and prefix reconstruction.

use super::node::{NodeId, TokenNode};
use crate::error::{ArborError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Serialized form of a subtree, as delivered to the progress sink.
///
/// Children appear in insertion order, which is stable for a given tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    /// Wire form of the node id (`"root"` for the root).
    pub id: String,
    /// Vocabulary index, `-1` for the root.
    pub token_id: i32,
    /// Decoded surface text.
    pub text: String,
    /// Sampling probability at creation time.
    pub prob: f32,
    /// Branch score.
    pub score: f32,
    /// Child subtrees.
    pub children: Vec<TreeSnapshot>,
}

/// A tree of generated tokens rooted at a prompt.
///
/// The tree owns every node in an arena; handles ([`NodeId`]) are the only
/// references held outside, so parent back-links can never keep a node
/// alive. All mutation goes through the tree's lock, making child insertion
/// safe from concurrently running exploration and generation tasks.
#[derive(Debug)]
pub struct TokenTree {
    /// All nodes, root included.
    nodes: RwLock<HashMap<NodeId, TokenNode>>,
    /// Token ids of the templated prompt; the prefix of every path.
    prompt_ids: Vec<u32>,
    /// Counter for handing out node ids, unique within this tree.
    next_id: AtomicU64,
}

impl TokenTree {
    /// Create a tree whose root holds `prompt` and whose token prefix starts
    /// from `prompt_ids` (the chat-templated, encoded prompt).
    pub fn new(prompt: impl Into<String>, prompt_ids: Vec<u32>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, TokenNode::root(prompt));
        Self {
            nodes: RwLock::new(nodes),
            prompt_ids,
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Token ids of the templated prompt.
    pub fn prompt_ids(&self) -> &[u32] {
        &self.prompt_ids
    }

    /// Clone of a node, if it exists.
    pub fn get(&self, id: NodeId) -> Option<TokenNode> {
        self.nodes.read().get(&id).cloned()
    }

    /// Clone of a node, or [`ArborError::UnknownNode`].
    pub fn try_get(&self, id: NodeId) -> Result<TokenNode> {
        self.get(id).ok_or_else(|| ArborError::UnknownNode(id.to_string()))
    }

    /// Whether the tree contains `id`.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    /// Number of nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Child handles of `id` in insertion order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .read()
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Whether `id` has any children.
    pub fn has_children(&self, id: NodeId) -> bool {
        self.nodes
            .read()
            .get(&id)
            .map(|n| !n.children.is_empty())
            .unwrap_or(false)
    }

    /// Child of `parent` whose decoded text equals `text`.
    pub fn child_by_text(&self, parent: NodeId, text: &str) -> Option<NodeId> {
        let nodes = self.nodes.read();
        let node = nodes.get(&parent)?;
        node.children
            .iter()
            .copied()
            .find(|c| nodes.get(c).map(|n| n.text == text).unwrap_or(false))
    }

    /// Child of `id` with the maximum probability; first wins on ties.
    pub fn greedy_child(&self, id: NodeId) -> Option<NodeId> {
        let nodes = self.nodes.read();
        let node = nodes.get(&id)?;
        let mut best: Option<(NodeId, f32)> = None;
        for child in &node.children {
            if let Some(n) = nodes.get(child) {
                match best {
                    Some((_, p)) if n.prob <= p => {}
                    _ => best = Some((*child, n.prob)),
                }
            }
        }
        best.map(|(c, _)| c)
    }

    /// Insert a child under `parent`.
    ///
    /// Children are keyed by decoded text: two token ids that decode to the
    /// same text collide here, and the newer child replaces the older one
    /// together with its subtree.
    pub fn add_child(&self, parent: NodeId, token_id: u32, text: &str, prob: f32) -> Result<NodeId> {
        let mut nodes = self.nodes.write();
        let parent_node = nodes
            .get(&parent)
            .ok_or_else(|| ArborError::UnknownNode(parent.to_string()))?;
        let id = self.alloc_id();
        let child = TokenNode::child(id, token_id, text, prob, parent_node);

        let displaced = parent_node
            .children
            .iter()
            .position(|c| nodes.get(c).map(|n| n.text == text).unwrap_or(false));

        match displaced {
            Some(pos) => {
                let old = nodes
                    .get_mut(&parent)
                    .map(|p| std::mem::replace(&mut p.children[pos], id));
                if let Some(old) = old {
                    remove_subtree(&mut nodes, old);
                }
            }
            None => {
                if let Some(p) = nodes.get_mut(&parent) {
                    p.children.push(id);
                }
            }
        }
        nodes.insert(id, child);
        Ok(id)
    }

    /// Reuse the text-keyed child of `parent` if one exists, otherwise insert
    /// a new one. This is the memoization path shared by SMC particles.
    pub fn child_or_insert(
        &self,
        parent: NodeId,
        token_id: u32,
        text: &str,
        prob: f32,
    ) -> Result<NodeId> {
        if let Some(existing) = self.child_by_text(parent, text) {
            return Ok(existing);
        }
        self.add_child(parent, token_id, text, prob)
    }

    /// Token ids from the templated prompt through `id`.
    pub fn prefix_ids(&self, id: NodeId) -> Result<Vec<u32>> {
        let nodes = self.nodes.read();
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let node = nodes
                .get(&c)
                .ok_or_else(|| ArborError::UnknownNode(c.to_string()))?;
            if !node.id.is_root() {
                path.push(node.token_id as u32);
            }
            current = node.parent;
        }
        path.reverse();
        let mut ids = self.prompt_ids.clone();
        ids.extend(path);
        Ok(ids)
    }

    /// Handles of every node in the subtree under `from`, pre-order.
    pub fn all_nodes(&self, from: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes.read();
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if let Some(n) = nodes.get(&id) {
                out.push(id);
                stack.extend(n.children.iter().rev().copied());
            }
        }
        out
    }

    /// Leaf handles (nodes without children) in the subtree under `from`.
    pub fn leaves(&self, from: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes.read();
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if let Some(n) = nodes.get(&id) {
                if n.children.is_empty() {
                    out.push(id);
                } else {
                    stack.extend(n.children.iter().rev().copied());
                }
            }
        }
        out
    }

    /// Path from the root down to `id`, root first.
    pub fn path_to_root(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let nodes = self.nodes.read();
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let node = nodes
                .get(&c)
                .ok_or_else(|| ArborError::UnknownNode(c.to_string()))?;
            path.push(c);
            current = node.parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Generated text along the path to `id`, excluding the root prompt.
    pub fn text_sequence(&self, id: NodeId) -> Result<String> {
        let path = self.path_to_root(id)?;
        let nodes = self.nodes.read();
        let mut out = String::new();
        for step in path {
            if step.is_root() {
                continue;
            }
            if let Some(n) = nodes.get(&step) {
                out.push_str(&n.text);
            }
        }
        Ok(out)
    }

    /// Serialize the subtree under `from`.
    pub fn snapshot(&self, from: NodeId) -> Result<TreeSnapshot> {
        let nodes = self.nodes.read();
        snapshot_inner(&nodes, from)
    }
}

fn snapshot_inner(nodes: &HashMap<NodeId, TokenNode>, id: NodeId) -> Result<TreeSnapshot> {
    let node = nodes
        .get(&id)
        .ok_or_else(|| ArborError::UnknownNode(id.to_string()))?;
    let mut children = Vec::with_capacity(node.children.len());
    for child in &node.children {
        children.push(snapshot_inner(nodes, *child)?);
    }
    Ok(TreeSnapshot {
        id: node.id.to_string(),
        token_id: node.token_id,
        text: node.text.clone(),
        prob: node.prob,
        score: node.score,
        children,
    })
}

fn remove_subtree(nodes: &mut HashMap<NodeId, TokenNode>, id: NodeId) {
    if let Some(node) = nodes.remove(&id) {
        for child in node.children {
            remove_subtree(nodes, child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> TokenTree {
        TokenTree::new("prompt", vec![10, 11, 12])
    }

    #[test]
    fn new_creates_root_node() {
        let tree = sample_tree();
        let root = tree.get(NodeId::ROOT).unwrap();
        assert_eq!(root.text, "prompt");
        assert_eq!(root.token_id, -1);
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn add_child_links_both_ways() {
        let tree = sample_tree();
        let a = tree.add_child(NodeId::ROOT, 5, "a", 0.6).unwrap();

        let child = tree.get(a).unwrap();
        assert_eq!(child.parent, Some(NodeId::ROOT));
        assert_eq!(child.depth, 1);
        assert_eq!(tree.children(NodeId::ROOT), vec![a]);
    }

    #[test]
    fn add_child_to_unknown_parent_fails() {
        let tree = sample_tree();
        let result = tree.add_child(NodeId(999), 5, "a", 0.6);
        assert!(matches!(result, Err(ArborError::UnknownNode(_))));
    }

    #[test]
    fn same_text_replaces_existing_child() {
        let tree = sample_tree();
        let a = tree.add_child(NodeId::ROOT, 5, "the", 0.6).unwrap();
        let grand = tree.add_child(a, 6, "cat", 0.3).unwrap();

        // A different token id decoding to the same text displaces the
        // earlier child and its subtree.
        let b = tree.add_child(NodeId::ROOT, 99, "the", 0.2).unwrap();

        assert_eq!(tree.children(NodeId::ROOT), vec![b]);
        assert!(!tree.contains(a));
        assert!(!tree.contains(grand));
    }

    #[test]
    fn replacement_keeps_sibling_order() {
        let tree = sample_tree();
        let a = tree.add_child(NodeId::ROOT, 1, "a", 0.5).unwrap();
        let b = tree.add_child(NodeId::ROOT, 2, "b", 0.3).unwrap();
        let c = tree.add_child(NodeId::ROOT, 3, "c", 0.2).unwrap();
        let _ = (a, c);

        let b2 = tree.add_child(NodeId::ROOT, 9, "b", 0.1).unwrap();
        let children = tree.children(NodeId::ROOT);
        assert_eq!(children.len(), 3);
        assert_eq!(children[1], b2);
        assert!(!tree.contains(b));
    }

    #[test]
    fn child_or_insert_reuses_by_text() {
        let tree = sample_tree();
        let a = tree.child_or_insert(NodeId::ROOT, 5, "a", 0.6).unwrap();
        let again = tree.child_or_insert(NodeId::ROOT, 7, "a", 0.1).unwrap();

        assert_eq!(a, again);
        assert_eq!(tree.node_count(), 2);
        // The original probability is kept on reuse.
        assert_eq!(tree.get(a).unwrap().prob, 0.6);
    }

    #[test]
    fn greedy_child_picks_max_probability() {
        let tree = sample_tree();
        tree.add_child(NodeId::ROOT, 1, "a", 0.2).unwrap();
        let b = tree.add_child(NodeId::ROOT, 2, "b", 0.7).unwrap();
        tree.add_child(NodeId::ROOT, 3, "c", 0.1).unwrap();

        assert_eq!(tree.greedy_child(NodeId::ROOT), Some(b));
    }

    #[test]
    fn greedy_child_first_wins_ties() {
        let tree = sample_tree();
        let a = tree.add_child(NodeId::ROOT, 1, "a", 0.5).unwrap();
        tree.add_child(NodeId::ROOT, 2, "b", 0.5).unwrap();

        assert_eq!(tree.greedy_child(NodeId::ROOT), Some(a));
    }

    #[test]
    fn prefix_ids_prepends_prompt() {
        let tree = sample_tree();
        let a = tree.add_child(NodeId::ROOT, 5, "a", 0.6).unwrap();
        let b = tree.add_child(a, 6, "b", 0.4).unwrap();

        assert_eq!(tree.prefix_ids(NodeId::ROOT).unwrap(), vec![10, 11, 12]);
        assert_eq!(tree.prefix_ids(b).unwrap(), vec![10, 11, 12, 5, 6]);
    }

    #[test]
    fn path_and_text_sequence() {
        let tree = sample_tree();
        let a = tree.add_child(NodeId::ROOT, 5, "hel", 0.6).unwrap();
        let b = tree.add_child(a, 6, "lo", 0.4).unwrap();

        assert_eq!(tree.path_to_root(b).unwrap(), vec![NodeId::ROOT, a, b]);
        assert_eq!(tree.text_sequence(b).unwrap(), "hello");
    }

    #[test]
    fn all_nodes_and_leaves() {
        let tree = sample_tree();
        let a = tree.add_child(NodeId::ROOT, 1, "a", 0.5).unwrap();
        let b = tree.add_child(NodeId::ROOT, 2, "b", 0.3).unwrap();
        let aa = tree.add_child(a, 3, "c", 0.2).unwrap();

        let all = tree.all_nodes(NodeId::ROOT);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0], NodeId::ROOT);

        let leaves = tree.leaves(NodeId::ROOT);
        assert_eq!(leaves, vec![aa, b]);
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let tree = sample_tree();
        let a = tree.add_child(NodeId::ROOT, 1, "x", 0.5).unwrap();
        tree.add_child(NodeId::ROOT, 2, "y", 0.3).unwrap();
        tree.add_child(a, 3, "z", 0.2).unwrap();

        let snap = tree.snapshot(NodeId::ROOT).unwrap();
        assert_eq!(snap.id, "root");
        assert_eq!(snap.token_id, -1);
        assert_eq!(snap.children.len(), 2);
        assert_eq!(snap.children[0].text, "x");
        assert_eq!(snap.children[1].text, "y");
        assert_eq!(snap.children[0].children[0].text, "z");
    }

    #[test]
    fn snapshot_serializes_to_wire_json() {
        let tree = TokenTree::new("hi", vec![1]);
        tree.add_child(NodeId::ROOT, 4, "a", 1.0).unwrap();

        let json = serde_json::to_value(tree.snapshot(NodeId::ROOT).unwrap()).unwrap();
        assert_eq!(json["id"], "root");
        assert_eq!(json["token_id"], -1);
        assert_eq!(json["children"][0]["text"], "a");
        assert_eq!(json["children"][0]["token_id"], 4);
    }

    #[test]
    fn unknown_node_lookups_fail() {
        let tree = sample_tree();
        assert!(tree.try_get(NodeId(42)).is_err());
        assert!(tree.prefix_ids(NodeId(42)).is_err());
        assert!(tree.snapshot(NodeId(42)).is_err());
    }
}
