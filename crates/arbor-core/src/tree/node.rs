//! Token node representation.

use std::fmt;

/// Token id stored on the root node, which carries no generated token.
pub const ROOT_TOKEN_ID: i32 = -1;

/// Unique identifier for a node within a token tree.
///
/// The wire form (via `Display`) is the sentinel string `"root"` for the
/// root and a hex string for every other node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Root node ID.
    pub const ROOT: NodeId = NodeId(0);

    /// Check if this is the root ID.
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    /// Parse the wire form produced by `Display`.
    pub fn parse(s: &str) -> Option<NodeId> {
        if s == "root" {
            Some(NodeId::ROOT)
        } else {
            u64::from_str_radix(s, 16).ok().map(NodeId)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            write!(f, "{:08x}", self.0)
        }
    }
}

/// A single token in a generation tree.
///
/// Nodes are owned by their [`TokenTree`](super::TokenTree); `parent` is a
/// non-owning handle used only for prefix reconstruction.
#[derive(Debug, Clone)]
pub struct TokenNode {
    /// Identity within the owning tree.
    pub id: NodeId,
    /// Vocabulary index, or [`ROOT_TOKEN_ID`] for the root.
    pub token_id: i32,
    /// Decoded surface text (the raw prompt on the root).
    pub text: String,
    /// Sampling probability at creation time.
    pub prob: f32,
    /// Branch score; equals `prob` at creation.
    pub score: f32,
    /// Distance from the root.
    pub depth: u32,
    /// Non-owning back-reference, `None` for the root.
    pub parent: Option<NodeId>,
    /// Child handles in insertion order, looked up by decoded text.
    pub children: Vec<NodeId>,
}

impl TokenNode {
    /// Create the root node holding the raw prompt text.
    pub fn root(prompt: impl Into<String>) -> Self {
        Self {
            id: NodeId::ROOT,
            token_id: ROOT_TOKEN_ID,
            text: prompt.into(),
            prob: 1.0,
            score: 1.0,
            depth: 0,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Create a child node one level below `parent`.
    pub fn child(
        id: NodeId,
        token_id: u32,
        text: impl Into<String>,
        prob: f32,
        parent: &TokenNode,
    ) -> Self {
        Self {
            id,
            token_id: token_id as i32,
            text: text.into(),
            prob,
            score: prob,
            depth: parent.depth + 1,
            parent: Some(parent.id),
            children: Vec::new(),
        }
    }
}
