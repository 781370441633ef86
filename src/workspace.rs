//! The active session: which conversation is open, its tree, and the
//! pending-branch cursor.
//!
//! A workspace is shared between the main send path, side-chat sends and
//! background title tasks. The lock is only ever held for one short
//! mutation and never across an `.await`.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::tree::{ConversationTree, PendingBranch};

/// Shared handle to a workspace
pub type SharedWorkspace = Arc<Mutex<Workspace>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace {
    /// `None` until the first send of a new conversation has been persisted
    pub conversation_id: Option<String>,
    pub tree: ConversationTree,
    pub pending: PendingBranch,
    /// Nodes whose response is visible but whose durable write failed
    pub unsynced: HashSet<String>,
    /// Bumped whenever the open conversation changes. In-flight sends
    /// compare it before touching the tree.
    pub session: u64,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedWorkspace {
        Arc::new(Mutex::new(self))
    }

    /// Forget everything and start a blank conversation
    pub fn reset(&mut self) {
        *self = Self {
            session: self.session + 1,
            ..Self::default()
        };
    }

    /// Switch to a conversation loaded from the store
    pub fn load(&mut self, conversation_id: String, tree: ConversationTree) {
        *self = Self {
            conversation_id: Some(conversation_id),
            tree,
            session: self.session + 1,
            ..Self::default()
        };
    }

    /// Focus a node and drop any pending branch
    pub fn select_node(&mut self, node_id: &str) -> bool {
        if !self.tree.contains(node_id) {
            return false;
        }
        self.tree.current_node_id = Some(node_id.to_string());
        self.pending = PendingBranch::default();
        true
    }

    /// Arm the pending-branch cursor
    pub fn begin_branch(&mut self, node_id: &str) -> bool {
        if !self.tree.contains(node_id) {
            return false;
        }
        self.pending.branching_from_id = Some(node_id.to_string());
        true
    }

    pub fn cancel_branch(&mut self) {
        self.pending = PendingBranch::default();
    }

    pub fn is_active(&self, conversation_id: Option<&str>) -> bool {
        self.conversation_id.as_deref() == conversation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;

    fn workspace() -> Workspace {
        let mut ws = Workspace::new();
        ws.tree.insert_node(Node::new("r", "1", None), None);
        ws.tree.insert_node(Node::new("a", "1.a", None), Some("r"));
        ws.tree.current_node_id = Some("r".to_string());
        ws
    }

    #[test]
    fn test_select_clears_pending() {
        let mut ws = workspace();
        assert!(ws.begin_branch("r"));
        assert!(ws.select_node("a"));
        assert!(!ws.pending.is_set());
        assert_eq!(ws.tree.current_node_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_unknown_nodes_rejected() {
        let mut ws = workspace();
        assert!(!ws.select_node("zzz"));
        assert!(!ws.begin_branch("zzz"));
        assert_eq!(ws.tree.current_node_id.as_deref(), Some("r"));
    }

    #[test]
    fn test_reset() {
        let mut ws = workspace();
        ws.conversation_id = Some("c".to_string());
        ws.reset();
        assert!(ws.tree.is_empty());
        assert_eq!(ws.conversation_id, None);
        assert_eq!(ws.session, 1);
    }

    #[test]
    fn test_load_bumps_session() {
        let mut ws = workspace();
        ws.begin_branch("r");
        let tree = ws.tree.clone();
        ws.load("c".to_string(), tree);
        assert_eq!(ws.session, 1);
        assert!(!ws.pending.is_set());
        assert!(ws.is_active(Some("c")));
    }
}
