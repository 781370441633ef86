//! Conversation tree model and store
//!
//! The tree is the single source of truth for the active conversation.
//! Every operation here is a self-contained read-modify-write: callers
//! never observe a half-updated graph, and operations on absent nodes are
//! no-ops rather than errors (a node may have been rolled back while a
//! network call was in flight).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::label;

/// Title of a node that has not been summarized yet
pub const TITLE_SENTINEL: &str = "...";

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "model" | "assistant" => Some(Role::Model),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message inside a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Zero-based, unique within the node, increasing in creation order
    pub ordinal: u32,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, ordinal: u32) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            ordinal,
        }
    }
}

/// One branch segment of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hierarchical_id: String,
    pub parent_id: Option<String>,
    pub children_ids: Vec<String>,
    pub messages: Vec<Message>,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    /// Created by branching from an existing node (rather than as a root)
    #[serde(default)]
    pub is_branch: bool,
}

impl Node {
    /// A fresh node with no messages and the sentinel title
    pub fn new(
        id: impl Into<String>,
        hierarchical_id: impl Into<String>,
        parent_id: Option<String>,
    ) -> Self {
        let is_branch = parent_id.is_some();
        Self {
            id: id.into(),
            hierarchical_id: hierarchical_id.into(),
            parent_id,
            children_ids: Vec::new(),
            messages: Vec::new(),
            title: TITLE_SENTINEL.to_string(),
            timestamp: Utc::now(),
            is_branch,
        }
    }

    pub fn has_title(&self) -> bool {
        self.title != TITLE_SENTINEL
    }

    /// Messages in replay order
    pub fn ordered_messages(&self) -> Vec<&Message> {
        let mut msgs: Vec<&Message> = self.messages.iter().collect();
        msgs.sort_by_key(|m| m.ordinal);
        msgs
    }

    pub fn depth(&self) -> usize {
        label::depth(&self.hierarchical_id)
    }
}

/// Cursor recording that the next send should branch from a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBranch {
    pub branching_from_id: Option<String>,
}

impl PendingBranch {
    pub fn is_set(&self) -> bool {
        self.branching_from_id.is_some()
    }
}

/// The node graph of one conversation plus its focus pointer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationTree {
    pub nodes: HashMap<String, Node>,
    pub root_node_id: Option<String>,
    pub current_node_id: Option<String>,
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn current(&self) -> Option<&Node> {
        self.current_node_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    // ========================================================================
    // Atomic mutations
    // ========================================================================

    /// Full resynchronization
    pub fn replace_all(
        &mut self,
        nodes: HashMap<String, Node>,
        root_node_id: Option<String>,
        current_node_id: Option<String>,
    ) {
        self.nodes = nodes;
        self.root_node_id = root_node_id;
        self.current_node_id = current_node_id;
    }

    /// Insert a node under `parent_id` (or as the root when `None`).
    ///
    /// Returns `false` and leaves the tree untouched if the parent is absent
    /// or the id is already taken.
    pub fn insert_node(&mut self, mut node: Node, parent_id: Option<&str>) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }

        match parent_id {
            Some(pid) => {
                let Some(parent) = self.nodes.get_mut(pid) else {
                    return false;
                };
                parent.children_ids.push(node.id.clone());
                node.parent_id = Some(pid.to_string());
            }
            None => {
                if self.root_node_id.is_some() {
                    return false;
                }
                node.parent_id = None;
                self.root_node_id = Some(node.id.clone());
            }
        }

        self.nodes.insert(node.id.clone(), node);
        true
    }

    pub fn append_message(&mut self, node_id: &str, message: Message) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.messages.push(message);
                true
            }
            None => false,
        }
    }

    /// Replace the content of the newest message, leaving role, ordinal and
    /// timestamp alone. Used for streaming accumulation.
    pub fn patch_last_message_content(&mut self, node_id: &str, content: &str) -> bool {
        let Some(last) = self
            .nodes
            .get_mut(node_id)
            .and_then(|n| n.messages.last_mut())
        else {
            return false;
        };
        last.content.clear();
        last.content.push_str(content);
        true
    }

    /// Remove a node during optimistic rollback.
    ///
    /// Clears pointers that referenced it and prunes it from its parent's
    /// `children_ids` so the children invariant keeps holding.
    pub fn remove_node(&mut self, node_id: &str) -> Option<Node> {
        let node = self.nodes.remove(node_id)?;

        if let Some(parent) = node
            .parent_id
            .as_deref()
            .and_then(|pid| self.nodes.get_mut(pid))
        {
            parent.children_ids.retain(|c| c != node_id);
        }
        if self.current_node_id.as_deref() == Some(node_id) {
            self.current_node_id = None;
        }
        if self.root_node_id.as_deref() == Some(node_id) {
            self.root_node_id = None;
        }
        Some(node)
    }

    /// Set the title once enrichment produced one. The sentinel is never
    /// written back.
    pub fn patch_title(&mut self, node_id: &str, title: &str) -> bool {
        if title == TITLE_SENTINEL {
            return false;
        }
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.title = title.to_string();
                true
            }
            None => false,
        }
    }

    /// Drop messages past `len` (continue-node rollback)
    pub fn truncate_messages(&mut self, node_id: &str, len: usize) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.messages.truncate(len);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Nodes from the root down to `node_id`, following `parent_id`.
    /// Stops early on a missing parent or a cycle.
    pub fn path_to(&self, node_id: &str) -> Vec<&Node> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(node_id);

        while let Some(id) = cursor {
            if !seen.insert(id) {
                break;
            }
            let Some(node) = self.nodes.get(id) else {
                break;
            };
            path.push(node);
            cursor = node.parent_id.as_deref();
        }

        path.reverse();
        path
    }

    /// Ids on the root..node path
    pub fn path_ids(&self, node_id: &str) -> Vec<String> {
        self.path_to(node_id).iter().map(|n| n.id.clone()).collect()
    }

    /// Role-tagged history along the path to `node_id`
    pub fn transcript(&self, node_id: &str) -> Vec<(Role, String)> {
        self.path_to(node_id)
            .into_iter()
            .flat_map(|n| n.ordered_messages())
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    /// The history a chat view shows for the current node
    pub fn active_messages(&self) -> Vec<&Message> {
        match self.current_node_id.as_deref() {
            Some(id) => self
                .path_to(id)
                .into_iter()
                .flat_map(|n| n.ordered_messages())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn find_by_label(&self, hierarchical_id: &str) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| n.hierarchical_id == hierarchical_id)
    }

    /// Label for the next child of `parent_id`, using the sibling count as
    /// it stands right now
    pub fn next_child_label(&self, parent_id: Option<&str>) -> Option<String> {
        match parent_id {
            None => Some(label::label(None, 0)),
            Some(pid) => {
                let parent = self.nodes.get(pid)?;
                Some(label::label(
                    Some(&parent.hierarchical_id),
                    parent.children_ids.len(),
                ))
            }
        }
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    /// Structural violations, empty when the tree is consistent
    pub fn check_invariants(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let roots: Vec<&str> = self
            .nodes
            .values()
            .filter(|n| n.parent_id.is_none())
            .map(|n| n.id.as_str())
            .collect();
        if roots.len() > 1 {
            problems.push(format!("multiple roots: {:?}", roots));
        }
        if let Some(root) = &self.root_node_id {
            match self.nodes.get(root) {
                Some(n) if n.parent_id.is_some() => {
                    problems.push(format!("root {} has a parent", root))
                }
                None => problems.push(format!("root {} is not in the tree", root)),
                _ => {}
            }
        }
        if let Some(current) = &self.current_node_id {
            if !self.nodes.contains_key(current) {
                problems.push(format!("current {} is not in the tree", current));
            }
        }

        for node in self.nodes.values() {
            let expected: HashSet<&str> = self
                .nodes
                .values()
                .filter(|c| c.parent_id.as_deref() == Some(node.id.as_str()))
                .map(|c| c.id.as_str())
                .collect();
            let actual: HashSet<&str> = node.children_ids.iter().map(|s| s.as_str()).collect();
            if expected != actual || actual.len() != node.children_ids.len() {
                problems.push(format!(
                    "children of {} are {:?}, expected {:?}",
                    node.id, node.children_ids, expected
                ));
            }

            let path = self.path_to(&node.id);
            match path.first() {
                Some(top) if top.parent_id.is_none() => {}
                _ => problems.push(format!("{} does not reach a root", node.id)),
            }

            if node
                .messages
                .windows(2)
                .any(|w| w[0].ordinal >= w[1].ordinal)
            {
                problems.push(format!("messages of {} are out of order", node.id));
            }
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, label: &str) -> Node {
        Node::new(id, label, None)
    }

    fn assert_consistent(tree: &ConversationTree) {
        let problems = tree.check_invariants();
        assert!(problems.is_empty(), "invariants violated: {:?}", problems);
    }

    fn sample() -> ConversationTree {
        let mut tree = ConversationTree::new();
        assert!(tree.insert_node(node("r", "1"), None));
        assert!(tree.insert_node(node("a", "1.a"), Some("r")));
        assert!(tree.insert_node(node("b", "1.b"), Some("r")));
        assert!(tree.insert_node(node("a1", "1.a.1"), Some("a")));
        tree
    }

    #[test]
    fn test_insert_links_parent() {
        let tree = sample();
        assert_eq!(tree.root_node_id.as_deref(), Some("r"));
        assert_eq!(tree.get("r").unwrap().children_ids, vec!["a", "b"]);
        assert_eq!(tree.get("a1").unwrap().parent_id.as_deref(), Some("a"));
        assert_consistent(&tree);
    }

    #[test]
    fn test_insert_missing_parent_is_noop() {
        let mut tree = sample();
        let before = tree.clone();
        assert!(!tree.insert_node(node("x", "9"), Some("missing")));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_second_root_rejected() {
        let mut tree = sample();
        assert!(!tree.insert_node(node("r2", "1"), None));
        assert_consistent(&tree);
    }

    #[test]
    fn test_append_and_patch_last_message() {
        let mut tree = sample();
        assert!(tree.append_message("a", Message::new(Role::User, "hi", 0)));
        assert!(tree.append_message("a", Message::new(Role::Model, "", 1)));
        assert!(tree.patch_last_message_content("a", "hel"));
        assert!(tree.patch_last_message_content("a", "hello"));

        let msgs = &tree.get("a").unwrap().messages;
        assert_eq!(msgs[1].content, "hello");
        assert_eq!(msgs[1].ordinal, 1);
        assert_eq!(msgs[1].role, Role::Model);
        assert_eq!(msgs[0].content, "hi");
    }

    #[test]
    fn test_mutations_on_absent_nodes_are_noops() {
        let mut tree = sample();
        let before = tree.clone();
        assert!(!tree.append_message("nope", Message::new(Role::User, "x", 0)));
        assert!(!tree.patch_last_message_content("nope", "x"));
        // Node exists but has no messages
        assert!(!tree.patch_last_message_content("b", "x"));
        assert!(!tree.patch_title("nope", "x"));
        assert!(tree.remove_node("nope").is_none());
        assert_eq!(tree, before);
    }

    #[test]
    fn test_remove_node_prunes_parent_children() {
        let mut tree = sample();
        tree.current_node_id = Some("b".to_string());
        tree.remove_node("b");

        assert_eq!(tree.get("r").unwrap().children_ids, vec!["a"]);
        assert_eq!(tree.current_node_id, None);
        assert_consistent(&tree);
    }

    #[test]
    fn test_remove_root_clears_pointers() {
        let mut tree = ConversationTree::new();
        tree.insert_node(node("r", "1"), None);
        tree.current_node_id = Some("r".to_string());
        tree.remove_node("r");
        assert_eq!(tree, ConversationTree::new());
    }

    #[test]
    fn test_patch_title_never_writes_sentinel() {
        let mut tree = sample();
        assert!(tree.patch_title("a", "Rust lifetimes"));
        assert!(!tree.patch_title("a", TITLE_SENTINEL));
        assert_eq!(tree.get("a").unwrap().title, "Rust lifetimes");
    }

    #[test]
    fn test_truncate_messages() {
        let mut tree = sample();
        tree.append_message("r", Message::new(Role::User, "q", 0));
        tree.append_message("r", Message::new(Role::Model, "a", 1));
        tree.append_message("r", Message::new(Role::User, "q2", 2));
        tree.truncate_messages("r", 2);
        assert_eq!(tree.get("r").unwrap().messages.len(), 2);
    }

    #[test]
    fn test_path_length_matches_label_depth() {
        let tree = sample();
        for n in tree.nodes.values() {
            // Steps to the root equal the separator count
            assert_eq!(tree.path_to(&n.id).len() - 1, n.depth());
        }
    }

    #[test]
    fn test_path_stops_on_cycle() {
        let mut tree = sample();
        tree.nodes.get_mut("r").unwrap().parent_id = Some("a1".to_string());
        let path = tree.path_to("a1");
        assert!(path.len() <= 3);
        assert!(!tree.check_invariants().is_empty());
    }

    #[test]
    fn test_transcript_follows_path_and_ordinals() {
        let mut tree = sample();
        tree.append_message("r", Message::new(Role::User, "root q", 0));
        tree.append_message("r", Message::new(Role::Model, "root a", 1));
        // Stored out of order; replay must sort by ordinal
        tree.append_message("a", Message::new(Role::Model, "branch a", 1));
        tree.append_message("a", Message::new(Role::User, "branch q", 0));
        tree.append_message("b", Message::new(Role::User, "other", 0));

        let transcript = tree.transcript("a");
        let contents: Vec<&str> = transcript.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(contents, vec!["root q", "root a", "branch q", "branch a"]);
        assert_eq!(transcript[2].0, Role::User);
    }

    #[test]
    fn test_next_child_label_counts_existing_children() {
        let tree = sample();
        assert_eq!(tree.next_child_label(None).as_deref(), Some("1"));
        assert_eq!(tree.next_child_label(Some("r")).as_deref(), Some("1.c"));
        assert_eq!(tree.next_child_label(Some("a")).as_deref(), Some("1.a.2"));
        assert_eq!(tree.next_child_label(Some("missing")), None);
    }

    #[test]
    fn test_find_by_label() {
        let tree = sample();
        assert_eq!(tree.find_by_label("1.a.1").map(|n| n.id.as_str()), Some("a1"));
        assert!(tree.find_by_label("2").is_none());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("assistant"), Some(Role::Model));
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("system"), None);
    }
}
