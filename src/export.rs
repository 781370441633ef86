//! Export utilities for conversation trees
//!
//! Provides DOT graph export and a JSON document combining the tree with
//! its computed layout, for renderers outside this crate.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write;

use crate::layout::{compute_layout, EdgeEmphasis, LayoutConfig, TreeLayout};
use crate::tree::{ConversationTree, Node};

/// Configuration for DOT export
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Title for the graph
    pub title: Option<String>,
    /// Include node titles next to the labels
    pub show_titles: bool,
    /// Include message counts
    pub show_message_counts: bool,
    /// Orientation: "TB" (top-bottom), "LR" (left-right)
    pub rankdir: String,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            title: None,
            show_titles: true,
            show_message_counts: true,
            rankdir: "LR".to_string(),
        }
    }
}

/// Get the fill color for a node
fn node_color(node: &Node, is_current: bool) -> &'static str {
    if is_current {
        "#FFE4B5" // Moccasin (warm yellow)
    } else if node.is_branch {
        "#E0FFFF" // Light cyan
    } else {
        "#E6E6FA" // Lavender
    }
}

/// Get the edge style for an emphasis level
fn edge_style(emphasis: EdgeEmphasis) -> &'static str {
    match emphasis {
        EdgeEmphasis::Current => "bold",
        EdgeEmphasis::Path => "solid",
        EdgeEmphasis::Normal => "dashed",
    }
}

/// Get the edge color for an emphasis level
fn edge_color(emphasis: EdgeEmphasis) -> &'static str {
    match emphasis {
        EdgeEmphasis::Current => "#228B22", // Forest green
        EdgeEmphasis::Path => "#4169E1",    // Royal blue
        EdgeEmphasis::Normal => "#999999",
    }
}

/// Escape a string for DOT labels
fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Truncate a string to at most `max_chars` characters
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

/// Nodes reachable from the root in depth-first, creation order
pub fn traversal_order(tree: &ConversationTree) -> Vec<&Node> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = tree.root_node_id.iter().map(|r| r.as_str()).collect();

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(node) = tree.get(id) else {
            continue;
        };
        out.push(node);
        for child in node.children_ids.iter().rev() {
            stack.push(child);
        }
    }
    out
}

/// Convert a conversation tree to DOT format
pub fn tree_to_dot(tree: &ConversationTree, config: &DotConfig) -> String {
    let mut dot = String::new();

    writeln!(dot, "digraph ConversationTree {{").unwrap();
    writeln!(dot, "  rankdir={};", config.rankdir).unwrap();
    writeln!(dot, "  node [fontname=\"Arial\" fontsize=10 shape=\"box\"];").unwrap();
    writeln!(dot, "  edge [fontname=\"Arial\" fontsize=9];").unwrap();

    if let Some(title) = &config.title {
        writeln!(dot, "  label=\"{}\";", escape_dot(title)).unwrap();
        writeln!(dot, "  labelloc=t;").unwrap();
        writeln!(dot, "  fontsize=14;").unwrap();
    }
    writeln!(dot).unwrap();

    let current = tree.current_node_id.as_deref();
    for node in traversal_order(tree) {
        let mut label = node.hierarchical_id.clone();
        if config.show_titles && node.has_title() {
            write!(label, " {}", truncate(&node.title, 40)).unwrap();
        }
        if config.show_message_counts {
            write!(label, "\n({} messages)", node.messages.len()).unwrap();
        }

        writeln!(
            dot,
            "  \"{}\" [label=\"{}\" fillcolor=\"{}\" style=\"filled\"];",
            node.id,
            escape_dot(&label),
            node_color(node, current == Some(node.id.as_str()))
        )
        .unwrap();
    }

    writeln!(dot).unwrap();

    let layout = compute_layout(tree, &LayoutConfig::default());
    for edge in &layout.edges {
        writeln!(
            dot,
            "  \"{}\" -> \"{}\" [style=\"{}\" color=\"{}\"];",
            edge.source,
            edge.target,
            edge_style(edge.emphasis),
            edge_color(edge.emphasis)
        )
        .unwrap();
    }

    writeln!(dot, "}}").unwrap();

    dot
}

/// A tree plus its layout, as handed to a renderer
#[derive(Debug, Clone, Serialize)]
pub struct TreeExport<'a> {
    pub conversation_id: Option<&'a str>,
    pub root_node_id: Option<&'a str>,
    pub current_node_id: Option<&'a str>,
    /// The root-to-current chain
    pub current_path: Vec<String>,
    pub nodes: Vec<&'a Node>,
    pub layout: TreeLayout,
}

pub fn tree_to_export<'a>(
    tree: &'a ConversationTree,
    conversation_id: Option<&'a str>,
    layout: &LayoutConfig,
) -> TreeExport<'a> {
    TreeExport {
        conversation_id,
        root_node_id: tree.root_node_id.as_deref(),
        current_node_id: tree.current_node_id.as_deref(),
        current_path: tree
            .current_node_id
            .as_deref()
            .map(|c| tree.path_ids(c))
            .unwrap_or_default(),
        nodes: traversal_order(tree),
        layout: compute_layout(tree, layout),
    }
}

/// Pretty-printed JSON of [`tree_to_export`]
pub fn tree_to_json(
    tree: &ConversationTree,
    conversation_id: Option<&str>,
    layout: &LayoutConfig,
) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&tree_to_export(tree, conversation_id, layout))
}

/// The subtree under `root_id` as a tree of its own. `None` when the node
/// does not exist.
///
/// The subtree root keeps its label; focus is kept only if it falls inside.
pub fn subtree(tree: &ConversationTree, root_id: &str) -> Option<ConversationTree> {
    tree.get(root_id)?;

    let mut out = ConversationTree::new();
    let mut stack = vec![root_id.to_string()];
    while let Some(id) = stack.pop() {
        if out.contains(&id) {
            continue;
        }
        let Some(node) = tree.get(&id) else {
            continue;
        };
        let mut copy = node.clone();
        if id == root_id {
            copy.parent_id = None;
        }
        stack.extend(copy.children_ids.iter().cloned());
        out.nodes.insert(id, copy);
    }

    out.root_node_id = Some(root_id.to_string());
    out.current_node_id = tree
        .current_node_id
        .clone()
        .filter(|c| out.contains(c));
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Message, Role};

    fn sample_tree() -> ConversationTree {
        let mut tree = ConversationTree::new();
        tree.insert_node(Node::new("r", "1", None), None);
        tree.insert_node(Node::new("a", "1.a", Some("r".to_string())), Some("r"));
        tree.insert_node(Node::new("b", "1.b", Some("r".to_string())), Some("r"));
        tree.insert_node(Node::new("a1", "1.a.1", Some("a".to_string())), Some("a"));
        tree.append_message("r", Message::new(Role::User, "hello", 0));
        tree.append_message("r", Message::new(Role::Model, "hi", 1));
        tree.patch_title("a", "Say \"hi\"");
        tree.current_node_id = Some("a1".to_string());
        tree
    }

    #[test]
    fn test_tree_to_dot() {
        let dot = tree_to_dot(&sample_tree(), &DotConfig::default());

        assert!(dot.contains("digraph ConversationTree"));
        assert!(dot.contains("\"r\" [label=\"1\\n(2 messages)\""));
        assert!(dot.contains("1.a Say \\\"hi\\\""));
        assert!(dot.contains("\"a\" -> \"a1\" [style=\"bold\""));
        assert!(dot.contains("\"r\" -> \"b\" [style=\"dashed\""));
        // Current node highlighted
        assert!(dot.contains("\"a1\" [label=\"1.a.1\\n(0 messages)\" fillcolor=\"#FFE4B5\""));
    }

    #[test]
    fn test_traversal_order_is_depth_first() {
        let tree = sample_tree();
        let order: Vec<&str> = traversal_order(&tree).iter().map(|n| n.hierarchical_id.as_str()).collect();
        assert_eq!(order, vec!["1", "1.a", "1.a.1", "1.b"]);
    }

    #[test]
    fn test_json_export() {
        let tree = sample_tree();
        let json = tree_to_json(&tree, Some("conv"), &LayoutConfig::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["conversation_id"], "conv");
        assert_eq!(value["current_path"], serde_json::json!(["r", "a", "a1"]));
        assert_eq!(value["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(value["layout"]["edges"][0]["emphasis"], "path");
    }

    #[test]
    fn test_subtree() {
        let tree = sample_tree();
        let sub = subtree(&tree, "a").unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.root_node_id.as_deref(), Some("a"));
        assert_eq!(sub.current_node_id.as_deref(), Some("a1"));
        assert!(sub.check_invariants().is_empty());

        let other = subtree(&tree, "b").unwrap();
        assert_eq!(other.current_node_id, None);
        assert!(subtree(&tree, "zzz").is_none());
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 40), "short");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
