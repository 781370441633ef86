//! Tree layout - deterministic 2-D placement of conversation nodes
//!
//! A pure function of the tree. Roots sit at the origin, branches grow to
//! the right, and every subtree gets a vertical band proportional to the
//! number of leaves below it. Recompute in full whenever the tree changes.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::label;
use crate::tree::ConversationTree;

/// Spacing and scaling constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Horizontal distance from a root-level node to its children
    pub horizontal_spacing: f64,
    /// Vertical space a leaf occupies
    pub vertical_spacing: f64,
    /// Per-depth multiplier on horizontal spacing
    pub spacing_decay: f64,
    /// Lower bound on the spacing multiplier
    pub min_spacing_factor: f64,
    /// Per-depth multiplier on node scale
    pub scale_decay: f64,
    /// Lower bound on node scale
    pub min_scale: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            horizontal_spacing: 380.0,
            vertical_spacing: 180.0,
            spacing_decay: 0.95,
            min_spacing_factor: 0.7,
            scale_decay: 0.88,
            min_scale: 0.5,
        }
    }
}

impl LayoutConfig {
    fn scale_at(&self, depth: usize) -> f64 {
        self.scale_decay.powi(depth as i32).max(self.min_scale)
    }

    fn spacing_at(&self, depth: usize) -> f64 {
        self.horizontal_spacing * self.spacing_decay.powi(depth as i32).max(self.min_spacing_factor)
    }
}

/// A placed node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionedNode {
    pub id: String,
    pub label: String,
    pub x: f64,
    pub y: f64,
    pub depth: usize,
    /// Visual scale, shrinking geometrically with depth
    pub scale: f64,
    pub is_current: bool,
}

/// How an edge should be drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeEmphasis {
    /// Leads into the current node
    Current,
    /// Elsewhere on the root-to-current path
    Path,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutEdge {
    pub source: String,
    pub target: String,
    pub emphasis: EdgeEmphasis,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeLayout {
    pub nodes: Vec<PositionedNode>,
    pub edges: Vec<LayoutEdge>,
}

impl TreeLayout {
    pub fn position(&self, node_id: &str) -> Option<&PositionedNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

/// Place every node reachable from the root
pub fn compute_layout(tree: &ConversationTree, config: &LayoutConfig) -> TreeLayout {
    let Some(root) = tree.root_node_id.as_deref().filter(|r| tree.contains(r)) else {
        return TreeLayout::default();
    };

    let mut heights = HashMap::new();
    subtree_height(tree, root, config, &mut heights, &mut HashSet::new());

    let current_path: Vec<String> = tree
        .current_node_id
        .as_deref()
        .map(|c| tree.path_ids(c))
        .unwrap_or_default();

    let mut placer = Placer {
        tree,
        config,
        heights: &heights,
        current: tree.current_node_id.as_deref(),
        current_path: &current_path,
        visited: HashSet::new(),
        layout: TreeLayout::default(),
    };
    placer.place(root, 0.0, 0.0);
    placer.layout
}

/// First pass: vertical space needed by each subtree, bottom-up
fn subtree_height(
    tree: &ConversationTree,
    id: &str,
    config: &LayoutConfig,
    heights: &mut HashMap<String, f64>,
    visiting: &mut HashSet<String>,
) -> f64 {
    let base = config.vertical_spacing;
    if !visiting.insert(id.to_string()) {
        // Cycle: count the repeat as a leaf and stop
        return base;
    }

    let height = match tree.get(id) {
        Some(node) if !node.children_ids.is_empty() => {
            let total: f64 = node
                .children_ids
                .iter()
                .filter(|c| tree.contains(c))
                .map(|c| subtree_height(tree, c, config, heights, visiting))
                .sum();
            total.max(base)
        }
        _ => base,
    };

    heights.insert(id.to_string(), height);
    height
}

struct Placer<'a> {
    tree: &'a ConversationTree,
    config: &'a LayoutConfig,
    heights: &'a HashMap<String, f64>,
    current: Option<&'a str>,
    current_path: &'a [String],
    visited: HashSet<String>,
    layout: TreeLayout,
}

impl Placer<'_> {
    /// Second pass: top-down positions
    fn place(&mut self, id: &str, x: f64, y: f64) {
        if !self.visited.insert(id.to_string()) {
            return;
        }
        let tree = self.tree;
        let Some(node) = tree.get(id) else {
            return;
        };

        let base = self.config.vertical_spacing;
        let depth = label::depth(&node.hierarchical_id);
        self.layout.nodes.push(PositionedNode {
            id: node.id.clone(),
            label: node.hierarchical_id.clone(),
            x,
            y,
            depth,
            scale: self.config.scale_at(depth),
            is_current: self.current == Some(node.id.as_str()),
        });

        let own_height = self.heights.get(id).copied().unwrap_or(base);
        let child_x = x + self.config.spacing_at(depth);
        let mut cursor = y - own_height / 2.0 + base / 2.0;

        for child in &node.children_ids {
            if !tree.contains(child) || self.visited.contains(child) {
                continue;
            }
            let child_height = self.heights.get(child).copied().unwrap_or(base);
            let child_y = cursor + child_height / 2.0 - base / 2.0;

            self.layout.edges.push(LayoutEdge {
                source: node.id.clone(),
                target: child.clone(),
                emphasis: self.emphasis(child),
            });

            self.place(child, child_x, child_y);
            cursor += child_height;
        }
    }

    fn emphasis(&self, target: &str) -> EdgeEmphasis {
        if self.current == Some(target) {
            EdgeEmphasis::Current
        } else if self.current_path.iter().any(|p| p == target) {
            EdgeEmphasis::Path
        } else {
            EdgeEmphasis::Normal
        }
    }
}
