//! Rehydration - merging authoritative server state into the local tree
//!
//! The fetched snapshot replaces the local node map wholesale, except for
//! nodes the caller asks to preserve: nodes still streaming a response, or
//! nodes whose durable write has not gone through yet. Those keep their local
//! messages, and if the server does not know them yet they are carried over
//! and relinked under their parent.
//!
//! Reconciling twice with the same snapshot gives the same tree.

use std::collections::{HashMap, HashSet};

use crate::tree::{ConversationTree, Node};

/// What a reconcile did besides the wholesale replacement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Preserved nodes missing from the snapshot that were carried over
    pub carried: Vec<String>,
    /// Preserved nodes that could not be attached (parent gone)
    pub dropped: Vec<String>,
    /// The pinned current node was not in the result, so current is now `None`
    pub current_cleared: bool,
}

/// Replace the tree's nodes with `fresh`, keeping `preserve`d local work and
/// pinning `current_node_id` to `pinned_current`.
///
/// A pinned id that does not exist after the merge clears the current
/// pointer instead of leaving it dangling.
pub fn reconcile(
    tree: &mut ConversationTree,
    fresh: HashMap<String, Node>,
    pinned_current: Option<&str>,
    preserve: &HashSet<String>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let mut nodes = fresh;

    // Titles never go back to the sentinel once a node has one
    for (id, node) in nodes.iter_mut() {
        if let Some(local) = tree.nodes.get(id) {
            if !node.has_title() && local.has_title() {
                node.title = local.title.clone();
            }
        }
    }

    let mut carried: Vec<&Node> = Vec::new();
    for id in preserve {
        let Some(local) = tree.nodes.get(id) else {
            continue;
        };
        match nodes.get_mut(id) {
            Some(server) => server.messages = local.messages.clone(),
            None => carried.push(local),
        }
    }

    // Parents before children, then creation order
    carried.sort_by(|a, b| {
        (a.depth(), a.timestamp, &a.id).cmp(&(b.depth(), b.timestamp, &b.id))
    });
    for local in carried {
        let attachable = match &local.parent_id {
            Some(pid) => nodes.contains_key(pid),
            None => !nodes.values().any(|n| n.parent_id.is_none()),
        };
        if !attachable {
            tracing::warn!(node = %local.id, "preserved node has no parent in snapshot, dropping");
            report.dropped.push(local.id.clone());
            continue;
        }
        let mut node = local.clone();
        node.children_ids.clear();
        if let Some(parent) = node.parent_id.as_deref().and_then(|p| nodes.get_mut(p)) {
            if !parent.children_ids.contains(&node.id) {
                parent.children_ids.push(node.id.clone());
            }
        }
        report.carried.push(node.id.clone());
        nodes.insert(node.id.clone(), node);
    }

    repair_children(&mut nodes);

    let roots: Vec<&String> = nodes
        .values()
        .filter(|n| n.parent_id.is_none())
        .map(|n| &n.id)
        .collect();
    let root = if roots.len() == 1 {
        Some(roots[0].clone())
    } else {
        tree.root_node_id
            .clone()
            .filter(|r| nodes.get(r).map(|n| n.parent_id.is_none()).unwrap_or(false))
    };

    let current = match pinned_current {
        Some(id) if nodes.contains_key(id) => Some(id.to_string()),
        Some(id) => {
            tracing::warn!(node = %id, "pinned current node not in snapshot, clearing focus");
            report.current_cleared = true;
            None
        }
        None => None,
    };

    tracing::debug!(
        nodes = nodes.len(),
        carried = report.carried.len(),
        "reconciled conversation tree"
    );
    tree.replace_all(nodes, root, current);
    report
}

/// Make every `children_ids` list agree with the `parent_id` links:
/// drop entries that do not point back, keep order, append missing ones in
/// creation order.
fn repair_children(nodes: &mut HashMap<String, Node>) {
    let parent_of: HashMap<String, Option<String>> = nodes
        .iter()
        .map(|(id, n)| (id.clone(), n.parent_id.clone()))
        .collect();

    for (id, node) in nodes.iter_mut() {
        let mut seen = HashSet::new();
        node.children_ids.retain(|c| {
            parent_of.get(c).and_then(|p| p.as_deref()) == Some(id.as_str()) && seen.insert(c.clone())
        });
    }

    let mut missing: Vec<(chrono::DateTime<chrono::Utc>, String, String)> = nodes
        .values()
        .filter_map(|n| {
            let pid = n.parent_id.as_ref()?;
            let parent = nodes.get(pid)?;
            (!parent.children_ids.contains(&n.id)).then(|| (n.timestamp, n.id.clone(), pid.clone()))
        })
        .collect();
    missing.sort();
    for (_, id, pid) in missing {
        if let Some(parent) = nodes.get_mut(&pid) {
            parent.children_ids.push(id);
        }
    }
}
