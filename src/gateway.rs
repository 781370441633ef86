//! Persistence gateway contract
//!
//! The durable store is reached through [`PersistenceGateway`]. The engine
//! only ever talks to this trait; [`crate::db::Database`] implements it over
//! SQLite and [`MemoryGateway`] keeps everything in-process.
//!
//! Two properties are part of the contract:
//! - node creation accepts a client-supplied id and is idempotent by id
//! - message creation is idempotent by `(node_id, ordinal)`
//!
//! Both make replaying a partially-failed write safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::tree::{Message, Node, Role, TITLE_SENTINEL};

/// Header row of a stored conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub root_node_id: Option<String>,
    pub current_node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Node creation payload
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    /// Client-assigned id; the gateway generates one when absent
    pub id: Option<String>,
    pub conversation_id: String,
    pub parent_id: Option<String>,
    pub label: String,
    pub is_branch: bool,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Message creation payload
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub node_id: String,
    pub role: Role,
    pub content: String,
    pub ordinal: u32,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn from_message(node_id: &str, message: &Message) -> Self {
        Self {
            node_id: node_id.to_string(),
            role: message.role,
            content: message.content.clone(),
            ordinal: message.ordinal,
            created_at: message.timestamp,
        }
    }
}

/// Partial update of a conversation header; `None` fields are left alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointerUpdate {
    pub root_node_id: Option<String>,
    pub current_node_id: Option<String>,
    pub title: Option<String>,
}

impl PointerUpdate {
    pub fn is_empty(&self) -> bool {
        self.root_node_id.is_none() && self.current_node_id.is_none() && self.title.is_none()
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Conversations, most recently updated first
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, GatewayError>;

    /// Every node of a conversation, with messages and children filled in
    async fn fetch_conversation_detail(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, Node>, GatewayError>;

    async fn create_conversation(&self, title: &str) -> Result<String, GatewayError>;

    async fn create_node(&self, node: NewNode) -> Result<String, GatewayError>;

    async fn create_message(&self, message: NewMessage) -> Result<(), GatewayError>;

    async fn update_conversation_pointers(
        &self,
        conversation_id: &str,
        update: PointerUpdate,
    ) -> Result<(), GatewayError>;

    async fn update_node_title(&self, node_id: &str, title: &str) -> Result<(), GatewayError>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), GatewayError>;
}

// ============================================================================
// Graph reconstruction shared by gateway implementations
// ============================================================================

/// A stored node row, before messages and children are attached
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub label: String,
    pub is_branch: bool,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored message row
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub node_id: String,
    pub role: Role,
    pub content: String,
    pub ordinal: u32,
    pub created_at: DateTime<Utc>,
}

/// Rebuild the local node map from stored rows.
///
/// `records` must be in creation order; it determines `children_ids` order.
pub fn assemble_nodes(
    records: Vec<NodeRecord>,
    messages: Vec<MessageRecord>,
) -> HashMap<String, Node> {
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for r in &records {
        if let Some(pid) = &r.parent_id {
            children.entry(pid.clone()).or_default().push(r.id.clone());
        }
    }

    let mut by_node: HashMap<String, Vec<Message>> = HashMap::new();
    for m in messages {
        by_node.entry(m.node_id).or_default().push(Message {
            role: m.role,
            content: m.content,
            timestamp: m.created_at,
            ordinal: m.ordinal,
        });
    }

    records
        .into_iter()
        .map(|r| {
            let mut msgs = by_node.remove(&r.id).unwrap_or_default();
            msgs.sort_by_key(|m| m.ordinal);
            let title = match r.title {
                Some(t) if !t.is_empty() => t,
                _ => TITLE_SENTINEL.to_string(),
            };
            let node = Node {
                id: r.id.clone(),
                hierarchical_id: r.label,
                parent_id: r.parent_id,
                children_ids: children.remove(&r.id).unwrap_or_default(),
                messages: msgs,
                title,
                timestamp: r.created_at,
                is_branch: r.is_branch,
            };
            (r.id, node)
        })
        .collect()
}

// ============================================================================
// In-memory gateway
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    conversations: Vec<ConversationSummary>,
    /// (conversation id, node) in creation order
    nodes: Vec<(String, NodeRecord)>,
    messages: Vec<MessageRecord>,
}

/// Gateway that keeps everything in process memory
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages across all conversations
    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Number of stored nodes across all conversations
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, GatewayError> {
        let mut list = self.state.lock().conversations.clone();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn fetch_conversation_detail(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, Node>, GatewayError> {
        let state = self.state.lock();
        if !state.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(GatewayError::NotFound(format!(
                "conversation {}",
                conversation_id
            )));
        }

        let records: Vec<NodeRecord> = state
            .nodes
            .iter()
            .filter(|(cid, _)| cid == conversation_id)
            .map(|(_, r)| r.clone())
            .collect();
        let messages: Vec<MessageRecord> = state
            .messages
            .iter()
            .filter(|m| records.iter().any(|r| r.id == m.node_id))
            .cloned()
            .collect();

        Ok(assemble_nodes(records, messages))
    }

    async fn create_conversation(&self, title: &str) -> Result<String, GatewayError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.state.lock().conversations.push(ConversationSummary {
            id: id.clone(),
            title: title.to_string(),
            root_node_id: None,
            current_node_id: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn create_node(&self, node: NewNode) -> Result<String, GatewayError> {
        let mut state = self.state.lock();
        if !state
            .conversations
            .iter()
            .any(|c| c.id == node.conversation_id)
        {
            return Err(GatewayError::NotFound(format!(
                "conversation {}",
                node.conversation_id
            )));
        }

        let id = node.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if state.nodes.iter().any(|(_, r)| r.id == id) {
            return Ok(id);
        }

        state.nodes.push((
            node.conversation_id,
            NodeRecord {
                id: id.clone(),
                parent_id: node.parent_id,
                label: node.label,
                is_branch: node.is_branch,
                title: Some(node.title),
                created_at: node.created_at,
            },
        ));
        Ok(id)
    }

    async fn create_message(&self, message: NewMessage) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if !state.nodes.iter().any(|(_, r)| r.id == message.node_id) {
            return Err(GatewayError::NotFound(format!("node {}", message.node_id)));
        }
        let exists = state
            .messages
            .iter()
            .any(|m| m.node_id == message.node_id && m.ordinal == message.ordinal);
        if !exists {
            state.messages.push(MessageRecord {
                node_id: message.node_id,
                role: message.role,
                content: message.content,
                ordinal: message.ordinal,
                created_at: message.created_at,
            });
        }
        Ok(())
    }

    async fn update_conversation_pointers(
        &self,
        conversation_id: &str,
        update: PointerUpdate,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let conv = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {}", conversation_id)))?;

        if let Some(root) = update.root_node_id {
            conv.root_node_id = Some(root);
        }
        if let Some(current) = update.current_node_id {
            conv.current_node_id = Some(current);
        }
        if let Some(title) = update.title {
            conv.title = title;
        }
        conv.updated_at = Utc::now();
        Ok(())
    }

    async fn update_node_title(&self, node_id: &str, title: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let record = state
            .nodes
            .iter_mut()
            .map(|(_, r)| r)
            .find(|r| r.id == node_id)
            .ok_or_else(|| GatewayError::NotFound(format!("node {}", node_id)))?;
        record.title = Some(title.to_string());
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let node_ids: Vec<String> = state
            .nodes
            .iter()
            .filter(|(cid, _)| cid == conversation_id)
            .map(|(_, r)| r.id.clone())
            .collect();
        state.messages.retain(|m| !node_ids.contains(&m.node_id));
        state.nodes.retain(|(cid, _)| cid != conversation_id);
        state.conversations.retain(|c| c.id != conversation_id);
        Ok(())
    }
}
