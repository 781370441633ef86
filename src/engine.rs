//! Optimistic mutation engine
//!
//! A send stages its node and user message in the local tree right away,
//! streams the model response into that same node, writes everything
//! through the [`PersistenceGateway`], rehydrates from the store, and then
//! titles the node in a background task.
//!
//! Node ids are assigned here, up front, and never change. The workspace
//! lock is only taken for single short mutations, never across an `.await`,
//! so a side chat can stream into one node while a main send streams into
//! another.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::completion::{
    sanitize_title, Attachment, CompletionEvent, CompletionRequest, CompletionService, Summarizer,
};
use crate::config::{EngineConfig, PersistFailurePolicy};
use crate::error::{EngineError, GatewayError, SendError};
use crate::gateway::{ConversationSummary, NewMessage, NewNode, PersistenceGateway, PointerUpdate};
use crate::label;
use crate::layout::{compute_layout, LayoutConfig, TreeLayout};
use crate::reconcile::reconcile;
use crate::tree::{ConversationTree, Message, Node, PendingBranch, Role, TITLE_SENTINEL};
use crate::workspace::{SharedWorkspace, Workspace};

/// How a send was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// Empty workspace: the send creates the root
    NewConversation,
    /// Append to the current node
    Continue,
    /// A branch was pending: the send creates a child of it
    Branch,
    /// Append to a chosen node without moving focus
    SideChat,
}

impl SendKind {
    fn creates_node(self) -> bool {
        matches!(self, SendKind::NewConversation | SendKind::Branch)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Focus the new node after a branch send. `None` uses the configured
    /// default.
    pub focus_follow: Option<bool>,
    /// Overrides the configured model
    pub model: Option<String>,
}

/// Result of a send that was generated and saved
#[derive(Debug)]
pub struct SendOutcome {
    pub kind: SendKind,
    pub conversation_id: String,
    pub node_id: String,
    pub label: String,
    pub response: String,
    /// Background title enrichment, when the node still needed a title
    pub title_task: Option<JoinHandle<()>>,
}

// ============================================================================
// Generation gate
// ============================================================================

/// Tracks the outstanding main-path send and every node being streamed into
#[derive(Debug, Default)]
struct GenerationGate {
    main: AtomicBool,
    nodes: Mutex<HashSet<String>>,
}

impl GenerationGate {
    fn try_main(&self) -> Option<MainGuard<'_>> {
        self.main
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(MainGuard(self))
    }

    fn try_node(&self, node_id: &str) -> Option<NodeGuard<'_>> {
        if !self.nodes.lock().insert(node_id.to_string()) {
            return None;
        }
        Some(NodeGuard {
            gate: self,
            node_id: node_id.to_string(),
        })
    }

    fn streaming(&self) -> HashSet<String> {
        self.nodes.lock().clone()
    }
}

struct MainGuard<'a>(&'a GenerationGate);

impl Drop for MainGuard<'_> {
    fn drop(&mut self) {
        self.0.main.store(false, Ordering::Release);
    }
}

struct NodeGuard<'a> {
    gate: &'a GenerationGate,
    node_id: String,
}

impl Drop for NodeGuard<'_> {
    fn drop(&mut self) {
        self.gate.nodes.lock().remove(&self.node_id);
    }
}

/// Marks a node as being titled until the title task ends
struct TitleGuard {
    titling: Arc<Mutex<HashSet<String>>>,
    node_id: String,
}

impl TitleGuard {
    fn try_new(titling: &Arc<Mutex<HashSet<String>>>, node_id: &str) -> Option<Self> {
        if !titling.lock().insert(node_id.to_string()) {
            return None;
        }
        Some(Self {
            titling: Arc::clone(titling),
            node_id: node_id.to_string(),
        })
    }
}

impl Drop for TitleGuard {
    fn drop(&mut self) {
        self.titling.lock().remove(&self.node_id);
    }
}

// ============================================================================
// Send bookkeeping
// ============================================================================

/// Everything a send needs after the staging lock is released
struct Staged<'a> {
    kind: SendKind,
    session: u64,
    conversation_id: Option<String>,
    node_id: String,
    label: String,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
    focus_follow: bool,
    user_message: Message,
    history: Vec<(Role, String)>,
    /// Message count before the send
    prior_len: usize,
    pending_before: PendingBranch,
    current_before: Option<String>,
    _guard: NodeGuard<'a>,
}

/// The durable writes of one send. Kept and replayed when they fail under
/// [`PersistFailurePolicy::KeepUnsynced`].
#[derive(Debug, Clone)]
struct PersistPlan {
    session: u64,
    conversation_id: Option<String>,
    /// Present when these writes create the conversation
    new_conversation_title: Option<String>,
    node: Option<NewNode>,
    messages: Vec<NewMessage>,
    pointers: PointerUpdate,
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    workspace: SharedWorkspace,
    gateway: Arc<dyn PersistenceGateway>,
    completion: Arc<dyn CompletionService>,
    summarizer: Arc<dyn Summarizer>,
    config: EngineConfig,
    gate: GenerationGate,
    /// Nodes with a title task in flight
    titling: Arc<Mutex<HashSet<String>>>,
    /// Failed writes by node id, oldest first
    unsynced_writes: Mutex<Vec<(String, PersistPlan)>>,
}

impl Engine {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        completion: Arc<dyn CompletionService>,
        summarizer: Arc<dyn Summarizer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workspace: Workspace::new().shared(),
            gateway,
            completion,
            summarizer,
            config,
            gate: GenerationGate::default(),
            titling: Arc::default(),
            unsynced_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared handle to the live workspace
    pub fn workspace(&self) -> SharedWorkspace {
        Arc::clone(&self.workspace)
    }

    /// Copy of the current tree
    pub fn tree(&self) -> ConversationTree {
        self.workspace.lock().tree.clone()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.workspace.lock().conversation_id.clone()
    }

    pub fn layout(&self, config: &LayoutConfig) -> TreeLayout {
        compute_layout(&self.workspace.lock().tree, config)
    }

    /// Whether a main-path send is outstanding
    pub fn is_generating(&self) -> bool {
        self.gate.main.load(Ordering::Acquire)
    }

    pub fn is_generating_node(&self, node_id: &str) -> bool {
        self.gate.nodes.lock().contains(node_id)
    }

    /// Number of sends whose writes are waiting for a retry
    pub fn unsynced_count(&self) -> usize {
        self.unsynced_writes.lock().len()
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, EngineError> {
        Ok(self.gateway.list_conversations().await?)
    }

    /// Load a stored conversation into the workspace, focused where it was
    /// left (or on its root)
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<(), EngineError> {
        let header = self
            .gateway
            .list_conversations()
            .await?
            .into_iter()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| EngineError::ConversationNotFound(conversation_id.to_string()))?;
        let mut fresh = self.gateway.fetch_conversation_detail(conversation_id).await?;
        let unsynced = self.overlay_unsynced(conversation_id, &mut fresh);

        let mut tree = ConversationTree::new();
        let pinned = header.current_node_id.or(header.root_node_id);
        reconcile(&mut tree, fresh, pinned.as_deref(), &HashSet::new());

        let nodes = tree.len();
        let mut ws = self.workspace.lock();
        ws.load(conversation_id.to_string(), tree);
        ws.unsynced = unsynced;
        tracing::info!(
            conversation = %conversation_id,
            nodes,
            unsynced = ws.unsynced.len(),
            "opened conversation"
        );
        Ok(())
    }

    /// Apply the writes still queued for `conversation_id` to a fetched
    /// snapshot, so unsaved nodes keep their place and their labels stay
    /// taken. Returns the ids of the nodes touched.
    fn overlay_unsynced(
        &self,
        conversation_id: &str,
        fresh: &mut HashMap<String, Node>,
    ) -> HashSet<String> {
        let mut touched = HashSet::new();
        for (node_id, plan) in self.unsynced_writes.lock().iter() {
            if plan.conversation_id.as_deref() != Some(conversation_id) {
                continue;
            }

            if let Some(new) = plan.node.as_ref().filter(|_| !fresh.contains_key(node_id)) {
                let parent = match new.parent_id.as_deref() {
                    Some(pid) => match fresh.get_mut(pid) {
                        Some(parent) => Some(parent),
                        None => {
                            tracing::warn!(node = %node_id, parent = %pid, "queued node has no parent, skipping");
                            continue;
                        }
                    },
                    None => None,
                };
                if let Some(parent) = parent {
                    if !parent.children_ids.contains(node_id) {
                        parent.children_ids.push(node_id.clone());
                    }
                }

                let mut node = Node::new(node_id.as_str(), new.label.as_str(), new.parent_id.clone());
                node.is_branch = new.is_branch;
                node.title = new.title.clone();
                node.timestamp = new.created_at;
                fresh.insert(node_id.clone(), node);
            }

            let Some(node) = fresh.get_mut(node_id) else {
                continue;
            };
            for m in &plan.messages {
                if !node.messages.iter().any(|have| have.ordinal == m.ordinal) {
                    node.messages.push(Message {
                        role: m.role,
                        content: m.content.clone(),
                        timestamp: m.created_at,
                        ordinal: m.ordinal,
                    });
                }
            }
            node.messages.sort_by_key(|m| m.ordinal);
            touched.insert(node_id.clone());
        }
        touched
    }

    /// Start over with an empty workspace
    pub fn new_conversation(&self) {
        self.workspace.lock().reset();
    }

    pub fn select_node(&self, node_id: &str) -> Result<(), EngineError> {
        if self.workspace.lock().select_node(node_id) {
            Ok(())
        } else {
            Err(EngineError::NodeNotFound(node_id.to_string()))
        }
    }

    /// Make the next main-path send branch from `node_id`
    pub fn begin_branch(&self, node_id: &str) -> Result<(), EngineError> {
        if self.workspace.lock().begin_branch(node_id) {
            Ok(())
        } else {
            Err(EngineError::NodeNotFound(node_id.to_string()))
        }
    }

    pub fn cancel_branch(&self) {
        self.workspace.lock().cancel_branch();
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), EngineError> {
        self.gateway.delete_conversation(conversation_id).await?;
        self.unsynced_writes
            .lock()
            .retain(|(_, plan)| plan.conversation_id.as_deref() != Some(conversation_id));

        let mut ws = self.workspace.lock();
        if ws.is_active(Some(conversation_id)) {
            ws.reset();
        }
        tracing::info!(conversation = %conversation_id, "deleted conversation");
        Ok(())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Main-path send: continue the current node, branch from the pending
    /// node, or start a new conversation
    pub async fn send(
        &self,
        text: &str,
        attachments: Vec<Attachment>,
        options: SendOptions,
    ) -> Result<SendOutcome, SendError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(SendError::EmptyPrompt);
        }
        let _main = self.gate.try_main().ok_or(SendError::Busy)?;

        let focus_follow = options.focus_follow.unwrap_or(self.config.focus_follow);
        let staged = self.stage_main(text, focus_follow)?;
        self.complete(staged, text, attachments, options.model).await
    }

    /// Side chat: append to `node_id` without touching focus or the pending
    /// branch
    pub async fn send_into(
        &self,
        node_id: &str,
        text: &str,
        attachments: Vec<Attachment>,
        options: SendOptions,
    ) -> Result<SendOutcome, SendError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(SendError::EmptyPrompt);
        }
        let staged = {
            let mut ws = self.workspace.lock();
            self.stage_continue(&mut ws, node_id.to_string(), text, SendKind::SideChat)?
        };
        self.complete(staged, text, attachments, options.model).await
    }

    fn stage_main(&self, text: &str, focus_follow: bool) -> Result<Staged<'_>, SendError> {
        let mut ws = self.workspace.lock();

        if let Some(from) = ws.pending.branching_from_id.clone() {
            return self.stage_branch(&mut ws, from, text, focus_follow);
        }

        // A tree whose focus was cleared continues at its root
        let target = ws
            .tree
            .current_node_id
            .clone()
            .or_else(|| ws.tree.root_node_id.clone());
        match target {
            Some(target) => self.stage_continue(&mut ws, target, text, SendKind::Continue),
            None => self.stage_root(&mut ws, text),
        }
    }

    fn stage_root(&self, ws: &mut Workspace, text: &str) -> Result<Staged<'_>, SendError> {
        let node_id = Uuid::new_v4().to_string();
        let guard = self
            .gate
            .try_node(&node_id)
            .ok_or_else(|| SendError::NodeBusy(node_id.clone()))?;
        let label = label::label(None, 0);
        let node = Node::new(&node_id, &label, None);
        let created_at = node.timestamp;
        let user_message = Message::new(Role::User, text, 0);

        let pending_before = ws.pending.clone();
        let current_before = ws.tree.current_node_id.clone();
        ws.tree.insert_node(node, None);
        ws.tree.append_message(&node_id, user_message.clone());
        ws.tree.current_node_id = Some(node_id.clone());

        Ok(Staged {
            kind: SendKind::NewConversation,
            session: ws.session,
            conversation_id: ws.conversation_id.clone(),
            node_id,
            label,
            parent_id: None,
            created_at,
            focus_follow: true,
            user_message,
            history: Vec::new(),
            prior_len: 0,
            pending_before,
            current_before,
            _guard: guard,
        })
    }

    fn stage_branch(
        &self,
        ws: &mut Workspace,
        from: String,
        text: &str,
        focus_follow: bool,
    ) -> Result<Staged<'_>, SendError> {
        let Some(label) = ws.tree.next_child_label(Some(&from)) else {
            // Drop the cursor together with its missing origin
            ws.pending = PendingBranch::default();
            return Err(SendError::NodeNotFound(from));
        };
        let node_id = Uuid::new_v4().to_string();
        let guard = self
            .gate
            .try_node(&node_id)
            .ok_or_else(|| SendError::NodeBusy(node_id.clone()))?;
        let history = ws.tree.transcript(&from);
        let node = Node::new(&node_id, &label, Some(from.clone()));
        let created_at = node.timestamp;
        let user_message = Message::new(Role::User, text, 0);

        let pending_before = ws.pending.clone();
        let current_before = ws.tree.current_node_id.clone();
        ws.tree.insert_node(node, Some(&from));
        ws.tree.append_message(&node_id, user_message.clone());
        ws.pending = PendingBranch::default();
        if focus_follow {
            ws.tree.current_node_id = Some(node_id.clone());
        }

        Ok(Staged {
            kind: SendKind::Branch,
            session: ws.session,
            conversation_id: ws.conversation_id.clone(),
            node_id,
            label,
            parent_id: Some(from),
            created_at,
            focus_follow,
            user_message,
            history,
            prior_len: 0,
            pending_before,
            current_before,
            _guard: guard,
        })
    }

    fn stage_continue(
        &self,
        ws: &mut Workspace,
        target: String,
        text: &str,
        kind: SendKind,
    ) -> Result<Staged<'_>, SendError> {
        let Some(node) = ws.tree.get(&target) else {
            return Err(SendError::NodeNotFound(target));
        };
        let prior_len = node.messages.len();
        let ordinal = node
            .messages
            .iter()
            .map(|m| m.ordinal + 1)
            .max()
            .unwrap_or(0)
            .max(prior_len as u32);
        let label = node.hierarchical_id.clone();
        let parent_id = node.parent_id.clone();
        let created_at = node.timestamp;

        let guard = self
            .gate
            .try_node(&target)
            .ok_or_else(|| SendError::NodeBusy(target.clone()))?;
        let history = ws.tree.transcript(&target);
        let user_message = Message::new(Role::User, text, ordinal);
        ws.tree.append_message(&target, user_message.clone());

        Ok(Staged {
            kind,
            session: ws.session,
            conversation_id: ws.conversation_id.clone(),
            node_id: target,
            label,
            parent_id,
            created_at,
            focus_follow: false,
            user_message,
            history,
            prior_len,
            pending_before: ws.pending.clone(),
            current_before: ws.tree.current_node_id.clone(),
            _guard: guard,
        })
    }

    /// Steps after staging: generate, persist, rehydrate, title
    async fn complete(
        &self,
        staged: Staged<'_>,
        text: &str,
        attachments: Vec<Attachment>,
        model: Option<String>,
    ) -> Result<SendOutcome, SendError> {
        let model = model.unwrap_or_else(|| self.config.default_model.clone());
        tracing::info!(
            kind = ?staged.kind,
            node = %staged.node_id,
            label = %staged.label,
            model = %model,
            "sending"
        );

        let request = CompletionRequest {
            prompt: text.to_string(),
            history: staged.history.clone(),
            attachments,
            model: model.clone(),
        };
        let response = match self.generate(&staged, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(node = %staged.node_id, error = %e, "generation failed, rolling back");
                self.rollback(&staged);
                return Err(e);
            }
        };

        let mut plan = self.plan(&staged, &response);
        let conversation_id = match self.run_plan(&mut plan).await {
            Ok(id) => id,
            Err(e) => return Err(self.persist_failed(&staged, plan, e)),
        };

        self.rehydrate(&staged, &conversation_id).await;
        let title_task = self.spawn_title_task(&staged, &conversation_id, text, &response, &model);

        tracing::info!(
            conversation = %conversation_id,
            node = %staged.node_id,
            chars = response.len(),
            "send complete"
        );
        Ok(SendOutcome {
            kind: staged.kind,
            conversation_id,
            node_id: staged.node_id.clone(),
            label: staged.label.clone(),
            response,
            title_task,
        })
    }

    /// Stream the response into the staged node
    async fn generate(
        &self,
        staged: &Staged<'_>,
        request: CompletionRequest,
    ) -> Result<String, SendError> {
        let mut stream = self.completion.generate(request).await?;

        let model_ordinal = staged.user_message.ordinal + 1;
        self.with_session(staged.session, |ws| {
            ws.tree
                .append_message(&staged.node_id, Message::new(Role::Model, "", model_ordinal));
        });

        let mut text = String::new();
        let mut errors = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                CompletionEvent::Fragment(fragment) => {
                    text.push_str(&fragment);
                    tracing::debug!(node = %staged.node_id, len = text.len(), "fragment");
                    self.with_session(staged.session, |ws| {
                        ws.tree.patch_last_message_content(&staged.node_id, &text);
                    });
                }
                CompletionEvent::Error(message) => {
                    tracing::warn!(node = %staged.node_id, error = %message, "error in completion stream");
                    errors.push(message);
                }
            }
        }

        if text.is_empty() && !errors.is_empty() {
            return Err(SendError::Generation(errors.join("; ")));
        }
        Ok(text)
    }

    /// Undo the staged change. A send whose workspace moved on has nothing
    /// left to undo.
    fn rollback(&self, staged: &Staged<'_>) {
        let rolled_back = self.with_session(staged.session, |ws| {
            if staged.kind.creates_node() {
                ws.tree.remove_node(&staged.node_id);
                if staged.kind == SendKind::Branch && !ws.pending.is_set() {
                    ws.pending = staged.pending_before.clone();
                }
                if ws.tree.current_node_id.is_none() {
                    let restore = staged
                        .current_before
                        .clone()
                        .filter(|c| ws.tree.contains(c));
                    ws.tree.current_node_id = restore;
                }
            } else {
                ws.tree.truncate_messages(&staged.node_id, staged.prior_len);
            }
        });
        if rolled_back.is_some() {
            tracing::debug!(node = %staged.node_id, kind = ?staged.kind, "rolled back");
        }
    }

    fn plan(&self, staged: &Staged<'_>, response: &str) -> PersistPlan {
        let model_message = Message::new(Role::Model, response, staged.user_message.ordinal + 1);

        let node = staged.kind.creates_node().then(|| NewNode {
            id: Some(staged.node_id.clone()),
            conversation_id: staged.conversation_id.clone().unwrap_or_default(),
            parent_id: staged.parent_id.clone(),
            label: staged.label.clone(),
            is_branch: staged.kind == SendKind::Branch,
            title: TITLE_SENTINEL.to_string(),
            created_at: staged.created_at,
        });

        let pointers = match staged.kind {
            SendKind::NewConversation => PointerUpdate {
                root_node_id: Some(staged.node_id.clone()),
                current_node_id: Some(staged.node_id.clone()),
                title: None,
            },
            SendKind::Branch => PointerUpdate {
                current_node_id: self.pinned_current(staged),
                ..Default::default()
            },
            SendKind::Continue | SendKind::SideChat => PointerUpdate::default(),
        };

        PersistPlan {
            session: staged.session,
            conversation_id: staged.conversation_id.clone(),
            new_conversation_title: (staged.kind == SendKind::NewConversation)
                .then(|| self.config.new_conversation_title.clone()),
            node,
            messages: vec![
                NewMessage::from_message(&staged.node_id, &staged.user_message),
                NewMessage::from_message(&staged.node_id, &model_message),
            ],
            pointers,
        }
    }

    /// Where focus should be after this send
    fn pinned_current(&self, staged: &Staged<'_>) -> Option<String> {
        match staged.kind {
            SendKind::NewConversation | SendKind::Continue => Some(staged.node_id.clone()),
            SendKind::Branch if staged.focus_follow => Some(staged.node_id.clone()),
            SendKind::Branch | SendKind::SideChat => self
                .with_session(staged.session, |ws| ws.tree.current_node_id.clone())
                .flatten(),
        }
    }

    /// Execute the writes of a plan in order. Safe to repeat: node and
    /// message creation are idempotent.
    async fn run_plan(&self, plan: &mut PersistPlan) -> Result<String, GatewayError> {
        let conversation_id = match (&plan.conversation_id, &plan.new_conversation_title) {
            (Some(id), _) => id.clone(),
            (None, Some(title)) => {
                let id = self.gateway.create_conversation(title).await?;
                tracing::info!(conversation = %id, "created conversation");
                plan.conversation_id = Some(id.clone());
                self.with_session(plan.session, |ws| {
                    if ws.conversation_id.is_none() {
                        ws.conversation_id = Some(id.clone());
                    }
                });
                id
            }
            (None, None) => {
                // The conversation is created by an earlier send that has
                // not been saved yet
                let known = self
                    .with_session(plan.session, |ws| ws.conversation_id.clone())
                    .flatten()
                    .ok_or_else(|| {
                        GatewayError::Unavailable("conversation has not been saved yet".to_string())
                    })?;
                plan.conversation_id = Some(known.clone());
                known
            }
        };

        if let Some(node) = plan.node.as_mut() {
            node.conversation_id = conversation_id.clone();
            self.gateway.create_node(node.clone()).await?;
        }
        for message in &plan.messages {
            self.gateway.create_message(message.clone()).await?;
        }
        if !plan.pointers.is_empty() {
            self.gateway
                .update_conversation_pointers(&conversation_id, plan.pointers.clone())
                .await?;
        }
        Ok(conversation_id)
    }

    fn persist_failed(&self, staged: &Staged<'_>, plan: PersistPlan, error: GatewayError) -> SendError {
        match self.config.persist_failure {
            PersistFailurePolicy::Rollback => {
                tracing::warn!(node = %staged.node_id, error = %error, "save failed, rolling back");
                self.rollback(staged);
            }
            PersistFailurePolicy::KeepUnsynced if matches!(error, GatewayError::NotFound(_)) => {
                // The conversation or parent was deleted; a retry cannot succeed
                tracing::warn!(node = %staged.node_id, error = %error, "save target is gone, not queueing");
            }
            PersistFailurePolicy::KeepUnsynced => {
                tracing::warn!(node = %staged.node_id, error = %error, "save failed, keeping response as unsynced");
                self.with_session(staged.session, |ws| {
                    ws.unsynced.insert(staged.node_id.clone());
                });
                self.unsynced_writes
                    .lock()
                    .push((staged.node_id.clone(), plan));
            }
        }
        SendError::Persistence(error)
    }

    /// Replay writes that failed earlier. Returns how many sends are now
    /// saved; writes that fail again stay queued.
    pub async fn retry_unsynced(&self) -> Result<usize, EngineError> {
        let queued = std::mem::take(&mut *self.unsynced_writes.lock());
        let mut synced = 0;
        let mut first_error = None;
        let mut remaining = Vec::new();

        for (node_id, mut plan) in queued {
            match self.run_plan(&mut plan).await {
                Ok(conversation_id) => {
                    synced += 1;
                    self.with_session(plan.session, |ws| {
                        ws.unsynced.remove(&node_id);
                    });
                    tracing::info!(conversation = %conversation_id, node = %node_id, "unsynced send saved");
                }
                Err(GatewayError::NotFound(what)) => {
                    tracing::warn!(node = %node_id, missing = %what, "save target is gone, dropping queued send");
                    self.with_session(plan.session, |ws| {
                        ws.unsynced.remove(&node_id);
                    });
                }
                Err(e) => {
                    tracing::warn!(node = %node_id, error = %e, "retry failed");
                    remaining.push((node_id, plan));
                    first_error.get_or_insert(e);
                }
            }
        }

        if !remaining.is_empty() {
            let mut queue = self.unsynced_writes.lock();
            // Anything queued during the retry is newer
            remaining.append(&mut *queue);
            *queue = remaining;
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(synced),
        }
    }

    /// Fetch the stored conversation and merge it into the tree
    async fn rehydrate(&self, staged: &Staged<'_>, conversation_id: &str) {
        let fresh = match self.gateway.fetch_conversation_detail(conversation_id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, error = %e, "rehydration failed, keeping local state");
                return;
            }
        };

        let pinned = self.pinned_current(staged);
        let mut ws = self.workspace.lock();
        if ws.session != staged.session || !ws.is_active(Some(conversation_id)) {
            tracing::debug!(conversation = %conversation_id, "workspace moved on, skipping rehydration");
            return;
        }

        let mut preserve = self.gate.streaming();
        preserve.remove(&staged.node_id);
        preserve.extend(ws.unsynced.iter().cloned());

        let report = reconcile(&mut ws.tree, fresh, pinned.as_deref(), &preserve);
        if !report.dropped.is_empty() {
            tracing::warn!(dropped = ?report.dropped, "rehydration dropped unsaved nodes");
        }
    }

    fn spawn_title_task(
        &self,
        staged: &Staged<'_>,
        conversation_id: &str,
        prompt: &str,
        response: &str,
        model: &str,
    ) -> Option<JoinHandle<()>> {
        let needs_title = self
            .with_session(staged.session, |ws| {
                ws.tree
                    .get(&staged.node_id)
                    .map(|n| !n.has_title())
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !needs_title {
            return None;
        }
        // One title per node: a later send into a node still being titled
        // leaves it to the task already running
        let guard = TitleGuard::try_new(&self.titling, &staged.node_id)?;

        let workspace = Arc::clone(&self.workspace);
        let gateway = Arc::clone(&self.gateway);
        let summarizer = Arc::clone(&self.summarizer);
        let fallback = self.config.title_fallback.clone();
        let session = staged.session;
        let node_id = staged.node_id.clone();
        let conversation_id = conversation_id.to_string();
        let rename_conversation = staged.kind == SendKind::NewConversation;
        let prompt = prompt.to_string();
        let response = response.to_string();
        let model = model.to_string();

        Some(tokio::spawn(async move {
            let _guard = guard;
            let raw = match summarizer.summarize(&prompt, &response, &model).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(node = %node_id, error = %e, "title enrichment failed");
                    return;
                }
            };
            let title = sanitize_title(&raw, &prompt, &fallback);

            let already_titled = {
                let mut ws = workspace.lock();
                let untitled = ws
                    .tree
                    .get(&node_id)
                    .map(|n| !n.has_title())
                    .unwrap_or(false);
                if ws.session != session {
                    false
                } else if untitled {
                    ws.tree.patch_title(&node_id, &title);
                    false
                } else {
                    true
                }
            };
            if already_titled {
                tracing::debug!(node = %node_id, "node already titled, skipping");
                return;
            }

            if let Err(e) = gateway.update_node_title(&node_id, &title).await {
                tracing::warn!(node = %node_id, error = %e, "could not save title");
                return;
            }
            if rename_conversation {
                let update = PointerUpdate {
                    title: Some(title.clone()),
                    ..Default::default()
                };
                if let Err(e) = gateway.update_conversation_pointers(&conversation_id, update).await {
                    tracing::warn!(conversation = %conversation_id, error = %e, "could not save conversation title");
                }
            }
            tracing::debug!(node = %node_id, title = %title, "titled node");
        }))
    }

    /// Run `f` on the workspace if it is still on `session`
    fn with_session<R>(&self, session: u64, f: impl FnOnce(&mut Workspace) -> R) -> Option<R> {
        let mut ws = self.workspace.lock();
        if ws.session != session {
            return None;
        }
        Some(f(&mut *ws))
    }
}
