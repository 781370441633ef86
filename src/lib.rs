//! Ramify - Branching conversation trees for chat with language models
//!
//! Every prompt/response exchange lives in a node, and any node can be
//! branched from to explore an alternative line of conversation.
//!
//! # Overview
//!
//! Nodes carry hierarchical labels that encode their position:
//!
//! | Label | Meaning |
//! |-------|---------|
//! | `1` | The root of a conversation |
//! | `1.a` | First branch from the root |
//! | `1.b` | Second branch from the root |
//! | `1.a.1` | First branch from `1.a` |
//!
//! The [`Engine`] stages each send optimistically in the local tree,
//! streams the model response into it, saves it through a
//! [`PersistenceGateway`], and reconciles with what the store returns.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ramify::{Database, EchoCompletion, Engine, EngineConfig, HeuristicSummarizer, SendOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(
//!     Arc::new(Database::open()?),
//!     Arc::new(EchoCompletion),
//!     Arc::new(HeuristicSummarizer::default()),
//!     EngineConfig::default(),
//! );
//!
//! // Start a conversation
//! let root = engine.send("What is a B-tree?", Vec::new(), SendOptions::default()).await?;
//!
//! // Branch from the root
//! engine.begin_branch(&root.node_id)?;
//! let branch = engine.send("And an LSM tree?", Vec::new(), SendOptions::default()).await?;
//! assert_eq!(branch.label, "1.a");
//! # Ok(())
//! # }
//! ```

pub mod completion;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod export;
pub mod gateway;
pub mod label;
pub mod layout;
pub mod reconcile;
pub mod schema;
pub mod tree;
pub mod workspace;

pub use completion::{
    Attachment, CompletionEvent, CompletionRequest, CompletionService, CompletionSummarizer,
    EchoCompletion, HeuristicSummarizer, Summarizer,
};
pub use config::{Config, EngineConfig, PersistFailurePolicy};
pub use db::{Database, DbError, CURRENT_SCHEMA};
pub use engine::{Engine, SendKind, SendOptions, SendOutcome};
pub use error::{CompletionError, EngineError, GatewayError, SendError};
pub use export::{subtree, tree_to_dot, tree_to_json, DotConfig};
pub use gateway::{ConversationSummary, MemoryGateway, PersistenceGateway};
pub use layout::{compute_layout, LayoutConfig, TreeLayout};
pub use reconcile::reconcile;
pub use tree::{ConversationTree, Message, Node, PendingBranch, Role};
pub use workspace::{SharedWorkspace, Workspace};
