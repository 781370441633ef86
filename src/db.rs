//! SQLite database with Diesel ORM
//!
//! Durable store for conversation trees. Implements [`PersistenceGateway`]
//! so the engine can run against it directly.

use crate::error::GatewayError;
use crate::gateway::{
    assemble_nodes, ConversationSummary, MessageRecord, NewMessage, NewNode, NodeRecord,
    PersistenceGateway, PointerUpdate,
};
use crate::schema::*;
use crate::tree::{Node, Role};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Walk up directory tree to find .ramify folder (like git finds .git)
/// Can be overridden with RAMIFY_DB_PATH env var
fn get_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("RAMIFY_DB_PATH") {
        return PathBuf::from(path);
    }

    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let ramify_dir = dir.join(".ramify");
            if ramify_dir.is_dir() {
                return ramify_dir.join("ramify.db");
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    PathBuf::from(".ramify/ramify.db")
}

/// Current schema version for ramify
pub const CURRENT_SCHEMA: StoreSchema = StoreSchema {
    major: 1,
    minor: 0,
    patch: 0,
    name: "conversation-tree",
    features: &["conversations", "nodes", "messages", "client_node_ids"],
};

/// Describes the version and capabilities of the schema
#[derive(Debug, Clone)]
pub struct StoreSchema {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub name: &'static str,
    pub features: &'static [&'static str],
}

impl StoreSchema {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::fmt::Display for StoreSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} ({})", self.version_string(), self.name)
    }
}

// ============================================================================
// Diesel Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = schema_versions)]
struct NewSchemaVersion<'a> {
    version: &'a str,
    name: &'a str,
    features: &'a str,
    introduced_at: &'a str,
}

/// Insertable conversation
#[derive(Insertable)]
#[diesel(table_name = conversations)]
struct NewConversationRow<'a> {
    id: &'a str,
    title: &'a str,
    root_node_id: Option<&'a str>,
    current_node_id: Option<&'a str>,
    created_at: &'a str,
    updated_at: &'a str,
}

/// Queryable conversation
#[derive(Queryable, Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub title: String,
    pub root_node_id: Option<String>,
    pub current_node_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial conversation update; `None` fields are skipped
#[derive(AsChangeset)]
#[diesel(table_name = conversations)]
struct ConversationChanges<'a> {
    title: Option<&'a str>,
    root_node_id: Option<&'a str>,
    current_node_id: Option<&'a str>,
    updated_at: &'a str,
}

/// Insertable node
#[derive(Insertable)]
#[diesel(table_name = nodes)]
struct NewNodeRow<'a> {
    id: &'a str,
    conversation_id: &'a str,
    parent_id: Option<&'a str>,
    hierarchical_id: &'a str,
    is_branch: bool,
    title: &'a str,
    created_at: &'a str,
}

/// Queryable node
#[derive(Queryable, Debug, Clone)]
pub struct NodeRow {
    pub seq: i32,
    pub id: String,
    pub conversation_id: String,
    pub parent_id: Option<String>,
    pub hierarchical_id: String,
    pub is_branch: bool,
    pub title: String,
    pub created_at: String,
}

/// Insertable message
#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewMessageRow<'a> {
    node_id: &'a str,
    role: &'a str,
    content: &'a str,
    ordinal: i32,
    created_at: &'a str,
}

/// Queryable message
#[derive(Queryable, Debug, Clone)]
pub struct MessageRow {
    pub id: i32,
    pub node_id: String,
    pub role: String,
    pub content: String,
    pub ordinal: i32,
    pub created_at: String,
}

// ============================================================================
// Row conversion
// ============================================================================

fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed width so text ordering matches time ordering
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DbError::Validation(format!("bad timestamp '{}': {}", s, e)))
}

impl ConversationRow {
    fn into_summary(self) -> Result<ConversationSummary> {
        Ok(ConversationSummary {
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            title: self.title,
            root_node_id: self.root_node_id,
            current_node_id: self.current_node_id,
        })
    }
}

impl NodeRow {
    fn into_record(self) -> Result<NodeRecord> {
        Ok(NodeRecord {
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            parent_id: self.parent_id,
            label: self.hierarchical_id,
            is_branch: self.is_branch,
            title: Some(self.title),
        })
    }
}

impl MessageRow {
    fn into_record(self) -> Result<MessageRecord> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| DbError::Validation(format!("unknown role '{}'", self.role)))?;
        let ordinal = u32::try_from(self.ordinal)
            .map_err(|_| DbError::Validation(format!("negative ordinal {}", self.ordinal)))?;
        Ok(MessageRecord {
            created_at: parse_ts(&self.created_at)?,
            node_id: self.node_id,
            role,
            content: self.content,
            ordinal,
        })
    }
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
}

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::Error),

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl Database {
    /// Get the database path that will be used
    pub fn db_path() -> PathBuf {
        get_db_path()
    }

    /// Open database at default path (respects RAMIFY_DB_PATH env var)
    pub fn open() -> Result<Self> {
        let path = get_db_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbError::Connection(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        Self::open_at(&path)
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        tracing::debug!(path = %path_str, schema = %CURRENT_SCHEMA, "opened database");
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                version TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                features TEXT NOT NULL,
                introduced_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY NOT NULL,
                title TEXT NOT NULL,
                root_node_id TEXT,
                current_node_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS nodes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                parent_id TEXT,
                hierarchical_id TEXT NOT NULL,
                is_branch BOOLEAN NOT NULL DEFAULT 0,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                node_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (node_id) REFERENCES nodes(id),
                UNIQUE(node_id, ordinal)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_nodes_conversation ON nodes(conversation_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_messages_node ON messages(node_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at)").execute(&mut conn)?;

        self.register_schema(&CURRENT_SCHEMA)?;
        Ok(())
    }

    fn register_schema(&self, schema: &StoreSchema) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = format_ts(Utc::now());
        let features_json = serde_json::to_string(&schema.features)
            .map_err(|e| DbError::Validation(e.to_string()))?;

        let new_schema = NewSchemaVersion {
            version: &schema.version_string(),
            name: schema.name,
            features: &features_json,
            introduced_at: &now,
        };

        diesel::insert_or_ignore_into(schema_versions::table)
            .values(&new_schema)
            .execute(&mut conn)?;

        Ok(())
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// All conversations, most recently updated first
    pub fn get_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let mut conn = self.get_conn()?;
        conversations::table
            .order(conversations::updated_at.desc())
            .load::<ConversationRow>(&mut conn)?
            .into_iter()
            .map(ConversationRow::into_summary)
            .collect()
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<ConversationSummary> {
        let mut conn = self.get_conn()?;
        conversations::table
            .filter(conversations::id.eq(conversation_id))
            .first::<ConversationRow>(&mut conn)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("conversation {}", conversation_id)))?
            .into_summary()
    }

    pub fn insert_conversation(&self, title: &str) -> Result<String> {
        let mut conn = self.get_conn()?;
        let id = Uuid::new_v4().to_string();
        let now = format_ts(Utc::now());

        diesel::insert_into(conversations::table)
            .values(&NewConversationRow {
                id: &id,
                title,
                root_node_id: None,
                current_node_id: None,
                created_at: &now,
                updated_at: &now,
            })
            .execute(&mut conn)?;

        Ok(id)
    }

    pub fn update_conversation(&self, conversation_id: &str, update: &PointerUpdate) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = format_ts(Utc::now());

        let changed = diesel::update(conversations::table.filter(conversations::id.eq(conversation_id)))
            .set(&ConversationChanges {
                title: update.title.as_deref(),
                root_node_id: update.root_node_id.as_deref(),
                current_node_id: update.current_node_id.as_deref(),
                updated_at: &now,
            })
            .execute(&mut conn)?;

        if changed == 0 {
            return Err(DbError::NotFound(format!("conversation {}", conversation_id)));
        }
        Ok(())
    }

    /// Remove a conversation with all of its nodes and messages
    pub fn remove_conversation(&self, conversation_id: &str) -> Result<()> {
        let mut conn = self.get_conn()?;

        conn.transaction::<_, DbError, _>(|conn| {
            let node_ids = nodes::table
                .filter(nodes::conversation_id.eq(conversation_id))
                .select(nodes::id);
            diesel::delete(messages::table.filter(messages::node_id.eq_any(node_ids)))
                .execute(conn)?;
            diesel::delete(nodes::table.filter(nodes::conversation_id.eq(conversation_id)))
                .execute(conn)?;
            diesel::delete(conversations::table.filter(conversations::id.eq(conversation_id)))
                .execute(conn)?;
            Ok(())
        })
    }

    // ========================================================================
    // Nodes and messages
    // ========================================================================

    /// Insert a node; an id that already exists is left as it is
    pub fn insert_node(&self, node: &NewNode) -> Result<String> {
        let mut conn = self.get_conn()?;

        let conversation_exists: i64 = conversations::table
            .filter(conversations::id.eq(&node.conversation_id))
            .count()
            .get_result(&mut conn)?;
        if conversation_exists == 0 {
            return Err(DbError::NotFound(format!("conversation {}", node.conversation_id)));
        }

        let id = node
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let created_at = format_ts(node.created_at);

        let inserted = diesel::insert_or_ignore_into(nodes::table)
            .values(&NewNodeRow {
                id: &id,
                conversation_id: &node.conversation_id,
                parent_id: node.parent_id.as_deref(),
                hierarchical_id: &node.label,
                is_branch: node.is_branch,
                title: &node.title,
                created_at: &created_at,
            })
            .execute(&mut conn)?;
        if inserted == 0 {
            tracing::debug!(node = %id, "node already stored");
        }

        Ok(id)
    }

    /// Insert a message; a repeated `(node_id, ordinal)` is ignored
    pub fn insert_message(&self, message: &NewMessage) -> Result<()> {
        let mut conn = self.get_conn()?;

        let node_exists: i64 = nodes::table
            .filter(nodes::id.eq(&message.node_id))
            .count()
            .get_result(&mut conn)?;
        if node_exists == 0 {
            return Err(DbError::NotFound(format!("node {}", message.node_id)));
        }

        let ordinal = i32::try_from(message.ordinal)
            .map_err(|_| DbError::Validation(format!("ordinal {} out of range", message.ordinal)))?;
        let created_at = format_ts(message.created_at);

        diesel::insert_or_ignore_into(messages::table)
            .values(&NewMessageRow {
                node_id: &message.node_id,
                role: message.role.as_str(),
                content: &message.content,
                ordinal,
                created_at: &created_at,
            })
            .execute(&mut conn)?;

        Ok(())
    }

    pub fn set_node_title(&self, node_id: &str, title: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        let changed = diesel::update(nodes::table.filter(nodes::id.eq(node_id)))
            .set(nodes::title.eq(title))
            .execute(&mut conn)?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("node {}", node_id)));
        }
        Ok(())
    }

    /// Every node of a conversation with messages and children attached
    pub fn get_conversation_nodes(&self, conversation_id: &str) -> Result<HashMap<String, Node>> {
        // Fails with NotFound for unknown conversations
        self.get_conversation(conversation_id)?;

        let mut conn = self.get_conn()?;
        let records = nodes::table
            .filter(nodes::conversation_id.eq(conversation_id))
            .order(nodes::seq.asc())
            .load::<NodeRow>(&mut conn)?
            .into_iter()
            .map(NodeRow::into_record)
            .collect::<Result<Vec<_>>>()?;

        let node_ids = nodes::table
            .filter(nodes::conversation_id.eq(conversation_id))
            .select(nodes::id);
        let messages = messages::table
            .filter(messages::node_id.eq_any(node_ids))
            .order((messages::node_id.asc(), messages::ordinal.asc()))
            .load::<MessageRow>(&mut conn)?
            .into_iter()
            .map(MessageRow::into_record)
            .collect::<Result<Vec<_>>>()?;

        Ok(assemble_nodes(records, messages))
    }
}

#[async_trait]
impl PersistenceGateway for Database {
    async fn list_conversations(&self) -> std::result::Result<Vec<ConversationSummary>, GatewayError> {
        Ok(self.get_conversations()?)
    }

    async fn fetch_conversation_detail(
        &self,
        conversation_id: &str,
    ) -> std::result::Result<HashMap<String, Node>, GatewayError> {
        Ok(self.get_conversation_nodes(conversation_id)?)
    }

    async fn create_conversation(&self, title: &str) -> std::result::Result<String, GatewayError> {
        Ok(self.insert_conversation(title)?)
    }

    async fn create_node(&self, node: NewNode) -> std::result::Result<String, GatewayError> {
        Ok(self.insert_node(&node)?)
    }

    async fn create_message(&self, message: NewMessage) -> std::result::Result<(), GatewayError> {
        Ok(self.insert_message(&message)?)
    }

    async fn update_conversation_pointers(
        &self,
        conversation_id: &str,
        update: PointerUpdate,
    ) -> std::result::Result<(), GatewayError> {
        Ok(self.update_conversation(conversation_id, &update)?)
    }

    async fn update_node_title(
        &self,
        node_id: &str,
        title: &str,
    ) -> std::result::Result<(), GatewayError> {
        Ok(self.set_node_title(node_id, title)?)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> std::result::Result<(), GatewayError> {
        Ok(self.remove_conversation(conversation_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TITLE_SENTINEL;
    use tempfile::TempDir;

    fn open() -> (TempDir, Database) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::open_at(dir.path().join("test.db")).expect("Failed to open db");
        (dir, db)
    }

    fn new_node(conv: &str, id: &str, parent: Option<&str>, label: &str) -> NewNode {
        NewNode {
            id: Some(id.to_string()),
            conversation_id: conv.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            label: label.to_string(),
            is_branch: parent.is_some(),
            title: TITLE_SENTINEL.to_string(),
            created_at: Utc::now(),
        }
    }

    fn new_message(node: &str, role: Role, content: &str, ordinal: u32) -> NewMessage {
        NewMessage {
            node_id: node.to_string(),
            role,
            content: content.to_string(),
            ordinal,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let conv = Database::open_at(&path).unwrap().insert_conversation("t").unwrap();
        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.get_conversation(&conv).unwrap().title, "t");
    }

    #[tokio::test]
    async fn test_round_trip_through_gateway() {
        let (_dir, db) = open();
        let conv = db.create_conversation("New Discussion").await.unwrap();
        db.create_node(new_node(&conv, "r", None, "1")).await.unwrap();
        db.create_node(new_node(&conv, "b1", Some("r"), "1.a")).await.unwrap();
        db.create_node(new_node(&conv, "b2", Some("r"), "1.b")).await.unwrap();
        db.create_message(new_message("r", Role::User, "hi", 0)).await.unwrap();
        db.create_message(new_message("r", Role::Model, "hello", 1)).await.unwrap();

        let nodes = db.fetch_conversation_detail(&conv).await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes["r"].children_ids, vec!["b1", "b2"]);
        assert_eq!(nodes["r"].messages[1].role, Role::Model);
        assert_eq!(nodes["b2"].hierarchical_id, "1.b");
        assert!(nodes["b1"].is_branch);
        assert!(!nodes["r"].is_branch);
    }

    #[tokio::test]
    async fn test_writes_are_idempotent() {
        let (_dir, db) = open();
        let conv = db.create_conversation("t").await.unwrap();
        db.create_node(new_node(&conv, "r", None, "1")).await.unwrap();
        db.create_node(new_node(&conv, "r", None, "1")).await.unwrap();
        db.create_message(new_message("r", Role::User, "first", 0)).await.unwrap();
        db.create_message(new_message("r", Role::User, "replayed", 0)).await.unwrap();

        let nodes = db.fetch_conversation_detail(&conv).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes["r"].messages.len(), 1);
        assert_eq!(nodes["r"].messages[0].content, "first");
    }

    #[tokio::test]
    async fn test_missing_references_are_not_found() {
        let (_dir, db) = open();
        let err = db.create_node(new_node("nope", "r", None, "1")).await;
        assert!(matches!(err, Err(GatewayError::NotFound(_))));
        let err = db.create_message(new_message("nope", Role::User, "x", 0)).await;
        assert!(matches!(err, Err(GatewayError::NotFound(_))));
        let err = db.fetch_conversation_detail("nope").await;
        assert!(matches!(err, Err(GatewayError::NotFound(_))));
        let err = db.update_node_title("nope", "Title").await;
        assert!(matches!(err, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_pointer_update_leaves_unset_fields() {
        let (_dir, db) = open();
        let conv = db.create_conversation("t").await.unwrap();
        db.update_conversation_pointers(
            &conv,
            PointerUpdate {
                root_node_id: Some("r".to_string()),
                current_node_id: Some("r".to_string()),
                title: None,
            },
        )
        .await
        .unwrap();
        db.update_conversation_pointers(
            &conv,
            PointerUpdate {
                current_node_id: Some("x".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let summary = db.get_conversation(&conv).unwrap();
        assert_eq!(summary.root_node_id.as_deref(), Some("r"));
        assert_eq!(summary.current_node_id.as_deref(), Some("x"));
        assert_eq!(summary.title, "t");
    }

    #[tokio::test]
    async fn test_list_orders_by_recent_update() {
        let (_dir, db) = open();
        let older = db.create_conversation("older").await.unwrap();
        let newer = db.create_conversation("newer").await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.update_conversation_pointers(
            &older,
            PointerUpdate {
                title: Some("touched".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let list = db.list_conversations().await.unwrap();
        assert_eq!(list[0].id, older);
        assert_eq!(list[0].title, "touched");
        assert_eq!(list[1].id, newer);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (_dir, db) = open();
        let keep = db.create_conversation("keep").await.unwrap();
        let drop = db.create_conversation("drop").await.unwrap();
        db.create_node(new_node(&keep, "k", None, "1")).await.unwrap();
        db.create_node(new_node(&drop, "d", None, "1")).await.unwrap();
        db.create_message(new_message("d", Role::User, "bye", 0)).await.unwrap();

        db.delete_conversation(&drop).await.unwrap();
        assert!(db.fetch_conversation_detail(&drop).await.is_err());
        assert_eq!(db.fetch_conversation_detail(&keep).await.unwrap().len(), 1);
        // The deleted node id is free again
        db.create_node(new_node(&keep, "d", Some("k"), "1.a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_title_update() {
        let (_dir, db) = open();
        let conv = db.create_conversation("t").await.unwrap();
        db.create_node(new_node(&conv, "r", None, "1")).await.unwrap();
        db.update_node_title("r", "Borrowing rules").await.unwrap();
        let nodes = db.fetch_conversation_detail(&conv).await.unwrap();
        assert_eq!(nodes["r"].title, "Borrowing rules");
    }
}
