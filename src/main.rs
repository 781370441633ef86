use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ramify::export::{subtree, traversal_order, tree_to_dot, tree_to_json, DotConfig};
use ramify::{
    Attachment, Config, ConversationSummary, ConversationTree, Database, DbError, EchoCompletion,
    Engine, EngineError, HeuristicSummarizer, Role, SendError, SendKind, SendOptions,
};

#[derive(Parser, Debug)]
#[command(name = "ramify")]
#[command(author, version, about = "Branching conversation trees for chat with language models")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored conversations, most recently updated first
    Conversations,

    /// Print the node tree of a conversation
    Show {
        /// Conversation id (or a unique prefix of it)
        conversation: String,

        /// Print the transcript from the root to the current node instead
        #[arg(long)]
        path: bool,
    },

    /// Send a message and print the response
    Send {
        /// Conversation to continue; a new one is started when omitted
        #[arg(short, long)]
        conversation: Option<String>,

        /// Branch from the node with this label
        #[arg(long, value_name = "LABEL", requires = "conversation", conflicts_with = "into")]
        branch_from: Option<String>,

        /// Append to the node with this label without moving focus
        #[arg(long, value_name = "LABEL", requires = "conversation")]
        into: Option<String>,

        /// Focus the new branch after sending
        #[arg(long)]
        focus: bool,

        /// Model name (default from config)
        #[arg(short, long)]
        model: Option<String>,

        /// Files to attach
        #[arg(long, value_name = "FILE")]
        attach: Vec<PathBuf>,

        /// Message text
        text: String,
    },

    /// Print the computed tree layout as JSON
    Layout {
        /// Conversation id (or a unique prefix of it)
        conversation: String,
    },

    /// Export a conversation tree
    Export {
        /// Conversation id (or a unique prefix of it)
        conversation: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "dot")]
        format: ExportFormat,

        /// Only export the subtree under this label
        #[arg(long, value_name = "LABEL")]
        from: Option<String>,
    },

    /// Delete a conversation with all of its nodes and messages
    Delete {
        /// Conversation id (or a unique prefix of it)
        conversation: String,
    },

    /// Generate shell completion scripts
    ///
    /// Examples:
    ///   ramify completion zsh > ~/.zfunc/_ramify
    ///   ramify completion bash >> ~/.bashrc
    ///   ramify completion fish > ~/.config/fish/completions/ramify.fish
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    Dot,
    Json,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("no conversation matches '{0}'")]
    ConversationNotFound(String),

    #[error("'{0}' matches {1} conversations, use a longer prefix")]
    AmbiguousConversation(String, usize),

    #[error("no node labelled '{0}'")]
    LabelNotFound(String),

    #[error("cannot read attachment {path}: {source}")]
    Attachment {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("RAMIFY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();
    let args = Args::parse();

    if let Err(e) = run(args.command).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), CliError> {
    if let Command::Completion { shell } = command {
        clap_complete::generate(shell, &mut Args::command(), "ramify", &mut io::stdout());
        return Ok(());
    }

    let config = Config::load();
    let engine = Engine::new(
        Arc::new(Database::open()?),
        Arc::new(EchoCompletion),
        Arc::new(HeuristicSummarizer::default()),
        config.engine.clone(),
    );

    match command {
        Command::Conversations => {
            let list = engine.list_conversations().await?;
            if list.is_empty() {
                println!("No conversations yet. Start one with: ramify send \"...\"");
                return Ok(());
            }
            for c in list {
                println!(
                    "{}  {}  {}",
                    short_id(&c.id).cyan(),
                    c.updated_at.format("%Y-%m-%d %H:%M"),
                    c.title.bold()
                );
            }
        }

        Command::Show { conversation, path } => {
            let summary = open(&engine, &conversation).await?;
            let tree = engine.tree();
            println!("{} {}", summary.title.bold(), format!("({})", summary.id).dimmed());
            if path {
                print_transcript(&tree);
            } else {
                print_tree(&tree);
            }
        }

        Command::Send {
            conversation,
            branch_from,
            into,
            focus,
            model,
            attach,
            text,
        } => {
            if let Some(conversation) = conversation {
                open(&engine, &conversation).await?;
            }
            let attachments = attach
                .iter()
                .map(|p| read_attachment(p))
                .collect::<Result<Vec<_>, _>>()?;
            let options = SendOptions {
                focus_follow: focus.then_some(true),
                model,
            };

            let outcome = match (branch_from, into) {
                (Some(label), _) => {
                    let node_id = node_by_label(&engine.tree(), &label)?;
                    engine.begin_branch(&node_id)?;
                    engine.send(&text, attachments, options).await?
                }
                (None, Some(label)) => {
                    let node_id = node_by_label(&engine.tree(), &label)?;
                    engine.send_into(&node_id, &text, attachments, options).await?
                }
                (None, None) => engine.send(&text, attachments, options).await?,
            };

            let what = match outcome.kind {
                SendKind::NewConversation => "new conversation",
                SendKind::Continue => "continued",
                SendKind::Branch => "new branch",
                SendKind::SideChat => "side chat",
            };
            println!(
                "{} {} {}",
                "Sent".green(),
                outcome.label.cyan().bold(),
                format!("({})", what).dimmed()
            );
            println!("conversation {}", outcome.conversation_id);
            println!();
            println!("{}", outcome.response);

            if let Some(task) = outcome.title_task {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "title task did not finish");
                }
            }
        }

        Command::Layout { conversation } => {
            open(&engine, &conversation).await?;
            let layout = engine.layout(&config.layout);
            println!("{}", serde_json::to_string_pretty(&layout)?);
        }

        Command::Export {
            conversation,
            format,
            from,
        } => {
            let summary = open(&engine, &conversation).await?;
            let mut tree = engine.tree();
            if let Some(label) = from {
                let node_id = node_by_label(&tree, &label)?;
                tree = subtree(&tree, &node_id).ok_or(CliError::LabelNotFound(label))?;
            }
            match format {
                ExportFormat::Dot => {
                    let dot_config = DotConfig {
                        title: Some(summary.title),
                        ..Default::default()
                    };
                    print!("{}", tree_to_dot(&tree, &dot_config));
                }
                ExportFormat::Json => {
                    println!("{}", tree_to_json(&tree, Some(&summary.id), &config.layout)?);
                }
            }
        }

        Command::Delete { conversation } => {
            let summary = resolve(&engine, &conversation).await?;
            engine.delete_conversation(&summary.id).await?;
            println!("{} {}", "Deleted".green(), summary.title);
        }

        Command::Completion { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Find a conversation by id or unique id prefix
async fn resolve(engine: &Engine, query: &str) -> Result<ConversationSummary, CliError> {
    let list = engine.list_conversations().await?;
    if let Some(exact) = list.iter().find(|c| c.id == query) {
        return Ok(exact.clone());
    }

    let mut matches: Vec<ConversationSummary> =
        list.into_iter().filter(|c| c.id.starts_with(query)).collect();
    match matches.len() {
        0 => Err(CliError::ConversationNotFound(query.to_string())),
        1 => Ok(matches.remove(0)),
        n => Err(CliError::AmbiguousConversation(query.to_string(), n)),
    }
}

async fn open(engine: &Engine, query: &str) -> Result<ConversationSummary, CliError> {
    let summary = resolve(engine, query).await?;
    engine.open_conversation(&summary.id).await?;
    Ok(summary)
}

fn node_by_label(tree: &ConversationTree, label: &str) -> Result<String, CliError> {
    tree.find_by_label(label)
        .map(|n| n.id.clone())
        .ok_or_else(|| CliError::LabelNotFound(label.to_string()))
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_tree(tree: &ConversationTree) {
    let current = tree.current_node_id.as_deref();
    for node in traversal_order(tree) {
        let marker = if current == Some(node.id.as_str()) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        let title = if node.has_title() {
            node.title.as_str()
        } else {
            ""
        };
        println!(
            "{} {}{} {} {}",
            marker,
            "  ".repeat(node.depth()),
            node.hierarchical_id.cyan().bold(),
            title,
            format!("[{} messages]", node.messages.len()).dimmed()
        );
    }
}

fn print_transcript(tree: &ConversationTree) {
    for message in tree.active_messages() {
        let who = match message.role {
            Role::User => "user".yellow().bold(),
            Role::Model => "model".green().bold(),
        };
        println!("{}: {}", who, message.content);
    }
}

fn read_attachment(path: &Path) -> Result<Attachment, CliError> {
    let data = std::fs::read(path).map_err(|source| CliError::Attachment {
        path: path.display().to_string(),
        source,
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let mime_type = match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt") | Some("md") => "text/plain",
        _ => "application/octet-stream",
    };
    Ok(Attachment {
        name,
        mime_type: mime_type.to_string(),
        data,
    })
}
