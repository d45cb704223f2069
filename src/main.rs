// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{IsTerminal, Read, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use lace_core::{
    coordination_registry, strategy_from_config, ActivityLog, Agent, AgentEvent, DelegateTool,
    MessageQueue, SessionManager, TokenBudget,
};
use lace_store::{AgentKind, Database, ThreadStore};
use lace_tools::{ApproveAll, ToolExecutor};

const SYSTEM_PROMPT: &str = "\
You are Lace, a multi-agent coding assistant. Coordinate work through the \
task tools: create tasks for follow-up work, note progress on tasks you \
are working on, and delegate isolated sub-tasks to ephemeral agents when \
that keeps your own context focused.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = lace_config::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.store.db_path = Some(db.clone());
    }
    let config = Arc::new(config);

    let db = Arc::new(Database::open(&config.store.resolved_db_path())?);
    let store = Arc::new(ThreadStore::new(Arc::clone(&db)));
    let activity = ActivityLog::new();
    let manager = Arc::new(SessionManager::new(Arc::clone(&store), activity.clone()));

    match &cli.command {
        Some(Commands::Sessions) => {
            for (id, name) in manager.list_sessions()? {
                println!("{id}  {name}");
            }
            Ok(())
        }
        Some(Commands::Tasks { session }) => {
            let session = manager.open(session)?;
            for task in db.list_session_tasks(&session.id)? {
                println!(
                    "{}  [{}|{}]  {}  (assigned: {})",
                    task.id,
                    task.status.as_str(),
                    task.priority.as_str(),
                    task.title,
                    task.assigned_to.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        Some(Commands::Agents { session, all }) => {
            let session = manager.open(session)?;
            for agent in manager.list_agents(&session.id, *all)? {
                println!(
                    "{}  {}  [{}|{}]  {}/{}",
                    agent.id,
                    agent.name,
                    agent.kind.as_str(),
                    agent.state.as_str(),
                    agent.provider,
                    agent.model,
                );
            }
            Ok(())
        }
        None => run_one_turn(&cli, config, db, store, activity, manager).await,
    }
}

async fn run_one_turn(
    cli: &Cli,
    config: Arc<lace_config::Config>,
    db: Arc<Database>,
    store: Arc<ThreadStore>,
    activity: ActivityLog,
    manager: Arc<SessionManager>,
) -> anyhow::Result<()> {
    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None => {
            if std::io::stdin().is_terminal() {
                anyhow::bail!("no prompt given; pass one as an argument or pipe it on stdin");
            }
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            buf.trim().to_string()
        }
    };
    if prompt.is_empty() {
        anyhow::bail!("empty prompt");
    }

    let provider = lace_model::from_config(&config.model)?;
    let session = manager.open(&cli.session)?;

    // Tasks assigned to `new:<provider>/<model>` get their agents first.
    manager.resolve_new_assignees(&session.id)?;

    let meta = match manager
        .list_agents(&session.id, false)?
        .into_iter()
        .find(|a| a.name == cli.agent)
    {
        Some(meta) => meta,
        None => manager.add_agent(
            &session.id,
            &cli.agent,
            AgentKind::Persistent,
            provider.name(),
            provider.model_name(),
        )?,
    };
    manager.set_active_agent(&session.id, &meta.id)?;

    // Persistent agents get the full toolset, including delegation.
    let mut registry = coordination_registry(Arc::clone(&db));
    registry.register(DelegateTool {
        session_id: session.id.clone(),
        manager: Arc::clone(&manager),
        provider: Arc::clone(&provider),
        config: Arc::clone(&config),
        approval: Some(Arc::new(ApproveAll)),
    });

    let (exec_tx, exec_rx) = mpsc::unbounded_channel();
    let executor = ToolExecutor::new(Arc::new(registry), &config.executor)
        .with_approval(Arc::new(ApproveAll))
        .with_events(exec_tx);

    let queue = Arc::new(MessageQueue::new(
        config.queue.capacity,
        &meta.id,
        activity.clone(),
    ));
    let mut agent = Agent::new(
        &meta.name,
        &session.id,
        &meta.id,
        store,
        provider,
        Arc::new(executor),
        exec_rx,
        TokenBudget::new(config.model.context_window, &config.budget),
        strategy_from_config(&config.compaction),
        queue,
        activity,
        Arc::new(config.agent.clone()),
        config.compaction.keep_shadows,
    )?
    .with_system_prompt(SYSTEM_PROMPT);

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TokenDelta(t) => {
                    let _ = write!(stdout, "{t}");
                    let _ = stdout.flush();
                }
                AgentEvent::MessageComplete(_) => {
                    let _ = writeln!(stdout);
                }
                AgentEvent::ToolCallStarted {
                    tool_name, call_id, ..
                } => {
                    eprintln!("[tool] {tool_name} ({call_id})");
                }
                AgentEvent::ToolCallFinished {
                    tool_name,
                    is_error,
                    ..
                } => {
                    if is_error {
                        eprintln!("[tool] {tool_name} failed");
                    }
                }
                AgentEvent::Error(e) => eprintln!("[error] {e}"),
                _ => {}
            }
        }
    });

    let result = agent.submit(&prompt, tx).await;
    let _ = printer.await;
    result
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
