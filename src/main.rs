use anyhow::{Context, Result};
use clap::Parser;
use atelier::agent::{Agent, SharedAgent};
use atelier::cli::{Cli, Commands};
use atelier::context::{repo_root, EngineContext};
use atelier::factory::{AgentOutcome, CreateRequest};
use atelier::status::status_icon;
use atelier::tasks::{Task, TaskStatus};
use atelier::tracker::AgentEvent;
use std::path::PathBuf;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atelier=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let repo_path = cli.repo.unwrap_or_else(|| PathBuf::from("."));
    let repo = repo_root(&repo_path)
        .with_context(|| format!("{} is not inside a git repository", repo_path.display()))?;
    let ctx = EngineContext::open(&repo)?;

    match cli.command {
        Commands::Init => {
            println!("Initializing Atelier...");
            ctx.worktrees.ensure_layout(&ctx.repo)?;
            println!("Worktrees: {}", ctx.worktrees.worktree_root(&ctx.repo).display());
            let available = ctx.isolation.available().await;
            println!("Isolation: {}", available.join(", "));
        }

        Commands::Spawn {
            count,
            isolation,
            base,
            task_file,
        } => {
            let mut request = CreateRequest::new(count);
            if let Some(isolation) = isolation {
                request = request.isolation(isolation);
            }
            if let Some(base) = base {
                request = request.base_branch(base);
            }
            if let Some(task_file) = task_file {
                request = request.task_file(task_file);
            }

            println!("Spawning {} agent(s)...", count);
            let batch = ctx.factory().create_agents(request).await?;
            for outcome in &batch.outcomes {
                match outcome {
                    AgentOutcome::Created(agent) => println!(
                        "  {} #{} → {} ({}, {})",
                        agent.name,
                        agent.id,
                        agent.branch,
                        agent.worktree_path.display(),
                        agent.isolation
                    ),
                    AgentOutcome::SkippedExisting { name } => {
                        println!("  {} skipped: worktree already exists", name)
                    }
                    AgentOutcome::Failed { name, error } => {
                        println!("  {} failed: {}", name, error)
                    }
                }
            }
            if batch.shortfall > 0 {
                println!("  {} not created: no agent names left", batch.shortfall);
            }
            if batch.is_failure(count) {
                std::process::exit(1);
            }
        }

        Commands::List => {
            let agents: Vec<SharedAgent> = ctx
                .factory()
                .recover()
                .await?
                .into_iter()
                .map(Agent::shared)
                .collect();
            if agents.is_empty() {
                println!("No agents");
                return Ok(());
            }

            let (tx, _rx) = mpsc::unbounded_channel();
            let source = agents.clone();
            ctx.tracker(move || source.clone(), tx).refresh().await;

            println!("Agents:");
            for agent in &agents {
                let agent = agent.lock().await;
                let live = ctx.sessions.has_session(&agent.session_id).await;
                println!(
                    "  {} {} #{} → {} ({})",
                    status_icon(agent.status, live),
                    agent.name,
                    agent.id,
                    agent.branch,
                    agent.status
                );
                if let Some(pending) = &agent.pending_approval {
                    println!("      waiting on: {}", pending);
                }
                if !agent.tasks.is_empty() {
                    let done = completed(&agent.tasks);
                    println!("      tasks: {}/{}", done, agent.tasks.len());
                }
                if agent.diff.files_changed > 0 {
                    println!(
                        "      diff: {} file(s), +{} -{}",
                        agent.diff.files_changed, agent.diff.insertions, agent.diff.deletions
                    );
                }
            }
        }

        Commands::Remove { agent } => {
            let factory = ctx.factory();
            let target = find_agent(factory.recover().await?, &agent)?;
            println!("Removing agent {}...", target.name);
            factory.delete_agent(&target).await?;
            println!("Removed {} and branch {}", target.worktree_path.display(), target.branch);
        }

        Commands::Attach { agent } => {
            let target = find_agent(ctx.factory().recover().await?, &agent)?;
            println!("Attaching to agent {}...", target.name);
            ctx.sessions
                .create_or_attach(
                    &target.session_id,
                    &target.worktree_path,
                    Some(ctx.config.agent_command.as_str()),
                )
                .await?;
        }

        Commands::Watch => {
            let agents: Vec<SharedAgent> = ctx
                .factory()
                .recover()
                .await?
                .into_iter()
                .map(Agent::shared)
                .collect();
            let names: Vec<(u32, String)> = {
                let mut names = Vec::new();
                for agent in &agents {
                    let agent = agent.lock().await;
                    names.push((agent.id, agent.name.clone()));
                }
                names
            };
            let name_of = |id: u32| {
                names
                    .iter()
                    .find(|(agent_id, _)| *agent_id == id)
                    .map(|(_, name)| name.as_str())
                    .unwrap_or("?")
            };

            let (tx, mut rx) = mpsc::unbounded_channel();
            let tracker = ctx.tracker(move || agents.clone(), tx);
            tracker.start();
            println!("Watching {} agent(s). Press Ctrl+C to stop.", names.len());

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    event = rx.recv() => match event {
                        Some(event) => print_event(&event, name_of),
                        None => break,
                    },
                }
            }
            tracker.stop();
        }
    }

    Ok(())
}

fn find_agent(agents: Vec<Agent>, key: &str) -> Result<Agent> {
    let wanted_id = key.parse::<u32>().ok();
    agents
        .into_iter()
        .find(|a| a.name == key || Some(a.id) == wanted_id)
        .with_context(|| format!("no agent named '{}'", key))
}

fn completed(tasks: &[Task]) -> usize {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count()
}

fn print_event<'a>(event: &AgentEvent, name_of: impl Fn(u32) -> &'a str) {
    match event {
        AgentEvent::StatusChanged {
            agent_id,
            previous,
            status,
        } => println!("{}: {} → {}", name_of(*agent_id), previous, status),
        AgentEvent::ApprovalPending {
            agent_id,
            description,
        } => println!("{}: waiting on {}", name_of(*agent_id), description),
        AgentEvent::TodosChanged { agent_id, tasks } => {
            let done = completed(tasks);
            println!("{}: tasks {}/{}", name_of(*agent_id), done, tasks.len())
        }
        AgentEvent::DiffChanged { agent_id, diff } => println!(
            "{}: {} file(s), +{} -{}",
            name_of(*agent_id),
            diff.files_changed,
            diff.insertions,
            diff.deletions
        ),
    }
}
