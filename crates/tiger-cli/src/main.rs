mod agent_cmd;
mod task_cmds;

use anyhow::Context;
use clap::{Parser, Subcommand};

use tiger_core::repo::PrepareMode;
use tiger_db::{DbConfig, pool};

#[derive(Parser)]
#[command(name = "tiger", about = "Worker runtime for an autonomous coding-agent fleet")]
struct Cli {
    /// Database URL (overrides OPENTIGER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run migrations
    Init,
    /// Agent process management
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Task tooling (normally the planner's job)
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Run a long-lived worker agent until SIGINT/SIGTERM
    Run {
        /// Stable agent identifier (also names the queue)
        #[arg(long)]
        agent_id: String,
        /// Agent role: worker, tester, or docser
        #[arg(long, default_value = "worker")]
        role: String,
        /// Working-directory mode: clone, worktree, or in-place
        #[arg(long, default_value = "worktree")]
        mode: String,
        /// Remote repository URL (clone mode)
        #[arg(long)]
        repo_url: Option<String>,
        /// Local repository path (worktree base / in-place)
        #[arg(long)]
        repo_path: Option<std::path::PathBuf>,
        /// Base branch to work from
        #[arg(long, default_value = "main")]
        base_branch: String,
        /// Path to the executor binary (defaults to `opencode` on PATH)
        #[arg(long)]
        executor_bin: Option<String>,
        /// Model name handed to the executor
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Insert a task
    Add {
        /// Task title
        title: String,
        /// What the executor should accomplish
        #[arg(long)]
        goal: String,
        /// Comma-separated allowed path globs
        #[arg(long)]
        allowed_paths: Option<String>,
        /// Comma-separated verification commands
        #[arg(long)]
        commands: Option<String>,
        /// Timebox in minutes
        #[arg(long, default_value_t = 30)]
        timebox_minutes: i32,
        /// Task role
        #[arg(long, default_value = "worker")]
        role: String,
        /// Retry limit (-1 for unbounded)
        #[arg(long, default_value_t = 3)]
        retry_limit: i32,
    },
    /// Show a task and its recent runs
    Show {
        /// Task ID
        task_id: String,
    },
    /// Enqueue a task for an agent
    Enqueue {
        /// Task ID
        task_id: String,
        /// Agent ID whose queue receives the job
        #[arg(long)]
        agent_id: String,
    },
}

/// Execute `tiger init`: create the database and apply migrations.
async fn cmd_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let db_config = resolve_db_config(cli_db_url);

    println!("Initializing tiger database...");

    pool::ensure_database_exists(&db_config).await?;
    let db_pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    db_pool.close().await;
    println!("tiger init complete.");
    Ok(())
}

fn resolve_db_config(cli_db_url: Option<&str>) -> DbConfig {
    match cli_db_url {
        Some(url) => DbConfig::new(url),
        None => DbConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            cmd_init(cli.database_url.as_deref()).await?;
        }
        Commands::Agent { command } => match command {
            AgentCommands::Run {
                agent_id,
                role,
                mode,
                repo_url,
                repo_path,
                base_branch,
                executor_bin,
                model,
            } => {
                let mode: PrepareMode = mode
                    .parse()
                    .with_context(|| format!("invalid mode {mode:?}"))?;
                let db_config = resolve_db_config(cli.database_url.as_deref());
                let db_pool = pool::create_pool(&db_config).await?;

                let opts = agent_cmd::AgentRunOptions {
                    agent_id,
                    role,
                    mode,
                    repo_url,
                    repo_path,
                    base_branch,
                    executor_bin,
                    model,
                };
                let result = agent_cmd::run_agent(db_pool.clone(), opts).await;
                db_pool.close().await;
                result?;
            }
        },
        Commands::Task { command } => {
            let db_config = resolve_db_config(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&db_config).await?;
            let result = match command {
                TaskCommands::Add {
                    title,
                    goal,
                    allowed_paths,
                    commands,
                    timebox_minutes,
                    role,
                    retry_limit,
                } => {
                    task_cmds::run_task_add(
                        &db_pool,
                        &title,
                        &goal,
                        allowed_paths.as_deref(),
                        commands.as_deref(),
                        timebox_minutes,
                        &role,
                        retry_limit,
                    )
                    .await
                }
                TaskCommands::Show { task_id } => {
                    task_cmds::run_task_show(&db_pool, &task_id).await
                }
                TaskCommands::Enqueue { task_id, agent_id } => {
                    task_cmds::run_task_enqueue(&db_pool, &task_id, &agent_id).await
                }
            };
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
