//! Workstream Manager CLI
//!
//! Manages per-branch development containers for the repository in the
//! current directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use workstream::naming;
use workstream::{
    ContainerTracker, CreateOptions, DestroyOptions, DockerCli, GitWorktrees, HeartbeatTask,
    ImageBuildSpec, ManagerConfig, OpContext, Orchestrator, Reconciler, Result, SecurityConfig,
    SecurityTier, Validate, WorktreeStore,
};

/// Upper bound on locating the repository.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "workstream", version, about = "Per-branch development containers")]
struct Cli {
    /// Any directory inside the repository (defaults to the current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Abort the operation after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a worktree and container for a branch
    Create(ContainerArgs),
    /// Remove a branch's container and worktree
    Destroy {
        branch: String,
        /// Remove only the container
        #[arg(long)]
        keep_worktree: bool,
        /// Delete the local branch as well
        #[arg(long)]
        delete_branch: bool,
        /// Delete the branch on the remote as well
        #[arg(long, requires = "delete_branch")]
        delete_remote: bool,
    },
    /// Replace a branch's container, keeping its worktree
    Rebuild(ContainerArgs),
    /// Pause a branch's container
    Pause { branch: String },
    /// Resume a paused container
    Resume { branch: String },
    /// Show whether a branch already exists
    Conflict { branch: String },
    /// Remove containers whose branch has no worktree
    Prune {
        /// Only act if the last session died without cleaning up
        #[arg(long)]
        recover: bool,
    },
    /// List containers tracked for crash recovery
    Tracked,
}

#[derive(Debug, Args)]
struct ContainerArgs {
    branch: String,
    /// Image to run
    #[arg(long)]
    image: Option<String>,
    /// Build the image from this context directory if it is missing
    #[arg(long)]
    build_context: Option<PathBuf>,
    /// Dockerfile for --build-context
    #[arg(long, requires = "build_context")]
    dockerfile: Option<PathBuf>,
    /// Starting security tier
    #[arg(long)]
    tier: Option<SecurityTier>,
    /// Fail instead of falling back to weaker tiers
    #[arg(long)]
    no_relax: bool,
    /// Untracked file to copy into the worktree (repeatable)
    #[arg(long = "copy")]
    copy_files: Vec<PathBuf>,
    /// Reuse a worktree that already has the branch checked out
    #[arg(long)]
    reuse_worktree: bool,
}

impl ContainerArgs {
    fn create_options(&self, config: &ManagerConfig) -> CreateOptions {
        let security = if self.tier.is_some() || self.no_relax {
            Some(SecurityConfig {
                tier: self.tier,
                auto_relax: self.no_relax.then_some(false),
                ..Default::default()
            })
        } else {
            None
        };
        let build = self.build_context.as_ref().map(|dir| {
            let image = self.image.clone().unwrap_or_else(|| config.image.clone());
            ImageBuildSpec {
                dockerfile: self.dockerfile.clone(),
                ..ImageBuildSpec::new(image, dir.clone())
            }
        });

        CreateOptions {
            image: self.image.clone(),
            build,
            security,
            copy_files: self.copy_files.clone(),
            reuse_existing_worktree: self.reuse_worktree,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ManagerConfig::load_from(path)?,
        None => ManagerConfig::load()?,
    };
    for warning in config.validate().into_result()? {
        tracing::warn!("{}", warning);
    }

    let ctx = match cli.timeout {
        Some(secs) => OpContext::with_timeout(Duration::from_secs(secs)),
        None => OpContext::new(),
    };
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let start = match cli.repo {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let worktrees = GitWorktrees::discover(&ctx.child(Some(DISCOVER_TIMEOUT)), &start)
        .await?
        .with_remote(config.git_remote.clone());
    let repo = worktrees.repo_path().to_path_buf();
    let worktrees = Arc::new(worktrees);
    let runtime = Arc::new(DockerCli::with_binary(config.runtime_binary.clone()));

    let tracker_dir = config
        .data_dir
        .join("projects")
        .join(naming::project_name(&repo));
    let tracker = Arc::new(ContainerTracker::open(tracker_dir)?);

    let orchestrator = Orchestrator::new(runtime.clone(), worktrees.clone(), config.clone())
        .with_tracker(tracker.clone());

    match cli.command {
        Command::Create(args) => {
            let heartbeat = HeartbeatTask::spawn(tracker.clone(), config.heartbeat_interval());
            let mut ws = workstream::Workstream::new(&args.branch);
            let result = orchestrator
                .create_workstream(&ctx, &mut ws, &args.create_options(&config))
                .await;
            heartbeat.stop().await;
            let result = result?;

            println!("Created workstream {}", ws.id);
            println!("  container: {}", result.container_id);
            println!("  worktree:  {}", result.worktree_path.display());
            if let Some(relaxed) = result.security_relaxation {
                println!(
                    "  security:  relaxed from {} to {}{}",
                    relaxed.original_tier,
                    relaxed.final_tier,
                    match &relaxed.config_path {
                        Some(path) => format!(" (saved to {})", path.display()),
                        None => String::new(),
                    }
                );
            }
        }
        Command::Destroy {
            branch,
            keep_worktree,
            delete_branch,
            delete_remote,
        } => {
            let mut ws = orchestrator.load_workstream(&ctx, &branch).await?;
            let opts = DestroyOptions {
                keep_worktree,
                delete_branch,
                delete_remote_branch: delete_remote,
            };
            orchestrator.destroy_workstream(&ctx, &mut ws, &opts).await?;
            println!("Destroyed workstream for {}", branch);
        }
        Command::Rebuild(args) => {
            let heartbeat = HeartbeatTask::spawn(tracker.clone(), config.heartbeat_interval());
            let result = async {
                let mut ws = orchestrator.load_workstream(&ctx, &args.branch).await?;
                orchestrator
                    .rebuild_workstream(&ctx, &mut ws, &args.create_options(&config))
                    .await
            }
            .await;
            heartbeat.stop().await;
            let result = result?;
            println!("Rebuilt {}: container {}", args.branch, result.container_id);
        }
        Command::Pause { branch } => {
            let ws = orchestrator.load_workstream(&ctx, &branch).await?;
            orchestrator.pause_workstream(&ctx, &ws).await?;
            println!("Paused {}", branch);
        }
        Command::Resume { branch } => {
            let ws = orchestrator.load_workstream(&ctx, &branch).await?;
            orchestrator.resume_workstream(&ctx, &ws).await?;
            println!("Resumed {}", branch);
        }
        Command::Conflict { branch } => {
            match orchestrator.check_branch_conflict(&ctx, &branch).await? {
                None => println!("Branch {} does not exist", branch),
                Some(conflict) => {
                    println!("Branch {} already exists", conflict.branch_name);
                    match &conflict.worktree_path {
                        Some(path) => println!("  worktree: {}", path.display()),
                        None => println!("  worktree: none"),
                    }
                    for line in conflict.branch_info.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
        Command::Prune { recover } => {
            let reconciler = Reconciler::new(runtime, worktrees, &config.container_prefix)
                .with_tracker(tracker.clone());
            let report = if recover {
                let recovery = reconciler.recover_after_crash(&ctx).await?;
                if recovery.owner_alive {
                    println!("Another session is alive, nothing to recover");
                    return Ok(());
                }
                println!("Dropped {} stale tracker entries", recovery.untracked.len());
                recovery.prune.unwrap_or_default()
            } else {
                let known = reconciler.known_from_tracker();
                reconciler.prune(&ctx, &known).await?
            };

            println!("Removed {} orphaned containers", report.reclaimed_count());
            for id in &report.reclaimed {
                println!("  {}", id);
            }
            for (id, reason) in &report.failed {
                println!("  failed {}: {}", id, reason);
            }
        }
        Command::Tracked => {
            let entries = tracker.list();
            if entries.is_empty() {
                println!("No tracked containers");
            }
            for entry in entries {
                println!(
                    "{}  {}  {}  {}",
                    entry.container_id,
                    entry.branch_name,
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.repo_path.display()
                );
            }
        }
    }

    Ok(())
}
