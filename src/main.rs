use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::{info, warn};
use ralph::agent::{AgentLauncher, CommandLauncher, PtyLauncher};
use ralph::engine::{ControlCommand, EngineHandle, LoopEngine, LoopStatus};
use ralph::error::RalphError;
use ralph::events::{HeadlessPipeline, JsonLinesFormatter};
use ralph::session::{SessionLock, default_probe, read_lock_record, remove_lock_file};
use ralph::tasks::JsonPlanSource;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod cli;
mod config;

use cli::Cli;
use cli::commands::{Commands, RunArgs};
use config::Config;

/// Exit code when another session holds the lock.
const EXIT_LOCKED: i32 = 2;

fn setup_logging() -> Result<()> {
    // Stdout carries the event stream, so logs go to a file
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ralph")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("ralph.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: Config) -> Result<i32> {
    let cwd = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };
    info!("Starting in {}", cwd.display());

    if cli.is_verbose() {
        eprintln!("{} {}", "Working directory:".yellow(), cwd.display());
    }

    match &cli.command {
        Commands::Run(args) => handle_run_command(args, config, cwd).await,
        Commands::Status => handle_status_command(&cwd),
        Commands::Unlock { force } => handle_unlock_command(&cwd, *force),
    }
}

/// Fold `run` flags into the loaded config.
fn apply_run_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(agent) = &args.agent {
        config.default_agent = agent.clone();
    }
    if let Some(plan) = &args.plan {
        config.plan.path = plan.clone();
    }
    if let Some(server) = &args.server {
        config.server.url = Some(server.clone());
    }
    if let Some(max) = args.max_iterations {
        config.engine.max_iterations = Some(max);
    }
    if let Some(model) = &args.model {
        config.model = Some(model.clone());
    }
    config.engine.continue_on_error |= args.continue_on_error;
    config.engine.use_pty |= args.pty;
    config.headless.timestamps |= args.timestamps;
}

async fn handle_run_command(args: &RunArgs, mut config: Config, cwd: PathBuf) -> Result<i32> {
    apply_run_overrides(&mut config, args);

    let plan_path = cwd.join(&config.plan.path);
    let tasks = JsonPlanSource::open(&plan_path).context(format!("Failed to open plan {}", plan_path.display()))?;

    let agents = config.agent_definitions();
    let launcher: Arc<dyn AgentLauncher> = if config.engine.use_pty {
        Arc::new(PtyLauncher::new(agents).with_size(config.engine.pty_cols, config.engine.pty_rows))
    } else {
        Arc::new(CommandLauncher::new(agents))
    };

    let mut fallback = config.fallback_resolver();
    if let Some(agent) = &args.fallback_agent {
        fallback = fallback.with_invocation_default(agent.clone());
    }

    let pipeline =
        HeadlessPipeline::new(Box::new(JsonLinesFormatter::stdout())).with_timestamps(config.headless.timestamps);

    let mut engine_config = config.engine_config(&cwd);
    engine_config.force_lock = args.force;

    let mut engine = LoopEngine::new(engine_config, launcher, Box::new(tasks), pipeline)
        .with_fallback(fallback)
        .with_renderer(config.renderer()?);

    spawn_interrupt_listener(engine.handle());
    if args.control_stdin {
        spawn_stdin_control(engine.handle());
    }

    match engine.run().await {
        Ok(status) => {
            info!("Loop finished: {}", status);
            Ok(exit_code(status))
        }
        Err(RalphError::LockContention { pid }) => {
            eprintln!("{} another session is running here (pid {})", "Locked:".red(), pid);
            eprintln!("Use --force to take over, or `ralph unlock` if it is gone");
            Ok(EXIT_LOCKED)
        }
        Err(e) => Err(e).context("Failed to start loop"),
    }
}

fn exit_code(status: LoopStatus) -> i32 {
    match status {
        LoopStatus::Complete | LoopStatus::Stopped => 0,
        _ => 1,
    }
}

fn spawn_interrupt_listener(handle: EngineHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            handle.stop();
        }
    });
}

fn spawn_stdin_control(handle: EngineHandle) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match ControlCommand::parse(&line) {
                Some(command) => handle.dispatch(command),
                None => warn!("Unknown control command: {}", line.trim()),
            }
        }
    });
}

fn handle_status_command(cwd: &Path) -> Result<i32> {
    let path = SessionLock::lock_path(cwd);
    let Some(record) = read_lock_record(&path) else {
        println!("{}", "No session running".green());
        return Ok(0);
    };

    let alive = default_probe().is_alive(record.pid);
    let state = if alive { "running".green() } else { "stale".red() };
    println!("{} {} ({})", "Session:".cyan(), record.session_id, state);
    println!("  pid:     {}", record.pid);
    println!("  started: {}", record.started_at.to_rfc3339());
    println!("  lock:    {}", path.display());
    Ok(0)
}

fn handle_unlock_command(cwd: &Path, force: bool) -> Result<i32> {
    let path = SessionLock::lock_path(cwd);
    let Some(record) = read_lock_record(&path) else {
        // Malformed files are reclaimable too
        remove_lock_file(&path).context("Failed to remove lock file")?;
        println!("{}", "No session lock".green());
        return Ok(0);
    };

    if default_probe().is_alive(record.pid) && !force {
        eprintln!("{} session {} is alive (pid {})", "Refusing:".red(), record.session_id, record.pid);
        eprintln!("Use --force to remove it anyway");
        return Ok(1);
    }

    remove_lock_file(&path).context("Failed to remove lock file")?;
    info!("Removed lock for session {} (pid {})", record.session_id, record.pid);
    println!("{} {}", "Unlocked:".green(), path.display());
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    let code = run_application(&cli, config).await.context("Application failed")?;

    std::process::exit(code);
}
