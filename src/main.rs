//! agentlink - drive an agent backend from the command line.
//!
//! Spawns the configured backend, performs the handshake, runs one command
//! and shuts the backend down again.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use agentlink::protocol::{
    CompleteParams, ExecuteParams, InitializeResult, OutputStream, TaskState,
};
use agentlink::{logging, ClientConfig, ProcessState, Supervisor};

#[derive(Parser)]
#[command(name = "agentlink")]
#[command(version)]
#[command(about = "Drive an agent backend over Content-Length framed JSON-RPC")]
struct Cli {
    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Working directory for the backend
    #[arg(long, global = true)]
    cwd: Option<String>,
    /// Backend command (overrides config and AGENTLINK_BACKEND)
    #[arg(long, global = true)]
    backend: Option<String>,
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a task and stream its output until it completes
    Exec {
        /// Task description handed to the backend
        task: String,
    },
    /// Show the status of a task
    Status { task_id: String },
    /// Cancel a running task
    Cancel { task_id: String },
    /// Send a raw request and print the result
    Call {
        method: String,
        /// Params as JSON (defaults to null)
        params: Option<String>,
    },
    /// Handshake, print capabilities and latency, then shut down
    Ping,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(if cli.verbose {
        "agentlink=debug"
    } else {
        logging::DEFAULT_FILTER
    });

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = ClientConfig::discover(cli.config.as_deref())
        .context("Failed to load configuration")?
        .with_overrides(cli.backend, cli.cwd);
    config.validate().context("Invalid configuration")?;

    let supervisor = Supervisor::new(config);
    supervisor.on_exit(|event| {
        if event.unexpected {
            warn!("Backend exited unexpectedly (code {:?})", event.code);
        }
    });

    let started = Instant::now();
    let capabilities = supervisor
        .start()
        .await
        .context("Failed to start backend")?;
    let handshake = started.elapsed();
    info!("Handshake completed in {:?}", handshake);

    let outcome = match cli.command {
        Commands::Exec { task } => exec(&supervisor, task).await,
        Commands::Status { task_id } => status(&supervisor, &task_id).await,
        Commands::Cancel { task_id } => cancel(&supervisor, &task_id).await,
        Commands::Call { method, params } => call(&supervisor, &method, params.as_deref()).await,
        Commands::Ping => ping(&capabilities, handshake),
    };

    if let Err(e) = supervisor.shutdown().await {
        warn!("Shutdown failed: {}", e);
    }
    outcome
}

async fn exec(supervisor: &Supervisor, task: String) -> Result<ExitCode> {
    let (complete_tx, mut complete_rx) = mpsc::unbounded_channel::<CompleteParams>();
    supervisor.on_output(|out| match out.stream {
        OutputStream::Stderr => eprint!("{}", out.text),
        _ => print!("{}", out.text),
    });
    supervisor.on_progress(|progress| {
        let message = progress.message.unwrap_or_default();
        match progress.percentage {
            Some(pct) => eprintln!("[{:>5.1}%] {}", pct, message),
            None => eprintln!("[progress] {}", message),
        }
    });
    supervisor.on_complete(move |complete| {
        let _ = complete_tx.send(complete);
    });

    let mut params = ExecuteParams::new(task);
    params.working_directory = supervisor
        .config()
        .working_dir
        .as_ref()
        .map(|dir| dir.to_string_lossy().into_owned());

    let task = match supervisor.execute(&params).await? {
        Ok(task) => task,
        Err(e) => {
            eprintln!("Backend error: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    eprintln!("Task {} {}", task.task_id, task.state);
    if task.state.is_terminal() {
        return Ok(exit_code_for(task.state));
    }

    let mut state_rx = supervisor.subscribe_state();
    loop {
        tokio::select! {
            complete = complete_rx.recv() => {
                let Some(complete) = complete else {
                    bail!("Completion handler was dropped");
                };
                if complete.task_id != task.task_id {
                    continue;
                }
                if let Some(error) = &complete.error {
                    eprintln!("Task {}: {}", complete.state, error);
                }
                if let Some(result) = &complete.result {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
                return Ok(exit_code_for(complete.state));
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling task {}", task.task_id);
                if let Err(e) = supervisor.cancel(&task.task_id).await? {
                    eprintln!("Cancel rejected: {}", e);
                }
                return Ok(ExitCode::from(130));
            }
            changed = state_rx.changed() => {
                let running = *state_rx.borrow() == ProcessState::Running;
                if changed.is_err() || !running {
                    bail!("Backend stopped before task {} completed", task.task_id);
                }
            }
        }
    }
}

async fn status(supervisor: &Supervisor, task_id: &str) -> Result<ExitCode> {
    match supervisor.status(task_id).await? {
        Ok(status) => {
            let mut line = format!("{} {}", status.task_id, status.state);
            if let Some(pct) = status.progress {
                line.push_str(&format!(" {:.1}%", pct));
            }
            if let Some(message) = status.message {
                line.push_str(&format!(" - {}", message));
            }
            println!("{}", line);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Backend error: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cancel(supervisor: &Supervisor, task_id: &str) -> Result<ExitCode> {
    match supervisor.cancel(task_id).await? {
        Ok(_) => {
            println!("Cancelled {}", task_id);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Backend error: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn call(supervisor: &Supervisor, method: &str, params: Option<&str>) -> Result<ExitCode> {
    let params: Value = match params {
        Some(text) => serde_json::from_str(text).context("Params must be valid JSON")?,
        None => Value::Null,
    };

    match supervisor.request(method, params).await? {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Backend error: {}", e);
            if let Some(data) = &e.data {
                eprintln!("{}", serde_json::to_string_pretty(data)?);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn ping(capabilities: &InitializeResult, handshake: Duration) -> Result<ExitCode> {
    if let Some(server) = &capabilities.server_info {
        println!(
            "{} {}",
            server.name,
            server.version.as_deref().unwrap_or("(unknown version)")
        );
    }
    println!(
        "capabilities: {}",
        serde_json::to_string_pretty(&capabilities.capabilities)?
    );
    println!("handshake: {:.1} ms", handshake.as_secs_f64() * 1000.0);
    Ok(ExitCode::SUCCESS)
}

fn exit_code_for(state: TaskState) -> ExitCode {
    if state == TaskState::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
