use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use shell_pty::{
    IdentityDatabase, PreprovisionedUser, PtySessionManager, RecordingTarget, SessionRecorder,
};

mod config;
mod terminal;

use config::{default_config_path, resolve_config};
use terminal::{TerminalGuard, window_size};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "shell-session")]
#[command(about = "Run a PTY-backed shell session or record a session transcript")]
struct Cli {
    /// Path to config.toml (defaults to ~/.config/shell-session/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach this terminal to a new PTY shell
    Run {
        /// Drop to the configured restricted user before starting the shell
        #[arg(long)]
        as_restricted_user: bool,

        /// Command line for the shell to run instead of an interactive session
        #[arg(short, long)]
        command: Option<String>,
    },
    /// Record a transcript by replaying a session through a disposable shell
    Record {
        /// Transcript file written by the record program
        #[arg(long)]
        log_file: PathBuf,

        /// IPC file the session logger replays
        #[arg(long)]
        ipc_file: PathBuf,

        /// Run the session logger in blocking mode
        #[arg(long)]
        logger_blocking: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "shell_pty=debug,shell_session=debug"
    } else {
        "shell_pty=warn,shell_session=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();

    let config_path = cli.config.or_else(default_config_path);
    let config = resolve_config(config_path.as_deref())?;
    debug!("Loaded configuration: {:?}", config);

    match cli.command {
        Command::Run {
            as_restricted_user,
            command,
        } => {
            let identity = config.shell.identity_lookup.database();
            let manager = PtySessionManager::with_identity(config.shell, PreprovisionedUser, identity);
            run_shell(manager, as_restricted_user, command.as_deref().unwrap_or("")).await
        }
        Command::Record {
            log_file,
            ipc_file,
            logger_blocking,
        } => {
            let target = RecordingTarget {
                log_file,
                ipc_file,
                logger_blocking,
            };
            SessionRecorder::new(config.shell, config.recorder)
                .generate_log_data(&target)
                .await
                .context("Failed to record session transcript")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_shell(
    mut manager: PtySessionManager<PreprovisionedUser, Box<dyn IdentityDatabase>>,
    as_restricted_user: bool,
    shell_command: &str,
) -> Result<ExitCode> {
    let streams = manager
        .start(as_restricted_user, shell_command)
        .context("Failed to start shell")?;
    info!("Shell started with PID {:?}", manager.pid());

    if let Some((cols, rows)) = window_size() {
        manager.set_size(cols, rows)?;
    }

    // Restores the terminal when dropped, including on early return
    let guard = TerminalGuard::raw();
    if guard.is_raw() {
        debug!("Terminal switched to raw mode");
    }

    let mut input = streams.input;
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buffer = [0u8; 1024];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if input.write_all(&buffer[..n]).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    let mut output = streams.output;
    std::thread::spawn(move || {
        let mut stdout = io::stdout();
        let mut buffer = [0u8; 4096];
        while let Ok(n) = output.read(&mut buffer) {
            if n == 0 || stdout.write_all(&buffer[..n]).and_then(|_| stdout.flush()).is_err() {
                break;
            }
        }
    });

    let mut resized = signal(SignalKind::window_change()).context("Failed to watch SIGWINCH")?;
    let status = loop {
        tokio::select! {
            _ = resized.recv() => {
                if let Some((cols, rows)) = window_size() {
                    if let Err(e) = manager.set_size(cols, rows) {
                        warn!("Failed to resize shell: {}", e);
                    }
                }
            }
            _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {
                if let Some(status) = manager.try_wait()? {
                    break status;
                }
            }
        }
    };

    manager.stop()?;
    drop(guard);
    info!("Shell exited with {}", status);

    let code = status.code().unwrap_or(1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
