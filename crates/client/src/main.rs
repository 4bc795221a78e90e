//! cmdproc
//!
//! Command-line client for a remote execution host.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::config::{default_config_path, Config};
use client::console::{Console, ConsoleExit, ConsoleOptions, OutputFormat};
use client::logging;
use client::multiplexer::ConnectionMultiplexer;
use client::workdir::WorkingDirectoryClient;
use protocol::Scheme;
use tokio::io::BufReader;

/// cmdproc - stream shell commands to a remote execution host.
#[derive(Parser, Debug)]
#[command(name = "cmdproc")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Remote host (overrides the configuration file)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Remote port (overrides the configuration file)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Transport scheme: http or https (overrides the configuration file)
    #[arg(long, global = true)]
    pub scheme: Option<Scheme>,

    /// Subcommand to execute (defaults to `shell`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Interactive session: one command per input line
    Shell {
        /// Print each output line as a JSON object
        #[arg(long)]
        json: bool,
    },

    /// Run a single command and print its output
    Exec {
        /// Stop after this many milliseconds without output
        #[arg(long, default_value = "2000")]
        idle_ms: u64,

        /// Print each output line as a JSON object
        #[arg(long)]
        json: bool,

        /// Command to run; multiple words are joined with spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print the remote working directory
    Pwd,

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides, then command-line overrides
    let env_overrides = config.apply_env_overrides();
    apply_cli_overrides(&mut config, &cli);

    let command = cli.command.clone().unwrap_or(Commands::Shell { json: false });

    // `config init` must work even when the current file is invalid
    if let Commands::Config(ConfigCommands::Init { force }) = command {
        return init_config(cli.config.clone(), force);
    }

    config.validate()?;

    let _log_guard = logging::init(&config.logging, cli.verbose)?;
    tracing::debug!("cmdproc starting");
    for env_override in &env_overrides {
        env_override.log();
    }

    match command {
        Commands::Shell { json } => run_shell(&config, format(json)).await,
        Commands::Exec {
            idle_ms,
            json,
            command,
        } => run_exec(&config, command.join(" "), idle_ms, format(json)).await,
        Commands::Pwd => print_working_directory(&config).await,
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Init { .. }) => Ok(()),
    }
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(host) = &cli.host {
        config.endpoint.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.endpoint.port = port;
    }
    if let Some(scheme) = cli.scheme {
        config.endpoint.scheme = scheme;
    }
}

fn format(json: bool) -> OutputFormat {
    if json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    }
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(default_config_path);
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    Config::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<ConnectionMultiplexer> {
    let mux = ConnectionMultiplexer::from_config(config)?;
    mux.connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.endpoint()))?;
    Ok(mux)
}

/// Run the interactive console until the remote closes or Ctrl-C.
async fn run_shell(config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    let mux = connect(config).await?;
    tracing::info!(session_id = %mux.session_id(), "Connected to {}", config.endpoint());

    let options = ConsoleOptions {
        format,
        fallback_cwd: config.endpoint.host.clone(),
        ..ConsoleOptions::default()
    };
    let mut console = Console::new(&mux, options);
    let stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        summary = console.run(stdin, tokio::io::stdout()) => {
            let summary = summary?;
            if summary.exit == ConsoleExit::Terminated {
                eprintln!("Disconnected from {}", config.endpoint());
            }
            if summary.lines_missed > 0 {
                eprintln!("Warning: {} output lines were dropped", summary.lines_missed);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down");
        }
    }

    finish(&mux).await;
    Ok(())
}

/// Submit one command and print output until the session goes quiet.
async fn run_exec(
    config: &Config,
    command: String,
    idle_ms: u64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mux = connect(config).await?;
    let options = ConsoleOptions {
        format,
        echo_prompt: false,
        close_on_eof: false,
        idle_timeout: Some(Duration::from_millis(idle_ms)),
        fallback_cwd: config.endpoint.host.clone(),
    };
    let mut console = Console::new(&mux, options);

    // The console subscribes on its first poll, before the command leaves.
    let run = console.run(BufReader::new(tokio::io::empty()), tokio::io::stdout());
    let submit = async {
        if let Err(e) = mux.submit_command(command) {
            tracing::warn!(error = %e, "Command not submitted");
        }
    };
    let (summary, ()) = tokio::join!(run, submit);
    let summary = summary?;

    if summary.exit == ConsoleExit::Terminated {
        tracing::debug!("Remote closed the connection");
    }

    finish(&mux).await;
    Ok(())
}

async fn finish(mux: &ConnectionMultiplexer) {
    mux.shutdown();
    match tokio::time::timeout(Duration::from_secs(5), mux.wait()).await {
        Ok(Ok(report)) => tracing::info!(
            session_id = %report.session_id,
            commands_sent = report.commands_sent,
            lines_received = report.lines_received,
            "Session closed"
        ),
        Ok(Err(e)) => tracing::debug!(error = %e, "Session ended without a report"),
        Err(_) => tracing::warn!("Timed out waiting for the session to close"),
    }
}

async fn print_working_directory(config: &Config) -> anyhow::Result<()> {
    let endpoint = config.endpoint();
    let client = WorkingDirectoryClient::new(endpoint.pwd_url()?, config.session.request_timeout())?;
    let cwd = client
        .fetch()
        .await
        .with_context(|| format!("Failed to fetch working directory from {}", client.url()))?;

    if cwd.ends_with('\n') {
        print!("{}", cwd);
    } else {
        println!("{}", cwd);
    }
    Ok(())
}
