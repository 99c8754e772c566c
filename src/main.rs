mod config;
mod instance_lock;
mod launcher;
mod watcher;
mod workflow;

use clap::{Args, Parser, Subcommand};
use config::{LaunchConfig, Overrides};
use instance_lock::InstanceLock;
use launcher::Launcher;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use watcher::{ConsoleSink, DetectedEndpoint, StdoutSink};

/// Launch a local ComfyUI server in the background, stream its output,
/// and report the URL it is listening on.
#[derive(Parser, Debug)]
#[command(name = "comfy-launch", version, about, args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    launch: LaunchArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server (the default when no subcommand is given)
    Launch(LaunchArgs),
    /// Plan the import of a ComfyUI workflow JSON and print it
    Plan {
        /// Workflow file (ComfyUI UI export)
        file: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct LaunchArgs {
    /// ComfyUI checkout directory (overrides NUKE_COMFYUI_DIR)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Interpreter to run ComfyUI with (overrides NUKE_COMFYUI_PYTHON)
    #[arg(long)]
    python: Option<String>,

    /// Address to bind (overrides NUKE_COMFYUI_IP)
    #[arg(long)]
    ip: Option<String>,

    /// Port to bind (overrides NUKE_COMFYUI_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Extra ComfyUI flags as one string (overrides NUKE_COMFYUI_FLAGS)
    #[arg(long, allow_hyphen_values = true)]
    flags: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "comfy-launch.toml")]
    config: PathBuf,

    /// Print the resolved settings and command, don't launch
    #[arg(long)]
    dry_run: bool,

    /// Extra logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

impl LaunchArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            dir: self.dir.clone(),
            python: self.python.clone(),
            ip: self.ip.clone(),
            port: self.port,
            flags: self.flags.clone(),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "comfy_launch=debug"
    } else {
        "comfy_launch=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    // Logs go to stderr; stdout carries the server output.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Some(Command::Launch(args)) => args.verbose,
        _ => cli.launch.verbose,
    };
    init_tracing(verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let result = match cli.command {
        Some(Command::Plan { file, json }) => run_plan(&file, json),
        Some(Command::Launch(args)) => run_launch(&args).await,
        None => run_launch(&cli.launch).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", watcher::CONSOLE_PREFIX);
            ExitCode::FAILURE
        }
    }
}

fn resolve_config(args: &LaunchArgs) -> Result<LaunchConfig, Box<dyn std::error::Error>> {
    let cwd = std::env::current_dir()?;
    let file = config::load_file(&args.config)?;
    let config = LaunchConfig::resolve(
        &file,
        |key| std::env::var(key),
        &args.overrides(),
        &cwd,
    )?;
    tracing::debug!(?config, "resolved launch configuration");
    Ok(config)
}

async fn run_launch(args: &LaunchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let launcher = Launcher::new(resolve_config(args)?);

    if args.dry_run {
        let config = launcher.config();
        let parts = launcher.command_line()?;
        println!("Working directory: {}", config.working_directory.display());
        println!("Interpreter: {}", config.interpreter());
        println!("Bind: {}:{}", config.bind_ip, config.bind_port);
        println!("Extra flags: {}", shell_words::join(&config.extra_flags));
        println!("Command: {}", shell_words::join(&parts));
        println!("Dry run mode, not launching.");
        return Ok(());
    }

    let sink: Arc<dyn ConsoleSink> = Arc::new(StdoutSink);

    let Some(lock) = InstanceLock::acquire(&std::env::temp_dir(), launcher.config().bind_port)?
    else {
        watcher::status(sink.as_ref(), "Server already running.");
        return Ok(());
    };
    tracing::debug!(path = %lock.path().display(), "holding instance lock");

    let mut handle = launcher.start(Arc::clone(&sink)).await?;

    let status = tokio::select! {
        status = handle.wait() => status?,
        _ = tokio::signal::ctrl_c() => {
            watcher::status(
                sink.as_ref(),
                &format!("Stopping server (PID: {})...", handle.pid()),
            );
            handle.stop().await?
        }
    };

    let summary = handle.into_summary().await;
    tracing::debug!(lines = summary.lines, "launch finished");
    watcher::status(sink.as_ref(), &exit_message(summary.endpoint.as_ref(), status.code()));
    Ok(())
}

/// Final status line for a launch, naming the URL the server had reported.
fn exit_message(endpoint: Option<&DetectedEndpoint>, code: Option<i32>) -> String {
    let server = match endpoint {
        Some(url) => format!("Server at {url}"),
        None => "Server (no URL reported)".to_string(),
    };
    match code {
        Some(code) => format!("{server} exited with code: {code}"),
        None => format!("{server} stopped by signal."),
    }
}

fn run_plan(file: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let plan = workflow::load_plan(file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        for line in plan.render() {
            println!("{line}");
        }
    }
    Ok(())
}
