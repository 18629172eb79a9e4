use std::path::{Path, PathBuf};

use clap::Parser;
use overlay_sandbox::{
    launch, ContainerCli, SandboxConfig, SandboxError, SandboxResult, Shutdown,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Overlay Sandbox - run a command over disposable writable overlays
///
/// The command sees the image's filesystem read-only, with no network, except
/// for each `--edit` directory, which it sees as a writable copy. Changes made
/// to the copies are reported and then discarded.
#[derive(Parser)]
#[command(name = "overlay-sandbox")]
#[command(version)]
#[command(about = "Run a command in a sandbox and report what it changed", long_about = None)]
struct Cli {
    /// Container image to use
    #[arg(long)]
    image: String,

    /// Directory the command may edit (repeatable)
    #[arg(long = "edit", value_name = "DIR")]
    edit: Vec<PathBuf>,

    /// User inside the container to run as
    #[arg(long)]
    user: Option<String>,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Command to run inside the sandbox (default: /bin/bash)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> SandboxResult<i32> {
    let config = match cli.config {
        Some(ref path) => SandboxConfig::load(path)?,
        None => SandboxConfig::default(),
    };

    let edit_paths = cli
        .edit
        .iter()
        .map(|path| resolve_edit_path(path))
        .collect::<SandboxResult<Vec<_>>>()?;

    let runtime = ContainerCli::from_config(&config);
    let report = launch(
        &runtime,
        config,
        &cli.image,
        edit_paths,
        cli.user,
        cli.command,
        interrupt_signal(),
    )
    .await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }

    info!(exit_code = report.exit_code, "session complete");
    Ok(report.exit_code)
}

fn resolve_edit_path(path: &Path) -> SandboxResult<PathBuf> {
    let resolved = path
        .canonicalize()
        .map_err(|err| SandboxError::unreadable(path, err))?;
    if !resolved.is_dir() {
        return Err(SandboxError::unreadable(
            path,
            "editable path is not a directory",
        ));
    }
    Ok(resolved)
}

/// Resolves on the first Ctrl-C. The handler is installed immediately, so
/// an early interrupt cannot kill the process while overlays exist.
fn interrupt_signal() -> Shutdown {
    let (tx, mut rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for interrupts");
                // Keep the sender alive so the receiver never resolves.
                std::future::pending::<()>().await;
            }
        }
    });
    Box::pin(async move {
        let interrupted = rx.wait_for(|interrupted| *interrupted).await.is_ok();
        if !interrupted {
            std::future::pending::<()>().await;
        }
    })
}
