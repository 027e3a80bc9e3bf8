use clap::Parser;
use lsproxy_core::{
    control, spawn_passthrough, spawn_relay, supervisor, RelayOptions, RelayStreams, Supervisor,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Shell command that starts the language server
    #[arg(long)]
    server: String,

    /// Workspace root the server is analysing; defaults to the current
    /// directory
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Directory the control-plane discovery file is written under;
    /// defaults to the current directory
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Process id to watch; the server is shut down once it exits
    #[arg(long)]
    parent_pid: Option<u32>,

    /// Timeout for proxy-originated requests, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = lsproxy_core::load_config()?;
    if let Some(timeout_ms) = cli.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    if cli.debug {
        config.debug = true;
    }

    // stdout is the protocol channel, so logs go to stderr.
    let filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if config.debug {
        debug!("Debug logging enabled");
        debug!("Config: {:?}", config);
    }

    let current_dir = std::env::current_dir()?;
    let workspace = cli
        .workspace
        .unwrap_or_else(|| current_dir.clone())
        .to_string_lossy()
        .into_owned();
    let workdir = cli.workdir.unwrap_or(current_dir);

    let (server_supervisor, server_io) = Supervisor::spawn(&cli.server, HashMap::new(), &workspace)?;
    supervisor::spawn_stderr_logger(server_io.stderr);

    if let Some(parent_pid) = cli.parent_pid {
        supervisor::watch_parent(server_supervisor.clone(), parent_pid);
    }

    let streams = RelayStreams {
        client_reader: Box::new(tokio::io::stdin()),
        client_writer: Box::new(tokio::io::stdout()),
        server_reader: Box::new(server_io.stdout),
        server_writer: Box::new(server_io.stdin),
    };
    let (relay, events) = spawn_relay(
        streams,
        RelayOptions {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            workspace_root: workspace.clone(),
        },
    );
    let mut closed = spawn_passthrough(events);

    let mut discovery_file = None;
    if config.control_plane {
        let listener = control::bind_control_listener().await?;
        let port = listener.local_addr()?.port();
        discovery_file = Some(control::write_discovery_file(&workdir, &workspace, port)?);

        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = control::serve_control(listener, relay).await {
                error!("control plane server error: {}", e);
            }
        });
    }

    let server_exit_code = tokio::select! {
        _ = closed.recv() => {
            info!("client stream closed, shutting down");
            None
        }
        status = server_supervisor.wait() => {
            info!("language server exited");
            status.and_then(|status| status.code())
        }
    };

    server_supervisor.terminate().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), server_supervisor.wait()).await;

    if let Some(path) = discovery_file {
        control::remove_discovery_file(&path);
    }

    // Forward the server's own exit status; a shutdown we initiated is a
    // clean exit.
    if let Some(code) = server_exit_code {
        if code != 0 {
            std::process::exit(code);
        }
    }

    Ok(())
}
