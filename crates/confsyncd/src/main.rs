//! confsyncd - CSI plugin serving continuously synchronized configuration
//! volumes.
//!
//! Runs the Identity service plus the Controller and/or Node services on a
//! unix socket or TCP endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use confsync::filesystem::HostMounts;
use confsync::{NodeConfig, VolumeManager};
use confsync_common::ConfsyncPaths;
use confsync_common::paths::DEFAULT_ENDPOINT;

mod endpoint;
mod grpc;
mod http_worker;

use endpoint::{Endpoint, remove_stale_socket};
use grpc::csi::controller_server::ControllerServer;
use grpc::csi::identity_server::IdentityServer;
use grpc::csi::node_server::NodeServer;
use grpc::{ControllerService, IdentityService, NodeService};
use http_worker::HttpWorkerFactory;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSI endpoint (unix://<path> or tcp://<host:port>)
    #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: Endpoint,

    /// Serve the Controller service
    #[arg(long, env = "CONFSYNC_CONTROLLER")]
    controller: bool,

    /// Serve the Node service with this node ID
    #[arg(long = "node", env = "CONFSYNC_NODE_ID", value_name = "ID")]
    node_id: Option<String>,

    /// Persisted node state
    #[arg(long, env = "CONFSYNC_STATE", default_value_os_t = ConfsyncPaths::default().state_file())]
    state: PathBuf,

    /// Plugin name reported to the orchestrator
    #[arg(long, env = "CONFSYNC_DRIVER_NAME", default_value = "csi.confsync.io")]
    driver_name: String,

    /// Also accept SINGLE_NODE_WRITER volumes
    #[arg(long, env = "CONFSYNC_ALLOW_SINGLE_WRITER")]
    allow_single_writer: bool,

    /// Log output format
    #[arg(long, env = "CONFSYNC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_tracing(&args)?;

    if !args.controller && args.node_id.is_none() {
        return Err(eyre!("nothing to serve, pass --controller and/or --node <ID>"));
    }

    let manager = match &args.node_id {
        Some(node_id) => Some(Arc::new(start_node(&args, node_id.clone()).await?)),
        None => None,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let mut server = Server::builder()
        .trace_fn(|req| tracing::info_span!("grpc", method = %req.uri().path()));
    let router = server
        .add_service(IdentityServer::new(IdentityService::new(&args.driver_name)))
        .add_optional_service(args.controller.then(|| {
            ControllerServer::new(ControllerService::new(args.allow_single_writer))
        }))
        .add_optional_service(
            manager
                .as_ref()
                .map(|manager| NodeServer::new(NodeService::new(Arc::clone(manager)))),
        );

    tracing::info!(
        endpoint = %args.endpoint,
        driver = %args.driver_name,
        controller = args.controller,
        node = args.node_id.as_deref().unwrap_or("-"),
        "confsyncd started"
    );

    let signal = {
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    };
    match &args.endpoint {
        Endpoint::Unix(path) => {
            remove_stale_socket(path)
                .wrap_err_with(|| format!("failed to remove {}", path.display()))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = tokio::net::UnixListener::bind(path)
                .wrap_err_with(|| format!("failed to listen on {}", args.endpoint))?;
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal)
                .await?;
        }
        Endpoint::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr.as_str())
                .await
                .wrap_err_with(|| format!("failed to listen on {}", args.endpoint))?;
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                .await?;
        }
    }

    if let Some(manager) = manager {
        manager.stop_all().await;
    }
    tracing::info!("confsyncd stopped");

    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let default = if args.debug {
        "confsync=debug,confsyncd=debug"
    } else {
        "confsync=info,confsyncd=info"
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;

    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
    Ok(())
}

/// Open the node state and restart workers for volumes staged before.
async fn start_node(args: &Args, node_id: String) -> Result<VolumeManager> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .wrap_err("failed to build HTTP client")?;

    if let Some(parent) = args.state.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = VolumeManager::new(
        NodeConfig {
            node_id,
            state_file: args.state.clone(),
            allow_single_writer: args.allow_single_writer,
        },
        Arc::new(HostMounts),
        Arc::new(HttpWorkerFactory::new(client)),
    )
    .wrap_err_with(|| format!("failed to open state {}", args.state.display()))?;

    manager.recover().await;
    Ok(manager)
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for SIGINT");
            }
        }
        () = terminate => {}
    }

    tracing::info!("Shutting down");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_and_flags() {
        let args = Args::try_parse_from(["confsyncd", "--node", "n1"]).unwrap();
        assert_eq!(args.endpoint, Endpoint::Unix(PathBuf::from("/csi/csi.sock")));
        assert_eq!(args.node_id.as_deref(), Some("n1"));
        assert_eq!(args.driver_name, "csi.confsync.io");
        assert_eq!(args.log_format, LogFormat::Text);
        assert!(!args.controller);

        let args = Args::try_parse_from([
            "confsyncd",
            "--controller",
            "--endpoint",
            "tcp://0.0.0.0:10000",
            "--log-format",
            "json",
            "--allow-single-writer",
        ])
        .unwrap();
        assert!(args.controller);
        assert!(args.allow_single_writer);
        assert_eq!(args.endpoint, Endpoint::Tcp("0.0.0.0:10000".into()));
        assert_eq!(args.log_format, LogFormat::Json);

        assert!(Args::try_parse_from(["confsyncd", "--endpoint", "http://x"]).is_err());
    }
}
