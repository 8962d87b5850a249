use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use facade_bridge::config::AppConfig;
use facade_bridge::launcher::{InterpreterLauncher, ProxyEnv};
use facade_bridge::rpc::{BindMode, ConnectionEvent, MethodRegistry, RpcClient, RpcServer};
use facade_bridge::{facades, logging};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "facade-bridge")]
#[command(about = "JSON-RPC bridge between interpreter processes and facades", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./facade-bridge.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until Ctrl-C
    Serve(ServerArgs),
    /// Run the server for the lifetime of one interpreter process
    Run {
        #[command(flatten)]
        server: ServerArgs,
        /// Interpreter program and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        program: Vec<String>,
    },
    /// Call a method on a running server
    Call {
        method: String,
        /// Positional parameters; each is parsed as JSON, or taken as a string
        params: Vec<String>,
        /// Server address (default: from AP_HOST/AP_PORT)
        #[arg(long, requires = "secret")]
        addr: Option<SocketAddr>,
        /// Handshake secret (default: from AP_HANDSHAKE)
        #[arg(long, requires = "addr")]
        secret: Option<String>,
    },
    /// Show help for the built-in methods
    Methods { name: Option<String> },
    /// Print the effective configuration
    Config(ServerArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    bind: Option<BindMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    handshake_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    shutdown_grace_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    event_queue_capacity: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short, long, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = match &cli.command {
        Commands::Serve(args) | Commands::Config(args) => Some(args),
        Commands::Run { server, .. } => Some(server),
        _ => None,
    };
    let config = AppConfig::new(cli.config.as_deref(), overrides)?;
    logging::init(config.log_config());

    match cli.command {
        Commands::Serve(_) => run_server(&config).await.context("RPC server failed")?,
        Commands::Run { program, .. } => run_interpreter(&config, program)
            .await
            .context("Failed to run interpreter")?,
        Commands::Call {
            method,
            params,
            addr,
            secret,
        } => run_call(method, params, addr, secret)
            .await
            .context("RPC call failed")?,
        Commands::Methods { name } => print_methods(name.as_deref())?,
        Commands::Config(_) => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn start_server(config: &AppConfig) -> Result<(RpcServer, ProxyEnv)> {
    let server = RpcServer::new(config.server_settings(), facades::all())?;
    server.start(config.bind).await?;
    let env = server
        .proxy_env()
        .context("RPC server did not report its address")?;

    let mut connections = server.subscribe();
    tokio::spawn(async move {
        loop {
            match connections.recv().await {
                Ok(ConnectionEvent::Connected { peer }) => info!(peer = %peer, "Client connected"),
                Ok(ConnectionEvent::Disconnected { peer }) => {
                    info!(peer = %peer, "Client disconnected")
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    Ok((server, env))
}

async fn stop_server(server: &RpcServer) {
    let report = server.stop().await;
    for failure in &report.failures {
        warn!(
            receiver = %failure.receiver,
            error = %failure.error,
            "Receiver did not shut down cleanly"
        );
    }
}

/// Serve until `signal` resolves. The server is stopped even when waiting
/// for the signal fails.
async fn serve_until<F>(server: &RpcServer, signal: F) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let waited = signal.await.context("Failed to listen for Ctrl-C");
    info!("Shutting down");
    stop_server(server).await;
    waited
}

async fn run_server(config: &AppConfig) -> Result<()> {
    let (server, env) = start_server(config).await?;
    for (key, value) in env.vars() {
        println!("export {}={}", key, value);
    }

    serve_until(&server, tokio::signal::ctrl_c()).await
}

async fn run_interpreter(config: &AppConfig, program: Vec<String>) -> Result<()> {
    let Some((name, args)) = program.split_first() else {
        bail!("No interpreter program given");
    };
    let (server, env) = start_server(config).await?;
    let launcher = InterpreterLauncher::new(name.as_str()).args(args.iter().cloned());

    let status = tokio::select! {
        status = launcher.run(&env) => Some(status),
        _ = tokio::signal::ctrl_c() => None,
    };
    stop_server(&server).await;

    match status {
        Some(status) => {
            let status = status?;
            if !status.success() {
                bail!("{} exited with {}", name, status);
            }
        }
        None => info!("Interrupted"),
    }
    Ok(())
}

async fn run_call(
    method: String,
    params: Vec<String>,
    addr: Option<SocketAddr>,
    secret: Option<String>,
) -> Result<()> {
    let (addr, secret) = match (addr, secret) {
        (Some(addr), Some(secret)) => (addr, secret),
        _ => {
            let env = ProxyEnv::from_env()?;
            (env.socket_addr()?, env.secret)
        }
    };

    let params = params
        .into_iter()
        .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
        .collect();

    let mut client = RpcClient::connect(addr, &secret).await?;
    let result = client.call(&method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn print_methods(name: Option<&str>) -> Result<()> {
    let registry = MethodRegistry::from_types(&facades::all())?;

    match name {
        Some(name) => {
            let method = registry
                .resolve(name)
                .with_context(|| format!("Unknown RPC: {}", name))?;
            println!("{}", method.help());
        }
        None => {
            for method in registry.list() {
                println!("{}\n", method.help());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use facade_bridge::rpc::ReceiverState;

    #[tokio::test]
    async fn signal_failure_still_shuts_down_receivers() {
        let config = AppConfig::default();
        let (server, env) = start_server(&config).await.unwrap();

        let mut client = RpcClient::connect(env.socket_addr().unwrap(), &env.secret)
            .await
            .unwrap();
        client.call("ping", vec![]).await.unwrap();
        assert_eq!(
            server.receivers().state(facades::system::NAME),
            Some(ReceiverState::Active)
        );

        let failed = async { Err::<(), _>(io::Error::other("no signal handler")) };
        let err = serve_until(&server, failed).await.unwrap_err();
        assert!(err.to_string().contains("Ctrl-C"));
        assert_eq!(
            server.receivers().state(facades::system::NAME),
            Some(ReceiverState::ShutDown)
        );
    }
}
