use anyhow::{Context, Result};
use clap::Parser;
use russh::server::{Config, Server as _};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use minisshd::server::{self, AllowFlags, SshServer};

#[derive(Parser, Debug)]
#[command(name = "minisshd")]
#[command(about = "Portable SSH server with permissioned forwarding, exec, PTY and SFTP")]
#[command(version)]
struct Args {
    /// SSH server host (e.g. 127.0.0.1); all interfaces if omitted
    #[arg(long, default_value = "")]
    host: String,

    /// SSH server port
    #[arg(short = 'p', long, default_value_t = 2222)]
    port: u16,

    /// Listen on a Unix-domain socket instead of TCP
    #[arg(long, conflicts_with_all = ["host", "port"])]
    unix_socket: Option<String>,

    /// Shell for PTY sessions (defaults to $SHELL, then sh)
    #[arg(long)]
    shell: Option<String>,

    /// SSH user as name:password (repeatable; empty password permits "none" auth)
    #[arg(long = "user")]
    users: Vec<String>,

    /// Path to an OpenSSH host key (an ephemeral key is generated if omitted)
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// Honor tcpip-forward global requests
    #[arg(long)]
    allow_tcpip_forward: bool,

    /// Honor direct-tcpip channel opens
    #[arg(long)]
    allow_direct_tcpip: bool,

    /// Honor exec and pty-req session requests
    #[arg(long)]
    allow_execute: bool,

    /// Honor the sftp subsystem
    #[arg(long)]
    allow_sftp: bool,

    /// Honor streamlocal-forward global requests
    #[arg(long)]
    allow_streamlocal_forward: bool,

    /// Honor direct-streamlocal channel opens
    #[arg(long)]
    allow_direct_streamlocal: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("minisshd=info".parse()?))
        .init();

    let args = Args::parse();

    let users = server::parse_users(&args.users)?;
    let flags = AllowFlags {
        tcpip_forward: args.allow_tcpip_forward,
        direct_tcpip: args.allow_direct_tcpip,
        execute: args.allow_execute,
        sftp: args.allow_sftp,
        streamlocal_forward: args.allow_streamlocal_forward,
        direct_streamlocal: args.allow_direct_streamlocal,
    };
    let policy = flags.into_policy(args.shell.clone());
    info!("Effective permissions: {:?}", policy);

    let host_key = match &args.host_key {
        Some(path) => server::load_host_key(path)?,
        None => server::generate_host_key(),
    };

    let config = Arc::new(server::create_config(host_key));
    let mut server = SshServer::new(users, policy);

    match &args.unix_socket {
        Some(path) => {
            let listener = UnixListener::bind(path)
                .with_context(|| format!("Failed to bind to {}", path))?;
            info!("SSH server listening on {}", path);
            run_on_unix_socket(server, config, listener).await
        }
        None => {
            let host = if args.host.is_empty() {
                "0.0.0.0"
            } else {
                &args.host
            };
            let address = format!("{}:{}", host, args.port);
            let listener = TcpListener::bind(&address)
                .await
                .with_context(|| format!("Failed to bind to {}", address))?;
            info!("SSH server listening on {}", address);
            server.run_on_socket(config, &listener).await?;
            Ok(())
        }
    }
}

/// Accept loop for `--unix-socket` mode. A failed handshake closes only the
/// offending connection; the loop keeps accepting.
async fn run_on_unix_socket(
    mut server: SshServer,
    config: Arc<Config>,
    listener: UnixListener,
) -> Result<()> {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                continue;
            }
        };
        let handler = server.new_client(None);
        let config = config.clone();
        tokio::spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        info!("connection closed with error: {}", e);
                    }
                }
                Err(e) => info!("ssh handshake failed: {}", e),
            }
        });
    }
}
