use std::collections::HashMap;
use std::path::PathBuf;

use russh::server::Handle;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge;

/// A live remote-forward listener: the acceptor task owns the listener, so
/// aborting the task closes it. Unix-domain entries also remember the socket
/// path to unlink on teardown.
struct ForwardGuard {
    task: JoinHandle<()>,
    socket_path: Option<PathBuf>,
}

impl ForwardGuard {
    fn shutdown(self) {
        self.task.abort();
        if let Some(path) = self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Per-connection registry of remote-forward listeners, keyed the way the
/// client cancels them: TCP by (bind address, bound port), Unix by socket
/// path. All access happens on the connection's handler, so a listener can
/// never outlive its connection: dropping the registry closes everything.
#[derive(Default)]
pub struct ForwardRegistry {
    tcp: HashMap<(String, u32), ForwardGuard>,
    unix: HashMap<String, ForwardGuard>,
}

impl ForwardRegistry {
    pub fn insert_tcp(&mut self, addr: String, port: u32, task: JoinHandle<()>) {
        let guard = ForwardGuard { task, socket_path: None };
        if let Some(old) = self.tcp.insert((addr, port), guard) {
            old.shutdown();
        }
    }

    pub fn cancel_tcp(&mut self, addr: &str, port: u32) -> bool {
        match self.tcp.remove(&(addr.to_string(), port)) {
            Some(guard) => {
                guard.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn insert_unix(&mut self, path: String, task: JoinHandle<()>) {
        let socket_path = Some(PathBuf::from(&path));
        if let Some(old) = self.unix.insert(path, ForwardGuard { task, socket_path }) {
            old.shutdown();
        }
    }

    pub fn cancel_unix(&mut self, path: &str) -> bool {
        match self.unix.remove(path) {
            Some(guard) => {
                guard.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.unix.is_empty()
    }

    fn drain(&mut self) {
        for (_, guard) in self.tcp.drain() {
            guard.shutdown();
        }
        for (_, guard) in self.unix.drain() {
            guard.shutdown();
        }
    }
}

impl Drop for ForwardRegistry {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Accept loop for a `tcpip-forward` listener: every inbound connection is
/// carried back to the client over a fresh `forwarded-tcpip` channel. The
/// loop ends when the listener errors or the reverse open fails, which is
/// what happens once the SSH connection is gone.
pub fn spawn_tcp_acceptor(
    listener: TcpListener,
    handle: Handle,
    bind_addr: String,
    bind_port: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    info!("forward listener on {}:{} closed: {}", bind_addr, bind_port, e);
                    break;
                }
            };
            debug!(
                "forwarding {} through {}:{} back to client",
                peer, bind_addr, bind_port
            );
            let channel = match handle
                .channel_open_forwarded_tcpip(
                    bind_addr.clone(),
                    bind_port,
                    peer.ip().to_string(),
                    peer.port() as u32,
                )
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    info!("failed to open forwarded-tcpip channel: {}", e);
                    break;
                }
            };
            tokio::spawn(bridge::couple(channel.into_stream(), socket));
        }
    })
}

/// Accept loop for a `streamlocal-forward@openssh.com` listener.
pub fn spawn_unix_acceptor(
    listener: UnixListener,
    handle: Handle,
    socket_path: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    info!("forward listener on {} closed: {}", socket_path, e);
                    break;
                }
            };
            debug!("forwarding unix connection on {} back to client", socket_path);
            let channel = match handle
                .channel_open_forwarded_streamlocal(socket_path.clone())
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    info!("failed to open forwarded-streamlocal channel: {}", e);
                    break;
                }
            };
            tokio::spawn(bridge::couple(channel.into_stream(), socket));
        }
    })
}
