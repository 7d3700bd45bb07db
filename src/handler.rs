use crate::bridge;
use crate::forward::{self, ForwardRegistry};
use crate::pty::{PtySession, PtyWriter, resolve_shell};
use crate::server::{Policy, SshUser};
use crate::sftp::SftpHandler;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// PTY state for one session channel. The writer doubles as the resize
/// handle for later `window-change` requests; the child is shared with the
/// reader task so whichever side finishes first can reap it.
struct SessionPty {
    writer: Arc<Mutex<PtyWriter>>,
    child: Arc<Mutex<Child>>,
}

pub struct ClientHandler {
    users: Arc<Vec<SshUser>>,
    policy: Arc<Policy>,
    client_addr: String,
    channels: HashMap<ChannelId, Channel<Msg>>,
    ptys: HashMap<ChannelId, SessionPty>,
    forwards: ForwardRegistry,
}

impl ClientHandler {
    pub fn new(users: Arc<Vec<SshUser>>, policy: Arc<Policy>, client_addr: String) -> Self {
        Self {
            users,
            policy,
            client_addr,
            channels: HashMap::new(),
            ptys: HashMap::new(),
            forwards: ForwardRegistry::default(),
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // ForwardRegistry closes its listeners on drop, so every forward
        // dies with the connection.
        debug!("Connection closed from {}", self.client_addr);
    }
}

fn pty_dim(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

/// Splits an `exec` payload into argv with POSIX quoting rules.
fn parse_command(payload: &[u8]) -> anyhow::Result<Vec<String>> {
    let command = std::str::from_utf8(payload)?;
    let argv = shell_words::split(command)?;
    if argv.is_empty() {
        anyhow::bail!("empty command");
    }
    Ok(argv)
}

/// Runs one exec child: channel data feeds stdin, stdout and stderr are
/// multiplexed back onto the channel, and the child's exit code is reported
/// via `exit-status` before the channel closes.
async fn run_exec(channel: Channel<Msg>, mut child: Child, handle: Handle, id: ChannelId) {
    let (mut channel_read, mut channel_write) = tokio::io::split(channel.into_stream());

    let stdin_task = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut channel_read, &mut stdin).await;
            let _ = stdin.shutdown().await;
        })
    });

    let stdout_task = child.stdout.take().map(|mut stdout| {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stdout, &mut channel_write).await;
        })
    });

    let stderr_handle = handle.clone();
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = CryptoVec::from_slice(&buf[..n]);
                        if stderr_handle.extended_data(id, 1, data).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    });

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(0) as u32,
        Err(e) => {
            info!("failed to wait for exec child: {}", e);
            0
        }
    };

    // Flush remaining output before reporting the exit status.
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    if let Some(task) = stdin_task {
        task.abort();
    }

    let _ = handle.exit_status_request(id, exit_code).await;
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
    debug!("exec finished with status {} on {:?}", exit_code, id);
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self
            .users
            .iter()
            .any(|u| u.name == user && u.password.is_empty())
        {
            info!(
                "Accepting none auth for user: {} from {}",
                user, self.client_addr
            );
            return Ok(Auth::Accept);
        }
        debug!(
            "Rejecting none auth for user: {} from {}",
            user, self.client_addr
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self
            .users
            .iter()
            .any(|u| u.name == user && u.password == password)
        {
            info!(
                "Accepting password auth for user: {} from {}",
                user, self.client_addr
            );
            return Ok(Auth::Accept);
        }
        info!(
            "Password rejected for user: {} from {}",
            user, self.client_addr
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Channel open session: {:?} from {}",
            channel.id(),
            self.client_addr
        );
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.policy.allow_execute {
            info!("execution not allowed (exec) from {}", self.client_addr);
            session.channel_failure(channel)?;
            return Ok(());
        }
        let argv = match parse_command(data) {
            Ok(argv) => argv,
            Err(e) => {
                info!(
                    "failed to parse exec command from {}: {}",
                    self.client_addr, e
                );
                session.channel_failure(channel)?;
                return Ok(());
            }
        };
        let Some(chan) = self.channels.remove(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        debug!("exec {:?} for {}", argv, self.client_addr);

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                info!("failed to spawn {}: {}", argv[0], e);
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        session.channel_success(channel)?;
        tokio::spawn(run_exec(chan, child, session.handle(), channel));
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Only the default shell is served; the interactive session itself
        // is driven by the PTY allocated in pty_request.
        debug!(
            "Shell request for channel {:?} from {}",
            channel, self.client_addr
        );
        session.channel_success(channel)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.policy.allow_execute {
            info!("execution not allowed (pty-req) from {}", self.client_addr);
            session.channel_failure(channel)?;
            return Ok(());
        }
        let (cols, rows) = (pty_dim(col_width), pty_dim(row_height));
        let shell = resolve_shell(self.policy.shell.as_deref());
        debug!(
            "PTY request for channel {:?}: {} at {}x{} from {}",
            channel, shell, cols, rows, self.client_addr
        );

        let pty = match PtySession::spawn(&shell, term, cols, rows) {
            Ok(pty) => pty,
            Err(e) => {
                warn!("Failed to allocate PTY for {}: {}", self.client_addr, e);
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        // Client data reaches the PTY through the data callback; the channel
        // object itself is no longer needed.
        self.channels.remove(&channel);

        let (mut reader, writer, child) = pty.into_parts();
        let child = Arc::new(Mutex::new(child));
        self.ptys.insert(
            channel,
            SessionPty {
                writer: Arc::new(Mutex::new(writer)),
                child: child.clone(),
            },
        );
        session.channel_success(channel)?;

        let handle = session.handle();
        let client_addr = self.client_addr.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = CryptoVec::from_slice(&buf[..n]);
                        if handle.data(channel, data).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::WouldBlock {
                            break;
                        }
                    }
                }
            }
            let _ = handle.exit_status_request(channel, 0).await;
            let _ = handle.close(channel).await;
            // If the transport died rather than the shell, the shell is
            // still running; make sure it goes down with the session.
            let mut child = child.lock().await;
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!("PTY session closed for {}", client_addr);
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pty) = self.ptys.get(&channel) {
            let mut writer = pty.writer.lock().await;
            if let Err(e) = writer.write_all(data).await {
                warn!("Failed to write to PTY for {}: {}", self.client_addr, e);
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (cols, rows) = (pty_dim(col_width), pty_dim(row_height));
        debug!(
            "Window change for channel {:?}: {}x{} from {}",
            channel, cols, rows, self.client_addr
        );

        // A window-change before pty-req has nothing to resize and is not an
        // error. This request never gets a reply.
        if let Some(pty) = self.ptys.get(&channel) {
            let writer = pty.writer.lock().await;
            if let Err(e) = writer.resize(cols, rows) {
                warn!("Failed to resize PTY for {}: {}", self.client_addr, e);
            }
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            info!("unsupported subsystem '{}' from {}", name, self.client_addr);
            session.channel_failure(channel)?;
            return Ok(());
        }
        if !self.policy.allow_sftp {
            info!("sftp not allowed from {}", self.client_addr);
            session.channel_failure(channel)?;
            return Ok(());
        }
        let Some(chan) = self.channels.remove(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        info!("Starting sftp subsystem for {}", self.client_addr);
        session.channel_success(channel)?;

        let handle = session.handle();
        tokio::spawn(async move {
            russh_sftp::server::run(chan.into_stream(), SftpHandler::new()).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?} from {}", channel, self.client_addr);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel close: {:?} from {}", channel, self.client_addr);
        self.channels.remove(&channel);
        if let Some(pty) = self.ptys.remove(&channel) {
            // Closing the channel ends the interactive session: kill the
            // shell and reap it.
            tokio::spawn(async move {
                let mut child = pty.child.lock().await;
                let _ = child.start_kill();
                let _ = child.wait().await;
            });
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.policy.allow_direct_tcpip {
            info!("direct-tcpip not allowed (from {})", self.client_addr);
            return Ok(false);
        }
        debug!(
            "direct-tcpip from {} to {}:{} (originator {}:{})",
            self.client_addr, host_to_connect, port_to_connect, originator_address, originator_port
        );

        let host = host_to_connect.to_string();
        let port = port_to_connect as u16;
        let handle = session.handle();
        let id = channel.id();
        tokio::spawn(async move {
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(socket) => bridge::couple(channel.into_stream(), socket).await,
                Err(e) => {
                    info!("failed to dial {}:{}: {}", host, port, e);
                    let _ = handle.close(id).await;
                }
            }
        });
        Ok(true)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.policy.allow_direct_streamlocal {
            info!("direct-streamlocal not allowed (from {})", self.client_addr);
            return Ok(false);
        }
        debug!(
            "direct-streamlocal from {} to {}",
            self.client_addr, socket_path
        );

        let path = socket_path.to_string();
        let handle = session.handle();
        let id = channel.id();
        tokio::spawn(async move {
            match UnixStream::connect(&path).await {
                Ok(socket) => bridge::couple(channel.into_stream(), socket).await,
                Err(e) => {
                    info!("failed to dial unix socket {}: {}", path, e);
                    let _ = handle.close(id).await;
                }
            }
        });
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.policy.allow_tcpip_forward {
            info!("tcpip-forward not allowed (from {})", self.client_addr);
            return Ok(false);
        }
        let bind_host = if address.is_empty() { "0.0.0.0" } else { address };
        let listener = match TcpListener::bind((bind_host, *port as u16)).await {
            Ok(listener) => listener,
            Err(e) => {
                info!("failed to bind {}:{}: {}", bind_host, port, e);
                return Ok(false);
            }
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port() as u32,
            Err(e) => {
                info!("failed to read bound address: {}", e);
                return Ok(false);
            }
        };
        // Port 0 requests dynamic allocation; the reply carries the port we
        // actually bound.
        *port = bound_port;
        info!(
            "tcpip-forward listening on {}:{} for {}",
            bind_host, bound_port, self.client_addr
        );

        let task = forward::spawn_tcp_acceptor(
            listener,
            session.handle(),
            address.to_string(),
            bound_port,
        );
        self.forwards.insert_tcp(address.to_string(), bound_port, task);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let found = self.forwards.cancel_tcp(address, port);
        info!(
            "cancel-tcpip-forward {}:{} from {} ({})",
            address,
            port,
            self.client_addr,
            if found { "closed" } else { "no such listener" }
        );
        Ok(found)
    }

    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.policy.allow_streamlocal_forward {
            info!("streamlocal-forward not allowed (from {})", self.client_addr);
            return Ok(false);
        }
        let listener = match UnixListener::bind(socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                info!("failed to bind unix socket {}: {}", socket_path, e);
                return Ok(false);
            }
        };
        info!(
            "streamlocal-forward listening on {} for {}",
            socket_path, self.client_addr
        );

        let task =
            forward::spawn_unix_acceptor(listener, session.handle(), socket_path.to_string());
        self.forwards.insert_unix(socket_path.to_string(), task);
        Ok(true)
    }

    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let found = self.forwards.cancel_unix(socket_path);
        info!(
            "cancel-streamlocal-forward {} from {} ({})",
            socket_path,
            self.client_addr,
            if found { "closed" } else { "no such listener" }
        );
        Ok(found)
    }

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Environment variables are not propagated to children; the request
        // is dropped without a reply.
        debug!(
            "env request {}={} from {} dropped",
            variable_name,
            variable_value.chars().take(50).collect::<String>(),
            self.client_addr
        );
        Ok(())
    }

    async fn signal(
        &mut self,
        _channel: ChannelId,
        signal: russh::Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Signal delivery to exec/PTY children is not implemented.
        debug!("signal {:?} from {} dropped", signal, self.client_addr);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        _channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // X11 forwarding is not served; no reply, so clients that request it
        // habitually still get their session.
        debug!("x11 forwarding request from {} dropped", self.client_addr);
        Ok(())
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // No agent socket on this server.
        debug!("agent forwarding refused for {}", self.client_addr);
        Ok(false)
    }
}
