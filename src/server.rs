use crate::handler::ClientHandler;
use anyhow::{Context, Result, bail};
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Config, Server};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Which request categories this server honors. Built once at startup and
/// shared read-only by every connection.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub allow_tcpip_forward: bool,
    pub allow_direct_tcpip: bool,
    pub allow_execute: bool,
    pub allow_sftp: bool,
    pub allow_streamlocal_forward: bool,
    pub allow_direct_streamlocal: bool,
    /// Shell for PTY sessions; `None` falls back to `$SHELL`, then `sh`.
    pub shell: Option<String>,
}

impl Policy {
    pub fn allow_all(shell: Option<String>) -> Self {
        Self {
            allow_tcpip_forward: true,
            allow_direct_tcpip: true,
            allow_execute: true,
            allow_sftp: true,
            allow_streamlocal_forward: true,
            allow_direct_streamlocal: true,
            shell,
        }
    }
}

/// Explicit `--allow-*` selections from the command line. If none is set,
/// every permission defaults to on; if any is set, the unset ones are off.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowFlags {
    pub tcpip_forward: bool,
    pub direct_tcpip: bool,
    pub execute: bool,
    pub sftp: bool,
    pub streamlocal_forward: bool,
    pub direct_streamlocal: bool,
}

impl AllowFlags {
    fn any(&self) -> bool {
        self.tcpip_forward
            || self.direct_tcpip
            || self.execute
            || self.sftp
            || self.streamlocal_forward
            || self.direct_streamlocal
    }

    pub fn into_policy(self, shell: Option<String>) -> Policy {
        if !self.any() {
            return Policy::allow_all(shell);
        }
        Policy {
            allow_tcpip_forward: self.tcpip_forward,
            allow_direct_tcpip: self.direct_tcpip,
            allow_execute: self.execute,
            allow_sftp: self.sftp,
            allow_streamlocal_forward: self.streamlocal_forward,
            allow_direct_streamlocal: self.direct_streamlocal,
            shell,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshUser {
    pub name: String,
    pub password: String,
}

/// Parses repeatable `--user name:password` specs. An empty password permits
/// "none" authentication for that user.
pub fn parse_users(specs: &[String]) -> Result<Vec<SshUser>> {
    if specs.is_empty() {
        bail!("No user specified\ne.g. --user \"john:mypass\"\ne.g. --user \"john:\"");
    }
    specs
        .iter()
        .map(|spec| match spec.split_once(':') {
            Some((name, password)) => Ok(SshUser {
                name: name.to_string(),
                password: password.to_string(),
            }),
            None => bail!("invalid user format: {}", spec),
        })
        .collect()
}

pub struct SshServer {
    users: Arc<Vec<SshUser>>,
    policy: Arc<Policy>,
}

impl SshServer {
    pub fn new(users: Vec<SshUser>, policy: Policy) -> Self {
        Self {
            users: Arc::new(users),
            policy: Arc::new(policy),
        }
    }
}

impl Server for SshServer {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer_addr: Option<std::net::SocketAddr>) -> Self::Handler {
        let addr_str = peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        info!("New connection from {}", addr_str);

        ClientHandler::new(self.users.clone(), self.policy.clone(), addr_str)
    }
}

pub fn create_config(host_key: PrivateKey) -> Config {
    Config {
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }
}

pub fn generate_host_key() -> PrivateKey {
    PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).expect("Failed to generate key")
}

pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    let key_data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read host key file: {}", path.display()))?;
    key_data
        .parse::<PrivateKey>()
        .map_err(|e| anyhow::anyhow!("Failed to parse host key: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_means_everything_allowed() {
        let policy = AllowFlags::default().into_policy(None);
        assert!(policy.allow_tcpip_forward);
        assert!(policy.allow_direct_tcpip);
        assert!(policy.allow_execute);
        assert!(policy.allow_sftp);
        assert!(policy.allow_streamlocal_forward);
        assert!(policy.allow_direct_streamlocal);
    }

    #[test]
    fn any_flag_turns_the_rest_off() {
        let flags = AllowFlags {
            execute: true,
            ..Default::default()
        };
        let policy = flags.into_policy(None);
        assert!(policy.allow_execute);
        assert!(!policy.allow_tcpip_forward);
        assert!(!policy.allow_direct_tcpip);
        assert!(!policy.allow_sftp);
        assert!(!policy.allow_streamlocal_forward);
        assert!(!policy.allow_direct_streamlocal);
    }

    #[test]
    fn parse_users_accepts_name_password_pairs() {
        let users = parse_users(&["john:mypass".to_string(), "amy:".to_string()]).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "john");
        assert_eq!(users[0].password, "mypass");
        assert_eq!(users[1].name, "amy");
        assert_eq!(users[1].password, "");
    }

    #[test]
    fn parse_users_keeps_colons_in_passwords() {
        let users = parse_users(&["john:pa:ss".to_string()]).unwrap();
        assert_eq!(users[0].password, "pa:ss");
    }

    #[test]
    fn zero_users_is_a_startup_error() {
        let err = parse_users(&[]).unwrap_err().to_string();
        assert!(err.contains("No user specified"));
        assert!(err.contains("e.g. --user \"john:mypass\""));
        assert!(err.contains("e.g. --user \"john:\""));
    }

    #[test]
    fn malformed_user_spec_is_rejected() {
        let err = parse_users(&["nocolon".to_string()]).unwrap_err().to_string();
        assert!(err.contains("invalid user format: nocolon"));
    }
}
