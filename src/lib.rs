pub mod bridge;
pub mod forward;
pub mod handler;
pub mod pty;
pub mod server;
pub mod sftp;
