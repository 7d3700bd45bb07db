use anyhow::{Context, Result};
use pty_process::Size;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;

/// Picks the shell for an interactive session: configured shell, then the
/// environment's default shell, then plain `sh`.
pub fn resolve_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured {
        if !shell.is_empty() {
            return shell.to_string();
        }
    }
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => "sh".to_string(),
    }
}

pub struct PtySession {
    pty: pty_process::Pty,
    child: Child,
}

impl PtySession {
    pub fn spawn(shell: &str, term: &str, cols: u16, rows: u16) -> Result<Self> {
        let (pty, pts) = pty_process::open().context("Failed to create PTY")?;

        pty.resize(Size::new(rows, cols))
            .context("Failed to set initial PTY size")?;

        let child = pty_process::Command::new(shell)
            .env("TERM", term)
            .spawn(pts)
            .with_context(|| format!("Failed to spawn shell: {}", shell))?;

        Ok(Self { pty, child })
    }

    pub fn into_parts(self) -> (PtyReader, PtyWriter, Child) {
        let (reader, writer) = self.pty.into_split();
        (PtyReader { reader }, PtyWriter { writer }, self.child)
    }
}

pub struct PtyReader {
    reader: pty_process::OwnedReadPty,
}

impl PtyReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf).await
    }
}

pub struct PtyWriter {
    writer: pty_process::OwnedWritePty,
}

impl PtyWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data).await
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.writer
            .resize(Size::new(rows, cols))
            .context("Failed to resize PTY")
    }
}
