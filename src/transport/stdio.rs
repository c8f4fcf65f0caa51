use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use super::{Connection, TransportError};

/// Maximum bytes per newline-delimited frame (4 MiB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// How long a child process gets to exit on its own after stdin closes.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Newline-delimited JSON over a byte pipe.
///
/// Used for the proxy's own stdin/stdout, for spawned server processes, and
/// for any in-memory pipe (e.g. `tokio::io::duplex`).
pub struct StdioConnection {
    label: String,
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    buf: Vec<u8>,
    /// Bytes of an oversized line consumed so far; the rest is discarded.
    oversized: Option<usize>,
    child: Option<Child>,
    closed: bool,
}

enum Line {
    Frame(Vec<u8>),
    Oversized(usize),
    Eof,
}

impl StdioConnection {
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            label: label.into(),
            reader: BufReader::new(Box::new(reader) as BoxedReader),
            writer: Box::new(writer),
            buf: Vec::new(),
            oversized: None,
            child: None,
            closed: false,
        }
    }

    /// The proxy's own stdin/stdout.
    pub fn process_stdio() -> Self {
        Self::new("upstream", tokio::io::stdin(), tokio::io::stdout())
    }

    /// Spawn `command` and talk to it over its stdin/stdout.
    ///
    /// stderr is inherited. The child is killed if the connection is dropped
    /// without being closed.
    pub fn spawn(
        label: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Spawn {
                command: command.to_string(),
                source: std::io::Error::other("child stdio was not captured"),
            });
        };

        let mut conn = Self::new(label, stdout, stdin);
        conn.child = Some(child);
        Ok(conn)
    }

    /// Read up to the next newline without holding more than
    /// `MAX_FRAME_BYTES` of it.
    ///
    /// All progress lives in `self`, so a cancelled call resumes on the same
    /// line.
    async fn read_line(&mut self) -> Result<Line, TransportError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if let Some(len) = self.oversized.take() {
                    return Ok(Line::Oversized(len));
                }
                if self.buf.is_empty() {
                    return Ok(Line::Eof);
                }
                return Ok(Line::Frame(std::mem::take(&mut self.buf)));
            }

            let (used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            match self.oversized.as_mut() {
                Some(len) => *len += used,
                None => {
                    self.buf.extend_from_slice(&available[..used]);
                    let content = self.buf.len() - usize::from(done);
                    if content > MAX_FRAME_BYTES {
                        self.oversized = Some(self.buf.len());
                        self.buf = Vec::new();
                    }
                }
            }
            self.reader.consume(used);

            if done {
                if let Some(len) = self.oversized.take() {
                    return Ok(Line::Oversized(len));
                }
                return Ok(Line::Frame(std::mem::take(&mut self.buf)));
            }
        }
    }
}

#[async_trait]
impl Connection for StdioConnection {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.writer.write_all(frame).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            match self.read_line().await? {
                Line::Eof => return Ok(None),
                Line::Oversized(len) => {
                    tracing::warn!(
                        label = %self.label,
                        len,
                        limit = MAX_FRAME_BYTES,
                        "frame exceeds size limit, skipping"
                    );
                    return Err(TransportError::FrameTooLarge { len });
                }
                Line::Frame(raw) => {
                    let trimmed = raw.trim_ascii();
                    if !trimmed.is_empty() {
                        return Ok(Some(trimmed.to_vec()));
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(label = %self.label, error = %e, "shutdown of pipe writer failed");
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(label = %self.label, %status, "server process exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(label = %self.label, error = %e, "wait on server process failed");
                }
                Err(_) => {
                    tracing::warn!(label = %self.label, "server process did not exit, killing");
                    child.kill().await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::transport::frames;

    #[tokio::test]
    async fn splits_lines_and_skips_blanks() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, mut server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let mut conn = StdioConnection::new("test", client_read, client_write);

        server_write
            .write_all(b"{\"a\":1}\n\n  \r\n{\"b\":2}\r\n{\"c\":3}")
            .await
            .unwrap();
        drop(server_write);
        drop(server_read);

        let got: Vec<Vec<u8>> = frames(&mut conn)
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(
            got,
            vec![
                b"{\"a\":1}".to_vec(),
                b"{\"b\":2}".to_vec(),
                b"{\"c\":3}".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn oversized_frame_is_reported_and_skipped() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_, mut server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let mut conn = StdioConnection::new("test", client_read, client_write);

        let writer = tokio::spawn(async move {
            let big = vec![b'x'; MAX_FRAME_BYTES + 10];
            server_write.write_all(&big).await.unwrap();
            server_write.write_all(b"\n{\"ok\":true}\n").await.unwrap();
            drop(server_write);
        });

        match conn.recv().await {
            Err(TransportError::FrameTooLarge { len }) => assert_eq!(len, MAX_FRAME_BYTES + 11),
            other => panic!("expected an oversized frame, got {other:?}"),
        }
        assert!(conn.buf.capacity() <= MAX_FRAME_BYTES + 64 * 1024);
        assert_eq!(conn.recv().await.unwrap(), Some(b"{\"ok\":true}".to_vec()));
        assert_eq!(conn.recv().await.unwrap(), None);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn frame_at_the_limit_is_accepted() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_server_read, mut server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let mut conn = StdioConnection::new("test", client_read, client_write);

        let writer = tokio::spawn(async move {
            let mut line = vec![b'y'; MAX_FRAME_BYTES];
            line.push(b'\n');
            server_write.write_all(&line).await.unwrap();
        });

        let frame = conn.recv().await.unwrap().unwrap();
        assert_eq!(frame.len(), MAX_FRAME_BYTES);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn send_appends_newline() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let mut conn = StdioConnection::new("test", client_read, client_write);

        conn.send(b"{\"jsonrpc\":\"2.0\"}").await.unwrap();
        let mut reader = BufReader::new(server_read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"jsonrpc\":\"2.0\"}\n");

        conn.close().await.unwrap();
        assert!(matches!(conn.send(b"{}").await, Err(TransportError::Closed)));
        assert!(conn.recv().await.unwrap().is_none());
    }
}
