//! Expect-style interactive session over a shell byte stream.

use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};

use super::buffer::SessionBuffer;
use super::patterns::Pattern;
use crate::error::ChannelError;

/// Configuration for interactive session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout used by `expect` when the caller does not give one.
    pub expect_timeout: Duration,

    /// Upper bound for `read_line` to see a complete line.
    pub line_timeout: Duration,

    /// Appended to every `send_line`.
    pub line_terminator: String,

    /// Size of a single read from the stream.
    pub read_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expect_timeout: Duration::from_secs(15),
            line_timeout: Duration::from_secs(30),
            line_terminator: "\n".to_string(),
            read_chunk: 4096,
        }
    }
}

/// Interactive shell session driven by pattern matching.
///
/// Wraps any bidirectional byte stream (an SSH channel in production, an
/// in-memory pipe in tests). All output read from the stream is kept in a
/// [`SessionBuffer`] in arrival order.
pub struct InteractiveSession {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    buffer: SessionBuffer,
    config: SessionConfig,
    eof: bool,
    closed: bool,
}

impl InteractiveSession {
    /// Create a session over `stream`.
    pub fn new<S>(stream: S, config: SessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            buffer: SessionBuffer::new(),
            config,
            eof: false,
            closed: false,
        }
    }

    /// Wait until `pattern` appears in the unconsumed output.
    ///
    /// Returns the output that preceded the match. The match itself and
    /// everything before it are consumed.
    pub async fn expect(
        &mut self,
        pattern: &Pattern,
        timeout: Duration,
    ) -> Result<String, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }

        let deadline = Instant::now() + timeout;

        loop {
            if let Some(found) = self.buffer.find(pattern) {
                let before = self.buffer.consume(found.start);
                self.buffer.consume(found.len());
                debug!("expect: matched {}", pattern);
                return Ok(before);
            }

            if self.eof {
                return Err(ChannelError::Eof);
            }

            match timeout_at(deadline, self.fill()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ChannelError::ExpectTimeout {
                        pattern: pattern.to_string(),
                        timeout,
                        unmatched: self.buffer.unconsumed_lossy().into_owned(),
                    });
                }
            }
        }
    }

    /// Wait for `pattern` using the configured default timeout.
    pub async fn expect_default(&mut self, pattern: &Pattern) -> Result<String, ChannelError> {
        let timeout = self.config.expect_timeout;
        self.expect(pattern, timeout).await
    }

    /// Write `text` followed by the line terminator.
    pub async fn send_line(&mut self, text: &str) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }

        let mut line = String::with_capacity(text.len() + self.config.line_terminator.len());
        line.push_str(text);
        line.push_str(&self.config.line_terminator);

        // Content is not logged; scripts send secrets through here.
        trace!("send_line: {} bytes", line.len());

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(ChannelError::Write)?;
        self.writer.flush().await.map_err(ChannelError::Write)
    }

    /// Return the next line of output, without its terminator.
    pub async fn read_line(&mut self) -> Result<String, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }

        let timeout = self.config.line_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(line) = self.buffer.take_line() {
                return Ok(line);
            }

            if self.eof {
                return Err(ChannelError::Eof);
            }

            match timeout_at(deadline, self.fill()).await {
                Ok(result) => result?,
                Err(_) => return Err(ChannelError::ReadTimeout(timeout)),
            }
        }
    }

    /// Close the write side of the stream. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.writer.shutdown().await {
            debug!("session shutdown: {}", e);
        }
    }

    /// Check if the session was closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Get a reference to the output buffer.
    pub fn buffer(&self) -> &SessionBuffer {
        &self.buffer
    }

    /// Get the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Read one chunk from the stream into the buffer.
    async fn fill(&mut self) -> Result<(), ChannelError> {
        let mut chunk = vec![0u8; self.config.read_chunk];
        let n = self
            .reader
            .read(&mut chunk)
            .await
            .map_err(ChannelError::Read)?;

        if n == 0 {
            debug!("session: end of stream after {} bytes", self.buffer.len());
            self.eof = true;
        } else {
            trace!("session: read {} bytes", n);
            self.buffer.extend(&chunk[..n]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::duplex;
    use tokio_test::io::Builder;

    fn config() -> SessionConfig {
        SessionConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_matches_just_before_timeout() {
        let (local, mut remote) = duplex(1024);
        let mut session = InteractiveSession::new(local, config());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(95)).await;
            remote.write_all(b"sw1#").await.unwrap();
            // Keep the pipe open until the test is done.
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let result = session
            .expect(&Pattern::literal("sw1#"), Duration::from_millis(100))
            .await;
        assert!(result.is_ok(), "{:?}", result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_times_out_just_after_deadline() {
        let (local, mut remote) = duplex(1024);
        let mut session = InteractiveSession::new(local, config());

        tokio::spawn(async move {
            remote.write_all(b"Building configuration...").await.unwrap();
            tokio::time::sleep(Duration::from_millis(105)).await;
            let _ = remote.write_all(b"sw1#").await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = session
            .expect(&Pattern::literal("sw1#"), Duration::from_millis(100))
            .await
            .unwrap_err();

        match err {
            ChannelError::ExpectTimeout {
                pattern, unmatched, ..
            } => {
                assert_eq!(pattern, "sw1#");
                assert_eq!(unmatched, "Building configuration...");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expect_returns_preceding_output_in_order() {
        let mock = Builder::new()
            .read(b"Username: ")
            .write(b"admin\n")
            .read(b"Password: ")
            .build();
        let mut session = InteractiveSession::new(mock, config());

        let before = session
            .expect_default(&Pattern::literal("Username:"))
            .await
            .unwrap();
        assert_eq!(before, "");
        session.send_line("admin").await.unwrap();

        let before = session
            .expect_default(&Pattern::regex(r"[Pp]assword:").unwrap())
            .await
            .unwrap();
        assert_eq!(before, " ");
    }

    #[tokio::test]
    async fn test_read_line_then_eof() {
        let mock = Builder::new()
            .read(b"line one\r\nline ")
            .read(b"two\npartial")
            .build();
        let mut session = InteractiveSession::new(mock, config());

        assert_eq!(session.read_line().await.unwrap(), "line one");
        assert_eq!(session.read_line().await.unwrap(), "line two");
        assert!(matches!(session.read_line().await, Err(ChannelError::Eof)));
        assert_eq!(session.buffer().unconsumed(), b"partial");
    }

    #[tokio::test]
    async fn test_expect_reports_eof() {
        let mock = Builder::new().read(b"% Connection closed").build();
        let mut session = InteractiveSession::new(mock, config());

        let err = session
            .expect_default(&Pattern::literal("#"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Eof));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_io() {
        let (local, _remote) = duplex(64);
        let mut session = InteractiveSession::new(local, config());

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(matches!(
            session.send_line("show version").await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_send_line_fails_when_peer_is_gone() {
        let (local, remote) = duplex(64);
        drop(remote);
        let mut session = InteractiveSession::new(local, config());

        let err = session.send_line("terminal length 0").await.unwrap_err();
        assert!(matches!(err, ChannelError::Write(_)));
    }
}
