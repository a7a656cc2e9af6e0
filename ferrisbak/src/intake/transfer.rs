//! Receiving side of a single TFTP write transfer.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;

use super::packet::{ErrorCode, Packet, Request};
use super::{IntakeConfig, ReceivedFile};

const DEFAULT_BLOCK_SIZE: usize = 512;
const MIN_BLOCK_SIZE: usize = 8;
const MAX_BLOCK_SIZE: usize = 65464;

/// Reason a transfer was given up.
#[derive(Error, Debug)]
pub(crate) enum TransferAbort {
    #[error("client aborted: {0}")]
    Client(String),

    #[error("no data after {0} retransmissions")]
    Timeout(u32),

    #[error("upload exceeds the {0} byte limit")]
    TooLarge(u64),

    #[error("unsupported transfer mode '{0}'")]
    Mode(String),

    #[error("DATA block larger than negotiated size {0}")]
    Oversized(usize),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Options agreed with the client.
#[derive(Debug, PartialEq, Eq)]
struct Negotiated {
    block_size: usize,
    timeout: Duration,
    acknowledged: Vec<(String, String)>,
}

fn negotiate(request: &Request, config: &IntakeConfig) -> Result<Negotiated, TransferAbort> {
    let mut negotiated = Negotiated {
        block_size: DEFAULT_BLOCK_SIZE,
        timeout: config.transfer_timeout,
        acknowledged: Vec::new(),
    };

    if let Some(Ok(size)) = request.option("blksize").map(str::parse::<usize>) {
        let size = size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        negotiated.block_size = size;
        negotiated
            .acknowledged
            .push(("blksize".to_string(), size.to_string()));
    }

    if let Some(Ok(secs)) = request.option("timeout").map(str::parse::<u64>) {
        if (1..=255).contains(&secs) {
            negotiated.timeout = Duration::from_secs(secs);
            negotiated
                .acknowledged
                .push(("timeout".to_string(), secs.to_string()));
        }
    }

    if let Some(Ok(size)) = request.option("tsize").map(str::parse::<u64>) {
        if size > config.max_upload_bytes {
            return Err(TransferAbort::TooLarge(config.max_upload_bytes));
        }
        negotiated
            .acknowledged
            .push(("tsize".to_string(), size.to_string()));
    }

    Ok(negotiated)
}

/// A finished upload and what is needed to linger on its socket.
struct Completed {
    data: Bytes,
    last_block: u16,
    block_size: usize,
    timeout: Duration,
}

/// A matched write request, ready to be received.
pub(crate) struct Transfer {
    pub(crate) peer: SocketAddr,
    pub(crate) request: Request,
    pub(crate) token: String,
    pub(crate) sender: mpsc::Sender<ReceivedFile>,
    pub(crate) config: IntakeConfig,
}

impl Transfer {
    /// Receive the file and hand it to the waiting job.
    pub(crate) async fn run(self) -> Result<(), TransferAbort> {
        // A fresh socket per transfer gives the client a distinct TID.
        let socket = UdpSocket::bind(SocketAddr::new(self.config.listen.ip(), 0)).await?;
        socket.connect(self.peer).await?;

        let completed = match self.receive(&socket).await {
            Ok(completed) => completed,
            Err(abort) => {
                if let Some(packet) = error_packet(&abort) {
                    let _ = socket.send(&packet.encode()).await;
                }
                return Err(abort);
            }
        };

        info!(
            "intake: received '{}' ({} bytes) from {}",
            self.request.filename,
            completed.data.len(),
            self.peer
        );

        let file = ReceivedFile {
            name: self.request.filename.clone(),
            data: completed.data.clone(),
        };
        match self.sender.try_send(file) {
            Ok(()) => {}
            Err(TrySendError::Full(file)) => {
                warn!("intake: job for token {} is not draining, dropping '{}'", self.token, file.name);
            }
            Err(TrySendError::Closed(file)) => {
                debug!("intake: job for token {} is gone, dropping '{}'", self.token, file.name);
            }
        }

        self.dally(&socket, &completed).await;
        Ok(())
    }

    /// Stay on the transfer socket for one timeout period after the final
    /// ACK and repeat it if the client resends the last block.
    async fn dally(&self, socket: &UdpSocket, completed: &Completed) {
        let ack = Packet::Ack(completed.last_block).encode();
        let mut buf = vec![0u8; completed.block_size + 5];

        while let Ok(Ok(len)) = timeout(completed.timeout, socket.recv(&mut buf)).await {
            match Packet::decode(&buf[..len]) {
                Ok(Packet::Data { block, .. }) if block == completed.last_block => {
                    trace!("intake: final ACK {} lost, repeating to {}", block, self.peer);
                    if socket.send(&ack).await.is_err() {
                        return;
                    }
                }
                _ => trace!("intake: ignoring late packet from {}", self.peer),
            }
        }
    }

    async fn receive(&self, socket: &UdpSocket) -> Result<Completed, TransferAbort> {
        match self.request.mode.as_str() {
            "octet" | "netascii" => {}
            other => return Err(TransferAbort::Mode(other.to_string())),
        }

        let negotiated = negotiate(&self.request, &self.config)?;
        let block_size = negotiated.block_size;

        let mut last_reply = if negotiated.acknowledged.is_empty() {
            Packet::Ack(0)
        } else {
            Packet::OptionAck(negotiated.acknowledged)
        }
        .encode();
        socket.send(&last_reply).await?;

        let mut payload = BytesMut::new();
        let mut expected: u16 = 1;
        let mut attempts: u32 = 0;
        // One spare byte so oversized blocks are detected, not truncated.
        let mut buf = vec![0u8; block_size + 5];

        loop {
            let len = match timeout(negotiated.timeout, socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    attempts += 1;
                    if attempts > self.config.retries {
                        return Err(TransferAbort::Timeout(self.config.retries));
                    }
                    trace!("intake: retransmitting to {} (attempt {})", self.peer, attempts);
                    socket.send(&last_reply).await?;
                    continue;
                }
            };

            match Packet::decode(&buf[..len]) {
                Ok(Packet::Data { block, data }) if block == expected => {
                    attempts = 0;
                    if data.len() > block_size {
                        return Err(TransferAbort::Oversized(block_size));
                    }
                    if (payload.len() + data.len()) as u64 > self.config.max_upload_bytes {
                        return Err(TransferAbort::TooLarge(self.config.max_upload_bytes));
                    }
                    payload.extend_from_slice(&data);

                    last_reply = Packet::Ack(block).encode();
                    socket.send(&last_reply).await?;

                    if data.len() < block_size {
                        return Ok(Completed {
                            data: payload.freeze(),
                            last_block: block,
                            block_size,
                            timeout: negotiated.timeout,
                        });
                    }
                    expected = expected.wrapping_add(1);
                }
                Ok(Packet::Data { block, .. }) if block == expected.wrapping_sub(1) => {
                    trace!("intake: duplicate block {} from {}", block, self.peer);
                    socket.send(&last_reply).await?;
                }
                Ok(Packet::Error { message, .. }) => {
                    return Err(TransferAbort::Client(message));
                }
                Ok(other) => trace!("intake: ignoring {:?} from {}", other, self.peer),
                Err(e) => trace!("intake: malformed packet from {}: {}", self.peer, e),
            }
        }
    }
}

fn error_packet(abort: &TransferAbort) -> Option<Packet> {
    match abort {
        TransferAbort::TooLarge(_) => Some(Packet::error(ErrorCode::DiskFull, abort.to_string())),
        TransferAbort::Mode(_) | TransferAbort::Oversized(_) => {
            Some(Packet::error(ErrorCode::IllegalOperation, abort.to_string()))
        }
        TransferAbort::Timeout(_) => {
            Some(Packet::error(ErrorCode::NotDefined, abort.to_string()))
        }
        TransferAbort::Client(_) | TransferAbort::Io(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IntakeConfig {
        IntakeConfig {
            max_upload_bytes: 4096,
            ..IntakeConfig::default()
        }
    }

    #[test]
    fn test_negotiate_defaults() {
        let negotiated = negotiate(&Request::new("abc", "octet"), &config()).unwrap();
        assert_eq!(negotiated.block_size, 512);
        assert_eq!(negotiated.timeout, Duration::from_secs(5));
        assert!(negotiated.acknowledged.is_empty());
    }

    #[test]
    fn test_negotiate_options() {
        let request = Request::new("abc", "octet")
            .with_option("blksize", "100000")
            .with_option("timeout", "2")
            .with_option("tsize", "812")
            .with_option("windowsize", "4");
        let negotiated = negotiate(&request, &config()).unwrap();

        assert_eq!(negotiated.block_size, MAX_BLOCK_SIZE);
        assert_eq!(negotiated.timeout, Duration::from_secs(2));
        assert_eq!(
            negotiated.acknowledged,
            vec![
                ("blksize".to_string(), "65464".to_string()),
                ("timeout".to_string(), "2".to_string()),
                ("tsize".to_string(), "812".to_string()),
            ]
        );
    }

    #[test]
    fn test_negotiate_ignores_invalid_values() {
        let request = Request::new("abc", "octet")
            .with_option("blksize", "big")
            .with_option("timeout", "0");
        let negotiated = negotiate(&request, &config()).unwrap();
        assert_eq!(negotiated.block_size, 512);
        assert!(negotiated.acknowledged.is_empty());
    }

    #[test]
    fn test_negotiate_rejects_announced_oversize() {
        let request = Request::new("abc", "octet").with_option("tsize", "5000");
        assert!(matches!(
            negotiate(&request, &config()),
            Err(TransferAbort::TooLarge(4096))
        ));
    }

    #[test]
    fn test_error_packets() {
        assert!(matches!(
            error_packet(&TransferAbort::TooLarge(1)),
            Some(Packet::Error {
                code: ErrorCode::DiskFull,
                ..
            })
        ));
        assert!(error_packet(&TransferAbort::Client("abort".into())).is_none());
    }
}
