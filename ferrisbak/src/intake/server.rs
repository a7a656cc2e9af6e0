//! Intake server lifecycle and request dispatch.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::packet::{ErrorCode, Packet, Request};
use super::registry::{ReceiptGuard, ReceiptRegistry};
use super::transfer::Transfer;
use super::{IntakeConfig, ReceivedFile, TransferFailure};
use crate::error::IntakeError;

const MAX_DATAGRAM: usize = 65536;
const FAILURE_CAPACITY: usize = 64;

struct Shared {
    config: IntakeConfig,
    registry: Arc<ReceiptRegistry>,
    failures: broadcast::Sender<TransferFailure>,
    local_addr: Mutex<Option<SocketAddr>>,

    /// `(peer, filename)` of transfers in progress.
    active: Mutex<HashSet<(SocketAddr, String)>>,
}

impl Shared {
    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    /// Claim `(peer, filename)` for a new transfer. `None` while a transfer
    /// for the same pair is still running.
    fn begin_transfer(self: &Arc<Self>, peer: SocketAddr, filename: &str) -> Option<ActiveTransfer> {
        let key = (peer, filename.to_string());
        let inserted = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());

        inserted.then(|| ActiveTransfer {
            shared: self.clone(),
            key,
        })
    }

    fn publish(&self, failure: TransferFailure) {
        match failure.peer {
            Some(peer) => warn!("intake: {} (peer {})", failure, peer),
            None => warn!("intake: {}", failure),
        }
        // No subscribers is fine; nobody is waiting.
        let _ = self.failures.send(failure);
    }
}

/// Releases a `(peer, filename)` claim when its transfer task ends.
struct ActiveTransfer {
    shared: Arc<Shared>,
    key: (SocketAddr, String),
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        self.shared
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Long-lived TFTP write receiver.
///
/// `Stopped -> Running -> Stopped`. Registrations are accepted only while
/// running.
pub struct IntakeServer {
    shared: Arc<Shared>,
    cancel_token: Mutex<Option<CancellationToken>>,
}

impl IntakeServer {
    /// Create a stopped server.
    pub fn new(config: IntakeConfig) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Arc::new(ReceiptRegistry::new()),
                failures,
                local_addr: Mutex::new(None),
                active: Mutex::new(HashSet::new()),
            }),
            cancel_token: Mutex::new(None),
        }
    }

    /// Bind the listener and start serving in the background.
    ///
    /// Returns the bound address once the server accepts requests.
    pub async fn run(&self) -> Result<SocketAddr, IntakeError> {
        if self.is_running() {
            return Err(IntakeError::AlreadyRunning);
        }

        let addr = self.shared.config.listen;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| IntakeError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;

        let token = CancellationToken::new();
        {
            let mut guard = self
                .cancel_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.is_some() {
                return Err(IntakeError::AlreadyRunning);
            }
            *guard = Some(token.clone());
        }

        self.shared.set_local_addr(Some(local_addr));
        self.shared.registry.reset(true);

        tokio::spawn(serve(self.shared.clone(), socket, token));
        info!("TFTP intake listening on {}", local_addr);

        Ok(local_addr)
    }

    /// Stop serving. In-flight transfers are abandoned and pending
    /// receipts dropped. Calling it on a stopped server does nothing.
    pub fn stop(&self) {
        let token = self
            .cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(token) = token else {
            debug!("intake: stop on a stopped server");
            return;
        };

        token.cancel();
        let dropped = self.shared.registry.reset(false);
        self.shared.set_local_addr(None);
        info!("TFTP intake stopped ({} pending receipts dropped)", dropped);
    }

    /// Check if the server is running.
    pub fn is_running(&self) -> bool {
        self.cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    /// Handle for jobs to register uploads and watch for failures.
    pub fn handle(&self) -> IntakeHandle {
        IntakeHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for IntakeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable job-side view of an [`IntakeServer`].
#[derive(Clone)]
pub struct IntakeHandle {
    shared: Arc<Shared>,
}

impl IntakeHandle {
    /// Wait for an upload whose filename starts with `token`.
    ///
    /// The file is delivered on `sender`. The registration lasts as long
    /// as the returned guard.
    pub fn expect_file(
        &self,
        token: impl Into<String>,
        sender: mpsc::Sender<ReceivedFile>,
    ) -> Result<ReceiptGuard, IntakeError> {
        self.shared.registry.register(token, sender)
    }

    /// Subscribe to transfer failures published from now on.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<TransferFailure> {
        self.shared.failures.subscribe()
    }

    /// Host devices should upload to.
    pub fn public_host(&self) -> &str {
        &self.shared.config.public_host
    }

    /// Port devices should upload to.
    pub fn port(&self) -> u16 {
        self.shared
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.shared.config.listen.port())
    }

    /// The receipt registry.
    pub fn registry(&self) -> &ReceiptRegistry {
        &self.shared.registry
    }
}

async fn serve(shared: Arc<Shared>, socket: UdpSocket, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, peer) = tokio::select! {
            _ = token.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!("intake: receive failed: {}", e);
                    continue;
                }
            },
        };

        trace!("intake: {} bytes from {}", len, peer);

        match Packet::decode(&buf[..len]) {
            Ok(Packet::WriteRequest(request)) => {
                accept_write(&shared, &socket, peer, request, &token).await;
            }
            Ok(Packet::ReadRequest(request)) => {
                warn!(
                    "intake: refusing read request for '{}' from {}",
                    request.filename, peer
                );
                reply(
                    &socket,
                    peer,
                    Packet::error(ErrorCode::IllegalOperation, "read requests not supported"),
                )
                .await;
            }
            Ok(other) => {
                debug!("intake: ignoring {:?} from {} on listen port", other, peer);
                reply(
                    &socket,
                    peer,
                    Packet::error(ErrorCode::UnknownTransferId, "unknown transfer"),
                )
                .await;
            }
            Err(e) => debug!("intake: malformed packet from {}: {}", peer, e),
        }
    }

    debug!("intake: listener closed");
}

async fn accept_write(
    shared: &Arc<Shared>,
    socket: &UdpSocket,
    peer: SocketAddr,
    request: Request,
    token: &CancellationToken,
) {
    let Some((matched, sender)) = shared.registry.route(&request.filename) else {
        warn!(
            "intake: unexpected upload '{}' from {}",
            request.filename, peer
        );
        reply(
            socket,
            peer,
            Packet::error(ErrorCode::AccessViolation, "unexpected upload"),
        )
        .await;
        return;
    };

    // One transfer per (peer, filename). A resent request is answered by the
    // running transfer's retransmissions.
    let Some(active) = shared.begin_transfer(peer, &request.filename) else {
        debug!(
            "intake: repeated write request for '{}' from {}",
            request.filename, peer
        );
        return;
    };

    info!(
        "intake: receiving '{}' from {} (token {})",
        request.filename, peer, matched
    );

    let transfer = Transfer {
        peer,
        request,
        token: matched,
        sender,
        config: shared.config.clone(),
    };
    let shared = shared.clone();
    let token = token.child_token();

    tokio::spawn(async move {
        let _active = active;
        let filename = transfer.request.filename.clone();
        let matched = transfer.token.clone();

        tokio::select! {
            _ = token.cancelled() => {
                debug!("intake: abandoned transfer of '{}' from {}", filename, peer);
            }
            result = transfer.run() => {
                if let Err(reason) = result {
                    shared.publish(TransferFailure {
                        peer: Some(peer),
                        filename,
                        token: Some(matched),
                        reason: reason.to_string(),
                    });
                }
            }
        }
    });
}

async fn reply(socket: &UdpSocket, peer: SocketAddr, packet: Packet) {
    if let Err(e) = socket.send_to(&packet.encode(), peer).await {
        debug!("intake: reply to {} failed: {}", peer, e);
    }
}
