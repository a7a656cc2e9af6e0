//! Shared helpers: a minimal TFTP upload client and a fake switch.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use ferrisbak::auth::StaticCredential;
use ferrisbak::device::{AuthRef, Device, DeviceClass};
use ferrisbak::error::{ChannelError, PacketError, TransportError};
use ferrisbak::intake::{ErrorCode, IntakeConfig, IntakeServer, Packet, Request};
use ferrisbak::transport::ConnectionParameters;
use ferrisbak::{AutomationEngine, Connection, Connector};

const CLIENT_TIMEOUT: Duration = Duration::from_millis(500);
const CLIENT_RETRIES: usize = 5;

/// Script that asks the fake switch to upload its configuration.
pub const UPLOAD_SCRIPT: &str = r##"
    expect("#");
    sendLine("show running-config | redirect tftp://" + ctx.intake_host + ":" + ctx.intake_port + "/" + ctx.upload_token);
    expect("#");
"##;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("rejected with {code:?}: {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("no response from server")]
    Timeout,

    #[error("unexpected packet: {0}")]
    Protocol(String),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Start an intake server on a random loopback port.
pub async fn start_server() -> (IntakeServer, SocketAddr) {
    let server = IntakeServer::new(IntakeConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        public_host: "127.0.0.1".to_string(),
        transfer_timeout: Duration::from_millis(200),
        retries: 3,
        ..IntakeConfig::default()
    });
    let addr = server.run().await.unwrap();
    (server, addr)
}

async fn send_request(
    server: SocketAddr,
    request: Request,
) -> Result<(UdpSocket, Packet), UploadError> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket
        .send_to(&Packet::WriteRequest(request).encode(), server)
        .await?;

    let mut buf = vec![0u8; 65536];
    let (len, peer) = timeout(CLIENT_TIMEOUT * 4, socket.recv_from(&mut buf))
        .await
        .map_err(|_| UploadError::Timeout)??;
    let reply = Packet::decode(&buf[..len])?;

    if let Packet::Error { code, message } = reply {
        return Err(UploadError::Rejected { code, message });
    }
    socket.connect(peer).await?;
    Ok((socket, reply))
}

/// Upload `data` as `filename`. `blksize` requests a block size option.
pub async fn upload(
    server: SocketAddr,
    filename: &str,
    data: &[u8],
    blksize: Option<usize>,
) -> Result<(), UploadError> {
    let mut request = Request::new(filename, "octet");
    if let Some(size) = blksize {
        request = request
            .with_option("blksize", size.to_string())
            .with_option("tsize", data.len().to_string());
    }

    let (socket, reply) = send_request(server, request).await?;
    let block_size = match reply {
        Packet::Ack(0) => 512,
        Packet::OptionAck(options) => options
            .iter()
            .find(|(name, _)| name == "blksize")
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or(512),
        other => return Err(UploadError::Protocol(format!("{:?}", other))),
    };

    let mut block: u16 = 1;
    let mut offset = 0;
    loop {
        let end = (offset + block_size).min(data.len());
        let chunk = Bytes::copy_from_slice(&data[offset..end]);
        let last = chunk.len() < block_size;

        let packet = Packet::Data { block, data: chunk }.encode();
        send_until_acked(&socket, &packet, block).await?;

        if last {
            return Ok(());
        }
        offset = end;
        block = block.wrapping_add(1);
    }
}

async fn send_until_acked(socket: &UdpSocket, packet: &[u8], block: u16) -> Result<(), UploadError> {
    let mut buf = vec![0u8; 1024];
    for _ in 0..CLIENT_RETRIES {
        socket.send(packet).await?;
        let Ok(received) = timeout(CLIENT_TIMEOUT, socket.recv(&mut buf)).await else {
            continue;
        };
        match Packet::decode(&buf[..received?])? {
            Packet::Ack(acked) if acked == block => return Ok(()),
            Packet::Error { code, message } => return Err(UploadError::Rejected { code, message }),
            _ => {}
        }
    }
    Err(UploadError::Timeout)
}

/// Start an upload and abort it with an error packet after the first ACK.
pub async fn abort_upload(server: SocketAddr, filename: &str) -> Result<(), UploadError> {
    let (socket, _) = send_request(server, Request::new(filename, "octet")).await?;
    socket
        .send(&Packet::error(ErrorCode::DiskFull, "flash full").encode())
        .await?;
    Ok(())
}

/// Send a write request and never send any data.
pub async fn stall_upload(server: SocketAddr, filename: &str) -> Result<UdpSocket, UploadError> {
    let (socket, _) = send_request(server, Request::new(filename, "octet")).await?;
    Ok(socket)
}

/// What a fake switch does when asked to upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Complete,
    Abort,
    Never,
}

/// Behavior of one simulated switch.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub prompt: String,
    pub payload: Vec<u8>,

    /// Appended to the requested filename, like devices that add an
    /// extension.
    pub suffix: String,

    /// Wait before uploading.
    pub delay: Duration,

    pub mode: UploadMode,

    /// Refuse to start a shell after login.
    pub shell_fails: bool,
}

impl FakeDevice {
    pub fn new(prompt: &str, payload: &[u8]) -> Self {
        Self {
            prompt: prompt.to_string(),
            payload: payload.to_vec(),
            suffix: String::new(),
            delay: Duration::ZERO,
            mode: UploadMode::Complete,
            shell_fails: false,
        }
    }

    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = suffix.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_mode(mut self, mode: UploadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_failing_shell(mut self) -> Self {
        self.shell_fails = true;
        self
    }
}

/// Connector that hands out simulated switches keyed by address.
#[derive(Default)]
pub struct FakeConnector {
    devices: HashMap<String, FakeDevice>,
    closed: Arc<AtomicUsize>,
    uploads: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, address: &str, device: FakeDevice) -> Self {
        self.devices.insert(address.to_string(), device);
        self
    }

    /// Number of connections closed so far.
    pub fn closed(&self) -> Arc<AtomicUsize> {
        self.closed.clone()
    }

    /// Prompts of devices, in the order their uploads completed.
    pub fn uploads(&self) -> Arc<Mutex<Vec<String>>> {
        self.uploads.clone()
    }
}

impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(
        &self,
        address: &str,
        _params: &ConnectionParameters,
    ) -> Result<FakeConnection, TransportError> {
        let device = self.devices.get(address).cloned().ok_or_else(|| {
            TransportError::ConnectionFailed {
                host: address.to_string(),
                port: 22,
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            }
        })?;

        Ok(FakeConnection {
            device,
            closed: self.closed.clone(),
            uploads: self.uploads.clone(),
        })
    }
}

pub struct FakeConnection {
    device: FakeDevice,
    closed: Arc<AtomicUsize>,
    uploads: Arc<Mutex<Vec<String>>>,
}

impl Connection for FakeConnection {
    type Stream = DuplexStream;

    async fn open_shell(&mut self) -> Result<DuplexStream, ChannelError> {
        if self.device.shell_fails {
            return Err(ChannelError::Eof);
        }
        let (local, remote) = duplex(4096);
        tokio::spawn(simulate(
            self.device.clone(),
            remote,
            self.uploads.clone(),
        ));
        Ok(local)
    }

    async fn close(self) -> Result<(), TransportError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn simulate(device: FakeDevice, stream: DuplexStream, uploads: Arc<Mutex<Vec<String>>>) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    if writer.write_all(device.prompt.as_bytes()).await.is_err() {
        return;
    }

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(url) = line.split_whitespace().find(|w| w.starts_with("tftp://")) {
            let reply = match push(&device, url).await {
                Ok(()) => {
                    uploads.lock().unwrap().push(device.prompt.clone());
                    "[OK]\r\n".to_string()
                }
                Err(e) => format!("%Error copying {} ({})\r\n", url, e),
            };
            if writer.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
        if writer.write_all(device.prompt.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn push(device: &FakeDevice, url: &str) -> Result<(), UploadError> {
    let (server, name) = url["tftp://".len()..]
        .split_once('/')
        .ok_or_else(|| UploadError::Protocol(format!("bad url {}", url)))?;
    let server: SocketAddr = server
        .parse()
        .map_err(|_| UploadError::Protocol(format!("bad server {}", server)))?;
    let filename = format!("{}{}", name, device.suffix);

    sleep(device.delay).await;
    match device.mode {
        UploadMode::Complete => upload(server, &filename, &device.payload, None).await,
        UploadMode::Abort => abort_upload(server, &filename).await,
        UploadMode::Never => Ok(()),
    }
}

/// Build a device of a class with a single `running-config` target.
pub fn device(engine: &AutomationEngine, name: &str, address: &str, script: &str) -> Device {
    let class = DeviceClass::new("fake_ios")
        .with_target("running-config", engine.compile("fake_ios/running-config", script).unwrap());
    device_with_class(name, address, Arc::new(class))
}

pub fn device_with_class(name: &str, address: &str, class: Arc<DeviceClass>) -> Device {
    Device {
        name: name.to_string(),
        address: address.to_string(),
        class,
        credential: Arc::new(StaticCredential::new("admin").with_password("secret")),
        auth: "lab:switches".parse::<AuthRef>().unwrap(),
    }
}
