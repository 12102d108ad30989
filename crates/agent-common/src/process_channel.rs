// IPC channel between the agent and its worker child process.
//
// The agent side binds a host-private Unix socket and hands its path to the
// worker as a "pipe handle" argv entry; the worker connects back. Frames are
// `[u32 LE body length][u32 LE message type][body bytes]`, with the body
// UTF-16LE-encoded JSON for payload-bearing messages and empty for the
// cancel family.

use crate::constants;
use crate::errors::ChannelError;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Lower clamp for the configurable send timeout.
const MIN_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper clamp for the configurable send timeout.
const MAX_CHANNEL_TIMEOUT: Duration = Duration::from_secs(300);

/// Control messages exchanged with the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    NewJobRequest = 1,
    CancelRequest = 2,
    AgentShutdown = 3,
    OperatingSystemShutdown = 4,
    JobMetadataUpdate = 5,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::NewJobRequest),
            2 => Some(MessageType::CancelRequest),
            3 => Some(MessageType::AgentShutdown),
            4 => Some(MessageType::OperatingSystemShutdown),
            5 => Some(MessageType::JobMetadataUpdate),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::NewJobRequest => "NewJobRequest",
            MessageType::CancelRequest => "CancelRequest",
            MessageType::AgentShutdown => "AgentShutdown",
            MessageType::OperatingSystemShutdown => "OperatingSystemShutdown",
            MessageType::JobMetadataUpdate => "JobMetadataUpdate",
        };
        write!(f, "{name}")
    }
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub message_type: MessageType,
    pub body: String,
}

impl WorkerMessage {
    pub fn new(message_type: MessageType, body: impl Into<String>) -> Self {
        Self {
            message_type,
            body: body.into(),
        }
    }
}

/// Resolve the IPC send timeout: the environment override clamped to
/// `[30 s, 300 s]`, default 30 s.
pub fn channel_timeout() -> Duration {
    clamp_channel_timeout(std::env::var(constants::agent::CHANNEL_TIMEOUT_VARIABLE).ok())
}

fn clamp_channel_timeout(value: Option<String>) -> Duration {
    let seconds = value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(MIN_CHANNEL_TIMEOUT);
    seconds.clamp(MIN_CHANNEL_TIMEOUT, MAX_CHANNEL_TIMEOUT)
}

/// The duplex message channel.
///
/// `start_server` / `accept` are the agent side; `start_client` is the
/// worker side (and the side test harnesses impersonate).
pub struct ProcessChannel {
    socket_path: Option<PathBuf>,
    listener: Option<UnixListener>,
    stream: Option<UnixStream>,
}

impl ProcessChannel {
    pub fn new() -> Self {
        Self {
            socket_path: None,
            listener: None,
            stream: None,
        }
    }

    /// Bind the host-private socket under `socket_dir` and return its path,
    /// the handle the worker receives on its command line.
    pub fn start_server(&mut self, socket_dir: &std::path::Path) -> Result<String, ChannelError> {
        let socket_path = socket_dir.join(format!("agent_ipc_{}", uuid::Uuid::new_v4()));
        let listener = UnixListener::bind(&socket_path)?;

        let handle = socket_path
            .to_str()
            .ok_or_else(|| {
                ChannelError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "socket path is not valid UTF-8",
                ))
            })?
            .to_string();

        self.socket_path = Some(socket_path);
        self.listener = Some(listener);
        Ok(handle)
    }

    /// Wait for the worker to connect. Must be called once on the agent
    /// side before the first send.
    pub async fn accept(&mut self) -> Result<(), ChannelError> {
        let listener = self.listener.as_ref().ok_or(ChannelError::Closed)?;
        let (stream, _addr) = listener.accept().await?;
        self.stream = Some(stream);
        Ok(())
    }

    /// True once a peer is connected.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to the agent's socket (worker side).
    pub async fn start_client(&mut self, handle: &str) -> Result<(), ChannelError> {
        let stream = UnixStream::connect(handle).await?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Send one message, failing with `ChannelError::Timeout` when the write
    /// has not completed within `timeout` and `ChannelError::Closed` when
    /// the peer is gone.
    pub async fn send(
        &mut self,
        message_type: MessageType,
        body: &str,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;

        let write = async {
            let body_bytes = encode_body(body);
            stream.write_all(&(body_bytes.len() as u32).to_le_bytes()).await?;
            stream.write_all(&(message_type as u32).to_le_bytes()).await?;
            stream.write_all(&body_bytes).await?;
            stream.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        match tokio::time::timeout(timeout, write).await {
            Err(_elapsed) => Err(ChannelError::Timeout(message_type.to_string())),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                Err(ChannelError::Closed)
            }
            Ok(Err(e)) => Err(ChannelError::Io(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Receive one message (worker side and test harnesses).
    pub async fn receive(&mut self) -> Result<WorkerMessage, ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.map_err(map_eof)?;
        let body_len = u32::from_le_bytes(len_buf) as usize;

        let mut type_buf = [0u8; 4];
        stream.read_exact(&mut type_buf).await.map_err(map_eof)?;
        let message_type = MessageType::from_u32(u32::from_le_bytes(type_buf)).ok_or_else(|| {
            ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown message type {}", u32::from_le_bytes(type_buf)),
            ))
        })?;

        let mut body_buf = vec![0u8; body_len];
        stream.read_exact(&mut body_buf).await.map_err(map_eof)?;
        let body = decode_body(&body_buf)?;

        Ok(WorkerMessage::new(message_type, body))
    }
}

fn map_eof(e: std::io::Error) -> ChannelError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ChannelError::Closed
    } else {
        ChannelError::Io(e)
    }
}

/// Message bodies travel UTF-16LE, the encoding the worker runtime reads
/// natively.
fn encode_body(body: &str) -> Vec<u8> {
    body.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn decode_body(bytes: &[u8]) -> Result<String, ChannelError> {
    if bytes.len() % 2 != 0 {
        return Err(ChannelError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "odd-length UTF-16 body",
        )));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| {
        ChannelError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "body is not valid UTF-16",
        ))
    })
}

impl Default for ProcessChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if let Some(ref path) = self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}
