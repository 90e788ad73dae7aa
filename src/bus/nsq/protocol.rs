//! NSQ TCP protocol, version 2.
//!
//! Commands are newline-terminated text lines, some followed by a
//! size-prefixed body. The server answers with frames:
//!
//! ```text
//! [size: u32 BE][frame type: i32 BE][data: size - 4 bytes]
//! ```
//!
//! Message frames carry `[timestamp: i64][attempts: u16][id: 16 bytes][body]`.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::bus::{BusError, Result, TransportOptions};

/// Protocol magic sent once after connecting.
pub const MAGIC_V2: &[u8] = b"  V2";
/// Response data of a server heartbeat.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
/// Response data acknowledging a command.
pub const OK: &[u8] = b"OK";
/// Response data acknowledging `CLS`.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

const FRAME_RESPONSE: i32 = 0;
const FRAME_ERROR: i32 = 1;
const FRAME_MESSAGE: i32 = 2;

/// Largest frame accepted from the server.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const MESSAGE_ID_LEN: usize = 16;
/// Timestamp, attempts and id.
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;
/// Longest topic or channel name nsqd accepts.
const MAX_NAME_LEN: usize = 64;
/// RDY ceiling assumed when the server does not announce one.
pub const DEFAULT_MAX_RDY_COUNT: u64 = 2500;

fn protocol_error(detail: impl std::fmt::Display) -> BusError {
    BusError::Transport(format!("nsq protocol: {}", detail))
}

fn io_error(e: std::io::Error) -> BusError {
    BusError::Transport(format!("nsq connection: {}", e))
}

/// Error reported by the server in an error frame.
pub fn server_error(data: &[u8]) -> BusError {
    BusError::Transport(format!("nsqd: {}", String::from_utf8_lossy(data)))
}

/// Check a topic or channel name against nsqd's naming rules.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(BusError::Transport(format!("invalid nsq {} name '{}'", kind, name)))
    }
}

// ============================================================================
// Frames
// ============================================================================

/// A message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    /// Nanoseconds since the epoch at which nsqd accepted the message.
    pub timestamp: i64,
    pub attempts: u16,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(RawMessage),
}

impl Frame {
    pub fn decode(frame_type: i32, mut data: Bytes) -> Result<Self> {
        match frame_type {
            FRAME_RESPONSE => Ok(Self::Response(data)),
            FRAME_ERROR => Ok(Self::Error(data)),
            FRAME_MESSAGE => {
                if data.len() < MESSAGE_HEADER_LEN {
                    return Err(protocol_error(format!(
                        "message frame of {} bytes is shorter than its header",
                        data.len()
                    )));
                }
                let timestamp = data.get_i64();
                let attempts = data.get_u16();
                let id = data.split_to(MESSAGE_ID_LEN);
                let id = std::str::from_utf8(&id)
                    .map_err(|_| protocol_error("message id is not ASCII"))?
                    .to_string();

                Ok(Self::Message(RawMessage {
                    id,
                    timestamp,
                    attempts,
                    body: data,
                }))
            }
            other => Err(protocol_error(format!("unknown frame type {}", other))),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Response(data) if data.as_ref() == HEARTBEAT)
    }
}

/// Reading half of a connection.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        Self {
            inner: BufReader::new(inner),
            read_timeout,
        }
    }

    /// Next frame; a silent server past `read_timeout` is an error.
    pub async fn next(&mut self) -> Result<Frame> {
        tokio::time::timeout(self.read_timeout, Self::read_frame(&mut self.inner))
            .await
            .map_err(|_| {
                BusError::Transport(format!("nsqd silent for {:?}", self.read_timeout))
            })?
    }

    async fn read_frame(reader: &mut BufReader<R>) -> Result<Frame> {
        let size = reader.read_u32().await.map_err(io_error)? as usize;
        if !(4..=MAX_FRAME_SIZE).contains(&size) {
            return Err(protocol_error(format!("frame size {} out of range", size)));
        }
        let frame_type = reader.read_i32().await.map_err(io_error)?;

        let mut data = BytesMut::zeroed(size - 4);
        reader.read_exact(&mut data).await.map_err(io_error)?;
        Frame::decode(frame_type, data.freeze())
    }
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// JSON-encoded client metadata.
    Identify(Bytes),
    Auth(String),
    Sub { topic: String, channel: String },
    Rdy(u64),
    Fin(String),
    Req { id: String, delay: Duration },
    Pub { topic: String, body: Bytes },
    Nop,
    Cls,
}

impl Command {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Identify(body) => {
                line(buf, &["IDENTIFY"]);
                put_body(buf, body);
            }
            Self::Auth(secret) => {
                line(buf, &["AUTH"]);
                put_body(buf, secret.as_bytes());
            }
            Self::Sub { topic, channel } => line(buf, &["SUB", topic, channel]),
            Self::Rdy(count) => line(buf, &["RDY", &count.to_string()]),
            Self::Fin(id) => line(buf, &["FIN", id]),
            Self::Req { id, delay } => line(buf, &["REQ", id, &delay.as_millis().to_string()]),
            Self::Pub { topic, body } => {
                line(buf, &["PUB", topic]);
                put_body(buf, body);
            }
            Self::Nop => line(buf, &["NOP"]),
            Self::Cls => line(buf, &["CLS"]),
        }
    }
}

fn line(buf: &mut BytesMut, parts: &[&str]) {
    buf.put_slice(parts.join(" ").as_bytes());
    buf.put_u8(b'\n');
}

fn put_body(buf: &mut BytesMut, body: &[u8]) {
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
}

/// Writing half of a connection.
pub struct CommandWriter<W> {
    inner: BufWriter<W>,
    write_timeout: Duration,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(inner: W, write_timeout: Duration) -> Self {
        Self {
            inner: BufWriter::new(inner),
            write_timeout,
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, command: &Command) -> Result<()> {
        self.buf.clear();
        command.encode(&mut self.buf);
        let bytes = self.buf.split().freeze();
        self.write(&bytes).await
    }

    pub async fn send_magic(&mut self) -> Result<()> {
        self.write(MAGIC_V2).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let inner = &mut self.inner;
        tokio::time::timeout(self.write_timeout, async move {
            inner.write_all(bytes).await?;
            inner.flush().await
        })
        .await
        .map_err(|_| {
            BusError::Transport(format!("nsq write timed out after {:?}", self.write_timeout))
        })?
        .map_err(io_error)
    }
}

/// Send `command` and wait for its response, answering heartbeats on the
/// way.
pub async fn round_trip<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut CommandWriter<W>,
    command: &Command,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.send(command).await?;
    loop {
        match reader.next().await? {
            frame if frame.is_heartbeat() => writer.send(&Command::Nop).await?,
            Frame::Response(data) => return Ok(data),
            Frame::Error(data) => return Err(server_error(&data)),
            Frame::Message(message) => {
                return Err(protocol_error(format!(
                    "message {} before the connection was ready",
                    message.id
                )))
            }
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Client metadata sent with `IDENTIFY`. Durations are in milliseconds.
#[derive(Debug, Serialize)]
pub struct Identify<'a> {
    pub client_id: &'a str,
    pub hostname: &'a str,
    pub user_agent: &'a str,
    pub feature_negotiation: bool,
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    pub sample_rate: i32,
    pub msg_timeout: i64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub snappy: bool,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl<'a> Identify<'a> {
    pub fn new(options: &'a TransportOptions) -> Self {
        Self {
            client_id: &options.client_id,
            hostname: &options.hostname,
            user_agent: &options.user_agent,
            feature_negotiation: true,
            heartbeat_interval: millis(options.heartbeat_interval),
            output_buffer_size: options.output_buffer_size,
            output_buffer_timeout: millis(options.output_buffer_timeout),
            sample_rate: options.sample_rate,
            msg_timeout: millis(options.msg_timeout),
            tls_v1: options.tls_v1,
            deflate: options.deflate,
            deflate_level: options.deflate_level,
            snappy: options.snappy,
        }
    }

    pub fn to_command(&self) -> Result<Command> {
        let body = serde_json::to_vec(self).map_err(BusError::Encoding)?;
        Ok(Command::Identify(body.into()))
    }
}

/// Features the server agreed to in its `IDENTIFY` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerFeatures {
    pub version: String,
    pub max_rdy_count: u64,
    pub auth_required: bool,
    pub tls_v1: bool,
    pub deflate: bool,
    pub snappy: bool,
}

impl Default for ServerFeatures {
    fn default() -> Self {
        Self {
            version: String::new(),
            max_rdy_count: DEFAULT_MAX_RDY_COUNT,
            auth_required: false,
            tls_v1: false,
            deflate: false,
            snappy: false,
        }
    }
}

impl ServerFeatures {
    /// Parse an `IDENTIFY` response: JSON when features were negotiated,
    /// plain `OK` from servers that do not negotiate.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data == OK {
            return Ok(Self::default());
        }
        let mut features: Self = serde_json::from_slice(data).map_err(BusError::Decoding)?;
        if features.max_rdy_count == 0 {
            features.max_rdy_count = DEFAULT_MAX_RDY_COUNT;
        }
        Ok(features)
    }
}

/// Reject connection upgrades this client cannot perform.
pub fn ensure_supported(options: &TransportOptions) -> Result<()> {
    let unsupported: Vec<&str> = [
        (options.tls_v1, "tls_v1"),
        (options.deflate, "deflate"),
        (options.snappy, "snappy"),
    ]
    .into_iter()
    .filter_map(|(enabled, name)| enabled.then_some(name))
    .collect();

    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(BusError::Connection(format!(
            "nsq connection upgrades not supported: {}",
            unsupported.join(", ")
        )))
    }
}

/// Run the `IDENTIFY` (and `AUTH`, when required) handshake on a fresh
/// connection.
pub async fn handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut CommandWriter<W>,
    options: &TransportOptions,
) -> Result<ServerFeatures>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.send_magic().await?;

    let response = round_trip(reader, writer, &Identify::new(options).to_command()?).await?;
    let features = ServerFeatures::parse(&response)?;
    if features.tls_v1 || features.deflate || features.snappy {
        return Err(BusError::Connection(
            "nsqd enabled a connection upgrade that was not requested".to_string(),
        ));
    }

    if features.auth_required {
        if options.auth_secret.is_empty() {
            return Err(BusError::Connection(
                "nsqd requires authentication but no auth_secret is configured".to_string(),
            ));
        }
        round_trip(reader, writer, &Command::Auth(options.auth_secret.clone()))
            .await
            .map_err(|e| BusError::Connection(format!("nsqd rejected credentials: {}", e)))?;
    }

    Ok(features)
}
