//! # Message-Passing Abstraction and Backends
//!
//! This module provides the narrow interface between the parallel runtime
//! and whatever substrate actually carries bytes between PEs. The interface
//! is deliberately small — `start`, `sync`, `disconnect`, `send`, `recv`,
//! `probe` — so that substrates with very different characters can sit
//! behind it:
//!
//! - [`tcp_mesh`]: the reference backend, a full mesh of framed TCP streams
//!   with a bounded per-peer outbox providing back-pressure,
//! - [`proc_spawn`]: per-PE Unix-socket inboxes with children spawned from
//!   the running program image, no transport-level buffering,
//! - [`mailbox`] (Linux): POSIX message queues as OS mailboxes, with the
//!   priority rule enforced by the kernel.
//!
//! ## Addressing and tags
//!
//! PEs are numbered `1..=nPEs` (0 is reserved for "no PE"); the transport
//! maps these logical numbers to substrate addresses internally. Every
//! message carries a one-byte [`OpCode`]. Opcodes in the system range are
//! delivered before data opcodes whenever both are queued; backends either
//! get this from the substrate (mqueue priorities) or from receive-side
//! queue scanning.
//!
//! ## Back-pressure
//!
//! `send` never blocks its caller indefinitely: when the backend's bounded
//! outbox is saturated it returns `false` and the caller retries later.
//! `recv` blocks until a message arrives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

pub mod tcp_mesh;

pub mod proc_spawn;

#[cfg(target_os = "linux")]
pub mod mailbox;

pub use tcp_mesh::TcpMeshTransport;

pub use proc_spawn::ProcSpawnTransport;

#[cfg(target_os = "linux")]
pub use mailbox::MailboxTransport;

/// Logical PE number. Valid senders and receivers are `1..=nPEs`.
pub type PeId = u32;

/// "No PE" sentinel.
pub const NO_PE: PeId = 0;

/// A logical PE number must fit into 8 bits on the wire.
pub const MAX_PES: PeId = 255;

/// Environment variable carrying a spawned child's index (`>= 2`). A
/// process with this variable set to a non-zero value knows it is not the
/// main PE.
pub const CHILD_ENV: &str = "PAR_RTE_CHILD";

/// Environment variable carrying the 8-character substrate key that names
/// the shared inbox namespace of one cohort.
pub const KEY_ENV: &str = "PAR_RTE_KEY";

/// Environment variable carrying the cohort size to spawned children.
pub const NPES_ENV: &str = "PAR_RTE_NPES";

/// Message tags.
///
/// The tag space is closed and partitioned:
/// - *MP-internal* tags (`Ready`, `NewPe`, `PeTids`, `Fail`) concern peer
///   discovery and peer failure and are mostly consumed inside the
///   backends,
/// - *system* tags (`Finish` plus the MP-internal ones) take priority over
///   data on delivery,
/// - *data* tags (`Connect`, `Head`, `Data`, `Constr`, `RFork`) carry the
///   port-addressed messages of the data-communication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Child reports for duty during startup.
    Ready = 0x50,
    /// Peer announces itself on a fresh connection.
    NewPe = 0x51,
    /// Main PE broadcasts the cohort address vector.
    PeTids = 0x52,
    /// A peer has vanished; payload names the failed PE.
    Fail = 0x53,
    /// Two-phase counted shutdown.
    Finish = 0x54,
    /// Attach an outport to a peer inport; never carries payload.
    Connect = 0x55,
    /// One element of a stream.
    Head = 0x56,
    /// Final element of a channel; closes the receiving inport.
    Data = 0x57,
    /// Reserved; fatal on receipt.
    Constr = 0x58,
    /// Create a remote thread evaluating the carried graph.
    RFork = 0x59,
}

/// Lowest opcode with system (priority) delivery.
pub const MIN_SYSCODE: u8 = OpCode::Ready as u8;
/// Highest opcode with system (priority) delivery.
pub const MAX_SYSCODE: u8 = OpCode::Finish as u8;

impl OpCode {
    pub fn from_u8(raw: u8) -> Option<OpCode> {
        match raw {
            0x50 => Some(OpCode::Ready),
            0x51 => Some(OpCode::NewPe),
            0x52 => Some(OpCode::PeTids),
            0x53 => Some(OpCode::Fail),
            0x54 => Some(OpCode::Finish),
            0x55 => Some(OpCode::Connect),
            0x56 => Some(OpCode::Head),
            0x57 => Some(OpCode::Data),
            0x58 => Some(OpCode::Constr),
            0x59 => Some(OpCode::RFork),
            _ => None,
        }
    }

    /// Tags handled inside the message-passing layer itself.
    pub fn is_mp_internal(self) -> bool {
        matches!(
            self,
            OpCode::Ready | OpCode::NewPe | OpCode::PeTids | OpCode::Fail
        )
    }

    /// Tags with priority delivery over data.
    pub fn is_system(self) -> bool {
        (self as u8) >= MIN_SYSCODE && (self as u8) <= MAX_SYSCODE
    }

    /// Tags routed to the data-communication layer.
    pub fn is_data(self) -> bool {
        !self.is_system()
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Ready => "READY",
            OpCode::NewPe => "NEWPE",
            OpCode::PeTids => "PETIDS",
            OpCode::Fail => "FAIL",
            OpCode::Finish => "FINISH",
            OpCode::Connect => "CONNECT",
            OpCode::Head => "HEAD",
            OpCode::Data => "DATA",
            OpCode::Constr => "CONSTR",
            OpCode::RFork => "RFORK",
        }
    }
}

/// Failures raised by a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message-passing substrate unreachable: {0}")]
    Unreachable(String),

    #[error("peer count argument missing")]
    MissingPeerCount,

    #[error("transport used before start/sync completed")]
    NotStarted,

    #[error("received message of {got} bytes exceeds receive buffer of {cap} bytes")]
    Oversize { got: usize, cap: usize },

    #[error("peer PE {0} vanished")]
    PeerVanished(PeId),

    #[error("startup protocol violation: {0}")]
    Protocol(String),

    #[error("transport i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration shared by all backends.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Host address used by the tcp_mesh address scheme.
    pub host: String,

    /// Base port of the tcp_mesh address scheme; PE `i` listens on
    /// `base_port + i`.
    pub base_port: u16,

    /// Outbox depth (tcp_mesh) or mailbox depth (mailbox backend).
    pub send_buffer_size: usize,

    /// Upper bound on one wire message, header included. Receivers size
    /// their buffers from this; senders never exceed it.
    pub max_msg_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: crate::defaults::BASE_PORT,
            send_buffer_size: crate::defaults::SEND_BUFFER_SIZE,
            max_msg_bytes: crate::defaults::PACK_BUFFER_SIZE + 1024,
        }
    }
}

/// Result of [`MpTransport::start`].
#[derive(Debug, Clone, Copy)]
pub struct StartInfo {
    /// Cohort size as known so far; children of some backends only learn
    /// the final value at sync time.
    pub npes: PeId,
    /// Whether this process is the main PE.
    pub i_am_main: bool,
}

/// Result of [`MpTransport::sync`]; after this, all PEs agree on the
/// cohort size and their own number.
#[derive(Debug, Clone, Copy)]
pub struct SyncInfo {
    pub this_pe: PeId,
    pub npes: PeId,
}

/// One received message.
#[derive(Debug)]
pub struct MpMessage {
    pub tag: OpCode,
    pub sender: PeId,
    pub payload: Vec<u8>,
}

/// The message-passing capability set.
///
/// `start` and `sync` run once, in that order, before any traffic;
/// `disconnect` runs once at the very end, after the counted shutdown
/// protocol (which is driven above this trait, uniformly over `send` and
/// `recv`). Between sync and disconnect, `send`/`recv`/`probe` may be
/// called concurrently from the send primitives and the message loop.
#[async_trait]
pub trait MpTransport: Send + Sync {
    /// Connect to the substrate and establish the cohort: determine
    /// whether this process is the main PE and, where the backend spawns
    /// its own peers, start them.
    ///
    /// Consumes the injected peer-count argument (the first non-program
    /// argument) and removes it from `args`.
    async fn start(&mut self, args: &mut Vec<String>) -> Result<StartInfo, TransportError>;

    /// Barrier: returns once all PEs agree on the cohort size and their
    /// own number, and per-peer send/receive state is allocated.
    async fn sync(&mut self) -> Result<SyncInfo, TransportError>;

    /// Release the substrate. The counted shutdown exchange has already
    /// happened by the time this runs.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send one tagged message to `dest` (in `1..=nPEs`; sending to the
    /// own PE is legal and loops back). Zero-length payloads are legal.
    /// Returns `false` when the bounded outbox is saturated; the caller
    /// may retry.
    async fn send(&self, dest: PeId, tag: OpCode, data: &[u8]) -> Result<bool, TransportError>;

    /// Blocking receive of exactly one message into `buf`. System-tagged
    /// messages are delivered before data whenever both are queued. A
    /// message larger than `buf` is a fatal [`TransportError::Oversize`].
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, OpCode, PeId), TransportError>;

    /// Non-blocking: is a message waiting?
    fn probe(&self) -> bool;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Largest payload this backend can carry in one message. Most
    /// backends carry whatever `max_msg_bytes` allows; the mailbox backend
    /// may be clamped by the host's queue limits.
    fn max_message_size(&self) -> usize;
}

/// Transport backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MpBackend {
    /// Full-mesh TCP (reference backend).
    Tcp,
    /// Spawned processes with Unix-socket inboxes.
    Spawn,
    /// POSIX message queues (Linux only).
    Mbox,
}

impl std::fmt::Display for MpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MpBackend::Tcp => write!(f, "tcp"),
            MpBackend::Spawn => write!(f, "spawn"),
            MpBackend::Mbox => write!(f, "mbox"),
        }
    }
}

/// Factory creating transport instances from the selected backend.
pub struct TransportFactory;

impl TransportFactory {
    pub fn create(
        backend: MpBackend,
        config: TransportConfig,
    ) -> Result<Box<dyn MpTransport>, TransportError> {
        match backend {
            MpBackend::Tcp => Ok(Box::new(TcpMeshTransport::new(config))),
            MpBackend::Spawn => Ok(Box::new(ProcSpawnTransport::new(config))),
            #[cfg(target_os = "linux")]
            MpBackend::Mbox => Ok(Box::new(MailboxTransport::new(config))),
            #[cfg(not(target_os = "linux"))]
            MpBackend::Mbox => Err(TransportError::Unreachable(
                "mailbox backend requires Linux".to_string(),
            )),
        }
    }
}

/// Receive-side queue pair implementing the priority rule for backends
/// whose substrate has no native message priorities: system-tagged
/// messages are drained before data.
pub(crate) struct PriorityInbox {
    sys: Mutex<VecDeque<MpMessage>>,
    data: Mutex<VecDeque<MpMessage>>,
    bell: Notify,
    closed: AtomicBool,
}

impl PriorityInbox {
    pub(crate) fn new() -> Self {
        Self {
            sys: Mutex::new(VecDeque::new()),
            data: Mutex::new(VecDeque::new()),
            bell: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, msg: MpMessage) {
        if msg.tag.is_system() {
            self.sys.lock().push_back(msg);
        } else {
            self.data.lock().push_back(msg);
        }
        self.bell.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<MpMessage> {
        if let Some(msg) = self.sys.lock().pop_front() {
            return Some(msg);
        }
        self.data.lock().pop_front()
    }

    /// Await the next message, system tags first.
    pub(crate) async fn pop(&self) -> Option<MpMessage> {
        loop {
            let wakeup = self.bell.notified();
            if let Some(msg) = self.try_pop() {
                return Some(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            wakeup.await;
        }
    }

    pub(crate) fn probe(&self) -> bool {
        !self.sys.lock().is_empty() || !self.data.lock().is_empty()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.bell.notify_one();
    }
}

/// Parse and strip the injected peer-count argument — the first
/// non-program argument, placed there by whatever launched this PE.
pub(crate) fn take_peer_count(args: &mut Vec<String>) -> Option<PeId> {
    if args.len() < 2 {
        return None;
    }
    let count = args[1].parse::<PeId>().ok()?;
    args.remove(1);
    Some(count)
}

/// Frame layout shared by the stream-based backends:
/// `[tag: u8][sender: u32 le][len: u32 le][payload]`.
pub(crate) async fn write_frame<W>(
    stream: &mut W,
    sender: PeId,
    tag: OpCode,
    payload: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&[tag as u8]).await?;
    stream.write_all(&sender.to_le_bytes()).await?;
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Read one frame; `max_len` bounds the payload we are willing to accept.
pub(crate) async fn read_frame<R>(
    stream: &mut R,
    max_len: usize,
) -> std::io::Result<(OpCode, PeId, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut tag_byte = [0u8; 1];
    stream.read_exact(&mut tag_byte).await?;
    let tag = OpCode::from_u8(tag_byte[0]).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown opcode {:#x} on the wire", tag_byte[0]),
        )
    })?;

    let mut word = [0u8; 4];
    stream.read_exact(&mut word).await?;
    let sender = u32::from_le_bytes(word);

    stream.read_exact(&mut word).await?;
    let len = u32::from_le_bytes(word) as usize;
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, max_len),
        ));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((tag, sender, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_partition_is_closed() {
        for raw in MIN_SYSCODE..=OpCode::RFork as u8 {
            let code = OpCode::from_u8(raw).expect("opcode range is contiguous");
            assert_eq!(code as u8, raw);
            assert!(code.is_system() != code.is_data());
        }
        assert!(OpCode::from_u8(0x4f).is_none());
        assert!(OpCode::from_u8(0x5a).is_none());
    }

    #[test]
    fn peer_count_argument_is_consumed() {
        let mut args = vec!["prog".to_string(), "4".to_string(), "--flag".to_string()];
        assert_eq!(take_peer_count(&mut args), Some(4));
        assert_eq!(args, vec!["prog".to_string(), "--flag".to_string()]);

        let mut no_count = vec!["prog".to_string(), "--flag".to_string()];
        assert_eq!(take_peer_count(&mut no_count), None);
        assert_eq!(no_count.len(), 2);
    }

    #[test]
    fn system_tags_cover_the_control_plane() {
        for code in [OpCode::Ready, OpCode::PeTids, OpCode::Fail, OpCode::Finish] {
            assert!(code.is_system(), "{} must be a system tag", code.name());
        }
        for code in [
            OpCode::Connect,
            OpCode::Head,
            OpCode::Data,
            OpCode::Constr,
            OpCode::RFork,
        ] {
            assert!(code.is_data(), "{} must be a data tag", code.name());
        }
    }

    #[tokio::test]
    async fn inbox_prefers_system_messages() {
        let inbox = PriorityInbox::new();
        inbox.push(MpMessage {
            tag: OpCode::Data,
            sender: 2,
            payload: vec![1],
        });
        inbox.push(MpMessage {
            tag: OpCode::Finish,
            sender: 3,
            payload: vec![],
        });

        let first = inbox.pop().await.unwrap();
        assert_eq!(first.tag, OpCode::Finish);
        let second = inbox.pop().await.unwrap();
        assert_eq!(second.tag, OpCode::Data);
        assert!(!inbox.probe());
    }

    #[tokio::test]
    async fn frame_codec_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, 3, OpCode::Head, b"payload").await.unwrap();
        let (tag, sender, payload) = read_frame(&mut b, 1024).await.unwrap();
        assert_eq!(tag, OpCode::Head);
        assert_eq!(sender, 3);
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn zero_length_frames_are_legal() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, 1, OpCode::Connect, &[]).await.unwrap();
        let (tag, sender, payload) = read_frame(&mut b, 64).await.unwrap();
        assert_eq!(tag, OpCode::Connect);
        assert_eq!(sender, 1);
        assert!(payload.is_empty());
    }
}
