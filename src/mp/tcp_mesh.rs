//! Reference transport backend: a full mesh of framed TCP streams.
//!
//! PE `i` listens on `base_port + i`. During sync every child connects to
//! the main PE and reports `READY`; the main PE answers with `PETIDS`
//! (carrying the agreed cohort size, from which every peer address is
//! derived), after which the children wire up the remaining pairs among
//! themselves. Each pair shares one TCP connection, announced by the
//! connecting side with a `NEWPE` hello frame.
//!
//! Outbound traffic to each peer goes through a bounded outbox of
//! `send_buffer_size` outstanding sends; a saturated outbox makes `send`
//! report back-pressure instead of blocking. Inbound frames land in a
//! receive-side priority inbox so system tags overtake data. A peer whose
//! connection drops outside shutdown is reported as a synthesised `FAIL`
//! system message.

use super::{
    read_frame, write_frame, MpMessage, MpTransport, OpCode, PeId, PriorityInbox, StartInfo,
    SyncInfo, TransportConfig, TransportError, CHILD_ENV, MAX_PES, NPES_ENV,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const CONNECT_RETRIES: usize = 100;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// One queued outbound message.
type Outgoing = (OpCode, Vec<u8>);

pub struct TcpMeshTransport {
    config: TransportConfig,
    /// Externally assigned role (index, cohort size); set for launched
    /// cohorts, `None` when the role comes from the environment.
    explicit: Option<(PeId, PeId)>,
    this_pe: PeId,
    npes: PeId,
    i_am_main: bool,
    spawns_children: bool,
    listener: Option<TcpListener>,
    inbox: Arc<PriorityInbox>,
    peers: Arc<Mutex<HashMap<PeId, mpsc::Sender<Outgoing>>>>,
    closing: Arc<AtomicBool>,
    children: Mutex<Vec<Child>>,
    /// Arguments the children are spawned with (the peer count included).
    spawn_args: Vec<String>,
}

impl TcpMeshTransport {
    /// Role from the environment: main PE unless a child index was
    /// injected by the spawning parent.
    pub fn new(config: TransportConfig) -> Self {
        Self::build(config, None)
    }

    /// Externally launched cohort member: the caller supplies this PE's
    /// number and the cohort size, and nothing is spawned.
    pub fn launched(config: TransportConfig, this_pe: PeId, npes: PeId) -> Self {
        Self::build(config, Some((this_pe, npes)))
    }

    fn build(config: TransportConfig, explicit: Option<(PeId, PeId)>) -> Self {
        TcpMeshTransport {
            config,
            explicit,
            this_pe: 0,
            npes: 0,
            i_am_main: false,
            spawns_children: false,
            listener: None,
            inbox: Arc::new(PriorityInbox::new()),
            peers: Arc::new(Mutex::new(HashMap::new())),
            closing: Arc::new(AtomicBool::new(false)),
            children: Mutex::new(Vec::new()),
            spawn_args: Vec::new(),
        }
    }

    fn port_of(&self, pe: PeId) -> u16 {
        self.config.base_port + pe as u16
    }

    fn addr_of(&self, pe: PeId) -> String {
        format!("{}:{}", self.config.host, self.port_of(pe))
    }

    async fn connect_with_retry(&self, pe: PeId) -> Result<TcpStream, TransportError> {
        let addr = self.addr_of(pe);
        let mut last_err = None;
        for _ in 0..CONNECT_RETRIES {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    // Low-latency tuning on every mesh link.
                    let std_stream = stream.into_std()?;
                    let socket = socket2::Socket::from(std_stream.try_clone()?);
                    socket.set_nodelay(true)?;
                    socket.set_recv_buffer_size(self.config.max_msg_bytes.min(1 << 20))?;
                    socket.set_send_buffer_size(self.config.max_msg_bytes.min(1 << 20))?;
                    return Ok(TcpStream::from_std(std_stream)?);
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(TransportError::Unreachable(format!(
            "cannot reach PE {} at {}: {}",
            pe,
            addr,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Wire one established pair connection into the mesh: a reader task
    /// feeding the priority inbox and a bounded-outbox writer task.
    fn adopt_peer(&self, pe: PeId, stream: TcpStream) {
        let (mut read_half, write_half) = stream.into_split();

        let inbox = self.inbox.clone();
        let closing = self.closing.clone();
        let max_len = self.config.max_msg_bytes;
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half, max_len).await {
                    Ok((OpCode::NewPe, _, _)) => {
                        // Hello of a late connection; the peer is known.
                    }
                    Ok((tag, sender, payload)) => {
                        inbox.push(MpMessage {
                            tag,
                            sender,
                            payload,
                        });
                    }
                    Err(_) => {
                        if !closing.load(Ordering::Acquire) {
                            // The peer went away outside shutdown.
                            inbox.push(MpMessage {
                                tag: OpCode::Fail,
                                sender: pe,
                                payload: crate::runtime::fail_payload(pe),
                            });
                        }
                        return;
                    }
                }
            }
        });

        let (tx, rx) = mpsc::channel::<Outgoing>(self.config.send_buffer_size.max(1));
        let this_pe = self.this_pe;
        tokio::spawn(writer_task(this_pe, pe, write_half, rx));

        self.peers.lock().insert(pe, tx);
    }

    fn spawn_child(&self, index: PeId) -> std::io::Result<Child> {
        let exe = std::env::current_exe()?;
        debug!("spawning PE {} as {:?}", index, exe);
        Command::new(exe)
            .args(&self.spawn_args)
            .env(CHILD_ENV, index.to_string())
            .env(NPES_ENV, self.npes.to_string())
            .spawn()
    }
}

async fn writer_task(
    this_pe: PeId,
    peer: PeId,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outgoing>,
) {
    while let Some((tag, payload)) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, this_pe, tag, &payload).await {
            warn!("write to PE {} failed: {}", peer, e);
            return;
        }
        trace!(peer, tag = tag.name(), "frame written");
    }
}

#[async_trait]
impl MpTransport for TcpMeshTransport {
    async fn start(&mut self, args: &mut Vec<String>) -> Result<StartInfo, TransportError> {
        // Children are spawned with the original argument vector; keep it
        // before the count is stripped.
        self.spawn_args = args.iter().skip(1).cloned().collect();
        let count_arg = super::take_peer_count(args);

        let from_env = std::env::var(CHILD_ENV)
            .ok()
            .and_then(|v| v.parse::<PeId>().ok())
            .filter(|&v| v >= 2);

        match (self.explicit, from_env) {
            (Some((this_pe, npes)), _) => {
                self.this_pe = this_pe;
                self.npes = npes;
                self.i_am_main = this_pe == 1;
            }
            (None, Some(index)) => {
                self.this_pe = index;
                self.npes = std::env::var(NPES_ENV)
                    .ok()
                    .and_then(|v| v.parse::<PeId>().ok())
                    .ok_or_else(|| {
                        TransportError::Protocol("child started without cohort size".into())
                    })?;
                self.i_am_main = false;
            }
            (None, None) => {
                // Main PE of a self-spawning cohort.
                let mut npes = match count_arg {
                    Some(count) => count,
                    None => return Err(TransportError::MissingPeerCount),
                };
                if npes == 0 {
                    npes = num_cpus::get() as PeId;
                }
                if npes > MAX_PES {
                    warn!(
                        "unable to run more than {} PEs, using the available maximum",
                        MAX_PES
                    );
                    npes = MAX_PES;
                }
                self.this_pe = 1;
                self.npes = npes;
                self.i_am_main = true;
                self.spawns_children = true;
            }
        }

        // The inbox must exist before peers can reach us.
        let listener = TcpListener::bind(self.addr_of(self.this_pe)).await?;
        self.listener = Some(listener);

        if self.spawns_children {
            let mut children = self.children.lock();
            for index in 2..=self.npes {
                children.push(self.spawn_child(index)?);
            }
        }

        Ok(StartInfo {
            npes: self.npes,
            i_am_main: self.i_am_main,
        })
    }

    async fn sync(&mut self) -> Result<SyncInfo, TransportError> {
        let listener = self.listener.take().ok_or(TransportError::NotStarted)?;
        let max_len = self.config.max_msg_bytes;

        if self.i_am_main {
            // Collect READY from every child, then broadcast PETIDS with
            // the agreed cohort size.
            let mut streams: Vec<(PeId, TcpStream)> = Vec::new();
            while streams.len() < (self.npes - 1) as usize {
                let (mut stream, _) = listener.accept().await?;
                let (tag, sender, _) = read_frame(&mut stream, max_len).await?;
                if tag != OpCode::Ready {
                    return Err(TransportError::Protocol(format!(
                        "expected READY during sync, got {}",
                        tag.name()
                    )));
                }
                debug!("node {} has joined the system", sender);
                streams.push((sender, stream));
            }
            for (pe, stream) in streams.iter_mut() {
                write_frame(stream, 1, OpCode::PeTids, &self.npes.to_le_bytes()).await?;
                trace!("PETIDS sent to PE {}", pe);
            }
            for (pe, stream) in streams {
                self.adopt_peer(pe, stream);
            }
        } else {
            // Report READY to the main PE and learn the cohort size.
            let mut main_stream = self.connect_with_retry(1).await?;
            write_frame(&mut main_stream, self.this_pe, OpCode::Ready, &[]).await?;
            let (tag, _, payload) = read_frame(&mut main_stream, max_len).await?;
            if tag != OpCode::PeTids || payload.len() < 4 {
                return Err(TransportError::Protocol(format!(
                    "expected PETIDS during sync, got {}",
                    tag.name()
                )));
            }
            self.npes = PeId::from_le_bytes(payload[..4].try_into().unwrap());
            self.adopt_peer(1, main_stream);

            // Pair connections among the children: lower-numbered peers
            // are dialled, higher-numbered peers dial us.
            for peer in 2..self.this_pe {
                let mut stream = self.connect_with_retry(peer).await?;
                write_frame(&mut stream, self.this_pe, OpCode::NewPe, &[]).await?;
                self.adopt_peer(peer, stream);
            }
            for _ in (self.this_pe + 1)..=self.npes {
                let (mut stream, _) = listener.accept().await?;
                let (tag, sender, _) = read_frame(&mut stream, max_len).await?;
                if tag != OpCode::NewPe {
                    return Err(TransportError::Protocol(format!(
                        "expected NEWPE hello during sync, got {}",
                        tag.name()
                    )));
                }
                self.adopt_peer(sender, stream);
            }
        }

        Ok(SyncInfo {
            this_pe: self.this_pe,
            npes: self.npes,
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::Release);
        self.peers.lock().clear();
        self.inbox.close();

        // Reap spawned children; the counted shutdown has already told
        // them to go.
        let mut children = std::mem::take(&mut *self.children.lock());
        if !children.is_empty() {
            tokio::task::spawn_blocking(move || {
                for child in children.iter_mut() {
                    let mut waited = 0u64;
                    loop {
                        match child.try_wait() {
                            Ok(Some(_)) => break,
                            Ok(None) if waited < 5_000 => {
                                std::thread::sleep(Duration::from_millis(50));
                                waited += 50;
                            }
                            _ => {
                                let _ = child.kill();
                                let _ = child.wait();
                                break;
                            }
                        }
                    }
                }
            })
            .await
            .ok();
        }
        Ok(())
    }

    async fn send(&self, dest: PeId, tag: OpCode, data: &[u8]) -> Result<bool, TransportError> {
        debug_assert!(dest >= 1 && dest <= self.npes);

        if dest == self.this_pe {
            // Local loopback; the inbox keeps the priority rule intact.
            self.inbox.push(MpMessage {
                tag,
                sender: self.this_pe,
                payload: data.to_vec(),
            });
            return Ok(true);
        }

        let tx = self
            .peers
            .lock()
            .get(&dest)
            .cloned()
            .ok_or(TransportError::PeerVanished(dest))?;
        match tx.try_send((tag, data.to_vec())) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("outbox to PE {} saturated, send refused", dest);
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::PeerVanished(dest)),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, OpCode, PeId), TransportError> {
        let msg = self
            .inbox
            .pop()
            .await
            .ok_or_else(|| TransportError::Unreachable("transport closed".into()))?;
        if msg.payload.len() > buf.len() {
            return Err(TransportError::Oversize {
                got: msg.payload.len(),
                cap: buf.len(),
            });
        }
        buf[..msg.payload.len()].copy_from_slice(&msg.payload);
        Ok((msg.payload.len(), msg.tag, msg.sender))
    }

    fn probe(&self) -> bool {
        self.inbox.probe()
    }

    fn name(&self) -> &'static str {
        "tcp-mesh"
    }

    fn max_message_size(&self) -> usize {
        self.config.max_msg_bytes
    }
}
