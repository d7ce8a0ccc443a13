//! Process-spawn transport backend.
//!
//! The main PE generates a random 8-character substrate key, exports it —
//! together with each child's index — through the environment, and spawns
//! every child as a fresh copy of the running program image. A process
//! finding a non-zero child index in its environment knows it is not the
//! main PE.
//!
//! Each PE's inbox is a Unix domain socket in a key-derived directory;
//! every peer holds the send side of every inbox. The transport itself
//! buffers nothing: a send writes straight into the receiver's socket and
//! only a receiver that stops draining for a long time makes `send`
//! report back-pressure (via a write timeout). The priority rule is
//! enforced receive-side, like in the TCP backend.

use super::{
    read_frame, write_frame, MpMessage, MpTransport, OpCode, PeId, PriorityInbox, StartInfo,
    SyncInfo, TransportConfig, TransportError, CHILD_ENV, KEY_ENV, MAX_PES,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const CONNECT_RETRIES: usize = 100;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// An unresponsive receiver shows up as a send that cannot drain; after
/// this long the send reports back-pressure instead of blocking forever.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProcSpawnTransport {
    config: TransportConfig,
    /// Externally assigned role for in-process cohorts (tests); the key
    /// must be shared out of band then.
    explicit: Option<(PeId, PeId, String)>,
    key: String,
    this_pe: PeId,
    npes: PeId,
    i_am_main: bool,
    spawns_children: bool,
    listener: Option<UnixListener>,
    inbox: Arc<PriorityInbox>,
    /// Send side of every peer's inbox. One stream per peer, exclusively
    /// for writing.
    peers: Arc<Mutex<HashMap<PeId, Arc<tokio::sync::Mutex<UnixStream>>>>>,
    closing: Arc<AtomicBool>,
    children: Mutex<Vec<Child>>,
    spawn_args: Vec<String>,
}

impl ProcSpawnTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::build(config, None)
    }

    /// In-process cohort member with an externally agreed key; nothing is
    /// spawned.
    pub fn launched(config: TransportConfig, this_pe: PeId, npes: PeId, key: &str) -> Self {
        Self::build(config, Some((this_pe, npes, key.to_string())))
    }

    fn build(config: TransportConfig, explicit: Option<(PeId, PeId, String)>) -> Self {
        ProcSpawnTransport {
            config,
            explicit,
            key: String::new(),
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

    fn substrate_dir(&self) -> PathBuf {
        std::env::temp_dir().join(format!("par-rte-{}", self.key))
    }

    fn sock_path(&self, pe: PeId) -> PathBuf {
        self.substrate_dir().join(format!("pe{}.sock", pe))
    }

    async fn open_send_side(&self, pe: PeId) -> Result<UnixStream, TransportError> {
        let path = self.sock_path(pe);
        let mut last_err = None;
        for _ in 0..CONNECT_RETRIES {
            match UnixStream::connect(&path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(TransportError::Unreachable(format!(
            "cannot open inbox of PE {} at {:?}: {}",
            pe,
            path,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Spawn a reader draining one accepted inbox connection.
    fn spawn_reader(&self, peer: PeId, mut stream: UnixStream) {
        let inbox = self.inbox.clone();
        let closing = self.closing.clone();
        let max_len = self.config.max_msg_bytes;
        tokio::spawn(async move {
            loop {
                match read_frame(&mut stream, max_len).await {
                    Ok((OpCode::NewPe, _, _)) => {}
                    Ok((tag, sender, payload)) => inbox.push(MpMessage {
                        tag,
                        sender,
                        payload,
                    }),
                    Err(_) => {
                        if !closing.load(Ordering::Acquire) && peer != 0 {
                            inbox.push(MpMessage {
                                tag: OpCode::Fail,
                                sender: peer,
                                payload: crate::runtime::fail_payload(peer),
                            });
                        }
                        return;
                    }
                }
            }
        });
    }

    /// Accept one inbox connection and its identifying first frame.
    async fn accept_identified(
        &self,
        listener: &UnixListener,
        expect: OpCode,
    ) -> Result<(PeId, Vec<u8>, UnixStream), TransportError> {
        let (mut stream, _) = listener.accept().await?;
        let (tag, sender, payload) = read_frame(&mut stream, self.config.max_msg_bytes).await?;
        if tag != expect {
            return Err(TransportError::Protocol(format!(
                "expected {} during sync, got {}",
                expect.name(),
                tag.name()
            )));
        }
        Ok((sender, payload, stream))
    }

    fn spawn_child(&self, index: PeId) -> std::io::Result<Child> {
        let exe = std::env::current_exe()?;
        debug!("forking child {} as {:?}", index, exe);
        Command::new(exe)
            .args(&self.spawn_args)
            .env(CHILD_ENV, index.to_string())
            .env(KEY_ENV, &self.key)
            .spawn()
    }
}

fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[async_trait]
impl MpTransport for ProcSpawnTransport {
    async fn start(&mut self, args: &mut Vec<String>) -> Result<StartInfo, TransportError> {
        self.spawn_args = args.iter().skip(1).cloned().collect();
        let count_arg = super::take_peer_count(args);

        let from_env = std::env::var(CHILD_ENV)
            .ok()
            .and_then(|v| v.parse::<PeId>().ok())
            .filter(|&v| v >= 2);

        match (&self.explicit, from_env) {
            (Some((this_pe, npes, key)), _) => {
                self.this_pe = *this_pe;
                self.npes = *npes;
                self.key = key.clone();
                self.i_am_main = *this_pe == 1;
            }
            (None, Some(index)) => {
                self.this_pe = index;
                self.npes = count_arg.unwrap_or(0);
                self.key = std::env::var(KEY_ENV).map_err(|_| {
                    TransportError::Protocol("child started without substrate key".into())
                })?;
                if self.key.len() != 8 {
                    return Err(TransportError::Protocol(
                        "substrate key must be 8 characters".into(),
                    ));
                }
                self.i_am_main = false;
            }
            (None, None) => {
                let mut npes = count_arg.ok_or(TransportError::MissingPeerCount)?;
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
                self.key = random_key();
                self.i_am_main = true;
                self.spawns_children = true;
                debug!("chosen substrate key |{}|", self.key);
            }
        }

        // Create the inbox before anyone can try to reach it.
        let dir = self.substrate_dir();
        std::fs::create_dir_all(&dir)?;
        let sock = self.sock_path(self.this_pe);
        let _ = std::fs::remove_file(&sock);
        self.listener = Some(UnixListener::bind(&sock)?);

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

        if self.i_am_main {
            // Each child's READY arrives on its freshly opened send side
            // of our inbox; that connection then feeds our readers.
            for i in 1..self.npes {
                let (sender, _, stream) = self.accept_identified(&listener, OpCode::Ready).await?;
                debug!("awaited READY ({} of {}): node {}", i, self.npes - 1, sender);
                self.spawn_reader(sender, stream);
            }
            // Open the send side of every child inbox and broadcast the
            // cohort size.
            for pe in 2..=self.npes {
                let mut stream = self.open_send_side(pe).await?;
                write_frame(&mut stream, 1, OpCode::PeTids, &self.npes.to_le_bytes()).await?;
                self.peers
                    .lock()
                    .insert(pe, Arc::new(tokio::sync::Mutex::new(stream)));
            }
        } else {
            // Report READY on the main inbox; that stream stays our send
            // side towards the main PE.
            let mut to_main = self.open_send_side(1).await?;
            write_frame(&mut to_main, self.this_pe, OpCode::Ready, &[]).await?;
            self.peers
                .lock()
                .insert(1, Arc::new(tokio::sync::Mutex::new(to_main)));

            // The main PE's PETIDS and the siblings' hellos arrive on our
            // own inbox in no particular order; accept until PETIDS is in
            // hand, counting early hellos.
            let mut hellos = 0u32;
            loop {
                let (mut stream, _) = listener.accept().await?;
                let (tag, sender, payload) =
                    read_frame(&mut stream, self.config.max_msg_bytes).await?;
                match tag {
                    OpCode::PeTids => {
                        if payload.len() < 4 {
                            return Err(TransportError::Protocol("short PETIDS payload".into()));
                        }
                        self.npes = PeId::from_le_bytes(payload[..4].try_into().unwrap());
                        self.spawn_reader(sender, stream);
                        break;
                    }
                    OpCode::NewPe => {
                        hellos += 1;
                        self.spawn_reader(sender, stream);
                    }
                    other => {
                        return Err(TransportError::Protocol(format!(
                            "expected PETIDS or NEWPE during sync, got {}",
                            other.name()
                        )));
                    }
                }
            }

            // Open the send side of every sibling inbox, announcing
            // ourselves so their readers can attribute a later failure.
            for pe in 2..=self.npes {
                if pe == self.this_pe {
                    continue;
                }
                let mut stream = self.open_send_side(pe).await?;
                write_frame(&mut stream, self.this_pe, OpCode::NewPe, &[]).await?;
                self.peers
                    .lock()
                    .insert(pe, Arc::new(tokio::sync::Mutex::new(stream)));
            }

            // And accept the remaining siblings' send sides.
            while hellos < self.npes.saturating_sub(2) {
                let (sender, _, stream) = self.accept_identified(&listener, OpCode::NewPe).await?;
                self.spawn_reader(sender, stream);
                hellos += 1;
            }
        }

        // Every send side in the cohort is open by now; the listener has
        // served its purpose.
        drop(listener);

        Ok(SyncInfo {
            this_pe: self.this_pe,
            npes: self.npes,
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::Release);
        self.peers.lock().clear();
        self.inbox.close();

        let mut children = std::mem::take(&mut *self.children.lock());
        let reap = !children.is_empty();
        if reap {
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

        // Inbox owners remove their socket; the main PE sweeps the
        // key directory once the cohort is gone.
        let _ = std::fs::remove_file(self.sock_path(self.this_pe));
        if self.i_am_main {
            let _ = std::fs::remove_dir(self.substrate_dir());
        }
        Ok(())
    }

    async fn send(&self, dest: PeId, tag: OpCode, data: &[u8]) -> Result<bool, TransportError> {
        debug_assert!(dest >= 1 && dest <= self.npes);

        if dest == self.this_pe {
            self.inbox.push(MpMessage {
                tag,
                sender: self.this_pe,
                payload: data.to_vec(),
            });
            return Ok(true);
        }

        let stream = self
            .peers
            .lock()
            .get(&dest)
            .cloned()
            .ok_or(TransportError::PeerVanished(dest))?;
        let mut stream = stream.lock().await;
        match timeout(WRITE_TIMEOUT, write_frame(&mut *stream, self.this_pe, tag, data)).await {
            Ok(Ok(())) => {
                trace!(dest, tag = tag.name(), "frame delivered to inbox");
                Ok(true)
            }
            Ok(Err(e)) => {
                warn!("send to PE {} failed: {}", dest, e);
                Err(TransportError::PeerVanished(dest))
            }
            Err(_) => {
                // Receiver is not draining; report saturation.
                warn!("send to PE {} timed out under back-pressure", dest);
                Ok(false)
            }
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
        "proc-spawn"
    }

    fn max_message_size(&self) -> usize {
        self.config.max_msg_bytes
    }
}
