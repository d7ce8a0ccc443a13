//! Mailbox transport backend: POSIX message queues (Linux).
//!
//! Every PE owns one kernel message queue named from the cohort's
//! substrate key; peers hold send-side descriptors of each other's
//! queues. Children are spawned from the running program image exactly as
//! in the spawn backend; the main PE waits for each child's `READY` and
//! broadcasts `PETIDS`.
//!
//! Two properties come straight from the kernel here: a full queue turns
//! a non-blocking send into back-pressure (`EAGAIN` stays `EAGAIN` until
//! the receiver actually drains), and queue priorities deliver
//! system-tagged messages ahead of queued data.
//!
//! Message size is bounded by the host's `/proc/sys/fs/mqueue/msgsize_max`
//! (commonly 8 KiB); when the configured pack buffer exceeds what the
//! host allows, the queue is created with the host maximum and
//! `max_message_size` reports the clamp.

use super::{
    MpMessage, MpTransport, OpCode, PeId, PriorityInbox, StartInfo, SyncInfo, TransportConfig,
    TransportError, CHILD_ENV, KEY_ENV, MAX_PES,
};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::mqueue::{
    mq_getattr, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT,
};
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Queue priority of system-tagged messages; data goes at 0.
const SYS_PRIO: u32 = 7;

/// Frame prefix inside one queue message: tag byte plus sender word.
const FRAME_PREFIX: usize = 5;

/// Poll interval of a blocking receive while the queue is empty.
const POLL_IDLE: Duration = Duration::from_micros(200);

const OPEN_RETRIES: usize = 100;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// One kernel mail slot: the descriptor plus enough bookkeeping to clean
/// it up. The creating side unlinks the queue name on drop.
pub(crate) struct MailSlot {
    mqd: MqdT,
    name: String,
    owner: bool,
    /// Largest message the queue accepts, frame prefix included.
    msg_size: usize,
}

// The descriptor is an owned fd; slots are shared between the sync code
// and the receive path.
unsafe impl Send for MailSlot {}
unsafe impl Sync for MailSlot {}

impl MailSlot {
    /// Create the receive side of an inbox. `depth` bounds the number of
    /// queued messages, `msg_size` the bytes per message; both may be
    /// clamped by the host, in which case the clamp is recorded in the
    /// slot.
    pub(crate) fn create(
        name: &str,
        depth: usize,
        msg_size: usize,
    ) -> Result<MailSlot, TransportError> {
        let mode = Mode::from_bits_truncate(0o600);
        let flags = MQ_OFlag::O_CREAT | MQ_OFlag::O_RDONLY | MQ_OFlag::O_NONBLOCK;

        let attr = MqAttr::new(0, depth as i64, msg_size as i64, 0);
        let mqd = match mq_open(name, flags, mode, Some(&attr)) {
            Ok(mqd) => mqd,
            Err(Errno::EINVAL) | Err(Errno::EPERM) => {
                // The host caps queue geometry below what was asked for;
                // fall back to its defaults.
                warn!(
                    "host rejects mailbox of {} x {} bytes, using host defaults",
                    depth, msg_size
                );
                mq_open(name, flags, mode, None)
                    .map_err(|e| TransportError::Unreachable(format!("mq_open {}: {}", name, e)))?
            }
            Err(e) => {
                return Err(TransportError::Unreachable(format!(
                    "mq_open {}: {}",
                    name, e
                )))
            }
        };

        let actual = mq_getattr(&mqd)
            .map_err(|e| TransportError::Unreachable(format!("mq_getattr {}: {}", name, e)))?;
        Ok(MailSlot {
            mqd,
            name: name.to_string(),
            owner: true,
            msg_size: actual.msgsize() as usize,
        })
    }

    /// Open the send side of a peer's inbox, waiting for the peer to
    /// create it.
    pub(crate) fn open(name: &str) -> Result<MailSlot, TransportError> {
        let flags = MQ_OFlag::O_WRONLY | MQ_OFlag::O_NONBLOCK;
        let mut attempts = 0;
        loop {
            match mq_open(name, flags, Mode::empty(), None) {
                Ok(mqd) => {
                    let actual = mq_getattr(&mqd).map_err(|e| {
                        TransportError::Unreachable(format!("mq_getattr {}: {}", name, e))
                    })?;
                    return Ok(MailSlot {
                        mqd,
                        name: name.to_string(),
                        owner: false,
                        msg_size: actual.msgsize() as usize,
                    });
                }
                Err(Errno::ENOENT) if attempts < OPEN_RETRIES => {
                    attempts += 1;
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(TransportError::Unreachable(format!(
                        "mq_open {}: {}",
                        name, e
                    )))
                }
            }
        }
    }

    /// Non-blocking send of one framed message. `false` means the queue
    /// is full — the receiver has not drained it.
    pub(crate) fn try_send(
        &self,
        sender: PeId,
        tag: OpCode,
        payload: &[u8],
    ) -> Result<bool, TransportError> {
        if FRAME_PREFIX + payload.len() > self.msg_size {
            return Err(TransportError::Oversize {
                got: FRAME_PREFIX + payload.len(),
                cap: self.msg_size,
            });
        }
        let mut frame = Vec::with_capacity(FRAME_PREFIX + payload.len());
        frame.push(tag as u8);
        frame.extend_from_slice(&sender.to_le_bytes());
        frame.extend_from_slice(payload);

        let prio = if tag.is_system() { SYS_PRIO } else { 0 };
        match mq_send(&self.mqd, &frame, prio) {
            Ok(()) => Ok(true),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(TransportError::Unreachable(format!(
                "mq_send {}: {}",
                self.name, e
            ))),
        }
    }

    /// Non-blocking receive; `None` when the queue is empty. The kernel
    /// hands out higher-priority messages first.
    pub(crate) fn try_recv(&self) -> Result<Option<MpMessage>, TransportError> {
        let mut buffer = vec![0u8; self.msg_size];
        let mut priority = 0u32;
        match mq_receive(&self.mqd, &mut buffer, &mut priority) {
            Ok(len) if len >= FRAME_PREFIX => {
                let tag = OpCode::from_u8(buffer[0]).ok_or_else(|| {
                    TransportError::Protocol(format!("unknown opcode {:#x} in mailbox", buffer[0]))
                })?;
                let sender = PeId::from_le_bytes(buffer[1..5].try_into().unwrap());
                Ok(Some(MpMessage {
                    tag,
                    sender,
                    payload: buffer[FRAME_PREFIX..len].to_vec(),
                }))
            }
            Ok(_) => Err(TransportError::Protocol("runt mailbox message".into())),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(TransportError::Unreachable(format!(
                "mq_receive {}: {}",
                self.name, e
            ))),
        }
    }

    /// Are messages queued right now?
    pub(crate) fn pending(&self) -> bool {
        mq_getattr(&self.mqd)
            .map(|attr| attr.curmsgs() > 0)
            .unwrap_or(false)
    }

    /// Largest payload this slot can carry.
    pub(crate) fn max_payload(&self) -> usize {
        self.msg_size.saturating_sub(FRAME_PREFIX)
    }
}

impl Drop for MailSlot {
    fn drop(&mut self) {
        // The descriptor closes with its owned fd; only the creator
        // removes the queue name from the system.
        if self.owner {
            let _ = mq_unlink(self.name.as_str());
        }
    }
}

pub struct MailboxTransport {
    config: TransportConfig,
    explicit: Option<(PeId, PeId, String)>,
    key: String,
    this_pe: PeId,
    npes: PeId,
    i_am_main: bool,
    spawns_children: bool,
    /// Own inbox; the kernel queue itself is the bounded receive buffer.
    slot: Mutex<Option<Arc<MailSlot>>>,
    slot_payload: usize,
    /// Loopback and sync-phase leftovers, served in arrival order with
    /// system tags first.
    inbox: Arc<PriorityInbox>,
    peers: Arc<Mutex<HashMap<PeId, Arc<MailSlot>>>>,
    children: Mutex<Vec<Child>>,
    spawn_args: Vec<String>,
}

impl MailboxTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::build(config, None)
    }

    /// In-process cohort member with an externally agreed key.
    pub fn launched(config: TransportConfig, this_pe: PeId, npes: PeId, key: &str) -> Self {
        Self::build(config, Some((this_pe, npes, key.to_string())))
    }

    fn build(config: TransportConfig, explicit: Option<(PeId, PeId, String)>) -> Self {
        MailboxTransport {
            config,
            explicit,
            key: String::new(),
            this_pe: 0,
            npes: 0,
            i_am_main: false,
            spawns_children: false,
            slot: Mutex::new(None),
            slot_payload: 0,
            inbox: Arc::new(PriorityInbox::new()),
            peers: Arc::new(Mutex::new(HashMap::new())),
            children: Mutex::new(Vec::new()),
            spawn_args: Vec::new(),
        }
    }

    fn slot_name(&self, pe: PeId) -> String {
        format!("/parrte_{}_{}", self.key, pe)
    }

    fn own_slot(&self) -> Result<Arc<MailSlot>, TransportError> {
        self.slot.lock().clone().ok_or(TransportError::NotStarted)
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

    /// Poll the own slot until `expect` arrives; out-of-band messages are
    /// parked in the inbox.
    async fn await_slot_message(
        &self,
        slot: &MailSlot,
        expect: OpCode,
    ) -> Result<MpMessage, TransportError> {
        loop {
            match slot.try_recv()? {
                Some(msg) if msg.tag == expect => return Ok(msg),
                Some(msg) => self.inbox.push(msg),
                None => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
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
impl MpTransport for MailboxTransport {
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

        // Create the own mailbox before anyone could send to it.
        let name = self.slot_name(self.this_pe);
        let slot = MailSlot::create(
            &name,
            self.config.send_buffer_size.max(1),
            FRAME_PREFIX + self.config.max_msg_bytes,
        )?;
        self.slot_payload = slot.max_payload();
        *self.slot.lock() = Some(Arc::new(slot));

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
        let slot = self.own_slot()?;

        if self.i_am_main {
            for i in 1..self.npes {
                let msg = self.await_slot_message(&slot, OpCode::Ready).await?;
                debug!(
                    "awaited READY ({} of {}): node {}",
                    i,
                    self.npes - 1,
                    msg.sender
                );
            }
            // Open each child's slot and broadcast the cohort size.
            for pe in 2..=self.npes {
                let peer = MailSlot::open(&self.slot_name(pe))?;
                while !peer.try_send(1, OpCode::PeTids, &self.npes.to_le_bytes())? {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                self.peers.lock().insert(pe, Arc::new(peer));
            }
        } else {
            let main_slot = MailSlot::open(&self.slot_name(1))?;
            // READY must reach the main PE; its inbox is near-empty this
            // early, so a full queue can only be transient.
            while !main_slot.try_send(self.this_pe, OpCode::Ready, &[])? {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            self.peers.lock().insert(1, Arc::new(main_slot));

            let petids = self.await_slot_message(&slot, OpCode::PeTids).await?;
            if petids.payload.len() < 4 {
                return Err(TransportError::Protocol("short PETIDS payload".into()));
            }
            self.npes = PeId::from_le_bytes(petids.payload[..4].try_into().unwrap());

            for pe in 2..=self.npes {
                if pe == self.this_pe {
                    continue;
                }
                let peer = MailSlot::open(&self.slot_name(pe))?;
                self.peers.lock().insert(pe, Arc::new(peer));
            }
        }

        Ok(SyncInfo {
            this_pe: self.this_pe,
            npes: self.npes,
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peers.lock().clear();
        self.inbox.close();
        // Dropping the own slot closes the descriptor and unlinks the
        // queue name.
        self.slot.lock().take();

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
            self.inbox.push(MpMessage {
                tag,
                sender: self.this_pe,
                payload: data.to_vec(),
            });
            return Ok(true);
        }

        let slot = self
            .peers
            .lock()
            .get(&dest)
            .cloned()
            .ok_or(TransportError::PeerVanished(dest))?;
        let sent = slot.try_send(self.this_pe, tag, data)?;
        if !sent {
            trace!("mailbox of PE {} full, send refused", dest);
        }
        Ok(sent)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, OpCode, PeId), TransportError> {
        let slot = self.own_slot()?;
        let msg = loop {
            // Drain the kernel queue first: it yields system tags before
            // data, and a system tag overtakes anything parked.
            let mut from_queue = None;
            while let Some(queued) = slot.try_recv()? {
                if queued.tag.is_system() {
                    from_queue = Some(queued);
                    break;
                }
                // Data goes behind earlier parked data, keeping per-pair
                // order intact.
                self.inbox.push(queued);
            }
            if let Some(msg) = from_queue {
                break msg;
            }
            if let Some(msg) = self.inbox.try_pop() {
                break msg;
            }
            tokio::time::sleep(POLL_IDLE).await;
        };

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
        if self.inbox.probe() {
            return true;
        }
        self.slot
            .lock()
            .as_ref()
            .map(|slot| slot.pending())
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "mailbox"
    }

    fn max_message_size(&self) -> usize {
        self.slot_payload.min(self.config.max_msg_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(suffix: &str) -> String {
        format!("/parrte_test_{}_{}", std::process::id(), suffix)
    }

    #[test]
    fn full_slot_reports_backpressure_until_drained() {
        let name = test_name("bp");
        let slot = MailSlot::create(&name, 1, 256).unwrap();
        let sender = MailSlot::open(&name).unwrap();

        // Depth 1: the first send fits, the second is refused.
        assert!(sender.try_send(1, OpCode::Data, b"one").unwrap());
        assert!(!sender.try_send(1, OpCode::Data, b"two").unwrap());

        // Draining the slot frees the space and the retry succeeds.
        let msg = slot.try_recv().unwrap().unwrap();
        assert_eq!(msg.payload, b"one");
        assert!(sender.try_send(1, OpCode::Data, b"two").unwrap());
        let msg = slot.try_recv().unwrap().unwrap();
        assert_eq!(msg.payload, b"two");
    }

    #[test]
    fn queued_system_messages_overtake_data() {
        let name = test_name("prio");
        let slot = MailSlot::create(&name, 8, 256).unwrap();
        let sender = MailSlot::open(&name).unwrap();

        assert!(sender.try_send(2, OpCode::Data, b"payload").unwrap());
        assert!(sender.try_send(2, OpCode::Finish, &[]).unwrap());

        let first = slot.try_recv().unwrap().unwrap();
        assert_eq!(first.tag, OpCode::Finish);
        assert_eq!(first.sender, 2);
        let second = slot.try_recv().unwrap().unwrap();
        assert_eq!(second.tag, OpCode::Data);
        assert!(slot.try_recv().unwrap().is_none());
    }

    #[test]
    fn pending_reflects_queue_state() {
        let name = test_name("pend");
        let slot = MailSlot::create(&name, 4, 128).unwrap();
        let sender = MailSlot::open(&name).unwrap();

        assert!(!slot.pending());
        assert!(sender.try_send(1, OpCode::Connect, &[]).unwrap());
        assert!(slot.pending());
        slot.try_recv().unwrap().unwrap();
        assert!(!slot.pending());
    }

    #[test]
    fn oversize_payloads_are_rejected_up_front() {
        let name = test_name("size");
        let slot = MailSlot::create(&name, 2, 64).unwrap();
        let sender = MailSlot::open(&name).unwrap();
        let too_big = vec![0u8; slot.max_payload() + 1];
        assert!(matches!(
            sender.try_send(1, OpCode::Data, &too_big),
            Err(TransportError::Oversize { .. })
        ));
        drop(slot);
    }

    #[test]
    fn substrate_keys_are_eight_alphanumerics() {
        let key = random_key();
        assert_eq!(key.len(), 8);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
