//! # Runtime Lifecycle and Process-Wide State
//!
//! One [`ParRuntime`] exists per PE. It owns everything the parallel core
//! keeps process-wide: the transport, the runtime tables, the single pack
//! buffer, the PE's own number and the cohort size, the placement cursor,
//! and the counters of the shutdown and failure protocol. The record is
//! initialised by [`ParRuntime::startup`] and torn down — in reverse order
//! — by [`ParRuntime::shutdown`]; startup is not reentrant.
//!
//! ## Shutdown protocol
//!
//! Termination is two-phase and counted. The main PE broadcasts `FINISH`
//! to all children and consumes `FINISH` replies until its counter reaches
//! `N - 1`; every other PE sends exactly one `FINISH` (carrying its error
//! code) to the main PE, and blocks for the reply only when it is shutting
//! down on an error. Afterwards every PE drains whatever the substrate
//! still holds, disconnects, and zeroes its PE count as a sentinel against
//! duplicate shutdowns.
//!
//! ## Failure protocol
//!
//! A vanished peer surfaces as a system-tagged `FAIL` message naming the
//! failed PE. The main PE marks it defunct (so the shutdown broadcast
//! skips it and its missing reply is accounted for), raises the global
//! failure flag, and shuts the cohort down with a non-zero code.

use crate::datacomms::PlacementState;
use crate::mp::{
    MpBackend, MpTransport, OpCode, PeId, StartInfo, TransportConfig, TransportFactory,
};
use crate::pack::{MsgBuffer, PackBuffer, DEBUG_HEADROOM, WIRE_HEADER_WORDS, WORD_BYTES};
use crate::rtt::RtTables;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Exit codes propagated through `FINISH` to the main PE.
pub mod exit_code {
    /// Normal termination.
    pub const SUCCESS: i32 = 0;
    /// Uncaught user exception.
    pub const PROGRAM_ERROR: i32 = 1;
    /// Heap exhaustion.
    pub const HEAP_EXHAUSTED: i32 = 251;
    /// Interrupted.
    pub const INTERRUPTED: i32 = 252;
    /// Internal runtime error.
    pub const INTERNAL_ERROR: i32 = 254;
}

/// Remote-fork placement policy bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Placement {
    /// Place forks on a uniformly random PE instead of round-robin.
    pub random: bool,
    /// Never place a fork on the local PE (skipped when the cohort has a
    /// single PE).
    pub no_local: bool,
}

/// Runtime options recognised by the parallel core.
#[derive(Debug, Clone)]
pub struct RtsConfig {
    pub backend: MpBackend,
    /// Pack buffer capacity in bytes; upper bound on one message payload.
    pub pack_buffer_size: usize,
    /// Transport outbox depth.
    pub send_buffer_size: usize,
    pub placement: Placement,
    /// Address scheme of the tcp backend.
    pub host: String,
    pub base_port: u16,
}

impl Default for RtsConfig {
    fn default() -> Self {
        Self {
            backend: MpBackend::Tcp,
            pack_buffer_size: crate::defaults::PACK_BUFFER_SIZE,
            send_buffer_size: crate::defaults::SEND_BUFFER_SIZE,
            placement: Placement::default(),
            host: "127.0.0.1".to_string(),
            base_port: crate::defaults::BASE_PORT,
        }
    }
}

impl RtsConfig {
    /// Upper bound of one wire message: header, payload capacity, and the
    /// scratch headroom.
    pub fn max_msg_bytes(&self) -> usize {
        (WIRE_HEADER_WORDS + DEBUG_HEADROOM) * WORD_BYTES + self.pack_buffer_size
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            base_port: self.base_port,
            send_buffer_size: self.send_buffer_size,
            max_msg_bytes: self.max_msg_bytes(),
        }
    }
}

/// A message as seen by the per-PE message-processing loop.
#[derive(Debug)]
pub enum RtsMessage {
    /// Port-addressed data-layer message (`CONNECT`, `HEAD`, `DATA`,
    /// `CONSTR`); route to [`ParRuntime::process_data_msg`].
    Data { tag: OpCode, buffer: MsgBuffer },
    /// Remote fork; the scheduler creates a process evaluating the graph.
    RFork { buffer: MsgBuffer },
    /// Counted shutdown message. The finish counter has already been
    /// updated when this is surfaced.
    Finish { code: i32, from: PeId },
    /// A peer vanished; defunct bookkeeping is already done.
    Fail { pe: PeId },
}

/// The per-PE runtime instance.
pub struct ParRuntime {
    pub(crate) config: RtsConfig,
    pub(crate) transport: Arc<dyn MpTransport>,
    pub(crate) rtt: RtTables,
    /// The single process-wide pack buffer. The lock spans pack → send on
    /// the way out and unpack → placeholder update on the way in.
    pub(crate) pack_buffer: tokio::sync::Mutex<PackBuffer>,
    pub(crate) this_pe: PeId,
    /// Cohort size; kept separately from the sentinel so that shutdown
    /// arithmetic still works after `npes` is zeroed.
    pub(crate) cohort: PeId,
    npes: AtomicU32,
    i_am_main: bool,
    pub(crate) placement_state: Mutex<PlacementState>,
    /// Counted `FINISH` replies; reaches `N - 1` on the main PE.
    finish_recvd: AtomicU32,
    /// PEs whose `FINISH` has been seen; the counted phase is over when
    /// every child is here or defunct.
    finished: Mutex<HashSet<PeId>>,
    /// PEs known to have failed; skipped by the shutdown broadcast.
    defunct: Mutex<HashSet<PeId>>,
    failure: AtomicBool,
    first_error: AtomicI32,
    recv_buf: tokio::sync::Mutex<Vec<u8>>,
}

impl ParRuntime {
    /// Bring this PE up: connect to the substrate (spawning peers where
    /// the backend does that), synchronise the cohort, and initialise the
    /// process-wide state — runtime tables, pack buffer, and the system
    /// owner of generated placeholders.
    ///
    /// Consumes the injected peer-count argument from `args`.
    pub async fn startup(config: RtsConfig, args: &mut Vec<String>) -> Result<ParRuntime> {
        let transport = TransportFactory::create(config.backend, config.transport_config())?;
        Self::startup_with(config, transport, args).await
    }

    /// Same as [`ParRuntime::startup`], but over an already-constructed
    /// transport. Used by externally-launched cohorts and by tests.
    pub async fn startup_with(
        config: RtsConfig,
        mut transport: Box<dyn MpTransport>,
        args: &mut Vec<String>,
    ) -> Result<ParRuntime> {
        let start: StartInfo = transport.start(args).await?;
        if start.i_am_main {
            info!(
                "==== Starting parallel execution on {} processors ...",
                start.npes
            );
        }

        let sync = transport.sync().await?;
        crate::logging::set_pe(sync.this_pe);
        debug!(
            target: "par_runtime::comm",
            "PE {} of {} synchronised over {}",
            sync.this_pe,
            sync.npes,
            transport.name()
        );

        let max_msg = config.max_msg_bytes();
        let runtime = ParRuntime {
            rtt: RtTables::new(sync.this_pe),
            pack_buffer: tokio::sync::Mutex::new(PackBuffer::new(config.pack_buffer_size)),
            this_pe: sync.this_pe,
            cohort: sync.npes,
            npes: AtomicU32::new(sync.npes),
            i_am_main: start.i_am_main,
            placement_state: Mutex::new(PlacementState::new()),
            finish_recvd: AtomicU32::new(0),
            finished: Mutex::new(HashSet::new()),
            defunct: Mutex::new(HashSet::new()),
            failure: AtomicBool::new(false),
            first_error: AtomicI32::new(exit_code::SUCCESS),
            recv_buf: tokio::sync::Mutex::new(vec![0u8; max_msg]),
            config,
            transport: Arc::from(transport),
        };
        runtime.emit_startup_events();
        Ok(runtime)
    }

    fn emit_startup_events(&self) {
        info!(
            target: "par_runtime::comm",
            pe = self.this_pe,
            cohort = self.cohort,
            backend = self.transport.name(),
            "machine up"
        );
    }

    pub fn this_pe(&self) -> PeId {
        self.this_pe
    }

    /// Cohort size; zero once this PE has shut down.
    pub fn npes(&self) -> PeId {
        self.npes.load(Ordering::Acquire)
    }

    pub fn i_am_main(&self) -> bool {
        self.i_am_main
    }

    pub fn is_failure(&self) -> bool {
        self.failure.load(Ordering::Acquire)
    }

    pub fn rtt(&self) -> &RtTables {
        &self.rtt
    }

    /// First non-zero error code observed across the cohort.
    pub fn first_error(&self) -> i32 {
        self.first_error.load(Ordering::Acquire)
    }

    pub(crate) fn record_error(&self, code: i32) {
        if code != exit_code::SUCCESS {
            let _ = self.first_error.compare_exchange(
                exit_code::SUCCESS,
                code,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Blocking receive of the next runtime-relevant message. Control
    /// bookkeeping (finish counting, defunct marking) happens here, before
    /// the message is surfaced.
    pub async fn recv_message(&self) -> Result<RtsMessage> {
        loop {
            let (tag, sender, payload) = {
                let mut buf = self.recv_buf.lock().await;
                let (len, tag, sender) = self.transport.recv(buf.as_mut_slice()).await?;
                (tag, sender, buf[..len].to_vec())
            };

            match tag {
                OpCode::Connect | OpCode::Head | OpCode::Data | OpCode::Constr => {
                    let buffer = match MsgBuffer::from_wire(&payload) {
                        Ok(buffer) => buffer,
                        Err(_) => {
                            self.fatal(exit_code::INTERNAL_ERROR, "garbled message header")
                                .await;
                            unreachable!()
                        }
                    };
                    return Ok(RtsMessage::Data { tag, buffer });
                }
                OpCode::RFork => {
                    let buffer = match MsgBuffer::from_wire(&payload) {
                        Ok(buffer) => buffer,
                        Err(_) => {
                            self.fatal(exit_code::INTERNAL_ERROR, "garbled rfork header")
                                .await;
                            unreachable!()
                        }
                    };
                    return Ok(RtsMessage::RFork { buffer });
                }
                OpCode::Finish => {
                    let code = parse_finish_payload(&payload);
                    self.finish_recvd.fetch_add(1, Ordering::AcqRel);
                    self.finished.lock().insert(sender);
                    self.record_error(code);
                    debug!(
                        target: "par_runtime::comm",
                        from = sender, code, "FINISH received"
                    );
                    return Ok(RtsMessage::Finish { code, from: sender });
                }
                OpCode::Fail => {
                    let pe = parse_fail_payload(&payload).unwrap_or(sender);
                    self.mark_defunct(pe);
                    error!("remote PE failure on node {}", pe);
                    return Ok(RtsMessage::Fail { pe });
                }
                OpCode::Ready | OpCode::NewPe | OpCode::PeTids => {
                    // Substrate-internal tags after startup; nothing to do.
                    warn!(
                        target: "par_runtime::comm",
                        tag = tag.name(),
                        from = sender,
                        "unexpected control message after startup, dropped"
                    );
                }
            }
        }
    }

    pub(crate) fn mark_defunct(&self, pe: PeId) {
        self.defunct.lock().insert(pe);
        self.failure.store(true, Ordering::Release);
        self.record_error(exit_code::INTERNAL_ERROR);
    }

    /// Best-effort send used by the shutdown paths: retries through
    /// back-pressure a bounded number of times, gives up on hard errors.
    async fn send_control(&self, dest: PeId, tag: OpCode, payload: &[u8]) -> bool {
        for _ in 0..200 {
            match self.transport.send(dest, tag, payload).await {
                Ok(true) => return true,
                Ok(false) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
                Err(e) => {
                    warn!("control send of {} to PE {} failed: {}", tag.name(), dest, e);
                    return false;
                }
            }
        }
        warn!(
            "control send of {} to PE {} kept hitting back-pressure",
            tag.name(),
            dest
        );
        false
    }

    /// Two-phase counted shutdown. Returns the exit code the process
    /// should report: the first fatal condition observed across the
    /// cohort, or `error_code` when this PE is itself failing.
    ///
    /// Calling it twice is harmless; the second call observes the zeroed
    /// PE count and returns immediately.
    pub async fn shutdown(&self, error_code: i32) -> Result<i32> {
        let n = self.npes.swap(0, Ordering::AcqRel);
        if n == 0 {
            return Ok(self.exit_status(error_code));
        }
        self.record_error(error_code);

        if error_code == exit_code::SUCCESS {
            debug!("==== entered shutdown ...");
        } else {
            debug!("==== entered shutdown (ERROR {}) ...", error_code);
        }

        if self.i_am_main {
            self.shutdown_main(n, error_code).await;
        } else {
            self.shutdown_child(error_code).await;
        }

        // Receive-and-discard whatever the substrate still holds, then
        // release it.
        self.drain_pending().await;
        if let Err(e) = self.transport.disconnect().await {
            warn!("transport disconnect reported: {}", e);
        }

        info!(
            target: "par_runtime::comm",
            pe = self.this_pe,
            "machine down"
        );
        Ok(self.exit_status(error_code))
    }

    /// Children still owing a `FINISH`: neither replied nor defunct.
    fn unaccounted_children(&self, n: PeId) -> Vec<PeId> {
        let finished = self.finished.lock();
        let defunct = self.defunct.lock();
        (2..=n)
            .filter(|pe| !finished.contains(pe) && !defunct.contains(pe))
            .collect()
    }

    async fn shutdown_main(&self, n: PeId, error_code: i32) {
        // PEs that already failed will never reply; skip them in the
        // broadcast.
        let defunct: HashSet<PeId> = self.defunct.lock().clone();

        let payload = finish_payload(error_code);
        for pe in 2..=n {
            if defunct.contains(&pe) {
                debug!("node {} failed previously, not notified", pe);
                continue;
            }
            self.send_control(pe, OpCode::Finish, &payload).await;
        }

        // Consume FINISH replies until every child is accounted for;
        // anything else arriving now is logged and dropped.
        while !self.unaccounted_children(n).is_empty() {
            let mut buf = self.recv_buf.lock().await;
            match self.transport.recv(buf.as_mut_slice()).await {
                Ok((len, OpCode::Finish, from)) => {
                    let code = parse_finish_payload(&buf[..len]);
                    self.record_error(code);
                    self.finish_recvd.fetch_add(1, Ordering::AcqRel);
                    self.finished.lock().insert(from);
                    debug!(from, code, "FINISH reply during shutdown");
                }
                Ok((len, OpCode::Fail, from)) => {
                    // A peer going away after its reply is the normal end
                    // of the cohort; one going away before it will never
                    // answer.
                    let pe = parse_fail_payload(&buf[..len]).unwrap_or(from);
                    if !self.finished.lock().contains(&pe) {
                        warn!("node {} vanished before its FINISH reply", pe);
                        self.defunct.lock().insert(pe);
                        self.failure.store(true, Ordering::Release);
                    }
                }
                Ok((_, tag, from)) => {
                    debug!(tag = tag.name(), from, "message ignored during shutdown");
                }
                Err(e) => {
                    warn!("receive failed during shutdown: {}", e);
                    break;
                }
            }
        }
        debug!(
            "main node received {} replies, releasing the substrate",
            self.finish_recvd.load(Ordering::Acquire)
        );
    }

    async fn shutdown_child(&self, error_code: i32) {
        let payload = finish_payload(error_code);
        self.send_control(1, OpCode::Finish, &payload).await;

        // On an error shutdown, wait for the main PE's FINISH so it has
        // seen our error code before we go; on a normal shutdown the
        // reply either arrived already (it is what triggered us) or is
        // not needed.
        if error_code != exit_code::SUCCESS && self.finish_recvd.load(Ordering::Acquire) == 0 {
            loop {
                let mut buf = self.recv_buf.lock().await;
                match self.transport.recv(buf.as_mut_slice()).await {
                    Ok((_, OpCode::Finish, _)) => break,
                    Ok((_, tag, from)) => {
                        debug!(tag = tag.name(), from, "message ignored awaiting FINISH reply");
                    }
                    Err(e) => {
                        warn!("receive failed awaiting FINISH reply: {}", e);
                        break;
                    }
                }
            }
        }
    }

    async fn drain_pending(&self) {
        let mut buf = self.recv_buf.lock().await;
        while self.transport.probe() {
            if self.transport.recv(buf.as_mut_slice()).await.is_err() {
                break;
            }
        }
    }

    fn exit_status(&self, error_code: i32) -> i32 {
        if error_code != exit_code::SUCCESS {
            error_code
        } else {
            self.first_error()
        }
    }

    /// Terminal error path: report, attempt a best-effort orderly quit so
    /// the main PE sees a `FINISH` rather than a silent death, and exit.
    /// Never returns.
    pub(crate) async fn fatal(&self, code: i32, what: &str) {
        error!("{}", what);
        let _ = self.shutdown(code).await;
        std::process::exit(code)
    }
}

/// `FINISH` payload: the opcode repeated as a word, then the error code.
pub(crate) fn finish_payload(code: i32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 * WORD_BYTES);
    payload.extend_from_slice(&(OpCode::Finish as u64).to_le_bytes());
    payload.extend_from_slice(&(code as i64).to_le_bytes());
    payload
}

pub(crate) fn parse_finish_payload(payload: &[u8]) -> i32 {
    if payload.len() < 2 * WORD_BYTES {
        return exit_code::SUCCESS;
    }
    i64::from_le_bytes(payload[WORD_BYTES..2 * WORD_BYTES].try_into().unwrap()) as i32
}

/// `FAIL` payload: one word naming the failed PE.
pub(crate) fn fail_payload(pe: PeId) -> Vec<u8> {
    (pe as u64).to_le_bytes().to_vec()
}

pub(crate) fn parse_fail_payload(payload: &[u8]) -> Option<PeId> {
    if payload.len() < WORD_BYTES {
        return None;
    }
    Some(u64::from_le_bytes(payload[..WORD_BYTES].try_into().unwrap()) as PeId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_payload_round_trips_codes() {
        for code in [0, 1, 251, 252, 254] {
            assert_eq!(parse_finish_payload(&finish_payload(code)), code);
        }
        // Short payloads parse as a normal exit.
        assert_eq!(parse_finish_payload(&[]), exit_code::SUCCESS);
    }

    #[test]
    fn fail_payload_names_the_pe() {
        assert_eq!(parse_fail_payload(&fail_payload(7)), Some(7));
        assert_eq!(parse_fail_payload(&[1, 2]), None);
    }

    #[test]
    fn max_msg_bytes_covers_header_and_headroom() {
        let config = RtsConfig {
            pack_buffer_size: 1024,
            ..RtsConfig::default()
        };
        assert_eq!(
            config.max_msg_bytes(),
            1024 + (WIRE_HEADER_WORDS + DEBUG_HEADROOM) * WORD_BYTES
        );
    }
}
