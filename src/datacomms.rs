//! # Data-Communication Dispatcher
//!
//! The bridge between send primitives, the wire, and the runtime tables.
//! Outbound, [`ParRuntime::send_wrapper`] serialises a heap subgraph into
//! the process-wide pack buffer and hands it to the transport under one of
//! four kinds: `CONNECT` (attach an outport, no payload), `HEAD` (one
//! stream element), `DATA` (final channel element), `RFORK` (create a
//! remote thread). Inbound, [`ParRuntime::process_data_msg`] resolves the
//! receiving inport, reconstructs the graph, and atomically replaces the
//! inport's placeholder, waking every consumer suspended on it.
//!
//! When sender and receiver live on the same PE, `HEAD`/`DATA`/`CONNECT`
//! bypass pack, transport, and unpack entirely and mutate the tables and
//! the heap directly. `RFORK` always takes the message path.

use crate::heap::{self, ClosureRef, SYSTEM_OWNER};
use crate::mp::{OpCode, PeId};
use crate::pack::{pack_to_buffer, unpack_graph, MsgBuffer, PackError};
use crate::rtt::{Port, SendThread};
use crate::runtime::{exit_code, ParRuntime};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, error, trace, warn};

/// Outcome of a send primitive.
#[derive(Debug)]
pub enum SendStatus {
    /// Message is out (or applied locally).
    Ok,
    /// Packing hit the carried unevaluated node; suspend the sending
    /// thread on it and retry after it is updated.
    Blocked(ClosureRef),
    /// The transport refused the message (back-pressure); retry later.
    Failed,
}

/// The kind of an outbound send, with the optional payload the packed
/// integer form carries in its upper bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Make the receiver know its sender.
    Connect,
    /// One element of a stream; the receiving inport stays open.
    Head,
    /// Final element; the receiving inport is closed.
    Data,
    /// Create a thread on `target`, or let the placement policy choose
    /// when `target` is `None`.
    RFork { target: Option<PeId> },
}

impl SendMode {
    /// Split the packed integer form: three kind bits, payload above.
    /// Kinds 0 and 5–7 are reserved.
    pub fn decode(raw: u64) -> Option<SendMode> {
        let payload = raw >> 3;
        match raw & 0o7 {
            1 => Some(SendMode::Connect),
            2 => Some(SendMode::Head),
            3 => Some(SendMode::Data),
            4 => Some(SendMode::RFork {
                target: if payload == 0 {
                    None
                } else {
                    Some(payload as PeId)
                },
            }),
            _ => None,
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            SendMode::Connect => 1,
            SendMode::Head => 2,
            SendMode::Data => 3,
            SendMode::RFork { target } => 4 | (target.unwrap_or(0) as u64) << 3,
        }
    }

    fn tag(self) -> OpCode {
        match self {
            SendMode::Connect => OpCode::Connect,
            SendMode::Head => OpCode::Head,
            SendMode::Data => OpCode::Data,
            SendMode::RFork { .. } => OpCode::RFork,
        }
    }
}

/// Round-robin cursor and RNG of the remote-fork placement policy.
pub(crate) struct PlacementState {
    /// Next round-robin target; 0 until the first selection initialises
    /// the cursor.
    target_pe: PeId,
    rng: StdRng,
}

impl PlacementState {
    pub(crate) fn new() -> Self {
        PlacementState {
            target_pe: 0,
            rng: StdRng::seed_from_u64(std::process::id() as u64),
        }
    }
}

impl ParRuntime {
    /// Select a PE for a policy-placed remote fork: round-robin starting
    /// at `thisPE + 1`, or uniformly random when the random placement bit
    /// is set. Under no-local placement a local selection is skipped, and
    /// the round-robin cursor advances past it.
    pub(crate) fn choose_pe(&self) -> PeId {
        let npes = self.cohort;
        let this_pe = self.this_pe;
        let mut state = self.placement_state.lock();

        if state.target_pe == 0 {
            state.target_pe = if npes == this_pe { 1 } else { this_pe + 1 };
        }

        let mut chosen = if self.config.placement.random {
            1 + state.rng.gen_range(0..npes)
        } else {
            let t = state.target_pe;
            state.target_pe = if t >= npes { 1 } else { t + 1 };
            t
        };

        if self.config.placement.no_local && chosen == this_pe {
            chosen = if chosen == npes { 1 } else { chosen + 1 };
            if !self.config.placement.random {
                state.target_pe = if chosen >= npes { 1 } else { chosen + 1 };
            }
        }

        debug!(
            target: "par_runtime::procs",
            chosen,
            next = state.target_pe,
            "placement selected"
        );
        chosen
    }

    /// Roll the round-robin cursor back one step after a send that must
    /// be retried, so the retry targets the same PE.
    pub(crate) fn unchoose_pe(&self) {
        if self.config.placement.random {
            return;
        }
        let mut state = self.placement_state.lock();
        if state.target_pe != 0 {
            state.target_pe = if state.target_pe == 1 {
                self.cohort
            } else {
                state.target_pe - 1
            };
            trace!(
                target: "par_runtime::procs",
                next = state.target_pe,
                "placement cursor rolled back"
            );
        }
    }

    /// Ship a filled message buffer. The buffer's receiver names the
    /// destination PE.
    pub(crate) async fn send_msg(&self, tag: OpCode, msg: &MsgBuffer) -> bool {
        debug_assert!(!msg.sender.is_no_port());
        debug_assert!(!msg.receiver.is_no_port() || tag == OpCode::RFork);
        debug_assert_eq!(msg.sender.machine, self.this_pe);

        let destination = msg.receiver.machine;
        debug_assert!(destination != 0);

        trace!(
            target: "par_runtime::packet",
            tag = tag.name(),
            sender = %msg.sender,
            receiver = %msg.receiver,
            words = msg.size(),
            "sending message"
        );

        match self.transport.send(destination, tag, &msg.wire_bytes()).await {
            Ok(sent) => sent,
            Err(e) => {
                error!("send of {} to PE {} failed: {}", tag.name(), destination, e);
                false
            }
        }
    }

    /// Dispatcher for the outbound send primitives.
    ///
    /// Returns [`SendStatus::Blocked`] when the graph contains an
    /// unevaluated node (the scheduler suspends the sending thread on it),
    /// [`SendStatus::Failed`] on transport back-pressure. Unpackable
    /// graphs are runtime bugs and fatal.
    pub async fn send_wrapper(
        &self,
        thread: &SendThread,
        mode: SendMode,
        data: Option<&ClosureRef>,
    ) -> SendStatus {
        let mut sender = Port {
            machine: self.this_pe,
            process: thread.my_process(),
            id: 0,
        };

        let receiver;
        let policy_placed;
        match mode {
            SendMode::Connect => {
                let target = thread.my_receiver();
                debug_assert!(!target.is_no_port());
                sender.id = thread.id();

                // Same machine, same runtime tables: connect directly.
                if sender.machine == target.machine {
                    self.rtt.connect_inport(target, sender);
                    return SendStatus::Ok;
                }

                let mut pack = self.pack_buffer.lock().await;
                pack.msg.payload.clear();
                pack.msg.sender = sender;
                pack.msg.receiver = target;
                pack.msg.id = 0;
                pack.msg.unpacked_size = 0;
                return if self.send_msg(OpCode::Connect, &pack.msg).await {
                    SendStatus::Ok
                } else {
                    SendStatus::Failed
                };
            }
            SendMode::Head | SendMode::Data => {
                receiver = thread.my_receiver();
                debug_assert!(!receiver.is_no_port());
                sender.id = thread.id();
                policy_placed = false;
            }
            SendMode::RFork { target } => {
                // The sending thread's registered port is not touched; an
                // rFork goes out on the process port to the target's
                // rendezvous port.
                let chosen = match target {
                    Some(t) => {
                        // Explicit targets are folded into 1..=nPEs.
                        let d = t % self.cohort;
                        if d == 0 {
                            self.cohort
                        } else {
                            d
                        }
                    }
                    None => self.choose_pe(),
                };
                receiver = Port::rts_port(chosen);
                policy_placed = target.is_none();
            }
        }

        let graph = match data {
            Some(graph) => graph,
            None => {
                error!("send_wrapper: mode {:?} requires a data graph", mode);
                return SendStatus::Failed;
            }
        };
        let tag = mode.tag();

        // Shortcut when sender and receiver share a heap; only for HEAD
        // and DATA. An rFork to the own PE still takes the message path.
        if matches!(mode, SendMode::Head | SendMode::Data)
            && sender.machine == receiver.machine
        {
            // The bypass performs its placeholder update under the pack
            // buffer lock, like the receive path does.
            let _pack = self.pack_buffer.lock().await;
            return self.fake_data_msg(graph, sender, receiver, tag);
        }

        let status;
        {
            let mut pack = self.pack_buffer.lock().await;
            let capacity = pack.capacity_words();
            match pack_to_buffer(graph, &mut pack.msg.payload, capacity, thread.id()) {
                Ok(_size) => {
                    pack.msg.sender = sender;
                    pack.msg.receiver = receiver;
                    pack.msg.id = 0;
                    pack.msg.unpacked_size = 0;
                    status = if self.send_msg(tag, &pack.msg).await {
                        SendStatus::Ok
                    } else {
                        SendStatus::Failed
                    };
                }
                Err(PackError::Blackhole(hole)) => {
                    status = SendStatus::Blocked(hole);
                }
                Err(e) => {
                    self.fatal(
                        exit_code::INTERNAL_ERROR,
                        &format!("packing for {} failed: {}", tag.name(), e),
                    )
                    .await;
                    unreachable!()
                }
            }
        }

        if matches!(status, SendStatus::Blocked(_) | SendStatus::Failed) && policy_placed {
            // Round-robin placement must re-offer the same target on the
            // caller's retry.
            self.unchoose_pe();
        }

        trace!(
            target: "par_runtime::comm",
            thread = thread.id(),
            ?status,
            "send_wrapper finished"
        );
        status
    }

    /// Inbound handler for port-addressed messages (`CONNECT`, `HEAD`,
    /// `DATA`; `CONSTR` is reserved and fatal).
    pub async fn process_data_msg(&self, tag: OpCode, msg: MsgBuffer) {
        trace!(
            target: "par_runtime::packet",
            tag = tag.name(),
            sender = %msg.sender,
            receiver = %msg.receiver,
            "processing data message"
        );

        let inport = match self.rtt.find_inport(msg.receiver) {
            Some(inport) => inport,
            None => {
                // Legitimate under shutdown races; drop the message.
                debug!(
                    target: "par_runtime::ports",
                    "unknown inport: Port {}", msg.receiver
                );
                return;
            }
        };

        if tag == OpCode::Connect {
            // No payload, no unpack: just record the sender.
            self.rtt.connect_inport(msg.receiver, msg.sender);
            return;
        }

        // DATA may arrive from a sender that never connected (a
        // short-circuited single-message channel); anything else connects
        // the inport first.
        if inport.sender != msg.sender && tag != OpCode::Data {
            debug!(
                target: "par_runtime::ports",
                "sender {} not connected yet", msg.sender
            );
            self.rtt.connect_inport(msg.receiver, msg.sender);
        }

        let placeholder = inport.closure;
        debug_assert!(heap::is_blackhole(&placeholder));

        // Unpack and update under the pack buffer lock, mirroring the
        // sender side.
        let _pack = self.pack_buffer.lock().await;
        let graph = match unpack_graph(&msg.payload) {
            Ok(graph) => graph,
            Err(_) => {
                self.fatal(exit_code::INTERNAL_ERROR, "garbled graph in data message")
                    .await;
                unreachable!()
            }
        };

        let value = match tag {
            OpCode::Constr => {
                self.fatal(exit_code::INTERNAL_ERROR, "CONSTR message received")
                    .await;
                unreachable!()
            }
            OpCode::Head => {
                // Fresh placeholder for the next element; the received
                // graph becomes the head of a new list cell.
                let next = heap::create_bh();
                self.rtt.rebind_inport(msg.receiver, next.clone());
                heap::create_list_node(graph, next)
            }
            OpCode::Data => {
                debug!(
                    target: "par_runtime::ports",
                    "DATA message, removing inport {}", msg.receiver.id
                );
                self.rtt.remove_inport(msg.receiver);
                graph
            }
            other => {
                self.fatal(
                    exit_code::INTERNAL_ERROR,
                    &format!("process_data_msg: unexpected tag {}", other.name()),
                )
                .await;
                unreachable!()
            }
        };

        heap::update_thunk(SYSTEM_OWNER, &placeholder, value);
    }

    /// The local bypass: apply a HEAD or DATA directly to the receiving
    /// inport, skipping pack, transport, and unpack. Caller holds the
    /// pack buffer lock.
    fn fake_data_msg(
        &self,
        graph: &ClosureRef,
        sender: Port,
        receiver: Port,
        tag: OpCode,
    ) -> SendStatus {
        debug_assert_eq!(sender.machine, receiver.machine);

        let inport = match self.rtt.find_inport(receiver) {
            Some(inport) => inport,
            None => {
                // Should not happen; returning Failed would make the
                // caller retry forever, so accept and drop.
                warn!(
                    target: "par_runtime::ports",
                    "local data message for unknown inport: Port {}", receiver
                );
                return SendStatus::Ok;
            }
        };

        if inport.sender != sender && tag != OpCode::Data {
            self.rtt.connect_inport(receiver, sender);
        }

        let placeholder = inport.closure;
        debug_assert!(heap::is_blackhole(&placeholder));

        let value = match tag {
            OpCode::Head => {
                let next = heap::create_bh();
                self.rtt.rebind_inport(receiver, next.clone());
                heap::create_list_node(graph.clone(), next)
            }
            OpCode::Data => {
                self.rtt.remove_inport(receiver);
                graph.clone()
            }
            other => {
                error!("local bypass: unexpected tag {}", other.name());
                return SendStatus::Failed;
            }
        };

        trace!(
            target: "par_runtime::packet",
            tag = tag.name(),
            sender = %sender,
            receiver = %receiver,
            "local message applied"
        );

        heap::update_thunk(SYSTEM_OWNER, &placeholder, value);
        SendStatus::Ok
    }

    /// Accept a received remote fork: reconstruct the carried graph and
    /// create the process (with its first thread) that will evaluate it.
    /// The scheduler runs the returned thread.
    pub async fn process_rfork(&self, msg: MsgBuffer) -> (Port, SendThread, ClosureRef) {
        let graph = {
            let _pack = self.pack_buffer.lock().await;
            match unpack_graph(&msg.payload) {
                Ok(graph) => graph,
                Err(_) => {
                    self.fatal(exit_code::INTERNAL_ERROR, "garbled graph in rfork message")
                        .await;
                    unreachable!()
                }
            }
        };
        let (process_port, thread) = self.rtt.new_process();
        debug!(
            target: "par_runtime::procs",
            process = process_port.process,
            origin = %msg.sender,
            "remote fork accepted"
        );
        (process_port, thread, graph)
    }
}
