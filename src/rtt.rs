//! # Runtime Tables
//!
//! The naming layer of the parallel core: ports, processes, and inports.
//!
//! A [`Port`] is a `(machine, process, id)` triple used three ways: with
//! `id == 0` it names a process on a machine, as an *inport* it names the
//! receiving endpoint of a channel, and as an *outport* it names the thread
//! allowed to send on a channel. Processes and inports are exclusively
//! owned by their PE; no PE looks up another PE's tables.
//!
//! Every inport carries a placeholder closure — always a blackhole while
//! the inport exists — that consuming threads suspend on until data
//! arrives and replaces it.

use crate::heap::{self, ClosureRef, ThreadId};
use crate::mp::PeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace, warn};

/// A channel endpoint name: `(machine, process, id)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port {
    pub machine: PeId,
    pub process: u64,
    pub id: u64,
}

/// The distinguished "no port" value.
pub const NO_PORT: Port = Port {
    machine: 0,
    process: 0,
    id: 0,
};

impl Port {
    /// A process port: names a process on a machine (`id == 0`).
    pub fn process_port(machine: PeId, process: u64) -> Port {
        Port {
            machine,
            process,
            id: 0,
        }
    }

    /// The rendezvous port remote forks are addressed to.
    pub fn rts_port(machine: PeId) -> Port {
        Port {
            machine,
            process: 0,
            id: 0,
        }
    }

    pub fn is_no_port(&self) -> bool {
        *self == NO_PORT
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.machine, self.process, self.id)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Snapshot of an inport's current state, as returned by lookup.
#[derive(Clone)]
pub struct InportView {
    pub sender: Port,
    pub closure: ClosureRef,
}

struct Inport {
    /// Sending port, [`NO_PORT`] until a connect (or first message) arrives.
    sender: Port,
    /// Placeholder blackhole consumers suspend on.
    closure: ClosureRef,
}

struct Process {
    inports: HashMap<u64, Inport>,
    next_inport_id: u64,
    /// Threads currently attached; the process dies with its last thread.
    thread_count: u32,
}

struct Tables {
    processes: HashMap<u64, Process>,
    next_process_id: u64,
    next_thread_id: ThreadId,
}

/// Per-PE process and inport tables.
pub struct RtTables {
    this_pe: PeId,
    inner: Mutex<Tables>,
}

/// A runtime thread as seen by the send primitives: its identity, its
/// process, and the port it is currently registered to send to.
pub struct SendThread {
    id: ThreadId,
    process: u64,
    receiver: Mutex<Port>,
}

impl SendThread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn my_process(&self) -> u64 {
        self.process
    }

    /// The port this thread currently sends to.
    pub fn my_receiver(&self) -> Port {
        *self.receiver.lock()
    }

    /// Register the thread's outport; done by the connect step.
    pub fn set_receiver(&self, port: Port) {
        *self.receiver.lock() = port;
    }
}

impl RtTables {
    pub fn new(this_pe: PeId) -> Self {
        RtTables {
            this_pe,
            inner: Mutex::new(Tables {
                processes: HashMap::new(),
                // Process ids start at 1; 0 appears only in process ports
                // of the rendezvous kind.
                next_process_id: 1,
                // Thread id 0 is the system owner.
                next_thread_id: 1,
            }),
        }
    }

    pub fn this_pe(&self) -> PeId {
        self.this_pe
    }

    /// Allocate a fresh process with its first thread attached. Returns
    /// the process port and the thread handle.
    pub fn new_process(&self) -> (Port, SendThread) {
        let mut tables = self.inner.lock();
        let pid = tables.next_process_id;
        tables.next_process_id += 1;
        let tid = tables.next_thread_id;
        tables.next_thread_id += 1;
        tables.processes.insert(
            pid,
            Process {
                inports: HashMap::new(),
                next_inport_id: 1,
                thread_count: 1,
            },
        );
        debug!(process = pid, thread = tid, "new process");
        (
            Port::process_port(self.this_pe, pid),
            SendThread {
                id: tid,
                process: pid,
                receiver: Mutex::new(NO_PORT),
            },
        )
    }

    /// Attach one more thread to an existing process.
    pub fn new_thread(&self, process: u64) -> Option<SendThread> {
        let mut tables = self.inner.lock();
        let tid = tables.next_thread_id;
        tables.next_thread_id += 1;
        let proc = tables.processes.get_mut(&process)?;
        proc.thread_count += 1;
        Some(SendThread {
            id: tid,
            process,
            receiver: Mutex::new(NO_PORT),
        })
    }

    /// Detach a terminating thread; destroys the process when the last
    /// thread leaves. Returns `true` when the process was destroyed.
    pub fn release_thread(&self, thread: &SendThread) -> bool {
        let mut tables = self.inner.lock();
        let destroy = match tables.processes.get_mut(&thread.process) {
            Some(proc) => {
                proc.thread_count = proc.thread_count.saturating_sub(1);
                proc.thread_count == 0
            }
            None => false,
        };
        if destroy {
            tables.processes.remove(&thread.process);
            debug!(process = thread.process, "last thread left, process destroyed");
        }
        destroy
    }

    /// Allocate a fresh inport in `process` with a fresh placeholder
    /// blackhole. Returns the inport's port and the placeholder.
    pub fn new_inport(&self, process: u64) -> Option<(Port, ClosureRef)> {
        let mut tables = self.inner.lock();
        let proc = tables.processes.get_mut(&process)?;
        let id = proc.next_inport_id;
        proc.next_inport_id += 1;
        let placeholder = heap::create_bh();
        proc.inports.insert(
            id,
            Inport {
                sender: NO_PORT,
                closure: placeholder.clone(),
            },
        );
        trace!(process, id, "new inport");
        Some((
            Port {
                machine: self.this_pe,
                process,
                id,
            },
            placeholder,
        ))
    }

    /// O(1) lookup of an inport by its port. Absent when the inport was
    /// removed or never existed.
    pub fn find_inport(&self, port: Port) -> Option<InportView> {
        let tables = self.inner.lock();
        tables
            .processes
            .get(&port.process)
            .and_then(|proc| proc.inports.get(&port.id))
            .map(|inport| InportView {
                sender: inport.sender,
                closure: inport.closure.clone(),
            })
    }

    /// Idempotently record the sender of an inport: the first connect
    /// wins, an equal reconnect is a no-op, a disagreeing connect is
    /// logged and ignored.
    pub fn connect_inport(&self, port: Port, sender: Port) {
        let mut tables = self.inner.lock();
        let inport = match tables
            .processes
            .get_mut(&port.process)
            .and_then(|proc| proc.inports.get_mut(&port.id))
        {
            Some(inport) => inport,
            None => {
                debug!(target: "par_runtime::ports", %port, "connect to unknown inport ignored");
                return;
            }
        };
        if inport.sender.is_no_port() {
            trace!(target: "par_runtime::ports", %port, %sender, "inport connected");
            inport.sender = sender;
        } else if inport.sender != sender {
            warn!(
                target: "par_runtime::ports",
                %port, connected = %inport.sender, rejected = %sender,
                "inport already connected, disagreeing connect ignored"
            );
        }
    }

    /// Re-bind an open inport to a fresh placeholder (stream head
    /// arrived). Returns `false` when the inport is gone.
    pub fn rebind_inport(&self, port: Port, fresh: ClosureRef) -> bool {
        let mut tables = self.inner.lock();
        match tables
            .processes
            .get_mut(&port.process)
            .and_then(|proc| proc.inports.get_mut(&port.id))
        {
            Some(inport) => {
                inport.closure = fresh;
                true
            }
            None => false,
        }
    }

    /// Delete an inport after its final data arrived. Returns `false`
    /// when it was already gone.
    pub fn remove_inport(&self, port: Port) -> bool {
        let mut tables = self.inner.lock();
        let removed = tables
            .processes
            .get_mut(&port.process)
            .map(|proc| proc.inports.remove(&port.id).is_some())
            .unwrap_or(false);
        if removed {
            trace!(target: "par_runtime::ports", %port, "inport removed");
        }
        removed
    }

    /// Number of live processes; used by shutdown diagnostics and tests.
    pub fn process_count(&self) -> usize {
        self.inner.lock().processes.len()
    }
}
