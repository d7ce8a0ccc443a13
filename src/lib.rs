//! # par-runtime
//!
//! A distributed-memory parallel runtime core: a fixed cohort of PEs
//! (processing elements) cooperating on one computation by serialising
//! heap subgraphs, carrying them over a pluggable message-passing
//! substrate, and reconstituting them on the receiver where they replace
//! placeholder nodes that blocked consumer threads.

pub mod cli;
pub mod datacomms;
pub mod heap;
pub mod logging;
pub mod mp;
pub mod pack;
pub mod rtt;
pub mod runtime;

pub use datacomms::{SendMode, SendStatus};
pub use heap::{ClosureRef, Node};
pub use mp::{MpBackend, MpTransport, OpCode, PeId, TransportConfig, MAX_PES};
pub use pack::{MsgBuffer, PackError};
pub use rtt::{Port, RtTables, SendThread, NO_PORT};
pub use runtime::{ParRuntime, Placement, RtsConfig, RtsMessage};

/// The current version of the runtime core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default pack buffer size in bytes (upper bound on one message
    /// payload).
    pub const PACK_BUFFER_SIZE: usize = 10 * 1024 * 1024;

    /// Default transport outbox depth.
    pub const SEND_BUFFER_SIZE: usize = 20;

    /// Default base port of the tcp mesh; PE i listens on base + i.
    pub const BASE_PORT: u16 = 47000;
}
