//! # Pack Buffer and Graph Serialisation
//!
//! Graphs travel between PEs inside a single process-wide scratch buffer.
//! A wire message is a fixed nine-word header (sender port, receiver port,
//! two reserved words, and the payload length in words) followed by the
//! packed graph. All words are little-endian 64-bit; cohorts are required
//! to be homogeneous on the wire.
//!
//! Packing walks the graph depth-first and keeps an identity-keyed table
//! of already-visited nodes, so shared substructure and cycles are encoded
//! as back-references and reconstructed with the same identity on the
//! receiver. Packing fails with a closed set of codes; only
//! [`PackError::Blackhole`] is recoverable (the sending thread suspends on
//! the offending node and retries after it is updated).

use crate::heap::{dereference, ClosureRef, Closure, Node, ThreadId};
use crate::rtt::{Port, NO_PORT};
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// Bytes per wire word.
pub const WORD_BYTES: usize = 8;

/// Words in the fixed wire header.
pub const WIRE_HEADER_WORDS: usize = 9;

/// Additional scratch words kept free beyond the configured capacity.
pub const DEBUG_HEADROOM: usize = 2;

/// Node kind markers in the packed stream.
const TAG_INT: u64 = 1;
const TAG_CON: u64 = 2;
const TAG_CONS: u64 = 3;
const TAG_BACKREF: u64 = 4;

/// Why a pack or unpack operation failed.
#[derive(Debug, Error)]
pub enum PackError {
    /// The graph contains a node still under evaluation. Recoverable: the
    /// sender suspends on the carried closure and retries once it is
    /// updated.
    #[error("graph contains a blackhole under evaluation")]
    Blackhole(ClosureRef),

    /// The packed graph does not fit the pack buffer.
    #[error("pack buffer too small for graph")]
    NoBuffer,

    /// The graph contains a node kind that must not cross PE boundaries.
    #[error("closure kind cannot be packed")]
    CannotPack,

    /// The graph contains a node kind the codec does not handle.
    #[error("closure kind not supported by the packing codec")]
    Unsupported,

    /// Internal inconsistency while packing.
    #[error("impossible closure encountered while packing")]
    Impossible,

    /// The received buffer does not decode to a graph.
    #[error("garbled message buffer")]
    Garbled,
}

/// Largest constructor arity the codec can encode.
const MAX_CON_ARITY: usize = u32::MAX as usize;

/// A wire message: header fields plus the packed payload.
///
/// The `id` and `unpacked_size` words are reserved; they are written as
/// zero and accepted as anything on receipt.
pub struct MsgBuffer {
    pub sender: Port,
    pub receiver: Port,
    pub id: u64,
    pub unpacked_size: u64,
    pub payload: Vec<u64>,
}

impl MsgBuffer {
    pub fn new() -> Self {
        MsgBuffer {
            sender: NO_PORT,
            receiver: NO_PORT,
            id: 0,
            unpacked_size: 0,
            payload: Vec::new(),
        }
    }

    /// Payload length in words.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Serialise header and payload for the transport.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let words = [
            self.sender.machine as u64,
            self.sender.process,
            self.sender.id,
            self.receiver.machine as u64,
            self.receiver.process,
            self.receiver.id,
            self.id,
            self.payload.len() as u64,
            self.unpacked_size,
        ];
        let mut bytes = Vec::with_capacity((WIRE_HEADER_WORDS + self.payload.len()) * WORD_BYTES);
        for word in words.iter().chain(self.payload.iter()) {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Parse a received wire message. The `size` word must agree with the
    /// actual number of payload words.
    pub fn from_wire(bytes: &[u8]) -> Result<MsgBuffer, PackError> {
        if bytes.len() < WIRE_HEADER_WORDS * WORD_BYTES || bytes.len() % WORD_BYTES != 0 {
            return Err(PackError::Garbled);
        }
        let word = |i: usize| {
            let at = i * WORD_BYTES;
            u64::from_le_bytes(bytes[at..at + WORD_BYTES].try_into().unwrap())
        };
        let size = word(7) as usize;
        let have = bytes.len() / WORD_BYTES - WIRE_HEADER_WORDS;
        if size != have {
            return Err(PackError::Garbled);
        }
        let mut payload = Vec::with_capacity(size);
        for i in 0..size {
            payload.push(word(WIRE_HEADER_WORDS + i));
        }
        Ok(MsgBuffer {
            sender: Port {
                machine: word(0) as u32,
                process: word(1),
                id: word(2),
            },
            receiver: Port {
                machine: word(3) as u32,
                process: word(4),
                id: word(5),
            },
            id: word(6),
            unpacked_size: word(8),
            payload,
        })
    }
}

impl Default for MsgBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MsgBuffer {{ sender: {}, receiver: {}, size: {} }}",
            self.sender,
            self.receiver,
            self.size()
        )
    }
}

/// The process-wide pack buffer. Exactly one exists per PE, created at
/// sync time; a mutex around it (held across pack → send, and receive →
/// unpack → placeholder update) lives in the runtime.
pub struct PackBuffer {
    pub msg: MsgBuffer,
    capacity_words: usize,
}

impl PackBuffer {
    /// `payload_capacity` is the configured pack buffer size in bytes; it
    /// bounds the payload of a single message.
    pub fn new(payload_capacity: usize) -> Self {
        let capacity_words = payload_capacity / WORD_BYTES;
        PackBuffer {
            msg: MsgBuffer {
                payload: Vec::with_capacity(capacity_words + DEBUG_HEADROOM),
                ..MsgBuffer::new()
            },
            capacity_words,
        }
    }

    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }
}

fn emit(buf: &mut Vec<u64>, capacity: usize, words: &[u64]) -> Result<(), PackError> {
    if buf.len() + words.len() > capacity {
        return Err(PackError::NoBuffer);
    }
    buf.extend_from_slice(words);
    Ok(())
}

fn pack_closure(
    closure: &ClosureRef,
    buf: &mut Vec<u64>,
    capacity: usize,
    visited: &mut HashMap<*const Closure, u64>,
) -> Result<(), PackError> {
    let node = dereference(closure);
    let key = std::sync::Arc::as_ptr(&node);

    if let Some(&offset) = visited.get(&key) {
        return emit(buf, capacity, &[TAG_BACKREF, offset]);
    }

    // Decide the encoding under the node lock, but pack children after
    // releasing it; a child may alias an ancestor.
    enum Plan {
        Int(i64),
        Con { tag: u32, fields: Vec<ClosureRef> },
        Cons { head: ClosureRef, tail: ClosureRef },
        Blocked,
        CannotPack,
        // The node was updated to an indirection between dereference and
        // inspection; chase the new target.
        Follow(ClosureRef),
    }
    let plan = node.with_node(|n| match n {
        Node::Int(v) => Plan::Int(*v),
        Node::Con { tag, fields } => Plan::Con {
            tag: *tag,
            fields: fields.clone(),
        },
        Node::Cons { head, tail } => Plan::Cons {
            head: head.clone(),
            tail: tail.clone(),
        },
        Node::Blackhole => Plan::Blocked,
        Node::MutCell(_) => Plan::CannotPack,
        Node::Ind(target) => Plan::Follow(target.clone()),
    });

    let offset = buf.len() as u64;
    match plan {
        Plan::Int(v) => {
            visited.insert(key, offset);
            emit(buf, capacity, &[TAG_INT, v as u64])
        }
        Plan::Con { tag, fields } => {
            if fields.len() > MAX_CON_ARITY {
                return Err(PackError::Unsupported);
            }
            visited.insert(key, offset);
            emit(
                buf,
                capacity,
                &[TAG_CON, ((tag as u64) << 32) | fields.len() as u64],
            )?;
            for field in &fields {
                pack_closure(field, buf, capacity, visited)?;
            }
            Ok(())
        }
        Plan::Cons { head, tail } => {
            visited.insert(key, offset);
            emit(buf, capacity, &[TAG_CONS])?;
            pack_closure(&head, buf, capacity, visited)?;
            pack_closure(&tail, buf, capacity, visited)
        }
        Plan::Blocked => Err(PackError::Blackhole(node.clone())),
        Plan::CannotPack => Err(PackError::CannotPack),
        Plan::Follow(target) => pack_closure(&target, buf, capacity, visited),
    }
}

/// Serialise the heap subgraph rooted at `root` into `buf` (cleared
/// first). Returns the encoded size in words.
///
/// A [`PackError::Blackhole`] means the sending thread hit an unevaluated
/// node; the scheduler suspends it on the carried closure and retries
/// after the update.
pub fn pack_to_buffer(
    root: &ClosureRef,
    buf: &mut Vec<u64>,
    capacity_words: usize,
    sending_thread: ThreadId,
) -> Result<usize, PackError> {
    buf.clear();
    let mut visited = HashMap::new();
    pack_closure(root, buf, capacity_words, &mut visited)?;
    trace!(
        target: "par_runtime::pack",
        thread = sending_thread,
        words = buf.len(),
        "graph packed"
    );
    Ok(buf.len())
}

fn unpack_closure(
    payload: &[u64],
    cursor: &mut usize,
    known: &mut HashMap<u64, ClosureRef>,
) -> Result<ClosureRef, PackError> {
    let offset = *cursor as u64;
    let tag = *payload.get(*cursor).ok_or(PackError::Garbled)?;
    *cursor += 1;
    match tag {
        TAG_INT => {
            let value = *payload.get(*cursor).ok_or(PackError::Garbled)? as i64;
            *cursor += 1;
            let node = crate::heap::create_int(value);
            known.insert(offset, node.clone());
            Ok(node)
        }
        TAG_CON => {
            let word = *payload.get(*cursor).ok_or(PackError::Garbled)?;
            *cursor += 1;
            let con_tag = (word >> 32) as u32;
            let arity = (word & 0xffff_ffff) as usize;
            // Shell first so back-references into this node resolve.
            let shell = crate::heap::create_bh();
            known.insert(offset, shell.clone());
            let mut fields = Vec::with_capacity(arity.min(1024));
            for _ in 0..arity {
                fields.push(unpack_closure(payload, cursor, known)?);
            }
            shell.patch(Node::Con {
                tag: con_tag,
                fields,
            });
            Ok(shell)
        }
        TAG_CONS => {
            let shell = crate::heap::create_bh();
            known.insert(offset, shell.clone());
            let head = unpack_closure(payload, cursor, known)?;
            let tail = unpack_closure(payload, cursor, known)?;
            shell.patch(Node::Cons { head, tail });
            Ok(shell)
        }
        TAG_BACKREF => {
            let target = *payload.get(*cursor).ok_or(PackError::Garbled)?;
            *cursor += 1;
            known.get(&target).cloned().ok_or(PackError::Garbled)
        }
        _ => Err(PackError::Garbled),
    }
}

/// Reconstruct a graph from a packed payload, allocating fresh heap nodes.
/// Shared substructure and cycles come back with reconstructed identity.
/// Garbled input is fatal to the receiving PE.
pub fn unpack_graph(payload: &[u64]) -> Result<ClosureRef, PackError> {
    let mut cursor = 0usize;
    let mut known = HashMap::new();
    let root = unpack_closure(payload, &mut cursor, &mut known)?;
    if cursor != payload.len() {
        return Err(PackError::Garbled);
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{
        create_bh, create_con, create_int, create_list_node, create_mut_cell, demand_int,
        update_thunk, SYSTEM_OWNER,
    };
    use std::sync::Arc;

    fn pack(root: &ClosureRef, capacity: usize) -> Result<Vec<u64>, PackError> {
        let mut buf = Vec::new();
        pack_to_buffer(root, &mut buf, capacity, 1)?;
        Ok(buf)
    }

    #[test]
    fn integers_round_trip() {
        let buf = pack(&create_int(-42), 64).unwrap();
        let back = unpack_graph(&buf).unwrap();
        assert!(back.with_node(|n| matches!(n, Node::Int(-42))));
    }

    #[test]
    fn shared_substructure_keeps_identity() {
        let shared = create_int(7);
        let root = create_con(0, vec![shared.clone(), shared]);
        let buf = pack(&root, 64).unwrap();

        let back = unpack_graph(&buf).unwrap();
        back.with_node(|n| match n {
            Node::Con { fields, .. } => {
                assert_eq!(fields.len(), 2);
                assert!(Arc::ptr_eq(&fields[0], &fields[1]));
            }
            _ => panic!("expected constructor"),
        });
    }

    #[test]
    fn cycles_are_reconstructed() {
        // A one-node cycle: cons cell whose tail is the cell itself.
        let cell = create_bh();
        let head = create_int(1);
        cell.patch(Node::Cons {
            head,
            tail: cell.clone(),
        });

        let buf = pack(&cell, 64).unwrap();
        let back = unpack_graph(&buf).unwrap();
        back.with_node(|n| match n {
            Node::Cons { tail, .. } => assert!(Arc::ptr_eq(tail, &back)),
            _ => panic!("expected cons"),
        });
    }

    #[test]
    fn blackholes_block_the_packer() {
        let hole = create_bh();
        let root = create_list_node(create_int(1), hole.clone());
        match pack(&root, 64) {
            Err(PackError::Blackhole(blocked)) => assert!(Arc::ptr_eq(&blocked, &hole)),
            other => panic!("expected Blackhole, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn packing_succeeds_after_the_hole_is_filled() {
        let hole = create_bh();
        let root = create_list_node(create_int(1), hole.clone());
        assert!(matches!(pack(&root, 64), Err(PackError::Blackhole(_))));

        update_thunk(SYSTEM_OWNER, &hole, create_int(2));
        let buf = pack(&root, 64).unwrap();
        let back = unpack_graph(&buf).unwrap();
        let tail = back.with_node(|n| match n {
            Node::Cons { tail, .. } => tail.clone(),
            _ => panic!("expected cons"),
        });
        assert_eq!(demand_int(&tail).await, Some(2));
    }

    #[test]
    fn mutable_cells_cannot_cross() {
        let root = create_con(0, vec![create_mut_cell(create_int(1))]);
        assert!(matches!(pack(&root, 64), Err(PackError::CannotPack)));
    }

    #[test]
    fn capacity_is_a_hard_edge() {
        // An integer packs to exactly two words.
        assert!(pack(&create_int(5), 2).is_ok());
        assert!(matches!(pack(&create_int(5), 1), Err(PackError::NoBuffer)));
    }

    #[test]
    fn truncated_and_malformed_buffers_are_garbled() {
        let buf = pack(&create_con(1, vec![create_int(1), create_int(2)]), 64).unwrap();
        assert!(matches!(
            unpack_graph(&buf[..buf.len() - 1]),
            Err(PackError::Garbled)
        ));
        assert!(matches!(unpack_graph(&[99]), Err(PackError::Garbled)));
        // A dangling back-reference is garbled too.
        assert!(matches!(
            unpack_graph(&[TAG_BACKREF, 40]),
            Err(PackError::Garbled)
        ));
    }

    #[test]
    fn wire_header_round_trips_byte_identically() {
        let mut msg = MsgBuffer::new();
        msg.sender = Port { machine: 2, process: 4, id: 9 };
        msg.receiver = Port { machine: 1, process: 7, id: 3 };
        msg.payload = vec![TAG_INT, 42];

        let bytes = msg.wire_bytes();
        assert_eq!(bytes.len(), (WIRE_HEADER_WORDS + 2) * WORD_BYTES);

        let back = MsgBuffer::from_wire(&bytes).unwrap();
        assert_eq!(back.sender, msg.sender);
        assert_eq!(back.receiver, msg.receiver);
        assert_eq!(back.payload, msg.payload);
        assert_eq!(back.wire_bytes(), bytes);
    }

    #[test]
    fn zero_payload_messages_carry_only_ports() {
        let mut msg = MsgBuffer::new();
        msg.sender = Port { machine: 1, process: 1, id: 5 };
        msg.receiver = Port { machine: 2, process: 3, id: 1 };
        let bytes = msg.wire_bytes();
        assert_eq!(bytes.len(), WIRE_HEADER_WORDS * WORD_BYTES);
        let back = MsgBuffer::from_wire(&bytes).unwrap();
        assert_eq!(back.size(), 0);
    }

    #[test]
    fn size_word_must_match_the_payload() {
        let mut msg = MsgBuffer::new();
        msg.payload = vec![1, 2, 3];
        let mut bytes = msg.wire_bytes();
        // Corrupt the size word.
        bytes[7 * WORD_BYTES] = 9;
        assert!(matches!(MsgBuffer::from_wire(&bytes), Err(PackError::Garbled)));
    }
}
