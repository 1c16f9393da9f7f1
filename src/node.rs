//! NodeRuntime - the live per-node compute record, exactly 64 bytes.
//!
//! One slot per graph node lives inside the arena's NodeMetadata region.
//! Buffers are referenced by arena-relative u32 offsets instead of
//! pointers, so a slot is plain old data and the whole region can be
//! viewed as `&mut [NodeRuntime]`.

use bytemuck::{Pod, Zeroable};

use crate::model::{node_flags, Node};

/// How many dependency ids the fixed slot can carry. The full topology
/// lives on the immutable [`Graph`](crate::model::Graph); this excerpt
/// exists for kernel/debug inspection.
pub const MAX_SLOT_DEPS: usize = 8;

/// Sentinel buffer offset meaning "not yet bound".
pub const OFFSET_UNBOUND: u32 = u32::MAX;

/// Live per-node state - exactly 64 bytes (one cache line).
///
/// # Memory Layout
///
/// | Field        | Type     | Offset | Size |
/// |--------------|----------|--------|------|
/// | prev_off     | u32      | 0      | 4    |
/// | prop_off     | u32      | 4      | 4    |
/// | payload_len  | u32      | 8      | 4    |
/// | flags        | u32      | 12     | 4    |
/// | topo         | [u16; 8] | 16     | 16   |
/// | topo_len     | u16      | 32     | 2    |
/// | id           | u16      | 34     | 2    |
/// | opcode       | u8       | 36     | 1    |
/// | _pad         | [u8; 3]  | 37     | 3    |
/// | _reserved    | [u8; 24] | 40     | 24   |
/// | **Total**    |          |        | 64   |
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct NodeRuntime {
    /// Arena-relative offset of the `prev` buffer (last completed output).
    pub prev_off: u32,

    /// Arena-relative offset of the `prop` buffer (next-step scratch).
    pub prop_off: u32,

    /// Length of each buffer in bytes. Multiple of 4, cache-line rounded.
    pub payload_len: u32,

    /// Flag bitfield, copied from the graph node.
    pub flags: u32,

    /// Dependency-id excerpt (first `topo_len` entries are valid).
    pub topo: [u16; MAX_SLOT_DEPS],

    /// Number of valid entries in `topo`.
    pub topo_len: u16,

    /// Graph node id.
    pub id: u16,

    /// Kernel selector.
    pub opcode: u8,

    pub _pad: [u8; 3],

    // === Reserved Space (24 bytes) ===
    // Future use: epoch counter, per-node stats, lineage cursor.
    pub _reserved: [u8; 24],
}

// Compile-time assertion: NodeRuntime must be exactly 64 bytes
const _: () = assert!(
    std::mem::size_of::<NodeRuntime>() == 64,
    "NodeRuntime must be exactly 64 bytes (one cache line)"
);

// Compile-time assertion: slot alignment must not exceed the 32-byte
// region alignment the arena guarantees
const _: () = assert!(
    std::mem::align_of::<NodeRuntime>() <= 32,
    "NodeRuntime alignment must fit the NodeMetadata region alignment"
);

impl NodeRuntime {
    /// Populate a slot from its graph node and bound buffer offsets.
    ///
    /// Topology entries beyond [`MAX_SLOT_DEPS`] are truncated in the
    /// excerpt (the scheduler reads the graph, not the slot).
    pub fn bind(&mut self, node: &Node, prev_off: u32, prop_off: u32, payload_len: u32) {
        self.prev_off = prev_off;
        self.prop_off = prop_off;
        self.payload_len = payload_len;
        self.flags = node.flags;
        self.id = node.id;
        self.opcode = node.opcode;

        let keep = node.topology.len().min(MAX_SLOT_DEPS);
        self.topo = [crate::model::TOPO_SENTINEL; MAX_SLOT_DEPS];
        self.topo[..keep].copy_from_slice(&node.topology[..keep]);
        self.topo_len = keep as u16;
    }

    /// The valid portion of the dependency excerpt.
    #[inline]
    pub fn topology(&self) -> &[u16] {
        &self.topo[..self.topo_len as usize]
    }

    /// Swap the two buffers: freshly written data becomes `prev`, the old
    /// `prev` image becomes next-step scratch.
    #[inline]
    pub fn swap_buffers(&mut self) {
        std::mem::swap(&mut self.prev_off, &mut self.prop_off);
    }

    /// Arena span of the `prev` buffer.
    #[inline]
    pub fn prev_span(&self) -> (usize, usize) {
        (self.prev_off as usize, self.payload_len as usize)
    }

    /// Arena span of the `prop` buffer.
    #[inline]
    pub fn prop_span(&self) -> (usize, usize) {
        (self.prop_off as usize, self.payload_len as usize)
    }

    /// Kernels must not write this node's buffers.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.flags & node_flags::READ_ONLY != 0
    }

    /// Node participates in lineage tracking.
    #[inline]
    pub fn is_lineage_tracked(&self) -> bool {
        self.flags & node_flags::LINEAGE != 0
    }

    /// Node output is stale.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags & node_flags::DIRTY != 0
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("id", &self.id)
            .field("opcode", &self.opcode)
            .field("flags", &self.flags)
            .field("prev_off", &self.prev_off)
            .field("prop_off", &self.prop_off)
            .field("payload_len", &self.payload_len)
            .field("topology", &self.topology())
            .finish()
    }
}
