//! Model - the immutable graph and the binary model format.
//!
//! A model file carries a header, fixed-width node records, and an opaque
//! payload blob padded to a 32-byte boundary. Two wire variants exist:
//!
//! - **Simple**: 8-byte header + 16-byte records. Topology rides in two
//!   sentinel-padded u16 slots inside each record.
//! - **Optimized**: 16-byte versioned header + variable-width records with
//!   a count-prefixed topology list, each record padded to 8 bytes.
//!
//! All multibyte integers are little-endian. Topology entries are the
//! **incoming dependencies** of the holding node: `B ∈ A.topology` means
//! A runs after B.

use arrayvec::ArrayVec;
use rustc_hash::FxHashMap;

use crate::align::align_up_32;
use crate::error::{EngineError, Result};

/// Sentinel topology entry meaning "unused / padding", never a dependency.
pub const TOPO_SENTINEL: u16 = 0xFFFF;

/// Sentinel byte offset meaning "not set".
pub const OFFSET_UNSET: u16 = 0xFFFF;

/// Node flag bits (bit positions fixed by the wire format).
pub mod node_flags {
    /// Node participates in lineage tracking.
    pub const LINEAGE: u32 = 1 << 0;
    /// Node was produced by kernel fusion.
    pub const FUSED: u32 = 1 << 1;
    /// Node output is stale and must be recomputed.
    pub const DIRTY: u32 = 1 << 2;
    /// Node buffers must not be written by kernels.
    pub const READ_ONLY: u32 = 1 << 3;
}

// ============================================================================
// Wire layout constants
// ============================================================================

/// Simple variant: header is node_count + payload_len.
pub const SIMPLE_HEADER_LEN: usize = 8;

/// Simple variant: every node record is exactly this long.
pub const SIMPLE_RECORD_LEN: usize = 16;

/// Simple variant: topology slots carried inside each record.
pub const SIMPLE_TOPO_SLOTS: usize = 2;

/// Optimized variant: version, node_count, payload_len, model flags.
pub const OPTIMIZED_HEADER_LEN: usize = 16;

/// The only accepted optimized-variant version.
pub const OPTIMIZED_VERSION: u32 = 1;

/// Optimized variant: fixed prefix of a node record before the topology list.
const OPTIMIZED_RECORD_PREFIX: usize = 13;

/// Which wire variant a byte buffer is framed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelVariant {
    /// Fixed 16-byte records, topology limited to two slots.
    Simple,
    /// Versioned header, count-prefixed topology lists.
    Optimized,
}

// ============================================================================
// Node
// ============================================================================

/// Immutable graph-level description of one compute unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Unique identifier within the graph. `0xFFFF` is reserved (sentinel).
    pub id: u16,
    /// Kernel selector (index into the 256-slot registry).
    pub opcode: u8,
    /// Byte offset of this node's region in the payload blob.
    pub in_off: u16,
    /// Byte offset one past this node's region in the payload blob.
    pub out_off: u16,
    /// Flag bitfield, see [`node_flags`].
    pub flags: u32,
    /// Ids of the nodes this node depends on (sentinels already filtered).
    pub topology: Vec<u16>,
}

impl Node {
    /// Create a node with no dependencies.
    pub fn new(id: u16, opcode: u8, in_off: u16, out_off: u16, flags: u32) -> Self {
        Self {
            id,
            opcode,
            in_off,
            out_off,
            flags,
            topology: Vec::new(),
        }
    }

    /// Create a node with the given dependency list (sentinels filtered).
    pub fn with_deps(
        id: u16,
        opcode: u8,
        in_off: u16,
        out_off: u16,
        flags: u32,
        deps: &[u16],
    ) -> Self {
        Self {
            id,
            opcode,
            in_off,
            out_off,
            flags,
            topology: deps.iter().copied().filter(|&d| d != TOPO_SENTINEL).collect(),
        }
    }

    /// The node's byte span in the payload blob, if both offsets are set
    /// and the span is non-empty.
    #[inline]
    pub fn payload_span(&self) -> Option<(usize, usize)> {
        if self.in_off != OFFSET_UNSET && self.out_off != OFFSET_UNSET && self.out_off > self.in_off
        {
            Some((self.in_off as usize, self.out_off as usize))
        } else {
            None
        }
    }

    /// Declared payload size in bytes, if the offsets define one.
    #[inline]
    pub fn declared_size(&self) -> Option<usize> {
        self.payload_span().map(|(lo, hi)| hi - lo)
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Immutable, validated deserialization of a model: ordered nodes plus the
/// opaque payload blob they reference.
#[derive(Clone, Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    payload: Vec<u8>,
    /// Graph-level flag word from the optimized header (zero for simple).
    header_flags: u32,
    /// id -> position in `nodes`.
    id_index: FxHashMap<u16, usize>,
}

impl Graph {
    /// Build and validate a graph from parts.
    ///
    /// # Errors
    /// `GraphInconsistent` on duplicate ids, dangling topology references,
    /// or out-of-bounds offsets; `GraphCyclic` if the dependency edges
    /// contain a cycle.
    pub fn new(nodes: Vec<Node>, payload: Vec<u8>) -> Result<Self> {
        Self::with_header_flags(nodes, payload, 0)
    }

    /// [`Graph::new`] with an explicit header flag word.
    pub fn with_header_flags(nodes: Vec<Node>, payload: Vec<u8>, header_flags: u32) -> Result<Self> {
        let mut id_index = FxHashMap::default();
        for (i, node) in nodes.iter().enumerate() {
            if node.id == TOPO_SENTINEL {
                return Err(EngineError::GraphInconsistent(format!(
                    "node id {:#06x} collides with the topology sentinel",
                    node.id
                )));
            }
            if id_index.insert(node.id, i).is_some() {
                return Err(EngineError::GraphInconsistent(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }

        let graph = Self {
            nodes,
            payload,
            header_flags,
            id_index,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Read and parse a model file, auto-detecting the wire variant.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        log::debug!("read model file {} ({} bytes)", path.display(), bytes.len());
        Self::from_bytes(&bytes)
    }

    /// Parse a model from bytes, auto-detecting the wire variant.
    ///
    /// A leading little-endian u32 equal to [`OPTIMIZED_VERSION`] first
    /// attempts the optimized parse and falls back to simple on failure
    /// (a simple file with node_count == 1 starts with the same word).
    /// Any other leading word parses as simple.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() >= 4 && read_u32(bytes, 0)? == OPTIMIZED_VERSION {
            match Self::from_bytes_as(bytes, ModelVariant::Optimized) {
                Ok(graph) => return Ok(graph),
                Err(err) => {
                    log::debug!("optimized parse failed ({err}), retrying as simple");
                }
            }
        }
        Self::from_bytes_as(bytes, ModelVariant::Simple)
    }

    /// Parse a model from bytes as a caller-declared wire variant.
    pub fn from_bytes_as(bytes: &[u8], variant: ModelVariant) -> Result<Self> {
        match variant {
            ModelVariant::Simple => parse_simple(bytes),
            ModelVariant::Optimized => parse_optimized(bytes),
        }
    }

    /// Serialize in the requested wire variant.
    ///
    /// # Errors
    /// `GraphInconsistent` when a node carries more dependencies than the
    /// simple variant's two record slots can hold.
    pub fn to_bytes(&self, variant: ModelVariant) -> Result<Vec<u8>> {
        match variant {
            ModelVariant::Simple => serialize_simple(self),
            ModelVariant::Optimized => Ok(serialize_optimized(self)),
        }
    }

    /// All nodes, in file order.
    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The opaque payload blob.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Number of nodes.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Graph-level flag word from the optimized header.
    #[inline]
    pub fn header_flags(&self) -> u32 {
        self.header_flags
    }

    /// Position of `id` in file order, if present.
    #[inline]
    pub fn index_of(&self, id: u16) -> Option<usize> {
        self.id_index.get(&id).copied()
    }

    /// Node lookup by id.
    #[inline]
    pub fn node_by_id(&self, id: u16) -> Option<&Node> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    /// A dependency-respecting order over all node ids (Kahn's algorithm,
    /// file order as the tiebreak).
    ///
    /// # Errors
    /// `GraphCyclic` if the order cannot cover every node.
    pub fn topo_order(&self) -> Result<Vec<u16>> {
        let n = self.nodes.len();
        let mut indegree: FxHashMap<u16, usize> = FxHashMap::default();
        let mut succs: FxHashMap<u16, Vec<u16>> = FxHashMap::default();
        for node in &self.nodes {
            indegree.entry(node.id).or_insert(0);
            for &dep in &node.topology {
                *indegree.entry(node.id).or_insert(0) += 1;
                succs.entry(dep).or_default().push(node.id);
            }
        }

        // Processed ids stay in `order`; `head` walks it as the work queue.
        let mut order: Vec<u16> = self
            .nodes
            .iter()
            .filter(|node| indegree[&node.id] == 0)
            .map(|node| node.id)
            .collect();
        let mut head = 0;
        while head < order.len() {
            let id = order[head];
            head += 1;
            if let Some(next) = succs.get(&id) {
                for &succ in next {
                    let d = indegree.get_mut(&succ).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        order.push(succ);
                    }
                }
            }
        }

        if order.len() != n {
            let stuck = self
                .nodes
                .iter()
                .map(|node| node.id)
                .find(|id| !order.contains(id))
                .unwrap_or(0);
            return Err(EngineError::GraphCyclic(stuck));
        }
        Ok(order)
    }

    /// Structural validation: dangling topology references, offset bounds,
    /// acyclicity. Id uniqueness is enforced at construction.
    fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            for &dep in &node.topology {
                if !self.id_index.contains_key(&dep) {
                    return Err(EngineError::GraphInconsistent(format!(
                        "node {} references unknown dependency {}",
                        node.id, dep
                    )));
                }
            }
            if node.in_off != OFFSET_UNSET && node.out_off != OFFSET_UNSET {
                if node.in_off > node.out_off {
                    return Err(EngineError::GraphInconsistent(format!(
                        "node {} has in_off {} > out_off {}",
                        node.id, node.in_off, node.out_off
                    )));
                }
                if node.out_off as usize > self.payload.len() {
                    return Err(EngineError::GraphInconsistent(format!(
                        "node {} out_off {} exceeds payload length {}",
                        node.id,
                        node.out_off,
                        self.payload.len()
                    )));
                }
            }
        }
        self.topo_order().map(|_| ())
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

#[inline]
fn read_u16(bytes: &[u8], off: usize) -> Result<u16> {
    let end = off + 2;
    if end > bytes.len() {
        return Err(truncated(off));
    }
    Ok(u16::from_le_bytes([bytes[off], bytes[off + 1]]))
}

#[inline]
fn read_u32(bytes: &[u8], off: usize) -> Result<u32> {
    let end = off + 4;
    if end > bytes.len() {
        return Err(truncated(off));
    }
    Ok(u32::from_le_bytes([
        bytes[off],
        bytes[off + 1],
        bytes[off + 2],
        bytes[off + 3],
    ]))
}

#[inline]
fn read_u8(bytes: &[u8], off: usize) -> Result<u8> {
    bytes.get(off).copied().ok_or_else(|| truncated(off))
}

fn truncated(off: usize) -> EngineError {
    EngineError::InvalidFormat(format!("model truncated at byte {off}"))
}

fn check_trailing_zero_padding(bytes: &[u8], content_end: usize) -> Result<()> {
    let total = align_up_32(content_end);
    if bytes.len() != total {
        return Err(EngineError::InvalidFormat(format!(
            "file length {} does not match padded content length {}",
            bytes.len(),
            total
        )));
    }
    if bytes[content_end..].iter().any(|&b| b != 0) {
        return Err(EngineError::InvalidFormat(
            "non-zero bytes in alignment padding".into(),
        ));
    }
    Ok(())
}

// ============================================================================
// Simple variant
// ============================================================================

fn parse_simple(bytes: &[u8]) -> Result<Graph> {
    let node_count = read_u32(bytes, 0)? as usize;
    let payload_len = read_u32(bytes, 4)? as usize;

    if node_count > u16::MAX as usize {
        return Err(EngineError::InvalidFormat(format!(
            "node count {node_count} exceeds the 16-bit id space"
        )));
    }

    let nodes_end = SIMPLE_HEADER_LEN + node_count * SIMPLE_RECORD_LEN;
    let payload_end = nodes_end + payload_len;
    check_trailing_zero_padding(bytes, payload_end)?;

    let mut nodes = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let base = SIMPLE_HEADER_LEN + i * SIMPLE_RECORD_LEN;
        let id = read_u16(bytes, base)?;
        let opcode = read_u8(bytes, base + 2)?;
        let in_off = read_u16(bytes, base + 3)?;
        let out_off = read_u16(bytes, base + 5)?;
        let flags = read_u32(bytes, base + 7)?;

        let mut topo: ArrayVec<u16, SIMPLE_TOPO_SLOTS> = ArrayVec::new();
        for slot in 0..SIMPLE_TOPO_SLOTS {
            let entry = read_u16(bytes, base + 11 + slot * 2)?;
            if entry != TOPO_SENTINEL {
                topo.push(entry);
            }
        }
        if read_u8(bytes, base + 15)? != 0 {
            return Err(EngineError::InvalidFormat(format!(
                "non-zero record padding in node record {i}"
            )));
        }

        nodes.push(Node::with_deps(id, opcode, in_off, out_off, flags, &topo));
    }

    let payload = bytes[nodes_end..payload_end].to_vec();
    log::debug!(
        "parsed simple model: {node_count} nodes, {payload_len} payload bytes"
    );
    Graph::new(nodes, payload)
}

fn serialize_simple(graph: &Graph) -> Result<Vec<u8>> {
    for node in graph.nodes() {
        if node.topology.len() > SIMPLE_TOPO_SLOTS {
            return Err(EngineError::GraphInconsistent(format!(
                "node {} has {} dependencies; the simple variant holds at most {}",
                node.id,
                node.topology.len(),
                SIMPLE_TOPO_SLOTS
            )));
        }
    }

    let nodes_end = SIMPLE_HEADER_LEN + graph.node_count() * SIMPLE_RECORD_LEN;
    let payload_end = nodes_end + graph.payload().len();
    let total = align_up_32(payload_end);
    let mut out = vec![0u8; total];

    out[0..4].copy_from_slice(&(graph.node_count() as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(graph.payload().len() as u32).to_le_bytes());

    for (i, node) in graph.nodes().iter().enumerate() {
        let base = SIMPLE_HEADER_LEN + i * SIMPLE_RECORD_LEN;
        out[base..base + 2].copy_from_slice(&node.id.to_le_bytes());
        out[base + 2] = node.opcode;
        out[base + 3..base + 5].copy_from_slice(&node.in_off.to_le_bytes());
        out[base + 5..base + 7].copy_from_slice(&node.out_off.to_le_bytes());
        out[base + 7..base + 11].copy_from_slice(&node.flags.to_le_bytes());
        for slot in 0..SIMPLE_TOPO_SLOTS {
            let entry = node.topology.get(slot).copied().unwrap_or(TOPO_SENTINEL);
            out[base + 11 + slot * 2..base + 13 + slot * 2]
                .copy_from_slice(&entry.to_le_bytes());
        }
        // byte base+15 stays zero (record padding)
    }

    out[nodes_end..payload_end].copy_from_slice(graph.payload());
    Ok(out)
}

// ============================================================================
// Optimized variant
// ============================================================================

fn parse_optimized(bytes: &[u8]) -> Result<Graph> {
    let version = read_u32(bytes, 0)?;
    if version != OPTIMIZED_VERSION {
        return Err(EngineError::UnsupportedVersion(version));
    }
    let node_count = read_u32(bytes, 4)? as usize;
    let payload_len = read_u32(bytes, 8)? as usize;
    let header_flags = read_u32(bytes, 12)?;

    if node_count > u16::MAX as usize {
        return Err(EngineError::InvalidFormat(format!(
            "node count {node_count} exceeds the 16-bit id space"
        )));
    }

    let mut cursor = OPTIMIZED_HEADER_LEN;
    let mut nodes = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        let id = read_u16(bytes, cursor)?;
        let opcode = read_u8(bytes, cursor + 2)?;
        let in_off = read_u16(bytes, cursor + 3)?;
        let out_off = read_u16(bytes, cursor + 5)?;
        let flags = read_u32(bytes, cursor + 7)?;
        let topo_len = read_u16(bytes, cursor + 11)? as usize;

        let mut topo = Vec::with_capacity(topo_len);
        for t in 0..topo_len {
            let entry = read_u16(bytes, cursor + OPTIMIZED_RECORD_PREFIX + t * 2)?;
            if entry != TOPO_SENTINEL {
                topo.push(entry);
            }
        }

        let record_len = crate::align::align_up(OPTIMIZED_RECORD_PREFIX + topo_len * 2, 8);
        if cursor + record_len > bytes.len() {
            return Err(truncated(cursor + record_len));
        }
        cursor += record_len;

        nodes.push(Node::with_deps(id, opcode, in_off, out_off, flags, &topo));
    }

    let payload_end = cursor + payload_len;
    check_trailing_zero_padding(bytes, payload_end)?;
    let payload = bytes[cursor..payload_end].to_vec();
    log::debug!(
        "parsed optimized model v{version}: {node_count} nodes, {payload_len} payload bytes"
    );
    Graph::with_header_flags(nodes, payload, header_flags)
}

fn serialize_optimized(graph: &Graph) -> Vec<u8> {
    let mut records = Vec::new();
    for node in graph.nodes() {
        let mut record = Vec::with_capacity(OPTIMIZED_RECORD_PREFIX + node.topology.len() * 2);
        record.extend_from_slice(&node.id.to_le_bytes());
        record.push(node.opcode);
        record.extend_from_slice(&node.in_off.to_le_bytes());
        record.extend_from_slice(&node.out_off.to_le_bytes());
        record.extend_from_slice(&node.flags.to_le_bytes());
        record.extend_from_slice(&(node.topology.len() as u16).to_le_bytes());
        for &dep in &node.topology {
            record.extend_from_slice(&dep.to_le_bytes());
        }
        record.resize(crate::align::align_up(record.len(), 8), 0);
        records.extend_from_slice(&record);
    }

    let payload_end = OPTIMIZED_HEADER_LEN + records.len() + graph.payload().len();
    let total = align_up_32(payload_end);
    let mut out = vec![0u8; total];
    out[0..4].copy_from_slice(&OPTIMIZED_VERSION.to_le_bytes());
    out[4..8].copy_from_slice(&(graph.node_count() as u32).to_le_bytes());
    out[8..12].copy_from_slice(&(graph.payload().len() as u32).to_le_bytes());
    out[12..16].copy_from_slice(&graph.header_flags().to_le_bytes());
    out[OPTIMIZED_HEADER_LEN..OPTIMIZED_HEADER_LEN + records.len()].copy_from_slice(&records);
    out[payload_end - graph.payload().len()..payload_end].copy_from_slice(graph.payload());
    out
}
