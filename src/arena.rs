//! Arena - one contiguous byte region partitioned into six fixed sub-regions.
//!
//! The arena is allocated once per engine, cache-line aligned, and is the
//! sole source of buffers for the runtime. Layout order is fixed:
//!
//! ```text
//! | ModelPayload | NodeMetadata | NodePayloads | Scratch | StreamingInput | FreeTail |
//! ```
//!
//! Every region starts on a 32-byte boundary and regions never overlap.
//! NodePayloads and Scratch each carry an independent bump allocator;
//! Scratch may be reset to its region start, NodePayloads is monotonic
//! for the arena's lifetime.

use crate::align::{align_up, align_up_32, AlignedBuf, CACHE_LINE};
use crate::error::{EngineError, Result};
use crate::node::NodeRuntime;

/// Number of fixed regions.
pub const REGION_COUNT: usize = 6;

/// Bytes reserved per node in the NodeMetadata region. `NodeRuntime` is
/// one cache line, already a multiple of the 32-byte region alignment.
pub const NODE_SLOT_SIZE: usize = std::mem::size_of::<NodeRuntime>();

const _: () = assert!(NODE_SLOT_SIZE % 32 == 0, "node slots must pack on 32-byte boundaries");

/// The six arena regions, in layout order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    /// Copy of the model's payload blob.
    ModelPayload = 0,
    /// One `NodeRuntime` slot per graph node.
    NodeMetadata = 1,
    /// Bump-allocated dual buffers for every node.
    NodePayloads = 2,
    /// Bump-allocated transient space, resettable between passes.
    Scratch = 3,
    /// Fixed window streaming inputs are stamped into.
    StreamingInput = 4,
    /// Reserved headroom at the end of the arena.
    FreeTail = 5,
}

impl Region {
    /// All regions in layout order.
    pub const ALL: [Region; REGION_COUNT] = [
        Region::ModelPayload,
        Region::NodeMetadata,
        Region::NodePayloads,
        Region::Scratch,
        Region::StreamingInput,
        Region::FreeTail,
    ];
}

/// Placement of one region inside the arena buffer.
#[derive(Clone, Copy, Debug, Default)]
struct Span {
    offset: usize,
    size: usize,
}

impl Span {
    #[inline]
    fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Caller-requested region sizes. `total == 0` means "use the minimum".
#[derive(Clone, Copy, Debug, Default)]
pub struct ArenaSizes {
    /// Total arena size; 0 selects the computed minimum.
    pub total: usize,
    /// NodePayloads region size.
    pub node_payloads: usize,
    /// Scratch region size.
    pub scratch: usize,
    /// StreamingInput window size.
    pub streaming_input: usize,
}

/// The partitioned contiguous arena.
pub struct Arena {
    buf: AlignedBuf,
    spans: [Span; REGION_COUNT],
    node_count: usize,
    /// Absolute offset of the next NodePayloads allocation.
    payload_cursor: usize,
    /// Absolute offset of the next Scratch allocation.
    scratch_cursor: usize,
}

impl Arena {
    /// Lay out and allocate an arena for a model payload and `node_count`
    /// metadata slots.
    ///
    /// # Errors
    /// `ArenaTooSmall` when `sizes.total` is non-zero and below the sum of
    /// the 32-byte-aligned non-empty regions.
    pub fn new(model_payload: &[u8], node_count: usize, sizes: &ArenaSizes) -> Result<Self> {
        let metadata_size = node_count * NODE_SLOT_SIZE;
        let fixed = [
            model_payload.len(),
            metadata_size,
            sizes.node_payloads,
            sizes.scratch,
            sizes.streaming_input,
        ];

        let minimum: usize = fixed
            .iter()
            .filter(|&&s| s > 0)
            .map(|&s| align_up_32(s))
            .sum();
        // A degenerate model (no payload, no nodes, no regions) still gets
        // one aligned line so the buffer exists.
        let minimum = minimum.max(32);

        let total = if sizes.total == 0 {
            minimum
        } else {
            let requested = align_up_32(sizes.total);
            if requested < minimum {
                return Err(EngineError::ArenaTooSmall {
                    requested: sizes.total,
                    needed: minimum,
                });
            }
            requested
        };

        let mut buf = AlignedBuf::zeroed(total, CACHE_LINE);

        let mut spans = [Span::default(); REGION_COUNT];
        let mut offset = 0usize;
        for (i, &size) in fixed.iter().enumerate() {
            offset = align_up_32(offset);
            spans[i] = Span { offset, size };
            offset += size;
        }
        offset = align_up_32(offset);
        spans[Region::FreeTail as usize] = Span {
            offset,
            size: total - offset,
        };

        let payload_span = spans[Region::ModelPayload as usize];
        buf[payload_span.offset..payload_span.offset + model_payload.len()]
            .copy_from_slice(model_payload);

        log::debug!(
            "arena laid out: total={total} payload={} metadata={} node_payloads={} scratch={} streaming={} tail={}",
            fixed[0],
            fixed[1],
            fixed[2],
            fixed[3],
            fixed[4],
            spans[Region::FreeTail as usize].size
        );

        let payload_cursor = spans[Region::NodePayloads as usize].offset;
        let scratch_cursor = spans[Region::Scratch as usize].offset;
        Ok(Self {
            buf,
            spans,
            node_count,
            payload_cursor,
            scratch_cursor,
        })
    }

    /// Total arena size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Never true; the arena always holds at least one aligned line.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of NodeMetadata slots.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Offset of a region's first byte.
    #[inline]
    pub fn region_offset(&self, region: Region) -> usize {
        self.spans[region as usize].offset
    }

    /// Size of a region in bytes.
    #[inline]
    pub fn region_size(&self, region: Region) -> usize {
        self.spans[region as usize].size
    }

    /// Read-only view of a region.
    pub fn view(&self, region: Region) -> &[u8] {
        let span = self.spans[region as usize];
        &self.buf[span.offset..span.end()]
    }

    /// Mutable view of a region.
    pub fn view_mut(&mut self, region: Region) -> &mut [u8] {
        let span = self.spans[region as usize];
        &mut self.buf[span.offset..span.end()]
    }

    /// Bounds-checked read of an arbitrary arena span.
    ///
    /// # Panics
    /// Panics if the span exceeds the arena (programmer error).
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[offset..offset + len]
    }

    /// Bounds-checked mutable access to an arbitrary arena span.
    #[inline]
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.buf[offset..offset + len]
    }

    // ========================================================================
    // Bump allocators
    // ========================================================================

    /// Reserve `size` bytes from NodePayloads at the requested alignment.
    ///
    /// # Returns
    /// The arena-relative offset of the reservation. The buffer start is
    /// cache-line aligned, so an aligned offset is an aligned address.
    ///
    /// # Errors
    /// `NodePayloadsExhausted` if the region cannot hold the request; the
    /// cursor is left untouched on failure.
    pub fn allocate_node_payload(&mut self, size: usize, alignment: usize) -> Result<usize> {
        let span = self.spans[Region::NodePayloads as usize];
        let aligned = align_up(self.payload_cursor, alignment);
        let end = aligned + size;
        if end > span.end() {
            return Err(EngineError::NodePayloadsExhausted {
                requested: size,
                remaining: span.end().saturating_sub(aligned),
            });
        }
        self.payload_cursor = end;
        Ok(aligned)
    }

    /// Reserve `size` bytes from Scratch at the requested alignment.
    ///
    /// # Errors
    /// `ScratchExhausted` on overrun; the cursor is left untouched.
    pub fn allocate_scratch(&mut self, size: usize, alignment: usize) -> Result<usize> {
        let span = self.spans[Region::Scratch as usize];
        let aligned = align_up(self.scratch_cursor, alignment);
        let end = aligned + size;
        if end > span.end() {
            return Err(EngineError::ScratchExhausted {
                requested: size,
                remaining: span.end().saturating_sub(aligned),
            });
        }
        self.scratch_cursor = end;
        Ok(aligned)
    }

    /// Rewind the Scratch allocator to its region start.
    #[inline]
    pub fn reset_scratch(&mut self) {
        self.scratch_cursor = self.spans[Region::Scratch as usize].offset;
    }

    /// Bytes still available in NodePayloads (ignoring alignment slack).
    #[inline]
    pub fn node_payloads_remaining(&self) -> usize {
        self.spans[Region::NodePayloads as usize]
            .end()
            .saturating_sub(self.payload_cursor)
    }

    // ========================================================================
    // Streaming window
    // ========================================================================

    /// Capacity of the StreamingInput window.
    #[inline]
    pub fn streaming_capacity(&self) -> usize {
        self.spans[Region::StreamingInput as usize].size
    }

    /// Stamp `bytes` into the head of the StreamingInput window.
    ///
    /// # Errors
    /// `StreamingOverflow` if the input exceeds the window; the window is
    /// untouched on failure.
    pub fn write_streaming_input(&mut self, bytes: &[u8]) -> Result<()> {
        let span = self.spans[Region::StreamingInput as usize];
        if bytes.len() > span.size {
            return Err(EngineError::StreamingOverflow {
                len: bytes.len(),
                window: span.size,
            });
        }
        self.buf[span.offset..span.offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    // ========================================================================
    // Node slots
    // ========================================================================

    /// Typed reference to the `index`-th NodeRuntime slot.
    ///
    /// # Panics
    /// Panics if `index >= node_count` (programmer error).
    #[inline]
    pub fn node_slot(&self, index: usize) -> &NodeRuntime {
        assert!(index < self.node_count, "node slot {index} out of bounds");
        let off = self.spans[Region::NodeMetadata as usize].offset + index * NODE_SLOT_SIZE;
        bytemuck::from_bytes(&self.buf[off..off + NODE_SLOT_SIZE])
    }

    /// Typed mutable reference to the `index`-th NodeRuntime slot.
    ///
    /// # Panics
    /// Panics if `index >= node_count` (programmer error).
    #[inline]
    pub fn node_slot_mut(&mut self, index: usize) -> &mut NodeRuntime {
        assert!(index < self.node_count, "node slot {index} out of bounds");
        let off = self.spans[Region::NodeMetadata as usize].offset + index * NODE_SLOT_SIZE;
        bytemuck::from_bytes_mut(&mut self.buf[off..off + NODE_SLOT_SIZE])
    }

    // ========================================================================
    // Utilization and shared access
    // ========================================================================

    /// Fraction of the arena in live use: fixed regions plus the consumed
    /// portion of both bump allocators, over the total size.
    pub fn utilization(&self) -> f64 {
        let fixed = self.spans[Region::ModelPayload as usize].size
            + self.spans[Region::NodeMetadata as usize].size
            + self.spans[Region::StreamingInput as usize].size;
        let bumped = (self.payload_cursor - self.spans[Region::NodePayloads as usize].offset)
            + (self.scratch_cursor - self.spans[Region::Scratch as usize].offset);
        (fixed + bumped) as f64 / self.buf.len() as f64
    }

    /// Pre-fault all arena pages (warm-up routine).
    ///
    /// Touches one byte per page so the OS maps physical frames before the
    /// first pass.
    pub fn warm_up(&mut self) {
        let len = self.buf.len();
        let ptr = self.buf.as_mut_ptr();
        let mut off = 0;
        while off < len {
            // SAFETY: off < len; volatile write defeats dead-store elision.
            unsafe { std::ptr::write_volatile(ptr.add(off), 0) };
            off += 4096;
        }
    }

    /// Handle for shared access during a parallel pass.
    pub fn shared(&mut self) -> ArenaShared {
        ArenaShared {
            base: self.buf.as_mut_ptr(),
            len: self.buf.len(),
            metadata_offset: self.spans[Region::NodeMetadata as usize].offset,
            node_count: self.node_count,
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.buf.len())
            .field("node_count", &self.node_count)
            .field("payload_cursor", &self.payload_cursor)
            .field("scratch_cursor", &self.scratch_cursor)
            .finish()
    }
}

/// Raw-pointer view of the arena used by scheduler workers.
///
/// During a pass the buffer is shared read/write across workers.
/// Exclusivity is not tracked here: the dependency ordering enforced by
/// the scheduler is the synchronization mechanism. Each node's slot and
/// buffers are touched only by the one subtask running that node, and a
/// successor observes a dependency's bytes only after its completion has
/// been posted.
#[derive(Clone, Copy)]
pub struct ArenaShared {
    base: *mut u8,
    len: usize,
    metadata_offset: usize,
    node_count: usize,
}

// SAFETY: ArenaShared is a capability to derive disjoint &mut slices; the
// scheduler guarantees no two live derivations overlap (see type docs).
unsafe impl Send for ArenaShared {}
unsafe impl Sync for ArenaShared {}

impl ArenaShared {
    /// Mutable slice over an arbitrary arena span.
    ///
    /// # Safety
    /// The span must lie inside the arena and must not overlap any other
    /// span alive in another thread. Callers uphold this through the
    /// scheduler's dependency ordering.
    #[inline]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len, "arena span out of bounds");
        std::slice::from_raw_parts_mut(self.base.add(offset), len)
    }

    /// Mutable reference to the `index`-th NodeRuntime slot.
    ///
    /// # Safety
    /// Same disjointness contract as [`ArenaShared::slice_mut`]: at most
    /// one thread may hold a given node's slot at a time.
    ///
    /// # Panics
    /// Panics if `index >= node_count` (programmer error).
    #[inline]
    pub unsafe fn slot_mut(&self, index: usize) -> &mut NodeRuntime {
        assert!(index < self.node_count, "node slot {index} out of bounds");
        let off = self.metadata_offset + index * NODE_SLOT_SIZE;
        &mut *(self.base.add(off) as *mut NodeRuntime)
    }
}
