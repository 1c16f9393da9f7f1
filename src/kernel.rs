//! Kernel Registry - opcode dispatch table and the reference kernel set.
//!
//! A kernel is an in-place transform over a node's `prop` buffer, viewed
//! as tightly-packed 32-bit little-endian lanes. The contract:
//!
//! - no allocation, no retained pointers, no hidden state
//! - tolerate any `len % 4 == 0` buffer; odd tail bytes are ignored
//! - malformed in-buffer headers (matmul, conv1d) decline silently,
//!   leaving the buffer untouched
//!
//! Unregistered opcodes are a no-op at dispatch, never an error.

use arrayvec::ArrayVec;

/// In-place transform over a node buffer.
pub type Kernel = fn(&mut [u8]);

/// Registry table width (the full 8-bit opcode space).
pub const OPCODE_SLOTS: usize = 256;

/// Fallback payload size in bytes for nodes whose offsets declare none.
/// Per-opcode overrides via [`KernelRegistry::set_default_size`].
pub const DEFAULT_PAYLOAD_SIZE: u32 = 256;

/// Longest conv1d tap window the in-place kernel supports.
pub const MAX_CONV_TAPS: usize = 8;

/// Reference opcode assignments.
pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const SQUARE_PLUS: u8 = 0x01;
    pub const MATMUL: u8 = 0x02;
    pub const RELU: u8 = 0x03;
    pub const SIGMOID: u8 = 0x04;
    pub const TANH: u8 = 0x05;
    pub const ADD: u8 = 0x06;
    pub const MUL: u8 = 0x07;
    pub const SUM_REDUCE: u8 = 0x08;
    pub const MAX_REDUCE: u8 = 0x09;
    pub const SOFTMAX: u8 = 0x0A;
    pub const CONV1D: u8 = 0x0B;
    pub const BATCH_NORM: u8 = 0x0C;
}

// ============================================================================
// Lane access (explicit little-endian, alignment-free)
// ============================================================================

/// Number of whole 32-bit lanes in the buffer.
#[inline]
pub fn lane_count(buf: &[u8]) -> usize {
    buf.len() / 4
}

#[inline]
fn load_f32(buf: &[u8], lane: usize) -> f32 {
    let i = lane * 4;
    f32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
}

#[inline]
fn store_f32(buf: &mut [u8], lane: usize, value: f32) {
    let i = lane * 4;
    buf[i..i + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn load_u32(buf: &[u8], lane: usize) -> u32 {
    let i = lane * 4;
    u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
}

/// Apply `f` to every whole f32 lane in place.
#[inline]
fn map_lanes(buf: &mut [u8], f: impl Fn(f32) -> f32) {
    for lane in 0..lane_count(buf) {
        let x = load_f32(buf, lane);
        store_f32(buf, lane, f(x));
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Fixed 256-slot opcode → kernel table with per-opcode default sizes.
pub struct KernelRegistry {
    slots: [Option<Kernel>; OPCODE_SLOTS],
    default_sizes: [u32; OPCODE_SLOTS],
}

impl KernelRegistry {
    /// A registry with no kernels; every opcode dispatches as a no-op.
    pub fn empty() -> Self {
        Self {
            slots: [None; OPCODE_SLOTS],
            default_sizes: [DEFAULT_PAYLOAD_SIZE; OPCODE_SLOTS],
        }
    }

    /// A registry pre-loaded with the reference set (0x00–0x0C).
    pub fn with_reference_kernels() -> Self {
        let mut registry = Self::empty();
        registry.register(opcode::NOP, k_nop);
        registry.register(opcode::SQUARE_PLUS, k_square_plus);
        registry.register(opcode::MATMUL, k_matmul);
        registry.register(opcode::RELU, k_relu);
        registry.register(opcode::SIGMOID, k_sigmoid);
        registry.register(opcode::TANH, k_tanh);
        registry.register(opcode::ADD, k_add);
        registry.register(opcode::MUL, k_mul);
        registry.register(opcode::SUM_REDUCE, k_sum_reduce);
        registry.register(opcode::MAX_REDUCE, k_max_reduce);
        registry.register(opcode::SOFTMAX, k_softmax);
        registry.register(opcode::CONV1D, k_conv1d);
        registry.register(opcode::BATCH_NORM, k_batch_norm);
        registry
    }

    /// Install a kernel for `opcode`, replacing any previous entry.
    #[inline]
    pub fn register(&mut self, op: u8, kernel: Kernel) {
        self.slots[op as usize] = Some(kernel);
    }

    /// The kernel for `opcode`, if one is registered.
    #[inline]
    pub fn lookup(&self, op: u8) -> Option<Kernel> {
        self.slots[op as usize]
    }

    /// Fallback payload size for nodes of this opcode.
    #[inline]
    pub fn default_size(&self, op: u8) -> u32 {
        self.default_sizes[op as usize]
    }

    /// Override the fallback payload size for one opcode.
    #[inline]
    pub fn set_default_size(&mut self, op: u8, size: u32) {
        self.default_sizes[op as usize] = size;
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::with_reference_kernels()
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self.slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("KernelRegistry")
            .field("registered", &registered)
            .finish()
    }
}

// ============================================================================
// Reference kernels
// ============================================================================

/// 0x00 - leaves the buffer untouched.
fn k_nop(_buf: &mut [u8]) {}

/// 0x01 - `x² + x` per lane.
fn k_square_plus(buf: &mut [u8]) {
    map_lanes(buf, |x| x * x + x);
}

/// 0x03 - rectified linear unit.
fn k_relu(buf: &mut [u8]) {
    map_lanes(buf, |x| x.max(0.0));
}

/// 0x04 - logistic sigmoid.
fn k_sigmoid(buf: &mut [u8]) {
    map_lanes(buf, |x| 1.0 / (1.0 + (-x).exp()));
}

/// 0x05 - hyperbolic tangent.
fn k_tanh(buf: &mut [u8]) {
    map_lanes(buf, f32::tanh);
}

/// 0x06 - folds the second half of the lanes into the first:
/// `a[i] += a[half + i]`. An odd middle lane is left untouched.
fn k_add(buf: &mut [u8]) {
    let half = lane_count(buf) / 2;
    for i in 0..half {
        let sum = load_f32(buf, i) + load_f32(buf, half + i);
        store_f32(buf, i, sum);
    }
}

/// 0x07 - second half multiplied into the first, see [`k_add`].
fn k_mul(buf: &mut [u8]) {
    let half = lane_count(buf) / 2;
    for i in 0..half {
        let product = load_f32(buf, i) * load_f32(buf, half + i);
        store_f32(buf, i, product);
    }
}

/// 0x08 - writes the sum of all lanes into lane 0.
fn k_sum_reduce(buf: &mut [u8]) {
    let n = lane_count(buf);
    if n == 0 {
        return;
    }
    let mut acc = 0.0f32;
    for lane in 0..n {
        acc += load_f32(buf, lane);
    }
    store_f32(buf, 0, acc);
}

/// 0x09 - writes the maximum lane into lane 0.
fn k_max_reduce(buf: &mut [u8]) {
    let n = lane_count(buf);
    if n == 0 {
        return;
    }
    let mut best = load_f32(buf, 0);
    for lane in 1..n {
        best = best.max(load_f32(buf, lane));
    }
    store_f32(buf, 0, best);
}

/// 0x0A - numerically-stable softmax over all lanes.
fn k_softmax(buf: &mut [u8]) {
    let n = lane_count(buf);
    if n == 0 {
        return;
    }
    let mut peak = load_f32(buf, 0);
    for lane in 1..n {
        peak = peak.max(load_f32(buf, lane));
    }
    let mut denom = 0.0f32;
    for lane in 0..n {
        denom += (load_f32(buf, lane) - peak).exp();
    }
    if denom <= 0.0 || !denom.is_finite() {
        return;
    }
    for lane in 0..n {
        let e = (load_f32(buf, lane) - peak).exp();
        store_f32(buf, lane, e / denom);
    }
}

/// 0x02 - in-buffer matrix multiply.
///
/// Layout (u32 header, then f32 data):
/// `[m, k, n, A(m×k row-major), B(k×n row-major), C(m×n row-major)]`.
/// Writes `C = A × B`. Declines if the declared sizes exceed the buffer.
fn k_matmul(buf: &mut [u8]) {
    let lanes = lane_count(buf);
    if lanes < 3 {
        return;
    }
    let m = load_u32(buf, 0) as usize;
    let k = load_u32(buf, 1) as usize;
    let n = load_u32(buf, 2) as usize;

    let sizes = m
        .checked_mul(k)
        .and_then(|ab| k.checked_mul(n).map(|bc| (ab, bc)))
        .and_then(|(ab, bc)| m.checked_mul(n).map(|ac| (ab, bc, ac)));
    let (a_len, b_len, c_len) = match sizes {
        Some(s) => s,
        None => return,
    };
    let needed = match 3usize
        .checked_add(a_len)
        .and_then(|t| t.checked_add(b_len))
        .and_then(|t| t.checked_add(c_len))
    {
        Some(t) => t,
        None => return,
    };
    if needed > lanes {
        return;
    }

    let a0 = 3;
    let b0 = a0 + a_len;
    let c0 = b0 + b_len;
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f32;
            for inner in 0..k {
                acc += load_f32(buf, a0 + row * k + inner) * load_f32(buf, b0 + inner * n + col);
            }
            store_f32(buf, c0 + row * n + col, acc);
        }
    }
}

/// 0x0B - causal 1-D convolution in place.
///
/// Layout: `[tap_count (u32), taps (f32 × tap_count), signal...]`.
/// `y[i] = Σ taps[j] · x[i−j]` with zero history before the signal start.
/// Declines if `tap_count` is 0, exceeds [`MAX_CONV_TAPS`], or the taps
/// do not fit the buffer.
fn k_conv1d(buf: &mut [u8]) {
    let lanes = lane_count(buf);
    if lanes < 1 {
        return;
    }
    let tap_count = load_u32(buf, 0) as usize;
    if tap_count == 0 || tap_count > MAX_CONV_TAPS || 1 + tap_count > lanes {
        return;
    }

    let mut taps: ArrayVec<f32, MAX_CONV_TAPS> = ArrayVec::new();
    for j in 0..tap_count {
        taps.push(load_f32(buf, 1 + j));
    }

    // Ring of the most recent original samples; newest at the back.
    let mut history: ArrayVec<f32, MAX_CONV_TAPS> = ArrayVec::new();
    for lane in 1 + tap_count..lanes {
        let x = load_f32(buf, lane);
        if history.is_full() {
            history.remove(0);
        }
        history.push(x);

        let mut acc = 0.0f32;
        for (j, &tap) in taps.iter().enumerate() {
            if j < history.len() {
                acc += tap * history[history.len() - 1 - j];
            }
        }
        store_f32(buf, lane, acc);
    }
}

/// 0x0C - normalizes all lanes to zero mean and unit variance (ε = 1e-5).
fn k_batch_norm(buf: &mut [u8]) {
    const EPS: f32 = 1e-5;
    let n = lane_count(buf);
    if n == 0 {
        return;
    }
    let mut mean = 0.0f32;
    for lane in 0..n {
        mean += load_f32(buf, lane);
    }
    mean /= n as f32;

    let mut var = 0.0f32;
    for lane in 0..n {
        let d = load_f32(buf, lane) - mean;
        var += d * d;
    }
    var /= n as f32;

    let scale = 1.0 / (var + EPS).sqrt();
    map_lanes(buf, |x| (x - mean) * scale);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lanes_to_bytes(lanes: &[f32]) -> Vec<u8> {
        lanes.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn bytes_to_lanes(buf: &[u8]) -> Vec<f32> {
        (0..lane_count(buf)).map(|i| load_f32(buf, i)).collect()
    }

    #[test]
    fn test_registry_lookup() {
        let registry = KernelRegistry::with_reference_kernels();
        assert!(registry.lookup(opcode::RELU).is_some());
        assert!(registry.lookup(0xF0).is_none());

        let empty = KernelRegistry::empty();
        assert!(empty.lookup(opcode::RELU).is_none());
    }

    #[test]
    fn test_registry_register_replaces() {
        let mut registry = KernelRegistry::empty();
        registry.register(0x40, k_relu);
        assert!(registry.lookup(0x40).is_some());
        registry.register(0x40, k_nop);
        let kernel = registry.lookup(0x40).unwrap();
        let mut buf = lanes_to_bytes(&[-1.0]);
        kernel(&mut buf);
        assert_eq!(bytes_to_lanes(&buf), vec![-1.0]); // nop, not relu
    }

    #[test]
    fn test_default_sizes() {
        let mut registry = KernelRegistry::empty();
        assert_eq!(registry.default_size(0x33), DEFAULT_PAYLOAD_SIZE);
        registry.set_default_size(0x33, 1024);
        assert_eq!(registry.default_size(0x33), 1024);
        assert_eq!(registry.default_size(0x34), DEFAULT_PAYLOAD_SIZE);
    }

    #[test]
    fn test_nop_leaves_bytes() {
        let mut buf = vec![1, 2, 3, 4, 5, 6, 7, 8];
        k_nop(&mut buf);
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_square_plus() {
        let mut buf = lanes_to_bytes(&[2.0, -1.0, 0.5]);
        k_square_plus(&mut buf);
        assert_eq!(bytes_to_lanes(&buf), vec![6.0, 0.0, 0.75]);
    }

    #[test]
    fn test_relu() {
        let mut buf = lanes_to_bytes(&[-2.0, 0.0, 3.5]);
        k_relu(&mut buf);
        assert_eq!(bytes_to_lanes(&buf), vec![0.0, 0.0, 3.5]);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        let mut buf = lanes_to_bytes(&[0.0]);
        k_sigmoid(&mut buf);
        assert!((bytes_to_lanes(&buf)[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_tanh() {
        let mut buf = lanes_to_bytes(&[0.0, 1.0]);
        k_tanh(&mut buf);
        let lanes = bytes_to_lanes(&buf);
        assert_eq!(lanes[0], 0.0);
        assert!((lanes[1] - 1.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_add_folds_halves() {
        let mut buf = lanes_to_bytes(&[1.0, 2.0, 10.0, 20.0]);
        k_add(&mut buf);
        assert_eq!(bytes_to_lanes(&buf), vec![11.0, 22.0, 10.0, 20.0]);
    }

    #[test]
    fn test_add_odd_middle_untouched() {
        let mut buf = lanes_to_bytes(&[1.0, 99.0, 10.0]);
        k_add(&mut buf);
        assert_eq!(bytes_to_lanes(&buf), vec![100.0, 99.0, 10.0]);
    }

    #[test]
    fn test_mul_folds_halves() {
        let mut buf = lanes_to_bytes(&[3.0, 4.0, 2.0, 0.5]);
        k_mul(&mut buf);
        assert_eq!(bytes_to_lanes(&buf), vec![6.0, 2.0, 2.0, 0.5]);
    }

    #[test]
    fn test_sum_reduce() {
        let mut buf = lanes_to_bytes(&[1.0, 2.0, 3.0, 4.0]);
        k_sum_reduce(&mut buf);
        assert_eq!(bytes_to_lanes(&buf)[0], 10.0);
        assert_eq!(bytes_to_lanes(&buf)[1..], [2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_max_reduce() {
        let mut buf = lanes_to_bytes(&[1.0, 7.0, -3.0]);
        k_max_reduce(&mut buf);
        assert_eq!(bytes_to_lanes(&buf)[0], 7.0);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut buf = lanes_to_bytes(&[1.0, 2.0, 3.0]);
        k_softmax(&mut buf);
        let lanes = bytes_to_lanes(&buf);
        let total: f32 = lanes.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(lanes[2] > lanes[1] && lanes[1] > lanes[0]);
    }

    #[test]
    fn test_matmul_2x2() {
        // [1 2; 3 4] × [5 6; 7 8] = [19 22; 43 50]
        let mut lanes = vec![0.0f32; 3 + 4 + 4 + 4];
        let mut buf = lanes_to_bytes(&lanes);
        buf[0..4].copy_from_slice(&2u32.to_le_bytes());
        buf[4..8].copy_from_slice(&2u32.to_le_bytes());
        buf[8..12].copy_from_slice(&2u32.to_le_bytes());
        for (i, v) in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0].iter().enumerate() {
            store_f32(&mut buf, 3 + i, *v);
        }
        k_matmul(&mut buf);
        lanes = bytes_to_lanes(&buf);
        assert_eq!(&lanes[11..15], &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_declines_oversized_header() {
        let mut buf = vec![0u8; 32];
        buf[0..4].copy_from_slice(&1000u32.to_le_bytes());
        buf[4..8].copy_from_slice(&1000u32.to_le_bytes());
        buf[8..12].copy_from_slice(&1000u32.to_le_bytes());
        let snapshot = buf.clone();
        k_matmul(&mut buf);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_conv1d_identity_tap() {
        // Single tap of 1.0 is the identity filter.
        let mut buf = lanes_to_bytes(&[0.0, 1.0, 5.0, -2.0, 3.0]);
        buf[0..4].copy_from_slice(&1u32.to_le_bytes());
        k_conv1d(&mut buf);
        assert_eq!(&bytes_to_lanes(&buf)[2..], &[5.0, -2.0, 3.0]);
    }

    #[test]
    fn test_conv1d_moving_sum() {
        // Taps [1, 1]: y[i] = x[i] + x[i-1].
        let mut buf = lanes_to_bytes(&[0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
        buf[0..4].copy_from_slice(&2u32.to_le_bytes());
        store_f32(&mut buf, 1, 1.0);
        store_f32(&mut buf, 2, 1.0);
        k_conv1d(&mut buf);
        assert_eq!(&bytes_to_lanes(&buf)[3..], &[1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_conv1d_declines_bad_tap_count() {
        let mut buf = lanes_to_bytes(&[0.0; 8]);
        buf[0..4].copy_from_slice(&64u32.to_le_bytes());
        let snapshot = buf.clone();
        k_conv1d(&mut buf);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_batch_norm_zero_mean() {
        let mut buf = lanes_to_bytes(&[1.0, 2.0, 3.0, 4.0]);
        k_batch_norm(&mut buf);
        let lanes = bytes_to_lanes(&buf);
        let mean: f32 = lanes.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(lanes[0] < lanes[1] && lanes[1] < lanes[2]);
    }

    #[test]
    fn test_kernels_ignore_odd_tail() {
        let mut buf = vec![0u8; 9];
        store_f32(&mut buf, 0, -5.0);
        store_f32(&mut buf, 1, 5.0);
        buf[8] = 0xEE;
        k_relu(&mut buf);
        assert_eq!(load_f32(&buf, 0), 0.0);
        assert_eq!(load_f32(&buf, 1), 5.0);
        assert_eq!(buf[8], 0xEE);
    }

    #[test]
    fn test_kernels_tolerate_empty_buffer() {
        let mut buf: Vec<u8> = Vec::new();
        let kernels: [Kernel; 13] = [
            k_nop,
            k_square_plus,
            k_matmul,
            k_relu,
            k_sigmoid,
            k_tanh,
            k_add,
            k_mul,
            k_sum_reduce,
            k_max_reduce,
            k_softmax,
            k_conv1d,
            k_batch_norm,
        ];
        for kernel in kernels {
            kernel(&mut buf);
            assert!(buf.is_empty());
        }
    }
}
