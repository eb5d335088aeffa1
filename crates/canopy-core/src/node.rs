//! Fixed-stride node slots.
//!
//! Every node, whether it holds an item vector, a split plane, or a list of
//! item ids, occupies one slot of the same size:
//!
//! ```text
//! Offset  Size          Field
//! ──────────────────────────────────────────────────────────────
//! 0x00    4             n_descendants (u32)
//! 0x04    8             children [u32; 2]   composite leaves: item ids from here
//! 0x0C    4             extra (f32)         split bias, or dot-product lift
//! 0x10    4·f | 8·⌈f/64⌉ vector             f32 components, or u64 bit words
//! ──────────────────────────────────────────────────────────────
//! ```
//!
//! A slot is interpreted by id and descendant count:
//! - `id < n_items`: an item (`n_descendants == 1`), or a hole (`0`)
//! - `n_descendants <= leaf_capacity`: a composite leaf listing item ids
//! - otherwise: a split node with two children
//!
//! Slots are always at least 4-byte aligned, and 8-byte aligned for hamming
//! layouts whose stride is a multiple of 8.

use bytemuck::{Pod, Zeroable};

use crate::metric::Metric;

/// Fixed slot header shared by all node kinds.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct NodeHeader {
    pub n_descendants: u32,
    pub children: [u32; 2],
    pub extra: f32,
}

pub const NODE_HEADER_SIZE: usize = std::mem::size_of::<NodeHeader>();

/// Composite leaves overwrite everything after `n_descendants`.
const LEAF_ITEMS_OFFSET: usize = 4;

const BITS_PER_WORD: usize = 64;

/// Slot geometry for one (metric, dimensions) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    metric: Metric,
    dimensions: usize,
    stride: usize,
}

impl NodeLayout {
    pub fn new(metric: Metric, dimensions: usize) -> Self {
        let vector_bytes = if metric == Metric::Hamming {
            dimensions.div_ceil(BITS_PER_WORD) * std::mem::size_of::<u64>()
        } else {
            dimensions * std::mem::size_of::<f32>()
        };
        Self {
            metric,
            dimensions,
            stride: NODE_HEADER_SIZE + vector_bytes,
        }
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    #[inline]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Bytes per slot.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Largest number of item ids a composite leaf can hold (K).
    #[inline]
    pub fn leaf_capacity(&self) -> usize {
        (self.stride - LEAF_ITEMS_OFFSET) / std::mem::size_of::<u32>()
    }

    /// View slot `id` of a node region.
    #[inline]
    pub fn node<'a>(&self, region: &'a [u8], id: u32) -> Node<'a> {
        let start = id as usize * self.stride;
        Node {
            bytes: &region[start..start + self.stride],
        }
    }

    /// Mutable view of slot `id` of a node region.
    #[inline]
    pub fn node_mut<'a>(&self, region: &'a mut [u8], id: u32) -> NodeMut<'a> {
        let start = id as usize * self.stride;
        NodeMut {
            bytes: &mut region[start..start + self.stride],
        }
    }

    /// Store `vector` as an item in `slot`.
    ///
    /// Hamming layouts pack components `> 0.5` as set bits: component `j`
    /// lands in bit `j % 64` of word `j / 64`.
    pub fn write_item(&self, slot: &mut NodeMut<'_>, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimensions);
        slot.clear();
        *slot.header_mut() = NodeHeader {
            n_descendants: 1,
            ..NodeHeader::default()
        };
        if self.metric == Metric::Hamming {
            let words = slot.words_mut();
            for (j, &x) in vector.iter().enumerate() {
                if x > 0.5 {
                    words[j / BITS_PER_WORD] |= 1u64 << (j % BITS_PER_WORD);
                }
            }
        } else {
            slot.vector_mut().copy_from_slice(vector);
        }
    }

    /// Reconstruct the caller-facing vector of an item slot.
    pub fn read_item(&self, node: Node<'_>) -> Vec<f32> {
        if self.metric == Metric::Hamming {
            let words = node.words();
            (0..self.dimensions)
                .map(|j| {
                    let bit = (words[j / BITS_PER_WORD] >> (j % BITS_PER_WORD)) & 1;
                    bit as f32
                })
                .collect()
        } else {
            node.vector().to_vec()
        }
    }

    /// A standalone single-slot buffer holding `vector` as an item.
    pub fn query_slot(&self, vector: &[f32]) -> SlotBuf {
        let mut buf = SlotBuf::new(self.stride);
        buf.resize(1);
        self.write_item(&mut self.node_mut(buf.as_bytes_mut(), 0), vector);
        buf
    }
}

/// Read-only view into one slot.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    bytes: &'a [u8],
}

impl<'a> Node<'a> {
    #[inline(always)]
    pub fn header(&self) -> &'a NodeHeader {
        bytemuck::from_bytes(&self.bytes[..NODE_HEADER_SIZE])
    }

    #[inline(always)]
    pub fn n_descendants(&self) -> u32 {
        self.header().n_descendants
    }

    #[inline(always)]
    pub fn children(&self) -> [u32; 2] {
        self.header().children
    }

    #[inline(always)]
    pub fn extra(&self) -> f32 {
        self.header().extra
    }

    /// f32 payload (non-hamming layouts).
    #[inline(always)]
    pub fn vector(&self) -> &'a [f32] {
        bytemuck::cast_slice(&self.bytes[NODE_HEADER_SIZE..])
    }

    /// u64 payload (hamming layouts).
    #[inline(always)]
    pub fn words(&self) -> &'a [u64] {
        bytemuck::cast_slice(&self.bytes[NODE_HEADER_SIZE..])
    }

    /// Item ids of a composite leaf.
    #[inline]
    pub fn leaf_items(&self) -> &'a [u32] {
        let n = self.n_descendants() as usize;
        bytemuck::cast_slice(&self.bytes[LEAF_ITEMS_OFFSET..LEAF_ITEMS_OFFSET + n * 4])
    }

    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Mutable view into one slot.
pub struct NodeMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> NodeMut<'a> {
    pub fn as_node(&self) -> Node<'_> {
        Node { bytes: self.bytes }
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn header_mut(&mut self) -> &mut NodeHeader {
        bytemuck::from_bytes_mut(&mut self.bytes[..NODE_HEADER_SIZE])
    }

    pub fn vector_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(&mut self.bytes[NODE_HEADER_SIZE..])
    }

    pub fn words_mut(&mut self) -> &mut [u64] {
        bytemuck::cast_slice_mut(&mut self.bytes[NODE_HEADER_SIZE..])
    }

    /// Turn the slot into a composite leaf over `items`.
    pub fn set_leaf_items(&mut self, items: &[u32]) {
        self.clear();
        self.header_mut().n_descendants = items.len() as u32;
        let dst: &mut [u32] = bytemuck::cast_slice_mut(
            &mut self.bytes[LEAF_ITEMS_OFFSET..LEAF_ITEMS_OFFSET + items.len() * 4],
        );
        dst.copy_from_slice(items);
    }

    pub fn copy_from(&mut self, other: Node<'_>) {
        self.bytes.copy_from_slice(other.bytes);
    }
}

/// Owned, 8-byte aligned run of slots.
///
/// Backs the heap node storage, per-tree build fragments, and query slots.
pub struct SlotBuf {
    words: Vec<u64>,
    stride: usize,
    len: usize,
}

impl SlotBuf {
    pub fn new(stride: usize) -> Self {
        Self {
            words: Vec::new(),
            stride,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow (zero-filled) or shrink to exactly `n_slots`.
    pub fn resize(&mut self, n_slots: usize) {
        let old_bytes = self.len * self.stride;
        let new_bytes = n_slots * self.stride;
        self.words.resize(new_bytes.div_ceil(8), 0);
        self.len = n_slots;
        if new_bytes > old_bytes {
            // A shrink may have left stale bytes in the last partial word
            self.as_bytes_mut()[old_bytes..].fill(0);
        }
    }

    /// Append one zeroed slot and return its index.
    pub fn push_zeroed(&mut self) -> usize {
        let index = self.len;
        self.resize(index + 1);
        index
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len * self.stride]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let end = self.len * self.stride;
        &mut bytemuck::cast_slice_mut(&mut self.words)[..end]
    }
}
