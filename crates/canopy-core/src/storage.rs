//! Node storage backings
//!
//! Slots live in one of three places, all with the same byte layout:
//!
//! - [`HeapNodes`]: an owned, growable buffer
//! - [`DiskNodes`]: a read/write file mapping grown with `set_len` + remap,
//!   used by on-disk builds
//! - [`MappedNodes`]: a read-only mapping of a saved index
//!
//! Read access goes through [`NodeRead`]; only [`NodeGrow`] backings can
//! allocate. A mapped index therefore cannot grow at all.
//!
//! # Safety
//!
//! Mappings assume the file is not truncated by another process while
//! mapped; doing so may raise SIGBUS on access. Saving replaces files by
//! rename, so this crate never truncates a file that another index maps.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::format::{FormatError, IndexHeader, HEADER_SIZE};
use crate::node::{Node, NodeLayout, NodeMut, SlotBuf};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backing file would exceed addressable size: {bytes} bytes")]
    TooLarge { bytes: u64 },
}

/// Read access to a node region starting at slot 0.
pub trait NodeRead: Send + Sync {
    fn region(&self) -> &[u8];
}

/// A backing that can hold more slots over time.
pub trait NodeGrow: NodeRead {
    fn region_mut(&mut self) -> &mut [u8];

    /// Slots currently backed.
    fn capacity(&self) -> usize;

    /// Back at least `slots` slots. Existing slots keep their contents.
    fn grow(&mut self, slots: usize) -> std::result::Result<(), StorageError>;

    /// Persist the header and root table alongside the nodes, for backings
    /// that are themselves index files.
    fn seal(
        &mut self,
        _header: &IndexHeader,
        _roots: &[u32],
    ) -> std::result::Result<(), StorageError> {
        Ok(())
    }

    /// The file behind this backing, if any.
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Heap-owned slots.
pub struct HeapNodes {
    slots: SlotBuf,
}

impl HeapNodes {
    pub fn new(layout: &NodeLayout) -> Self {
        Self {
            slots: SlotBuf::new(layout.stride()),
        }
    }
}

impl NodeRead for HeapNodes {
    fn region(&self) -> &[u8] {
        self.slots.as_bytes()
    }
}

impl NodeGrow for HeapNodes {
    fn region_mut(&mut self) -> &mut [u8] {
        self.slots.as_bytes_mut()
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn grow(&mut self, slots: usize) -> std::result::Result<(), StorageError> {
        if slots > self.slots.len() {
            self.slots.resize(slots);
        }
        Ok(())
    }
}

/// Slots mapped read/write onto the index file being built.
///
/// The file starts with a zeroed header that is filled in by [`seal`].
///
/// [`seal`]: NodeGrow::seal
pub struct DiskNodes {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    stride: usize,
    capacity: usize,
}

impl DiskNodes {
    /// Create (or truncate) `path` and map it.
    pub fn create(path: &Path, layout: &NodeLayout) -> std::result::Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(HEADER_SIZE as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            stride: layout.stride(),
            capacity: 0,
        })
    }

    fn resize_file(&mut self, len: u64) -> std::result::Result<(), StorageError> {
        if usize::try_from(len).is_err() {
            return Err(StorageError::TooLarge { bytes: len });
        }
        self.mmap.flush()?;
        self.file.set_len(len)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }
}

impl NodeRead for DiskNodes {
    fn region(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..HEADER_SIZE + self.capacity * self.stride]
    }
}

impl NodeGrow for DiskNodes {
    fn region_mut(&mut self) -> &mut [u8] {
        let end = HEADER_SIZE + self.capacity * self.stride;
        &mut self.mmap[HEADER_SIZE..end]
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn grow(&mut self, slots: usize) -> std::result::Result<(), StorageError> {
        if slots <= self.capacity {
            return Ok(());
        }
        // set_len zero-fills the extension
        self.resize_file(HEADER_SIZE as u64 + slots as u64 * self.stride as u64)?;
        self.capacity = slots;
        Ok(())
    }

    fn seal(
        &mut self,
        header: &IndexHeader,
        roots: &[u32],
    ) -> std::result::Result<(), StorageError> {
        self.resize_file(header.file_size())?;
        self.capacity = header.n_nodes as usize;

        self.mmap[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let roots_at = header.roots_offset as usize;
        for (i, root) in roots.iter().enumerate() {
            let at = roots_at + i * 4;
            self.mmap[at..at + 4].copy_from_slice(&root.to_le_bytes());
        }
        self.mmap.flush()?;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Read-only mapping of a saved index file.
pub struct MappedNodes {
    mmap: Mmap,
    header: IndexHeader,
    path: PathBuf,
}

impl MappedNodes {
    /// Map `path` and validate it against `layout`.
    ///
    /// `prefault` asks the kernel to populate the page tables up front
    /// (`MAP_POPULATE` on Linux). It only affects latency.
    pub fn open(path: &Path, layout: &NodeLayout, prefault: bool) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(FormatError::Truncated {
                expected: HEADER_SIZE as u64,
                actual: file_len,
            }
            .into());
        }

        let mut options = MmapOptions::new();
        if prefault {
            options.populate();
        }
        let mmap = unsafe { options.map(&file)? };

        let header = IndexHeader::from_bytes(&mmap)?;
        header.validate(layout, mmap.len() as u64)?;

        let mapped = Self {
            mmap,
            header,
            path: path.to_path_buf(),
        };
        for &root in mapped.roots()? {
            if root < header.n_items || root >= header.n_nodes {
                return Err(FormatError::Inconsistent("root id outside the tree node range").into());
            }
        }
        Ok(mapped)
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root ids from the trailing table.
    pub fn roots(&self) -> std::result::Result<&[u32], FormatError> {
        let start = self.header.roots_offset as usize;
        let end = start + self.header.n_trees as usize * 4;
        bytemuck::try_cast_slice(&self.mmap[start..end])
            .map_err(|_| FormatError::Inconsistent("root table misaligned"))
    }
}

impl NodeRead for MappedNodes {
    fn region(&self) -> &[u8] {
        let start = self.header.nodes_offset as usize;
        &self.mmap[start..self.header.roots_offset as usize]
    }
}

/// Growable slot arena with geometric capacity growth.
///
/// Ids are slot offsets, so growing the backing never invalidates them.
pub struct NodeStorage {
    backing: Box<dyn NodeGrow>,
    layout: NodeLayout,
    len: usize,
}

impl NodeStorage {
    pub fn in_memory(layout: NodeLayout) -> Self {
        Self {
            backing: Box::new(HeapNodes::new(&layout)),
            layout,
            len: 0,
        }
    }

    pub fn on_disk(layout: NodeLayout, path: &Path) -> Result<Self> {
        Ok(Self {
            backing: Box::new(DiskNodes::create(path, &layout)?),
            layout,
            len: 0,
        })
    }

    #[inline]
    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    /// Slots in use.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots in use, as bytes.
    #[inline]
    pub fn region(&self) -> &[u8] {
        &self.backing.region()[..self.len * self.layout.stride()]
    }

    #[inline]
    pub fn region_mut(&mut self) -> &mut [u8] {
        let end = self.len * self.layout.stride();
        &mut self.backing.region_mut()[..end]
    }

    #[inline]
    pub fn node(&self, id: u32) -> Node<'_> {
        self.layout.node(self.region(), id)
    }

    #[inline]
    pub fn node_mut(&mut self, id: u32) -> NodeMut<'_> {
        let layout = self.layout;
        layout.node_mut(self.region_mut(), id)
    }

    /// Reserve `count` zeroed slots and return the first id.
    pub fn allocate(&mut self, count: usize) -> Result<u32> {
        let base = self.len;
        let needed = base
            .checked_add(count)
            .filter(|&n| n <= u32::MAX as usize)
            .ok_or(Error::Capacity {
                requested: base as u64 + count as u64,
            })?;

        let capacity = self.backing.capacity();
        if needed > capacity {
            let doubled = capacity.saturating_add(1).saturating_mul(2);
            let target = doubled.min(u32::MAX as usize).max(needed);
            self.backing.grow(target)?;
        }

        self.len = needed;
        let stride = self.layout.stride();
        self.backing.region_mut()[base * stride..needed * stride].fill(0);
        Ok(base as u32)
    }

    /// Extend the arena to at least `len` slots.
    pub fn ensure_len(&mut self, len: usize) -> Result<()> {
        if len > self.len {
            self.allocate(len - self.len)?;
        }
        Ok(())
    }

    /// Forget every slot past `len`.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn seal(&mut self, header: &IndexHeader, roots: &[u32]) -> Result<()> {
        self.backing.seal(header, roots)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.backing.path()
    }
}
