//! Index file format
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "CNPYFRST"
//! 0x08     4       u32 LE      Version (1)
//! 0x0C     4       u32 LE      Metric tag
//! 0x10     4       u32 LE      f: dimensions
//! 0x14     4       u32 LE      Node stride in bytes
//! 0x18     4       u32 LE      Item slots (max item id + 1)
//! 0x1C     4       u32 LE      Total node slots
//! 0x20     4       u32 LE      Tree count
//! 0x24     4       [u8; 4]     Reserved
//! 0x28     8       u64 LE      Node region offset (64)
//! 0x30     8       u64 LE      Root table offset
//! 0x38     8       [u8; 8]     Reserved
//! ─────────────────────────────────────────────────
//! TOTAL: 64 bytes (cache-line aligned)
//!
//! [node region]   n_nodes × stride, items first, then tree nodes
//! [root table]    n_trees × u32 LE
//! ```
//!
//! The node region is the in-memory slot layout written verbatim, so a file
//! can be mapped and queried without decoding.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::metric::Metric;
use crate::node::NodeLayout;

/// Magic bytes identifying a canopy index file: "CNPYFRST"
pub const MAGIC: [u8; 8] = *b"CNPYFRST";

pub const FORMAT_VERSION: u32 = 1;

/// Header size in bytes (cache-line aligned)
pub const HEADER_SIZE: usize = 64;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected CNPYFRST")]
    InvalidMagic,

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Metric mismatch: opened as {expected}, file holds {found}")]
    MetricMismatch { expected: Metric, found: String },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Node stride mismatch: expected {expected}, got {actual}")]
    StrideMismatch { expected: usize, actual: usize },

    #[error("File truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("Inconsistent header: {0}")]
    Inconsistent(&'static str),
}

/// Parsed index file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u32,
    pub metric: u32,
    pub dimensions: u32,
    pub stride: u32,
    pub n_items: u32,
    pub n_nodes: u32,
    pub n_trees: u32,
    pub nodes_offset: u64,
    pub roots_offset: u64,
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl IndexHeader {
    /// Header for a forest of `n_trees` over `n_nodes` slots.
    pub fn new(layout: &NodeLayout, n_items: u32, n_nodes: u32, n_trees: u32) -> Self {
        let nodes_offset = HEADER_SIZE as u64;
        Self {
            version: FORMAT_VERSION,
            metric: layout.metric().tag(),
            dimensions: layout.dimensions() as u32,
            stride: layout.stride() as u32,
            n_items,
            n_nodes,
            n_trees,
            nodes_offset,
            roots_offset: nodes_offset + n_nodes as u64 * layout.stride() as u64,
        }
    }

    /// Parse header from the first 64 bytes of a file
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                expected: HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = read_u32(bytes, 0x08);
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            metric: read_u32(bytes, 0x0C),
            dimensions: read_u32(bytes, 0x10),
            stride: read_u32(bytes, 0x14),
            n_items: read_u32(bytes, 0x18),
            n_nodes: read_u32(bytes, 0x1C),
            n_trees: read_u32(bytes, 0x20),
            nodes_offset: read_u64(bytes, 0x28),
            roots_offset: read_u64(bytes, 0x30),
        })
    }

    /// Write header to bytes (exactly 64 bytes)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0x00..0x08].copy_from_slice(&MAGIC);
        buf[0x08..0x0C].copy_from_slice(&self.version.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.metric.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.dimensions.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.stride.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&self.n_items.to_le_bytes());
        buf[0x1C..0x20].copy_from_slice(&self.n_nodes.to_le_bytes());
        buf[0x20..0x24].copy_from_slice(&self.n_trees.to_le_bytes());
        buf[0x28..0x30].copy_from_slice(&self.nodes_offset.to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&self.roots_offset.to_le_bytes());
        buf
    }

    /// Byte length of a complete file described by this header.
    pub fn file_size(&self) -> u64 {
        self.roots_offset.saturating_add(self.n_trees as u64 * 4)
    }

    /// Check the header against the layout the caller expects and the
    /// actual file length.
    pub fn validate(&self, layout: &NodeLayout, file_len: u64) -> Result<(), FormatError> {
        if self.metric != layout.metric().tag() {
            return Err(FormatError::MetricMismatch {
                expected: layout.metric(),
                found: Metric::from_tag(self.metric)
                    .map(|m| m.name().to_string())
                    .unwrap_or_else(|| format!("tag {}", self.metric)),
            });
        }
        if self.dimensions as usize != layout.dimensions() {
            return Err(FormatError::DimensionMismatch {
                expected: layout.dimensions(),
                actual: self.dimensions as usize,
            });
        }
        if self.stride as usize != layout.stride() {
            return Err(FormatError::StrideMismatch {
                expected: layout.stride(),
                actual: self.stride as usize,
            });
        }
        if self.nodes_offset != HEADER_SIZE as u64 {
            return Err(FormatError::Inconsistent("node region must follow the header"));
        }
        if self.n_items > self.n_nodes {
            return Err(FormatError::Inconsistent("more items than node slots"));
        }
        let nodes_end = self.nodes_offset + self.n_nodes as u64 * self.stride as u64;
        if self.roots_offset != nodes_end {
            return Err(FormatError::Inconsistent("root table must follow the node region"));
        }

        let expected = self.file_size();
        if file_len < expected {
            return Err(FormatError::Truncated {
                expected,
                actual: file_len,
            });
        }
        if file_len > expected {
            return Err(FormatError::Inconsistent("trailing bytes after root table"));
        }
        Ok(())
    }
}

/// Sibling path used while a file is being replaced.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Write a complete index file.
///
/// Data goes to a staging file that is synced and then renamed over `path`,
/// so processes still mapping the previous file keep a valid mapping.
pub fn write_index(
    path: &Path,
    header: &IndexHeader,
    region: &[u8],
    roots: &[u32],
) -> io::Result<()> {
    let staging = staging_path(path);
    let result =
        write_file(&staging, header, region, roots).and_then(|_| fs::rename(&staging, path));
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn write_file(path: &Path, header: &IndexHeader, region: &[u8], roots: &[u32]) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&header.to_bytes())?;
    writer.write_all(region)?;
    for root in roots {
        writer.write_all(&root.to_le_bytes())?;
    }
    writer.flush()?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout() -> NodeLayout {
        NodeLayout::new(Metric::Euclidean, 3)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = IndexHeader::new(&layout(), 10, 25, 2);
        let bytes = header.to_bytes();
        let parsed = IndexHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, header);
        assert_eq!(parsed.nodes_offset, 64);
        assert_eq!(parsed.roots_offset, 64 + 25 * 28);
        assert_eq!(parsed.file_size(), 64 + 25 * 28 + 8);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = IndexHeader::new(&layout(), 1, 2, 1).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            IndexHeader::from_bytes(&bytes),
            Err(FormatError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = IndexHeader::new(&layout(), 1, 2, 1).to_bytes();
        bytes[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            IndexHeader::from_bytes(&bytes),
            Err(FormatError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_short_input() {
        assert!(matches!(
            IndexHeader::from_bytes(&MAGIC),
            Err(FormatError::Truncated { expected: 64, actual: 8 })
        ));
    }

    #[test]
    fn test_validate_against_layout() {
        let header = IndexHeader::new(&layout(), 10, 25, 2);
        let size = header.file_size();
        assert!(header.validate(&layout(), size).is_ok());

        let angular = NodeLayout::new(Metric::Angular, 3);
        assert!(matches!(
            header.validate(&angular, size),
            Err(FormatError::MetricMismatch { .. })
        ));

        let wider = NodeLayout::new(Metric::Euclidean, 4);
        assert!(matches!(
            header.validate(&wider, size),
            Err(FormatError::DimensionMismatch { expected: 4, actual: 3 })
        ));

        assert!(matches!(
            header.validate(&layout(), size - 1),
            Err(FormatError::Truncated { .. })
        ));
        assert!(matches!(
            header.validate(&layout(), size + 4),
            Err(FormatError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_write_index_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forest.cnp");
        std::fs::write(&path, b"stale contents").unwrap();

        let layout = layout();
        let header = IndexHeader::new(&layout, 1, 2, 1);
        let region = vec![0u8; 2 * layout.stride()];
        write_index(&path, &header, &region, &[1]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, header.file_size());
        assert_eq!(IndexHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(&bytes[bytes.len() - 4..], &1u32.to_le_bytes());

        // No staging files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
