#![forbid(unsafe_code)]

use crate::primitives::arith::{ceil_div, gcd, round_down, round_up};
use crate::primitives::paging::page_size;
use crate::types::{Result, UfoError};

/// Bytes an object loads per fault when the caller gives no minimum.
pub const DEFAULT_LOAD_BYTES: u64 = 1024 * 1024;

/// Geometry of a lazily populated object.
///
/// The reservation is laid out as a page-padded header followed by the body:
///
/// ```text
/// start      start + pad - header_size      start + pad
///   |  padding  |          header              |  body: element_count * stride ... |
/// ```
///
/// Configs are plain values; an object keeps its own copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectConfig {
    page_size: usize,
    header_size: usize,
    header_size_with_padding: usize,
    element_count: u64,
    stride: usize,
    objects_at_once: u64,
    read_only: bool,
}

/// The chunk that resolves a fault at a given body offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Load boundary, relative to the body start.
    pub boundary_offset: u64,
    /// First element index in the chunk.
    pub index: u64,
    /// Number of elements populated.
    pub fill_count: u64,
    /// Page-rounded byte size of the installed chunk.
    pub size_bytes: u64,
}

impl ChunkSpan {
    /// Exclusive end index.
    pub fn end(&self) -> u64 {
        self.index + self.fill_count
    }
}

impl ObjectConfig {
    /// Builds a config for the host page size.
    ///
    /// `min_load_count` is the minimum number of elements to populate per
    /// fault; `None` loads roughly [`DEFAULT_LOAD_BYTES`] at a time.
    pub fn new(
        header_size: usize,
        element_count: u64,
        stride: usize,
        min_load_count: Option<u64>,
    ) -> Result<Self> {
        Self::with_page_size(page_size(), header_size, element_count, stride, min_load_count)
    }

    /// Builds a config for an explicit page size.
    pub fn with_page_size(
        page_size: usize,
        header_size: usize,
        element_count: u64,
        stride: usize,
        min_load_count: Option<u64>,
    ) -> Result<Self> {
        if stride < 1 {
            return Err(UfoError::InvalidConfig("stride must be at least 1"));
        }
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(UfoError::InvalidConfig("page size must be a power of two"));
        }
        let page = page_size as u64;
        let stride_u = stride as u64;
        let header_size_with_padding = round_up(header_size as u64, page) as usize;

        let min_pages = gcd(page, stride_u);
        let p_min_objects = if page > stride_u && (page * min_pages) % stride_u == 0 {
            (page * min_pages) / stride_u
        } else {
            // lcm(page, stride) / stride: fewest elements filling whole pages
            page / min_pages
        };

        let requested = min_load_count
            .unwrap_or_else(|| DEFAULT_LOAD_BYTES / stride_u)
            .max(1);
        let objects_at_once = p_min_objects
            .checked_mul(ceil_div(requested, p_min_objects))
            .ok_or(UfoError::InvalidConfig("load count overflows"))?;

        let config = Self {
            page_size,
            header_size,
            header_size_with_padding,
            element_count,
            stride,
            objects_at_once,
            read_only: true,
        };
        let body = element_count
            .checked_mul(stride_u)
            .ok_or(UfoError::InvalidConfig("object body overflows"))?;
        let total = (header_size_with_padding as u64)
            .checked_add(round_up(body, page))
            .ok_or(UfoError::InvalidConfig("object size overflows"))?;
        if total == 0 {
            return Err(UfoError::InvalidConfig("object has no header and no body"));
        }
        Ok(config)
    }

    /// Marks the body writable (or read-only again).
    pub fn writable(mut self, writable: bool) -> Self {
        self.read_only = !writable;
        self
    }

    /// Page size the geometry was computed for.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Header bytes requested by the caller.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Header rounded up to whole pages; the body starts right after.
    pub fn header_size_with_padding(&self) -> usize {
        self.header_size_with_padding
    }

    /// Number of elements in the body.
    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    /// Bytes per element.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Elements populated per fault; every load boundary is page aligned.
    pub fn objects_at_once(&self) -> u64 {
        self.objects_at_once
    }

    /// True unless [`ObjectConfig::writable`] was set.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Body length in bytes, without page padding.
    pub fn body_len(&self) -> usize {
        (self.element_count * self.stride as u64) as usize
    }

    /// Header padding plus page-rounded body.
    pub fn true_size(&self) -> usize {
        self.header_size_with_padding
            + round_up(self.body_len() as u64, self.page_size as u64) as usize
    }

    /// Page-rounded size of a full chunk, the largest any fault installs.
    pub fn chunk_bytes(&self) -> usize {
        let full = self.objects_at_once.min(self.element_count.max(1)) * self.stride as u64;
        round_up(full, self.page_size as u64) as usize
    }

    /// Resolves the chunk that covers `body_offset`.
    ///
    /// Returns `None` for offsets past the last element.
    pub fn locate(&self, body_offset: u64) -> Option<ChunkSpan> {
        let stride = self.stride as u64;
        let bytes_at_once = self.objects_at_once * stride;
        let boundary_offset = round_down(body_offset, bytes_at_once);
        let index = boundary_offset / stride;
        if index >= self.element_count {
            return None;
        }
        let fill_count = self.objects_at_once.min(self.element_count - index);
        let size_bytes = round_up(fill_count * stride, self.page_size as u64);
        Some(ChunkSpan {
            boundary_offset,
            index,
            fill_count,
            size_bytes,
        })
    }
}
