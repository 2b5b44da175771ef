//! Shared page header stamped at the front of every page.

use core::convert::TryFrom;

use super::{PageId, Result, StoreError};
use crate::primitives::bytes::be;

/// Magic bytes identifying a nodestore page.
pub const PAGE_MAGIC: [u8; 4] = *b"NDST";
/// Current page format version.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Length of the common page header.
pub const PAGE_HDR_LEN: usize = 16;

const MAGIC_AT: usize = 0;
const VERSION_AT: usize = 4;
const KIND_AT: usize = 6;
const ZERO_AT: usize = 7;
const SIZE_AT: usize = 8;
const NUMBER_AT: usize = 12;

/// Role of a page.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Slotted page holding node records and forwarding stubs.
    Records = 1,
    /// One chunk of an overflowed value.
    Overflow = 2,
    /// Leaf of a big collection, holding elements.
    CollectionLeaf = 3,
    /// Interior page of a big collection, holding fan-out entries.
    CollectionIndex = 4,
}

impl PageKind {
    const ALL: [PageKind; 4] = [
        PageKind::Records,
        PageKind::Overflow,
        PageKind::CollectionLeaf,
        PageKind::CollectionIndex,
    ];

    /// Returns the on-page byte for this kind.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = StoreError;

    fn try_from(byte: u8) -> Result<Self> {
        PageKind::ALL
            .into_iter()
            .find(|kind| kind.as_u8() == byte)
            .ok_or(StoreError::Corrupted("unknown page kind"))
    }
}

/// Decoded common page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Format version the page was written with.
    pub format_version: u16,
    /// Role of the page.
    pub kind: PageKind,
    /// Page size recorded at initialization.
    pub page_size: u32,
    /// Page number, checked against the requested id on decode.
    pub page_no: PageId,
}

impl PageHeader {
    /// Builds a header for a freshly initialized page.
    pub fn new(page_no: PageId, kind: PageKind, page_size: u32) -> Result<Self> {
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(StoreError::Invalid("page size smaller than header"));
        }
        Ok(Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            page_size,
            page_no,
        })
    }

    /// Writes the header into the first `PAGE_HDR_LEN` bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        let hdr = dst
            .get_mut(..PAGE_HDR_LEN)
            .ok_or(StoreError::Invalid("page header buffer too small"))?;
        hdr[MAGIC_AT..VERSION_AT].copy_from_slice(&PAGE_MAGIC);
        be::put_u16(hdr, VERSION_AT, self.format_version)?;
        hdr[KIND_AT] = self.kind.as_u8();
        hdr[ZERO_AT] = 0;
        be::put_u32(hdr, SIZE_AT, self.page_size)?;
        be::put_u32(hdr, NUMBER_AT, self.page_no.0)
    }

    /// Parses and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let hdr = src
            .get(..PAGE_HDR_LEN)
            .ok_or(StoreError::Corrupted("page header truncated"))?;
        if hdr[MAGIC_AT..VERSION_AT] != PAGE_MAGIC {
            return Err(StoreError::Corrupted("invalid page magic"));
        }
        let format_version = be::get_u16(hdr, VERSION_AT)?;
        if format_version != PAGE_FORMAT_VERSION {
            return Err(StoreError::Corrupted("unsupported page format version"));
        }
        if hdr[ZERO_AT] != 0 {
            return Err(StoreError::Corrupted("page header reserved byte not zero"));
        }
        Ok(Self {
            format_version,
            kind: PageKind::try_from(hdr[KIND_AT])?,
            page_size: be::get_u32(hdr, SIZE_AT)?,
            page_no: PageId(be::get_u32(hdr, NUMBER_AT)?),
        })
    }

    /// Decodes the header and checks it describes page `id` of `kind`.
    pub fn expect(src: &[u8], id: PageId, kind: PageKind) -> Result<Self> {
        let header = Self::decode(src)?;
        if header.kind != kind {
            return Err(StoreError::Corrupted("page kind mismatch"));
        }
        if header.page_no != id {
            return Err(StoreError::Corrupted("page number mismatch"));
        }
        Ok(header)
    }
}

/// Zero-fills `buf` and stamps a fresh header for `kind`.
pub fn init_page(buf: &mut [u8], id: PageId, kind: PageKind) -> Result<()> {
    let page_size =
        u32::try_from(buf.len()).map_err(|_| StoreError::Invalid("page size exceeds u32"))?;
    buf.fill(0);
    PageHeader::new(id, kind, page_size)?.encode(buf)
}
