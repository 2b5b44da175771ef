//! Slotted page holding record images and forwarding stubs.
//!
//! The slot directory grows up from the page header; record bytes grow down
//! from the end of the page. A directory entry with offset zero is empty and
//! may be reused by the next insert.

use crate::primitives::bytes::be;
use crate::types::page::{init_page, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{PageId, Result, StoreError};

const SLOT_COUNT_OFFSET: usize = PAGE_HDR_LEN;
const DATA_START_OFFSET: usize = PAGE_HDR_LEN + 2;
const DIRECTORY_OFFSET: usize = PAGE_HDR_LEN + 8;
const DIR_ENTRY_LEN: usize = 4;

/// Bytes of a records page not available to a lone record: header, page
/// fields, and one directory entry.
pub const MAX_RECORD_OVERHEAD: usize = DIRECTORY_OFFSET + DIR_ENTRY_LEN;

fn slot_count(data: &[u8]) -> Result<u16> {
    be::get_u16(data, SLOT_COUNT_OFFSET)
}

fn entry(data: &[u8], slot: u16) -> Result<(usize, usize)> {
    if slot >= slot_count(data)? {
        return Err(StoreError::NotFound("record slot"));
    }
    let pos = DIRECTORY_OFFSET + slot as usize * DIR_ENTRY_LEN;
    Ok((be::get_u16(data, pos)? as usize, be::get_u16(data, pos + 2)? as usize))
}

/// Checks the common header of a records page.
pub fn check(data: &[u8], id: PageId) -> Result<()> {
    PageHeader::expect(data, id, PageKind::Records).map(|_| ())
}

/// Bytes stored in `slot`.
pub fn read(data: &[u8], slot: u16) -> Result<&[u8]> {
    let (offset, len) = entry(data, slot)?;
    if offset == 0 {
        return Err(StoreError::NotFound("record slot"));
    }
    if offset + len > data.len() {
        return Err(StoreError::Corrupted("record slot beyond page"));
    }
    Ok(&data[offset..offset + len])
}

/// Occupied slot numbers in directory order.
pub fn live_slots(data: &[u8]) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    for slot in 0..slot_count(data)? {
        if entry(data, slot)?.0 != 0 {
            out.push(slot);
        }
    }
    Ok(out)
}

fn live_bytes(data: &[u8]) -> Result<usize> {
    let mut total = 0;
    for slot in 0..slot_count(data)? {
        let (offset, len) = entry(data, slot)?;
        if offset != 0 {
            total += len;
        }
    }
    Ok(total)
}

fn has_empty_entry(data: &[u8]) -> Result<bool> {
    for slot in 0..slot_count(data)? {
        if entry(data, slot)?.0 == 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Bytes reclaimable for records after compaction, excluding the directory.
pub fn free_space(data: &[u8]) -> Result<usize> {
    let dir_end = DIRECTORY_OFFSET + slot_count(data)? as usize * DIR_ENTRY_LEN;
    Ok(data.len().saturating_sub(dir_end + live_bytes(data)?))
}

/// Largest record a new insert into this page could store.
pub fn insert_capacity(data: &[u8]) -> Result<usize> {
    let free = free_space(data)?;
    if has_empty_entry(data)? {
        Ok(free)
    } else {
        Ok(free.saturating_sub(DIR_ENTRY_LEN))
    }
}

/// Mutable view of a records page buffer.
pub struct RecordsPage<'a> {
    data: &'a mut [u8],
}

impl<'a> RecordsPage<'a> {
    /// Wraps an existing records page.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Stamps an empty records page into `data`.
    pub fn init(data: &'a mut [u8], id: PageId) -> Result<Self> {
        init_page(data, id, PageKind::Records)?;
        let end = u16::try_from(data.len())
            .map_err(|_| StoreError::Invalid("records page larger than 64 KiB"))?;
        be::put_u16(data, DATA_START_OFFSET, end)?;
        Ok(Self { data })
    }

    fn data_start(&self) -> Result<usize> {
        Ok(be::get_u16(self.data, DATA_START_OFFSET)? as usize)
    }

    fn dir_end(&self) -> Result<usize> {
        Ok(DIRECTORY_OFFSET + slot_count(self.data)? as usize * DIR_ENTRY_LEN)
    }

    fn set_entry(&mut self, slot: u16, offset: usize, len: usize) -> Result<()> {
        let pos = DIRECTORY_OFFSET + slot as usize * DIR_ENTRY_LEN;
        be::put_u16(self.data, pos, offset as u16)?;
        be::put_u16(self.data, pos + 2, len as u16)
    }

    /// Bytes stored in `slot`.
    pub fn get(&self, slot: u16) -> Result<&[u8]> {
        read(self.data, slot)
    }

    /// Rewrites every record tightly against the end of the page.
    pub fn compact(&mut self) -> Result<()> {
        let mut records = Vec::new();
        for slot in 0..slot_count(self.data)? {
            let (offset, len) = entry(self.data, slot)?;
            if offset != 0 {
                records.push((slot, self.data[offset..offset + len].to_vec()));
            }
        }
        let mut top = self.data.len();
        for (slot, bytes) in records {
            top -= bytes.len();
            self.data[top..top + bytes.len()].copy_from_slice(&bytes);
            self.set_entry(slot, top, bytes.len())?;
        }
        be::put_u16(self.data, DATA_START_OFFSET, top as u16)
    }

    fn place(&mut self, len: usize) -> Result<usize> {
        if self.data_start()? < self.dir_end()? + len {
            self.compact()?;
        }
        let start = self.data_start()?;
        if start < self.dir_end()? + len {
            return Err(StoreError::TooBig);
        }
        let offset = start - len;
        be::put_u16(self.data, DATA_START_OFFSET, offset as u16)?;
        Ok(offset)
    }

    /// Stores `bytes` in a free slot and returns its number.
    pub fn insert(&mut self, bytes: &[u8]) -> Result<u16> {
        if bytes.is_empty() {
            return Err(StoreError::Invalid("empty record image"));
        }
        if bytes.len() > insert_capacity(self.data)? {
            return Err(StoreError::TooBig);
        }
        let count = slot_count(self.data)?;
        let reused = (0..count).find(|s| matches!(entry(self.data, *s), Ok((0, _))));
        let slot = match reused {
            Some(slot) => slot,
            None => {
                let next = count.checked_add(1).ok_or(StoreError::TooBig)?;
                be::put_u16(self.data, SLOT_COUNT_OFFSET, next)?;
                self.set_entry(count, 0, 0)?;
                count
            }
        };
        let offset = self.place(bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.set_entry(slot, offset, bytes.len())?;
        Ok(slot)
    }

    /// Replaces the bytes of an occupied slot.
    pub fn replace(&mut self, slot: u16, bytes: &[u8]) -> Result<()> {
        let (offset, len) = entry(self.data, slot)?;
        if offset == 0 {
            return Err(StoreError::NotFound("record slot"));
        }
        if bytes.len() <= len {
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            return self.set_entry(slot, offset, bytes.len());
        }
        if bytes.len() > free_space(self.data)? + len {
            return Err(StoreError::TooBig);
        }
        self.set_entry(slot, 0, 0)?;
        let offset = self.place(bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.set_entry(slot, offset, bytes.len())
    }

    /// Empties `slot`, trimming trailing empty directory entries.
    pub fn remove(&mut self, slot: u16) -> Result<()> {
        let (offset, _) = entry(self.data, slot)?;
        if offset == 0 {
            return Err(StoreError::NotFound("record slot"));
        }
        self.set_entry(slot, 0, 0)?;
        let mut count = slot_count(self.data)?;
        while count > 0 && entry(self.data, count - 1)?.0 == 0 {
            count -= 1;
        }
        be::put_u16(self.data, SLOT_COUNT_OFFSET, count)
    }
}
