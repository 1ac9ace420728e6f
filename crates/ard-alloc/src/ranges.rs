use std::collections::BTreeMap;

use crate::error::PartitionError;

/// Partition of a byte range into allocated and free sub-ranges, both keyed by offset.
///
/// Free ranges are searched in offset order, so allocation is a deterministic first fit by
/// offset.
#[derive(Debug, Clone)]
pub struct RangeTable {
    size: u64,
    allocated: BTreeMap<u64, u64>,
    free: BTreeMap<u64, u64>,
}

impl RangeTable {
    /// Creates a table where the whole `[0, size)` range is free.
    pub fn new(size: u64) -> Self {
        let mut free = BTreeMap::default();
        if size > 0 {
            free.insert(0, size);
        }

        Self {
            size,
            allocated: BTreeMap::default(),
            free,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline(always)]
    pub fn allocated(&self) -> &BTreeMap<u64, u64> {
        &self.allocated
    }

    #[inline(always)]
    pub fn free(&self) -> &BTreeMap<u64, u64> {
        &self.free
    }

    #[inline]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.values().sum()
    }

    #[inline]
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Reserves `size` bytes from the lowest offset free range that can hold them.
    ///
    /// Returns `None` if no free range is large enough or `size` is `0`.
    pub fn reserve(&mut self, size: u64) -> Option<u64> {
        // Empty ranges would break the partition
        if size == 0 {
            return None;
        }

        let (offset, found) = self
            .free
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(offset, len)| (*offset, *len))?;

        self.free.remove(&offset);
        self.allocated.insert(offset, size);

        // Whatever is left of the free range stays free
        if found > size {
            self.free.insert(offset + size, found - size);
        }

        Some(offset)
    }

    /// Returns a previously reserved range to the free list. When `coalesce` is set, the range
    /// is merged with free neighbors that touch it.
    ///
    /// Returns `false` if `offset` and `size` don't describe an allocated range.
    pub fn release(&mut self, offset: u64, size: u64, coalesce: bool) -> bool {
        match self.allocated.get(&offset) {
            Some(len) if *len == size => {}
            _ => return false,
        }
        self.allocated.remove(&offset);

        let mut start = offset;
        let mut len = size;

        if coalesce {
            if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
                if prev + prev_len == offset {
                    self.free.remove(&prev);
                    start = prev;
                    len += prev_len;
                }
            }

            if let Some(next_len) = self.free.remove(&(offset + size)) {
                len += next_len;
            }
        }

        self.free.insert(start, len);
        true
    }

    /// Verifies that the allocated and free ranges exactly cover `[0, size)` without overlap.
    pub fn validate(&self) -> Result<(), PartitionError> {
        let mut ranges: Vec<(u64, u64)> = self
            .allocated
            .iter()
            .chain(self.free.iter())
            .map(|(offset, len)| (*offset, *len))
            .collect();
        ranges.sort_unstable();

        let mut cursor = 0;
        let mut last_offset = None;
        for (offset, len) in ranges {
            if len == 0 {
                return Err(PartitionError::EmptyRange { offset });
            }

            if last_offset == Some(offset) {
                return Err(PartitionError::Duplicate { offset });
            }

            if offset < cursor {
                return Err(PartitionError::Overlap {
                    offset,
                    prev_end: cursor,
                });
            }

            if offset > cursor {
                return Err(PartitionError::Gap {
                    start: cursor,
                    end: offset,
                });
            }

            cursor = offset + len;
            last_offset = Some(offset);
        }

        if cursor < self.size {
            return Err(PartitionError::Gap {
                start: cursor,
                end: self.size,
            });
        }

        if cursor > self.size {
            return Err(PartitionError::Overrun {
                end: cursor,
                size: self.size,
            });
        }

        Ok(())
    }
}
