//! Chunk planning
//!
//! Splits a payload length into numbered, contiguous byte ranges.

use std::ops::Range;

use crate::error::{Error, Result};
use crate::storage::MAX_PARTS;

/// One planned part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based part number
    pub part_number: u32,
    /// Byte range within the payload
    pub range: Range<u64>,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered parts covering a whole payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    payload_len: u64,
    part_size: u64,
    parts: Vec<Chunk>,
}

impl ChunkPlan {
    /// Plan `payload_len` bytes in parts of `part_size`. The last part
    /// carries the remainder; an empty payload yields an empty plan.
    pub fn new(payload_len: u64, part_size: u64) -> Result<Self> {
        if part_size == 0 {
            return Err(Error::InvalidPartSize {
                part_size,
                minimum: 1,
            });
        }

        let count = payload_len.div_ceil(part_size);
        if count > MAX_PARTS {
            return Err(Error::TooManyParts {
                payload_len,
                parts: count,
                max_parts: MAX_PARTS,
            });
        }

        let parts = (0..count)
            .map(|index| {
                let start = index * part_size;
                Chunk {
                    // count <= MAX_PARTS keeps this in range
                    part_number: (index + 1) as u32,
                    range: start..(start + part_size).min(payload_len),
                }
            })
            .collect();

        Ok(Self {
            payload_len,
            part_size,
            parts,
        })
    }

    pub fn parts(&self) -> &[Chunk] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = 5 * 1024 * 1024;

    fn assert_covers(plan: &ChunkPlan) {
        let mut expected_start = 0;
        for (index, chunk) in plan.parts().iter().enumerate() {
            assert_eq!(chunk.part_number as usize, index + 1);
            assert_eq!(chunk.range.start, expected_start);
            if index + 1 < plan.len() {
                assert_eq!(chunk.len(), plan.part_size());
            } else {
                assert!(chunk.len() > 0 && chunk.len() <= plan.part_size());
            }
            expected_start = chunk.range.end;
        }
        assert_eq!(expected_start, plan.payload_len());
    }

    #[test]
    fn test_exact_multiple() {
        let plan = ChunkPlan::new(2 * P, P).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.parts()[0].range, 0..P);
        assert_eq!(plan.parts()[1].range, P..2 * P);
        assert_covers(&plan);
    }

    #[test]
    fn test_smaller_than_part_size() {
        let plan = ChunkPlan::new(P - 1, P).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.parts()[0].len(), P - 1);
    }

    #[test]
    fn test_remainder_goes_to_last_part() {
        let plan = ChunkPlan::new(10, 3).unwrap();
        let lengths: Vec<u64> = plan.parts().iter().map(Chunk::len).collect();
        assert_eq!(lengths, vec![3, 3, 3, 1]);
        assert_covers(&plan);
    }

    #[test]
    fn test_many_lengths_cover_payload() {
        for part_size in [1u64, 2, 7, 64] {
            for len in 0..200u64 {
                let plan = ChunkPlan::new(len, part_size).unwrap();
                assert_eq!(plan.len() as u64, len.div_ceil(part_size));
                assert_covers(&plan);
            }
        }
    }

    #[test]
    fn test_empty_payload() {
        let plan = ChunkPlan::new(0, P).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_rejects_zero_part_size() {
        assert!(matches!(
            ChunkPlan::new(10, 0),
            Err(Error::InvalidPartSize { part_size: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_too_many_parts() {
        assert!(ChunkPlan::new(MAX_PARTS, 1).is_ok());
        assert!(matches!(
            ChunkPlan::new(MAX_PARTS + 1, 1),
            Err(Error::TooManyParts { parts, .. }) if parts == MAX_PARTS + 1
        ));
    }
}
