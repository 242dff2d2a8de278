//! Address-range planning
//!
//! Turns a sparse set of addresses into the fewest bulk operations that fit a
//! per-call quantity limit.

/// One bulk read or write covering `start..start + length`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBlock {
    pub start: u16,
    pub length: u16,
    /// Number of requested addresses inside the block
    pub members: usize,
}

impl AddressBlock {
    /// Last address covered by the block
    pub fn end(&self) -> u16 {
        self.start.saturating_add(self.length.saturating_sub(1))
    }
}

/// Greedy block plan over the 16-bit address space.
///
/// Addresses are sorted and deduplicated; each block opens at the first
/// uncovered address and takes every following address up to
/// `start + max - 1` (clamped at `u16::MAX`). Blocks come back in ascending
/// order and never overlap.
pub fn plan_blocks(addresses: &[u16], max: u16) -> Vec<AddressBlock> {
    if addresses.is_empty() || max == 0 {
        return Vec::new();
    }

    let mut sorted = addresses.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut blocks = Vec::new();
    let mut index = 0;
    while index < sorted.len() {
        let start = sorted[index];
        let max_end = start.checked_add(max - 1).unwrap_or(u16::MAX);

        let mut last = index;
        while last + 1 < sorted.len() && sorted[last + 1] <= max_end {
            last += 1;
        }

        let end = sorted[last];
        blocks.push(AddressBlock {
            start,
            // max <= u16::MAX so the span always fits
            length: end - start + 1,
            members: last - index + 1,
        });
        index = last + 1;
    }

    blocks
}

/// A run of items at strictly consecutive addresses, ready for one bulk write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRun<T> {
    pub start: u16,
    pub items: Vec<T>,
}

/// Coalesce `(address, item)` pairs sorted by address into runs.
///
/// An item joins the current run when its address equals
/// `run.start + run.len() * width`; a run is closed when the next address is
/// not consecutive or it already holds `max_members` items.
pub fn coalesce_runs<T>(sorted: Vec<(u16, T)>, width: u16, max_members: usize) -> Vec<WriteRun<T>> {
    let mut runs: Vec<WriteRun<T>> = Vec::new();

    for (address, item) in sorted {
        if let Some(run) = runs.last_mut() {
            let next = u32::from(run.start) + run.items.len() as u32 * u32::from(width);
            if u32::from(address) == next && run.items.len() < max_members {
                run.items.push(item);
                continue;
            }
        }
        runs.push(WriteRun {
            start: address,
            items: vec![item],
        });
    }

    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(blocks: &[AddressBlock]) -> Vec<(u16, u16)> {
        blocks.iter().map(|b| (b.start, b.length)).collect()
    }

    #[test]
    fn test_sparse_addresses() {
        let blocks = plan_blocks(&[1, 2, 3, 10, 11, 100], 5);
        assert_eq!(spans(&blocks), vec![(1, 3), (10, 2), (100, 1)]);
        assert_eq!(blocks[0].members, 3);
    }

    #[test]
    fn test_empty_and_single() {
        assert!(plan_blocks(&[], 125).is_empty());
        assert_eq!(spans(&plan_blocks(&[42], 125)), vec![(42, 1)]);
    }

    #[test]
    fn test_unsorted_with_duplicates() {
        let blocks = plan_blocks(&[11, 3, 3, 1, 11, 2], 125);
        assert_eq!(spans(&blocks), vec![(1, 11)]);
        assert_eq!(blocks[0].members, 4);
    }

    #[test]
    fn test_block_never_exceeds_max() {
        let addresses: Vec<u16> = (0..300).collect();
        let blocks = plan_blocks(&addresses, 125);
        assert_eq!(spans(&blocks), vec![(0, 125), (125, 125), (250, 50)]);
        assert!(blocks.iter().all(|b| b.length <= 125));
    }

    #[test]
    fn test_top_of_address_space() {
        let blocks = plan_blocks(&[65530, 65535], 125);
        assert_eq!(spans(&blocks), vec![(65530, 6)]);
        assert_eq!(blocks[0].end(), 65535);

        let blocks = plan_blocks(&[0, 65535], u16::MAX);
        assert_eq!(spans(&blocks), vec![(0, 1), (65535, 1)]);
    }

    #[test]
    fn test_every_address_covered_once() {
        let addresses = [5u16, 900, 7, 130, 131, 2000, 6, 1000];
        let blocks = plan_blocks(&addresses, 62);
        for a in addresses {
            let covering = blocks
                .iter()
                .filter(|b| a >= b.start && a <= b.end())
                .count();
            assert_eq!(covering, 1, "address {}", a);
        }
        assert!(blocks.windows(2).all(|w| w[0].end() < w[1].start));
    }

    #[test]
    fn test_coalesce_consecutive_writes() {
        let items = vec![(10u16, 'a'), (11, 'b'), (12, 'c'), (20, 'd')];
        let runs = coalesce_runs(items, 1, 60);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].start, runs[0].items.len()), (10, 3));
        assert_eq!((runs[1].start, runs[1].items.len()), (20, 1));
    }

    #[test]
    fn test_coalesce_respects_width_and_max() {
        // 32-bit values occupy two registers each
        let items = vec![(0u16, 1), (2, 2), (4, 3), (5, 4)];
        let runs = coalesce_runs(items, 2, 2);
        let shape: Vec<(u16, usize)> = runs.iter().map(|r| (r.start, r.items.len())).collect();
        assert_eq!(shape, vec![(0, 2), (4, 1), (5, 1)]);
    }
}
