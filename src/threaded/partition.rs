//! Static work splitting for the fork-join driver.

use std::ops::Range;

/// Splits `n` items into `team` contiguous ranges whose sizes differ by at
/// most one; the first `n % team` workers take the larger share.
///
/// # Panics
///
/// Panics if `team` is zero or `tid >= team`.
pub fn balance211(n: usize, team: usize, tid: usize) -> Range<usize> {
    assert!(tid < team, "worker {tid} outside a team of {team}");
    let base = n / team;
    let larger = n % team;
    let start = tid * base + tid.min(larger);
    let len = base + usize::from(tid < larger);
    start..start + len
}

/// How output blocks are distributed across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partition {
    /// Whole block rows per worker: every column block of a row stays on one worker.
    Rows,
    /// Balanced runs of the row-major flattened block grid.
    #[default]
    Grid,
}

impl Partition {
    /// Block coordinates `(row_block, col_block)` owned by worker `tid`.
    pub fn blocks(self, row_blocks: usize, col_blocks: usize, team: usize, tid: usize) -> Vec<(usize, usize)> {
        match self {
            Partition::Rows => balance211(row_blocks, team, tid)
                .flat_map(|row| (0..col_blocks).map(move |col| (row, col)))
                .collect(),
            Partition::Grid => balance211(row_blocks * col_blocks, team, tid)
                .map(|index| (index / col_blocks, index % col_blocks))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance211_covers_once() {
        for n in [0, 1, 7, 32, 33, 1024] {
            for team in 1..=6 {
                let mut next = 0;
                for tid in 0..team {
                    let range = balance211(n, team, tid);
                    assert_eq!(range.start, next, "n={n} team={team} tid={tid}");
                    assert!(range.len() <= n.div_ceil(team));
                    next = range.end;
                }
                assert_eq!(next, n);
            }
        }
    }

    #[test]
    fn test_balance211_shares() {
        assert_eq!(balance211(10, 3, 0), 0..4);
        assert_eq!(balance211(10, 3, 1), 4..7);
        assert_eq!(balance211(10, 3, 2), 7..10);
    }

    #[test]
    fn test_rows_keep_block_rows_together() {
        let blocks = Partition::Rows.blocks(4, 3, 2, 1);
        assert_eq!(blocks, vec![(2, 0), (2, 1), (2, 2), (3, 0), (3, 1), (3, 2)]);
    }

    #[test]
    fn test_grid_splits_inside_rows() {
        let blocks = Partition::Grid.blocks(2, 3, 4, 1);
        assert_eq!(blocks, vec![(0, 2), (1, 0)]);
    }
}
