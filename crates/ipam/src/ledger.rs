//! Pool counter bookkeeping.
//!
//! Pure transitions over [`ClusterIPPoolStatus`]. Every transition keeps
//! `freeIPs + allocatedIPs == totalIPs`, `nextIndex <= totalIPs` and the
//! released indexes distinct and below `nextIndex`.

use std::collections::{BTreeSet, HashSet};

use crds::ClusterIPPoolStatus;

/// Index the next allocation would receive, without taking it.
pub fn peek_index(status: &ClusterIPPoolStatus) -> Option<u64> {
    if status.free_ips == 0 {
        return None;
    }
    match status.released_indexes.first() {
        Some(index) => Some(*index),
        None if status.next_index < status.total_ips => Some(status.next_index),
        None => None,
    }
}

/// Takes the next index: oldest released index first, then the high-water mark.
pub fn take_index(status: &mut ClusterIPPoolStatus) -> Option<u64> {
    let index = peek_index(status)?;
    if status.released_indexes.first() == Some(&index) {
        status.released_indexes.remove(0);
    } else {
        status.next_index += 1;
    }
    status.free_ips -= 1;
    status.allocated_ips += 1;
    Some(index)
}

/// Records `index` as allocated on a status read after the index was chosen.
///
/// Returns false when the status already accounts for the index.
pub fn claim(status: &mut ClusterIPPoolStatus, index: u64) -> bool {
    if status.free_ips == 0 || index >= status.total_ips {
        return false;
    }

    if let Some(position) = status.released_indexes.iter().position(|i| *i == index) {
        status.released_indexes.remove(position);
    } else if index >= status.next_index {
        let skipped = status.next_index..index;
        status.released_indexes.extend(skipped);
        status.next_index = index + 1;
    } else {
        return false;
    }

    status.free_ips -= 1;
    status.allocated_ips += 1;
    true
}

/// Returns `index` to the pool. Returns false when it is not allocated.
pub fn restore(status: &mut ClusterIPPoolStatus, index: u64) -> bool {
    if index >= status.next_index
        || status.allocated_ips == 0
        || status.released_indexes.contains(&index)
    {
        return false;
    }
    status.released_indexes.push(index);
    status.free_ips += 1;
    status.allocated_ips -= 1;
    true
}

/// Rebuilds the counters of a pool of `total` addresses from its live indexes.
///
/// Released indexes keep their order; indexes below the high-water mark that
/// are neither live nor released are appended.
pub fn recount(status: &mut ClusterIPPoolStatus, total: u64, live: &BTreeSet<u64>) {
    let live: BTreeSet<u64> = live.iter().copied().filter(|i| *i < total).collect();
    let high_water = live.last().map_or(0, |i| i + 1);
    let next = status.next_index.max(high_water).min(total);

    let mut seen = HashSet::new();
    let mut released: Vec<u64> = status
        .released_indexes
        .iter()
        .copied()
        .filter(|i| *i < next && !live.contains(i) && seen.insert(*i))
        .collect();
    released.extend((0..next).filter(|i| !live.contains(i) && !seen.contains(i)));

    let allocated = live.len() as u64;
    status.total_ips = total;
    status.allocated_ips = allocated;
    status.free_ips = total - allocated;
    status.next_index = next;
    status.released_indexes = released;
}

/// Whether `status` satisfies the counter invariants.
pub fn is_consistent(status: &ClusterIPPoolStatus) -> bool {
    let mut seen = HashSet::new();
    status.free_ips.checked_add(status.allocated_ips) == Some(status.total_ips)
        && status.next_index <= status.total_ips
        && status
            .released_indexes
            .iter()
            .all(|i| *i < status.next_index && seen.insert(*i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(total: u64) -> ClusterIPPoolStatus {
        let mut status = ClusterIPPoolStatus::default();
        recount(&mut status, total, &BTreeSet::new());
        status
    }

    #[test]
    fn fresh_pool_hands_out_in_order() {
        let mut status = fresh(3);
        assert_eq!(status.free_ips, 3);
        assert_eq!(take_index(&mut status), Some(0));
        assert_eq!(take_index(&mut status), Some(1));
        assert_eq!(take_index(&mut status), Some(2));
        assert_eq!(take_index(&mut status), None);
        assert_eq!(status.free_ips, 0);
        assert_eq!(status.allocated_ips, 3);
        assert!(is_consistent(&status));
    }

    #[test]
    fn released_indexes_are_reused_oldest_first() {
        let mut status = fresh(4);
        for _ in 0..4 {
            take_index(&mut status);
        }
        assert!(restore(&mut status, 2));
        assert!(restore(&mut status, 0));
        assert_eq!(take_index(&mut status), Some(2));
        assert_eq!(take_index(&mut status), Some(0));
        assert!(is_consistent(&status));
    }

    #[test]
    fn restore_rejects_unallocated_indexes() {
        let mut status = fresh(4);
        take_index(&mut status);
        assert!(!restore(&mut status, 3));
        assert!(restore(&mut status, 0));
        assert!(!restore(&mut status, 0));
        assert!(is_consistent(&status));
    }

    #[test]
    fn claim_is_idempotent() {
        let mut status = fresh(4);
        let mut raced = status.clone();
        let index = take_index(&mut raced).unwrap();

        assert!(claim(&mut status, index));
        assert_eq!(status, raced);
        assert!(!claim(&mut status, index));
        assert!(is_consistent(&status));
    }

    #[test]
    fn claim_from_released_list() {
        let mut status = fresh(4);
        take_index(&mut status);
        take_index(&mut status);
        restore(&mut status, 0);
        restore(&mut status, 1);

        assert!(claim(&mut status, 1));
        assert_eq!(status.released_indexes, vec![0]);
        assert!(is_consistent(&status));
    }

    #[test]
    fn claim_past_high_water_releases_gap() {
        let mut status = fresh(8);
        assert!(claim(&mut status, 3));
        assert_eq!(status.next_index, 4);
        assert_eq!(status.released_indexes, vec![0, 1, 2]);
        assert_eq!(status.allocated_ips, 1);
        assert!(is_consistent(&status));
    }

    #[test]
    fn recount_derives_counters_from_live_set() {
        let mut status = fresh(10);
        status.free_ips = 1;
        status.allocated_ips = 1;
        status.released_indexes = vec![4, 4, 1];

        let live: BTreeSet<u64> = [0, 2, 5].into_iter().collect();
        recount(&mut status, 10, &live);

        assert_eq!(status.allocated_ips, 3);
        assert_eq!(status.free_ips, 7);
        assert_eq!(status.next_index, 6);
        assert_eq!(status.released_indexes, vec![4, 1, 3]);
        assert!(is_consistent(&status));
    }

    #[test]
    fn recount_drops_live_indexes_beyond_capacity() {
        let mut status = ClusterIPPoolStatus::default();
        let live: BTreeSet<u64> = [0, 7].into_iter().collect();
        recount(&mut status, 2, &live);
        assert_eq!(status.allocated_ips, 1);
        assert_eq!(status.next_index, 1);
        assert!(is_consistent(&status));
    }

    #[test]
    fn inconsistent_free_count_does_not_underflow() {
        let mut status = fresh(2);
        status.next_index = 2;
        assert_eq!(peek_index(&status), None);
        assert_eq!(take_index(&mut status), None);
    }
}
