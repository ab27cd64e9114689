//! Ordering of shards by measured round-trip time.

use std::cmp::Ordering;

use crate::directory::Shard;

/// Sorts shards by ascending round-trip time.
///
/// The sort is stable, shards with equal round-trip times keep their relative order.
/// Unmeasured shards are placed after every measured one: a shard that never answered is
/// not the fastest shard.
pub fn rank(mut shards: Vec<Shard>) -> Vec<Shard> {
    shards.sort_by(compare_rtt);
    shards
}

fn compare_rtt(a: &Shard, b: &Shard) -> Ordering {
    match (a.rtt, b.rtt) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
