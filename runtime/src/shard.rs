//! Shard routing and per-partition rewind tracking.
//!
//! The broker partitions `order.placed` by `order_id`, and each partition is
//! owned by exactly one shard worker (`partition % shards`). A key therefore
//! always lands on the same worker, which processes it in log order. Disjoint
//! keys on other partitions proceed in parallel.
//!
//! When a worker leaves a message unacknowledged it rewinds the partition.
//! Records from that partition already queued behind the rewound one are
//! stale: the broker will hand them out again after the redelivery. The
//! [`RewindGate`] drops them until the rewound offset comes back.

use fulfillment_core::event_bus::DeliveryPosition;
use std::collections::HashMap;

/// Shard owning `partition`.
#[must_use]
pub fn shard_for(partition: i32, shards: usize) -> usize {
    let shards = shards.max(1);
    usize::try_from(partition.unsigned_abs()).map_or(0, |p| p % shards)
}

/// What a worker should do with a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateVerdict {
    /// Process it
    Process,
    /// Drop it silently; it will be redelivered
    Stale,
}

/// Tracks rewound partitions of one shard.
#[derive(Debug, Default)]
pub struct RewindGate {
    rewound: HashMap<(String, i32), i64>,
}

impl RewindGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `position` was left unacknowledged and its partition rewound.
    pub fn rewind(&mut self, position: &DeliveryPosition) {
        let key = (position.topic.clone(), position.partition);
        let offset = self.rewound.entry(key).or_insert(position.offset);
        *offset = (*offset).min(position.offset);
    }

    /// Decide whether a delivery is current.
    pub fn admit(&mut self, position: &DeliveryPosition) -> GateVerdict {
        let key = (position.topic.clone(), position.partition);
        match self.rewound.get(&key) {
            Some(&rewound) if position.offset > rewound => GateVerdict::Stale,
            Some(_) => {
                self.rewound.remove(&key);
                GateVerdict::Process
            },
            None => GateVerdict::Process,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn drops_stale_copies_until_redelivery() {
        let mut gate = RewindGate::new();
        let failed = DeliveryPosition::new("order.placed", 2, 10);
        gate.rewind(&failed);

        assert_eq!(gate.admit(&DeliveryPosition::new("order.placed", 2, 11)), GateVerdict::Stale);
        assert_eq!(gate.admit(&DeliveryPosition::new("order.placed", 3, 11)), GateVerdict::Process);
        assert_eq!(gate.admit(&failed), GateVerdict::Process);
        assert_eq!(gate.admit(&DeliveryPosition::new("order.placed", 2, 11)), GateVerdict::Process);
    }

    proptest! {
        #[test]
        fn every_partition_has_one_owner(partition in 0i32..10_000, shards in 1usize..64) {
            let shard = shard_for(partition, shards);
            prop_assert!(shard < shards);
            prop_assert_eq!(shard, shard_for(partition, shards));
        }
    }

    #[test]
    fn zero_shards_means_one() {
        assert_eq!(shard_for(7, 0), 0);
    }
}
