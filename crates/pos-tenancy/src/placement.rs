//! Shard placement for new stores

use crate::stores::TenantRecord;
use pos_common::ShardId;

/// Tenants hosted per shard, in shard order
pub fn shard_loads(records: &[TenantRecord], shard_count: u16) -> Vec<(ShardId, usize)> {
    let mut loads: Vec<(ShardId, usize)> = (1..=shard_count).map(|k| (ShardId::from_raw(k), 0)).collect();
    for record in records {
        let raw = record.shard_id.get();
        if raw >= 1 && raw <= shard_count {
            loads[usize::from(raw) - 1].1 += 1;
        }
    }
    loads
}

/// Shard with the fewest tenants; ties go to the lowest id
pub fn least_loaded_shard(records: &[TenantRecord], shard_count: u16) -> ShardId {
    shard_loads(records, shard_count)
        .into_iter()
        .min_by_key(|(id, load)| (*load, *id))
        .map(|(id, _)| id)
        .unwrap_or(ShardId::from_raw(1))
}
