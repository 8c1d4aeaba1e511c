// src/monitor/metrics.rs

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// 单条连接上所有集合共享的计数器
#[derive(Default, Debug)]
pub struct Metrics {
    pub local_sets: AtomicU64,
    pub local_deletes: AtomicU64,
    pub local_clears: AtomicU64,
    pub remote_applied: AtomicU64,
    pub evictions: AtomicU64,
    pub rejected_messages: AtomicU64,
    pub sync_failures: AtomicU64,
    /// (集合名, 副本编号) -> 本地副本条目数；同名集合可以在一条连接上开多个
    pub collection_sizes: DashMap<(String, u64), u64>,
    next_replica: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 为新建的本地副本分配编号
    pub fn register_replica(&self) -> u64 {
        self.next_replica.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_size(&self, collection: &str, replica: u64, len: usize) {
        self.collection_sizes.insert((collection.to_string(), replica), len as u64);
    }

    pub fn forget(&self, collection: &str, replica: u64) {
        self.collection_sizes.remove(&(collection.to_string(), replica));
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("rmap_local_sets_total", "Local set operations", &self.local_sets),
            ("rmap_local_deletes_total", "Local delete operations", &self.local_deletes),
            ("rmap_local_clears_total", "Local clear operations", &self.local_clears),
            ("rmap_remote_applied_total", "Change messages applied from the channel", &self.remote_applied),
            ("rmap_evictions_total", "Keys evicted by expiration markers", &self.evictions),
            ("rmap_rejected_messages_total", "Malformed change messages dropped", &self.rejected_messages),
            ("rmap_sync_failures_total", "Snapshot reads that failed and were ignored", &self.sync_failures),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value.load(Ordering::Relaxed)));
        }

        output.push_str("# HELP rmap_collection_entries Entries held by the local replica\n");
        output.push_str("# TYPE rmap_collection_entries gauge\n");
        for entry in self.collection_sizes.iter() {
            let (collection, replica) = entry.key();
            output.push_str(&format!(
                "rmap_collection_entries{{collection=\"{}\",replica=\"{}\"}} {}\n",
                collection,
                replica,
                entry.value()
            ));
        }

        output
    }
}
