//! Enforcement counters, readable without touching the BPF side.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BpfMetrics {
    pub populate_ops: u64,
    pub failed_populate_ops: u64,
    pub cleanup_ops: u64,
    pub policy_entry_count: u64,
    pub populate_time_us: u64,
    pub cleanup_time_us: u64,
    pub total_containers: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContainerMetrics {
    pub cgroup_id: u64,
    pub entry_count: u64,
    pub populate_time_us: u64,
}
