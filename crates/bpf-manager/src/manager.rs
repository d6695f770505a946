//! Linux implementation: program loading, pinning, and policy map
//! ownership.

#![cfg(target_os = "linux")]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use aya::maps::HashMap as AyaHashMap;
use aya::programs::links::FdLink;
use aya::programs::Lsm;
use aya::{Btf, Ebpf};
use tracing::{debug, info, warn};

use crate::error::{BpfError, Result};
use crate::metrics::{BpfMetrics, ContainerMetrics};
use crate::resolver;
use crate::{BpfConfig, PolicySpec};
use containerv_common::{PolicyKey, PolicyValue, ACTION_ALLOW, ACTION_DENY};

const POLICY_MAP: &str = "CV_POLICY";
const LSM_PROGRAM: &str = "file_open";
const MAP_PIN: &str = "policy";
const LINK_PIN: &str = "file-open";

pub(crate) struct LinuxBpfManager {
    bpf: Ebpf,
    pin_dir: PathBuf,
    capacity: u32,
    metrics: BpfMetrics,
    /// Installed keys per container; cleanup re-scans the map, this is
    /// the fast path and the per-container metric source.
    containers: HashMap<String, ContainerEntry>,
}

struct ContainerEntry {
    cgroup_id: u64,
    keys: Vec<PolicyKey>,
    populate_time_us: u64,
}

/// `bpf` security module registered with the kernel?
pub(crate) fn lsm_available() -> bool {
    match std::fs::read_to_string("/sys/kernel/security/lsm") {
        Ok(lsms) => lsms.split(',').any(|m| m.trim() == "bpf"),
        Err(_) => false,
    }
}

impl LinuxBpfManager {
    pub fn initialize(config: &BpfConfig) -> Result<Self> {
        let bytes = std::fs::read(&config.object_path)?;
        let mut bpf = Ebpf::load(&bytes)?;

        std::fs::create_dir_all(&config.pin_dir)?;

        let btf = Btf::from_sys_fs()?;
        let program: &mut Lsm = bpf
            .program_mut(LSM_PROGRAM)
            .ok_or(BpfError::ProgramNotFound { name: LSM_PROGRAM })?
            .try_into()?;
        program.load(LSM_PROGRAM, &btf)?;
        let link_id = program.attach()?;
        let link = program.take_link(link_id)?;
        let fd_link: FdLink = link.try_into().unwrap();
        fd_link.pin(config.pin_dir.join(LINK_PIN))?;

        let map = bpf
            .map_mut(POLICY_MAP)
            .ok_or(BpfError::MapNotFound { name: POLICY_MAP })?;
        map.pin(config.pin_dir.join(MAP_PIN))?;

        info!(pin_dir = %config.pin_dir.display(), "bpf-lsm enforcement active");
        Ok(Self {
            bpf,
            pin_dir: config.pin_dir.clone(),
            capacity: config.map_capacity,
            metrics: BpfMetrics::default(),
            containers: HashMap::new(),
        })
    }

    fn policy_map(&mut self) -> Result<AyaHashMap<&mut aya::maps::MapData, PolicyKey, PolicyValue>> {
        let map = self
            .bpf
            .map_mut(POLICY_MAP)
            .ok_or(BpfError::MapNotFound { name: POLICY_MAP })?;
        Ok(AyaHashMap::try_from(map)?)
    }

    pub fn populate_policy(
        &mut self,
        container_id: &str,
        cgroup_id: u64,
        rootfs: &Path,
        policy: &PolicySpec,
    ) -> Result<()> {
        let started = Instant::now();
        let capacity = self.capacity;
        let installed_before = self.metrics.policy_entry_count;

        let mut keys = Vec::new();
        let mut failed = 0u64;
        let mut pending: Vec<(PolicyKey, PolicyValue)> = Vec::new();

        let rules = policy
            .allow
            .iter()
            .map(|r| (r, ACTION_ALLOW))
            .chain(policy.deny.iter().map(|r| (r, ACTION_DENY)));
        for (rule, action) in rules {
            let identities = match resolver::resolve(&rule.pattern, rootfs) {
                Ok(identities) => identities,
                Err(err) => {
                    // One bad pattern never fails the container; it is
                    // counted and skipped.
                    warn!(container_id, pattern = %rule.pattern, %err, "resolve failed");
                    failed += 1;
                    continue;
                }
            };
            for identity in identities {
                let key = PolicyKey {
                    cgroup_id,
                    dev: identity.dev,
                    ino: identity.ino,
                };
                pending.push((
                    key,
                    PolicyValue {
                        mask: rule.perms,
                        action,
                    },
                ));
            }
        }

        if installed_before + pending.len() as u64 > capacity as u64 {
            // Install what fits; the caller tears the container down,
            // and cleanup reclaims the partial set.
            debug!(container_id, pending = pending.len(), "map capacity exceeded");
        }

        let mut map = self.policy_map()?;
        let mut inserted = 0u64;
        let mut capacity_hit = false;
        for (key, value) in &pending {
            if installed_before + inserted >= capacity as u64 {
                capacity_hit = true;
                break;
            }
            map.insert(key, value, 0)?;
            keys.push(*key);
            inserted += 1;
        }
        drop(map);

        let elapsed = started.elapsed().as_micros() as u64;
        self.metrics.populate_ops += 1;
        self.metrics.failed_populate_ops += failed;
        self.metrics.policy_entry_count += inserted;
        self.metrics.populate_time_us += elapsed;
        if !self.containers.contains_key(container_id) {
            self.metrics.total_containers += 1;
        }
        let entry = self
            .containers
            .entry(container_id.to_string())
            .or_insert_with(|| ContainerEntry {
                cgroup_id,
                keys: Vec::new(),
                populate_time_us: 0,
            });
        entry.keys.extend(keys);
        entry.populate_time_us += elapsed;

        if capacity_hit {
            return Err(BpfError::CapacityExceeded { capacity });
        }
        debug!(container_id, cgroup_id, inserted, failed, "policy populated");
        Ok(())
    }

    pub fn cleanup_policy(&mut self, container_id: &str) -> Result<()> {
        let started = Instant::now();
        let Some(entry) = self.containers.remove(container_id) else {
            // Idempotent: nothing tracked, nothing to delete.
            self.metrics.cleanup_ops += 1;
            return Ok(());
        };
        let cgroup_id = entry.cgroup_id;

        let mut map = self.policy_map()?;
        // The tracked keys are the fast path; a full scan backs them up
        // so no entry with this cgroup id can survive.
        for key in &entry.keys {
            let _ = map.remove(key);
        }
        let stale: Vec<PolicyKey> = map
            .keys()
            .filter_map(|k| k.ok())
            .filter(|k| k.cgroup_id == cgroup_id)
            .collect();
        for key in &stale {
            let _ = map.remove(key);
        }
        drop(map);

        let removed = entry.keys.len() as u64;
        self.metrics.policy_entry_count = self.metrics.policy_entry_count.saturating_sub(removed);
        self.metrics.cleanup_ops += 1;
        self.metrics.cleanup_time_us += started.elapsed().as_micros() as u64;
        self.metrics.total_containers = self.metrics.total_containers.saturating_sub(1);
        debug!(container_id, cgroup_id, removed, "policy cleaned up");
        Ok(())
    }

    pub fn sanity_check_pins(&self) -> bool {
        self.pin_dir.join(MAP_PIN).exists() && self.pin_dir.join(LINK_PIN).exists()
    }

    pub fn metrics(&self) -> BpfMetrics {
        self.metrics
    }

    pub fn container_metrics(&self, container_id: &str) -> Option<ContainerMetrics> {
        self.containers.get(container_id).map(|e| ContainerMetrics {
            cgroup_id: e.cgroup_id,
            entry_count: e.keys.len() as u64,
            populate_time_us: e.populate_time_us,
        })
    }

    pub fn shutdown(&mut self) {
        for pin in [MAP_PIN, LINK_PIN] {
            let path = self.pin_dir.join(pin);
            if path.exists() {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), %err, "failed to unpin");
                }
            }
        }
        self.containers.clear();
        self.metrics = BpfMetrics::default();
    }
}
