//! Node capability descriptors and the job/node matching predicate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComputeApi {
    Cuda,
    Rocm,
    Vulkan,
    Metal,
    OpenCl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub vendor: String,
    pub model: String,
    pub vram_mb: u64,
    pub compute_apis: HashSet<ComputeApi>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDescriptor {
    pub cores: u32,
    pub threads: u32,
    pub architecture: String,
    pub features: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDescriptor {
    pub total_mb: u64,
    pub available_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Hdd,
    Ssd,
    Nvme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub total_gb: u64,
    pub available_gb: u64,
    pub storage_type: StorageType,
}

/// Immutable per-connection description of a node's hardware and software.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub gpus: Vec<GpuDescriptor>,
    pub cpu: CpuDescriptor,
    pub memory: MemoryDescriptor,
    pub storage: StorageDescriptor,
    pub docker_available: bool,
    pub mcp_adapters: HashSet<String>,
}

/// Requirements attached to a submitted job; `None` fields are unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequirements {
    #[serde(default)]
    pub min_gpu_count: u32,
    #[serde(default)]
    pub min_vram_mb: u64,
    #[serde(default)]
    pub required_compute_apis: HashSet<ComputeApi>,
    #[serde(default)]
    pub preferred_gpu_vendor: Option<String>,
    #[serde(default)]
    pub min_cpu_cores: u32,
    #[serde(default)]
    pub min_cpu_threads: u32,
    #[serde(default)]
    pub required_cpu_features: HashSet<String>,
    #[serde(default)]
    pub min_memory_mb: u64,
    #[serde(default)]
    pub min_storage_gb: u64,
    #[serde(default)]
    pub min_storage_type: Option<StorageType>,
    #[serde(default)]
    pub mcp_adapter: Option<String>,
    #[serde(default)]
    pub max_cost_cents: u64,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl JobRequirements {
    /// Component-by-component match against a candidate node's capabilities.
    /// GPU vendor preference is a scoring hint only, never a hard filter.
    pub fn matches(&self, caps: &CapabilityDescriptor) -> bool {
        if self.min_gpu_count > 0 {
            let matching_gpus = caps
                .gpus
                .iter()
                .filter(|gpu| {
                    gpu.vram_mb >= self.min_vram_mb
                        && self
                            .required_compute_apis
                            .iter()
                            .all(|api| gpu.compute_apis.contains(api))
                })
                .count() as u32;
            if matching_gpus < self.min_gpu_count {
                return false;
            }
        }

        if caps.cpu.cores < self.min_cpu_cores || caps.cpu.threads < self.min_cpu_threads {
            return false;
        }
        if !self
            .required_cpu_features
            .iter()
            .all(|f| caps.cpu.features.contains(f))
        {
            return false;
        }

        if caps.memory.available_mb < self.min_memory_mb {
            return false;
        }

        if caps.storage.available_gb < self.min_storage_gb {
            return false;
        }
        if let Some(min_type) = self.min_storage_type {
            if caps.storage.storage_type < min_type {
                return false;
            }
        }

        match &self.mcp_adapter {
            Some(adapter) => caps.mcp_adapters.contains(adapter) || caps.docker_available,
            None => true,
        }
    }

    /// Scoring hint in [0, 1]: 1.0 if the node's primary GPU vendor matches the
    /// preference (or none was requested), 0.0 otherwise.
    pub fn vendor_preference_score(&self, caps: &CapabilityDescriptor) -> f64 {
        match &self.preferred_gpu_vendor {
            None => 1.0,
            Some(pref) => {
                if caps.gpus.iter().any(|g| &g.vendor == pref) {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_caps() -> CapabilityDescriptor {
        CapabilityDescriptor {
            gpus: vec![GpuDescriptor {
                vendor: "nvidia".into(),
                model: "rtx4090".into(),
                vram_mb: 24_000,
                compute_apis: HashSet::from([ComputeApi::Cuda]),
            }],
            cpu: CpuDescriptor {
                cores: 16,
                threads: 32,
                architecture: "x86_64".into(),
                features: HashSet::from(["avx2".to_string()]),
            },
            memory: MemoryDescriptor {
                total_mb: 65_536,
                available_mb: 32_768,
            },
            storage: StorageDescriptor {
                total_gb: 2000,
                available_gb: 900,
                storage_type: StorageType::Nvme,
            },
            docker_available: true,
            mcp_adapters: HashSet::from(["sd-xl".to_string()]),
        }
    }

    #[test]
    fn matches_when_unconstrained() {
        let req = JobRequirements::default();
        assert!(req.matches(&sample_caps()));
    }

    #[test]
    fn rejects_insufficient_vram() {
        let req = JobRequirements {
            min_gpu_count: 1,
            min_vram_mb: 48_000,
            ..Default::default()
        };
        assert!(!req.matches(&sample_caps()));
    }

    #[test]
    fn adapter_falls_back_to_docker() {
        let req = JobRequirements {
            mcp_adapter: Some("unknown-adapter".into()),
            ..Default::default()
        };
        assert!(req.matches(&sample_caps()));
    }

    #[test]
    fn storage_type_ordering_enforced() {
        let req = JobRequirements {
            min_storage_type: Some(StorageType::Nvme),
            ..Default::default()
        };
        assert!(req.matches(&sample_caps()));

        let mut caps = sample_caps();
        caps.storage.storage_type = StorageType::Hdd;
        assert!(!req.matches(&caps));
    }
}
