//! Purpose: Assemble node status snapshots from the registry and system probes.
//! Exports: `StatusSnapshot`, `NodeSummary`, `EnvProcess`, `ResourceEntry`, `SystemProbe`, `ProcProbe`.
//! Role: Shared ground truth for the status endpoint, the CLI, and the reporter.
//! Invariants: Snapshots carry names and type tags only; secret values and tokens never appear.

use std::collections::BTreeMap;
use std::process::Command;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::environment::Environment;
use crate::core::registry::{ActiveCall, ENV_RESOURCE_TYPE, Registry};

pub const SECRET_RESOURCE_TYPE: &str = "secret";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub ips: Vec<String>,
    pub default_env: String,
    pub access: String,
    pub workdir: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
    pub utilization_pct: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvProcess {
    pub pid: u32,
    pub node_name: String,
    pub node_ip: Option<String>,
    pub env_memory_usage: Option<u64>,
    pub env_gpu_usage: Vec<GpuDevice>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub name: String,
    pub resource_type: String,
    pub active_function_calls: Vec<ActiveCall>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub server_pid: u32,
    pub tether_version: String,
    pub time: String,
    pub node_config: NodeSummary,
    pub installed_envs: BTreeMap<String, String>,
    pub env_servlet_processes: BTreeMap<String, EnvProcess>,
    pub env_resource_mapping: BTreeMap<String, Vec<ResourceEntry>>,
}

pub trait SystemProbe: Send + Sync {
    /// Resident memory of `pid`, in bytes.
    fn memory_rss_bytes(&self, pid: u32) -> Option<u64>;

    fn gpus(&self) -> Vec<GpuDevice>;
}

/// Reads `/proc` for memory and asks `nvidia-smi` for devices; absent sources yield nothing.
pub struct ProcProbe;

impl SystemProbe for ProcProbe {
    fn memory_rss_bytes(&self, pid: u32) -> Option<u64> {
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        parse_vm_rss(&status)
    }

    fn gpus(&self) -> Vec<GpuDevice> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,memory.used,memory.total,utilization.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output();
        match output {
            Ok(output) if output.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
            }
            _ => Vec::new(),
        }
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}

fn parse_nvidia_smi(csv: &str) -> Vec<GpuDevice> {
    csv.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [index, name, used, total, util] = fields.as_slice() else {
                return None;
            };
            Some(GpuDevice {
                index: index.parse().ok()?,
                name: (*name).to_string(),
                memory_used_mib: used.parse().ok()?,
                memory_total_mib: total.parse().ok()?,
                utilization_pct: util.parse().ok()?,
            })
        })
        .collect()
}

pub fn snapshot(
    registry: &Registry,
    node: &NodeSummary,
    probe: &dyn SystemProbe,
) -> StatusSnapshot {
    let pid = std::process::id();
    let memory = probe.memory_rss_bytes(pid);
    let node_ip = node.ips.first().cloned();
    let mut devices: Option<Vec<GpuDevice>> = None;

    let mut processes = BTreeMap::new();
    let mut mapping = BTreeMap::new();
    for partition in registry.partitions() {
        let objects = partition.objects();
        let wants_gpus = objects
            .get(partition.name())
            .filter(|object| object.resource_type == ENV_RESOURCE_TYPE)
            .and_then(|object| Environment::from_value(object.value.clone()).ok())
            .and_then(|env| env.compute.gpus)
            .filter(|gpus| *gpus > 0);
        let gpu_usage = match wants_gpus {
            Some(count) => devices
                .get_or_insert_with(|| probe.gpus())
                .iter()
                .take(count as usize)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        processes.insert(
            partition.name().to_string(),
            EnvProcess {
                pid,
                node_name: node.name.clone(),
                node_ip: node_ip.clone(),
                env_memory_usage: memory,
                env_gpu_usage: gpu_usage,
            },
        );

        let mut entries: Vec<ResourceEntry> = objects
            .iter()
            .map(|(key, object)| ResourceEntry {
                name: key.clone(),
                resource_type: object.resource_type.clone(),
                active_function_calls: partition.active_calls(key),
            })
            .collect();
        entries.extend(partition.secret_names().into_iter().map(|name| ResourceEntry {
            name,
            resource_type: SECRET_RESOURCE_TYPE.to_string(),
            active_function_calls: Vec::new(),
        }));
        mapping.insert(partition.name().to_string(), entries);
    }

    StatusSnapshot {
        server_pid: pid,
        tether_version: env!("CARGO_PKG_VERSION").to_string(),
        time: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
        node_config: node.clone(),
        installed_envs: registry.installed_envs(),
        env_servlet_processes: processes,
        env_resource_mapping: mapping,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        GpuDevice, NodeSummary, SECRET_RESOURCE_TYPE, SystemProbe, parse_nvidia_smi,
        parse_vm_rss, snapshot,
    };
    use crate::core::environment::{Compute, Environment, Secret};
    use crate::core::registry::{ENV_RESOURCE_TYPE, OBJECT_RESOURCE_TYPE, Registry};
    use serde_json::json;
    use std::collections::BTreeMap;

    struct FixedProbe;

    impl SystemProbe for FixedProbe {
        fn memory_rss_bytes(&self, _pid: u32) -> Option<u64> {
            Some(4096)
        }

        fn gpus(&self) -> Vec<GpuDevice> {
            vec![
                GpuDevice {
                    index: 0,
                    name: "A100".to_string(),
                    memory_used_mib: 10,
                    memory_total_mib: 40960,
                    utilization_pct: 3,
                },
                GpuDevice {
                    index: 1,
                    name: "A100".to_string(),
                    memory_used_mib: 0,
                    memory_total_mib: 40960,
                    utilization_pct: 0,
                },
            ]
        }
    }

    #[test]
    fn parses_proc_status_rss() {
        let status = "Name:\ttether\nVmRSS:\t   2048 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[test]
    fn parses_nvidia_smi_rows() {
        let rows = parse_nvidia_smi("0, NVIDIA A10G, 512, 23028, 7\ngarbage\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "NVIDIA A10G");
        assert_eq!(rows[0].memory_total_mib, 23028);
    }

    #[test]
    fn snapshot_lists_resources_without_secret_values() {
        let registry = Registry::new();
        let env = Environment::new().named("gpu_env").with_compute(Compute {
            gpus: Some(1),
            ..Compute::default()
        });
        let value = serde_json::to_value(&env).expect("encode");
        registry.put("gpu_env", value, ENV_RESOURCE_TYPE, "gpu_env");
        registry.put("model", json!({"w": 1}), OBJECT_RESOURCE_TYPE, "gpu_env");
        let mut values = BTreeMap::new();
        values.insert("HF_TOKEN".to_string(), "hf_very_secret".to_string());
        registry.put_secret("gpu_env", Secret::new("huggingface", values));
        registry.put("plain", json!(1), OBJECT_RESOURCE_TYPE, "cpu_env");

        let node = NodeSummary {
            name: "node-a".to_string(),
            ips: vec!["10.1.1.1".to_string()],
            default_env: "base".to_string(),
            access: "read_write".to_string(),
            workdir: "/tmp/w".to_string(),
        };
        let snap = snapshot(&registry, &node, &FixedProbe);

        let gpu = &snap.env_servlet_processes["gpu_env"];
        assert_eq!(gpu.env_gpu_usage.len(), 1);
        assert_eq!(gpu.env_memory_usage, Some(4096));
        assert_eq!(gpu.node_ip.as_deref(), Some("10.1.1.1"));
        assert!(snap.env_servlet_processes["cpu_env"].env_gpu_usage.is_empty());

        let entries = &snap.env_resource_mapping["gpu_env"];
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["gpu_env", "model", "huggingface"]);
        assert_eq!(entries[2].resource_type, SECRET_RESOURCE_TYPE);

        let text = serde_json::to_string(&snap).expect("encode");
        assert!(!text.contains("hf_very_secret"));
        assert_eq!(snap.server_pid, std::process::id());
    }
}
