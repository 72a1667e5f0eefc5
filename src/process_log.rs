use std::fmt::Display;
use std::time::{Duration, Instant};
use sysinfo::Disks;
use uuid::Uuid;

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");

/// Keys owned by the logger itself; metadata may not shadow them.
const PROTECTED_KEYS: [&str; 10] = [
    "service",
    "process_name",
    "process_id",
    "run_id",
    "status",
    "duration",
    "error_type",
    "total_disk_bytes",
    "used_disk_bytes",
    "free_disk_bytes",
];

/// Start / complete / failed log lines for one named unit of work, carrying a
/// run id, its duration and free-form metadata.
#[derive(Debug)]
pub struct ProcessLog {
    process_name: &'static str,
    run_id: Uuid,
    started: Instant,
    metadata: Vec<(String, String)>,
}

impl ProcessLog {
    pub fn new(process_name: &'static str) -> Self {
        Self {
            process_name,
            run_id: Uuid::new_v4(),
            started: Instant::now(),
            metadata: Vec::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Display) -> Self {
        self.add_metadata(key, value);
        self
    }

    pub fn add_metadata(&mut self, key: &str, value: impl Display) {
        if PROTECTED_KEYS.contains(&key) {
            tracing::debug!(key, process = self.process_name, "ignoring protected metadata key");
            return;
        }
        let value = value.to_string();
        match self.metadata.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.metadata.push((key.to_string(), value)),
        }
    }

    pub fn start(&mut self) {
        self.run_id = Uuid::new_v4();
        self.started = Instant::now();
        let disk = root_disk_usage();
        tracing::info!(
            service = SERVICE_NAME,
            process_name = self.process_name,
            process_id = std::process::id(),
            run_id = %self.run_id,
            status = "started",
            total_disk_bytes = disk.total,
            used_disk_bytes = disk.used,
            free_disk_bytes = disk.free,
            metadata = %self.render_metadata(),
            "process"
        );
    }

    pub fn complete(&self) -> Duration {
        let elapsed = self.started.elapsed();
        let disk = root_disk_usage();
        tracing::info!(
            service = SERVICE_NAME,
            process_name = self.process_name,
            process_id = std::process::id(),
            run_id = %self.run_id,
            status = "complete",
            duration_secs = elapsed.as_secs_f64(),
            total_disk_bytes = disk.total,
            used_disk_bytes = disk.used,
            free_disk_bytes = disk.free,
            metadata = %self.render_metadata(),
            "process"
        );
        elapsed
    }

    pub fn fail(&self, error_type: &str, error: &dyn Display) -> Duration {
        let elapsed = self.started.elapsed();
        tracing::error!(
            service = SERVICE_NAME,
            process_name = self.process_name,
            process_id = std::process::id(),
            run_id = %self.run_id,
            status = "failed",
            duration_secs = elapsed.as_secs_f64(),
            error_type,
            error = %error,
            metadata = %self.render_metadata(),
            "process"
        );
        elapsed
    }

    fn render_metadata(&self) -> String {
        self.metadata
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct DiskUsage {
    total: u64,
    used: u64,
    free: u64,
}

fn root_disk_usage() -> DiskUsage {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == std::path::Path::new("/"))
        .map(|disk| DiskUsage {
            total: disk.total_space(),
            used: disk.total_space().saturating_sub(disk.available_space()),
            free: disk.available_space(),
        })
        .unwrap_or_default()
}
