use crate::adapters::outbound::SimulatedKernelSettings;
use crate::common::DomainResult;
use crate::domains::primenet::{CoordinatorSettings, Credentials};
use crate::domains::resources::{
    HardwareProfile, ResourceSchedule, ScheduleWindow, TimeOfDay, WindowLimits, WorkerDemand, MIB,
};
use crate::domains::supervisor::SupervisorSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hardware: HardwareConfig,
    pub schedule: ScheduleConfig,
    pub supervisor: SupervisorConfig,
    pub primenet: PrimeNetConfig,
    pub storage: StorageConfig,
    pub journal: JournalConfig,
    pub kernel: KernelConfig,
}

/// Overrides for detected hardware plus what the operator wants to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub physical_cores: Option<usize>,
    pub threads_per_core: Option<usize>,
    pub l2_cache_kb: Option<u64>,
    pub l3_cache_kb: Option<u64>,
    pub total_memory_mb: Option<u64>,
    /// Defaults to one worker per physical core.
    pub workers: Option<usize>,
    pub memory_per_worker_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub label: String,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub memory_ceiling_mb: u64,
    pub max_workers: usize,
    #[serde(default)]
    pub allow_hyperthreading: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    pub memory_ceiling_mb: u64,
    pub max_workers: usize,
    #[serde(default)]
    pub allow_hyperthreading: bool,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub min_memory_per_worker_mb: u64,
    pub windows: Vec<WindowConfig>,
    pub emergency: Option<EmergencyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub tick_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats: u32,
    pub grace_period_secs: u64,
    pub checkpoint_interval_secs: u64,
    pub max_retries: u32,
    /// Faulted slots return to service after this long; `None` waits for the operator.
    pub auto_reset_secs: Option<u64>,
    pub high_memory_threshold_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimeNetConfig {
    pub endpoint: String,
    pub user_id: String,
    pub computer_id: String,
    pub api_key: Option<String>,
    pub proxy: Option<String>,
    pub request_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub failure_threshold: u32,
    pub renew_ahead_hours: u64,
    pub low_water_mark: usize,
    pub pull_batch: usize,
    pub sync_interval_secs: u64,
    pub worktodo_path: Option<PathBuf>,
    /// Start with communication switched off.
    pub manual_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub snapshot_frequency: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub path: Option<PathBuf>,
    pub echo_console: bool,
    pub buffer_capacity: usize,
}

/// Settings for the built-in compute kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Iterations between safe points.
    pub batch: u64,
    pub throttle_ms: Option<u64>,
    pub pin_threads: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            batch: 10_000,
            throttle_ms: None,
            pin_threads: true,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            physical_cores: None,
            threads_per_core: None,
            l2_cache_kb: None,
            l3_cache_kb: None,
            total_memory_mb: None,
            workers: None,
            memory_per_worker_mb: 1024,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            min_memory_per_worker_mb: 128,
            windows: vec![
                WindowConfig {
                    label: "day".to_string(),
                    start: TimeOfDay::at(7, 30),
                    end: TimeOfDay::at(23, 30),
                    memory_ceiling_mb: 2048,
                    max_workers: 64,
                    allow_hyperthreading: false,
                },
                WindowConfig {
                    label: "night".to_string(),
                    start: TimeOfDay::at(23, 30),
                    end: TimeOfDay::at(7, 30),
                    memory_ceiling_mb: 8192,
                    max_workers: 64,
                    allow_hyperthreading: false,
                },
            ],
            emergency: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            grace_period_secs: 60,
            checkpoint_interval_secs: 30 * 60,
            max_retries: 3,
            auto_reset_secs: Some(300),
            high_memory_threshold_mb: 256,
        }
    }
}

impl Default for PrimeNetConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            user_id: "ANONYMOUS".to_string(),
            computer_id: "primenet-client".to_string(),
            api_key: None,
            proxy: None,
            request_timeout_secs: 30,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            failure_threshold: 3,
            renew_ahead_hours: 24,
            low_water_mark: 2,
            pull_batch: 4,
            sync_interval_secs: 60,
            worktodo_path: Some(PathBuf::from("worktodo.txt")),
            manual_mode: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            snapshot_frequency: 100,
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("results.txt")),
            echo_console: true,
            buffer_capacity: 1024,
        }
    }
}

impl Config {
    /// Defaults, then the file (if any), then `PRIMENET__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path.to_path_buf()).required(true));
        }
        let config: Config = builder
            .add_source(::config::Environment::with_prefix("PRIMENET").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.schedule().context("invalid schedule")?;
        if self.supervisor.tick_ms == 0 {
            anyhow::bail!("supervisor.tick_ms must be positive");
        }
        if self.primenet.sync_interval_secs == 0 {
            anyhow::bail!("primenet.sync_interval_secs must be positive");
        }
        Ok(())
    }

    pub fn hardware_profile(&self) -> HardwareProfile {
        let detected = HardwareProfile::detect();
        let hw = &self.hardware;
        let mut profile = HardwareProfile::new(
            hw.physical_cores.unwrap_or(detected.physical_cores),
            hw.threads_per_core.unwrap_or(detected.threads_per_core),
        );
        if let Some(kb) = hw.l2_cache_kb {
            profile.l2_cache_kb = kb;
        }
        if let Some(kb) = hw.l3_cache_kb {
            profile.l3_cache_kb = kb;
        }
        if let Some(mb) = hw.total_memory_mb {
            profile.total_memory_bytes = mb * MIB;
        }
        profile
    }

    pub fn demand(&self, hardware: &HardwareProfile) -> WorkerDemand {
        let workers = self.hardware.workers.unwrap_or(hardware.physical_cores);
        WorkerDemand::uniform(workers, self.hardware.memory_per_worker_mb * MIB)
    }

    pub fn schedule(&self) -> DomainResult<ResourceSchedule> {
        let windows = self
            .schedule
            .windows
            .iter()
            .map(|w| ScheduleWindow {
                label: w.label.clone(),
                start: w.start,
                end: w.end,
                limits: WindowLimits {
                    memory_ceiling_bytes: w.memory_ceiling_mb * MIB,
                    max_workers: w.max_workers,
                    allow_hyperthreading: w.allow_hyperthreading,
                },
            })
            .collect();
        let mut schedule = ResourceSchedule::new(windows, self.schedule.min_memory_per_worker_mb * MIB)?;
        if let Some(e) = &self.schedule.emergency {
            schedule = schedule.with_emergency(WindowLimits {
                memory_ceiling_bytes: e.memory_ceiling_mb * MIB,
                max_workers: e.max_workers,
                allow_hyperthreading: e.allow_hyperthreading,
            });
            schedule.emergency_active = e.active;
        }
        Ok(schedule)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let s = &self.supervisor;
        SupervisorSettings {
            heartbeat_interval: chrono::Duration::seconds(s.heartbeat_interval_secs as i64),
            missed_heartbeats: s.missed_heartbeats.max(1),
            grace_period: chrono::Duration::seconds(s.grace_period_secs as i64),
            checkpoint_interval: chrono::Duration::seconds(s.checkpoint_interval_secs as i64),
            high_memory_threshold: s.high_memory_threshold_mb * MIB,
            auto_reset_after: s.auto_reset_secs.map(|secs| chrono::Duration::seconds(secs as i64)),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        let p = &self.primenet;
        CoordinatorSettings {
            request_timeout: std::time::Duration::from_secs(p.request_timeout_secs.max(1)),
            backoff_base: chrono::Duration::seconds(p.backoff_base_secs as i64),
            backoff_max: chrono::Duration::seconds(p.backoff_max_secs as i64),
            failure_threshold: p.failure_threshold.max(1),
            renew_ahead: chrono::Duration::hours(p.renew_ahead_hours as i64),
            low_water_mark: p.low_water_mark,
            pull_batch: p.pull_batch,
        }
    }

    pub fn kernel_settings(&self) -> SimulatedKernelSettings {
        SimulatedKernelSettings {
            batch: self.kernel.batch.max(1),
            throttle: self.kernel.throttle_ms.map(std::time::Duration::from_millis),
            pin_threads: self.kernel.pin_threads,
            corrupt_diagnostics: false,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user_id: self.primenet.user_id.clone(),
            computer_id: self.primenet.computer_id.clone(),
            api_key: self.primenet.api_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let schedule = config.schedule().unwrap();
        assert_eq!(schedule.windows.len(), 2);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [hardware]
            physical_cores = 4
            threads_per_core = 1
            workers = 3

            [primenet]
            endpoint = "https://example.invalid"
            manual_mode = true

            [[schedule.windows]]
            label = "all-day"
            start = "00:00"
            end = "00:00"
            memory_ceiling_mb = 8192
            max_workers = 4
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        let hw = config.hardware_profile();
        assert_eq!(hw.physical_cores, 4);
        assert_eq!(config.demand(&hw).workers(), 3);
        assert!(config.primenet.manual_mode);
        assert_eq!(config.supervisor.max_retries, 3);
        assert_eq!(config.storage.snapshot_frequency, 100);
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        let mut config = Config::default();
        config.schedule.windows[0].end = TimeOfDay::new(23, 45).unwrap();
        assert!(config.validate().is_err());
    }
}
