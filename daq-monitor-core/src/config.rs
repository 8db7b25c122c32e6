//! Layered configuration resolution (C2).
//!
//! The on-disk format is TOML with three sections (`monitoring`,
//! `eventbuilding`, `snapshot`), matching the original `configparser` INI
//! layout one-for-one at the section/key level. Grounded in
//! `scan/orchestration/config.rs`'s "struct-per-section with a manual
//! `Default` impl" style.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub output_parent: PathBuf,
    pub output_name: Option<String>,
    pub max_workers: usize,
    pub skip_dirty_dat: bool,
    pub binary_split_m: u64,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        MonitoringSection {
            output_parent: PathBuf::from("data"),
            output_name: None,
            max_workers: 10,
            skip_dirty_dat: false,
            binary_split_m: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBuildingSection {
    pub pedestals_file: Option<PathBuf>,
    pub mip_calibration_file: Option<PathBuf>,
    pub pedestals_lg_file: Option<PathBuf>,
    pub mip_calibration_lg_file: Option<PathBuf>,
    pub w_config: Option<String>,
    pub min_slabs_hit: u32,
    pub asu_version: u32,
    pub no_zero_suppress: bool,
    pub id_run: Option<i64>,
}

impl Default for EventBuildingSection {
    fn default() -> Self {
        EventBuildingSection {
            pedestals_file: None,
            mip_calibration_file: None,
            pedestals_lg_file: None,
            mip_calibration_lg_file: None,
            w_config: None,
            min_slabs_hit: 1,
            asu_version: 2,
            no_zero_suppress: false,
            id_run: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub after: Vec<u64>,
    pub every: u64,
    pub delete_previous: bool,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        SnapshotSection {
            after: Vec::new(),
            every: 10_000,
            delete_previous: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitoring: MonitoringSection,
    pub eventbuilding: EventBuildingSection,
    pub snapshot: SnapshotSection,
}

/// CLI-supplied overrides, applied after the file is loaded and before the
/// effective config is re-serialized. Mirrors the way the teacher's server
/// binary layers `clap` arguments over a loaded config in `main.rs`.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_workers: Option<usize>,
    pub output_parent: Option<PathBuf>,
    pub skip_dirty_dat: Option<bool>,
}

impl MonitorConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let text = fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            _ => MonitorConfig::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(w) = overrides.max_workers {
            self.monitoring.max_workers = w;
        }
        if let Some(ref p) = overrides.output_parent {
            self.monitoring.output_parent = p.clone();
        }
        if let Some(s) = overrides.skip_dirty_dat {
            self.monitoring.skip_dirty_dat = s;
        }
    }

    /// Derives the run identity (`id_run`) when absent, and `output_name`
    /// when absent, from the raw run folder name. Writes the result back
    /// onto `self` so re-serialization captures the derived value.
    pub fn resolve_identity(&mut self, raw_run_folder: &Path) {
        let name = raw_run_folder
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("run")
            .to_string();

        if self.monitoring.output_name.is_none() {
            self.monitoring.output_name = Some(name.clone());
        }

        if self.eventbuilding.id_run.is_none() {
            self.eventbuilding.id_run = Some(guess_id_run(&name, &self.monitoring.output_parent));
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (label, opt) in [
            ("pedestals_file", &self.eventbuilding.pedestals_file),
            (
                "mip_calibration_file",
                &self.eventbuilding.mip_calibration_file,
            ),
            ("pedestals_lg_file", &self.eventbuilding.pedestals_lg_file),
            (
                "mip_calibration_lg_file",
                &self.eventbuilding.mip_calibration_lg_file,
            ),
        ] {
            if let Some(p) = opt {
                if !p.exists() {
                    return Err(MonitorError::Config(format!(
                        "{label} does not exist: {}",
                        p.display()
                    )));
                }
            }
        }
        if self.monitoring.max_workers == 0 {
            return Err(MonitorError::Config("max_workers must be >= 1".into()));
        }
        Ok(())
    }

    pub fn write_effective(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

/// Derives a numeric run identity from the raw run folder name, in order:
/// (a) the digit run immediately after `run_` (case-insensitive); else
/// (b) the longest digit run of length >= 3 (ties broken by larger value);
/// else (c) the count of existing subdirectories of `output_parent`.
pub fn guess_id_run(name: &str, output_parent: &Path) -> i64 {
    let lower = name.to_ascii_lowercase();
    if let Some(idx) = lower.find("run_") {
        let rest = &name[idx + 4..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            if let Ok(v) = digits.parse::<i64>() {
                return v;
            }
        }
    }

    let mut best: Option<(usize, i64)> = None;
    let mut current = String::new();
    for ch in name.chars().chain(std::iter::once('\0')) {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            if current.len() >= 3 {
                if let Ok(v) = current.parse::<i64>() {
                    let len = current.len();
                    best = match best {
                        Some((blen, bval)) if blen > len || (blen == len && bval >= v) => {
                            Some((blen, bval))
                        }
                        _ => Some((len, v)),
                    };
                }
            }
            current.clear();
        }
    }
    if let Some((_, v)) = best {
        return v;
    }

    fs::read_dir(output_parent)
        .map(|rd| rd.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()).count() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_id_run_prefers_run_prefix() {
        assert_eq!(guess_id_run("run_482_20260101", Path::new("/nonexistent")), 482);
    }

    #[test]
    fn guess_id_run_falls_back_to_longest_digit_run() {
        assert_eq!(guess_id_run("foo-12-9981-bar", Path::new("/nonexistent")), 9981);
    }

    #[test]
    fn guess_id_run_falls_back_to_sibling_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        assert_eq!(guess_id_run("noruninfo", dir.path()), 2);
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = MonitorConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: MonitorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.monitoring.max_workers, cfg.monitoring.max_workers);
    }
}
