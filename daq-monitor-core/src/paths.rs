//! Output directory layout and the restart-classification step (C1).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{info, warn};

use crate::error::{MonitorError, Result};

/// The fixed set of subdirectories every run output directory carries.
pub const SUBDIRS: &[&str] = &["tmp", "converted", "build", "snapshots", ".times"];

/// Absolute paths derived once at startup and threaded through every stage.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub output_dir: PathBuf,
    pub tmp: PathBuf,
    pub converted: PathBuf,
    pub build: PathBuf,
    pub snapshots: PathBuf,
    pub times: PathBuf,
}

impl RunPaths {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        RunPaths {
            tmp: output_dir.join("tmp"),
            converted: output_dir.join("converted"),
            build: output_dir.join("build"),
            snapshots: output_dir.join("snapshots"),
            times: output_dir.join(".times"),
            output_dir,
        }
    }

    pub fn current_build(&self) -> PathBuf {
        self.output_dir.join("current_build.root")
    }

    pub fn monitoring_cfg(&self) -> PathBuf {
        self.output_dir.join("monitoring.cfg")
    }

    pub fn masked_channels(&self) -> PathBuf {
        self.output_dir.join("masked_channels.txt")
    }

    pub fn log_monitoring(&self) -> PathBuf {
        self.output_dir.join("log_monitoring.log")
    }

    pub fn get_snapshot_request(&self) -> PathBuf {
        self.output_dir.join("get_snapshot")
    }

    pub fn stop_monitoring(&self) -> PathBuf {
        self.output_dir.join("stop_monitoring")
    }

    pub fn suppress_idle_info(&self) -> PathBuf {
        self.output_dir.join("suppress_idle_info")
    }

    pub fn no_monitoring(&self) -> PathBuf {
        self.output_dir.join("no_monitoring")
    }

    pub fn full_run(&self) -> PathBuf {
        self.output_dir.join("full_run.root")
    }

    pub fn stopped_run(&self) -> PathBuf {
        self.output_dir.join("stopped_run.root")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;
        for sub in SUBDIRS {
            fs::create_dir_all(self.output_dir.join(sub))?;
        }
        Ok(())
    }
}

/// Result of classifying a possibly-preexisting output directory.
pub enum Classification {
    /// Output directory is new or contains only our own subdirectories; safe to proceed.
    Fresh,
    /// `full_run.root` already present; nothing to do.
    AlreadyDone,
    /// `no_monitoring` sentinel present; operator opted this run out.
    Skipped,
    /// A restartable in-progress run: rotate stale config/mask files and empty tmp.
    Restart,
}

/// Classifies an output directory per S4.1 and performs the restart
/// side effects (stale-file rotation, tmp cleanup) when applicable.
pub fn classify_and_prepare(paths: &RunPaths) -> Result<Classification> {
    if !paths.output_dir.exists() {
        return Ok(Classification::Fresh);
    }
    if is_empty_dir(&paths.output_dir)? {
        return Ok(Classification::Fresh);
    }
    if paths.full_run().exists() {
        return Ok(Classification::AlreadyDone);
    }
    if paths.no_monitoring().exists() {
        return Ok(Classification::Skipped);
    }
    if !paths.log_monitoring().exists() {
        return Err(MonitorError::WrongOutputDir(paths.output_dir.clone()));
    }

    rotate_stale_file(&paths.monitoring_cfg())?;
    rotate_stale_file(&paths.masked_channels())?;
    empty_dir(&paths.tmp)?;

    Ok(Classification::Restart)
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

fn rotate_stale_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let stamp = Local::now().format("%Y-%m-%d-%H%M%S");
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let renamed = if ext.is_empty() {
        path.with_file_name(format!("{stem}_{stamp}"))
    } else {
        path.with_file_name(format!("{stem}_{stamp}.{ext}"))
    };
    fs::rename(path, &renamed)?;
    info!(from = %path.display(), to = %renamed.display(), "rotated stale file on restart");
    Ok(())
}

fn empty_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to clear stale tmp entry");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_directories_creates_the_fixed_subdir_set() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path().join("run_0042"));
        paths.ensure_directories().unwrap();
        for sub in SUBDIRS {
            assert!(paths.output_dir.join(sub).is_dir());
        }
    }

    #[test]
    fn classify_fresh_when_output_dir_absent_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = RunPaths::new(dir.path().join("does_not_exist"));
        assert!(matches!(classify_and_prepare(&missing).unwrap(), Classification::Fresh));

        let empty = RunPaths::new(dir.path().join("empty_one"));
        fs::create_dir_all(&empty.output_dir).unwrap();
        assert!(matches!(classify_and_prepare(&empty).unwrap(), Classification::Fresh));
    }

    #[test]
    fn classify_already_done_when_full_run_present() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        fs::write(paths.full_run(), b"done").unwrap();
        assert!(matches!(
            classify_and_prepare(&paths).unwrap(),
            Classification::AlreadyDone
        ));
    }

    #[test]
    fn classify_skipped_when_no_monitoring_present() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        fs::write(paths.no_monitoring(), b"").unwrap();
        assert!(matches!(classify_and_prepare(&paths).unwrap(), Classification::Skipped));
    }

    #[test]
    fn classify_wrong_output_dir_when_logfile_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        // Non-empty but no `log_monitoring.log` and no terminal markers.
        fs::write(paths.output_dir.join("some_other_file"), b"x").unwrap();
        assert!(matches!(
            classify_and_prepare(&paths),
            Err(MonitorError::WrongOutputDir(_))
        ));
    }

    #[test]
    fn classify_restart_rotates_stale_config_and_empties_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        fs::write(paths.log_monitoring(), b"previous run log").unwrap();
        fs::write(paths.monitoring_cfg(), b"stale config").unwrap();
        fs::create_dir_all(&paths.tmp).unwrap();
        fs::write(paths.tmp.join("leftover.bin"), b"x").unwrap();

        assert!(matches!(classify_and_prepare(&paths).unwrap(), Classification::Restart));

        assert!(!paths.monitoring_cfg().exists());
        assert!(is_empty_dir(&paths.tmp).unwrap());
        let rotated: Vec<_> = fs::read_dir(&paths.output_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("monitoring_") && n.ends_with(".cfg"))
            .collect();
        assert_eq!(rotated.len(), 1);
    }
}
