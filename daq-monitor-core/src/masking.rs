//! One-shot masking bootstrap (C3): derive the channel mask file from the
//! raw run's settings file before the pipeline starts accepting jobs.

use std::path::Path;

use tracing::info;

use crate::archive::{extract_single, is_compressed};
use crate::error::Result;
use crate::external::Masker;
use crate::paths::RunPaths;

const RUN_SETTINGS_NAME: &str = "Run_Settings.txt";

/// Locates `Run_Settings.txt` under the raw run folder, transparently
/// extracting it if only a `.tar.gz` form is present.
pub fn locate_run_settings(raw_run_folder: &Path, tmp_dir: &Path) -> Result<std::path::PathBuf> {
    let plain = raw_run_folder.join(RUN_SETTINGS_NAME);
    if plain.exists() {
        return Ok(plain);
    }
    let archived = raw_run_folder.join(format!("{RUN_SETTINGS_NAME}.tar.gz"));
    if archived.exists() && is_compressed(&archived) {
        return extract_single(&archived, tmp_dir, Some(RUN_SETTINGS_NAME));
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!(
            "{RUN_SETTINGS_NAME} not found (plain or .tar.gz) under {}",
            raw_run_folder.display()
        ),
    )
    .into())
}

/// Runs the masking tool once and installs `masked_channels.txt` under the
/// run output directory. Must be called before any worker starts picking
/// up jobs, since the builder stage depends on this file's path.
pub fn bootstrap_masking(
    raw_run_folder: &Path,
    paths: &RunPaths,
    masker: &dyn Masker,
) -> Result<std::path::PathBuf> {
    let settings = locate_run_settings(raw_run_folder, &paths.tmp)?;
    let output = paths.masked_channels();
    masker.derive_mask(&settings, &output)?;
    info!(output = %output.display(), "derived channel mask");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;

    struct FailingMasker;
    impl Masker for FailingMasker {
        fn derive_mask(&self, _run_settings: &Path, _output_path: &Path) -> Result<()> {
            Err(MonitorError::Config("boom".into()))
        }
    }

    struct OkMasker;
    impl Masker for OkMasker {
        fn derive_mask(&self, _run_settings: &Path, output_path: &Path) -> Result<()> {
            std::fs::write(output_path, b"mask")?;
            Ok(())
        }
    }

    #[test]
    fn bootstrap_fails_when_settings_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        let paths = RunPaths::new(dir.path().join("out"));
        paths.ensure_directories().unwrap();
        let err = bootstrap_masking(&raw, &paths, &OkMasker).unwrap_err();
        assert!(matches!(err, MonitorError::Io(_)));
    }

    #[test]
    fn bootstrap_propagates_masker_error() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::write(raw.join(RUN_SETTINGS_NAME), b"settings").unwrap();
        let paths = RunPaths::new(dir.path().join("out"));
        paths.ensure_directories().unwrap();
        let err = bootstrap_masking(&raw, &paths, &FailingMasker).unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }

    #[test]
    fn bootstrap_succeeds_with_plain_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::write(raw.join(RUN_SETTINGS_NAME), b"settings").unwrap();
        let paths = RunPaths::new(dir.path().join("out"));
        paths.ensure_directories().unwrap();
        let out = bootstrap_masking(&raw, &paths, &OkMasker).unwrap();
        assert!(out.exists());
    }
}
