//! Transparent `.tar.gz` handling shared by the scanner, masking bootstrap,
//! and converter stage, all of which may be handed either a bare raw file
//! or its compressed form.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::Result;

/// True if `path` carries a `.tar.gz` (or `.tgz`) extension.
pub fn is_compressed(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Strips a trailing `.tar.gz`/`.tgz` suffix, leaving the logical raw name.
pub fn strip_compressed_suffix(path: &Path) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let stripped = name
        .strip_suffix(".tar.gz")
        .or_else(|| name.strip_suffix(".tgz"))
        .unwrap_or(name);
    path.with_file_name(stripped)
}

/// Extracts a `.tar.gz` archive's contents into `dest_dir`, returning the
/// path of the single extracted file matching `expected_name` if given,
/// else the first regular file found.
pub fn extract_single(
    archive_path: &Path,
    dest_dir: &Path,
    expected_name: Option<&str>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)?;
    let file = File::open(archive_path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    let mut found: Option<PathBuf> = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let file_name = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        if let Some(expected) = expected_name {
            if file_name != expected {
                continue;
            }
        }
        let out_path = dest_dir.join(&file_name);
        entry.unpack(&out_path)?;
        found = Some(out_path);
        if expected_name.is_some() {
            break;
        }
    }
    found.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no matching entry extracted from {}", archive_path.display()),
        )
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_compressed_suffixes() {
        assert!(is_compressed(Path::new("Run_Settings.txt.tar.gz")));
        assert!(is_compressed(Path::new("foo.tgz")));
        assert!(!is_compressed(Path::new("foo.dat_0001")));
    }

    #[test]
    fn strips_suffix_back_to_logical_name() {
        assert_eq!(
            strip_compressed_suffix(Path::new("/a/foo.dat_0001.tar.gz")),
            PathBuf::from("/a/foo.dat_0001")
        );
    }
}
