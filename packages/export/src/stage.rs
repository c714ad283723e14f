//! Staged output.
//!
//! Writers produce their files inside a hidden temporary directory created
//! next to the destination (same filesystem, so the final move is a
//! rename). Nothing appears at the destination until [`Stage::commit`].

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::ExportError;

const STAGE_PREFIX: &str = ".geoharvest-export-";

/// A temporary directory holding files that will replace their
/// destinations on commit. Dropping an uncommitted stage discards it.
#[derive(Debug)]
pub struct Stage {
    dir: TempDir,
    dest_dir: PathBuf,
}

impl Stage {
    /// Creates a stage beside `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Write`] if the destination directory does not
    /// exist or a directory cannot be created in it.
    pub fn for_destination(dest: &Path) -> Result<Self, ExportError> {
        let dest_dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dest_dir.is_dir() {
            return Err(ExportError::write(
                dest,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("directory {} does not exist", dest_dir.display()),
                ),
            ));
        }
        let dir = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .tempdir_in(&dest_dir)
            .map_err(|e| ExportError::write(dest, e))?;
        Ok(Self { dir, dest_dir })
    }

    /// Path of a staged file.
    #[must_use]
    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    /// Moves every named staged file to the destination directory and
    /// returns the final paths.
    ///
    /// If a move fails, the files already moved are removed again so the
    /// destination never holds a partial set.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Write`] naming the file that could not be
    /// moved.
    pub fn commit(self, file_names: &[String]) -> Result<Vec<PathBuf>, ExportError> {
        let mut committed: Vec<PathBuf> = Vec::with_capacity(file_names.len());
        for name in file_names {
            let target = self.dest_dir.join(name);
            if let Err(e) = std::fs::rename(self.path(name), &target) {
                for done in &committed {
                    if let Err(cleanup) = std::fs::remove_file(done) {
                        log::warn!("Failed to roll back {}: {cleanup}", done.display());
                    }
                }
                return Err(ExportError::write(&target, e));
            }
            committed.push(target);
        }
        if let Err(e) = self.dir.close() {
            log::debug!("Failed to remove staging directory: {e}");
        }
        Ok(committed)
    }
}

/// File stem of `dest`, used to name sidecar files.
pub(crate) fn stem(dest: &Path) -> Result<String, ExportError> {
    dest.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| {
            ExportError::write(
                dest,
                io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_moves_files_and_removes_stage() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Stage::for_destination(&dir.path().join("out.fgb")).unwrap();
        std::fs::write(stage.path("out.fgb"), b"data").unwrap();

        let files = stage.commit(&["out.fgb".to_string()]).unwrap();
        assert_eq!(files, vec![dir.path().join("out.fgb")]);
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"data");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn dropped_stage_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stage = Stage::for_destination(&dir.path().join("out.shp")).unwrap();
            std::fs::write(stage.path("out.shp"), b"partial").unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_commit_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Stage::for_destination(&dir.path().join("out.shp")).unwrap();
        std::fs::write(stage.path("out.shp"), b"shp").unwrap();

        let err = stage
            .commit(&["out.shp".to_string(), "out.dbf".to_string()])
            .unwrap_err();
        assert!(matches!(err, ExportError::Write { .. }));
        assert!(!dir.path().join("out.shp").exists());
    }

    #[test]
    fn stem_requires_a_file_name() {
        assert_eq!(stem(Path::new("a/b/layer.shp")).unwrap(), "layer");
        assert!(stem(Path::new("/")).is_err());
    }
}
