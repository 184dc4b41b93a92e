use crate::config::RuntimeIdentity;
use crate::errors::PermissionError;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A profile record; symlinks are followed and must end at a regular file.
    Keyfile,
    /// An `.nmmeta` record; inspected without following symlinks.
    Meta,
}

/// Checks that a storage artifact is owned and moded safely before its
/// contents are trusted.
#[derive(Debug, Clone, Copy)]
pub struct PermissionValidator {
    runtime: RuntimeIdentity,
    skip_owner_check: bool,
}

impl PermissionValidator {
    pub fn new(runtime: RuntimeIdentity, skip_owner_check: bool) -> Self {
        Self {
            runtime,
            skip_owner_check,
        }
    }

    pub fn validate(&self, path: &Path, kind: FileKind) -> Result<Metadata, PermissionError> {
        let meta = match kind {
            FileKind::Keyfile => std::fs::metadata(path),
            FileKind::Meta => std::fs::symlink_metadata(path),
        }
        .map_err(|e| PermissionError::NotAccessible {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.validate_metadata(path, &meta, kind)?;
        Ok(meta)
    }

    pub fn validate_metadata(
        &self,
        path: &Path,
        meta: &Metadata,
        kind: FileKind,
    ) -> Result<(), PermissionError> {
        let ft = meta.file_type();
        match kind {
            FileKind::Keyfile => {
                if !ft.is_file() {
                    return Err(PermissionError::WrongFileType {
                        path: path.to_path_buf(),
                        detail: "file is not a regular file",
                    });
                }
            }
            FileKind::Meta => {
                if !ft.is_file() && !ft.is_symlink() {
                    return Err(PermissionError::WrongFileType {
                        path: path.to_path_buf(),
                        detail: "file is neither a symlink nor a regular file",
                    });
                }
            }
        }

        if self.skip_owner_check {
            return Ok(());
        }

        let uid = meta.uid();
        if uid != 0 && uid != self.runtime.uid {
            return Err(PermissionError::InsecureOwner {
                path: path.to_path_buf(),
                uid,
            });
        }
        if ft.is_file() && meta.mode() & 0o077 != 0 {
            return Err(PermissionError::InsecureMode {
                path: path.to_path_buf(),
                mode: meta.mode() & 0o7777,
            });
        }
        Ok(())
    }
}
