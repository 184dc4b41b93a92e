//! `<UUID>.nmmeta` side records.
//!
//! A record either points at the authoritative copy of a profile stored
//! elsewhere (`loaded_path`, optionally through another backend named by
//! `shadowed_storage`) or marks the UUID as deleted (a tombstone, usually a
//! symlink to `/dev/null`).

use crate::errors::MetaError;
use crate::filename::SUFFIX_NMMETA;
use crate::fsutil::{
    SECURE_FILE_MODE, file_is_in_path, read_link_absolute, remove_file_if_exists,
};
use crate::keyfile::KeyFile;
use crate::permissions::{FileKind, PermissionValidator};
use crate::profile::uuid_is_normalized;
use log::{debug, info};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

const GROUP: &str = "nmmeta";
const KEY_UUID: &str = "uuid";
const KEY_LOADED_PATH: &str = "loaded-path";
const KEY_SHADOWED_STORAGE: &str = "shadowed-storage";

const UUID_LEN: usize = 36;
const TEMPORARY_MARKER: char = '~';

pub const TOMBSTONE_TARGET: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaRecord {
    pub full_path: PathBuf,
    pub uuid: String,
    pub loaded_path: Option<PathBuf>,
    pub shadowed_storage: Option<String>,
}

impl MetaRecord {
    pub fn is_tombstone(&self) -> bool {
        self.loaded_path.as_deref() == Some(Path::new(TOMBSTONE_TARGET))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetadataStore {
    validator: PermissionValidator,
}

fn invalid_input(message: impl Into<String>) -> MetaError {
    MetaError::InvalidInput {
        message: message.into(),
    }
}

impl MetadataStore {
    pub fn new(validator: PermissionValidator) -> Self {
        Self { validator }
    }

    /// `<dir>/<uuid>.nmmeta`, or `<dir>/<uuid>.nmmeta~` while being written.
    pub fn filename_for(dir: &Path, uuid: &str, temporary: bool) -> PathBuf {
        let mut name = format!("{uuid}{SUFFIX_NMMETA}");
        if temporary {
            name.push(TEMPORARY_MARKER);
        }
        dir.join(name)
    }

    /// Classifies a directory entry. Returns the embedded UUID and its length
    /// when the name is exactly `<normalized uuid>.nmmeta`.
    pub fn check_filename(filename: &str) -> Option<(&str, usize)> {
        let base = filename.rsplit('/').next().unwrap_or(filename);
        let uuid = base.strip_suffix(SUFFIX_NMMETA)?;
        if uuid.len() != UUID_LEN || !uuid_is_normalized(uuid) {
            return None;
        }
        Some((uuid, UUID_LEN))
    }

    pub fn read(&self, dir: &Path, filename: &str) -> Result<MetaRecord, MetaError> {
        let full_path = dir.join(filename);
        let not_found = || MetaError::NotFound {
            path: full_path.clone(),
        };

        let Some((uuid, _)) = Self::check_filename(filename) else {
            return Err(not_found());
        };
        if filename.contains('/') {
            return Err(not_found());
        }

        let meta = self
            .validator
            .validate(&full_path, FileKind::Meta)
            .map_err(|e| {
                debug!(
                    "event=nmmeta_ignored path={} reason={e}",
                    full_path.display()
                );
                not_found()
            })?;

        if meta.file_type().is_symlink() {
            let loaded_path = read_link_absolute(&full_path).map_err(|_| not_found())?;
            return Ok(MetaRecord {
                full_path: full_path.clone(),
                uuid: uuid.to_string(),
                loaded_path: Some(loaded_path),
                shadowed_storage: None,
            });
        }

        let raw = fs::read_to_string(&full_path).map_err(|_| not_found())?;
        let kf = KeyFile::parse(&raw).map_err(|e| {
            debug!(
                "event=nmmeta_ignored path={} reason={e}",
                full_path.display()
            );
            not_found()
        })?;

        // the recorded UUID must match the file name exactly, not just by prefix
        if kf.get_string(GROUP, KEY_UUID) != Some(uuid) {
            debug!(
                "event=nmmeta_ignored path={} reason=uuid_mismatch",
                full_path.display()
            );
            return Err(not_found());
        }

        let loaded_path = kf.get_string(GROUP, KEY_LOADED_PATH).map(|p| dir.join(p));
        let shadowed_storage = kf
            .get_string(GROUP, KEY_SHADOWED_STORAGE)
            .map(str::to_string);
        if loaded_path.is_none() && shadowed_storage.is_none() {
            // an empty record carries no information; same as no record
            return Err(not_found());
        }

        Ok(MetaRecord {
            full_path: full_path.clone(),
            uuid: uuid.to_string(),
            loaded_path,
            shadowed_storage,
        })
    }

    pub fn read_from_file(&self, full_path: &Path) -> Result<MetaRecord, MetaError> {
        let not_found = || MetaError::NotFound {
            path: full_path.to_path_buf(),
        };
        let dir = full_path.parent().ok_or_else(not_found)?;
        let filename = full_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(not_found)?;
        self.read(dir, filename)
    }

    /// Writes (or, with no `loaded_path`, deletes) the record for `uuid`.
    ///
    /// With `shadowed_storage` a small keyfile is written; otherwise the
    /// record is a symlink whose target is `loaded_path`. Both go through the
    /// `~` temporary and are renamed into place. On failure the error names
    /// the path the caller may need to clean up.
    pub fn write(
        &self,
        dir: &Path,
        uuid: &str,
        loaded_path: Option<&Path>,
        allow_relative: bool,
        shadowed_storage: Option<&str>,
    ) -> Result<PathBuf, MetaError> {
        if !dir.is_absolute() {
            return Err(invalid_input(format!(
                "directory must be absolute: {}",
                dir.display()
            )));
        }
        if !uuid_is_normalized(uuid) {
            return Err(invalid_input(format!("not a normalized UUID: {uuid:?}")));
        }
        if let Some(p) = loaded_path
            && !p.is_absolute()
        {
            return Err(invalid_input(format!(
                "loaded path must be absolute: {}",
                p.display()
            )));
        }
        if shadowed_storage.is_some() && loaded_path.is_none() {
            return Err(invalid_input("shadowed storage requires a loaded path"));
        }

        let tmp_path = Self::filename_for(dir, uuid, true);
        let full_path = Self::filename_for(dir, uuid, false);

        let _ = fs::remove_file(&tmp_path);

        let Some(loaded_path) = loaded_path else {
            return match remove_file_if_exists(&full_path) {
                Ok(removed) => {
                    if removed {
                        info!("event=nmmeta_removed path={}", full_path.display());
                    }
                    Ok(full_path)
                }
                Err(e) => Err(MetaError::Io {
                    path: full_path,
                    source: e,
                }),
            };
        };

        let stored: PathBuf = if allow_relative {
            match file_is_in_path(loaded_path, dir) {
                Some(name) => PathBuf::from(name),
                None => loaded_path.to_path_buf(),
            }
        } else {
            loaded_path.to_path_buf()
        };

        let staged = match shadowed_storage {
            Some(storage) => write_record_file(&tmp_path, uuid, &stored, storage),
            None => std::os::unix::fs::symlink(&stored, &tmp_path),
        };
        if let Err(e) = staged {
            let _ = fs::remove_file(&tmp_path);
            return Err(MetaError::Io {
                path: tmp_path,
                source: e,
            });
        }

        if let Err(e) = fs::rename(&tmp_path, &full_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(MetaError::Io {
                path: full_path,
                source: e,
            });
        }

        info!(
            "event=nmmeta_written path={} loaded_path={} shadowed_storage={}",
            full_path.display(),
            stored.display(),
            shadowed_storage.unwrap_or("-")
        );
        Ok(full_path)
    }
}

fn write_record_file(
    tmp_path: &Path,
    uuid: &str,
    loaded_path: &Path,
    shadowed_storage: &str,
) -> std::io::Result<()> {
    let mut kf = KeyFile::new();
    kf.set_string(GROUP, KEY_UUID, uuid);
    kf.set_string(GROUP, KEY_LOADED_PATH, loaded_path.to_string_lossy());
    kf.set_string(GROUP, KEY_SHADOWED_STORAGE, shadowed_storage);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(SECURE_FILE_MODE)
        .open(tmp_path)?;
    file.write_all(kf.to_data().as_bytes())?;
    file.sync_all()
}
