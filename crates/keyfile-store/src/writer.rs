use crate::bridge::ExternalFormatBridge;
use crate::config::{RuntimeIdentity, StorageConfig};
use crate::errors::{SchemaError, WriteError};
use crate::filename::FilenameAllocator;
use crate::fsutil::{
    SECURE_FILE_MODE, ensure_dir, file_is_in_path, file_set_contents, remove_file_if_exists,
    sha256_hex,
};
use crate::keyfile::KeyFile;
use crate::profile::{KEY_ID, KEY_UUID, Profile, SETTING_CONNECTION};
use crate::schema::{KeyfileSchema, ParseContext, ProfileSchema};
use crate::serialize::{Bookkeeping, serialize_profile};
use crate::verify::verify;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Where a profile may be stored.
pub struct Placement<'a> {
    pub keyfile_dir: &'a Path,
    /// Base for resolving relative paths when re-reading.
    pub profile_dir: &'a Path,
    /// Current location when updating a stored profile.
    pub existing_path: Option<&'a Path>,
    /// The existing file belongs to someone else; never reuse or unlink it.
    pub existing_path_read_only: bool,
    pub force_rename: bool,
    pub with_extension: bool,
    pub reject: Option<&'a dyn Fn(&Path) -> bool>,
}

impl<'a> Placement<'a> {
    pub fn new(keyfile_dir: &'a Path) -> Self {
        Self {
            keyfile_dir,
            profile_dir: keyfile_dir,
            existing_path: None,
            existing_path_read_only: false,
            force_rename: false,
            with_extension: false,
            reject: None,
        }
    }

    pub fn from_config(cfg: &'a StorageConfig) -> Self {
        Self {
            profile_dir: cfg.profile_dir(),
            with_extension: cfg.with_extension,
            ..Self::new(&cfg.keyfile_dir)
        }
    }

    fn must_rename(&self) -> bool {
        self.force_rename
            || self.existing_path_read_only
            || self
                .existing_path
                .is_some_and(|p| file_is_in_path(p, self.keyfile_dir).is_none())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteFlags {
    pub generated: bool,
    pub volatile: bool,
    pub external: bool,
}

/// The profile shadows a copy held by another storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shadow {
    pub storage: String,
    pub owned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub flags: WriteFlags,
    pub shadow: Option<Shadow>,
    /// chown target for every committed file; `None` keeps the process ids.
    pub owner: Option<RuntimeIdentity>,
    /// Re-read what was written and compare it with the input.
    pub reread: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub reread: Option<Profile>,
    pub reread_same: Option<bool>,
    pub content_sha256: String,
}

pub struct ProfileWriter {
    schema: Box<dyn ProfileSchema + Send + Sync>,
    bridge: Option<ExternalFormatBridge>,
}

impl Default for ProfileWriter {
    fn default() -> Self {
        Self::new(Box::new(KeyfileSchema))
    }
}

impl std::fmt::Debug for ProfileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileWriter")
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `data` with mode 0600 and hands it to `owner`. A file that can't
/// be chowned is removed again.
fn commit_file(path: &Path, data: &[u8], owner: Option<RuntimeIdentity>) -> Result<(), WriteError> {
    file_set_contents(path, data, SECURE_FILE_MODE).map_err(io_error(path))?;

    if let Some(owner) = owner
        && let Err(e) = std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
    {
        if let Err(rm) = std::fs::remove_file(path) {
            warn!(
                "event=chown_rollback_failed path={} err={rm}",
                path.display()
            );
        }
        return Err(WriteError::OwnershipFailed {
            path: path.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

impl ProfileWriter {
    pub fn new(schema: Box<dyn ProfileSchema + Send + Sync>) -> Self {
        Self {
            schema,
            bridge: None,
        }
    }

    pub fn from_config(cfg: &StorageConfig) -> Self {
        let writer = Self::default();
        match &cfg.netplan {
            Some(np) => writer.with_bridge(ExternalFormatBridge::from_config(np)),
            None => writer,
        }
    }

    pub fn with_bridge(mut self, bridge: ExternalFormatBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    fn reparse(&self, kf: &KeyFile, ctx: &ParseContext) -> Result<Profile, SchemaError> {
        let parsed = self.schema.parse(kf, ctx)?;
        self.schema.normalize(parsed)
    }

    fn reread_file(&self, path: &Path, profile_dir: &Path) -> Result<Profile, WriteError> {
        let raw = std::fs::read_to_string(path).map_err(io_error(path))?;
        let ctx = ParseContext {
            keyfile_dir: profile_dir.to_path_buf(),
            path: Some(path.to_path_buf()),
        };
        KeyFile::parse(&raw)
            .map_err(SchemaError::from)
            .and_then(|kf| self.reparse(&kf, &ctx))
            .map_err(|e| {
                error!(
                    "event=round_trip_failed path={} err={e}",
                    path.display()
                );
                WriteError::RoundTripFailed(e)
            })
    }

    /// Serializes `profile` and stores it under `placement`.
    ///
    /// The profile must already be normalized. Nothing reaches the disk
    /// unless the serialized form parses back; certificate blobs are written
    /// only after that check. On failure the previous copy (if any) is left
    /// untouched.
    pub fn write(
        &self,
        profile: &Profile,
        placement: &Placement<'_>,
        opts: &WriteOptions,
    ) -> Result<WriteOutcome, WriteError> {
        self.schema
            .verify(profile)
            .map_err(WriteError::SchemaRejected)?;
        let missing = |key: &str| {
            WriteError::SchemaRejected(SchemaError::Missing {
                setting: SETTING_CONNECTION.to_string(),
                key: key.to_string(),
            })
        };
        let id = profile.id().ok_or_else(|| missing(KEY_ID))?;
        let uuid = profile.uuid().ok_or_else(|| missing(KEY_UUID))?;

        let mut serialized = serialize_profile(profile, self.schema.as_ref(), placement.keyfile_dir)?;
        Bookkeeping {
            nm_generated: opts.flags.generated,
            volatile: opts.flags.volatile,
            external: opts.flags.external,
            shadowed_storage: opts.shadow.as_ref().map(|s| s.storage.clone()),
            shadowed_owned: opts.shadow.as_ref().is_some_and(|s| s.owned),
        }
        .stamp(&mut serialized.keyfile);
        let data = serialized.keyfile.to_data();

        ensure_dir(placement.keyfile_dir).map_err(io_error(placement.keyfile_dir))?;

        let path = FilenameAllocator {
            dir: placement.keyfile_dir,
            with_extension: placement.with_extension,
            existing_path: placement.existing_path,
            must_rename: placement.must_rename(),
            reject: placement.reject,
        }
        .allocate(id, uuid)?;

        let mut reread: Option<Profile> = None;
        if opts.reread {
            let ctx = ParseContext {
                keyfile_dir: placement.profile_dir.to_path_buf(),
                path: Some(path.clone()),
            };
            let parsed = KeyFile::parse(&data)
                .map_err(SchemaError::from)
                .and_then(|kf| self.reparse(&kf, &ctx))
                .map_err(|e| {
                    error!(
                        "event=round_trip_failed uuid={uuid} path={} err={e}",
                        path.display()
                    );
                    WriteError::RoundTripFailed(e)
                })?;
            reread = Some(parsed);
        }

        for blob in &serialized.blobs {
            commit_file(&blob.path, &blob.data, opts.owner)?;
            debug!("event=cert_blob_written path={}", blob.path.display());
        }
        commit_file(&path, data.as_bytes(), opts.owner)?;

        if let Some(existing) = placement.existing_path
            && !placement.existing_path_read_only
            && existing != path
            && let Err(e) = remove_file_if_exists(existing)
        {
            warn!(
                "event=stale_profile_unlink_failed path={} err={e}",
                existing.display()
            );
        }

        let mut content_sha256 = sha256_hex(data.as_bytes());
        info!(
            "event=profile_written uuid={uuid} path={} sha256={content_sha256}",
            path.display()
        );

        let mut final_path = path;
        if let Some(bridge) = &self.bridge
            && !opts.flags.volatile
        {
            let handoff = bridge
                .translate_and_commit(&final_path, profile, placement.existing_path)
                .map_err(|e| WriteError::ExternalBridgeFailed {
                    local_path: final_path.clone(),
                    source: e,
                })?;
            final_path = handoff.path;
            let external = std::fs::read(&final_path).map_err(io_error(&final_path))?;
            content_sha256 = sha256_hex(&external);
            if opts.reread {
                reread = Some(self.reread_file(&final_path, placement.profile_dir)?);
            }
        }

        let reread_same = reread.as_ref().map(|r| verify(profile, r).is_identical());
        Ok(WriteOutcome {
            path: final_path,
            reread,
            reread_same,
            content_sha256,
        })
    }
}
