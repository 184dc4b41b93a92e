//! Hand-off of a committed keyfile to an external declarative-config
//! generator (netplan), which then owns the profile's artifact.
//!
//! The generator writes its own YAML and regenerates keyfiles under
//! `<root>/run/NetworkManager/system-connections/`; this layer only
//! discovers where the regenerated file landed.

use crate::config::NetplanConfig;
use crate::errors::BridgeError;
use crate::filename::SUFFIX_NMCONNECTION;
use crate::fsutil::{SECURE_FILE_MODE, file_set_contents, remove_file_if_exists};
use crate::keyfile::KeyFile;
use crate::profile::{KEY_INTERFACE_NAME, Profile, SETTING_CONNECTION};
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const GENERATED_DIR: &str = "run/NetworkManager/system-connections";
const LEGACY_DIR: &str = "etc/netplan";
const GENERATED_PREFIX: &str = "netplan-";
const NETDEF_PREFIX: &str = "NM-";

/// Interface names longer than this are invalid and get stripped.
const IFNAMSIZ_MAX: usize = 15;

/// Exit status the translate command uses for "no such netdef in the input".
pub const NETDEF_NOT_FOUND_EXIT: i32 = 3;

pub trait ExternalGenerator {
    /// Translates the keyfile at `keyfile_path` into the generator's own
    /// format under `rootdir`, keyed by `netdef_id`.
    ///
    /// Returns `BridgeError::NetdefNotFound` when the keyfile doesn't
    /// produce a definition with that id, so another id can be tried.
    fn translate(
        &self,
        keyfile_path: &Path,
        netdef_id: &str,
        rootdir: &Path,
    ) -> Result<(), BridgeError>;

    /// Regenerates backend artifacts from everything translated so far.
    fn generate(&self, rootdir: &Path) -> Result<(), BridgeError>;
}

/// Runs the configured command, e.g. `netplan`.
///
/// `translate` invokes `<command> <args..> translate --root-dir <root>
/// --netdef-id <id> <keyfile>`; `generate` invokes `<command> <args..>
/// generate --root-dir <root>`.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn run(&self, subcommand: &str, extra: &[&OsStr]) -> Result<Output, BridgeError> {
        Command::new(&self.command)
            .args(&self.args)
            .arg(subcommand)
            .args(extra)
            .output()
            .map_err(|e| BridgeError::Spawn {
                command: self.command.clone(),
                source: e,
            })
    }
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

impl ExternalGenerator for CommandGenerator {
    fn translate(
        &self,
        keyfile_path: &Path,
        netdef_id: &str,
        rootdir: &Path,
    ) -> Result<(), BridgeError> {
        let out = self.run(
            "translate",
            &[
                OsStr::new("--root-dir"),
                rootdir.as_os_str(),
                OsStr::new("--netdef-id"),
                OsStr::new(netdef_id),
                keyfile_path.as_os_str(),
            ],
        )?;
        match out.status.code() {
            Some(0) => Ok(()),
            Some(NETDEF_NOT_FOUND_EXIT) => Err(BridgeError::NetdefNotFound {
                id: netdef_id.to_string(),
            }),
            code => Err(BridgeError::Translate {
                message: format!(
                    "{} translate failed (exit={code:?}): {}",
                    self.command,
                    stderr_of(&out)
                ),
            }),
        }
    }

    fn generate(&self, rootdir: &Path) -> Result<(), BridgeError> {
        let out = self.run("generate", &[OsStr::new("--root-dir"), rootdir.as_os_str()])?;
        if !out.status.success() {
            return Err(BridgeError::Generate {
                message: format!(
                    "{} generate failed (exit={:?}): {}",
                    self.command,
                    out.status.code(),
                    stderr_of(&out)
                ),
            });
        }
        Ok(())
    }
}

/// Percent-encodes everything outside the URI unreserved set.
fn uri_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Recovers the netdef id from a previously generated
/// `system-connections/netplan-<id>[-<escaped ssid>].nmconnection` path.
fn netdef_id_from_generated_path(path: &Path, escaped_ssid: Option<&str>) -> Option<String> {
    let parent = path.parent()?.file_name()?;
    if parent != "system-connections" {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    let mut id = name
        .strip_prefix(GENERATED_PREFIX)?
        .strip_suffix(SUFFIX_NMCONNECTION)?;
    if let Some(ssid) = escaped_ssid
        && let Some(stripped) = id.strip_suffix(ssid)
        && let Some(stripped) = stripped.strip_suffix('-')
    {
        id = stripped;
    }
    (!id.is_empty()).then(|| id.to_string())
}

/// Outcome of a successful hand-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOff {
    /// The generator's own keyfile, which now represents the profile.
    pub path: PathBuf,
    pub netdef_id: String,
}

pub struct ExternalFormatBridge {
    generator: Box<dyn ExternalGenerator + Send + Sync>,
    rootdir: PathBuf,
}

impl std::fmt::Debug for ExternalFormatBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalFormatBridge")
            .field("rootdir", &self.rootdir)
            .finish_non_exhaustive()
    }
}

impl ExternalFormatBridge {
    pub fn new(
        generator: Box<dyn ExternalGenerator + Send + Sync>,
        rootdir: Option<PathBuf>,
    ) -> Self {
        Self {
            generator,
            rootdir: rootdir.unwrap_or_else(|| PathBuf::from("/")),
        }
    }

    pub fn from_config(cfg: &NetplanConfig) -> Self {
        Self::new(
            Box::new(CommandGenerator::new(cfg.command.clone(), cfg.args.clone())),
            cfg.rootdir.clone(),
        )
    }

    pub fn generated_dir(&self) -> PathBuf {
        self.rootdir.join(GENERATED_DIR)
    }

    /// Hands the committed keyfile at `local_path` to the generator and
    /// returns the path of the artifact it produced.
    ///
    /// `local_path` is removed only once the generated file has been found;
    /// on any error it stays in place as the profile's copy.
    pub fn translate_and_commit(
        &self,
        local_path: &Path,
        profile: &Profile,
        existing_path: Option<&Path>,
    ) -> Result<HandOff, BridgeError> {
        let uuid = profile.uuid().ok_or_else(|| BridgeError::Translate {
            message: "profile has no connection.uuid".to_string(),
        })?;
        let escaped_ssid = profile.ssid().map(|s| uri_escape(&s));

        // updating a profile the generator already owns: keep its netdef id
        let updating = existing_path.and_then(|p| {
            netdef_id_from_generated_path(p, escaped_ssid.as_deref()).map(|id| (p, id))
        });

        let (source, candidates): (&Path, Vec<String>) = match &updating {
            Some((existing, id)) => {
                std::fs::copy(local_path, existing).map_err(|e| BridgeError::Io {
                    path: existing.to_path_buf(),
                    source: e,
                })?;
                (*existing, vec![id.clone()])
            }
            None => {
                let mut ids = vec![format!("{NETDEF_PREFIX}{uuid}")];
                if let Some(ifname) = profile.interface_name() {
                    ids.push(ifname.to_string());
                }
                (local_path, ids)
            }
        };

        let netdef_id = self.translate_first(source, &candidates)?;

        self.remove_legacy_yaml(uuid);

        self.generator.generate(&self.rootdir)?;
        self.fix_interface_names();

        let path = match &updating {
            Some((existing, _)) => existing.to_path_buf(),
            None => self.discover(uuid, &netdef_id, escaped_ssid.as_deref())?,
        };

        if path != local_path {
            remove_file_if_exists(local_path).map_err(|e| BridgeError::Io {
                path: local_path.to_path_buf(),
                source: e,
            })?;
        }

        info!(
            "event=external_handoff uuid={uuid} netdef_id={netdef_id} path={}",
            path.display()
        );
        Ok(HandOff { path, netdef_id })
    }

    fn translate_first(&self, source: &Path, candidates: &[String]) -> Result<String, BridgeError> {
        for id in candidates {
            match self.generator.translate(source, id, &self.rootdir) {
                Ok(()) => return Ok(id.clone()),
                Err(BridgeError::NetdefNotFound { .. }) => {
                    debug!("event=netdef_candidate_missing netdef_id={id}");
                }
                Err(e) => return Err(e),
            }
        }
        Err(BridgeError::NetdefNotFound {
            id: candidates.first().cloned().unwrap_or_default(),
        })
    }

    fn remove_legacy_yaml(&self, uuid: &str) {
        let legacy = self
            .rootdir
            .join(LEGACY_DIR)
            .join(format!("{NETDEF_PREFIX}{uuid}.yaml"));
        match std::fs::symlink_metadata(&legacy) {
            Ok(m) if m.file_type().is_file() => {
                if let Err(e) = std::fs::remove_file(&legacy) {
                    warn!(
                        "event=legacy_cleanup_failed path={} err={e}",
                        legacy.display()
                    );
                } else {
                    debug!("event=legacy_yaml_removed path={}", legacy.display());
                }
            }
            _ => {}
        }
    }

    /// Strips `connection.interface-name` values the generator derived from
    /// the `NM-<uuid>` id; they exceed the kernel's interface name limit.
    fn fix_interface_names(&self) {
        let dir = self.generated_dir();
        let Some(dir_str) = dir.to_str() else {
            warn!("event=ifname_fixup_skipped reason=non_utf8_dir");
            return;
        };
        let pattern = format!("{}/*{SUFFIX_NMCONNECTION}", glob::Pattern::escape(dir_str));
        let entries = match glob::glob(&pattern) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("event=ifname_fixup_failed pattern={pattern} err={}", e.msg);
                return;
            }
        };

        for path in entries.filter_map(Result::ok) {
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(mut kf) = KeyFile::parse(&raw) else {
                debug!("event=ifname_fixup_unparsable path={}", path.display());
                continue;
            };
            let Some(ifname) = kf
                .get_string(SETTING_CONNECTION, KEY_INTERFACE_NAME)
                .map(str::to_string)
            else {
                continue;
            };
            if !(ifname.starts_with(NETDEF_PREFIX) && ifname.len() > IFNAMSIZ_MAX) {
                continue;
            }
            kf.remove_key(SETTING_CONNECTION, KEY_INTERFACE_NAME);
            match file_set_contents(&path, kf.to_data().as_bytes(), SECURE_FILE_MODE) {
                Ok(()) => info!(
                    "event=ifname_fixup path={} removed_interface_name={ifname}",
                    path.display()
                ),
                Err(e) => warn!(
                    "event=ifname_fixup_failed path={} err={e}",
                    path.display()
                ),
            }
        }
    }

    fn discover(
        &self,
        uuid: &str,
        netdef_id: &str,
        escaped_ssid: Option<&str>,
    ) -> Result<PathBuf, BridgeError> {
        let dir = self.generated_dir();
        let name_for = |id: &str| match escaped_ssid {
            Some(ssid) => format!("{GENERATED_PREFIX}{id}-{ssid}{SUFFIX_NMCONNECTION}"),
            None => format!("{GENERATED_PREFIX}{id}{SUFFIX_NMCONNECTION}"),
        };

        let by_uuid = dir.join(name_for(&format!("{NETDEF_PREFIX}{uuid}")));
        if by_uuid.exists() {
            return Ok(by_uuid);
        }
        // logical interfaces are generated under their interface name
        let by_id = dir.join(name_for(netdef_id));
        if by_id.exists() {
            return Ok(by_id);
        }
        Err(BridgeError::NetdefNotFound {
            id: netdef_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_escape_keeps_unreserved_bytes_only() {
        assert_eq!(uri_escape("home-wifi_2.4~"), "home-wifi_2.4~");
        assert_eq!(uri_escape("my net/ü"), "my%20net%2F%C3%BC");
    }

    #[test]
    fn netdef_id_is_recovered_from_generated_names() {
        let p = Path::new("/run/NetworkManager/system-connections/netplan-NM-abc-my%20net.nmconnection");
        assert_eq!(
            netdef_id_from_generated_path(p, Some("my%20net")),
            Some("NM-abc".to_string())
        );
        let p = Path::new("/run/NetworkManager/system-connections/netplan-br0.nmconnection");
        assert_eq!(netdef_id_from_generated_path(p, None), Some("br0".to_string()));
        let p = Path::new("/etc/NetworkManager/other/netplan-br0.nmconnection");
        assert_eq!(netdef_id_from_generated_path(p, None), None);
        let p = Path::new("/etc/NetworkManager/system-connections/home.nmconnection");
        assert_eq!(netdef_id_from_generated_path(p, None), None);
    }
}
