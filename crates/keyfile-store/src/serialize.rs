//! Profile -> keyfile serialization with certificate blob externalization.
//!
//! Blobs are only collected here; they reach the disk when the writer
//! commits, after the record has passed the round-trip check.

use crate::errors::WriteError;
use crate::keyfile::{KeyFile, join_list};
use crate::profile::{CertValue, KeyFormat, Profile, SETTING_CONNECTION, Value};
use crate::schema::{
    CERT_SCHEME_PREFIX_PATH, GROUP_NMMETA, ProfileSchema, SECRETS_GROUP_PREFIX, ValueKind,
    is_unqualified_path, looks_like_int_list,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const KEY_NM_GENERATED: &str = "nm-generated";
pub const KEY_VOLATILE: &str = "volatile";
pub const KEY_EXTERNAL: &str = "external";
pub const KEY_SHADOWED_STORAGE: &str = "shadowed-storage";
pub const KEY_SHADOWED_OWNED: &str = "shadowed-owned";

/// Flags stamped into the reserved `[.nmmeta]` group of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Bookkeeping {
    pub nm_generated: bool,
    pub volatile: bool,
    pub external: bool,
    pub shadowed_storage: Option<String>,
    pub shadowed_owned: bool,
}

impl Bookkeeping {
    pub fn stamp(&self, kf: &mut KeyFile) {
        if self.nm_generated {
            kf.set_bool(GROUP_NMMETA, KEY_NM_GENERATED, true);
        }
        if self.volatile {
            kf.set_bool(GROUP_NMMETA, KEY_VOLATILE, true);
        }
        if self.external {
            kf.set_bool(GROUP_NMMETA, KEY_EXTERNAL, true);
        }
        if let Some(storage) = &self.shadowed_storage {
            kf.set_string(GROUP_NMMETA, KEY_SHADOWED_STORAGE, storage.clone());
        }
        if self.shadowed_owned {
            kf.set_bool(GROUP_NMMETA, KEY_SHADOWED_OWNED, true);
        }
    }

    pub fn read(kf: &KeyFile) -> Self {
        Self {
            nm_generated: kf.get_bool(GROUP_NMMETA, KEY_NM_GENERATED).unwrap_or(false),
            volatile: kf.get_bool(GROUP_NMMETA, KEY_VOLATILE).unwrap_or(false),
            external: kf.get_bool(GROUP_NMMETA, KEY_EXTERNAL).unwrap_or(false),
            shadowed_storage: kf
                .get_string(GROUP_NMMETA, KEY_SHADOWED_STORAGE)
                .map(str::to_string),
            shadowed_owned: kf.get_bool(GROUP_NMMETA, KEY_SHADOWED_OWNED).unwrap_or(false),
        }
    }
}

/// Certificate bytes waiting to be written next to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlob {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SerializedProfile {
    pub keyfile: KeyFile,
    pub blobs: Vec<PendingBlob>,
}

fn serialize_failed(setting: &str, key: &str, message: impl std::fmt::Display) -> WriteError {
    WriteError::SerializeFailed {
        message: format!("{setting}.{key}: {message}"),
    }
}

fn encode_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if !s.chars().any(char::is_control) && !looks_like_int_list(s) => s.to_string(),
        _ => {
            let mut out = String::new();
            for b in bytes {
                out.push_str(&b.to_string());
                out.push(';');
            }
            out
        }
    }
}

/// Extension for an externalized blob: the declared format wins, otherwise
/// a DER SEQUENCE header (`0x30 0x82`) is sniffed and PEM assumed.
pub fn blob_extension(data: &[u8], format: Option<KeyFormat>) -> &'static str {
    match format {
        Some(KeyFormat::Pkcs12) => "p12",
        Some(KeyFormat::Der) => "der",
        Some(KeyFormat::Pem) => "pem",
        None if data.len() > 2 && data[0] == 0x30 && data[1] == 0x82 => "der",
        None => "pem",
    }
}

fn encode_cert_path(path: &Path, keyfile_dir: &Path) -> Option<String> {
    let full = path.to_str()?;
    if let Ok(rel) = path.strip_prefix(keyfile_dir) {
        // rooted in the keyfile directory: prefer the relative form
        if let Some(rel) = rel.to_str()
            && !rel.is_empty()
            && is_unqualified_path(rel, keyfile_dir)
        {
            return Some(rel.to_string());
        }
    }
    if is_unqualified_path(full, keyfile_dir) {
        return Some(full.to_string());
    }
    Some(format!("{CERT_SCHEME_PREFIX_PATH}{full}"))
}

struct CertWriter<'a> {
    keyfile_dir: &'a Path,
    uuid: &'a str,
    blobs: Vec<PendingBlob>,
}

impl CertWriter<'_> {
    fn encode(
        &mut self,
        setting: &str,
        key: &str,
        file_suffix: &str,
        cert: &CertValue,
    ) -> Result<String, WriteError> {
        match cert {
            CertValue::Path(path) => encode_cert_path(path, self.keyfile_dir)
                .ok_or_else(|| serialize_failed(setting, key, "path is not valid UTF-8")),
            CertValue::Pkcs11(uri) => Ok(uri.clone()),
            CertValue::Blob { data, format } => {
                let ext = blob_extension(data, *format);
                let file_name = format!("{}-{}.{}", self.uuid, file_suffix, ext);
                self.blobs.push(PendingBlob {
                    path: self.keyfile_dir.join(&file_name),
                    data: data.clone(),
                });
                // the name starts with the UUID, so it can't be mistaken for a data: URI
                Ok(file_name)
            }
        }
    }
}

/// Serializes a verified profile. Groups come out as `[connection]`, the
/// remaining settings by name, then `[secrets/<setting>]` groups.
pub fn serialize_profile(
    profile: &Profile,
    schema: &dyn ProfileSchema,
    keyfile_dir: &Path,
) -> Result<SerializedProfile, WriteError> {
    let uuid = profile.uuid().ok_or_else(|| WriteError::SerializeFailed {
        message: "profile has no connection.uuid".to_string(),
    })?;
    let mut kf = KeyFile::new();
    let mut secrets: Vec<(String, String, String)> = vec![];
    let mut certs = CertWriter {
        keyfile_dir,
        uuid,
        blobs: vec![],
    };

    let ordered = profile
        .setting(SETTING_CONNECTION)
        .map(|s| (SETTING_CONNECTION, s))
        .into_iter()
        .chain(
            profile
                .settings()
                .filter(|(name, _)| *name != SETTING_CONNECTION),
        );

    for (setting_name, setting) in ordered {
        for (key, value) in setting.iter() {
            let raw = match value {
                Value::Secret(s) => {
                    secrets.push((setting_name.to_string(), key.to_string(), s.clone()));
                    continue;
                }
                Value::Str(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Int(i) => i.to_string(),
                Value::Bytes(b) => encode_bytes(b),
                Value::StrList(items) => join_list(items),
                Value::Cert(cert) => {
                    let Some(ValueKind::Cert { file_suffix }) =
                        schema.value_kind(setting_name, key)
                    else {
                        return Err(serialize_failed(
                            setting_name,
                            key,
                            "certificate value on a non-certificate key",
                        ));
                    };
                    certs.encode(setting_name, key, file_suffix, cert)?
                }
            };
            kf.set_string(setting_name, key, raw);
        }
    }

    for (setting_name, key, secret) in secrets {
        kf.set_string(&format!("{SECRETS_GROUP_PREFIX}{setting_name}"), &key, secret);
    }

    Ok(SerializedProfile {
        keyfile: kf,
        blobs: certs.blobs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::KeyfileSchema;

    const UUID: &str = "11111111-1111-1111-1111-111111111111";

    #[test]
    fn connection_group_comes_first_and_secrets_are_segregated() {
        let mut p = Profile::new("home", UUID, "wifi");
        p.set("wifi-security", "key-mgmt", Value::Str("wpa-psk".to_string()));
        p.set("wifi-security", "psk", Value::Secret("hunter22".to_string()));
        p.set("ipv4", "method", Value::Str("auto".to_string()));

        let out = serialize_profile(&p, &KeyfileSchema, Path::new("/etc/nm")).unwrap();
        let names: Vec<_> = out.keyfile.group_names().collect();
        assert_eq!(
            names,
            vec!["connection", "ipv4", "wifi-security", "secrets/wifi-security"]
        );
        assert_eq!(out.keyfile.get_string("wifi-security", "psk"), None);
        assert_eq!(
            out.keyfile.get_string("secrets/wifi-security", "psk"),
            Some("hunter22")
        );
    }

    #[test]
    fn bytes_use_text_only_when_unambiguous() {
        assert_eq!(encode_bytes(b"home"), "home");
        assert_eq!(encode_bytes(b"12"), "49;50;");
        assert_eq!(encode_bytes(&[0xff, 0x00]), "255;0;");
    }

    #[test]
    fn blob_extension_prefers_declared_format() {
        assert_eq!(blob_extension(&[0x30, 0x82, 0x01], None), "der");
        assert_eq!(blob_extension(b"-----BEGIN", None), "pem");
        assert_eq!(blob_extension(b"-----BEGIN", Some(KeyFormat::Pkcs12)), "p12");
    }

    #[test]
    fn cert_blobs_are_collected_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = Profile::new("corp", UUID, "ethernet");
        p.set(
            "802-1x",
            "ca-cert",
            Value::Cert(CertValue::Blob {
                data: vec![0x30, 0x82, 0x01, 0x02],
                format: None,
            }),
        );

        let out = serialize_profile(&p, &KeyfileSchema, dir.path()).unwrap();
        let expected = format!("{UUID}-ca-cert.der");
        assert_eq!(
            out.keyfile.get_string("802-1x", "ca-cert"),
            Some(expected.as_str())
        );
        assert_eq!(out.blobs.len(), 1);
        assert_eq!(out.blobs[0].path, dir.path().join(&expected));
        assert!(!out.blobs[0].path.exists());
    }

    #[test]
    fn cert_paths_are_relativized_or_qualified() {
        let dir = Path::new("/etc/nm");
        assert_eq!(
            encode_cert_path(Path::new("/etc/nm/ca.pem"), dir).as_deref(),
            Some("ca.pem")
        );
        assert_eq!(
            encode_cert_path(Path::new("/etc/pki/ca.crt"), dir).as_deref(),
            Some("/etc/pki/ca.crt")
        );
        assert_eq!(
            encode_cert_path(Path::new("/nonexistent/blob"), dir).as_deref(),
            Some("file:///nonexistent/blob")
        );
    }

    #[test]
    fn bookkeeping_round_trips_through_the_reserved_group() {
        let flags = Bookkeeping {
            nm_generated: true,
            volatile: false,
            external: true,
            shadowed_storage: Some("/run/nm/profiles/x".to_string()),
            shadowed_owned: true,
        };
        let mut kf = KeyFile::new();
        flags.stamp(&mut kf);
        assert_eq!(kf.get_string(GROUP_NMMETA, KEY_VOLATILE), None);
        assert_eq!(Bookkeeping::read(&kf), flags);
    }
}
