//! Profile schema: the validation, parsing and normalization collaborators
//! the persistence layer calls as black boxes.

use crate::errors::SchemaError;
use crate::keyfile::{KeyFile, split_list};
use crate::profile::{
    CertValue, KEY_ID, KEY_INTERFACE_NAME, KEY_TYPE, KEY_UUID, KeyFormat, Profile,
    SETTING_CONNECTION, Value, uuid_is_normalized,
};
use base64::Engine;
use std::path::{Path, PathBuf};

/// Group holding bookkeeping flags; never part of the profile itself.
pub const GROUP_NMMETA: &str = ".nmmeta";
/// Prefix of the groups that carry secret-bearing keys of a setting.
pub const SECRETS_GROUP_PREFIX: &str = "secrets/";

pub(crate) const CERT_SCHEME_PREFIX_PATH: &str = "file://";
pub(crate) const CERT_SCHEME_PREFIX_PKCS11: &str = "pkcs11:";
pub(crate) const CERT_SCHEME_PREFIX_BLOB: &str = "data:;base64,";

const CERT_EXTENSIONS: [&str; 6] = ["pem", "der", "crt", "cer", "p12", "key"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Bool,
    Int,
    Bytes,
    StrList,
    Secret,
    /// Certificate/key reference; `file_suffix` names externalized blobs.
    Cert {
        file_suffix: &'static str,
    },
}

const KNOWN_KEYS: &[(&str, &str, ValueKind)] = &[
    ("connection", "autoconnect", ValueKind::Bool),
    ("connection", "autoconnect-priority", ValueKind::Int),
    ("connection", "permissions", ValueKind::StrList),
    ("connection", "read-only", ValueKind::Bool),
    ("connection", "secondaries", ValueKind::StrList),
    ("connection", "timestamp", ValueKind::Int),
    ("ethernet", "mtu", ValueKind::Int),
    ("ethernet", "wake-on-lan", ValueKind::Int),
    ("wifi", "hidden", ValueKind::Bool),
    ("wifi", "mac-address-denylist", ValueKind::StrList),
    ("wifi", "mtu", ValueKind::Int),
    ("wifi", "ssid", ValueKind::Bytes),
    ("wifi-security", "leap-password", ValueKind::Secret),
    ("wifi-security", "psk", ValueKind::Secret),
    ("wifi-security", "wep-key0", ValueKind::Secret),
    ("802-1x", "eap", ValueKind::StrList),
    ("802-1x", "password", ValueKind::Secret),
    ("802-1x", "pin", ValueKind::Secret),
    ("802-1x", "private-key-password", ValueKind::Secret),
    ("802-1x", "phase2-private-key-password", ValueKind::Secret),
    (
        "802-1x",
        "ca-cert",
        ValueKind::Cert {
            file_suffix: "ca-cert",
        },
    ),
    (
        "802-1x",
        "client-cert",
        ValueKind::Cert {
            file_suffix: "client-cert",
        },
    ),
    (
        "802-1x",
        "private-key",
        ValueKind::Cert {
            file_suffix: "private-key",
        },
    ),
    (
        "802-1x",
        "phase2-ca-cert",
        ValueKind::Cert {
            file_suffix: "inner-ca-cert",
        },
    ),
    (
        "802-1x",
        "phase2-client-cert",
        ValueKind::Cert {
            file_suffix: "inner-client-cert",
        },
    ),
    (
        "802-1x",
        "phase2-private-key",
        ValueKind::Cert {
            file_suffix: "inner-private-key",
        },
    ),
    ("gsm", "password", ValueKind::Secret),
    ("gsm", "pin", ValueKind::Secret),
    ("pppoe", "password", ValueKind::Secret),
    ("ipv4", "dns", ValueKind::StrList),
    ("ipv4", "dns-priority", ValueKind::Int),
    ("ipv4", "dns-search", ValueKind::StrList),
    ("ipv4", "ignore-auto-dns", ValueKind::Bool),
    ("ipv4", "may-fail", ValueKind::Bool),
    ("ipv4", "never-default", ValueKind::Bool),
    ("ipv4", "route-metric", ValueKind::Int),
    ("ipv6", "dns", ValueKind::StrList),
    ("ipv6", "dns-priority", ValueKind::Int),
    ("ipv6", "dns-search", ValueKind::StrList),
    ("ipv6", "ignore-auto-dns", ValueKind::Bool),
    ("ipv6", "may-fail", ValueKind::Bool),
    ("ipv6", "never-default", ValueKind::Bool),
    ("ipv6", "route-metric", ValueKind::Int),
];

/// Where a record being parsed lives; relative certificate paths resolve against `keyfile_dir`.
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub keyfile_dir: PathBuf,
    pub path: Option<PathBuf>,
}

pub trait ProfileSchema {
    fn value_kind(&self, setting: &str, key: &str) -> Option<ValueKind>;
    fn verify(&self, profile: &Profile) -> Result<(), SchemaError>;
    fn parse(&self, kf: &KeyFile, ctx: &ParseContext) -> Result<Profile, SchemaError>;
    fn normalize(&self, profile: Profile) -> Result<Profile, SchemaError>;
}

/// Built-in schema covering the well-known typed keys; unknown keys are strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyfileSchema;

pub(crate) fn looks_like_int_list(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let body = s.strip_suffix(';').unwrap_or(s);
    !body.is_empty()
        && body
            .split(';')
            .all(|n| !n.is_empty() && n.len() <= 3 && n.bytes().all(|b| b.is_ascii_digit()))
}

fn parse_int_list(setting: &str, key: &str, s: &str) -> Result<Vec<u8>, SchemaError> {
    s.strip_suffix(';')
        .unwrap_or(s)
        .split(';')
        .map(|n| {
            n.parse::<u8>()
                .map_err(|_| SchemaError::invalid(setting, key, format!("byte out of range: {n}")))
        })
        .collect()
}

fn valid_setting_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name
            .chars()
            .any(|c| matches!(c, '[' | ']' | '/' | '\n' | '\r') || c.is_whitespace())
}

fn valid_key_name(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with(['#', ';', '['])
        && key.trim_matches([' ', '\t']) == key
        && !key.chars().any(|c| matches!(c, '=' | '\n' | '\r'))
}

fn has_cert_extension(value: &str) -> bool {
    Path::new(value)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| CERT_EXTENSIONS.iter().any(|c| e.eq_ignore_ascii_case(c)))
}

/// Whether a bare (scheme-less) value would be read back as a file path.
pub(crate) fn is_unqualified_path(value: &str, keyfile_dir: &Path) -> bool {
    if value.is_empty()
        || value.contains(['\n', '\r', '\0'])
        || looks_like_int_list(value)
        || value.starts_with(CERT_SCHEME_PREFIX_PATH)
        || value.starts_with(CERT_SCHEME_PREFIX_PKCS11)
        || value.starts_with("data:")
    {
        return false;
    }
    has_cert_extension(value) || keyfile_dir.join(value).exists()
}

fn decode_cert(
    setting: &str,
    key: &str,
    raw: &str,
    ctx: &ParseContext,
) -> Result<CertValue, SchemaError> {
    if let Some(path) = raw.strip_prefix(CERT_SCHEME_PREFIX_PATH) {
        if !path.starts_with('/') {
            return Err(SchemaError::invalid(
                setting,
                key,
                "file:// certificate path must be absolute",
            ));
        }
        return Ok(CertValue::Path(PathBuf::from(path)));
    }
    if raw.starts_with(CERT_SCHEME_PREFIX_PKCS11) {
        return Ok(CertValue::Pkcs11(raw.to_string()));
    }
    if let Some(b64) = raw.strip_prefix(CERT_SCHEME_PREFIX_BLOB) {
        let data = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| SchemaError::invalid(setting, key, format!("invalid base64 blob: {e}")))?;
        return Ok(CertValue::Blob { data, format: None });
    }
    if looks_like_int_list(raw) {
        // legacy binary encoding
        let data = parse_int_list(setting, key, raw)?;
        return Ok(CertValue::Blob { data, format: None });
    }
    if raw.is_empty() {
        return Err(SchemaError::invalid(setting, key, "empty certificate value"));
    }
    Ok(CertValue::Path(ctx.keyfile_dir.join(raw)))
}

fn decode_value(
    kind: ValueKind,
    setting: &str,
    key: &str,
    raw: &str,
    ctx: &ParseContext,
) -> Result<Value, SchemaError> {
    Ok(match kind {
        ValueKind::Str => Value::Str(raw.to_string()),
        ValueKind::Secret => Value::Secret(raw.to_string()),
        ValueKind::Bool => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => {
                return Err(SchemaError::invalid(
                    setting,
                    key,
                    format!("not a boolean: {other:?}"),
                ));
            }
        },
        ValueKind::Int => Value::Int(raw.parse::<i64>().map_err(|e| {
            SchemaError::invalid(setting, key, format!("not an integer: {raw:?}: {e}"))
        })?),
        ValueKind::Bytes => {
            if looks_like_int_list(raw) {
                Value::Bytes(parse_int_list(setting, key, raw)?)
            } else {
                Value::Bytes(raw.as_bytes().to_vec())
            }
        }
        ValueKind::StrList => Value::StrList(split_list(raw)),
        ValueKind::Cert { .. } => Value::Cert(decode_cert(setting, key, raw, ctx)?),
    })
}

fn value_matches_kind(kind: Option<ValueKind>, value: &Value) -> bool {
    match (kind, value) {
        (None, Value::Str(_) | Value::Secret(_)) => true,
        (Some(ValueKind::Str), Value::Str(_)) => true,
        (Some(ValueKind::Bool), Value::Bool(_)) => true,
        (Some(ValueKind::Int), Value::Int(_)) => true,
        (Some(ValueKind::Bytes), Value::Bytes(_)) => true,
        (Some(ValueKind::StrList), Value::StrList(_)) => true,
        (Some(ValueKind::Secret), Value::Secret(_)) => true,
        (Some(ValueKind::Cert { .. }), Value::Cert(_)) => true,
        _ => false,
    }
}

fn verify_cert(setting: &str, key: &str, cert: &CertValue) -> Result<(), SchemaError> {
    match cert {
        CertValue::Path(p) => {
            let Some(s) = p.to_str() else {
                return Err(SchemaError::invalid(setting, key, "path is not valid UTF-8"));
            };
            if !p.is_absolute() || s.contains(['\n', '\r', '\0']) {
                return Err(SchemaError::invalid(
                    setting,
                    key,
                    format!("certificate path must be absolute: {s:?}"),
                ));
            }
        }
        CertValue::Pkcs11(uri) => {
            if !uri.starts_with(CERT_SCHEME_PREFIX_PKCS11) {
                return Err(SchemaError::invalid(
                    setting,
                    key,
                    format!("not a PKCS#11 URI: {uri:?}"),
                ));
            }
        }
        CertValue::Blob { data, format } => {
            if data.is_empty() {
                return Err(SchemaError::invalid(setting, key, "empty certificate blob"));
            }
            if matches!(format, Some(KeyFormat::Pkcs12)) && !key.ends_with("private-key") {
                return Err(SchemaError::invalid(
                    setting,
                    key,
                    "PKCS#12 format is only valid for private keys",
                ));
            }
        }
    }
    Ok(())
}

impl ProfileSchema for KeyfileSchema {
    fn value_kind(&self, setting: &str, key: &str) -> Option<ValueKind> {
        KNOWN_KEYS
            .iter()
            .find(|(s, k, _)| *s == setting && *k == key)
            .map(|(_, _, kind)| *kind)
    }

    fn verify(&self, profile: &Profile) -> Result<(), SchemaError> {
        let missing = |key: &str| SchemaError::Missing {
            setting: SETTING_CONNECTION.to_string(),
            key: key.to_string(),
        };
        match profile.id() {
            Some(id) if !id.is_empty() => {}
            _ => return Err(missing(KEY_ID)),
        }
        match profile.uuid() {
            Some(uuid) if uuid_is_normalized(uuid) => {}
            Some(uuid) => {
                return Err(SchemaError::invalid(
                    SETTING_CONNECTION,
                    KEY_UUID,
                    format!("not a normalized UUID: {uuid:?}"),
                ));
            }
            None => return Err(missing(KEY_UUID)),
        }
        match profile.connection_type() {
            Some(t) if !t.is_empty() => {}
            _ => return Err(missing(KEY_TYPE)),
        }

        for (setting_name, setting) in profile.settings() {
            if !valid_setting_name(setting_name) {
                return Err(SchemaError::InvalidSetting {
                    setting: setting_name.to_string(),
                });
            }
            for (key, value) in setting.iter() {
                if !valid_key_name(key) {
                    return Err(SchemaError::invalid(setting_name, key, "invalid key name"));
                }
                let kind = self.value_kind(setting_name, key);
                if !value_matches_kind(kind, value) {
                    return Err(SchemaError::invalid(
                        setting_name,
                        key,
                        format!("unexpected {} value", value.kind_name()),
                    ));
                }
                if let Value::Cert(cert) = value {
                    verify_cert(setting_name, key, cert)?;
                }
            }
        }
        Ok(())
    }

    fn parse(&self, kf: &KeyFile, ctx: &ParseContext) -> Result<Profile, SchemaError> {
        let mut profile = Profile::default();
        for group in kf.group_names() {
            if let Some(setting) = group.strip_prefix(SECRETS_GROUP_PREFIX) {
                for (key, raw) in kf.entries(group) {
                    profile.set(setting, key, Value::Secret(raw.to_string()));
                }
                continue;
            }
            if group.starts_with('.') {
                continue;
            }
            for (key, raw) in kf.entries(group) {
                let kind = self.value_kind(group, key).unwrap_or(ValueKind::Str);
                let value = decode_value(kind, group, key, raw, ctx)?;
                profile.set(group, key, value);
            }
        }
        Ok(profile)
    }

    fn normalize(&self, mut profile: Profile) -> Result<Profile, SchemaError> {
        if let Some(uuid) = profile.uuid() {
            let lower = uuid.to_ascii_lowercase();
            if lower != uuid && uuid_is_normalized(&lower) {
                profile.set(SETTING_CONNECTION, KEY_UUID, Value::Str(lower));
            }
        }
        if profile.interface_name() == Some("") {
            profile.remove(SETTING_CONNECTION, KEY_INTERFACE_NAME);
        }
        profile
            .settings_mut()
            .retain(|name, setting| name == SETTING_CONNECTION || !setting.is_empty());
        self.verify(&profile)?;
        Ok(profile)
    }
}
