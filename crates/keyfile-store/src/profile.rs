use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

pub const SETTING_CONNECTION: &str = "connection";
pub const KEY_ID: &str = "id";
pub const KEY_UUID: &str = "uuid";
pub const KEY_TYPE: &str = "type";
pub const KEY_INTERFACE_NAME: &str = "interface-name";
pub const SETTING_WIFI: &str = "wifi";
pub const KEY_SSID: &str = "ssid";

fn uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("valid uuid regex")
    })
}

/// True for the 36-character lowercase hyphenated form.
pub fn uuid_is_normalized(s: &str) -> bool {
    uuid_regex().is_match(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    Pem,
    Der,
    Pkcs12,
}

/// Certificate or key material referenced by a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertValue {
    Path(PathBuf),
    Pkcs11(String),
    Blob {
        data: Vec<u8>,
        format: Option<KeyFormat>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
    StrList(Vec<String>),
    Secret(String),
    Cert(CertValue),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Secret(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Bytes(_) => "bytes",
            Value::StrList(_) => "string list",
            Value::Secret(_) => "secret",
            Value::Cert(_) => "certificate",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Setting {
    values: BTreeMap<String, Value>,
}

impl Setting {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An in-memory connection profile: setting name -> key -> typed value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile {
    settings: BTreeMap<String, Setting>,
}

impl Profile {
    pub fn new(id: &str, uuid: &str, connection_type: &str) -> Self {
        let mut p = Profile::default();
        p.set(SETTING_CONNECTION, KEY_ID, Value::Str(id.to_string()));
        p.set(SETTING_CONNECTION, KEY_UUID, Value::Str(uuid.to_string()));
        p.set(
            SETTING_CONNECTION,
            KEY_TYPE,
            Value::Str(connection_type.to_string()),
        );
        p
    }

    pub fn get(&self, setting: &str, key: &str) -> Option<&Value> {
        self.settings.get(setting)?.get(key)
    }

    fn get_str(&self, setting: &str, key: &str) -> Option<&str> {
        self.get(setting, key).and_then(Value::as_str)
    }

    pub fn set(&mut self, setting: &str, key: &str, value: Value) -> &mut Self {
        self.settings
            .entry(setting.to_string())
            .or_default()
            .insert(key, value);
        self
    }

    pub fn remove(&mut self, setting: &str, key: &str) -> Option<Value> {
        self.settings.get_mut(setting)?.remove(key)
    }

    pub fn setting(&self, name: &str) -> Option<&Setting> {
        self.settings.get(name)
    }

    pub fn settings(&self) -> impl Iterator<Item = (&str, &Setting)> {
        self.settings.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn settings_mut(&mut self) -> &mut BTreeMap<String, Setting> {
        &mut self.settings
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str(SETTING_CONNECTION, KEY_ID)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.get_str(SETTING_CONNECTION, KEY_UUID)
    }

    pub fn connection_type(&self) -> Option<&str> {
        self.get_str(SETTING_CONNECTION, KEY_TYPE)
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.get_str(SETTING_CONNECTION, KEY_INTERFACE_NAME)
    }

    /// The wifi SSID rendered as text, if the profile has one.
    pub fn ssid(&self) -> Option<String> {
        match self.get(SETTING_WIFI, KEY_SSID)? {
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_normalization_is_strict() {
        assert!(uuid_is_normalized("11111111-1111-1111-1111-111111111111"));
        assert!(uuid_is_normalized("a0b1c2d3-e4f5-4607-8899-aabbccddeeff"));
        assert!(!uuid_is_normalized("A0B1C2D3-E4F5-4607-8899-AABBCCDDEEFF"));
        assert!(!uuid_is_normalized("a0b1c2d3e4f54607-8899-aabbccddeeff00"));
        assert!(!uuid_is_normalized("11111111-1111-1111-1111-1111111111111"));
    }

    #[test]
    fn connection_accessors_read_the_connection_setting() {
        let mut p = Profile::new("home-wifi", "11111111-1111-1111-1111-111111111111", "wifi");
        p.set(SETTING_WIFI, KEY_SSID, Value::Bytes(b"home".to_vec()));
        assert_eq!(p.id(), Some("home-wifi"));
        assert_eq!(p.uuid(), Some("11111111-1111-1111-1111-111111111111"));
        assert_eq!(p.connection_type(), Some("wifi"));
        assert_eq!(p.interface_name(), None);
        assert_eq!(p.ssid().as_deref(), Some("home"));
    }
}
