use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read storage config: {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse storage config TOML: {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid storage config: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config.read_failed",
            ConfigError::Parse { .. } => "config.parse_failed",
            ConfigError::Invalid { .. } => "config.invalid",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyFileError {
    #[error("keyfile syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },
}

impl KeyFileError {
    pub fn code(&self) -> &'static str {
        match self {
            KeyFileError::Syntax { .. } => "keyfile.syntax",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("missing required property {setting}.{key}")]
    Missing { setting: String, key: String },
    #[error("invalid property {setting}.{key}: {message}")]
    InvalidValue {
        setting: String,
        key: String,
        message: String,
    },
    #[error("invalid setting name {setting:?}")]
    InvalidSetting { setting: String },
    #[error(transparent)]
    KeyFile(#[from] KeyFileError),
}

impl SchemaError {
    pub(crate) fn invalid(setting: &str, key: &str, message: impl Into<String>) -> Self {
        SchemaError::InvalidValue {
            setting: setting.to_string(),
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SchemaError::Missing { .. } => "schema.missing_property",
            SchemaError::InvalidValue { .. } => "schema.invalid_property",
            SchemaError::InvalidSetting { .. } => "schema.invalid_setting",
            SchemaError::KeyFile(_) => "schema.keyfile_syntax",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("cannot access file: {path}: {source}")]
    NotAccessible {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{detail}: {path}")]
    WrongFileType { path: PathBuf, detail: &'static str },
    #[error("file owner ({uid}) is insecure: {path}")]
    InsecureOwner { path: PathBuf, uid: u32 },
    #[error("file permissions ({mode:03o}) are insecure: {path}")]
    InsecureMode { path: PathBuf, mode: u32 },
}

impl PermissionError {
    pub fn code(&self) -> &'static str {
        match self {
            PermissionError::NotAccessible { .. } => "permissions.not_accessible",
            PermissionError::WrongFileType { .. } => "permissions.wrong_file_type",
            PermissionError::InsecureOwner { .. } => "permissions.insecure_owner",
            PermissionError::InsecureMode { .. } => "permissions.insecure_mode",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    #[error("could not find suitable keyfile file name ({first_candidate} already used)")]
    NoAvailableName { first_candidate: PathBuf },
    #[error("cannot derive a file name from an empty id")]
    EmptyId,
}

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("no usable metadata record: {path}")]
    NotFound { path: PathBuf },
    #[error("invalid metadata request: {message}")]
    InvalidInput { message: String },
    #[error("failed to write metadata record {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl MetaError {
    pub fn code(&self) -> &'static str {
        match self {
            MetaError::NotFound { .. } => "meta.not_found",
            MetaError::InvalidInput { .. } => "meta.invalid_input",
            MetaError::Io { .. } => "meta.io",
        }
    }

    /// Raw OS error code of the failed syscall, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            MetaError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to spawn external generator {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("external translation failed: {message}")]
    Translate { message: String },
    #[error("netdef ID {id:?} was not found in the generated state")]
    NetdefNotFound { id: String },
    #[error("external generate step failed: {message}")]
    Generate { message: String },
    #[error("external bridge I/O error: {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Spawn { .. } => "bridge.spawn_failed",
            BridgeError::Translate { .. } => "bridge.translate_failed",
            BridgeError::NetdefNotFound { .. } => "bridge.netdef_not_found",
            BridgeError::Generate { .. } => "bridge.generate_failed",
            BridgeError::Io { .. } => "bridge.io",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("profile failed validation before write: {0}")]
    SchemaRejected(#[source] SchemaError),
    #[error("could not find suitable keyfile file name ({first_candidate} already used)")]
    NoAvailableName { first_candidate: PathBuf },
    #[error("failed to serialize profile: {message}")]
    SerializeFailed { message: String },
    #[error("keyfile writer produces an invalid connection: {0}")]
    RoundTripFailed(#[source] SchemaError),
    #[error("error writing to file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error chowning '{path}': {source}")]
    OwnershipFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("external format hand-off failed (local copy kept at {local_path}): {source}")]
    ExternalBridgeFailed {
        local_path: PathBuf,
        #[source]
        source: BridgeError,
    },
}

impl WriteError {
    pub fn code(&self) -> &'static str {
        match self {
            WriteError::SchemaRejected(_) => "write.schema_rejected",
            WriteError::NoAvailableName { .. } => "write.no_available_name",
            WriteError::SerializeFailed { .. } => "write.serialize_failed",
            WriteError::RoundTripFailed(_) => "write.round_trip_failed",
            WriteError::Io { .. } => "write.io",
            WriteError::OwnershipFailed { .. } => "write.ownership_failed",
            WriteError::ExternalBridgeFailed { .. } => "write.external_bridge_failed",
        }
    }

    /// Raw OS error code of the failed syscall, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            WriteError::Io { source, .. } | WriteError::OwnershipFailed { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

impl From<AllocateError> for WriteError {
    fn from(e: AllocateError) -> Self {
        match e {
            AllocateError::NoAvailableName { first_candidate } => {
                WriteError::NoAvailableName { first_candidate }
            }
            AllocateError::EmptyId => WriteError::SchemaRejected(SchemaError::Missing {
                setting: "connection".to_string(),
                key: "id".to_string(),
            }),
        }
    }
}
