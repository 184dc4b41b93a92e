use super::*;

#[test]
fn storage_config_deserialize_smoke() {
    let s = r#"
keyfile_dir = "/etc/NetworkManager/system-connections"
with_extension = false

[runtime]
uid = 0
gid = 0

[testing]
skip_owner_check = true

[netplan]
command = "/usr/sbin/netplan"
args = ["--debug"]
rootdir = "/"
"#;

    let cfg = StorageConfig::from_toml_str(s, Path::new("storage.toml")).expect("parse config");
    assert_eq!(
        cfg.keyfile_dir,
        PathBuf::from("/etc/NetworkManager/system-connections")
    );
    assert_eq!(cfg.profile_dir(), cfg.keyfile_dir.as_path());
    assert!(!cfg.with_extension);
    assert_eq!(cfg.runtime_identity(), RuntimeIdentity { uid: 0, gid: 0 });
    assert!(cfg.skip_owner_check());
    let np = cfg.netplan.expect("netplan section");
    assert_eq!(np.args, vec!["--debug".to_string()]);
}

#[test]
fn defaults_apply_when_sections_are_absent() {
    let cfg = StorageConfig::from_toml_str(
        "keyfile_dir = \"/etc/nm\"\n",
        Path::new("storage.toml"),
    )
    .unwrap();
    assert!(cfg.with_extension);
    assert!(cfg.netplan.is_none());
    assert_eq!(cfg.runtime_identity(), RuntimeIdentity::current());
}

#[test]
fn unknown_fields_are_rejected() {
    let err = StorageConfig::from_toml_str(
        "keyfile_dir = \"/etc/nm\"\nkeyfile_mode = 420\n",
        Path::new("storage.toml"),
    )
    .unwrap_err();
    assert_eq!(err.code(), "config.parse_failed");
}

#[test]
fn relative_keyfile_dir_is_invalid() {
    let err = StorageConfig::from_toml_str("keyfile_dir = \"nm\"\n", Path::new("storage.toml"))
        .unwrap_err();
    assert_eq!(err.code(), "config.invalid");
}

#[test]
fn load_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_storage_config(&dir.path().join("missing.toml")).unwrap_err();
    assert_eq!(err.code(), "config.read_failed");
}
