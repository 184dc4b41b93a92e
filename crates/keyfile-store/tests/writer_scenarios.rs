use keyfile_store::config::RuntimeIdentity;
use keyfile_store::profile::{CertValue, KeyFormat, Profile, Value};
use keyfile_store::writer::{Placement, ProfileWriter, Shadow, WriteFlags, WriteOptions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

const UUID_A: &str = "3f2a7c9e-1b4d-4e8a-9c0f-5d6e7f8a9b0c";
const UUID_B: &str = "8c1d2e3f-4a5b-4c6d-8e7f-9a0b1c2d3e4f";

fn wifi_profile(id: &str, uuid: &str) -> Profile {
    let mut p = Profile::new(id, uuid, "802-11-wireless");
    p.set("wifi", "ssid", Value::Bytes(b"home".to_vec()))
        .set("wifi", "hidden", Value::Bool(false))
        .set("wifi-security", "key-mgmt", Value::Str("wpa-psk".to_string()))
        .set("wifi-security", "psk", Value::Secret("hunter22".to_string()))
        .set("ipv4", "method", Value::Str("auto".to_string()))
        .set(
            "ipv4",
            "dns",
            Value::StrList(vec!["1.1.1.1".to_string(), "9.9.9.9".to_string()]),
        );
    p
}

fn reread_opts() -> WriteOptions {
    WriteOptions {
        reread: true,
        ..WriteOptions::default()
    }
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn first_write_uses_the_plain_id_with_secure_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = ProfileWriter::default();
    let profile = wifi_profile("home-wifi", UUID_A);

    let out = writer
        .write(&profile, &Placement::new(dir.path()), &reread_opts())
        .expect("write");

    assert_eq!(out.path, dir.path().join("home-wifi"));
    assert_eq!(out.reread_same, Some(true));
    assert_eq!(out.reread.as_ref(), Some(&profile));
    assert_eq!(out.content_sha256.len(), 64);

    let meta = std::fs::metadata(&out.path).expect("metadata");
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    assert_eq!(meta.uid(), RuntimeIdentity::current().uid);

    let text = std::fs::read_to_string(&out.path).expect("read");
    assert!(text.starts_with("[connection]\n"), "{text}");
    assert!(text.contains("\n[secrets/wifi-security]\npsk=hunter22\n"), "{text}");
    assert!(text.contains("dns=1.1.1.1;9.9.9.9;"), "{text}");
    assert!(!text.contains("[.nmmeta]"), "{text}");
}

#[test]
fn colliding_id_falls_back_to_id_uuid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = ProfileWriter::default();
    let placement = Placement::new(dir.path());

    let a = writer
        .write(&wifi_profile("home-wifi", UUID_A), &placement, &WriteOptions::default())
        .expect("write a");
    let b = writer
        .write(&wifi_profile("home-wifi", UUID_B), &placement, &WriteOptions::default())
        .expect("write b");

    assert_eq!(a.path, dir.path().join("home-wifi"));
    assert_eq!(b.path, dir.path().join(format!("home-wifi-{UUID_B}")));
    assert_eq!(b.reread, None);
    assert_eq!(b.reread_same, None);
}

#[test]
fn rewriting_in_place_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = ProfileWriter::default();
    let profile = wifi_profile("home-wifi", UUID_A);

    let first = writer
        .write(&profile, &Placement::new(dir.path()), &WriteOptions::default())
        .expect("first");
    let before = std::fs::read(&first.path).expect("read");

    let mut placement = Placement::new(dir.path());
    placement.existing_path = Some(&first.path);
    let second = writer
        .write(&profile, &placement, &WriteOptions::default())
        .expect("second");

    assert_eq!(second.path, first.path);
    assert_eq!(second.content_sha256, first.content_sha256);
    assert_eq!(std::fs::read(&second.path).expect("read"), before);
    assert_eq!(entries(dir.path()), vec!["home-wifi".to_string()]);
}

#[test]
fn renamed_profile_replaces_its_previous_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = ProfileWriter::default();

    let first = writer
        .write(
            &wifi_profile("home-wifi", UUID_A),
            &Placement::new(dir.path()),
            &WriteOptions::default(),
        )
        .expect("first");

    let mut placement = Placement::new(dir.path());
    placement.existing_path = Some(&first.path);
    placement.force_rename = true;
    let second = writer
        .write(&wifi_profile("office", UUID_A), &placement, &WriteOptions::default())
        .expect("second");

    assert_eq!(second.path, dir.path().join("office"));
    assert!(!first.path.exists());
    assert_eq!(entries(dir.path()), vec!["office".to_string()]);
}

#[test]
fn read_only_existing_file_is_left_alone() {
    let system = tempfile::tempdir().expect("tempdir");
    let dir = tempfile::tempdir().expect("tempdir");
    let foreign = system.path().join("home-wifi");
    std::fs::write(&foreign, "[connection]\n").expect("seed");

    let mut placement = Placement::new(dir.path());
    placement.existing_path = Some(&foreign);
    placement.existing_path_read_only = true;
    let out = ProfileWriter::default()
        .write(&wifi_profile("home-wifi", UUID_A), &placement, &WriteOptions::default())
        .expect("write");

    assert_eq!(out.path, dir.path().join("home-wifi"));
    assert_eq!(
        std::fs::read_to_string(&foreign).expect("foreign kept"),
        "[connection]\n"
    );
}

#[test]
fn existing_path_outside_the_directory_moves_the_profile_in() {
    let elsewhere = tempfile::tempdir().expect("tempdir");
    let dir = tempfile::tempdir().expect("tempdir");
    let old = elsewhere.path().join("home-wifi");
    std::fs::write(&old, "[connection]\n").expect("seed");

    let mut placement = Placement::new(dir.path());
    placement.existing_path = Some(&old);
    let out = ProfileWriter::default()
        .write(&wifi_profile("home-wifi", UUID_A), &placement, &WriteOptions::default())
        .expect("write");

    assert_eq!(out.path, dir.path().join("home-wifi"));
    assert!(!old.exists());
}

#[test]
fn exhausted_names_report_no_available_name_and_write_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let reject_all = |_: &Path| true;
    let mut placement = Placement::new(dir.path());
    placement.reject = Some(&reject_all);

    let err = ProfileWriter::default()
        .write(&wifi_profile("home-wifi", UUID_A), &placement, &WriteOptions::default())
        .unwrap_err();

    assert_eq!(err.code(), "write.no_available_name");
    assert!(err.to_string().contains("home-wifi"), "{err}");
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn invalid_profile_is_rejected_before_touching_the_disk() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("system-connections");
    let mut profile = wifi_profile("home-wifi", UUID_A);
    profile.remove("connection", "type");

    let err = ProfileWriter::default()
        .write(&profile, &Placement::new(&dir), &WriteOptions::default())
        .unwrap_err();

    assert_eq!(err.code(), "write.schema_rejected");
    assert!(!dir.exists());
}

#[test]
fn leading_non_ascii_whitespace_survives_a_reread() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut profile = wifi_profile("cafe", UUID_A);
    profile
        .set("wifi", "ssid", Value::Bytes("\u{a0}cafe".as_bytes().to_vec()))
        .set("ipv4", "dhcp-hostname", Value::Str("\u{0b}host".to_string()))
        .set("ipv4", "dhcp-client-id", Value::Str("\u{3000}id".to_string()));

    let out = ProfileWriter::default()
        .write(&profile, &Placement::new(dir.path()), &reread_opts())
        .expect("write");

    let reread = out.reread.as_ref().expect("reread");
    assert_eq!(
        reread.get("wifi", "ssid"),
        Some(&Value::Bytes(vec![0xc2, 0xa0, b'c', b'a', b'f', b'e']))
    );
    assert_eq!(
        reread.get("ipv4", "dhcp-hostname"),
        Some(&Value::Str("\u{0b}host".to_string()))
    );
    assert_eq!(out.reread_same, Some(true));
}

#[test]
fn missing_directory_is_created() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("system-connections");

    let out = ProfileWriter::default()
        .write(
            &wifi_profile("home-wifi", UUID_A),
            &Placement::new(&dir),
            &WriteOptions::default(),
        )
        .expect("write");

    assert_eq!(out.path, dir.join("home-wifi"));
    let mode = std::fs::metadata(&dir).expect("dir").permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn extension_mode_appends_nmconnection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut placement = Placement::new(dir.path());
    placement.with_extension = true;

    let out = ProfileWriter::default()
        .write(&wifi_profile("a/b", UUID_A), &placement, &WriteOptions::default())
        .expect("write");

    assert_eq!(out.path, dir.path().join("a_b.nmconnection"));
}

#[test]
fn chown_failure_rolls_back_the_file() {
    let me = RuntimeIdentity::current();
    if me.uid == 0 {
        // root may chown to anyone
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = WriteOptions {
        owner: Some(RuntimeIdentity {
            uid: me.uid + 1,
            gid: me.gid,
        }),
        ..WriteOptions::default()
    };

    let err = ProfileWriter::default()
        .write(&wifi_profile("home-wifi", UUID_A), &Placement::new(dir.path()), &opts)
        .unwrap_err();

    assert_eq!(err.code(), "write.ownership_failed");
    assert!(err.os_error().is_some());
    assert!(!dir.path().join("home-wifi").exists());
    assert!(entries(dir.path()).is_empty(), "{:?}", entries(dir.path()));
}

#[test]
fn chown_to_the_runtime_identity_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = WriteOptions {
        owner: Some(RuntimeIdentity::current()),
        ..WriteOptions::default()
    };
    let out = ProfileWriter::default()
        .write(&wifi_profile("home-wifi", UUID_A), &Placement::new(dir.path()), &opts)
        .expect("write");
    let meta = std::fs::metadata(&out.path).expect("metadata");
    assert_eq!(meta.uid(), RuntimeIdentity::current().uid);
    assert_eq!(meta.gid(), RuntimeIdentity::current().gid);
}

#[test]
fn bookkeeping_flags_land_in_the_reserved_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = WriteOptions {
        flags: WriteFlags {
            generated: true,
            volatile: true,
            external: false,
        },
        shadow: Some(Shadow {
            storage: "/etc/NetworkManager/system-connections/home-wifi".to_string(),
            owned: true,
        }),
        reread: true,
        ..WriteOptions::default()
    };
    let profile = wifi_profile("home-wifi", UUID_A);

    let out = ProfileWriter::default()
        .write(&profile, &Placement::new(dir.path()), &opts)
        .expect("write");

    let text = std::fs::read_to_string(&out.path).expect("read");
    let group = text.split("[.nmmeta]\n").nth(1).expect("bookkeeping group");
    assert!(group.contains("nm-generated=true\n"), "{text}");
    assert!(group.contains("volatile=true\n"), "{text}");
    assert!(!group.contains("external="), "{text}");
    assert!(
        group.contains("shadowed-storage=/etc/NetworkManager/system-connections/home-wifi\n"),
        "{text}"
    );
    assert!(group.contains("shadowed-owned=true\n"), "{text}");
    // bookkeeping is not part of the profile
    assert_eq!(out.reread_same, Some(true));
}

#[test]
fn certificate_blobs_are_externalized_next_to_the_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pem = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".to_vec();
    let mut profile = Profile::new("corp", UUID_A, "802-3-ethernet");
    profile
        .set("802-1x", "eap", Value::StrList(vec!["tls".to_string()]))
        .set(
            "802-1x",
            "ca-cert",
            Value::Cert(CertValue::Blob {
                data: pem.clone(),
                format: None,
            }),
        )
        .set(
            "802-1x",
            "private-key",
            Value::Cert(CertValue::Blob {
                data: vec![0x30, 0x82, 0x01, 0x0a],
                format: Some(KeyFormat::Pkcs12),
            }),
        )
        .set(
            "802-1x",
            "client-cert",
            Value::Cert(CertValue::Pkcs11("pkcs11:token=corp;object=client".to_string())),
        );

    let out = ProfileWriter::default()
        .write(&profile, &Placement::new(dir.path()), &reread_opts())
        .expect("write");

    let ca = dir.path().join(format!("{UUID_A}-ca-cert.pem"));
    let key = dir.path().join(format!("{UUID_A}-private-key.p12"));
    assert_eq!(std::fs::read(&ca).expect("ca blob"), pem);
    assert_eq!(std::fs::read(&key).expect("key blob"), vec![0x30, 0x82, 0x01, 0x0a]);
    for blob in [&ca, &key] {
        let mode = std::fs::metadata(blob).expect("blob").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let text = std::fs::read_to_string(&out.path).expect("read");
    assert!(text.contains(&format!("ca-cert={UUID_A}-ca-cert.pem\n")), "{text}");
    assert!(
        text.contains("client-cert=pkcs11:token=corp;object=client\n"),
        "{text}"
    );

    // blobs come back as path references, so the reread differs
    assert_eq!(out.reread_same, Some(false));
    let reread = out.reread.expect("reread");
    assert_eq!(
        reread.get("802-1x", "ca-cert"),
        Some(&Value::Cert(CertValue::Path(ca)))
    );
}

#[test]
fn certificate_paths_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut profile = Profile::new("corp", UUID_A, "802-3-ethernet");
    profile.set(
        "802-1x",
        "ca-cert",
        Value::Cert(CertValue::Path(dir.path().join("corp-ca.pem"))),
    );
    profile.set(
        "802-1x",
        "client-cert",
        Value::Cert(CertValue::Path("/etc/pki/client".into())),
    );

    let out = ProfileWriter::default()
        .write(&profile, &Placement::new(dir.path()), &reread_opts())
        .expect("write");

    let text = std::fs::read_to_string(&out.path).expect("read");
    assert!(text.contains("ca-cert=corp-ca.pem\n"), "{text}");
    assert!(text.contains("client-cert=file:///etc/pki/client\n"), "{text}");
    assert_eq!(out.reread_same, Some(true));
}
