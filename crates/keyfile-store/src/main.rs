use keyfile_store::config::{RuntimeIdentity, StorageConfig};
use keyfile_store::errors::SchemaError;
use keyfile_store::filename::FilenameAllocator;
use keyfile_store::keyfile::KeyFile;
use keyfile_store::nmmeta::MetadataStore;
use keyfile_store::permissions::{FileKind, PermissionValidator};
use keyfile_store::profile::Profile;
use keyfile_store::schema::{KeyfileSchema, ParseContext, ProfileSchema};
use keyfile_store::writer::{Placement, ProfileWriter, WriteOptions};
use serde_json::json;
use std::path::Path;
mod cli;

fn print_version() {
    println!("{}", env!("CARGO_PKG_VERSION"));
}

fn fail(code: &str, message: impl std::fmt::Display) -> serde_json::Value {
    json!({ "ok": false, "code": code, "message": message.to_string() })
}

fn parsed<T>(res: Result<T, String>) -> T {
    match res {
        Ok(v) => v,
        Err(e) => {
            eprintln!("keyfile-store: {e}");
            std::process::exit(2);
        }
    }
}

/// Falls back to `dir` (with default settings) when neither `--config` nor
/// `--dir` was given.
fn load_or_default(store: &cli::StoreArgs, dir: &Path) -> Result<StorageConfig, String> {
    if store.config.is_none() && store.dir.is_none() && std::env::var_os(cli::CONFIG_ENV).is_none()
    {
        return Ok(StorageConfig::new(dir));
    }
    store.load()
}

fn validator(cfg: &StorageConfig) -> PermissionValidator {
    PermissionValidator::new(cfg.runtime_identity(), cfg.skip_owner_check())
}

fn run_write(args: cli::WriteCli) -> Result<serde_json::Value, String> {
    let cfg = args.store.load()?;
    let raw = std::fs::read_to_string(&args.profile)
        .map_err(|e| format!("failed to read {}: {e}", args.profile.display()))?;
    let profile: Profile = serde_json::from_str(&raw)
        .map_err(|e| format!("invalid profile JSON {}: {e}", args.profile.display()))?;
    let profile = match KeyfileSchema.normalize(profile) {
        Ok(p) => p,
        Err(e) => return Ok(fail(e.code(), e)),
    };

    let mut placement = Placement::from_config(&cfg);
    placement.existing_path = args.existing.as_deref();
    placement.existing_path_read_only = args.read_only;
    placement.force_rename = args.force_rename;

    let opts = WriteOptions {
        flags: args.flags,
        shadow: args.shadow,
        owner: args.owner.map(|(uid, gid)| RuntimeIdentity { uid, gid }),
        reread: args.reread,
    };

    let out = match ProfileWriter::from_config(&cfg).write(&profile, &placement, &opts) {
        Ok(out) => out,
        Err(e) => {
            let mut v = fail(e.code(), &e);
            if let Some(errno) = e.os_error() {
                v["errno"] = json!(errno);
            }
            return Ok(v);
        }
    };
    Ok(json!({ "ok": true, "result": out }))
}

fn run_read(path: &Path, store: &cli::StoreArgs) -> Result<serde_json::Value, String> {
    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    let cfg = load_or_default(store, dir)?;
    let perms = validator(&cfg);
    if let Err(e) = perms.validate(path, FileKind::Keyfile) {
        return Ok(fail(e.code(), e));
    }
    let raw =
        std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let ctx = ParseContext {
        keyfile_dir: cfg.profile_dir().to_path_buf(),
        path: Some(path.to_path_buf()),
    };
    let res = KeyFile::parse(&raw)
        .map_err(SchemaError::from)
        .and_then(|kf| KeyfileSchema.parse(&kf, &ctx))
        .and_then(|p| KeyfileSchema.normalize(p));
    Ok(match res {
        Ok(profile) => json!({ "ok": true, "profile": profile }),
        Err(e) => fail(e.code(), e),
    })
}

fn run_meta_read(path: &Path, store: &cli::StoreArgs) -> Result<serde_json::Value, String> {
    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    let cfg = load_or_default(store, dir)?;
    let meta = MetadataStore::new(validator(&cfg));
    Ok(match meta.read_from_file(path) {
        Ok(record) => json!({
            "ok": true,
            "tombstone": record.is_tombstone(),
            "record": record,
        }),
        Err(e) => fail(e.code(), e),
    })
}

fn run_meta_write(args: cli::MetaWriteCli) -> Result<serde_json::Value, String> {
    let cfg = args.store.load()?;
    let meta = MetadataStore::new(validator(&cfg));
    Ok(
        match meta.write(
            &cfg.keyfile_dir,
            &args.uuid,
            args.loaded_path.as_deref(),
            args.allow_relative,
            args.shadow_storage.as_deref(),
        ) {
            Ok(path) => json!({
                "ok": true,
                "path": path,
                "deleted": args.loaded_path.is_none(),
            }),
            Err(e) => {
                let mut v = fail(e.code(), &e);
                if let Some(errno) = e.os_error() {
                    v["errno"] = json!(errno);
                }
                v
            }
        },
    )
}

fn run_check_perms(
    path: &Path,
    store: &cli::StoreArgs,
    meta: bool,
) -> Result<serde_json::Value, String> {
    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    let cfg = load_or_default(store, dir)?;
    Ok(match validator(&cfg).validate(path, cli::check_perms_kind(meta)) {
        Ok(_) => json!({ "ok": true, "path": path }),
        Err(e) => fail(e.code(), e),
    })
}

fn run_filename(args: cli::FilenameCli) -> Result<serde_json::Value, String> {
    let cfg = args.store.load()?;
    let mut alloc = FilenameAllocator::new(&cfg.keyfile_dir, cfg.with_extension);
    alloc.existing_path = args.existing.as_deref();
    Ok(match alloc.allocate(&args.id, &args.uuid) {
        Ok(path) => json!({ "ok": true, "path": path }),
        Err(e) => fail("filename.allocate_failed", e),
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str);
    let rest = args.get(2..).unwrap_or_default();

    let out = match command {
        Some("version") | Some("--version") | Some("-V") => {
            print_version();
            return Ok(());
        }
        Some("help") | Some("--help") | Some("-h") | None => {
            cli::print_help();
            return Ok(());
        }
        Some("write") => run_write(parsed(cli::parse_write_cli(rest))),
        Some("read") => {
            let (path, store, _) = parsed(cli::parse_path_cli(rest, "read", None));
            run_read(&path, &store)
        }
        Some("meta-read") => {
            let (path, store, _) = parsed(cli::parse_path_cli(rest, "meta-read", None));
            run_meta_read(&path, &store)
        }
        Some("meta-write") => run_meta_write(parsed(cli::parse_meta_write_cli(rest))),
        Some("check-perms") => {
            let (path, store, meta) =
                parsed(cli::parse_path_cli(rest, "check-perms", Some("--meta")));
            run_check_perms(&path, &store, meta)
        }
        Some("filename") => run_filename(parsed(cli::parse_filename_cli(rest))),
        Some(other) => {
            eprintln!(
                "keyfile-store: unknown command `{other}`; use write|read|meta-read|meta-write|check-perms|filename"
            );
            std::process::exit(2);
        }
    };

    let out = match out {
        Ok(v) => v,
        Err(e) => {
            eprintln!("keyfile-store: {e}");
            std::process::exit(2);
        }
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    if out["ok"] != json!(true) {
        std::process::exit(1);
    }
    Ok(())
}
