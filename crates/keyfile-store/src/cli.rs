use keyfile_store::config::{StorageConfig, load_storage_config};
use keyfile_store::permissions::FileKind;
use keyfile_store::writer::{Shadow, WriteFlags};
use std::path::PathBuf;

pub(crate) const CONFIG_ENV: &str = "KEYFILE_STORE_CONFIG";

pub(crate) fn print_help() {
    println!(
        "Usage:\n  keyfile-store help\n  keyfile-store version\n  keyfile-store write --profile <json> [--existing <path>] [--read-only] [--force-rename] [--generated] [--volatile] [--external] [--shadow-storage <path> [--shadow-owned]] [--owner <uid>:<gid>] [--reread] [--config <toml> | --dir <path>]\n  keyfile-store read <keyfile> [--config <toml> | --dir <path>]\n  keyfile-store meta-read <path/UUID.nmmeta> [--config <toml>]\n  keyfile-store meta-write --uuid <uuid> [--loaded-path <path>] [--allow-relative] [--shadow-storage <path>] [--config <toml> | --dir <path>]\n  keyfile-store check-perms <path> [--meta] [--config <toml>]\n  keyfile-store filename --id <id> --uuid <uuid> [--existing <path>] [--config <toml> | --dir <path>]\n\nNotes:\n  - Results are printed as JSON; failures exit 1 with {{\"ok\":false,\"code\":...}}.\n  - A --loaded-path of /dev/null writes a tombstone; omitting it deletes the record.\n  - Defaults via env:\n      {CONFIG_ENV}=<path>\n      KEYFILE_STORE_SKIP_OWNER_CHECK=1|true\n      RUST_LOG=debug|info|warn\n\nExamples:\n  keyfile-store write --dir /etc/NetworkManager/system-connections --profile home.json --reread\n  keyfile-store meta-write --dir /run/NetworkManager/system-connections --uuid 0f6d4a7e-2d2c-4e0a-9f55-3b1f9f2b7c11 --loaded-path /dev/null\n"
    );
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreArgs {
    pub(crate) config: Option<PathBuf>,
    pub(crate) dir: Option<PathBuf>,
}

impl StoreArgs {
    pub(crate) fn load(&self) -> Result<StorageConfig, String> {
        let config = self
            .config
            .clone()
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .filter(|p| !p.as_os_str().is_empty());
        let mut cfg = match config {
            Some(path) => load_storage_config(&path).map_err(|e| format!("{}: {e}", e.code()))?,
            None => {
                let dir = self
                    .dir
                    .clone()
                    .ok_or_else(|| "either --config or --dir is required".to_string())?;
                StorageConfig::new(dir)
            }
        };
        if let (Some(dir), Some(_)) = (&self.dir, &self.config) {
            cfg.keyfile_dir = dir.clone();
        }
        cfg.validate().map_err(|e| format!("{}: {e}", e.code()))?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WriteCli {
    pub(crate) store: StoreArgs,
    pub(crate) profile: PathBuf,
    pub(crate) existing: Option<PathBuf>,
    pub(crate) read_only: bool,
    pub(crate) force_rename: bool,
    pub(crate) flags: WriteFlags,
    pub(crate) shadow: Option<Shadow>,
    pub(crate) owner: Option<(u32, u32)>,
    pub(crate) reread: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct MetaWriteCli {
    pub(crate) store: StoreArgs,
    pub(crate) uuid: String,
    pub(crate) loaded_path: Option<PathBuf>,
    pub(crate) allow_relative: bool,
    pub(crate) shadow_storage: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct FilenameCli {
    pub(crate) store: StoreArgs,
    pub(crate) id: String,
    pub(crate) uuid: String,
    pub(crate) existing: Option<PathBuf>,
}

fn take_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a String, String> {
    let v = args
        .get(i + 1)
        .ok_or_else(|| format!("{flag} requires a value"))?;
    if v.starts_with("--") {
        return Err(format!("{flag} requires a value"));
    }
    Ok(v)
}

/// Consumes `--config`/`--dir` at `args[i]`; returns how many args were used.
fn parse_store_arg(args: &[String], i: usize, store: &mut StoreArgs) -> Result<usize, String> {
    match args[i].as_str() {
        "--config" => {
            store.config = Some(PathBuf::from(take_value(args, i, "--config")?));
            Ok(2)
        }
        "--dir" => {
            store.dir = Some(PathBuf::from(take_value(args, i, "--dir")?));
            Ok(2)
        }
        _ => Ok(0),
    }
}

fn parse_owner(raw: &str) -> Result<(u32, u32), String> {
    let (uid, gid) = raw
        .split_once(':')
        .ok_or_else(|| format!("--owner expects <uid>:<gid>, got {raw:?}"))?;
    let uid = uid
        .parse::<u32>()
        .map_err(|e| format!("invalid uid {uid:?}: {e}"))?;
    let gid = gid
        .parse::<u32>()
        .map_err(|e| format!("invalid gid {gid:?}: {e}"))?;
    Ok((uid, gid))
}

pub(crate) fn parse_write_cli(args: &[String]) -> Result<WriteCli, String> {
    let mut store = StoreArgs::default();
    let mut profile: Option<PathBuf> = None;
    let mut existing: Option<PathBuf> = None;
    let mut read_only = false;
    let mut force_rename = false;
    let mut flags = WriteFlags::default();
    let mut shadow_storage: Option<String> = None;
    let mut shadow_owned = false;
    let mut owner: Option<(u32, u32)> = None;
    let mut reread = false;

    let mut i = 0usize;
    while i < args.len() {
        let used = parse_store_arg(args, i, &mut store)?;
        if used > 0 {
            i += used;
            continue;
        }
        let a = &args[i];
        match a.as_str() {
            "--profile" => {
                profile = Some(PathBuf::from(take_value(args, i, "--profile")?));
                i += 2;
            }
            "--existing" => {
                existing = Some(PathBuf::from(take_value(args, i, "--existing")?));
                i += 2;
            }
            "--shadow-storage" => {
                shadow_storage = Some(take_value(args, i, "--shadow-storage")?.clone());
                i += 2;
            }
            "--owner" => {
                owner = Some(parse_owner(take_value(args, i, "--owner")?)?);
                i += 2;
            }
            "--read-only" => {
                read_only = true;
                i += 1;
            }
            "--force-rename" => {
                force_rename = true;
                i += 1;
            }
            "--generated" => {
                flags.generated = true;
                i += 1;
            }
            "--volatile" => {
                flags.volatile = true;
                i += 1;
            }
            "--external" => {
                flags.external = true;
                i += 1;
            }
            "--shadow-owned" => {
                shadow_owned = true;
                i += 1;
            }
            "--reread" => {
                reread = true;
                i += 1;
            }
            _ => return Err(format!("unknown argument: {a}")),
        }
    }

    if shadow_owned && shadow_storage.is_none() {
        return Err("--shadow-owned requires --shadow-storage".to_string());
    }

    Ok(WriteCli {
        store,
        profile: profile.ok_or_else(|| "write requires --profile <json>".to_string())?,
        existing,
        read_only,
        force_rename,
        flags,
        shadow: shadow_storage.map(|storage| Shadow {
            storage,
            owned: shadow_owned,
        }),
        owner,
        reread,
    })
}

/// Parses `<positional> [--config ..] [--dir ..] [extra flags]`.
pub(crate) fn parse_path_cli(
    args: &[String],
    command: &str,
    extra_flag: Option<&str>,
) -> Result<(PathBuf, StoreArgs, bool), String> {
    let mut store = StoreArgs::default();
    let mut path: Option<PathBuf> = None;
    let mut extra = false;

    let mut i = 0usize;
    while i < args.len() {
        let used = parse_store_arg(args, i, &mut store)?;
        if used > 0 {
            i += used;
            continue;
        }
        let a = &args[i];
        match a.as_str() {
            flag if Some(flag) == extra_flag => {
                extra = true;
                i += 1;
            }
            _ if !a.starts_with("--") && path.is_none() => {
                path = Some(PathBuf::from(a));
                i += 1;
            }
            _ => return Err(format!("unknown argument: {a}")),
        }
    }

    let path = path.ok_or_else(|| format!("{command} requires a path"))?;
    Ok((path, store, extra))
}

pub(crate) fn check_perms_kind(meta: bool) -> FileKind {
    if meta { FileKind::Meta } else { FileKind::Keyfile }
}

pub(crate) fn parse_meta_write_cli(args: &[String]) -> Result<MetaWriteCli, String> {
    let mut store = StoreArgs::default();
    let mut uuid: Option<String> = None;
    let mut loaded_path: Option<PathBuf> = None;
    let mut allow_relative = false;
    let mut shadow_storage: Option<String> = None;

    let mut i = 0usize;
    while i < args.len() {
        let used = parse_store_arg(args, i, &mut store)?;
        if used > 0 {
            i += used;
            continue;
        }
        let a = &args[i];
        match a.as_str() {
            "--uuid" => {
                uuid = Some(take_value(args, i, "--uuid")?.clone());
                i += 2;
            }
            "--loaded-path" => {
                loaded_path = Some(PathBuf::from(take_value(args, i, "--loaded-path")?));
                i += 2;
            }
            "--shadow-storage" => {
                shadow_storage = Some(take_value(args, i, "--shadow-storage")?.clone());
                i += 2;
            }
            "--allow-relative" => {
                allow_relative = true;
                i += 1;
            }
            _ => return Err(format!("unknown argument: {a}")),
        }
    }

    Ok(MetaWriteCli {
        store,
        uuid: uuid.ok_or_else(|| "meta-write requires --uuid".to_string())?,
        loaded_path,
        allow_relative,
        shadow_storage,
    })
}

pub(crate) fn parse_filename_cli(args: &[String]) -> Result<FilenameCli, String> {
    let mut store = StoreArgs::default();
    let mut id: Option<String> = None;
    let mut uuid: Option<String> = None;
    let mut existing: Option<PathBuf> = None;

    let mut i = 0usize;
    while i < args.len() {
        let used = parse_store_arg(args, i, &mut store)?;
        if used > 0 {
            i += used;
            continue;
        }
        let a = &args[i];
        match a.as_str() {
            "--id" => {
                id = Some(take_value(args, i, "--id")?.clone());
                i += 2;
            }
            "--uuid" => {
                uuid = Some(take_value(args, i, "--uuid")?.clone());
                i += 2;
            }
            "--existing" => {
                existing = Some(PathBuf::from(take_value(args, i, "--existing")?));
                i += 2;
            }
            _ => return Err(format!("unknown argument: {a}")),
        }
    }

    Ok(FilenameCli {
        store,
        id: id.ok_or_else(|| "filename requires --id".to_string())?,
        uuid: uuid.ok_or_else(|| "filename requires --uuid".to_string())?,
        existing,
    })
}
