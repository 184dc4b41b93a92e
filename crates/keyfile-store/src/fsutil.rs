use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

pub(crate) const SECURE_FILE_MODE: u32 = 0o600;
pub(crate) const DIR_MODE: u32 = 0o755;

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn tmp_path_for(path: &Path) -> std::io::Result<PathBuf> {
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid path (missing file name): {}", path.display()),
        )
    })?;
    Ok(path.with_file_name(format!(
        "{}.{}.tmp",
        file_name.to_string_lossy(),
        std::process::id()
    )))
}

/// Atomically replaces `path` with `contents`, created with `mode`.
///
/// The data goes to a sibling temporary first and is renamed into place, so
/// readers never observe a partially written file. The temporary is removed
/// when any step fails.
pub(crate) fn file_set_contents(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let tmp = tmp_path_for(path)?;
    if tmp.exists() {
        let _ = fs::remove_file(&tmp);
    }

    let res = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&tmp)?;
        // the umask may have masked bits off the requested mode
        file.set_permissions(Permissions::from_mode(mode))?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}

/// If `path` names an entry directly inside `dir`, returns that entry's name.
pub(crate) fn file_is_in_path<'a>(path: &'a Path, dir: &Path) -> Option<&'a str> {
    let rel = path.strip_prefix(dir).ok()?;
    let mut components = rel.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name.to_str(),
        _ => None,
    }
}

/// Reads a symlink target, resolving a relative target against the link's directory.
pub(crate) fn read_link_absolute(path: &Path) -> std::io::Result<PathBuf> {
    let target = fs::read_link(path)?;
    if target.is_absolute() {
        return Ok(target);
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    Ok(parent.join(target))
}

/// Removes a file, treating absence as success. Returns whether a file was removed.
pub(crate) fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, Permissions::from_mode(DIR_MODE))
}
