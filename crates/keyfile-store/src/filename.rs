use crate::errors::AllocateError;
use log::debug;
use std::path::{Path, PathBuf};

pub const SUFFIX_NMCONNECTION: &str = ".nmconnection";
pub const SUFFIX_NMMETA: &str = ".nmmeta";

/// Candidates tried after the plain `id` and `id-uuid` names.
pub const MAX_NAME_ATTEMPTS: u32 = 10_000;

const NAME_MAX: usize = 255;

const IGNORED_SUFFIXES: [&str; 11] = [
    ".pem", ".der", ".p12", ".crt", ".key", ".swp", ".swpx", ".tmp", ".bak", ".orig", ".rej",
];

fn has_suffix_ignore_case(name: &str, suffix: &str) -> bool {
    name.len() > suffix.len()
        && name.is_char_boundary(name.len() - suffix.len())
        && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

// mkstemp() leaves names ending in ".XXXXXX"
fn has_mkstemp_suffix(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() > 7 && b[b.len() - 7] == b'.' && b[b.len() - 6..].iter().all(u8::is_ascii_alphanumeric)
}

/// Whether a directory scan skips `filename` (hidden, backup, temporary,
/// metadata or certificate files).
pub fn ignore_filename(filename: &str, require_extension: bool) -> bool {
    let base = filename.rsplit('/').next().unwrap_or(filename);
    if base.is_empty() || base.starts_with('.') {
        return true;
    }
    if require_extension {
        return !(base.len() > SUFFIX_NMCONNECTION.len() && base.ends_with(SUFFIX_NMCONNECTION));
    }
    base.ends_with('~')
        || has_mkstemp_suffix(base)
        || has_suffix_ignore_case(base, SUFFIX_NMMETA)
        || IGNORED_SUFFIXES
            .iter()
            .any(|s| has_suffix_ignore_case(base, s))
}

fn truncate_to(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Turns a profile name into a file name that a directory scan will not skip.
///
/// Legacy (extension-less) names escape `/` with `*`; `.nmconnection` names
/// use `_`. Names that would still be ignored get a trailing `_`.
pub fn create_filename(name: &str, with_extension: bool) -> String {
    let escape = if with_extension { '_' } else { '*' };
    let mut out: String = name
        .chars()
        .map(|c| if c == '/' { escape } else { c })
        .collect();
    if out.starts_with('.') {
        out.replace_range(0..1, "_");
    }

    let reserved = if with_extension {
        SUFFIX_NMCONNECTION.len()
    } else {
        1
    };
    truncate_to(&mut out, NAME_MAX - reserved);

    if with_extension {
        out.push_str(SUFFIX_NMCONNECTION);
    } else if ignore_filename(&out, false) {
        out.push('_');
    }
    out
}

/// Placement inputs for choosing a profile's file name.
pub struct FilenameAllocator<'a> {
    pub dir: &'a Path,
    pub with_extension: bool,
    pub existing_path: Option<&'a Path>,
    pub must_rename: bool,
    /// Returns true for candidates reserved by someone else.
    pub reject: Option<&'a dyn Fn(&Path) -> bool>,
}

impl<'a> FilenameAllocator<'a> {
    pub fn new(dir: &'a Path, with_extension: bool) -> Self {
        Self {
            dir,
            with_extension,
            existing_path: None,
            must_rename: false,
            reject: None,
        }
    }

    fn candidate(&self, id: &str, uuid: &str, attempt: i64) -> Option<PathBuf> {
        let name = match attempt {
            -2 => return self.existing_path.map(Path::to_path_buf),
            -1 => id.to_string(),
            0 => format!("{id}-{uuid}"),
            i => format!("{id}-{uuid}-{i}"),
        };
        Some(self.dir.join(create_filename(&name, self.with_extension)))
    }

    /// Picks the first acceptable path: the existing path (unless renaming),
    /// then `id`, `id-uuid`, `id-uuid-1` ... `id-uuid-9999`.
    ///
    /// A candidate is skipped if the caller rejects it or, unless it is the
    /// existing path, something already exists there. The existence check is
    /// not atomic with the later write; only one writer per directory is
    /// expected.
    pub fn allocate(&self, id: &str, uuid: &str) -> Result<PathBuf, AllocateError> {
        if id.is_empty() {
            return Err(AllocateError::EmptyId);
        }

        for attempt in -2..i64::from(MAX_NAME_ATTEMPTS) {
            if attempt == -2 && self.must_rename {
                continue;
            }
            let Some(candidate) = self.candidate(id, uuid, attempt) else {
                continue;
            };
            let is_existing = self.existing_path == Some(candidate.as_path());
            if is_existing && self.must_rename {
                continue;
            }
            if let Some(reject) = self.reject
                && reject(&candidate)
            {
                debug!(
                    "event=keyfile_name_rejected candidate={}",
                    candidate.display()
                );
                continue;
            }
            if !is_existing && std::fs::symlink_metadata(&candidate).is_ok() {
                continue;
            }
            return Ok(candidate);
        }

        Err(AllocateError::NoAvailableName {
            first_candidate: self
                .dir
                .join(create_filename(id, self.with_extension)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "11111111-1111-1111-1111-111111111111";

    #[test]
    fn create_filename_escapes_slashes_and_hidden_names() {
        assert_eq!(create_filename("a/b", false), "a*b");
        assert_eq!(create_filename("a/b", true), "a_b.nmconnection");
        assert_eq!(create_filename(".hidden", false), "_hidden");
        assert_eq!(create_filename("backup~", false), "backup~_");
        assert_eq!(create_filename("client.pem", false), "client.pem_");
        assert_eq!(create_filename("home-wifi", false), "home-wifi");
    }

    #[test]
    fn created_names_are_never_ignored() {
        for name in ["x.nmmeta", "y.tmp", "z.abcdef", ".", "w~", "cert.DER", "plain"] {
            assert!(!ignore_filename(&create_filename(name, false), false), "{name}");
            assert!(!ignore_filename(&create_filename(name, true), true), "{name}");
        }
    }

    #[test]
    fn long_names_are_truncated_on_char_boundaries() {
        let long = "é".repeat(200);
        let name = create_filename(&long, true);
        assert!(name.len() <= NAME_MAX);
        assert!(name.ends_with(SUFFIX_NMCONNECTION));
    }

    #[test]
    fn ignore_filename_classifies_scan_noise() {
        assert!(ignore_filename("/etc/nm/.hidden", false));
        assert!(ignore_filename("home~", false));
        assert!(ignore_filename("home.Ab12Cd", false));
        assert!(ignore_filename(&format!("{UUID}.nmmeta"), false));
        assert!(ignore_filename("ca.PEM", false));
        assert!(!ignore_filename("home", false));
        assert!(ignore_filename("home", true));
        assert!(!ignore_filename("home.nmconnection", true));
        assert!(ignore_filename(".nmconnection", true));
    }

    #[test]
    fn existing_path_is_reused_unless_renaming() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("old-name");
        std::fs::write(&existing, "").unwrap();

        let mut alloc = FilenameAllocator::new(dir.path(), false);
        alloc.existing_path = Some(&existing);
        assert_eq!(alloc.allocate("home", UUID).unwrap(), existing);

        alloc.must_rename = true;
        assert_eq!(alloc.allocate("home", UUID).unwrap(), dir.path().join("home"));
    }

    #[test]
    fn numbered_suffix_follows_id_and_id_uuid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("home"), "").unwrap();
        std::fs::write(dir.path().join(format!("home-{UUID}")), "").unwrap();

        let alloc = FilenameAllocator::new(dir.path(), false);
        assert_eq!(
            alloc.allocate("home", UUID).unwrap(),
            dir.path().join(format!("home-{UUID}-1"))
        );

        std::fs::write(dir.path().join(format!("home-{UUID}-1")), "").unwrap();
        assert_eq!(
            alloc.allocate("home", UUID).unwrap(),
            dir.path().join(format!("home-{UUID}-2"))
        );
    }

    #[test]
    fn dangling_symlinks_count_as_taken() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/nonexistent", dir.path().join("home")).unwrap();
        let alloc = FilenameAllocator::new(dir.path(), false);
        assert_eq!(
            alloc.allocate("home", UUID).unwrap(),
            dir.path().join(format!("home-{UUID}"))
        );
    }

    #[test]
    fn empty_id_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = FilenameAllocator::new(dir.path(), false);
        assert!(matches!(alloc.allocate("", UUID), Err(AllocateError::EmptyId)));
    }
}
