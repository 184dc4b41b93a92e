use crate::profile::Profile;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    OnlyInOriginal,
    OnlyInReparsed,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDiff {
    pub setting: String,
    pub key: String,
    pub kind: DiffKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "diff", rename_all = "snake_case")]
pub enum Verification {
    Identical,
    Differs(Vec<FieldDiff>),
}

impl Verification {
    pub fn is_identical(&self) -> bool {
        matches!(self, Verification::Identical)
    }
}

fn fields(p: &Profile) -> BTreeSet<(&str, &str)> {
    p.settings()
        .flat_map(|(s, setting)| setting.iter().map(move |(k, _)| (s, k)))
        .collect()
}

/// Field-by-field comparison of two normalized profiles.
///
/// Key order and formatting of the serialized form don't matter; only the
/// typed values do. Diffs come out sorted by setting, then key.
pub fn verify(original: &Profile, reparsed: &Profile) -> Verification {
    let keys: BTreeSet<(&str, &str)> = fields(original).union(&fields(reparsed)).copied().collect();

    let diff: Vec<FieldDiff> = keys
        .into_iter()
        .filter_map(|(setting, key)| {
            let kind = match (original.get(setting, key), reparsed.get(setting, key)) {
                (Some(a), Some(b)) if a == b => return None,
                (Some(_), Some(_)) => DiffKind::Changed,
                (Some(_), None) => DiffKind::OnlyInOriginal,
                (None, Some(_)) => DiffKind::OnlyInReparsed,
                (None, None) => return None,
            };
            Some(FieldDiff {
                setting: setting.to_string(),
                key: key.to_string(),
                kind,
            })
        })
        .collect();

    if diff.is_empty() {
        Verification::Identical
    } else {
        Verification::Differs(diff)
    }
}
