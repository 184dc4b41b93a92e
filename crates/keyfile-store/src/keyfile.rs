//! Line-oriented `[group]` / `key=value` record format.
//!
//! Values are held unescaped in memory and escaped on output the way GLib
//! keyfiles are (`\\`, `\n`, `\t`, `\r`, leading `\s`). Unknown escapes such
//! as the list separator escape `\;` are preserved verbatim so list values
//! can be split after parsing.

use crate::errors::KeyFileError;

/// Only these surround keys and values; any other whitespace is content.
const BLANK: [char; 2] = [' ', '\t'];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    groups: Vec<Group>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn group_mut(&mut self, name: &str) -> &mut Group {
        let idx = match self.groups.iter().position(|g| g.name == name) {
            Some(idx) => idx,
            None => {
                self.groups.push(Group {
                    name: name.to_string(),
                    entries: vec![],
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[idx]
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    pub fn entries<'a>(&'a self, group: &str) -> impl Iterator<Item = (&'a str, &'a str)> + use<'a> {
        self.group(group)
            .into_iter()
            .flat_map(|g| g.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn get_string(&self, group: &str, key: &str) -> Option<&str> {
        self.group(group)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_bool(&self, group: &str, key: &str) -> Option<bool> {
        match self.get_string(group, key)? {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    pub fn set_string(&mut self, group: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let g = self.group_mut(group);
        match g.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => g.entries.push((key.to_string(), value)),
        }
    }

    pub fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.set_string(group, key, if value { "true" } else { "false" });
    }

    pub fn remove_key(&mut self, group: &str, key: &str) -> bool {
        let Some(g) = self.groups.iter_mut().find(|g| g.name == group) else {
            return false;
        };
        let before = g.entries.len();
        g.entries.retain(|(k, _)| k != key);
        before != g.entries.len()
    }

    pub fn to_data(&self) -> String {
        let mut out = String::new();
        for (i, g) in self.groups.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(&g.name);
            out.push_str("]\n");
            for (k, v) in &g.entries {
                out.push_str(k);
                out.push('=');
                out.push_str(&escape_value(v));
                out.push('\n');
            }
        }
        out
    }

    pub fn parse(data: &str) -> Result<Self, KeyFileError> {
        let mut kf = KeyFile::new();
        let mut current: Option<String> = None;

        for (idx, raw_line) in data.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim_start_matches(BLANK);
            if line.is_empty() || line.starts_with(['#', ';']) {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.trim_end_matches(BLANK).strip_suffix(']').ok_or_else(|| {
                    KeyFileError::Syntax {
                        line: line_no,
                        message: format!("unterminated group header {line:?}"),
                    }
                })?;
                if name.is_empty() || name.contains(['[', ']']) {
                    return Err(KeyFileError::Syntax {
                        line: line_no,
                        message: format!("invalid group name {name:?}"),
                    });
                }
                kf.group_mut(name);
                current = Some(name.to_string());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(KeyFileError::Syntax {
                    line: line_no,
                    message: format!("expected key=value, got {line:?}"),
                });
            };
            let Some(group) = current.as_deref() else {
                return Err(KeyFileError::Syntax {
                    line: line_no,
                    message: "key/value pair outside of any group".to_string(),
                });
            };
            let key = key.trim_end_matches(BLANK);
            if key.is_empty() {
                return Err(KeyFileError::Syntax {
                    line: line_no,
                    message: "empty key".to_string(),
                });
            }
            let value = unescape_value(value.trim_start_matches(BLANK));
            kf.set_string(group, key, value);
        }
        Ok(kf)
    }
}

fn escape_value(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for (i, c) in v.chars().enumerate() {
        match c {
            ' ' if i == 0 => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_value(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    let mut chars = v.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Encodes a string list as `a;b;c;`, escaping separators inside elements.
pub fn join_list(items: &[String]) -> String {
    let mut out = String::new();
    for item in items {
        for c in item.chars() {
            match c {
                ';' => out.push_str("\\;"),
                '\\' => out.push_str("\\\\"),
                c => out.push(c),
            }
        }
        out.push(';');
    }
    out
}

pub fn split_list(raw: &str) -> Vec<String> {
    let mut out = vec![];
    let mut cur = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => cur.push(next),
                None => cur.push('\\'),
            },
            ';' => out.push(std::mem::take(&mut cur)),
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}
