//! Directory listing entries and parsers for `MLSD`, `LIST` and `NLST`.

use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use rmcp::schemars::{self, JsonSchema};

/// Listing format requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ListMode {
    /// Human-readable `LIST` output.
    #[default]
    Default,
    /// Bare names via `NLST`.
    NamesOnly,
    /// Structured facts via `MLSD`.
    MachineReadable,
}

/// What a listing entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Link,
    Other,
    /// Name-only listings carry no type information.
    Unknown,
}

impl EntryKind {
    pub fn is_directory(self) -> bool {
        self == EntryKind::Directory
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl RemoteEntry {
    fn named(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: None,
            modified: None,
            facts: BTreeMap::new(),
            raw: None,
        }
    }

    /// `.` and `..` entries, which tree walks must skip.
    pub fn is_self_or_parent(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Parse one `MLSD` line: `type=file;size=12;modify=20240101120000; name`.
pub fn parse_mlsd_line(line: &str) -> Option<RemoteEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (facts_part, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }
    let facts: BTreeMap<String, String> = facts_part
        .split(';')
        .filter_map(|fact| fact.split_once('='))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect();

    let kind = match facts.get("type").map(|t| t.to_ascii_lowercase()) {
        Some(t) if t == "file" => EntryKind::File,
        Some(t) if t == "dir" || t == "cdir" || t == "pdir" => EntryKind::Directory,
        Some(t) if t.starts_with("os.unix=slink") || t.starts_with("os.unix=symlink") => {
            EntryKind::Link
        }
        Some(_) => EntryKind::Other,
        None => EntryKind::Unknown,
    };
    let cdir_or_pdir = matches!(
        facts.get("type").map(|t| t.to_ascii_lowercase()).as_deref(),
        Some("cdir") | Some("pdir")
    );

    let mut entry = RemoteEntry::named(if cdir_or_pdir { "." } else { name }, kind);
    entry.size = facts
        .get("size")
        .or_else(|| facts.get("sizd"))
        .and_then(|s| s.parse().ok());
    entry.modified = facts.get("modify").and_then(|m| parse_mlsd_time(m));
    entry.facts = facts;
    entry.raw = Some(line.to_string());
    Some(entry)
}

/// Convert an MLSD `modify` fact (`YYYYMMDDHHMMSS[.sss]`, UTC) to RFC 3339.
fn parse_mlsd_time(value: &str) -> Option<String> {
    let whole = value.split('.').next()?;
    let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive).to_rfc3339())
}

/// Parse one `LIST` line in either Unix (`ls -l`) or DOS style.
///
/// Lines that match neither layout come back as [`EntryKind::Other`] with the
/// whole line as the name, so nothing the server sent is lost.
pub fn parse_list_line(line: &str) -> RemoteEntry {
    let line = line.trim_end_matches(['\r', '\n']);
    parse_unix_line(line)
        .or_else(|| parse_dos_line(line))
        .unwrap_or_else(|| {
            let mut entry = RemoteEntry::named(line.trim(), EntryKind::Other);
            entry.raw = Some(line.to_string());
            entry
        })
}

fn parse_unix_line(line: &str) -> Option<RemoteEntry> {
    let (fields, rest) = split_fields(line, 8)?;
    let perms = fields[0];
    if perms.len() < 10 {
        return None;
    }
    let kind = match perms.chars().next()? {
        'd' => EntryKind::Directory,
        '-' => EntryKind::File,
        'l' => EntryKind::Link,
        _ => EntryKind::Other,
    };
    let size = fields[4].parse().ok()?;
    let name = match kind {
        EntryKind::Link => rest.split(" -> ").next().unwrap_or(rest),
        _ => rest,
    };
    let mut entry = RemoteEntry::named(name, kind);
    entry.size = Some(size);
    entry.modified = Some(fields[5..8].join(" "));
    entry.raw = Some(line.to_string());
    Some(entry)
}

fn parse_dos_line(line: &str) -> Option<RemoteEntry> {
    let (fields, name) = split_fields(line, 3)?;
    if !fields[0].starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let (kind, size) = if fields[2].eq_ignore_ascii_case("<DIR>") {
        (EntryKind::Directory, None)
    } else {
        (EntryKind::File, Some(fields[2].parse().ok()?))
    };
    let mut entry = RemoteEntry::named(name, kind);
    entry.size = size;
    entry.modified = Some(format!("{} {}", fields[0], fields[1]));
    entry.raw = Some(line.to_string());
    Some(entry)
}

/// Split off the first `n` whitespace-separated fields and return the
/// remainder verbatim, preserving spaces inside file names.
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while fields.len() < n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        return None;
    }
    Some((fields, rest))
}

/// Wrap an `NLST` name. Servers may answer with a path; keep the last segment.
pub fn parse_name_line(line: &str) -> RemoteEntry {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim_end_matches('/');
    let name = trimmed.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or(line);
    let mut entry = RemoteEntry::named(name, EntryKind::Unknown);
    entry.raw = Some(line.to_string());
    entry
}

/// Parse a whole listing according to `mode`, keeping server order.
pub fn parse_listing(lines: &[String], mode: ListMode) -> Vec<RemoteEntry> {
    match mode {
        ListMode::Default => lines
            .iter()
            .filter(|l| !l.trim().is_empty() && !l.starts_with("total "))
            .map(|l| parse_list_line(l))
            .collect(),
        ListMode::NamesOnly => lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| parse_name_line(l))
            .collect(),
        ListMode::MachineReadable => lines.iter().filter_map(|l| parse_mlsd_line(l)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use crate::listing::{
        EntryKind, ListMode, parse_list_line, parse_listing, parse_mlsd_line, parse_name_line,
    };

    #[test]
    fn mlsd_file_with_facts() {
        let entry =
            parse_mlsd_line("type=file;size=1024;modify=20240315101530;perm=r; report final.txt")
                .unwrap();
        assert_eq!(entry.name, "report final.txt");
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, Some(1024));
        assert_eq!(entry.modified.as_deref(), Some("2024-03-15T10:15:30+00:00"));
        assert_eq!(entry.facts.get("perm").map(String::as_str), Some("r"));
    }

    #[test]
    fn mlsd_current_dir_is_self() {
        let entry = parse_mlsd_line("type=cdir;modify=20240101000000; /home/user").unwrap();
        assert!(entry.is_self_or_parent());
        assert_eq!(entry.kind, EntryKind::Directory);
    }

    #[test]
    fn mlsd_fractional_timestamp_and_symlink() {
        let entry =
            parse_mlsd_line("type=OS.unix=slink:/target;modify=20240101000000.123; link").unwrap();
        assert_eq!(entry.kind, EntryKind::Link);
        assert_eq!(entry.modified.as_deref(), Some("2024-01-01T00:00:00+00:00"));
    }

    #[test]
    fn unix_list_line() {
        let entry = parse_list_line("-rw-r--r--   1 user  group   532 Jan 05 12:00 my notes.txt");
        assert_eq!(entry.name, "my notes.txt");
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, Some(532));
        assert_eq!(entry.modified.as_deref(), Some("Jan 05 12:00"));

        let link = parse_list_line("lrwxrwxrwx 1 user group 7 Jan 05 2023 latest -> v1.2.3");
        assert_eq!(link.kind, EntryKind::Link);
        assert_eq!(link.name, "latest");
    }

    #[test]
    fn dos_list_line() {
        let dir = parse_list_line("01-05-24  12:00PM       <DIR>          Reports");
        assert_eq!(dir.kind, EntryKind::Directory);
        assert_eq!(dir.name, "Reports");
        let file = parse_list_line("01-05-24  12:00PM              4096 data.csv");
        assert_eq!(file.size, Some(4096));
    }

    #[test]
    fn unparseable_list_line_is_kept() {
        let entry = parse_list_line("something odd");
        assert_eq!(entry.kind, EntryKind::Other);
        assert_eq!(entry.name, "something odd");
    }

    #[test]
    fn nlst_paths_reduce_to_names() {
        assert_eq!(parse_name_line("docs/a.txt").name, "a.txt");
        assert_eq!(parse_name_line("plain").name, "plain");
    }

    #[test]
    fn listing_keeps_server_order_and_skips_totals() {
        let lines = vec![
            "total 8".to_string(),
            "-rw-r--r-- 1 u g 1 Jan 01 00:00 zeta".to_string(),
            "drwxr-xr-x 2 u g 0 Jan 01 00:00 alpha".to_string(),
        ];
        let entries = parse_listing(&lines, ListMode::Default);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }
}
