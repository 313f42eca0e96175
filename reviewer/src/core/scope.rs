//! Scope index model and its line-oriented document grammar.
//!
//! The document is meant to be committed and diffed, so rendering is fully
//! deterministic: entries are grouped by top-level directory and sorted by
//! path, and fields always appear in the same order. The only volatile line
//! is `Generated:`, which [`normalize`] strips before comparing documents.
//!
//! ```text
//! # Review Index
//!
//! Generated: 2026-10-19T14:00:00Z
//! Position: bin/ls
//!
//! Legend: [ ] pending, [>] current, [x] done, [-] skipped
//!
//! ## bin
//!
//! - [x] bin/cat | files: Makefile=1, c=1 | lines: 420 | reviewed: 2026-10-18 | notes: style fixes
//! - [ ] bin/ls | files: Makefile=1, c=6, h=2 | lines: 3120
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    Pending,
    Current,
    Done,
    Skipped,
}

impl ScopeStatus {
    pub fn marker(self) -> char {
        match self {
            ScopeStatus::Pending => ' ',
            ScopeStatus::Current => '>',
            ScopeStatus::Done => 'x',
            ScopeStatus::Skipped => '-',
        }
    }

    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            ' ' => Some(ScopeStatus::Pending),
            '>' => Some(ScopeStatus::Current),
            'x' | 'X' => Some(ScopeStatus::Done),
            '-' => Some(ScopeStatus::Skipped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScopeStatus::Pending => "pending",
            ScopeStatus::Current => "current",
            ScopeStatus::Done => "done",
            ScopeStatus::Skipped => "skipped",
        }
    }
}

/// One reviewable source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeEntry {
    pub path: String,
    /// Count of qualifying files keyed by suffix (or special file name).
    pub file_counts: BTreeMap<String, u32>,
    pub approx_line_count: u64,
    pub status: ScopeStatus,
    pub reviewed_date: Option<NaiveDate>,
    pub notes: String,
}

impl ScopeEntry {
    pub fn pending(path: &str, file_counts: BTreeMap<String, u32>, approx_line_count: u64) -> Self {
        Self {
            path: path.to_string(),
            file_counts,
            approx_line_count,
            status: ScopeStatus::Pending,
            reviewed_date: None,
            notes: String::new(),
        }
    }

    fn group(&self) -> &str {
        self.path.split('/').next().unwrap_or(&self.path)
    }
}

/// In-memory index state: entries keyed (and therefore sorted) by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexState {
    pub entries: BTreeMap<String, ScopeEntry>,
    /// Suggested next directory, advanced by [`IndexState::mark_done`].
    pub position: Option<String>,
}

impl IndexState {
    pub fn from_entries(entries: impl IntoIterator<Item = ScopeEntry>) -> Self {
        let entries = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        let mut state = Self {
            entries,
            position: None,
        };
        state.position = state.next_pending().map(str::to_string);
        state
    }

    /// First pending entry in path order.
    pub fn next_pending(&self) -> Option<&str> {
        self.entries
            .values()
            .find(|e| e.status == ScopeStatus::Pending)
            .map(|e| e.path.as_str())
    }

    pub fn current(&self) -> Option<&str> {
        self.entries
            .values()
            .find(|e| e.status == ScopeStatus::Current)
            .map(|e| e.path.as_str())
    }

    pub fn has_pending(&self) -> bool {
        self.next_pending().is_some()
    }

    pub fn count(&self, status: ScopeStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }

    /// Make `path` the single current entry. Returns false for unknown paths,
    /// in which case nothing changes.
    pub fn set_current(&mut self, path: &str) -> bool {
        if !self.entries.contains_key(path) {
            return false;
        }
        for entry in self.entries.values_mut() {
            if entry.status == ScopeStatus::Current {
                entry.status = ScopeStatus::Pending;
            }
        }
        if let Some(entry) = self.entries.get_mut(path) {
            entry.status = ScopeStatus::Current;
        }
        true
    }

    /// Mark `path` done on `date` and advance the position to the next pending entry.
    pub fn mark_done(&mut self, path: &str, notes: &str, date: NaiveDate) -> bool {
        let Some(entry) = self.entries.get_mut(path) else {
            return false;
        };
        entry.status = ScopeStatus::Done;
        entry.reviewed_date = Some(date);
        if !notes.trim().is_empty() {
            entry.notes = sanitize_notes(notes);
        }
        self.position = self.next_pending().map(str::to_string);
        true
    }

    pub fn mark_skipped(&mut self, path: &str, notes: &str) -> bool {
        let Some(entry) = self.entries.get_mut(path) else {
            return false;
        };
        entry.status = ScopeStatus::Skipped;
        if !notes.trim().is_empty() {
            entry.notes = sanitize_notes(notes);
        }
        self.position = self.next_pending().map(str::to_string);
        true
    }

    /// Replace entries with a fresh scan, carrying status, date and notes
    /// forward for paths that still exist.
    pub fn merge_scan(&mut self, scanned: Vec<ScopeEntry>) {
        let mut merged = BTreeMap::new();
        for mut entry in scanned {
            if let Some(prev) = self.entries.get(&entry.path) {
                entry.status = prev.status;
                entry.reviewed_date = prev.reviewed_date;
                entry.notes = prev.notes.clone();
            }
            merged.insert(entry.path.clone(), entry);
        }
        self.entries = merged;
        let position_valid = self
            .position
            .as_ref()
            .and_then(|p| self.entries.get(p))
            .is_some_and(|e| e.status == ScopeStatus::Pending);
        if !position_valid {
            self.position = self.next_pending().map(str::to_string);
        }
    }
}

/// Keep notes on a single line and away from the field separator.
fn sanitize_notes(notes: &str) -> String {
    notes
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "/")
}

const TITLE: &str = "# Review Index";
const GENERATED_PREFIX: &str = "Generated: ";
const POSITION_PREFIX: &str = "Position: ";
const LEGEND: &str = "Legend: [ ] pending, [>] current, [x] done, [-] skipped";

/// Render the index document. `generated` is the timestamp line's value.
pub fn render(state: &IndexState, generated: &str) -> String {
    let mut buf = String::new();
    buf.push_str(TITLE);
    buf.push_str("\n\n");
    buf.push_str(GENERATED_PREFIX);
    buf.push_str(generated);
    buf.push('\n');
    if let Some(position) = &state.position {
        buf.push_str(POSITION_PREFIX);
        buf.push_str(position);
        buf.push('\n');
    }
    buf.push('\n');
    buf.push_str(LEGEND);
    buf.push('\n');

    let mut current_group: Option<&str> = None;
    for entry in state.entries.values() {
        let group = entry.group();
        if current_group != Some(group) {
            buf.push_str(&format!("\n## {group}\n\n"));
            current_group = Some(group);
        }
        buf.push_str(&render_entry(entry));
        buf.push('\n');
    }
    buf
}

fn render_entry(entry: &ScopeEntry) -> String {
    let counts = if entry.file_counts.is_empty() {
        "-".to_string()
    } else {
        entry
            .file_counts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut line = format!(
        "- [{}] {} | files: {} | lines: {}",
        entry.status.marker(),
        entry.path,
        counts,
        entry.approx_line_count
    );
    if let Some(date) = entry.reviewed_date {
        line.push_str(&format!(" | reviewed: {}", date.format("%Y-%m-%d")));
    }
    if !entry.notes.is_empty() {
        line.push_str(&format!(" | notes: {}", entry.notes));
    }
    line
}

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^- \[(.)\] (.+?) \| files: ([^|]*?) \| lines: (\d+)(?: \| reviewed: (\d{4}-\d{2}-\d{2}))?(?: \| notes: (.*))?$",
    )
    .expect("entry regex")
});

/// Parse a rendered document back into state. Returns the state and the
/// `Generated:` value, if present.
pub fn parse(document: &str) -> Result<(IndexState, Option<String>), String> {
    let mut state = IndexState::default();
    let mut generated = None;
    for (lineno, raw) in document.lines().enumerate() {
        let line = raw.trim_end();
        if let Some(value) = line.strip_prefix(GENERATED_PREFIX) {
            generated = Some(value.trim().to_string());
            continue;
        }
        if let Some(value) = line.strip_prefix(POSITION_PREFIX) {
            let value = value.trim();
            state.position = (!value.is_empty()).then(|| value.to_string());
            continue;
        }
        if !line.starts_with("- [") {
            continue;
        }
        let entry = parse_entry(line).ok_or_else(|| format!("line {}: malformed entry '{line}'", lineno + 1))?;
        state.entries.insert(entry.path.clone(), entry);
    }
    Ok((state, generated))
}

fn parse_entry(line: &str) -> Option<ScopeEntry> {
    let caps = ENTRY_RE.captures(line)?;
    let marker = caps.get(1)?.as_str().chars().next()?;
    let status = ScopeStatus::from_marker(marker)?;
    let path = caps.get(2)?.as_str().to_string();
    let counts_raw = caps.get(3)?.as_str().trim();
    let mut file_counts = BTreeMap::new();
    if counts_raw != "-" {
        for pair in counts_raw.split(',') {
            let (key, value) = pair.trim().split_once('=')?;
            file_counts.insert(key.to_string(), value.parse().ok()?);
        }
    }
    let approx_line_count = caps.get(4)?.as_str().parse().ok()?;
    let reviewed_date = match caps.get(5) {
        Some(m) => Some(NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok()?),
        None => None,
    };
    let notes = caps.get(6).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    Some(ScopeEntry {
        path,
        file_counts,
        approx_line_count,
        status,
        reviewed_date,
        notes,
    })
}

/// Strip the volatile timestamp so two renders can be compared for content.
pub fn normalize(document: &str) -> String {
    document
        .lines()
        .filter(|l| !l.starts_with(GENERATED_PREFIX))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn sample() -> IndexState {
        IndexState::from_entries(vec![
            ScopeEntry::pending("bin/ls", counts(&[("c", 6), ("Makefile", 1)]), 3120),
            ScopeEntry::pending("bin/cat", counts(&[("c", 1)]), 420),
            ScopeEntry::pending("sys/kern", counts(&[("c", 90), ("h", 3)]), 120_000),
        ])
    }

    #[test]
    fn next_pending_is_first_in_path_order() {
        assert_eq!(sample().next_pending(), Some("bin/cat"));
        assert_eq!(sample().position.as_deref(), Some("bin/cat"));
    }

    #[test]
    fn set_current_keeps_at_most_one_current() {
        let mut state = sample();
        for path in ["bin/ls", "sys/kern", "bin/cat", "nope", "bin/ls"] {
            state.set_current(path);
            assert!(state.count(ScopeStatus::Current) <= 1);
        }
        assert_eq!(state.current(), Some("bin/ls"));
    }

    #[test]
    fn set_current_on_unknown_path_changes_nothing() {
        let mut state = sample();
        state.set_current("bin/cat");
        assert!(!state.set_current("usr.bin/nope"));
        assert_eq!(state.current(), Some("bin/cat"));
    }

    #[test]
    fn mark_done_stamps_date_and_advances_position() {
        let mut state = sample();
        state.set_current("bin/cat");
        let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert!(state.mark_done("bin/cat", "fixed | two\nbugs", day));
        let entry = &state.entries["bin/cat"];
        assert_eq!(entry.status, ScopeStatus::Done);
        assert_eq!(entry.reviewed_date, Some(day));
        assert_eq!(entry.notes, "fixed / two bugs");
        assert_eq!(state.position.as_deref(), Some("bin/ls"));
        assert_eq!(state.current(), None);
    }

    #[test]
    fn render_then_parse_round_trips() {
        let mut state = sample();
        state.set_current("bin/ls");
        state.mark_done(
            "bin/cat",
            "style fixes",
            NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
        );
        state.mark_skipped("sys/kern", "too large for now");

        let doc = render(&state, "2026-10-19T00:00:00Z");
        let (parsed, generated) = parse(&doc).expect("parse");
        assert_eq!(parsed, state);
        assert_eq!(generated.as_deref(), Some("2026-10-19T00:00:00Z"));
    }

    #[test]
    fn render_groups_by_top_level_directory() {
        let doc = render(&sample(), "t");
        let bin = doc.find("## bin").expect("bin group");
        let sys = doc.find("## sys").expect("sys group");
        assert!(bin < sys);
        assert!(doc.contains("- [ ] bin/ls | files: Makefile=1, c=6 | lines: 3120\n"));
    }

    #[test]
    fn normalize_ignores_only_the_timestamp() {
        let state = sample();
        assert_eq!(
            normalize(&render(&state, "one")),
            normalize(&render(&state, "two"))
        );
        let mut changed = state.clone();
        changed.set_current("bin/ls");
        assert_ne!(
            normalize(&render(&state, "one")),
            normalize(&render(&changed, "one"))
        );
    }

    #[test]
    fn merge_scan_preserves_status_and_drops_missing() {
        let mut state = sample();
        let day = NaiveDate::from_ymd_opt(2026, 2, 2).unwrap();
        state.mark_done("bin/cat", "ok", day);
        state.merge_scan(vec![
            ScopeEntry::pending("bin/cat", counts(&[("c", 2)]), 500),
            ScopeEntry::pending("bin/echo", counts(&[("c", 1)]), 80),
        ]);
        assert_eq!(state.entries.len(), 2);
        let cat = &state.entries["bin/cat"];
        assert_eq!(cat.status, ScopeStatus::Done);
        assert_eq!(cat.reviewed_date, Some(day));
        assert_eq!(cat.approx_line_count, 500);
        assert!(!state.entries.contains_key("bin/ls"));
        assert_eq!(state.position.as_deref(), Some("bin/echo"));
    }

    #[test]
    fn parse_rejects_garbled_entries() {
        let err = parse("# Review Index\n\n- [?] bin/cat | files: c=1 | lines: 3\n").unwrap_err();
        assert!(err.contains("line 3"));
    }
}
