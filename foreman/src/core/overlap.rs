//! Changed-line overlap between task branches.
//!
//! Ranges come from zero-context unified diffs in old-side (merge base)
//! coordinates. A file with no parsed hunks (binary, rename, mode change)
//! is treated as changed everywhere.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

static HUNK_HEADER: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+\d+(?:,\d+)? @@").expect("valid hunk regex")
});

static DIFF_HEADER: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"^diff --git (?:"a/.+" "b/(.+)"|a/.+ b/(.+))$"#)
        .expect("valid diff header regex")
});

/// Inclusive old-side line range touched by one hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// Build from a hunk's `-start,len`. Pure insertions (`len == 0`) sit
    /// between `start` and `start + 1`.
    pub fn from_hunk(start: u32, len: u32) -> Self {
        if len == 0 {
            Self {
                start,
                end: start.saturating_add(1),
            }
        } else {
            Self {
                start,
                end: start.saturating_add(len - 1),
            }
        }
    }

    /// Overlapping or adjacent.
    pub fn touches(&self, other: &LineRange) -> bool {
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }
}

/// Changed files mapped to their changed ranges; an empty list means the
/// whole file.
pub type TouchedFiles = BTreeMap<String, Vec<LineRange>>;

/// Undo git's C-style path quoting (`\"`, `\\`, `\t`, `\n`, octal bytes).
fn unquote(quoted: &str) -> String {
    let mut bytes = Vec::with_capacity(quoted.len());
    let mut input = quoted.bytes().peekable();
    while let Some(byte) = input.next() {
        if byte != b'\\' {
            bytes.push(byte);
            continue;
        }
        match input.next() {
            Some(b't') => bytes.push(b'\t'),
            Some(b'n') => bytes.push(b'\n'),
            Some(digit @ b'0'..=b'7') => {
                let mut value = u32::from(digit - b'0');
                for _ in 0..2 {
                    match input.peek() {
                        Some(&(next @ b'0'..=b'7')) => {
                            value = value * 8 + u32::from(next - b'0');
                            input.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(u8::try_from(value).unwrap_or(b'?'));
            }
            Some(other) => bytes.push(other),
            None => bytes.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse `git diff -U0` output into per-file old-side ranges.
pub fn parse_zero_context_diff(diff: &str) -> TouchedFiles {
    let mut files = TouchedFiles::new();
    let mut current: Option<String> = None;
    for line in diff.lines() {
        if let Some(caps) = DIFF_HEADER.captures(line) {
            let path = match (caps.get(1), caps.get(2)) {
                (Some(quoted), _) => unquote(quoted.as_str()),
                (None, Some(plain)) => plain.as_str().to_string(),
                (None, None) => continue,
            };
            files.entry(path.clone()).or_default();
            current = Some(path);
            continue;
        }
        let Some(path) = current.as_ref() else {
            continue;
        };
        if let Some(caps) = HUNK_HEADER.captures(line) {
            let start = caps[1].parse::<u32>().unwrap_or(0);
            let len = caps
                .get(2)
                .map_or(1, |len| len.as_str().parse::<u32>().unwrap_or(1));
            files
                .entry(path.clone())
                .or_default()
                .push(LineRange::from_hunk(start, len));
        }
    }
    files
}

/// How an incoming branch relates to what is already merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeClass {
    /// No file in common.
    Disjoint,
    /// Shared files, but changed ranges neither overlap nor touch.
    NonOverlapping { files: Vec<String> },
    /// Shared files with overlapping or adjacent ranges.
    Overlapping { files: Vec<String> },
}

pub fn classify(touched: &TouchedFiles, incoming: &TouchedFiles) -> MergeClass {
    let shared: Vec<String> = incoming
        .keys()
        .filter(|path| touched.contains_key(*path))
        .cloned()
        .collect();
    if shared.is_empty() {
        return MergeClass::Disjoint;
    }

    let overlapping: Vec<String> = shared
        .iter()
        .filter(|path| {
            let ours = &touched[*path];
            let theirs = &incoming[*path];
            ours.is_empty()
                || theirs.is_empty()
                || ours
                    .iter()
                    .any(|left| theirs.iter().any(|right| left.touches(right)))
        })
        .cloned()
        .collect();

    if overlapping.is_empty() {
        MergeClass::NonOverlapping { files: shared }
    } else {
        MergeClass::Overlapping { files: overlapping }
    }
}

/// Fold a merged branch's changes into the running set.
pub fn absorb(touched: &mut TouchedFiles, incoming: &TouchedFiles) {
    for (path, ranges) in incoming {
        match touched.get_mut(path) {
            None => {
                touched.insert(path.clone(), ranges.clone());
            }
            // Already whole-file.
            Some(existing) if existing.is_empty() => {}
            Some(existing) if ranges.is_empty() => existing.clear(),
            Some(existing) => {
                existing.extend(ranges.iter().copied());
                existing.sort();
                existing.dedup();
            }
        }
    }
}
