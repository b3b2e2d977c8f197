//! Scoped filesystem operations.
//!
//! Every function here runs after the privilege drop has confined the
//! process, so arguments are bare names inside the current directory.
//! Analysis runs name their output directories after the ctime-style
//! timestamp of the run, with underscores for spaces; listings sniff
//! for that convention and present such directories newest-first.

use std::path::Path;

use chrono::NaiveDateTime;
use log::debug;

use crate::error::{BrokerError, BrokerResult};

/// Underscore-for-space ctime layout, e.g. `Tue_Mar_04_14:22:10_2025`.
const DIR_TIMESTAMP_FORMAT: &str = "%a_%b_%d_%H:%M:%S_%Y";

/// Which entry class a listing collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Files,
    Dirs,
}

pub fn create_dir(name: &str) -> BrokerResult<()> {
    std::fs::create_dir(name)
        .map_err(|e| BrokerError::Fs(format!("creating directory '{name}': {e}")))
}

pub fn delete_file(name: &str) -> BrokerResult<()> {
    std::fs::remove_file(name)
        .map_err(|e| BrokerError::Fs(format!("deleting file '{name}': {e}")))
}

/// Remove a directory and everything under it.
pub fn delete_dir(name: &str) -> BrokerResult<()> {
    std::fs::remove_dir_all(name)
        .map_err(|e| BrokerError::Fs(format!("deleting directory '{name}': {e}")))
}

pub fn rename(old: &str, new: &str) -> BrokerResult<()> {
    std::fs::rename(old, new)
        .map_err(|e| BrokerError::Fs(format!("renaming '{old}' to '{new}': {e}")))
}

/// Collect entry names of one class from the confined directory.
///
/// Dot-entries and names carrying control characters are skipped.
/// File listings sort lexicographically.
/// Directory listings look at the lexicographically first name: if it
/// parses as a run timestamp the whole listing sorts newest-first by
/// that interpretation with unparseable names last, otherwise it too
/// sorts lexicographically.
pub fn list_entries(dir: &Path, kind: EntryKind) -> BrokerResult<Vec<String>> {
    let read = std::fs::read_dir(dir)
        .map_err(|e| BrokerError::Fs(format!("listing {}: {e}", dir.display())))?;

    let mut names = Vec::new();
    for entry in read {
        let entry =
            entry.map_err(|e| BrokerError::Fs(format!("listing {}: {e}", dir.display())))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        // The listing reply is newline-joined; a name carrying a
        // control character would corrupt it.
        if name.chars().any(char::is_control) {
            continue;
        }
        let Ok(meta) = std::fs::metadata(entry.path()) else {
            continue;
        };
        let wanted = match kind {
            EntryKind::Files => meta.is_file(),
            EntryKind::Dirs => meta.is_dir(),
        };
        if wanted {
            names.push(name);
        }
    }

    names.sort_unstable();
    if kind == EntryKind::Dirs {
        if let Some(first) = names.first() {
            if parse_run_timestamp(first).is_some() {
                debug!("timestamp-named run directories detected, sorting newest-first");
                sort_by_timestamp_desc(&mut names);
            }
        }
    }
    Ok(names)
}

fn parse_run_timestamp(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, DIR_TIMESTAMP_FORMAT).ok()
}

fn sort_by_timestamp_desc(names: &mut [String]) {
    // Parseable names newest-first; unparseable ones after them, in
    // the lexicographic order the caller established.
    names.sort_by(|a, b| match (parse_run_timestamp(a), parse_run_timestamp(b)) {
        (Some(ta), Some(tb)) => tb.cmp(&ta),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
