use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::RetentionPruneError;

pub const LATEST: &str = "latest";
pub const ENCRYPTED_SUFFIX: &str = ".tar.gz.enc";
const VERSION_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub name: String,
    pub path: PathBuf,
    pub encrypted: bool,
    stamp: NaiveDateTime,
    seq: u32,
}

impl Version {
    fn key(&self) -> (NaiveDateTime, u32) {
        (self.stamp, self.seq)
    }
}

fn format_version(stamp: NaiveDateTime, seq: u32) -> String {
    let base = stamp.format(VERSION_FORMAT).to_string();
    if seq == 0 {
        base
    } else {
        format!("{base}_{seq}")
    }
}

/// `2024-05-01_12-00-00` or `2024-05-01_12-00-00_3`, optionally with the archive suffix.
fn parse_version(name: &str) -> Option<(NaiveDateTime, u32, bool)> {
    let (base, encrypted) = match name.strip_suffix(ENCRYPTED_SUFFIX) {
        Some(b) => (b, true),
        None => (name, false),
    };
    // The timestamp part is fixed width.
    if base.len() < 19 || !base.is_char_boundary(19) {
        return None;
    }
    let (stamp, rest) = base.split_at(19);
    let stamp = NaiveDateTime::parse_from_str(stamp, VERSION_FORMAT).ok()?;
    let seq = match rest {
        "" => 0,
        r => r.strip_prefix('_')?.parse().ok()?,
    };
    Some((stamp, seq, encrypted))
}

/// Versions under `dest`, oldest first. Ignores `latest` and anything not version-named.
pub fn list_versions(dest: &Path) -> io::Result<Vec<Version>> {
    let entries = match fs::read_dir(dest) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some((stamp, seq, encrypted)) = parse_version(&name) else {
            continue;
        };
        let ft = entry.file_type()?;
        if (encrypted && !ft.is_file()) || (!encrypted && !ft.is_dir()) {
            continue;
        }
        versions.push(Version {
            name,
            path: entry.path(),
            encrypted,
            stamp,
            seq,
        });
    }
    versions.sort_by_key(|v| v.key());
    Ok(versions)
}

/// Creates a fresh, empty version directory named after `started_at`.
///
/// Names never repeat and always sort after every existing version, so a second run
/// in the same second (or after a clock step backwards) gets a `_N` suffix.
pub fn allocate_version_dir(dest: &Path, started_at: DateTime<Utc>) -> io::Result<(String, PathBuf)> {
    fs::create_dir_all(dest)?;
    let naive = started_at.naive_utc();
    let mut stamp = naive.with_nanosecond(0).unwrap_or(naive);
    let mut seq = 0;
    if let Some(last) = list_versions(dest)?.last() {
        if (stamp, seq) <= last.key() {
            stamp = last.stamp;
            seq = last.seq + 1;
        }
    }

    loop {
        let name = format_version(stamp, seq);
        let path = dest.join(&name);
        let archive = dest.join(format!("{name}{ENCRYPTED_SUFFIX}"));
        if !archive.exists() {
            match fs::create_dir(&path) {
                Ok(()) => return Ok((name, path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
        seq += 1;
    }
}

/// Name `latest` currently points at, if the link exists.
pub fn latest_target_name(dest: &Path) -> io::Result<Option<String>> {
    match fs::read_link(dest.join(LATEST)) {
        Ok(target) => Ok(target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(None),
        Err(e) => Err(e),
    }
}

/// Resolved path of the current `latest` version, skipping dangling links.
pub fn current_latest(dest: &Path) -> io::Result<Option<PathBuf>> {
    let Some(name) = latest_target_name(dest)? else {
        return Ok(None);
    };
    let path = dest.join(name);
    Ok(fs::symlink_metadata(&path).is_ok().then_some(path))
}

/// Atomically repoints `dest/latest` at `target_name`.
///
/// The new link is created under a temporary name and renamed over the old one, so
/// readers see either the old or the new target and never a missing link.
pub fn swap_latest(dest: &Path, target_name: &str) -> io::Result<()> {
    let tmp = dest.join(format!(".{LATEST}.{}", uuid::Uuid::new_v4().simple()));
    std::os::unix::fs::symlink(target_name, &tmp)?;
    if let Err(e) = fs::rename(&tmp, dest.join(LATEST)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub errors: Vec<RetentionPruneError>,
}

/// Deletes the oldest versions beyond `retention`. The version `latest` points at is
/// never deleted. Failures are collected, not raised.
pub fn prune(dest: &Path, retention: i64) -> PruneReport {
    let mut report = PruneReport::default();
    if retention < 1 {
        return report;
    }

    let versions = match list_versions(dest) {
        Ok(v) => v,
        Err(source) => {
            report.errors.push(RetentionPruneError {
                version: dest.display().to_string(),
                source,
            });
            return report;
        }
    };
    let protected = match latest_target_name(dest) {
        Ok(p) => p,
        Err(source) => {
            // Without knowing what `latest` points at nothing is safe to delete.
            report.errors.push(RetentionPruneError {
                version: LATEST.to_string(),
                source,
            });
            return report;
        }
    };

    let keep = retention as usize;
    if versions.len() <= keep {
        return report;
    }
    let excess = versions.len() - keep;
    for v in versions.into_iter().take(excess) {
        if protected.as_deref() == Some(v.name.as_str()) {
            continue;
        }
        let res = if v.encrypted {
            fs::remove_file(&v.path)
        } else {
            fs::remove_dir_all(&v.path)
        };
        match res {
            Ok(()) => report.removed.push(v.name),
            Err(source) => report.errors.push(RetentionPruneError {
                version: v.name,
                source,
            }),
        }
    }
    report
}

/// Outcome of comparing a new version with its predecessor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReport {
    /// Same inode as the predecessor's file.
    pub linked: u64,
    /// Content differs from the predecessor.
    pub copied: u64,
    /// Not present in the predecessor.
    pub added: u64,
    /// Same size and mtime as the predecessor but stored as a separate copy.
    pub unlinked_unchanged: u64,
}

impl LinkReport {
    pub fn is_deduplicated(&self) -> bool {
        self.unlinked_unchanged == 0
    }
}

/// Checks every regular file of `current` against `previous`.
pub fn verify_hardlinks(previous: &Path, current: &Path) -> io::Result<LinkReport> {
    let mut report = LinkReport::default();
    for entry in WalkDir::new(current).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(current)
            .map_err(io::Error::other)?;
        let new_meta = entry.metadata().map_err(io::Error::other)?;
        match fs::symlink_metadata(previous.join(rel)) {
            Ok(old_meta) if old_meta.is_file() => {
                if old_meta.dev() == new_meta.dev() && old_meta.ino() == new_meta.ino() {
                    report.linked += 1;
                } else if old_meta.len() == new_meta.len() && old_meta.mtime() == new_meta.mtime() {
                    report.unlinked_unchanged += 1;
                } else {
                    report.copied += 1;
                }
            }
            Ok(_) => report.copied += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => report.added += 1,
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

/// Directory holding the transferred content of `source_path` inside `root`.
///
/// A source without a trailing slash lands under `root/<last segment>`; with one,
/// directly in `root`. Both layouts are accepted.
pub fn resolve_content_root(root: &Path, source_path: &str) -> PathBuf {
    if !source_path.ends_with('/') {
        if let Some(segment) = Path::new(source_path).file_name() {
            let nested = root.join(segment);
            if nested.is_dir() {
                return nested;
            }
        }
    }
    root.to_path_buf()
}
