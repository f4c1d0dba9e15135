pub mod local;
pub mod rsync;

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::TransferError;
use crate::models::host::Host;

pub use local::LocalTransport;
pub use rsync::RsyncTransport;

/// Remote commands the installation key is allowed to run.
const ALLOWED_REMOTE_PREFIXES: &[&str] = &["rsync --server", "du -sk"];

#[derive(Debug, Clone)]
pub enum SyncSource {
    /// `path` on `host`, reached over SSH. Trailing-slash rules apply.
    Remote { host: Host, path: String },
    /// A directory on this machine; its contents are copied, never nested.
    Local(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SyncRequest<'a> {
    pub source: SyncSource,
    pub excludes: &'a [String],
    pub dest: &'a Path,
    /// Previous version whose unchanged files are hardlinked instead of copied.
    pub link_dest: Option<&'a Path>,
}

#[derive(Debug, Default, Clone)]
pub struct SyncSummary {
    pub warnings: Vec<String>,
}

/// Moves file trees from a host into the backup store.
pub trait Transport: Send + Sync {
    fn sync(&self, req: &SyncRequest<'_>) -> Result<SyncSummary, TransferError>;

    /// Copies `source` on this machine to `target` on `host`. A directory's contents
    /// land directly in `target`; a file lands inside it.
    fn push(&self, source: &Path, host: &Host, target: &str) -> Result<SyncSummary, TransferError>;

    /// `du -sk` of `path` on `host`, in KiB.
    fn disk_usage_kb(&self, host: &Host, path: &str) -> Result<u64, TransferError>;
}

pub fn ensure_allowed(cmd: &str) -> Result<(), TransferError> {
    if ALLOWED_REMOTE_PREFIXES.iter().any(|p| cmd.starts_with(p)) {
        Ok(())
    } else {
        Err(TransferError::CommandRefused(cmd.to_string()))
    }
}

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `du -sk` semantics on the local filesystem: allocated blocks, each inode counted once.
pub fn local_disk_usage_kb(path: &Path) -> io::Result<u64> {
    let mut seen = HashSet::new();
    let mut blocks = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let meta = entry.metadata().map_err(io::Error::other)?;
        if seen.insert((meta.dev(), meta.ino())) {
            blocks += meta.blocks();
        }
    }
    // st_blocks is in 512-byte units.
    Ok(blocks.div_ceil(2))
}

pub fn format_size_kb(kb: u64) -> String {
    format!("{kb}KB")
}

/// Last non-empty line of a process's output, for error messages.
pub(crate) fn last_line(output: &str) -> String {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_command_guard() {
        assert!(ensure_allowed("du -sk -- '/var/www'").is_ok());
        assert!(ensure_allowed("rsync --server --sender -logDtprze.iLsfxCIvu . /data").is_ok());
        assert!(matches!(
            ensure_allowed("rm -rf /"),
            Err(TransferError::CommandRefused(_))
        ));
        assert!(ensure_allowed("du -h /").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/mnt/data"), "'/mnt/data'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_local_du_counts_hardlinks_once() {
        let tmp = TempDir::new().unwrap();
        let data = vec![7u8; 256 * 1024];
        fs::write(tmp.path().join("a"), &data).unwrap();
        let single = local_disk_usage_kb(tmp.path()).unwrap();
        assert!(single >= 256, "got {single}");

        fs::hard_link(tmp.path().join("a"), tmp.path().join("b")).unwrap();
        assert_eq!(local_disk_usage_kb(tmp.path()).unwrap(), single);
        assert_eq!(format_size_kb(single), format!("{single}KB"));
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nrsync error: some\n\n  "), "rsync error: some");
        assert_eq!(last_line(""), "no output");
    }
}
