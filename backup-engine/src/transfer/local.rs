use globset::{GlobBuilder, GlobMatcher};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{local_disk_usage_kb, SyncRequest, SyncSource, SyncSummary, Transport};
use crate::error::TransferError;
use crate::models::host::Host;

/// Mirrors directories visible on this machine with rsync's layout, exclude and
/// `--link-dest` rules. Host paths are read as local paths.
#[derive(Debug, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

struct ExcludeRule {
    matcher: GlobMatcher,
    /// Pattern contains a `/` and is matched against the relative path.
    anchored: bool,
    dir_only: bool,
}

/// rsync-style excludes: a bare pattern matches a name at any depth, a pattern
/// with `/` matches a path under the transfer root, a trailing `/` matches only
/// directories.
struct Excludes {
    rules: Vec<ExcludeRule>,
}

impl Excludes {
    fn new(patterns: &[String]) -> Self {
        let mut rules = Vec::new();
        for raw in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let dir_only = raw.ends_with('/');
            let p = raw.trim_end_matches('/');
            let anchored = p.contains('/');
            let glob = if let Some(rooted) = p.strip_prefix('/') {
                rooted.to_string()
            } else if anchored {
                format!("{{{p},**/{p}}}")
            } else {
                p.to_string()
            };
            match GlobBuilder::new(&glob).literal_separator(true).build() {
                Ok(g) => rules.push(ExcludeRule {
                    matcher: g.compile_matcher(),
                    anchored,
                    dir_only,
                }),
                Err(e) => tracing::warn!(pattern = %raw, error = %e, "Ignoring invalid exclude pattern"),
            }
        }
        Self { rules }
    }

    fn is_excluded(&self, rel: &Path, is_dir: bool) -> bool {
        let name = rel.file_name().map(Path::new).unwrap_or(rel);
        self.rules.iter().any(|r| {
            if r.dir_only && !is_dir {
                return false;
            }
            if r.anchored {
                r.matcher.is_match(rel)
            } else {
                r.matcher.is_match(name)
            }
        })
    }
}

fn same_content_stamp(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    a.len() == b.len()
        && match (a.modified(), b.modified()) {
            (Ok(x), Ok(y)) => x == y,
            _ => false,
        }
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn copy_file(src: &Path, meta: &fs::Metadata, target: &Path) -> io::Result<()> {
    remove_existing(target)?;
    fs::copy(src, target)?;
    let f = File::options().write(true).open(target)?;
    f.set_modified(meta.modified()?)?;
    Ok(())
}

impl Transport for LocalTransport {
    fn sync(&self, req: &SyncRequest<'_>) -> Result<SyncSummary, TransferError> {
        let (src, contents_only) = match &req.source {
            SyncSource::Remote { path, .. } => (PathBuf::from(path), path.ends_with('/')),
            SyncSource::Local(dir) => (dir.clone(), true),
        };
        let src_meta = fs::metadata(&src).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::PathNotFound(src.display().to_string()),
            _ => TransferError::Io(e),
        })?;

        // Without a trailing slash the source itself lands inside dest.
        let prefix = if contents_only && src_meta.is_dir() {
            PathBuf::new()
        } else {
            PathBuf::from(src.file_name().unwrap_or_default())
        };
        fs::create_dir_all(req.dest)?;

        let excludes = Excludes::new(req.excludes);
        let mut summary = SyncSummary::default();
        let mut walker = WalkDir::new(&src).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    // Unreadable entries are skipped like rsync does, and reported.
                    summary.warnings.push(e.to_string());
                    continue;
                }
            };
            let rel = entry.path().strip_prefix(&src).unwrap_or(entry.path());
            let ft = entry.file_type();
            if entry.depth() > 0 && excludes.is_excluded(rel, ft.is_dir()) {
                if ft.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let rel_dest = if rel.as_os_str().is_empty() {
                prefix.clone()
            } else {
                prefix.join(rel)
            };
            let target = req.dest.join(&rel_dest);
            if ft.is_dir() {
                fs::create_dir_all(&target)?;
            } else if ft.is_symlink() {
                let link = fs::read_link(entry.path())?;
                remove_existing(&target)?;
                std::os::unix::fs::symlink(link, &target)?;
            } else if ft.is_file() {
                let meta = entry.metadata().map_err(io::Error::other)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if let Ok(existing) = fs::symlink_metadata(&target) {
                    if existing.is_file() && same_content_stamp(&existing, &meta) {
                        continue;
                    }
                }
                let linked = match req.link_dest.map(|l| l.join(&rel_dest)) {
                    Some(candidate) => match fs::symlink_metadata(&candidate) {
                        Ok(prev) if prev.is_file() && same_content_stamp(&prev, &meta) => {
                            remove_existing(&target)?;
                            fs::hard_link(&candidate, &target)?;
                            true
                        }
                        _ => false,
                    },
                    None => false,
                };
                if !linked {
                    copy_file(entry.path(), &meta, &target)?;
                }
            }
        }
        Ok(summary)
    }

    fn push(&self, source: &Path, _host: &Host, target: &str) -> Result<SyncSummary, TransferError> {
        let meta = fs::metadata(source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::PathNotFound(source.display().to_string()),
            _ => TransferError::Io(e),
        })?;
        let target = Path::new(target);
        if meta.is_dir() {
            return self.sync(&SyncRequest {
                source: SyncSource::Local(source.to_path_buf()),
                excludes: &[],
                dest: target,
                link_dest: None,
            });
        }
        fs::create_dir_all(target)?;
        let name = source.file_name().unwrap_or_default();
        copy_file(source, &meta, &target.join(name))?;
        Ok(SyncSummary::default())
    }

    fn disk_usage_kb(&self, _host: &Host, path: &str) -> Result<u64, TransferError> {
        local_disk_usage_kb(Path::new(path)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::PathNotFound(path.to_string()),
            _ => TransferError::Io(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn host() -> Host {
        Host {
            id: "h".into(),
            name: "local".into(),
            hostname: "localhost".into(),
            user: "me".into(),
            port: 22,
            path: "local".into(),
            is_workstation: false,
            failed_backups_count: 0,
            created_at: String::new(),
        }
    }

    fn remote(path: &Path, trailing: bool) -> SyncSource {
        let mut p = path.display().to_string();
        if trailing {
            p.push('/');
        }
        SyncSource::Remote { host: host(), path: p }
    }

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("www/cache")).unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(root.join("www/index.html"), b"index").unwrap();
        fs::write(root.join("www/cache/page"), b"cached").unwrap();
        fs::write(root.join("logs/app.log"), b"log").unwrap();
        fs::write(root.join("notes.tmp"), b"tmp").unwrap();
        std::os::unix::fs::symlink("www/index.html", root.join("home")).unwrap();
    }

    #[test]
    fn test_trailing_slash_layouts() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("source_data");
        tree(&src);

        let nested = tmp.path().join("nested");
        LocalTransport
            .sync(&SyncRequest {
                source: remote(&src, false),
                excludes: &[],
                dest: &nested,
                link_dest: None,
            })
            .unwrap();
        assert!(nested.join("source_data/www/index.html").is_file());

        let flat = tmp.path().join("flat");
        LocalTransport
            .sync(&SyncRequest {
                source: remote(&src, true),
                excludes: &[],
                dest: &flat,
                link_dest: None,
            })
            .unwrap();
        assert!(flat.join("www/index.html").is_file());
        assert_eq!(fs::read_link(flat.join("home")).unwrap(), Path::new("www/index.html"));
    }

    #[test]
    fn test_excludes() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        tree(&src);
        let dest = tmp.path().join("dest");
        let excludes = vec!["*.tmp".to_string(), "cache/".to_string(), "/logs".to_string()];
        LocalTransport
            .sync(&SyncRequest {
                source: remote(&src, true),
                excludes: &excludes,
                dest: &dest,
                link_dest: None,
            })
            .unwrap();

        assert!(dest.join("www/index.html").exists());
        assert!(!dest.join("notes.tmp").exists());
        assert!(!dest.join("www/cache").exists());
        assert!(!dest.join("logs").exists());
    }

    #[test]
    fn test_link_dest_hardlinks_unchanged_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        tree(&src);

        let v1 = tmp.path().join("v1");
        let req = |dest: &Path, link: Option<&Path>| {
            LocalTransport
                .sync(&SyncRequest {
                    source: remote(&src, true),
                    excludes: &[],
                    dest,
                    link_dest: link,
                })
                .unwrap()
        };
        req(&v1, None);

        fs::write(src.join("logs/app.log"), b"log line two").unwrap();
        let v2 = tmp.path().join("v2");
        req(&v2, Some(&v1));

        let ino = |p: PathBuf| fs::metadata(p).unwrap().ino();
        assert_eq!(ino(v1.join("www/index.html")), ino(v2.join("www/index.html")));
        assert_ne!(ino(v1.join("logs/app.log")), ino(v2.join("logs/app.log")));
        assert_eq!(fs::read(v2.join("logs/app.log")).unwrap(), b"log line two");
    }

    #[test]
    fn test_push_copies_contents_or_single_file() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("restore_src");
        tree(&src);
        let target = tmp.path().join("target");

        LocalTransport::new()
            .push(&src, &host(), target.to_str().unwrap())
            .unwrap();
        assert_eq!(fs::read(target.join("www/index.html")).unwrap(), b"index");
        assert!(!target.join("restore_src").exists());

        let single = tmp.path().join("single");
        LocalTransport::new()
            .push(&src.join("logs/app.log"), &host(), single.to_str().unwrap())
            .unwrap();
        assert_eq!(fs::read(single.join("app.log")).unwrap(), b"log");

        assert!(matches!(
            LocalTransport::new().push(&tmp.path().join("nope"), &host(), "/x"),
            Err(TransferError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_missing_source_is_path_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = LocalTransport
            .sync(&SyncRequest {
                source: remote(&tmp.path().join("nope"), false),
                excludes: &[],
                dest: &tmp.path().join("dest"),
                link_dest: None,
            })
            .unwrap_err();
        assert!(matches!(err, TransferError::PathNotFound(_)));

        assert!(matches!(
            LocalTransport.disk_usage_kb(&host(), "/definitely/not/here"),
            Err(TransferError::PathNotFound(_))
        ));
    }
}
