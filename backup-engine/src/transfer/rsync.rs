use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::{ensure_allowed, last_line, shell_quote, SyncRequest, SyncSource, SyncSummary, Transport};
use crate::error::TransferError;
use crate::models::host::Host;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Some source files vanished during the transfer.
const RSYNC_PARTIAL_VANISHED: i32 = 24;
/// ssh itself failed.
const RSYNC_SSH_FAILURE: i32 = 255;

/// rsync over SSH with the installation key.
pub struct RsyncTransport {
    ssh_key_path: PathBuf,
}

impl RsyncTransport {
    pub fn new(ssh_key_path: PathBuf) -> Self {
        Self { ssh_key_path }
    }

    fn connect(&self, host: &Host) -> Result<ssh2::Session, TransferError> {
        let addr = (host.hostname.as_str(), host.port)
            .to_socket_addrs()
            .map_err(|e| TransferError::Unreachable(format!("{}: {e}", host.hostname)))?
            .next()
            .ok_or_else(|| TransferError::Unreachable(format!("{}: no address", host.hostname)))?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| TransferError::Unreachable(format!("{}:{}: {e}", host.hostname, host.port)))?;

        let mut sess = ssh2::Session::new().map_err(|e| TransferError::Ssh(e.to_string()))?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(|e| TransferError::Ssh(e.to_string()))?;
        sess.userauth_pubkey_file(&host.user, None, &self.ssh_key_path, None)
            .map_err(|e| TransferError::Auth(e.to_string()))?;
        if !sess.authenticated() {
            return Err(TransferError::Auth(format!("{}@{}", host.user, host.hostname)));
        }
        Ok(sess)
    }

    /// Runs one of the allowed commands and returns (exit status, stdout, stderr).
    fn exec(&self, sess: &ssh2::Session, cmd: &str) -> Result<(i32, String, String), TransferError> {
        ensure_allowed(cmd)?;
        let ssh_err = |e: ssh2::Error| TransferError::Ssh(e.to_string());
        let mut channel = sess.channel_session().map_err(ssh_err)?;
        channel.exec(cmd).map_err(ssh_err)?;
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close().map_err(ssh_err)?;
        let status = channel.exit_status().map_err(ssh_err)?;
        Ok((status, stdout, stderr))
    }
}

/// Full rsync argument list for a request.
pub fn build_rsync_args(ssh_key_path: &Path, req: &SyncRequest<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["-az", "--no-owner", "--no-group", "--numeric-ids"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let source = match &req.source {
        SyncSource::Remote { host, path } => {
            args.push("-e".into());
            args.push(format!(
                "ssh -i {} -o StrictHostKeyChecking=no -p {}",
                ssh_key_path.display(),
                host.port
            ));
            format!("{}@{}:{}", host.user, host.hostname, path)
        }
        SyncSource::Local(dir) => {
            let mut s = dir.display().to_string();
            if !s.ends_with('/') {
                s.push('/');
            }
            s
        }
    };

    for pattern in req.excludes.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        args.push(format!("--exclude={pattern}"));
    }
    if let Some(link) = req.link_dest {
        args.push(format!("--link-dest={}", link.display()));
    }

    let mut dest = req.dest.display().to_string();
    if !dest.ends_with('/') {
        dest.push('/');
    }
    args.push(source);
    args.push(dest);
    args
}

/// rsync arguments copying a local tree back onto a host. Times are not preserved
/// so restores into directories like `/tmp` owned by another user do not fail.
pub fn build_push_args(ssh_key_path: &Path, source: &Path, host: &Host, target: &str) -> Vec<String> {
    let mut src = source.display().to_string();
    if source.is_dir() && !src.ends_with('/') {
        src.push('/');
    }
    vec![
        "-rlpz".into(),
        "--no-owner".into(),
        "--no-group".into(),
        "-e".into(),
        format!(
            "ssh -i {} -o StrictHostKeyChecking=no -p {}",
            ssh_key_path.display(),
            host.port
        ),
        src,
        format!("{}@{}:{}", host.user, host.hostname, target),
    ]
}

fn run_rsync(args: &[String]) -> Result<SyncSummary, TransferError> {
    tracing::debug!(args = ?args, "Running rsync");
    let output = Command::new("rsync").args(args).output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
        tracing::debug!(output = %stdout.trim(), "rsync stdout");
    }
    if !stderr.trim().is_empty() {
        tracing::debug!(output = %stderr.trim(), "rsync stderr");
    }

    let summary = classify_exit(output.status.code(), &stderr)?;
    for w in &summary.warnings {
        tracing::warn!(warning = %w, "rsync finished with warnings");
    }
    Ok(summary)
}

/// Maps a finished rsync process onto the transfer outcome.
pub fn classify_exit(code: Option<i32>, stderr: &str) -> Result<SyncSummary, TransferError> {
    let message = last_line(stderr);
    let lower = stderr.to_ascii_lowercase();

    match code {
        Some(0) => Ok(SyncSummary::default()),
        Some(RSYNC_PARTIAL_VANISHED) => Ok(SyncSummary {
            warnings: vec![format!("some source files vanished: {message}")],
        }),
        _ if lower.contains("permission denied (publickey")
            || lower.contains("authentication failed")
            || lower.contains("host key verification failed") =>
        {
            Err(TransferError::Auth(message))
        }
        _ if lower.contains("connection refused")
            || lower.contains("no route to host")
            || lower.contains("could not resolve hostname")
            || lower.contains("connection timed out")
            || lower.contains("network is unreachable")
            || lower.contains("connection closed by") =>
        {
            Err(TransferError::Unreachable(message))
        }
        _ if lower.contains("no such file or directory") => Err(TransferError::PathNotFound(message)),
        Some(RSYNC_SSH_FAILURE) => Err(TransferError::Unreachable(message)),
        Some(code) => Err(TransferError::Rsync { code, message }),
        None => Err(TransferError::Rsync {
            code: -1,
            message: format!("terminated by signal: {message}"),
        }),
    }
}

impl Transport for RsyncTransport {
    fn sync(&self, req: &SyncRequest<'_>) -> Result<SyncSummary, TransferError> {
        std::fs::create_dir_all(req.dest)?;
        run_rsync(&build_rsync_args(&self.ssh_key_path, req))
    }

    fn push(&self, source: &Path, host: &Host, target: &str) -> Result<SyncSummary, TransferError> {
        if !source.exists() {
            return Err(TransferError::PathNotFound(source.display().to_string()));
        }
        run_rsync(&build_push_args(&self.ssh_key_path, source, host, target))
    }

    fn disk_usage_kb(&self, host: &Host, path: &str) -> Result<u64, TransferError> {
        let sess = self.connect(host)?;
        let (status, stdout, stderr) = self.exec(&sess, &format!("du -sk -- {}", shell_quote(path)))?;
        if status != 0 {
            let message = last_line(&stderr);
            if message.to_ascii_lowercase().contains("no such file") {
                return Err(TransferError::PathNotFound(format!("{}: {message}", path)));
            }
            return Err(TransferError::Ssh(format!("du exited with {status}: {message}")));
        }
        parse_du_output(&stdout)
    }
}

pub fn parse_du_output(stdout: &str) -> Result<u64, TransferError> {
    stdout
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| TransferError::Ssh(format!("unexpected du output: {:?}", stdout.trim())))
}
