use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::layout::RootLayout;

const DAEMON_TIMEOUT: Duration = Duration::from_secs(30);
const SCAN_PACKAGES_PATH: &str = "/v1/packages/scan";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonNotification {
    NotRunning,
    Rescanned,
}

/// Asks the filesystem daemon behind `ro/ctl` to pick up new packages. A root
/// without a control link has no daemon running.
pub fn notify_daemon(layout: &RootLayout) -> Result<DaemonNotification> {
    let ctl_path = layout.ctl_path();
    let target = match fs::read_link(&ctl_path) {
        Ok(target) => target,
        Err(err) => {
            info!(ctl = %ctl_path.display(), error = %err, "not updating filesystem daemon");
            return Ok(DaemonNotification::NotRunning);
        }
    };
    let socket = resolve_socket_path(&ctl_path, target);

    let status = request_scan(&socket).with_context(|| {
        format!(
            "failed to notify filesystem daemon at {}",
            socket.display()
        )
    })?;
    if !(200..300).contains(&status) {
        return Err(anyhow!(
            "filesystem daemon at {} rejected package scan with status {status}",
            socket.display()
        ));
    }

    info!(socket = %socket.display(), "filesystem daemon rescanned packages");
    Ok(DaemonNotification::Rescanned)
}

fn resolve_socket_path(ctl_path: &Path, target: PathBuf) -> PathBuf {
    if target.is_absolute() {
        return target;
    }
    match ctl_path.parent() {
        Some(parent) => parent.join(target),
        None => target,
    }
}

fn request_scan(socket: &Path) -> Result<u16> {
    let mut stream = UnixStream::connect(socket).context("failed to connect")?;
    stream.set_read_timeout(Some(DAEMON_TIMEOUT))?;
    stream.set_write_timeout(Some(DAEMON_TIMEOUT))?;

    let body = "{}";
    let request = format!(
        "POST {SCAN_PACKAGES_PATH} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    stream
        .write_all(request.as_bytes())
        .context("failed to send request")?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .context("failed to read response")?;
    parse_status_code(&response)
}

fn parse_status_code(response: &[u8]) -> Result<u16> {
    let text = String::from_utf8_lossy(response);
    let status_line = text
        .lines()
        .next()
        .filter(|line| !line.trim().is_empty())
        .ok_or_else(|| anyhow!("empty response"))?;

    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code
            .parse::<u16>()
            .with_context(|| format!("malformed status line '{status_line}'")),
        _ => Err(anyhow!("malformed status line '{status_line}'")),
    }
}
