use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

// For signature verification
use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use sha2::Sha256;
type HmacSha256 = Hmac<Sha256>;

/// Prefix GitHub puts in front of the hex digest in `X-Hub-Signature-256`
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Verifies a GitHub webhook signature over the raw request body.
///
/// An unset or empty `secret` disables verification and always returns `true`;
/// callers are expected to warn about it. With a secret configured, a missing
/// header, a header without the `sha256=` prefix, or a digest that is not
/// lowercase hex is rejected. The digest itself is checked with the MAC's
/// constant-time comparison.
pub fn verify_github_signature(
    secret: Option<&str>,
    payload: &[u8],
    signature_header: Option<&str>,
) -> bool {
    let secret = match secret {
        Some(secret) if !secret.is_empty() => secret,
        _ => return true,
    };

    let Some(signature_header) = signature_header else {
        return false;
    };

    // Expected format: "sha256=..."
    let Some(git_signature) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };

    // GitHub always sends lowercase hex
    if !git_signature
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return false;
    }

    let Ok(git_signature_bytes) = hex_decode(git_signature) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&git_signature_bytes).is_ok()
}

/// Computes the `sha256=<hex>` header value GitHub would send for `payload`.
#[cfg(test)]
pub(crate) fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Result of running an external command to completion or to its time limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs `program args..` inside `cwd`, capturing stdout and stderr as text.
///
/// When `timeout` elapses the child is killed (it is spawned with
/// `kill_on_drop`) and the output reports `timed_out` with nothing captured.
/// Only a failure to spawn the process is returned as an error; a non-zero
/// exit is a normal `CommandOutput`.
pub async fn run_bounded_command<P, S>(
    program: P,
    args: &[S],
    cwd: &Path,
    timeout: Option<Duration>,
) -> io::Result<CommandOutput>
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let child = Command::new(program.as_ref())
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                debug!("{:?} exceeded {:?}, killing it", program.as_ref(), limit);
                return Ok(CommandOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: true,
                });
            }
        },
        None => child.wait_with_output().await?,
    };

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        timed_out: false,
    })
}

/// Exit status for log lines: the code itself, or how the process ended without one
pub fn describe_exit_code(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

/// Renders a program and its arguments as a single line for logs
pub fn command_line<P, S>(program: P, args: &[S]) -> String
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let mut line = program.as_ref().to_string_lossy().into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}
