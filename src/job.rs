use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::utils::CommandOutput;

/// Maximum size for captured output before truncation (1MB)
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// How a deployment run ended
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentOutcome {
    Success,
    Failure,
    TimedOut,
    Errored,
}

impl fmt::Display for DeploymentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeploymentOutcome::Success => "success",
            DeploymentOutcome::Failure => "failure",
            DeploymentOutcome::TimedOut => "timed out",
            DeploymentOutcome::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// A single execution of the deploy procedure, from source update to the
/// deploy command's exit
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub command: String,
    pub timeout_seconds: u64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub outcome: Option<DeploymentOutcome>,
    pub error: Option<String>,
}

impl DeploymentRun {
    pub fn new(command: String, timeout_seconds: u64) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            command,
            timeout_seconds,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            outcome: None,
            error: None,
        }
    }

    /// Record what the deploy command produced and classify it
    pub fn record_output(&mut self, output: CommandOutput) {
        self.finished_at = Some(Utc::now());
        self.exit_code = output.exit_code;

        let (stdout, stdout_cut) = truncate_output(output.stdout);
        let (stderr, stderr_cut) = truncate_output(output.stderr);
        self.stdout = stdout;
        self.stderr = stderr;
        self.output_truncated = stdout_cut || stderr_cut;

        self.outcome = Some(if output.timed_out {
            DeploymentOutcome::TimedOut
        } else if output.exit_code == Some(0) {
            DeploymentOutcome::Success
        } else {
            DeploymentOutcome::Failure
        });
    }

    /// Mark the run as aborted by an error outside the deploy command itself
    pub fn mark_errored(&mut self, error: String) {
        self.finished_at = Some(Utc::now());
        self.outcome = Some(DeploymentOutcome::Errored);
        self.error = Some(error);
    }
}

/// Cut `output` to at most `MAX_OUTPUT_SIZE` bytes on a char boundary
fn truncate_output(mut output: String) -> (String, bool) {
    if output.len() <= MAX_OUTPUT_SIZE {
        return (output, false);
    }

    let mut cut = MAX_OUTPUT_SIZE;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str("\n... (output truncated)");
    (output, true)
}
