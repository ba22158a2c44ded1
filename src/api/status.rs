//! Human-facing status page

use axum::{extract::State as AxumState, response::Html};
use chrono::Utc;
use std::fmt::Write as _;
use std::io;

use crate::SharedState;
use crate::api::response::ApiError;
use crate::logging::read_recent_lines;

const RECENT_LOG_LINES: usize = 50;

/// GET /status - HTML overview of the service and the tail of its log
pub async fn status(AxumState(state): AxumState<SharedState>) -> Result<Html<String>, ApiError> {
    let log_path = state.config.log_file_path();
    let lines = {
        let log_path = log_path.clone();
        tokio::task::spawn_blocking(move || read_recent_lines(&log_path, RECENT_LOG_LINES))
            .await
            .map_err(|e| ApiError::Internal(format!("log reader task failed: {}", e)))?
    };

    let recent_logs = match lines {
        Ok(lines) if lines.is_empty() => "No log entries yet".to_string(),
        Ok(lines) => escape_html(&lines.join("\n")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => format!(
            "Log file {} not found",
            escape_html(&log_path.display().to_string())
        ),
        Err(e) => {
            return Err(ApiError::Internal(format!(
                "Failed to read log file '{}': {}",
                log_path.display(),
                e
            )));
        }
    };

    let last_run = match state.deployer.last_run() {
        Some(run) => format!(
            "{} at {} ({})",
            run.outcome
                .map(|o| o.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            run.finished_at.unwrap_or(run.started_at).to_rfc3339(),
            escape_html(&run.id)
        ),
        None => "None since startup".to_string(),
    };

    let config = &state.config;
    let mut html = String::new();
    // Writing to a String cannot fail
    let _ = write!(
        html,
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Webhook Deploy Status</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; }}
        .status {{ background: #e8f5e8; padding: 20px; border-radius: 5px; }}
        .log {{ background: #f5f5f5; padding: 15px; border-radius: 5px; margin-top: 20px; }}
        pre {{ overflow-x: auto; }}
    </style>
</head>
<body>
    <h1>Webhook Deploy Status</h1>

    <div class="status">
        <strong>Status:</strong> Running<br>
        <strong>Uptime:</strong> {uptime:.1} seconds<br>
        <strong>Last Update:</strong> {now}<br>
        <strong>Webhook Secret:</strong> {secret}<br>
        <strong>Deploy Branch:</strong> {branch}<br>
        <strong>Deployment In Progress:</strong> {running}<br>
        <strong>Deployments Triggered:</strong> {triggered}<br>
        <strong>Last Deployment:</strong> {last_run}
    </div>

    <h2>Recent Logs</h2>
    <div class="log">
        <pre>{recent_logs}</pre>
    </div>

    <h2>Endpoints</h2>
    <ul>
        <li><code>/health</code> - Health check (JSON)</li>
        <li><code>/status</code> - Status page (HTML)</li>
        <li><code>{webhook_path}</code> - GitHub webhook endpoint (POST)</li>
    </ul>
</body>
</html>
"#,
        uptime = state.start_time.elapsed().as_secs_f64(),
        now = Utc::now().to_rfc3339(),
        secret = if config.secret().is_some() {
            "&#10003; Configured"
        } else {
            "&#9888; Not configured"
        },
        branch = escape_html(&config.branch),
        running = if state.deployer.is_running() { "Yes" } else { "No" },
        triggered = state.deployer.triggered_count(),
        last_run = last_run,
        recent_logs = recent_logs,
        webhook_path = escape_html(&config.webhook_path),
    );

    Ok(Html(html))
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
