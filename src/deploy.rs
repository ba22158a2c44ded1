//! Background deployment: source update followed by the deploy command,
//! one run at a time with at most one more pending.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::DeployConfig;
use crate::error::{DeployError, Result};
use crate::job::{DeploymentOutcome, DeploymentRun};
use crate::utils::{command_line, describe_exit_code, run_bounded_command};

/// Flag passed to the deploy command so it can tell it was not run by hand
pub const AUTOMATED_FLAG: &str = "--automated";

#[derive(Debug, Default)]
struct RunSlot {
    running: bool,
    /// At most one further run waits behind the one in progress
    pending: bool,
}

struct DeployerInner {
    repo_root: PathBuf,
    deploy_command: PathBuf,
    deploy_timeout: Duration,
    update_argv: Vec<String>,
    update_timeout: Option<Duration>,
    slot: StdMutex<RunSlot>,
    triggered: AtomicU64,
    last_run: StdMutex<Option<DeploymentRun>>,
}

/// Launches deployments as detached tokio tasks.
///
/// Only one run is in flight at a time. A trigger that arrives during a run
/// marks a single pending run, executed by the same task once the current
/// one finishes; any further triggers before that fold into it.
#[derive(Clone)]
pub struct Deployer {
    inner: Arc<DeployerInner>,
}

/// Completion hook for a started deployment task. Dropping it detaches the task.
pub struct DeploymentHandle {
    handle: JoinHandle<Vec<DeploymentRun>>,
}

impl DeploymentHandle {
    /// Waits for the task to go idle and returns every run it performed,
    /// the pending one included. Empty if the task was cancelled or panicked.
    pub async fn wait(self) -> Vec<DeploymentRun> {
        match self.handle.await {
            Ok(runs) => runs,
            Err(e) => {
                error!("Deployment task did not complete: {}", e);
                Vec::new()
            }
        }
    }
}

/// What a call to [`Deployer::trigger`] did
pub enum TriggerOutcome {
    /// No run was in flight; a new task was spawned
    Started(DeploymentHandle),
    /// A run is in flight; one more will follow it
    Queued,
    /// A run is in flight and another is already pending; nothing added
    AlreadyQueued,
}

impl TriggerOutcome {
    pub fn into_handle(self) -> Option<DeploymentHandle> {
        match self {
            TriggerOutcome::Started(handle) => Some(handle),
            _ => None,
        }
    }
}

impl Deployer {
    /// Resolves the repository root and deploy command against the filesystem.
    /// A missing deploy command is an error so the service refuses to start.
    pub fn from_config(config: &DeployConfig) -> Result<Self> {
        let repo_root = config.repo_root.canonicalize().map_err(|e| {
            DeployError::ConfigError(format!(
                "Repository root '{}' is not accessible: {}",
                config.repo_root.display(),
                e
            ))
        })?;

        let deploy_command = resolve_command(&repo_root, &config.deploy_command)?;

        Ok(Self {
            inner: Arc::new(DeployerInner {
                repo_root,
                deploy_command,
                deploy_timeout: Duration::from_secs(config.deploy_timeout_secs),
                update_argv: config.update_argv(),
                update_timeout: config.update_timeout_secs.map(Duration::from_secs),
                slot: StdMutex::new(RunSlot::default()),
                triggered: AtomicU64::new(0),
                last_run: StdMutex::new(None),
            }),
        })
    }

    /// Schedules a deployment and returns immediately
    pub fn trigger(&self) -> TriggerOutcome {
        let count = self.inner.triggered.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut slot = self.inner.lock_slot();
            if slot.running {
                if slot.pending {
                    info!(
                        "Deployment #{} folded into the deployment already queued",
                        count
                    );
                    return TriggerOutcome::AlreadyQueued;
                }
                slot.pending = true;
                info!(
                    "Deployment #{} queued behind the deployment in progress",
                    count
                );
                return TriggerOutcome::Queued;
            }
            slot.running = true;
        }

        info!("Deployment #{} scheduled", count);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.drain().await });
        TriggerOutcome::Started(DeploymentHandle { handle })
    }

    /// Number of triggers received since startup, folded ones included
    pub fn triggered_count(&self) -> u64 {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_slot().running
    }

    /// The most recently finished run, if any
    pub fn last_run(&self) -> Option<DeploymentRun> {
        self.inner
            .last_run
            .lock()
            .map(|last| last.clone())
            .unwrap_or_default()
    }

    pub fn deploy_command(&self) -> &Path {
        &self.inner.deploy_command
    }

    pub fn repo_root(&self) -> &Path {
        &self.inner.repo_root
    }
}

impl DeployerInner {
    fn lock_slot(&self) -> MutexGuard<'_, RunSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs until no deployment is pending, then releases the slot
    async fn drain(&self) -> Vec<DeploymentRun> {
        let mut runs = Vec::new();
        loop {
            runs.push(self.run().await);

            let again = {
                let mut slot = self.lock_slot();
                if slot.pending {
                    slot.pending = false;
                    true
                } else {
                    slot.running = false;
                    false
                }
            };
            if !again {
                return runs;
            }
            info!("Running queued deployment...");
        }
    }

    async fn run(&self) -> DeploymentRun {
        info!("Starting deployment...");
        let mut run = DeploymentRun::new(
            command_line(&self.deploy_command, &[AUTOMATED_FLAG]),
            self.deploy_timeout.as_secs(),
        );

        if let Err(e) = self.update_sources(&run.id).await {
            error!("Deployment {} aborted: {}", run.id, e);
            run.mark_errored(e.to_string());
            self.remember(&run);
            return run;
        }

        info!(
            "Deployment {} - running (cwd = '{}'): {}",
            run.id,
            self.repo_root.display(),
            run.command
        );
        match run_bounded_command(
            &self.deploy_command,
            &[AUTOMATED_FLAG],
            &self.repo_root,
            Some(self.deploy_timeout),
        )
        .await
        {
            Ok(output) => run.record_output(output),
            Err(e) => run.mark_errored(format!("failed to start '{}': {}", run.command, e)),
        }

        log_outcome(&run);
        self.remember(&run);
        run
    }

    /// Fetch and fast-forward the checkout. Any failure aborts the deployment.
    async fn update_sources(&self, run_id: &str) -> Result<()> {
        let Some((program, args)) = self.update_argv.split_first() else {
            info!("Deployment {} - no source update step configured", run_id);
            return Ok(());
        };

        let line = command_line(program, args);
        info!(
            "Deployment {} - pulling latest changes (cwd = '{}'): {}",
            run_id,
            self.repo_root.display(),
            line
        );
        if self.update_timeout.is_none() {
            warn!("Deployment {} - source update has no time limit", run_id);
        }

        let output = run_bounded_command(program, args, &self.repo_root, self.update_timeout)
            .await
            .map_err(|e| DeployError::UpdateFailed(format!("'{}' failed to start: {}", line, e)))?;

        if output.timed_out {
            return Err(DeployError::UpdateFailed(format!("'{}' timed out", line)));
        }
        if !output.success() {
            return Err(DeployError::UpdateFailed(format!(
                "'{}' exited with {}: {}",
                line,
                describe_exit_code(output.exit_code),
                output.stderr.trim_end()
            )));
        }

        info!("Deployment {} - source update output:\n{}", run_id, output.stdout);
        Ok(())
    }

    fn remember(&self, run: &DeploymentRun) {
        if let Ok(mut last) = self.last_run.lock() {
            *last = Some(run.clone());
        }
    }
}

fn log_outcome(run: &DeploymentRun) {
    match run.outcome {
        Some(DeploymentOutcome::Success) => {
            info!("Deployment {} completed successfully", run.id);
            info!("Deployment output: {}", run.stdout);
        }
        Some(DeploymentOutcome::Failure) => {
            error!(
                "Deployment {} failed with exit code {}",
                run.id,
                describe_exit_code(run.exit_code)
            );
            error!("Deployment error: {}", run.stderr);
        }
        Some(DeploymentOutcome::TimedOut) => {
            error!(
                "Deployment {} timed out after {} seconds",
                run.id, run.timeout_seconds
            );
        }
        Some(DeploymentOutcome::Errored) => {
            error!(
                "Deployment {} failed with exception: {}",
                run.id,
                run.error.as_deref().unwrap_or("unknown error")
            );
        }
        None => warn!("Deployment {} finished without an outcome", run.id),
    }
}

fn resolve_command(repo_root: &Path, command: &Path) -> Result<PathBuf> {
    let candidate = if command.is_absolute() {
        command.to_path_buf()
    } else {
        repo_root.join(command)
    };

    if !candidate.is_file() {
        return Err(DeployError::DeployCommandMissing(candidate));
    }
    Ok(candidate.canonicalize()?)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::logging::AuditCapture;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn run_once(deployer: &Deployer) -> DeploymentRun {
        let mut runs = deployer
            .trigger()
            .into_handle()
            .expect("nothing else is running")
            .wait()
            .await;
        assert_eq!(runs.len(), 1);
        runs.pop().unwrap()
    }

    fn config(dir: &Path, timeout_secs: u64) -> DeployConfig {
        DeployConfig {
            repo_root: dir.to_path_buf(),
            deploy_command: PathBuf::from("deploy.sh"),
            deploy_timeout_secs: timeout_secs,
            update_command: Some(vec![]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn successful_run_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "echo \"deploying $1\"\nexit 0");

        let deployer = Deployer::from_config(&config(dir.path(), 30)).unwrap();
        let run = run_once(&deployer).await;

        assert_eq!(run.outcome, Some(DeploymentOutcome::Success));
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.stdout, "deploying --automated\n");
        assert!(run.command.ends_with("deploy.sh --automated"));
        assert_eq!(deployer.triggered_count(), 1);
        assert_eq!(deployer.last_run().map(|r| r.id), Some(run.id));
    }

    #[tokio::test]
    async fn failing_run_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "echo 'build broke' >&2\nexit 4");

        let deployer = Deployer::from_config(&config(dir.path(), 30)).unwrap();
        let run = run_once(&deployer).await;

        assert_eq!(run.outcome, Some(DeploymentOutcome::Failure));
        assert_eq!(run.exit_code, Some(4));
        assert_eq!(run.stderr, "build broke\n");
    }

    #[tokio::test]
    async fn slow_run_times_out() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "exec sleep 30");

        let deployer = Deployer::from_config(&config(dir.path(), 1)).unwrap();
        let started = Instant::now();
        let run = run_once(&deployer).await;

        assert_eq!(run.outcome, Some(DeploymentOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!deployer.is_running());
    }

    #[tokio::test]
    async fn failed_update_aborts_before_deploy() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "touch deployed.marker");

        let mut cfg = config(dir.path(), 30);
        cfg.update_command = Some(vec!["sh".into(), "-c".into(), "echo conflict >&2; exit 1".into()]);
        let deployer = Deployer::from_config(&cfg).unwrap();
        let run = run_once(&deployer).await;

        assert_eq!(run.outcome, Some(DeploymentOutcome::Errored));
        assert!(run.error.as_deref().unwrap_or_default().contains("conflict"));
        assert!(!dir.path().join("deployed.marker").exists());
    }

    #[tokio::test]
    async fn update_runs_in_repo_root_before_deploy() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "cat updated.marker");

        let mut cfg = config(dir.path(), 30);
        cfg.update_command = Some(vec!["sh".into(), "-c".into(), "echo fresh > updated.marker".into()]);
        let deployer = Deployer::from_config(&cfg).unwrap();
        let run = run_once(&deployer).await;

        assert_eq!(run.outcome, Some(DeploymentOutcome::Success));
        assert_eq!(run.stdout, "fresh\n");
    }

    #[tokio::test]
    async fn update_timeout_aborts() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "exit 0");

        let mut cfg = config(dir.path(), 30);
        cfg.update_command = Some(vec!["sleep".into(), "30".into()]);
        cfg.update_timeout_secs = Some(1);
        let deployer = Deployer::from_config(&cfg).unwrap();
        let run = run_once(&deployer).await;

        assert_eq!(run.outcome, Some(DeploymentOutcome::Errored));
        assert!(run.error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn trigger_during_run_queues_one_more() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "deploy.sh",
            "echo start >> runs.log\nsleep 0.3\necho end >> runs.log",
        );

        let deployer = Deployer::from_config(&config(dir.path(), 30)).unwrap();
        let first = deployer.trigger().into_handle().unwrap();
        assert!(deployer.is_running());
        assert!(matches!(deployer.trigger(), TriggerOutcome::Queued));

        let runs = first.wait().await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.outcome == Some(DeploymentOutcome::Success)));
        assert_ne!(runs[0].id, runs[1].id);
        assert_eq!(deployer.triggered_count(), 2);
        assert!(!deployer.is_running());

        let log = fs::read_to_string(dir.path().join("runs.log")).unwrap();
        assert_eq!(log, "start\nend\nstart\nend\n");
    }

    #[tokio::test]
    async fn trigger_burst_runs_at_most_twice() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "deploy.sh",
            "echo start >> runs.log\nsleep 0.3\necho end >> runs.log",
        );

        let deployer = Deployer::from_config(&config(dir.path(), 30)).unwrap();
        let outcomes: Vec<_> = (0..10).map(|_| deployer.trigger()).collect();
        assert_eq!(deployer.triggered_count(), 10);

        let mut handles = Vec::new();
        let (mut queued, mut folded) = (0, 0);
        for outcome in outcomes {
            match outcome {
                TriggerOutcome::Started(handle) => handles.push(handle),
                TriggerOutcome::Queued => queued += 1,
                TriggerOutcome::AlreadyQueued => folded += 1,
            }
        }
        assert_eq!((handles.len(), queued, folded), (1, 1, 8));

        let runs = handles.pop().unwrap().wait().await;
        assert_eq!(runs.len(), 2);
        assert!(!deployer.is_running());

        let log = fs::read_to_string(dir.path().join("runs.log")).unwrap();
        assert_eq!(log, "start\nend\nstart\nend\n");

        // Slot is free again
        assert!(deployer.trigger().into_handle().is_some());
    }

    #[tokio::test]
    async fn audit_log_records_start_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "exec sleep 30");

        let capture = AuditCapture::start();
        let deployer = Deployer::from_config(&config(dir.path(), 1)).unwrap();
        let run = run_once(&deployer).await;
        let log = capture.finish();

        assert_eq!(run.outcome, Some(DeploymentOutcome::TimedOut));
        assert_eq!(log.matches("Starting deployment...").count(), 1);
        assert!(log.contains(&format!(
            "Deployment {} timed out after 1 seconds",
            run.id
        )));
    }

    #[tokio::test]
    async fn audit_log_formats_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "exit 4");

        let capture = AuditCapture::start();
        let deployer = Deployer::from_config(&config(dir.path(), 30)).unwrap();
        let run = run_once(&deployer).await;
        let log = capture.finish();

        assert!(log.contains(&format!("Deployment {} failed with exit code 4", run.id)));
        assert!(!log.contains("Some(4)"));
    }

    #[tokio::test]
    async fn non_executable_command_is_errored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("deploy.sh"), "echo hi").unwrap();
        fs::set_permissions(
            dir.path().join("deploy.sh"),
            fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let deployer = Deployer::from_config(&config(dir.path(), 30)).unwrap();
        let run = run_once(&deployer).await;
        assert_eq!(run.outcome, Some(DeploymentOutcome::Errored));
    }

    #[test]
    fn missing_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Deployer::from_config(&config(dir.path(), 30));
        assert!(matches!(result, Err(DeployError::DeployCommandMissing(_))));
    }
}
