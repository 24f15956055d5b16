//! Deployment pipeline
//!
//! A deployment walks the stages in [`Stage`] order, one shell command (or
//! a small group) per transition. Once the live entry point has been backed
//! up, a failing stage restores the backup and restarts the service;
//! [`failure_transition`] is the table deciding which failures do that.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{ConcurrencyPolicy, DeployConfig, RestartFailurePolicy};
use crate::logging::DeployLog;
use crate::runner::{CommandOutput, CommandRunner, quote};

const STEP_SEPARATOR: &str = " → ";

/// Pipeline progress, in order. Each variant is the state reached after
/// the corresponding step succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Start,
    Cloned,
    BackedUp,
    Copied,
    DepsInstalled,
    Restarted,
    HealthVerified,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Start => Some(Stage::Cloned),
            Stage::Cloned => Some(Stage::BackedUp),
            Stage::BackedUp => Some(Stage::Copied),
            Stage::Copied => Some(Stage::DepsInstalled),
            Stage::DepsInstalled => Some(Stage::Restarted),
            Stage::Restarted => Some(Stage::HealthVerified),
            Stage::HealthVerified => None,
        }
    }

    /// Name recorded in the completed steps once this stage is reached.
    pub fn step_label(self) -> &'static str {
        match self {
            Stage::Start => "started",
            Stage::Cloned => "cloned",
            Stage::BackedUp => "backed up",
            Stage::Copied => "copied",
            Stage::DepsInstalled => "deps installed",
            Stage::Restarted => "restarted",
            Stage::HealthVerified => "health OK",
        }
    }

    /// Whether a `.bak` of the live entry point exists in this stage.
    pub fn has_backup(self) -> bool {
        self >= Stage::BackedUp
    }
}

/// How a deployment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Stopped with nothing restored.
    Failed,
    /// The backup was put back and the service restarted.
    RolledBack,
}

/// Terminal outcome when the step leaving `from` fails.
pub fn failure_transition(from: Stage, restart_failure: RestartFailurePolicy) -> Outcome {
    match from {
        // clone or backup failed, the live copy is untouched
        Stage::Start | Stage::Cloned => Outcome::Failed,
        // the restart itself failed; see RestartFailurePolicy
        Stage::DepsInstalled => match restart_failure {
            RestartFailurePolicy::Abort => Outcome::Failed,
            RestartFailurePolicy::Rollback => Outcome::RolledBack,
        },
        Stage::BackedUp | Stage::Copied | Stage::Restarted | Stage::HealthVerified => {
            Outcome::RolledBack
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub id: Uuid,
    pub success: bool,
    pub outcome: Outcome,
    pub message: String,
    pub completed_steps: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What a trigger got back from [`Deployer::deploy`].
#[derive(Debug, Clone)]
pub enum DeployAttempt {
    Completed(DeploymentResult),
    /// Another deployment holds the single-flight guard.
    Busy,
}

/// Concrete commands for every stage.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    /// Working directory for commands that don't run inside the app dir.
    pub work_dir: PathBuf,
    pub app_dir: PathBuf,
    pub entry_point: PathBuf,
    pub backup_path: PathBuf,
    pub clean_staging: String,
    pub fetch: String,
    pub backup: String,
    pub copy_entry: String,
    pub copy_manifest: String,
    pub install: String,
    pub restart: String,
    pub health_probe: String,
    pub restore: String,
    pub remove_backup: String,
    pub health_ok_status: String,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub restart_failure: RestartFailurePolicy,
}

fn shell_path(path: &Path) -> String {
    quote(path.to_string_lossy())
}

impl DeployPlan {
    pub fn from_config(config: &DeployConfig) -> Self {
        let entry_point = config.app_dir.join(&config.entry_point);
        let backup_path = PathBuf::from(format!("{}.bak", entry_point.display()));
        let staged_source = config.staging_dir.join(&config.source_dir);
        let staged_entry = staged_source.join(&config.entry_point);
        let staged_manifest = staged_source.join(&config.manifest);
        let live_manifest = config.app_dir.join(&config.manifest);

        Self {
            work_dir: std::env::temp_dir(),
            app_dir: config.app_dir.clone(),
            clean_staging: format!("rm -rf {}", shell_path(&config.staging_dir)),
            fetch: format!(
                "git clone --depth 1 --branch {} {} {}",
                quote(&config.branch),
                quote(&config.repo_url),
                shell_path(&config.staging_dir)
            ),
            backup: format!("cp {} {}", shell_path(&entry_point), shell_path(&backup_path)),
            copy_entry: format!("cp {} {}", shell_path(&staged_entry), shell_path(&entry_point)),
            copy_manifest: format!(
                "cp {} {}",
                shell_path(&staged_manifest),
                shell_path(&live_manifest)
            ),
            install: config.install_command(),
            restart: config.restart_command.clone(),
            health_probe: config.health_command.clone(),
            restore: format!("cp {} {}", shell_path(&backup_path), shell_path(&entry_point)),
            remove_backup: format!("rm -f {}", shell_path(&backup_path)),
            health_ok_status: config.health_ok_status.clone(),
            health_attempts: config.health_attempts,
            health_interval: config.health_interval(),
            restart_failure: config.restart_failure,
            entry_point,
            backup_path,
        }
    }

    fn entry_name(&self) -> String {
        self.entry_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.entry_point.display().to_string())
    }
}

/// Stage reached so far, shared with the deploy task so an unexpected
/// fault can still tell whether a backup exists.
#[derive(Debug)]
struct Progress {
    stage: Stage,
    steps: Vec<String>,
}

impl Progress {
    fn new() -> Self {
        Self {
            stage: Stage::Start,
            steps: Vec::new(),
        }
    }
}

type SharedProgress = Arc<StdMutex<Progress>>;

fn snapshot(progress: &SharedProgress) -> (Stage, Vec<String>) {
    match progress.lock() {
        Ok(p) => (p.stage, p.steps.clone()),
        Err(poisoned) => {
            let p = poisoned.into_inner();
            (p.stage, p.steps.clone())
        }
    }
}

/// Owner of the live deployment. At most one pipeline runs at a time.
pub struct Deployer {
    plan: DeployPlan,
    runner: CommandRunner,
    log: DeployLog,
    concurrency: ConcurrencyPolicy,
    in_flight: Arc<Mutex<()>>,
    #[cfg(test)]
    panic_leaving: Option<Stage>,
}

impl Deployer {
    pub fn new(
        plan: DeployPlan,
        runner: CommandRunner,
        log: DeployLog,
        concurrency: ConcurrencyPolicy,
    ) -> Self {
        Self {
            plan,
            runner,
            log,
            concurrency,
            in_flight: Arc::new(Mutex::new(())),
            #[cfg(test)]
            panic_leaving: None,
        }
    }

    pub fn from_config(config: &DeployConfig, log: DeployLog) -> Self {
        Self::new(
            DeployPlan::from_config(config),
            CommandRunner::new(config.command_timeout()),
            log,
            config.concurrency,
        )
    }

    pub fn plan(&self) -> &DeployPlan {
        &self.plan
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Run one deployment under the single-flight guard.
    ///
    /// Once the guard is taken, the deployment runs to completion in its
    /// own task holding the guard, even if the caller stops waiting.
    pub async fn deploy(self: &Arc<Self>) -> DeployAttempt {
        let guard = match self.concurrency {
            ConcurrencyPolicy::Reject => match Arc::clone(&self.in_flight).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    self.log
                        .log("Deployment already in progress, rejecting trigger")
                        .await;
                    return DeployAttempt::Busy;
                }
            },
            ConcurrencyPolicy::Queue => {
                if self.is_busy() {
                    self.log.log("Deployment in progress, queueing trigger").await;
                }
                Arc::clone(&self.in_flight).lock_owned().await
            }
        };

        let deployer = Arc::clone(self);
        let started_at = Utc::now();
        let run = tokio::spawn(async move { deployer.run_guarded(guard).await });

        match run.await {
            Ok(result) => DeployAttempt::Completed(result),
            Err(e) => {
                error!("Deployment task failed: {}", e);
                DeployAttempt::Completed(DeploymentResult {
                    id: Uuid::now_v7(),
                    success: false,
                    outcome: Outcome::Failed,
                    message: format!("Deploy error: {}", e),
                    completed_steps: Vec::new(),
                    started_at,
                    finished_at: Utc::now(),
                })
            }
        }
    }

    /// The stages execute in a further task so that a panic in any of
    /// them is caught here, followed by an emergency rollback.
    async fn run_guarded(self: Arc<Self>, _guard: OwnedMutexGuard<()>) -> DeploymentResult {
        let id = Uuid::now_v7();
        let started_at = Utc::now();
        info!("Deployment {} started", id);

        let progress: SharedProgress = Arc::new(StdMutex::new(Progress::new()));
        let deployer = Arc::clone(&self);
        let task_progress = Arc::clone(&progress);
        let run = tokio::spawn(async move { deployer.run_stages(&task_progress).await });

        let (outcome, reason) = match run.await {
            Ok(finished) => finished,
            Err(e) => {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "deployment task cancelled".to_string()
                };
                error!("Deployment {} aborted: {}", id, reason);
                self.emergency_rollback(&progress).await;
                (Outcome::Failed, format!("Deploy error: {}", reason))
            }
        };

        let (_, completed_steps) = snapshot(&progress);
        let message = match outcome {
            Outcome::Succeeded => format!(
                "Deploy successful: {}",
                completed_steps.join(STEP_SEPARATOR)
            ),
            _ if completed_steps.is_empty() => reason,
            _ => format!(
                "{} (completed: {})",
                reason,
                completed_steps.join(STEP_SEPARATOR)
            ),
        };

        info!("Deployment {} finished: {:?}", id, outcome);
        self.log.log(&message).await;
        DeploymentResult {
            id,
            success: outcome == Outcome::Succeeded,
            outcome,
            message,
            completed_steps,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_stages(&self, progress: &SharedProgress) -> (Outcome, String) {
        let mut stage = Stage::Start;
        while let Some(next) = stage.next() {
            if let Err(reason) = self.advance(stage).await {
                return match failure_transition(stage, self.plan.restart_failure) {
                    Outcome::RolledBack => {
                        self.rollback().await;
                        (Outcome::RolledBack, format!("{}, rolled back", reason))
                    }
                    outcome => (outcome, reason),
                };
            }
            stage = next;
            if let Ok(mut p) = progress.lock() {
                p.stage = next;
                p.steps.push(next.step_label().to_string());
            }
        }

        self.cleanup().await;
        (Outcome::Succeeded, String::new())
    }

    /// Execute the step that leaves `from`.
    async fn advance(&self, from: Stage) -> Result<(), String> {
        #[cfg(test)]
        if self.panic_leaving == Some(from) {
            panic!("fault injected leaving {:?}", from);
        }

        match from {
            Stage::Start => self.fetch().await,
            Stage::Cloned => self.backup().await,
            Stage::BackedUp => self.copy().await,
            Stage::Copied => {
                self.install().await;
                Ok(())
            }
            Stage::DepsInstalled => self.restart().await,
            Stage::Restarted => self.verify_health().await,
            Stage::HealthVerified => Ok(()),
        }
    }

    async fn exec(&self, command: &str) -> CommandOutput {
        self.runner.run(command, &self.plan.work_dir).await
    }

    async fn fetch(&self) -> Result<(), String> {
        self.log.log("==> Cloning latest code...").await;
        self.exec(&self.plan.clean_staging).await;
        let out = self.exec(&self.plan.fetch).await;
        if !out.success() {
            return Err(format!("Git clone failed: {}", out.output));
        }
        Ok(())
    }

    async fn backup(&self) -> Result<(), String> {
        self.log.log("==> Backing up current code...").await;
        let out = self.exec(&self.plan.backup).await;
        if !out.success() {
            return Err(format!(
                "Backup of {} failed: {}",
                self.plan.entry_name(),
                out.output
            ));
        }
        Ok(())
    }

    async fn copy(&self) -> Result<(), String> {
        self.log.log("==> Copying new files...").await;
        let out = self.exec(&self.plan.copy_entry).await;
        if !out.success() {
            return Err(format!(
                "Copy {} failed: {}",
                self.plan.entry_name(),
                out.output
            ));
        }
        let manifest = self.exec(&self.plan.copy_manifest).await;
        if !manifest.success() {
            self.log
                .warn(format!("dependency manifest not copied: {}", manifest.output))
                .await;
        }
        Ok(())
    }

    /// A failed install is tolerated: the new code may run fine against
    /// the packages already installed.
    async fn install(&self) {
        self.log.log("==> Installing dependencies...").await;
        let out = self
            .runner
            .run(&self.plan.install, &self.plan.app_dir)
            .await;
        if !out.success() {
            self.log
                .warn(format!("dependency install failed: {}", out.output))
                .await;
        }
    }

    async fn restart(&self) -> Result<(), String> {
        self.log.log("==> Restarting service...").await;
        let out = self.exec(&self.plan.restart).await;
        if !out.success() {
            return Err(format!("Restart failed: {}", out.output));
        }
        Ok(())
    }

    async fn verify_health(&self) -> Result<(), String> {
        self.log.log("==> Running health check...").await;
        let attempts = self.plan.health_attempts;
        let mut last_status = String::new();
        for attempt in 1..=attempts {
            tokio::time::sleep(self.plan.health_interval).await;
            let out = self.exec(&self.plan.health_probe).await;
            let status = out.output.trim().trim_matches('\'').to_string();
            if status == self.plan.health_ok_status {
                return Ok(());
            }
            self.log
                .log(format!(
                    "    Health check attempt {}/{}: HTTP {}",
                    attempt, attempts, status
                ))
                .await;
            last_status = status;
        }
        self.log
            .log(format!("==> Health check failed after {} attempts", attempts))
            .await;
        Err(format!("Health check failed (HTTP {})", last_status))
    }

    /// Put the backup back and restart. Never fails: each step is best-effort.
    async fn rollback(&self) {
        self.log
            .log(format!(
                "==> Rolling back {} from {}",
                self.plan.entry_point.display(),
                self.plan.backup_path.display()
            ))
            .await;
        self.best_effort("restore backup", &self.plan.restore).await;
        self.best_effort("restart after rollback", &self.plan.restart)
            .await;
    }

    async fn emergency_rollback(&self, progress: &SharedProgress) {
        let (stage, _) = snapshot(progress);
        if stage.has_backup() {
            self.rollback().await;
        } else {
            self.log
                .log("==> No backup taken yet, nothing to roll back")
                .await;
        }
    }

    async fn cleanup(&self) {
        self.best_effort("remove staging directory", &self.plan.clean_staging)
            .await;
        self.best_effort("remove backup", &self.plan.remove_backup)
            .await;
    }

    /// Run a command whose failure is logged and otherwise ignored.
    async fn best_effort(&self, what: &str, command: &str) {
        let out = self.exec(command).await;
        if !out.success() {
            self.log
                .warn(format!(
                    "{} failed (exit {}): {}",
                    what, out.exit_code, out.output
                ))
                .await;
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        app_dir: PathBuf,
        staging_dir: PathBuf,
        remote_dir: PathBuf,
        restarts: PathBuf,
        log_file: PathBuf,
        config: DeployConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let app_dir = root.join("app");
            let remote_dir = root.join("remote");
            let staging_dir = root.join("staging");
            fs::create_dir_all(&app_dir).unwrap();
            fs::create_dir_all(remote_dir.join("backend/api")).unwrap();
            fs::write(app_dir.join("main.py"), "print('old')\n").unwrap();
            fs::write(app_dir.join("requirements.txt"), "flask==2\n").unwrap();
            fs::write(remote_dir.join("backend/api/main.py"), "print('new')\n").unwrap();
            fs::write(remote_dir.join("backend/api/requirements.txt"), "flask==3\n").unwrap();

            let restarts = root.join("restarts");
            let log_file = root.join("deploy.log");
            let config = DeployConfig {
                app_dir: app_dir.clone(),
                staging_dir: staging_dir.clone(),
                log_file: log_file.clone(),
                install_command: Some("true".to_string()),
                restart_command: format!("echo restart >> {}", shell_path(&restarts)),
                health_command: "echo 200".to_string(),
                health_interval_secs: 0,
                command_timeout_secs: 10,
                ..DeployConfig::default()
            };

            Self {
                _dir: dir,
                app_dir,
                staging_dir,
                remote_dir,
                restarts,
                log_file,
                config,
            }
        }

        fn plan(&self) -> DeployPlan {
            let mut plan = DeployPlan::from_config(&self.config);
            // stand-in for git clone
            plan.fetch = format!(
                "cp -R {} {}",
                shell_path(&self.remote_dir),
                shell_path(&self.staging_dir)
            );
            plan
        }

        fn deployer(&self, plan: DeployPlan) -> Arc<Deployer> {
            Arc::new(Deployer::new(
                plan,
                CommandRunner::new(self.config.command_timeout()),
                DeployLog::new(&self.log_file),
                self.config.concurrency,
            ))
        }

        fn panicking_deployer(&self, stage: Stage) -> Arc<Deployer> {
            let mut deployer = Deployer::new(
                self.plan(),
                CommandRunner::new(self.config.command_timeout()),
                DeployLog::new(&self.log_file),
                self.config.concurrency,
            );
            deployer.panic_leaving = Some(stage);
            Arc::new(deployer)
        }

        /// Fetch that takes a second and leaves `overlap` behind if another
        /// fetch was still running when it started.
        fn slow_exclusive_fetch(&self, plan: &mut DeployPlan) -> PathBuf {
            let active = self.app_dir.join("fetch-active");
            let overlap = self.app_dir.join("fetch-overlap");
            plan.fetch = format!(
                "if [ -e {a} ]; then touch {o}; fi; touch {a}; sleep 1; rm -f {a}; {fetch}",
                a = shell_path(&active),
                o = shell_path(&overlap),
                fetch = plan.fetch
            );
            overlap
        }

        fn live_entry(&self) -> String {
            fs::read_to_string(self.app_dir.join("main.py")).unwrap()
        }

        fn restart_count(&self) -> usize {
            fs::read_to_string(&self.restarts)
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }
    }

    async fn wait_until_idle(deployer: &Deployer) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while deployer.is_busy() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("deployment never released the guard");
    }

    async fn completed(deployer: &Arc<Deployer>) -> DeploymentResult {
        match deployer.deploy().await {
            DeployAttempt::Completed(result) => result,
            DeployAttempt::Busy => panic!("deployer unexpectedly busy"),
        }
    }

    #[test]
    fn stages_advance_in_order() {
        let mut stage = Stage::Start;
        let mut labels = Vec::new();
        while let Some(next) = stage.next() {
            labels.push(next.step_label());
            stage = next;
        }
        assert_eq!(
            labels,
            vec!["cloned", "backed up", "copied", "deps installed", "restarted", "health OK"]
        );
        assert_eq!(stage, Stage::HealthVerified);
    }

    #[test]
    fn backup_exists_from_backed_up_onwards() {
        assert!(!Stage::Start.has_backup());
        assert!(!Stage::Cloned.has_backup());
        assert!(Stage::BackedUp.has_backup());
        assert!(Stage::Restarted.has_backup());
    }

    #[test]
    fn failures_before_backup_do_not_roll_back() {
        let abort = RestartFailurePolicy::Abort;
        assert_eq!(failure_transition(Stage::Start, abort), Outcome::Failed);
        assert_eq!(failure_transition(Stage::Cloned, abort), Outcome::Failed);
        assert_eq!(failure_transition(Stage::BackedUp, abort), Outcome::RolledBack);
        assert_eq!(failure_transition(Stage::Restarted, abort), Outcome::RolledBack);
    }

    #[test]
    fn restart_failure_follows_policy() {
        assert_eq!(
            failure_transition(Stage::DepsInstalled, RestartFailurePolicy::Abort),
            Outcome::Failed
        );
        assert_eq!(
            failure_transition(Stage::DepsInstalled, RestartFailurePolicy::Rollback),
            Outcome::RolledBack
        );
    }

    #[test]
    fn plan_from_config_quotes_paths() {
        let config = DeployConfig {
            app_dir: PathBuf::from("/srv/my app"),
            ..DeployConfig::default()
        };
        let plan = DeployPlan::from_config(&config);
        assert_eq!(plan.entry_point, PathBuf::from("/srv/my app/main.py"));
        assert_eq!(plan.backup_path, PathBuf::from("/srv/my app/main.py.bak"));
        assert_eq!(plan.backup, "cp '/srv/my app/main.py' '/srv/my app/main.py.bak'");
        assert_eq!(
            plan.fetch,
            "git clone --depth 1 --branch 'main' \
             'https://github.com/manpreetsingh78/portfolio-source-code.git' '/tmp/portfolio-deploy'"
        );
        assert_eq!(
            plan.copy_entry,
            "cp '/tmp/portfolio-deploy/backend/api/main.py' '/srv/my app/main.py'"
        );
        assert_eq!(plan.entry_name(), "main.py");
    }

    #[tokio::test]
    async fn successful_deploy_promotes_code_and_cleans_up() {
        let fx = Fixture::new();
        let deployer = fx.deployer(fx.plan());

        let result = completed(&deployer).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(
            result.message,
            "Deploy successful: cloned → backed up → copied → deps installed → restarted → health OK"
        );
        assert_eq!(result.completed_steps.len(), 6);
        assert_eq!(fx.live_entry(), "print('new')\n");
        assert_eq!(
            fs::read_to_string(fx.app_dir.join("requirements.txt")).unwrap(),
            "flask==3\n"
        );
        assert!(!fx.staging_dir.exists());
        assert!(!fx.app_dir.join("main.py.bak").exists());
        assert_eq!(fx.restart_count(), 1);

        let log = fs::read_to_string(&fx.log_file).unwrap();
        assert!(log.contains("==> Cloning latest code..."));
        assert!(log.contains("==> Running health check..."));
    }

    #[tokio::test]
    async fn failed_health_check_restores_previous_entry_point() {
        let fx = Fixture::new();
        let before = fs::read(fx.app_dir.join("main.py")).unwrap();
        let mut plan = fx.plan();
        plan.health_probe = "echo 503".to_string();
        let deployer = fx.deployer(plan);

        let result = completed(&deployer).await;

        assert!(!result.success);
        assert_eq!(result.outcome, Outcome::RolledBack);
        assert!(result
            .message
            .starts_with("Health check failed (HTTP 503), rolled back"));
        assert_eq!(result.completed_steps.last().unwrap(), "restarted");
        assert_eq!(fs::read(fx.app_dir.join("main.py")).unwrap(), before);
        assert!(fx.restart_count() >= 2);

        let log = fs::read_to_string(&fx.log_file).unwrap();
        assert!(log.contains("Health check attempt 5/5: HTTP 503"));
    }

    #[tokio::test]
    async fn health_check_retries_until_ok() {
        let fx = Fixture::new();
        let counter = fx.app_dir.join("probe-count");
        let mut plan = fx.plan();
        plan.health_probe = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; \
             if [ $n -ge 3 ]; then echo 200; else echo 502; fi",
            c = shell_path(&counter)
        );
        let deployer = fx.deployer(plan);

        let result = completed(&deployer).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(fs::read_to_string(&counter).unwrap().trim(), "3");
        assert_eq!(fx.restart_count(), 1);
    }

    #[tokio::test]
    async fn clone_failure_touches_nothing() {
        let fx = Fixture::new();
        let mut plan = fx.plan();
        plan.fetch = "echo 'fatal: repository not found' >&2; exit 128".to_string();
        let deployer = fx.deployer(plan);

        let result = completed(&deployer).await;

        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.message, "Git clone failed: fatal: repository not found");
        assert!(result.completed_steps.is_empty());
        assert_eq!(fx.live_entry(), "print('old')\n");
        assert_eq!(fx.restart_count(), 0);
    }

    #[tokio::test]
    async fn copy_failure_rolls_back() {
        let fx = Fixture::new();
        fs::remove_file(fx.remote_dir.join("backend/api/main.py")).unwrap();
        let deployer = fx.deployer(fx.plan());

        let result = completed(&deployer).await;

        assert_eq!(result.outcome, Outcome::RolledBack);
        assert!(result.message.starts_with("Copy main.py failed"));
        assert!(result.message.ends_with("(completed: cloned → backed up)"));
        assert_eq!(fx.live_entry(), "print('old')\n");
        assert_eq!(fx.restart_count(), 1);
    }

    #[tokio::test]
    async fn install_failure_is_tolerated() {
        let fx = Fixture::new();
        let mut plan = fx.plan();
        plan.install = "echo 'No matching distribution'; exit 1".to_string();
        let deployer = fx.deployer(plan);

        let result = completed(&deployer).await;

        assert!(result.success, "{}", result.message);
        assert!(result.completed_steps.contains(&"deps installed".to_string()));
        let log = fs::read_to_string(&fx.log_file).unwrap();
        assert!(log.contains("WARNING: dependency install failed: No matching distribution"));
    }

    #[tokio::test]
    async fn restart_failure_aborts_without_rollback_by_default() {
        let fx = Fixture::new();
        let mut plan = fx.plan();
        plan.restart = "echo 'Unit portfolio-api.service not found.'; exit 5".to_string();
        let deployer = fx.deployer(plan);

        let result = completed(&deployer).await;

        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.message.starts_with("Restart failed: Unit portfolio-api.service"));
        // new code stays in place for the operator
        assert_eq!(fx.live_entry(), "print('new')\n");
        assert!(fx.app_dir.join("main.py.bak").exists());
    }

    #[tokio::test]
    async fn restart_failure_rolls_back_when_configured() {
        let fx = Fixture::new();
        let mut plan = fx.plan();
        plan.restart = "exit 1".to_string();
        plan.restart_failure = RestartFailurePolicy::Rollback;
        let deployer = fx.deployer(plan);

        let result = completed(&deployer).await;

        assert_eq!(result.outcome, Outcome::RolledBack);
        assert!(result.message.contains("rolled back"));
        assert_eq!(fx.live_entry(), "print('old')\n");
        let log = fs::read_to_string(&fx.log_file).unwrap();
        assert!(log.contains("WARNING: restart after rollback failed"));
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let fx = Fixture::new();
        let mut plan = fx.plan();
        plan.fetch = format!("sleep 1; {}", plan.fetch);
        let deployer = fx.deployer(plan);

        let first = {
            let deployer = Arc::clone(&deployer);
            tokio::spawn(async move { deployer.deploy().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(deployer.is_busy());
        assert!(matches!(deployer.deploy().await, DeployAttempt::Busy));

        match first.await.unwrap() {
            DeployAttempt::Completed(result) => assert!(result.success, "{}", result.message),
            DeployAttempt::Busy => panic!("first deployment should run"),
        }
        assert!(!deployer.is_busy());
    }

    #[tokio::test]
    async fn queued_trigger_runs_after_the_first() {
        let mut fx = Fixture::new();
        fx.config.concurrency = ConcurrencyPolicy::Queue;
        let mut plan = fx.plan();
        plan.fetch = format!("sleep 1; {}", plan.fetch);
        let deployer = fx.deployer(plan);

        let first = {
            let deployer = Arc::clone(&deployer);
            tokio::spawn(async move { deployer.deploy().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = completed(&deployer).await;

        assert!(second.success, "{}", second.message);
        assert!(matches!(first.await.unwrap(), DeployAttempt::Completed(_)));
        assert_eq!(fx.restart_count(), 2);
    }

    #[tokio::test]
    async fn abandoned_trigger_keeps_the_guard_until_the_pipeline_ends() {
        let fx = Fixture::new();
        let mut plan = fx.plan();
        let overlap = fx.slow_exclusive_fetch(&mut plan);
        let deployer = fx.deployer(plan);

        let first = {
            let deployer = Arc::clone(&deployer);
            tokio::spawn(async move { deployer.deploy().await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        assert!(deployer.is_busy());
        assert!(matches!(deployer.deploy().await, DeployAttempt::Busy));

        // the abandoned deployment still runs to the end
        wait_until_idle(&deployer).await;
        assert_eq!(fx.live_entry(), "print('new')\n");
        assert_eq!(fx.restart_count(), 1);
        assert!(!overlap.exists());
    }

    #[tokio::test]
    async fn queued_trigger_waits_for_an_abandoned_deployment() {
        let mut fx = Fixture::new();
        fx.config.concurrency = ConcurrencyPolicy::Queue;
        let mut plan = fx.plan();
        let overlap = fx.slow_exclusive_fetch(&mut plan);
        let deployer = fx.deployer(plan);

        let first = {
            let deployer = Arc::clone(&deployer);
            tokio::spawn(async move { deployer.deploy().await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        first.abort();

        let second = completed(&deployer).await;

        assert!(second.success, "{}", second.message);
        assert!(!overlap.exists());
        assert_eq!(fx.restart_count(), 2);
    }

    #[tokio::test]
    async fn panic_after_backup_restores_previous_entry_point() {
        let fx = Fixture::new();
        let deployer = fx.panicking_deployer(Stage::Copied);

        let result = completed(&deployer).await;

        assert!(!result.success);
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(
            result.message,
            "Deploy error: fault injected leaving Copied (completed: cloned → backed up → copied)"
        );
        assert_eq!(fx.live_entry(), "print('old')\n");
        assert_eq!(fx.restart_count(), 1);
        assert!(!deployer.is_busy());

        let log = fs::read_to_string(&fx.log_file).unwrap();
        assert!(log.contains("==> Rolling back"));
    }

    #[tokio::test]
    async fn panic_before_backup_leaves_live_code_alone() {
        let fx = Fixture::new();
        let deployer = fx.panicking_deployer(Stage::Start);

        let result = completed(&deployer).await;

        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.message, "Deploy error: fault injected leaving Start");
        assert!(result.completed_steps.is_empty());
        assert_eq!(fx.live_entry(), "print('old')\n");
        assert_eq!(fx.restart_count(), 0);
        assert!(!deployer.is_busy());

        let log = fs::read_to_string(&fx.log_file).unwrap();
        assert!(log.contains("==> No backup taken yet, nothing to roll back"));
        assert!(!log.contains("==> Rolling back"));
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
