//! Per-request download jobs.
//!
//! A job walks `Validating → ProfileSelected → Running → …` as a single
//! sequential task. Profile fallback and artifact polling are bounded loops;
//! the only cancellation source is the job deadline, which is never reset by a
//! fallback attempt.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::artifact::{ARTIFACT_PREFIX, Artifact, ArtifactPoller, cleanup_job_files};
use crate::cookies::CookieConfig;
use crate::errors::{DownloadError, classify_failure};
use crate::extractor::{AUDIO_EXTENSION, ExtractorCommand};
use crate::profiles::{ClientProfile, ProfileSequencer};
use crate::response_gate::{Delivery, JobReply, ResponseGate};
use crate::source_url::normalize_source_url;
use crate::supervisor::{ProcessOutcome, ProcessSupervisor};

/// Title used when the lookup fails or yields nothing.
pub const DEFAULT_TITLE: &str = "audio";
/// Budget for the best-effort title lookup.
pub const TITLE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TITLE_CHARS: usize = 100;

static TITLE_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_ \-]").expect("title regex"));

static LAST_JOB_ID: AtomicU64 = AtomicU64::new(0);

/// Millisecond timestamp id, strictly increasing for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl JobId {
    /// Read the clock, bumping past the previous id when two jobs start in
    /// the same millisecond (or the wall clock steps back).
    pub fn next() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut prev = LAST_JOB_ID.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match LAST_JOB_ID.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return JobId(candidate),
                Err(actual) => prev = actual,
            }
        }
    }

    /// File stem shared by everything the extractor writes for this job.
    pub fn artifact_stem(&self) -> String {
        format!("{ARTIFACT_PREFIX}{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Validating,
    ProfileSelected,
    Running,
    Retrying,
    Succeeded,
    Polling,
    Found,
    Resolving,
    Delivering,
    Cleanup,
    Done,
    TimedOut,
    FailedTerminal,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Validating => "validating",
            JobState::ProfileSelected => "profile_selected",
            JobState::Running => "running",
            JobState::Retrying => "retrying",
            JobState::Succeeded => "succeeded",
            JobState::Polling => "polling",
            JobState::Found => "found",
            JobState::Resolving => "resolving",
            JobState::Delivering => "delivering",
            JobState::Cleanup => "cleanup",
            JobState::Done => "done",
            JobState::TimedOut => "timed_out",
            JobState::FailedTerminal => "failed",
        }
    }
}

/// Shared, read-only dependencies for every job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub extractor: PathBuf,
    pub work_dir: PathBuf,
    pub cookies: Arc<CookieConfig>,
    pub sequencer: ProfileSequencer,
    pub supervisor: ProcessSupervisor,
    pub poller: ArtifactPoller,
    /// Budget for all extractor attempts of one job.
    pub timeout: Duration,
    pub title_timeout: Duration,
}

/// State owned by exactly one running job.
#[derive(Debug)]
pub struct DownloadJob {
    pub id: JobId,
    pub url: String,
    pub output_template: PathBuf,
    pub profile_index: usize,
    pub started_at: Instant,
    pub deadline: Instant,
    state: JobState,
}

impl DownloadJob {
    pub fn new(url: String, ctx: &JobContext) -> Self {
        let id = JobId::next();
        let started_at = Instant::now();
        Self {
            id,
            url,
            output_template: ctx
                .work_dir
                .join(format!("{}.%(ext)s", id.artifact_stem())),
            profile_index: ctx.sequencer.initial(),
            started_at,
            deadline: started_at + ctx.timeout,
            state: JobState::Validating,
        }
    }

    fn transition(&mut self, next: JobState) {
        tracing::debug!(
            job_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "job state"
        );
        self.state = next;
    }
}

/// Starts jobs and drives them to exactly one reply.
#[derive(Debug, Clone)]
pub struct JobController {
    ctx: Arc<JobContext>,
}

impl JobController {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Validate the request and launch the job on its own task.
    ///
    /// The task is detached from the request: a client that disconnects does
    /// not cancel the extractor; the job runs to completion or deadline and
    /// its artifact is deleted when the undeliverable reply is dropped.
    pub fn start(
        &self,
        raw_url: Option<&str>,
    ) -> Result<(JobId, oneshot::Receiver<JobReply>), DownloadError> {
        let url = normalize_source_url(raw_url)?;
        let job = DownloadJob::new(url, &self.ctx);
        let id = job.id;
        let (gate, rx) = ResponseGate::new();
        tracing::info!(job_id = %id, url = %job.url, "starting download");
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            run_job(&ctx, job, gate).await;
        });
        Ok((id, rx))
    }
}

/// Drive one job and deliver its single reply.
pub async fn run_job(ctx: &JobContext, mut job: DownloadJob, gate: ResponseGate) {
    let stem = job.id.artifact_stem();
    let reply = match execute(ctx, &mut job).await {
        Ok(reply) => {
            job.transition(JobState::Delivering);
            reply
        }
        Err(err) => {
            job.transition(if matches!(err, DownloadError::ProcessTimeout { .. }) {
                JobState::TimedOut
            } else {
                JobState::FailedTerminal
            });
            tracing::error!(
                job_id = %job.id,
                kind = err.kind(),
                error = %err,
                elapsed_ms = %job.started_at.elapsed().as_millis(),
                "download failed"
            );
            JobReply::Failed(err)
        }
    };

    let artifact_path = match &reply {
        JobReply::Audio { artifact, .. } => Some(artifact.path().to_path_buf()),
        JobReply::Failed(_) => None,
    };
    let delivery = gate.deliver(reply);
    tracing::debug!(job_id = %job.id, delivery = ?delivery, "reply handed off");

    // A delivered artifact is still streaming; its guard removes it later.
    job.transition(JobState::Cleanup);
    let streaming = artifact_path.as_deref().filter(|_| delivery == Delivery::Sent);
    discard_job_files(ctx, &job, &stem, streaming).await;
    job.transition(JobState::Done);
}

async fn execute(ctx: &JobContext, job: &mut DownloadJob) -> Result<JobReply, DownloadError> {
    let profile = run_extraction(ctx, job).await?;

    job.transition(JobState::Polling);
    let path = ctx
        .poller
        .locate(&ctx.work_dir, &job.id.artifact_stem(), AUDIO_EXTENSION)
        .await?;
    job.transition(JobState::Found);
    let artifact = Artifact::open(path).await?;
    tracing::info!(
        job_id = %job.id,
        path = %artifact.path().display(),
        size_mb = %format!("{:.2}", artifact.size() as f64 / 1024.0 / 1024.0),
        "artifact ready"
    );

    job.transition(JobState::Resolving);
    let title = resolve_title(ctx, job, profile).await;
    Ok(JobReply::Audio { artifact, title })
}

/// Run the extractor, advancing through profiles on bot challenges.
async fn run_extraction(
    ctx: &JobContext,
    job: &mut DownloadJob,
) -> Result<&'static ClientProfile, DownloadError> {
    let has_cookies = ctx.cookies.has_cookies();
    loop {
        let index = job.profile_index;
        let profile = ctx.sequencer.get(index);
        job.transition(JobState::ProfileSelected);
        if Instant::now() >= job.deadline {
            return Err(DownloadError::ProcessTimeout {
                elapsed: job.started_at.elapsed(),
            });
        }

        let cmd = ExtractorCommand::download(
            &ctx.extractor,
            &job.url,
            &job.output_template,
            profile,
            &ctx.cookies,
        );
        tracing::info!(
            job_id = %job.id,
            profile = profile.name,
            attempt = index + 1,
            max_attempts = if has_cookies { 1 } else { ctx.sequencer.len() },
            cookies = has_cookies,
            command = %cmd.display(),
            "running extractor"
        );
        job.transition(JobState::Running);
        let outcome = ctx.supervisor.run(&cmd, job.deadline).await;
        let elapsed_ms = job.started_at.elapsed().as_millis();

        match outcome {
            ProcessOutcome::Success { ref stdout, ref stderr } => {
                tracing::info!(
                    job_id = %job.id,
                    profile = profile.name,
                    elapsed_ms = %elapsed_ms,
                    stdout_bytes = stdout.len(),
                    stderr_bytes = stderr.len(),
                    "extractor completed"
                );
                job.transition(JobState::Succeeded);
                return Ok(profile);
            }
            ProcessOutcome::TimedOut { elapsed } => {
                tracing::warn!(
                    job_id = %job.id,
                    profile = profile.name,
                    attempt_ms = %elapsed.as_millis(),
                    elapsed_ms = %elapsed_ms,
                    "extractor attempt hit the job deadline"
                );
                return Err(DownloadError::ProcessTimeout {
                    elapsed: job.started_at.elapsed(),
                });
            }
            ProcessOutcome::SpawnFailed(ref e) => {
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    DownloadError::ToolNotFound {
                        tool: cmd.tool_name(),
                    }
                } else {
                    DownloadError::SpawnFailure(e.to_string())
                });
            }
            ProcessOutcome::Failure {
                exit_code,
                signal,
                ref stdout,
                ref stderr,
            } => {
                tracing::warn!(
                    job_id = %job.id,
                    profile = profile.name,
                    exit_code = ?exit_code,
                    signal = ?signal,
                    elapsed_ms = %elapsed_ms,
                    stderr = %stderr.trim(),
                    "extractor failed"
                );
                if ctx.sequencer.should_advance(&outcome, has_cookies, index) {
                    let next = ctx.sequencer.get(index + 1);
                    tracing::warn!(
                        job_id = %job.id,
                        from = profile.name,
                        to = next.name,
                        "access challenged; retrying with next client profile"
                    );
                    job.transition(JobState::Retrying);
                    discard_job_files(ctx, job, &job.id.artifact_stem(), None).await;
                    job.profile_index = index + 1;
                    continue;
                }
                let diagnostics = if stderr.trim().is_empty() { stdout } else { stderr };
                return Err(classify_failure(
                    &cmd.tool_name(),
                    exit_code,
                    signal,
                    diagnostics,
                ));
            }
        }
    }
}

/// Best-effort title lookup; any failure yields [`DEFAULT_TITLE`].
async fn resolve_title(ctx: &JobContext, job: &DownloadJob, profile: &ClientProfile) -> String {
    let cmd = ExtractorCommand::title(&ctx.extractor, &job.url, profile, &ctx.cookies);
    let deadline = Instant::now() + ctx.title_timeout;
    match ctx.supervisor.run(&cmd, deadline).await {
        ProcessOutcome::Success { stdout, .. } => {
            sanitize_title(&stdout).unwrap_or_else(|| DEFAULT_TITLE.to_string())
        }
        other => {
            tracing::warn!(
                job_id = %job.id,
                outcome = other.label(),
                "title lookup failed; using default title"
            );
            DEFAULT_TITLE.to_string()
        }
    }
}

/// Make a title safe for a header value and a file name.
pub fn sanitize_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let cleaned = TITLE_UNSAFE.replace_all(line, "_");
    Some(cleaned.chars().take(MAX_TITLE_CHARS).collect())
}

async fn discard_job_files(
    ctx: &JobContext,
    job: &DownloadJob,
    stem: &str,
    keep: Option<&std::path::Path>,
) {
    match cleanup_job_files(&ctx.work_dir, stem, keep).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(job_id = %job.id, count = n, "removed job temp files"),
        Err(e) => tracing::warn!(job_id = %job.id, error = %e, "job temp cleanup failed"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifact::PollPolicy;
    use crate::test_support::{fake_extractor, temp_dir};

    const ARG_PARSER: &str = r#"
out=""
client=""
title=0
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    --extractor-args) client="$2"; shift ;;
    --get-title) title=1 ;;
  esac
  shift
done
"#;

    fn context(work_dir: &std::path::Path, extractor: PathBuf, cookies: CookieConfig) -> JobContext {
        JobContext {
            extractor,
            work_dir: work_dir.to_path_buf(),
            cookies: Arc::new(cookies),
            sequencer: ProfileSequencer::default(),
            supervisor: ProcessSupervisor::new(Duration::from_millis(200), 64 * 1024),
            poller: ArtifactPoller::new(PollPolicy {
                interval: Duration::from_millis(10),
                max_attempts: 5,
                io_retry_interval: Duration::from_millis(10),
                io_max_attempts: 2,
            }),
            timeout: Duration::from_secs(20),
            title_timeout: Duration::from_secs(5),
        }
    }

    async fn run_to_reply(ctx: JobContext, url: &str) -> JobReply {
        let controller = JobController::new(Arc::new(ctx));
        let (_, rx) = controller.start(Some(url)).unwrap();
        rx.await.expect("job produced a reply")
    }

    fn job_files(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with(ARTIFACT_PREFIX))
            .collect()
    }

    #[test]
    fn job_ids_are_unique_and_increasing() {
        let a = JobId::next();
        let b = JobId::next();
        assert!(b > a);
        assert_ne!(a.artifact_stem(), b.artifact_stem());
    }

    #[test]
    fn title_is_sanitized_and_truncated() {
        assert_eq!(sanitize_title("My Song: Live!\n").as_deref(), Some("My Song_ Live_"));
        assert_eq!(sanitize_title("  \n"), None);
        let long = "a".repeat(250);
        assert_eq!(sanitize_title(&long).unwrap().len(), MAX_TITLE_CHARS);
        assert_eq!(sanitize_title("Café\tNoir").as_deref(), Some("Caf__Noir"));
        assert_eq!(sanitize_title("\n  Opening\nsecond line").as_deref(), Some("Opening"));
    }

    #[tokio::test]
    async fn invalid_url_fails_validation() {
        let dir = temp_dir("job-validate");
        let controller = JobController::new(Arc::new(context(
            &dir,
            PathBuf::from("yt-dlp"),
            CookieConfig::none(),
        )));
        let err = controller.start(Some("  ")).unwrap_err();
        assert_eq!(err, DownloadError::Validation("URL is required".to_string()));
    }

    #[tokio::test]
    async fn successful_download_delivers_titled_artifact() {
        let work = temp_dir("job-success");
        let bin = temp_dir("job-success-bin");
        let script = fake_extractor(
            &bin,
            &format!(
                r#"{ARG_PARSER}
if [ $title = 1 ]; then echo "My Song: Live!"; exit 0; fi
file=$(printf '%s' "$out" | sed 's/%(ext)s/wav/')
printf 'RIFFDATA' > "$file"
printf 'partial' > "$file.part"
"#
            ),
        );
        let reply = run_to_reply(context(&work, script, CookieConfig::none()), "https://youtu.be/abc?t=1").await;
        let JobReply::Audio { artifact, title } = reply else {
            panic!("expected audio reply");
        };
        assert_eq!(title, "My Song_ Live_");
        assert_eq!(artifact.size(), 8);
        let path = artifact.path().to_path_buf();
        assert!(path.exists());
        drop(artifact);
        assert!(!path.exists());
        // The job task finishes its cleanup right after handing off the reply.
        for _ in 0..50 {
            if job_files(&work).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(job_files(&work).is_empty(), "left behind: {:?}", job_files(&work));
    }

    #[tokio::test]
    async fn bot_challenge_walks_every_profile() {
        let work = temp_dir("job-bot");
        let bin = temp_dir("job-bot-bin");
        let log = bin.join("clients.log");
        let script = fake_extractor(
            &bin,
            &format!(
                r#"{ARG_PARSER}
echo "$client" >> {log}
echo "ERROR: [youtube] abc: Sign in to confirm you're not a bot" >&2
exit 1
"#,
                log = log.display()
            ),
        );
        let reply = run_to_reply(context(&work, script, CookieConfig::none()), "https://youtu.be/abc").await;
        match reply {
            JobReply::Failed(DownloadError::BotDetection { message }) => {
                assert!(message.contains("not a bot"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        let clients: Vec<String> = std::fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(
            clients,
            vec![
                "youtube:player_client=android",
                "youtube:player_client=ios",
                "youtube:player_client=web",
                "youtube:player_client=mweb",
            ]
        );
    }

    #[tokio::test]
    async fn cookies_make_bot_challenge_terminal() {
        let work = temp_dir("job-cookies");
        let bin = temp_dir("job-cookies-bin");
        let log = bin.join("attempts.log");
        let script = fake_extractor(
            &bin,
            &format!(
                r#"echo attempt >> {log}
echo "ERROR: Sign in to confirm you're not a bot" >&2
exit 1
"#,
                log = log.display()
            ),
        );
        let reply = run_to_reply(
            context(&work, script, CookieConfig::browser("firefox")),
            "https://youtu.be/abc",
        )
        .await;
        assert!(matches!(reply, JobReply::Failed(DownloadError::BotDetection { .. })));
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn deadline_yields_timeout_error() {
        let work = temp_dir("job-timeout");
        let bin = temp_dir("job-timeout-bin");
        let script = fake_extractor(&bin, "sleep 30");
        let mut ctx = context(&work, script, CookieConfig::none());
        ctx.timeout = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let reply = run_to_reply(ctx, "https://example.com/video").await;
        match reply {
            JobReply::Failed(err @ DownloadError::ProcessTimeout { .. }) => {
                assert!(err.message().starts_with("Download timeout after"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn silent_success_without_artifact_is_output_missing() {
        let work = temp_dir("job-missing");
        let bin = temp_dir("job-missing-bin");
        let script = fake_extractor(&bin, "exit 0");
        let reply = run_to_reply(context(&work, script, CookieConfig::none()), "https://example.com/v").await;
        assert!(matches!(reply, JobReply::Failed(DownloadError::OutputMissing)));
    }

    #[tokio::test]
    async fn missing_extractor_is_tool_not_found() {
        let work = temp_dir("job-notool");
        let reply = run_to_reply(
            context(&work, work.join("no-such-yt-dlp"), CookieConfig::none()),
            "https://example.com/v",
        )
        .await;
        assert_eq!(
            match reply {
                JobReply::Failed(err) => err,
                other => panic!("unexpected reply: {other:?}"),
            },
            DownloadError::ToolNotFound {
                tool: "no-such-yt-dlp".to_string()
            }
        );
    }

    #[tokio::test]
    async fn identical_requests_get_independent_jobs() {
        let work = temp_dir("job-twice");
        let ctx = Arc::new(context(&work, PathBuf::from("yt-dlp"), CookieConfig::none()));
        let a = DownloadJob::new("https://example.com/v".to_string(), &ctx);
        let b = DownloadJob::new("https://example.com/v".to_string(), &ctx);
        assert_ne!(a.id, b.id);
        assert_ne!(a.output_template, b.output_template);
        assert_eq!(a.state, JobState::Validating);
        assert!(b.deadline > b.started_at);
    }
}
