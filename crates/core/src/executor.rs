//! Job executor: runs one validated generation job end to end.
//!
//! Request parsing lives here too, so the HTTP layer can reject bad
//! parameters before any claim is taken. Once a claim ticket exists,
//! [`JobExecutor::execute`] guarantees the claim is released again no
//! matter how the job ends.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::admission::{AdmissionController, ClaimTicket};
use crate::engine::{GenerationParams, VideoSampler};

const PROMPT_FRAGMENT_MAX_CHARS: usize = 100;

/// A request field that failed validation. The message names the field and
/// is safe to return to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterError {
    message: String,
}

impl ParameterError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ParameterError {}

/// Build a [`GenerationParams`] from a request body, applying defaults for
/// absent fields. Numeric fields accept both JSON numbers and numeric
/// strings; anything else fails naming the offending field.
pub fn parse_generation_request(body: &Value) -> Result<GenerationParams, ParameterError> {
    let prompt = match body.get("prompt") {
        Some(Value::String(prompt)) if !prompt.trim().is_empty() => prompt.clone(),
        _ => {
            return Err(ParameterError::new(
                "Prompt is required and must be a non-empty string",
            ))
        }
    };

    let mut params = GenerationParams::new(prompt);
    params.height = positive_u32_field(body, "height", params.height)?;
    params.width = positive_u32_field(body, "width", params.width)?;
    params.video_length = positive_u32_field(body, "video_length", params.video_length)?;
    params.num_inference_steps =
        positive_u32_field(body, "num_inference_steps", params.num_inference_steps)?;
    params.guidance_scale = f64_field(body, "guidance_scale", params.guidance_scale)?;
    params.flow_shift = f64_field(body, "flow_shift", params.flow_shift)?;
    params.seed = optional_i64_field(body, "seed")?;
    params.negative_prompt = optional_string_field(body, "negative_prompt")?;
    params.embedded_guidance_scale = optional_f64_field(body, "embedded_guidance_scale")?;

    Ok(params)
}

fn positive_u32_field(body: &Value, field: &str, default: u32) -> Result<u32, ParameterError> {
    let Some(value) = body.get(field) else {
        return Ok(default);
    };

    let parsed = match value {
        Value::Number(number) => number
            .as_u64()
            .filter(|n| *n <= u64::from(u32::MAX))
            .map(|n| n as u32),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    };

    match parsed {
        Some(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ParameterError::new(format!(
            "{field} must be a positive integer"
        ))),
    }
}

fn f64_field(body: &Value, field: &str, default: f64) -> Result<f64, ParameterError> {
    let Some(value) = body.get(field) else {
        return Ok(default);
    };

    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| ParameterError::new(format!("{field} must be a number")))
}

// The optional_* fields pass straight through to the sampler, so an explicit
// JSON null reads as absent. Defaulted fields have no absent-vs-null
// distinction and reject null as a type error.

fn optional_f64_field(body: &Value, field: &str) -> Result<Option<f64>, ParameterError> {
    let value = match body.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    };

    parsed
        .map(Some)
        .ok_or_else(|| ParameterError::new(format!("{field} must be a number")))
}

fn optional_i64_field(body: &Value, field: &str) -> Result<Option<i64>, ParameterError> {
    let value = match body.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    let parsed = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    };

    parsed
        .map(Some)
        .ok_or_else(|| ParameterError::new(format!("{field} must be an integer")))
}

fn optional_string_field(body: &Value, field: &str) -> Result<Option<String>, ParameterError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Ok(Some(raw.clone())),
        Some(_) => Err(ParameterError::new(format!("{field} must be a string"))),
    }
}

/// `<timestamp>_seed<seed>_<prompt fragment>.mp4`, with the prompt capped
/// at 100 characters and path separators stripped.
pub fn artifact_file_name(timestamp: &str, seed: i64, prompt: &str) -> String {
    let fragment: String = prompt
        .chars()
        .take(PROMPT_FRAGMENT_MAX_CHARS)
        .filter(|ch| *ch != '/' && *ch != '\\')
        .collect();
    format!("{timestamp}_seed{seed}_{fragment}.mp4")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub video_path: PathBuf,
    pub seed: i64,
    pub prompt: String,
}

pub struct JobExecutor {
    admission: Arc<AdmissionController>,
    sampler: Arc<dyn VideoSampler>,
    /// The sampling engine is not reentrant: one job at a time, process-wide.
    engine_gate: Semaphore,
    results_dir: PathBuf,
}

impl JobExecutor {
    pub fn new(
        admission: Arc<AdmissionController>,
        sampler: Arc<dyn VideoSampler>,
        results_dir: PathBuf,
    ) -> Self {
        Self {
            admission,
            sampler,
            engine_gate: Semaphore::new(1),
            results_dir,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn sampler(&self) -> &dyn VideoSampler {
        self.sampler.as_ref()
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Run a claimed job. The claim is released before this returns,
    /// whether the job succeeded or failed; release itself cannot fail.
    pub async fn execute(
        &self,
        token: &str,
        ticket: &ClaimTicket,
        params: &GenerationParams,
    ) -> Result<JobResult> {
        info!(task_id = %ticket.task_id, "generation job started");

        let result = self.run_generation(params).await;
        self.admission.release(token).await;

        match &result {
            Ok(job) => {
                info!(
                    task_id = %ticket.task_id,
                    video_path = %job.video_path.display(),
                    seed = job.seed,
                    "generation job finished"
                );
            }
            Err(err) => {
                error!(task_id = %ticket.task_id, error = %err, "generation job failed");
            }
        }
        result
    }

    /// Invoke the engine and persist its output. Does not touch claims;
    /// one-shot runs use this directly.
    pub async fn run_generation(&self, params: &GenerationParams) -> Result<JobResult> {
        let output = {
            let _permit = self
                .engine_gate
                .acquire()
                .await
                .context("engine gate closed")?;
            tokio::task::block_in_place(|| self.sampler.generate(params))?
        };

        tokio::fs::create_dir_all(&self.results_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create results directory: {}",
                    self.results_dir.display()
                )
            })?;

        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d-%H:%M:%S")
            .to_string();
        let video_path = self
            .results_dir
            .join(artifact_file_name(&timestamp, output.seed, &output.prompt));

        tokio::fs::write(&video_path, &output.video)
            .await
            .with_context(|| format!("failed to write artifact: {}", video_path.display()))?;

        Ok(JobResult {
            video_path,
            seed: output.seed,
            prompt: output.prompt,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::admission::{AdmissionCheck, AdmissionPolicy, ClaimOutcome};
    use crate::engine::SampleOutput;
    use crate::store::ClaimStore;

    struct MockSampler {
        fail: bool,
        seed: i64,
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl MockSampler {
        fn succeeding(seed: i64) -> Self {
            Self {
                fail: false,
                seed,
                delay: Duration::ZERO,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::succeeding(0)
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::succeeding(1)
            }
        }
    }

    impl VideoSampler for MockSampler {
        fn generate(&self, params: &GenerationParams) -> Result<SampleOutput> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                anyhow::bail!("sampler exploded");
            }
            Ok(SampleOutput {
                video: b"mp4-bytes".to_vec(),
                seed: self.seed,
                prompt: params.prompt.clone(),
            })
        }

        fn is_loaded(&self) -> bool {
            true
        }
    }

    fn executor_with(sampler: Arc<MockSampler>, results_dir: PathBuf) -> JobExecutor {
        let admission = Arc::new(AdmissionController::new(
            ClaimStore::in_memory(Duration::from_secs(60)),
            AdmissionPolicy::FailOpen,
        ));
        JobExecutor::new(admission, sampler, results_dir)
    }

    async fn claim(executor: &JobExecutor, token: &str) -> ClaimTicket {
        match executor.admission().try_claim(token).await {
            ClaimOutcome::Granted(ticket) => ticket,
            other => panic!("expected granted claim, got {other:?}"),
        }
    }

    #[test]
    fn parse_fills_defaults_when_fields_absent() {
        let body = json!({"token": "u1", "prompt": "a cat"});
        let params = parse_generation_request(&body).expect("parse request");

        assert_eq!(params, GenerationParams::new("a cat"));
    }

    #[test]
    fn parse_rejects_missing_empty_or_non_string_prompt() {
        for body in [
            json!({"token": "u1"}),
            json!({"token": "u1", "prompt": ""}),
            json!({"token": "u1", "prompt": "   "}),
            json!({"token": "u1", "prompt": 7}),
        ] {
            let err = parse_generation_request(&body).expect_err("prompt should be rejected");
            assert!(err.message().contains("Prompt"));
        }
    }

    #[test]
    fn parse_rejects_non_positive_dimensions() {
        for (field, body) in [
            ("height", json!({"prompt": "a cat", "height": 0})),
            ("width", json!({"prompt": "a cat", "width": -5})),
            ("video_length", json!({"prompt": "a cat", "video_length": 0})),
        ] {
            let err = parse_generation_request(&body).expect_err("field should be rejected");
            assert!(err.message().contains(field), "message: {}", err.message());
        }
    }

    #[test]
    fn parse_accepts_numeric_strings() {
        let body = json!({
            "prompt": "a cat",
            "height": "480",
            "width": 640,
            "guidance_scale": "6.5",
            "seed": "42",
        });
        let params = parse_generation_request(&body).expect("parse request");

        assert_eq!(params.height, 480);
        assert_eq!(params.width, 640);
        assert_eq!(params.guidance_scale, 6.5);
        assert_eq!(params.seed, Some(42));
    }

    #[test]
    fn parse_treats_null_optionals_as_absent() {
        let body = json!({
            "prompt": "a cat",
            "seed": null,
            "negative_prompt": null,
            "embedded_guidance_scale": null,
        });
        let params = parse_generation_request(&body).expect("parse request");

        assert_eq!(params.seed, None);
        assert_eq!(params.negative_prompt, None);
        assert_eq!(params.embedded_guidance_scale, None);

        // Defaulted fields have no null form.
        let err = parse_generation_request(&json!({"prompt": "a cat", "guidance_scale": null}))
            .expect_err("null guidance_scale should be rejected");
        assert_eq!(err.message(), "guidance_scale must be a number");

        let err = parse_generation_request(&json!({"prompt": "a cat", "height": null}))
            .expect_err("null height should be rejected");
        assert_eq!(err.message(), "height must be a positive integer");
    }

    #[test]
    fn parse_rejects_malformed_numbers_naming_the_field() {
        let err = parse_generation_request(&json!({"prompt": "a cat", "height": "tall"}))
            .expect_err("non-numeric height should be rejected");
        assert_eq!(err.message(), "height must be a positive integer");

        let err = parse_generation_request(&json!({"prompt": "a cat", "flow_shift": []}))
            .expect_err("non-numeric flow_shift should be rejected");
        assert_eq!(err.message(), "flow_shift must be a number");

        let err = parse_generation_request(&json!({"prompt": "a cat", "seed": 1.5}))
            .expect_err("fractional seed should be rejected");
        assert_eq!(err.message(), "seed must be an integer");

        let err = parse_generation_request(&json!({"prompt": "a cat", "negative_prompt": 3}))
            .expect_err("numeric negative_prompt should be rejected");
        assert_eq!(err.message(), "negative_prompt must be a string");
    }

    #[test]
    fn artifact_file_name_caps_and_sanitizes_prompt() {
        let name = artifact_file_name("2026-01-02-03:04:05", 42, "a/cat\\on a roof");
        assert_eq!(name, "2026-01-02-03:04:05_seed42_acaton a roof.mp4");

        let long_prompt = "x".repeat(500);
        let name = artifact_file_name("2026-01-02-03:04:05", -1, &long_prompt);
        assert_eq!(
            name,
            format!("2026-01-02-03:04:05_seed-1_{}.mp4", "x".repeat(100))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_generation_writes_artifact_to_results_dir() {
        let results = tempdir().expect("tempdir");
        let executor = executor_with(
            Arc::new(MockSampler::succeeding(7)),
            results.path().to_path_buf(),
        );

        let job = executor
            .run_generation(&GenerationParams::new("a cat"))
            .await
            .expect("run generation");

        assert!(job.video_path.starts_with(results.path()));
        assert_eq!(job.seed, 7);
        assert_eq!(job.prompt, "a cat");

        let file_name = job
            .video_path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("artifact file name");
        assert!(file_name.contains("seed7"));
        assert!(file_name.ends_with("a cat.mp4"));

        let written = std::fs::read(&job.video_path).expect("read artifact");
        assert_eq!(written, b"mp4-bytes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn execute_releases_claim_on_success() {
        let results = tempdir().expect("tempdir");
        let executor = executor_with(
            Arc::new(MockSampler::succeeding(7)),
            results.path().to_path_buf(),
        );

        let ticket = claim(&executor, "u1").await;
        executor
            .execute("u1", &ticket, &GenerationParams::new("a cat"))
            .await
            .expect("execute job");

        assert_eq!(executor.admission().check("u1").await, AdmissionCheck::Clear);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn execute_releases_claim_on_failure() {
        let results = tempdir().expect("tempdir");
        let executor = executor_with(Arc::new(MockSampler::failing()), results.path().to_path_buf());

        let ticket = claim(&executor, "u1").await;
        let err = executor
            .execute("u1", &ticket, &GenerationParams::new("a cat"))
            .await
            .expect_err("job should fail");
        assert!(err.to_string().contains("sampler exploded"));

        assert_eq!(executor.admission().check("u1").await, AdmissionCheck::Clear);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engine_gate_serializes_concurrent_jobs() {
        let results = tempdir().expect("tempdir");
        let sampler = Arc::new(MockSampler::slow(Duration::from_millis(20)));
        let executor = Arc::new(executor_with(
            Arc::clone(&sampler),
            results.path().to_path_buf(),
        ));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let executor = Arc::clone(&executor);
            handles.push(tokio::spawn(async move {
                executor
                    .run_generation(&GenerationParams::new("a cat"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join task").expect("run generation");
        }

        assert_eq!(sampler.max_active.load(Ordering::SeqCst), 1);
    }
}
