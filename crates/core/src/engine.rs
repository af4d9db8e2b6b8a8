//! Inference engine boundary.
//!
//! Sampling itself is a black box behind [`VideoSampler`]: it consumes a
//! validated parameter set and returns encoded video bytes plus the seed it
//! actually used. The production implementation shells out to a worker
//! process that owns the model; callers must serialize access through the
//! executor's engine gate because the worker is single-flight.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::logging::WORKER_STDERR_TARGET;

pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_VIDEO_LENGTH: u32 = 129;
pub const DEFAULT_INFER_STEPS: u32 = 50;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 6.0;
pub const DEFAULT_FLOW_SHIFT: f64 = 7.0;

/// Validated parameter set for one sampling job.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub height: u32,
    pub width: u32,
    pub video_length: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub flow_shift: f64,
    pub seed: Option<i64>,
    pub negative_prompt: Option<String>,
    pub embedded_guidance_scale: Option<f64>,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            height: DEFAULT_HEIGHT,
            width: DEFAULT_WIDTH,
            video_length: DEFAULT_VIDEO_LENGTH,
            num_inference_steps: DEFAULT_INFER_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            flow_shift: DEFAULT_FLOW_SHIFT,
            seed: None,
            negative_prompt: None,
            embedded_guidance_scale: None,
        }
    }
}

/// One finished sampling job: encoded MP4 bytes, the seed the engine chose
/// (echoing the caller's seed when one was supplied), and the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleOutput {
    pub video: Vec<u8>,
    pub seed: i64,
    pub prompt: String,
}

/// Black-box sampling engine. `generate` blocks for the full inference run.
pub trait VideoSampler: Send + Sync {
    fn generate(&self, params: &GenerationParams) -> Result<SampleOutput>;

    /// Whether the model weights are present and usable.
    fn is_loaded(&self) -> bool;
}

/// Sampler backed by a worker subprocess. The worker loads the model from
/// `--model-base`, writes the encoded video to `--output`, streams progress
/// on stderr, and reports the chosen seed as a JSON line on stdout.
#[derive(Debug)]
pub struct WorkerSampler {
    worker_command: String,
    model_base: PathBuf,
}

#[derive(Debug, Deserialize)]
struct WorkerReport {
    seed: i64,
}

impl WorkerSampler {
    /// Fails when the model directory is absent. Called once at startup so
    /// a misconfigured model path is fatal there, not per request.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        if !config.model_base.is_dir() {
            bail!(
                "model base directory not found: {}",
                config.model_base.display()
            );
        }

        Ok(Self {
            worker_command: config.worker_command.clone(),
            model_base: config.model_base.clone(),
        })
    }

    fn build_worker_args(&self, params: &GenerationParams, output_path: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--model-base".into(),
            self.model_base.to_string_lossy().into_owned(),
            "--prompt".into(),
            params.prompt.clone(),
            "--height".into(),
            params.height.to_string(),
            "--width".into(),
            params.width.to_string(),
            "--video-length".into(),
            params.video_length.to_string(),
            "--infer-steps".into(),
            params.num_inference_steps.to_string(),
            "--guidance-scale".into(),
            params.guidance_scale.to_string(),
            "--flow-shift".into(),
            params.flow_shift.to_string(),
        ];

        if let Some(seed) = params.seed {
            args.extend(["--seed".into(), seed.to_string()]);
        }
        if let Some(ref negative_prompt) = params.negative_prompt {
            args.extend(["--negative-prompt".into(), negative_prompt.clone()]);
        }
        if let Some(scale) = params.embedded_guidance_scale {
            args.extend(["--embedded-guidance-scale".into(), scale.to_string()]);
        }

        args.extend(["--output".into(), output_path.to_string_lossy().into_owned()]);
        args
    }
}

impl VideoSampler for WorkerSampler {
    fn generate(&self, params: &GenerationParams) -> Result<SampleOutput> {
        let output_path =
            std::env::temp_dir().join(format!("genvid-sample-{}.mp4", uuid::Uuid::new_v4()));
        let args = self.build_worker_args(params, &output_path);

        debug!(
            cmd = %format!("{} {}", self.worker_command, args.join(" ")),
            "launching sampler worker"
        );

        let mut child = Command::new(&self.worker_command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to launch sampler worker '{}' (is it installed?)",
                    self.worker_command
                )
            })?;

        let stderr = child.stderr.take().expect("stderr should be piped");
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: WORKER_STDERR_TARGET, "{}", line);
                    }
                    Err(e) => {
                        debug!(target: WORKER_STDERR_TARGET, "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        let run = child
            .wait_with_output()
            .context("failed to wait for sampler worker");
        let _ = stderr_thread.join();
        let output = run?;

        if !output.status.success() {
            let _ = fs::remove_file(&output_path);
            bail!("sampler worker exited with status {}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report_line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .context("sampler worker produced no completion report")?;
        let report: WorkerReport = serde_json::from_str(report_line.trim())
            .context("failed to parse sampler worker completion report")?;

        let video = fs::read(&output_path).with_context(|| {
            format!(
                "sampler worker wrote no video at {}",
                output_path.display()
            )
        })?;
        let _ = fs::remove_file(&output_path);

        debug!(
            seed = report.seed,
            video_bytes = video.len(),
            "sampler worker finished"
        );

        Ok(SampleOutput {
            video,
            seed: report.seed,
            prompt: params.prompt.clone(),
        })
    }

    fn is_loaded(&self) -> bool {
        self.model_base.is_dir()
    }
}
