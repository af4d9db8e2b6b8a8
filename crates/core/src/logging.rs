use std::{fs, path::PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "worker_stderr=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "genvid";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Tracing target for sampler worker stderr lines. Quieted on the console by
/// the default noise filter, kept at debug in the log file.
pub const WORKER_STDERR_TARGET: &str = "worker_stderr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn retention_files(&self) -> usize {
        match self {
            Self::Ready(plan) => plan.retention_files,
            Self::Fallback(plan) => plan.retention_files,
        }
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready(plan) => Some(&plan.log_dir),
            Self::Fallback(plan) => plan.attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = normalize_retention_files(options.retention_files);

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            retention_files,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        });
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender_builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match appender_builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let should_include_noise = options.include_noise_filter_when_implicit
        && options.cli_log_filter.is_none()
        && options.verbose == 0;

    let console_filter = merge_noise_filter(
        options.noise_filter.as_str(),
        user_filter.as_str(),
        should_include_noise,
    );
    let file_filter = if should_include_noise {
        let file_noise_filter = rewrite_noise_filter_for_file(options.noise_filter.as_str());
        merge_noise_filter(file_noise_filter.as_str(), user_filter.as_str(), true)
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        file_filter,
        console_filter,
    }
}

pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    compose_logging_filters(options).console_filter
}

fn normalize_retention_files(retention_files: usize) -> usize {
    if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include_noise_filter: bool) -> String {
    if include_noise_filter && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

/// The log file keeps worker stderr at debug even when the console quiets it.
fn rewrite_noise_filter_for_file(noise_filter: &str) -> String {
    let mut rewritten_directives = Vec::new();
    let mut worker_target_seen = false;

    for directive in noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
    {
        if let Some((target, _)) = directive.split_once('=') {
            if target.trim() == WORKER_STDERR_TARGET {
                if !worker_target_seen {
                    rewritten_directives.push(format!("{WORKER_STDERR_TARGET}=debug"));
                    worker_target_seen = true;
                }
                continue;
            }
        }

        rewritten_directives.push(directive.to_string());
    }

    if !worker_target_seen {
        rewritten_directives.push(format!("{WORKER_STDERR_TARGET}=debug"));
    }

    rewritten_directives.join(",")
}
