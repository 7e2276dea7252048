use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use attest_core::{ReadFailurePolicy, DEFAULT_EMBEDDING_THRESHOLD};
use attest_vision::detector::DEFAULT_DETECTION_SIZE;
use attest_vision::{LivenessConfig, TaskConfig};
use serde::Deserialize;

const DEFAULT_MAX_UPLOAD_MB: u64 = 8;
const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 10;

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus {other:?} (expected session or system)")),
        }
    }
}

/// Optional TOML file named by `ATTEST_CONFIG`. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    audit_dir: Option<PathBuf>,
    embedding_threshold: Option<f32>,
    liveness_enabled: Option<bool>,
    liveness_threshold: Option<f32>,
    liveness_img_size: Option<u32>,
    liveness_real_class: Option<usize>,
    detection_size: Option<u32>,
    task_img_size: Option<u32>,
    task_min_confidence: Option<f32>,
    max_upload_mb: Option<u64>,
    verify_timeout_secs: Option<u64>,
    store_read_failure: Option<String>,
    bus: Option<String>,
}

/// Daemon configuration: defaults, then the TOML file, then `ATTEST_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX models and the task labels file.
    pub model_dir: PathBuf,
    /// Embedding store blob.
    pub db_path: PathBuf,
    /// Root for audit copies of uploads; `None` disables them.
    pub audit_dir: Option<PathBuf>,
    pub embedding_threshold: f32,
    pub liveness_enabled: bool,
    pub liveness: LivenessConfig,
    pub detection_size: u32,
    pub task: TaskConfig,
    pub max_upload_bytes: usize,
    /// Deadline for one `Verify` call.
    pub verify_timeout: Duration,
    pub store_read_failure: ReadFailurePolicy,
    pub bus: BusKind,
}

impl Config {
    pub fn load() -> Result<Self> {
        let file = match std::env::var_os("ATTEST_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_home = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            });

        let data_dir = layer(&env, "ATTEST_DATA_DIR", file.data_dir, data_home.join("attest"))?;
        let model_dir = layer(&env, "ATTEST_MODEL_DIR", file.model_dir, data_dir.join("models"))?;
        let db_path = layer(&env, "ATTEST_DB_PATH", file.db_path, data_dir.join("embeddings_db.json"))?;
        let audit_dir = layer(&env, "ATTEST_AUDIT_DIR", file.audit_dir, data_dir.join("uploads"))?;
        let audit_dir = (!audit_dir.as_os_str().is_empty()).then_some(audit_dir);

        let liveness_defaults = LivenessConfig::default();
        let task_defaults = TaskConfig::default();

        let liveness_enabled = match env("ATTEST_LIVENESS_ENABLED") {
            Some(raw) => parse_flag(&raw).with_context(|| format!("ATTEST_LIVENESS_ENABLED={raw:?}"))?,
            None => file.liveness_enabled.unwrap_or(true),
        };

        let config = Self {
            model_dir,
            db_path,
            audit_dir,
            embedding_threshold: layer(
                &env,
                "ATTEST_EMBEDDING_THRESHOLD",
                file.embedding_threshold,
                DEFAULT_EMBEDDING_THRESHOLD,
            )?,
            liveness_enabled,
            liveness: LivenessConfig {
                input_size: layer(
                    &env,
                    "ATTEST_LIVENESS_IMG_SIZE",
                    file.liveness_img_size,
                    liveness_defaults.input_size,
                )?,
                threshold: layer(
                    &env,
                    "ATTEST_LIVENESS_THRESHOLD",
                    file.liveness_threshold,
                    liveness_defaults.threshold,
                )?,
                real_class: layer(
                    &env,
                    "ATTEST_LIVENESS_REAL_CLASS",
                    file.liveness_real_class,
                    liveness_defaults.real_class,
                )?,
            },
            detection_size: layer(&env, "ATTEST_DETECTION_SIZE", file.detection_size, DEFAULT_DETECTION_SIZE)?,
            task: TaskConfig {
                input_size: layer(&env, "ATTEST_TASK_IMG_SIZE", file.task_img_size, task_defaults.input_size)?,
                min_confidence: layer(
                    &env,
                    "ATTEST_TASK_MIN_CONFIDENCE",
                    file.task_min_confidence,
                    task_defaults.min_confidence,
                )?,
            },
            max_upload_bytes: megabytes(layer(
                &env,
                "ATTEST_MAX_UPLOAD_MB",
                file.max_upload_mb,
                DEFAULT_MAX_UPLOAD_MB,
            )?)?,
            verify_timeout: Duration::from_secs(layer(
                &env,
                "ATTEST_VERIFY_TIMEOUT_SECS",
                file.verify_timeout_secs,
                DEFAULT_VERIFY_TIMEOUT_SECS,
            )?),
            store_read_failure: layer_parsed(
                &env,
                "ATTEST_STORE_READ_FAILURE",
                file.store_read_failure,
                ReadFailurePolicy::default(),
            )?,
            bus: layer_parsed(&env, "ATTEST_BUS", file.bus, BusKind::Session)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.embedding_threshold) {
            bail!("embedding_threshold {} is outside [-1, 1]", self.embedding_threshold);
        }
        if !(0.0..=1.0).contains(&self.liveness.threshold) {
            bail!("liveness_threshold {} is outside [0, 1]", self.liveness.threshold);
        }
        if !(0.0..=1.0).contains(&self.task.min_confidence) {
            bail!("task_min_confidence {} is outside [0, 1]", self.task.min_confidence);
        }
        if self.liveness.input_size == 0 || self.task.input_size == 0 {
            bail!("image sizes must be positive");
        }
        if self.verify_timeout.is_zero() {
            bail!("verify_timeout_secs must be positive");
        }
        if self.detection_size == 0 || self.detection_size % 32 != 0 {
            bail!("detection_size {} must be a positive multiple of 32", self.detection_size);
        }
        Ok(())
    }

    pub fn model_path(&self, file: &str) -> PathBuf {
        self.model_dir.join(file)
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

/// Environment value if set, else the file value, else `default`.
fn layer<T>(env: &impl Fn(&str) -> Option<String>, key: &str, file: Option<T>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env(key) {
        Some(raw) => raw.trim().parse().map_err(|e| anyhow!("{key}={raw:?}: {e}")),
        None => Ok(file.unwrap_or(default)),
    }
}

/// Like [`layer`] for settings that are strings in the file too.
fn layer_parsed<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    file: Option<String>,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env(key).or(file) {
        Some(raw) => raw.trim().parse().map_err(|e| anyhow!("{key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected true or false, got {other:?}"),
    }
}

fn megabytes(mb: u64) -> Result<usize> {
    if mb == 0 {
        bail!("max_upload_mb must be positive");
    }
    mb.checked_mul(1024 * 1024)
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or_else(|| anyhow!("max_upload_mb {mb} is too large"))
}
