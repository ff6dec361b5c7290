use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Identity store directory (reference samples and the email directory).
    pub data_dir: PathBuf,
    /// Recognizer distance below which a face counts as recognized.
    pub recognition_threshold: f64,
    /// Minimum time between two counted attendance events per employee.
    pub cooldown: Duration,
    /// Downscale factor applied to frames before detection.
    pub frame_reduce_factor: f32,
    /// Samples captured on first registration.
    pub samples_per_user: usize,
    /// Samples captured on a photo update.
    pub update_samples: usize,
    /// Pause between two captured samples.
    pub capture_interval: Duration,
    /// Countdown ticks before capture starts (one per second).
    pub countdown_ticks: u32,
    /// Bounded wait for the pipeline thread on shutdown.
    pub shutdown_timeout: Duration,
    pub form: FormConfig,
    pub smtp: SmtpConfig,
}

/// Attendance endpoint settings.
#[derive(Clone)]
pub struct FormConfig {
    pub post_url: String,
    pub referer: String,
    pub user_agent: String,
    pub field_name: String,
    pub field_employee_id: String,
    pub field_date: String,
    pub field_time: String,
    pub timeout: Duration,
}

/// Outbound mail settings for OTP delivery.
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub sender: String,
    pub password: SecretString,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::default_model_dir());

        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("rollcall")
                    .join("known_faces")
            });

        let post_url = env_string("ROLLCALL_FORM_POST_URL", "");
        let form = FormConfig {
            referer: env_string("ROLLCALL_FORM_REFERER", &post_url),
            post_url,
            user_agent: env_string("ROLLCALL_USER_AGENT", "Mozilla/5.0 (Rollcall Attendance Bot)"),
            field_name: env_string("ROLLCALL_FORM_FIELD_NAME", "name"),
            field_employee_id: env_string("ROLLCALL_FORM_FIELD_EMP_ID", "emp_id"),
            field_date: env_string("ROLLCALL_FORM_FIELD_DATE", "date"),
            field_time: env_string("ROLLCALL_FORM_FIELD_TIME", "time"),
            timeout: Duration::from_secs(env_u64("ROLLCALL_DISPATCH_TIMEOUT_SECS", 10)),
        };

        let smtp = SmtpConfig {
            host: env_string("ROLLCALL_SMTP_HOST", "smtp.gmail.com"),
            port: env_u16("ROLLCALL_SMTP_PORT", 587),
            sender: env_string("ROLLCALL_EMAIL", ""),
            password: SecretString::from(env_string("ROLLCALL_EMAIL_PASSWORD", "")),
        };

        Self {
            camera_device: env_string("ROLLCALL_CAMERA_DEVICE", "/dev/video0"),
            model_dir,
            data_dir,
            recognition_threshold: env_f64("ROLLCALL_RECOGNITION_THRESHOLD", 60.0),
            cooldown: Duration::from_secs(env_u64("ROLLCALL_COOLDOWN_SECS", 300)),
            frame_reduce_factor: env_f32("ROLLCALL_FRAME_REDUCE_FACTOR", 0.5),
            samples_per_user: env_usize("ROLLCALL_SAMPLES_PER_USER", 10),
            update_samples: env_usize("ROLLCALL_UPDATE_SAMPLES", 5),
            capture_interval: Duration::from_millis(env_u64("ROLLCALL_CAPTURE_INTERVAL_MS", 200)),
            countdown_ticks: env_u64("ROLLCALL_COUNTDOWN_TICKS", 3) as u32,
            shutdown_timeout: Duration::from_millis(env_u64("ROLLCALL_SHUTDOWN_TIMEOUT_MS", 2000)),
            form,
            smtp,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Out-of-range values fall back to `default` instead of wrapping.
fn env_u16(key: &str, default: u16) -> u16 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, default, "not a valid u16, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
