use std::time::Duration;

use rand::RngCore;
use thiserror::Error;

/// Engine configuration, loaded from environment variables at startup.
///
/// Every knob has a default so the engine can run with an empty environment;
/// validation rejects values that would produce a broken session (bad port,
/// empty candidate label, sub-minute timeout).
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Candidate label used in the session directory name and metadata.
    pub candidate_name: String,
    /// Declared maximum session duration (informational; enforcement optional).
    pub session_timeout: Duration,
    /// How long after a disconnect the reconnect token stays valid.
    pub reconnect_window: Duration,
    /// Base directory under which the session directory is created.
    pub output_dir: String,
    /// Shell program spawned on the PTY.
    pub shell: String,
    /// Recorder flush period.
    pub flush_interval: Duration,
    /// Rate meter threshold in chars/sec.
    pub input_rate_limit: usize,
    /// Informational flag: the container has no outbound network.
    pub network_isolated: bool,
    /// UID/GID the shell runs under when the engine is privileged.
    /// Generated fresh at startup; see [`generate_shell_uid`].
    pub shell_uid: u32,
    /// Informational flag.
    pub enable_metrics: bool,
    /// Server log verbosity (maps onto the tracing env filter).
    pub log_level: String,
    /// Banner printed to the server log at startup.
    pub motd: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PORT must be between 1 and 65535, got {0}")]
    InvalidPort(i64),

    #[error("CANDIDATE_NAME cannot be empty")]
    EmptyCandidateName,

    #[error("SESSION_TIMEOUT must be at least 60 seconds")]
    SessionTimeoutTooShort,

    #[error("OUTPUT_DIR cannot be empty")]
    EmptyOutputDir,
}

impl Config {
    /// Load configuration from the environment with defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let port_raw = env_int("PORT", 8080);

        let cfg = Self {
            port: u16::try_from(port_raw).unwrap_or(0),
            candidate_name: env_str("CANDIDATE_NAME", "anonymous"),
            session_timeout: Duration::from_secs(env_int("SESSION_TIMEOUT", 7200).max(0) as u64),
            reconnect_window: Duration::from_secs(env_int("RECONNECT_WINDOW", 300).max(0) as u64),
            output_dir: env_str("OUTPUT_DIR", "./sessions"),
            shell: env_str("SHELL", "/bin/bash"),
            flush_interval: Duration::from_secs(env_int("FLUSH_INTERVAL", 10).max(0) as u64),
            input_rate_limit: env_int("INPUT_RATE_LIMIT", 30).max(0) as usize,
            network_isolated: env_bool("NETWORK_ISOLATED", true),
            shell_uid: generate_shell_uid(),
            enable_metrics: env_bool("ENABLE_METRICS", true),
            log_level: env_str("LOG_LEVEL", "info"),
            motd: env_str("MOTD", &default_motd()),
        };

        if !(1..=65535).contains(&port_raw) {
            return Err(ConfigError::InvalidPort(port_raw));
        }
        if cfg.candidate_name.is_empty() {
            return Err(ConfigError::EmptyCandidateName);
        }
        if cfg.session_timeout < Duration::from_secs(60) {
            return Err(ConfigError::SessionTimeoutTooShort);
        }
        if cfg.output_dir.is_empty() {
            return Err(ConfigError::EmptyOutputDir);
        }

        Ok(cfg)
    }
}

fn env_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_int(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Generate a random UID for shell isolation.
///
/// Range [10000, 60000): avoids system UIDs and gives 50k unique values, so
/// different container instances get different shell owners and cannot tamper
/// with each other's recordings. Falls back to a monotonic-time derivation if
/// the OS entropy source fails.
pub fn generate_shell_uid() -> u32 {
    let mut b = [0u8; 4];
    match rand::rngs::OsRng.try_fill_bytes(&mut b) {
        Ok(()) => 10_000 + (u32::from_be_bytes(b) % 50_000),
        Err(_) => {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos() as u64 + d.as_secs())
                .unwrap_or(0);
            10_000 + (nanos % 50_000) as u32
        }
    }
}

fn default_motd() -> String {
    "\n\
     ╔══════════════════════════════════════════════════════════════╗\n\
     ║                  SRE TECHNICAL INTERVIEW                     ║\n\
     ╚══════════════════════════════════════════════════════════════╝\n\
     \n\
     Welcome! You have been connected to an isolated interview environment.\n\
     \n\
     INSTRUCTIONS:\n\
     • Complete the tasks in /tasks/ directory\n\
     • Read /tasks/README.md for detailed instructions\n\
     • Save your solutions in ~/solutions/\n\
     • Your session is being recorded for evaluation\n\
     • Use the \"Finish\" button when you're done\n\
     \n\
     NOTES:\n\
     • Copy-paste is disabled for assessment integrity\n\
     • If you lose connection, refresh to reconnect\n\
     • All commands and keystrokes are logged\n\
     \n\
     Good luck! 🚀\n"
        .to_string()
}
