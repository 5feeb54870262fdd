use std::{path::PathBuf, time::Duration};

const DEFAULT_PORT: u16 = 6500;
const DEFAULT_PORT_ATTEMPTS: u16 = 10;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_PROBE_INTERVAL_MS: u64 = 30_000;
const DEFAULT_LOG_FILE: &str = "SysBotLog.txt";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub preferred_port: u16,
    pub port_attempts: u16,
    pub stop_timeout: Duration,
    pub probe_timeout: Duration,
    /// `None` disables the periodic poller; `/api/instances/check` still works.
    pub probe_interval: Option<Duration>,
    pub instance_host: String,
    pub instance_name: Option<String>,
    pub log_dir: PathBuf,
    pub log_file: String,
    pub skip_console_bot_creation: bool,
    pub bots: Vec<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            preferred_port: DEFAULT_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            probe_interval: Some(Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS)),
            instance_host: "localhost".to_string(),
            instance_name: None,
            log_dir: PathBuf::from("logs"),
            log_file: DEFAULT_LOG_FILE.to_string(),
            skip_console_bot_creation: false,
            bots: Vec::new(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_flag(name: &str) -> bool {
    env_string(name).is_some_and(|v| parse_truthy(&v))
}

fn parse_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    out.dedup();
    out
}

impl ControlConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let preferred_port = env_u64("BOTGATE_PORT")
            .map(|v| v.clamp(1, u16::MAX as u64) as u16)
            .unwrap_or(defaults.preferred_port);
        let port_attempts = env_u64("BOTGATE_PORT_ATTEMPTS")
            .map(|v| v.clamp(1, 1000) as u16)
            .unwrap_or(defaults.port_attempts);
        let stop_timeout = env_u64("BOTGATE_STOP_TIMEOUT_MS")
            .map(|v| Duration::from_millis(v.clamp(100, 60_000)))
            .unwrap_or(defaults.stop_timeout);
        let probe_timeout = env_u64("BOTGATE_PROBE_TIMEOUT_MS")
            .map(|v| Duration::from_millis(v.clamp(100, 60_000)))
            .unwrap_or(defaults.probe_timeout);
        let probe_interval = match env_u64("BOTGATE_PROBE_INTERVAL_MS") {
            Some(0) => None,
            Some(v) => Some(Duration::from_millis(v.clamp(1000, 60 * 60 * 1000))),
            None => defaults.probe_interval,
        };

        Self {
            preferred_port,
            port_attempts,
            stop_timeout,
            probe_timeout,
            probe_interval,
            instance_host: env_string("BOTGATE_INSTANCE_HOST").unwrap_or(defaults.instance_host),
            instance_name: env_string("BOTGATE_INSTANCE_NAME"),
            log_dir: env_string("BOTGATE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            log_file: env_string("BOTGATE_LOG_FILE").unwrap_or(defaults.log_file),
            skip_console_bot_creation: env_flag("BOTGATE_SKIP_CONSOLE_BOT_CREATION"),
            bots: env_string("BOTGATE_BOTS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(&self.log_file)
    }

    /// Registry name for this instance once its port is known.
    pub fn instance_name_for(&self, port: u16) -> String {
        self.instance_name
            .clone()
            .unwrap_or_else(|| format!("Bot on port {port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ControlConfig::default();
        assert_eq!(cfg.preferred_port, 6500);
        assert_eq!(cfg.port_attempts, 10);
        assert_eq!(cfg.stop_timeout, Duration::from_secs(5));
        assert_eq!(cfg.log_path(), PathBuf::from("logs").join("SysBotLog.txt"));
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_truthy(v), "{v}");
        }
        for v in ["0", "false", "", "nope"] {
            assert!(!parse_truthy(v), "{v}");
        }
    }

    #[test]
    fn list_skips_blanks() {
        assert_eq!(parse_list("a, b,,c ,"), vec!["a", "b", "c"]);
    }

    #[test]
    fn instance_name_falls_back_to_port() {
        let mut cfg = ControlConfig::default();
        assert_eq!(cfg.instance_name_for(6501), "Bot on port 6501");
        cfg.instance_name = Some("raid-1".into());
        assert_eq!(cfg.instance_name_for(6501), "raid-1");
    }
}
