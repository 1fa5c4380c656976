//! Session configuration read from `config.json` plus environment overrides.

use std::path::PathBuf;
use std::sync::Mutex;

use octamaze::{ConfigError, ConfigSource, SessionConfig};
use tracing::{info, warn};

const ENV_OVERRIDES: [&str; 6] = [
    "OCTAMAZE_TICK_MS",
    "OCTAMAZE_MAZE_SIZE",
    "OCTAMAZE_EXPLORATION_STEPS",
    "OCTAMAZE_SOLVING_STEPS",
    "OCTAMAZE_IDLE_TICKS",
    "OCTAMAZE_SEED",
];

/// Re-read on every session (re)start. A file that fails to load leaves the
/// last good configuration in place.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    last_good: Mutex<SessionConfig>,
}

impl ConfigFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_good: Mutex::new(SessionConfig::default()),
        }
    }

    /// A missing file is not an error: defaults apply.
    pub fn load(&self) -> Result<SessionConfig, ConfigError> {
        let mut cfg = match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionConfig::default(),
            Err(e) => return Err(e.into()),
        };
        apply_env(&mut cfg, |key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn reload(&self) -> SessionConfig {
        let mut last_good = self.last_good.lock().unwrap_or_else(|e| e.into_inner());
        match self.load() {
            Ok(cfg) => {
                info!(path = ?self.path, "session config loaded");
                *last_good = cfg;
            }
            Err(e) => warn!(path = ?self.path, "keeping last good config: {}", e),
        }
        last_good.clone()
    }
}

impl ConfigSource for ConfigFile {
    fn session_config(&self) -> SessionConfig {
        self.reload()
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse {raw:?}")))
}

pub fn apply_env(
    cfg: &mut SessionConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    for key in ENV_OVERRIDES {
        let Some(raw) = lookup(key) else {
            continue;
        };
        match key {
            "OCTAMAZE_TICK_MS" => cfg.tick_interval_ms = parse(key, &raw)?,
            "OCTAMAZE_MAZE_SIZE" => cfg.set_maze_size(parse(key, &raw)?),
            "OCTAMAZE_EXPLORATION_STEPS" => cfg.max_exploration_steps = parse(key, &raw)?,
            "OCTAMAZE_SOLVING_STEPS" => cfg.max_solving_steps = parse(key, &raw)?,
            "OCTAMAZE_IDLE_TICKS" => cfg.max_idle_ticks = parse(key, &raw)?,
            "OCTAMAZE_SEED" => cfg.seed = Some(parse(key, &raw)?),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("octamazed-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("config.json")
    }

    #[test]
    fn env_overrides_apply_on_top_of_file_values() {
        let vars: HashMap<&str, &str> = [("OCTAMAZE_MAZE_SIZE", "21"), ("OCTAMAZE_SEED", " 9 ")]
            .into_iter()
            .collect();
        let mut cfg = SessionConfig::default();
        apply_env(&mut cfg, |k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!((cfg.maze_width, cfg.maze_height), (21, 21));
        assert_eq!(cfg.seed, Some(9));
        assert_eq!(cfg.tick_interval_ms, 1000);

        let err = apply_env(&mut cfg, |k| (k == "OCTAMAZE_TICK_MS").then(|| "fast".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("OCTAMAZE_TICK_MS"));
    }

    #[test]
    fn missing_file_means_defaults() {
        let file = ConfigFile::new(scratch("missing").with_file_name("absent.json"));
        let cfg = file.load().unwrap();
        assert_eq!(cfg.maze_width, SessionConfig::default().maze_width);
    }

    #[test]
    fn bad_file_keeps_last_good_config() {
        let path = scratch("reload");
        std::fs::write(&path, r#"{"maze_size": 15, "max_solving_steps": 7}"#).unwrap();
        let file = ConfigFile::new(path.clone());
        let good = file.reload();
        assert_eq!(good.maze_width, 15);
        assert_eq!(good.max_solving_steps, 7);

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(file.reload(), good);

        std::fs::write(&path, r#"{"maze_size": 3}"#).unwrap();
        assert!(matches!(file.load(), Err(ConfigError::Invalid(_))));
        assert_eq!(file.session_config(), good);
    }
}
