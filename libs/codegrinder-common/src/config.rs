// Site configuration, loaded from a JSON file shared by both roles.
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Public hostname of this process, e.g. "grader.example.edu".
    pub hostname: String,
    /// Shared HMAC secret, base64 encoded in the file:
    /// `head -c 32 /dev/urandom | base64`
    pub daycare_secret: String,
    /// Address the HTTP server binds, e.g. "0.0.0.0:8080".
    pub listen_addr: String,
    /// Redis connection string for the TA's commit store.
    pub redis_url: String,

    // daycare-only fields
    /// Hostname of the TA to register with. Defaults to `hostname`.
    pub ta_hostname: String,
    /// Relative capacity weight of this daycare for routing.
    pub capacity: u32,
    /// Problem types this daycare serves.
    pub problem_types: Vec<String>,
    /// Path to the problem-type table. Defaults to config/problem_types.json.
    pub problem_types_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hostname: String::new(),
            daycare_secret: String::new(),
            listen_addr: "0.0.0.0:8080".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ta_hostname: String::new(),
            capacity: 1,
            problem_types: Vec::new(),
            problem_types_file: "config/problem_types.json".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("config file not found: {}", path.display());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        if config.hostname.is_empty() {
            bail!("cannot run with no hostname in the config file");
        }
        if config.daycare_secret.is_empty() {
            bail!("cannot run with no daycareSecret in the config file");
        }
        if config.ta_hostname.is_empty() {
            config.ta_hostname = config.hostname.clone();
        }
        Ok(config)
    }

    /// Extra fields the daycare role requires.
    pub fn validate_daycare(&self) -> Result<()> {
        if self.problem_types.is_empty() {
            bail!("cannot run the daycare role with no problemTypes in the config file");
        }
        if self.capacity == 0 {
            bail!("daycare capacity must be greater than zero");
        }
        Ok(())
    }

    /// The decoded HMAC secret. The config value is normally base64; a value
    /// that does not decode is used as-is.
    pub fn secret(&self) -> Vec<u8> {
        match STANDARD.decode(&self.daycare_secret) {
            Ok(raw) => raw,
            Err(_) => self.daycare_secret.clone().into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.capacity, 1);
        assert_eq!(config.problem_types_file, "config/problem_types.json");
    }

    #[test]
    fn test_secret_decodes_base64() {
        let config = Config {
            daycare_secret: "c2VjcmV0IGJ5dGVz".to_string(), // "secret bytes"
            ..Config::default()
        };
        assert_eq!(config.secret(), b"secret bytes");
    }

    #[test]
    fn test_secret_falls_back_to_raw() {
        let config = Config {
            daycare_secret: "not!base64!!".to_string(),
            ..Config::default()
        };
        assert_eq!(config.secret(), b"not!base64!!");
    }

    #[test]
    fn test_daycare_validation() {
        let mut config = Config {
            hostname: "day1.example.com".to_string(),
            daycare_secret: "x".to_string(),
            ..Config::default()
        };
        assert!(config.validate_daycare().is_err());

        config.problem_types = vec!["python3unittest".to_string()];
        assert!(config.validate_daycare().is_ok());

        config.capacity = 0;
        assert!(config.validate_daycare().is_err());
    }
}
