//! Allows configuration stuff to be read from settings.json
//!
//! Each executable hands [`Config::build`] its own table of defaults.  Values
//! present in the file win over the defaults.  The typed settings structs
//! ([`ServerSettings`], [`ClientSettings`]) are what the rest of the crate
//! consumes.
use json::JsonValue;
use log::{info, warn};
use regex::Regex;
use std::{error::Error, fmt, io::ErrorKind, time::Duration};

#[derive(Debug)]
pub enum ConfigError {
    Missing { key: String },
    Invalid { key: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Missing { key } => {
                write!(f, "Required configuration value '{}' is missing", key)
            }
            ConfigError::Invalid { key, reason } => {
                write!(f, "Configuration value '{}' is invalid: {}", key, reason)
            }
        }
    }
}

impl Error for ConfigError {}

pub struct Config {
    filename: String,
    settings: JsonValue,
    defaults: JsonValue,
}

impl Config {
    pub fn build(filename: &str, defaults: JsonValue) -> Result<Config, std::io::Error> {
        let filename_ok = Regex::new(r"^[a-zA-Z0-9_\-\./]+\.json$")
            .map(|re| re.is_match(filename))
            .unwrap_or(false);
        if !filename_ok {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Invalid filename '{}' - must contain only letters, numbers, underscore, dash, dot, slash and end in .json",
                    filename
                ),
            ));
        }

        let mut config = Config {
            filename: filename.to_string(),
            settings: json::object! {},
            defaults,
        };
        if let Err(err) = config.load_from_file() {
            warn!("Using default settings: {}", err);
        }
        Ok(config)
    }

    fn load_from_file(&mut self) -> std::io::Result<()> {
        let raw_data = std::fs::read_to_string(&self.filename)?;
        match json::parse(&raw_data) {
            Ok(parsed) => {
                self.settings = parsed;
                info!("Loaded settings from {}: {}", self.filename, self.settings.dump());
            }
            Err(err) => {
                warn!("Failed to parse config file {}: {}", self.filename, err);
            }
        }
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<&JsonValue, ConfigError> {
        if !self.settings[key].is_null() {
            return Ok(&self.settings[key]);
        }
        if !self.defaults[key].is_null() {
            return Ok(&self.defaults[key]);
        }
        Err(ConfigError::Missing {
            key: key.to_string(),
        })
    }

    fn invalid(key: &str, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn get_str_value(&self, key: &str) -> Result<String, ConfigError> {
        self.lookup(key)?
            .as_str()
            .map(String::from)
            .ok_or_else(|| Self::invalid(key, "expected a string"))
    }

    pub fn get_u64_value(&self, key: &str) -> Result<u64, ConfigError> {
        self.lookup(key)?
            .as_u64()
            .ok_or_else(|| Self::invalid(key, "expected a non-negative integer"))
    }

    /// A non-negative integer that must fit in `T`.
    fn get_sized_value<T: TryFrom<u64>>(&self, key: &str) -> Result<T, ConfigError> {
        let val = self.get_u64_value(key)?;
        T::try_from(val).map_err(|_| Self::invalid(key, &format!("{} is out of range", val)))
    }

    pub fn get_u32_value(&self, key: &str) -> Result<u32, ConfigError> {
        self.get_sized_value(key)
    }

    pub fn get_usize_value(&self, key: &str) -> Result<usize, ConfigError> {
        self.get_sized_value(key)
    }

    pub fn set_value(&mut self, key: &str, val: impl Into<JsonValue>) -> Result<(), String> {
        let json_val = val.into();
        match json_val {
            JsonValue::Short(_)
            | JsonValue::String(_)
            | JsonValue::Boolean(_)
            | JsonValue::Number(_) => {
                self.settings[key] = json_val;
                Ok(())
            }
            _ => Err(format!("Unsupported value type for key: {}", key)),
        }
    }

    pub fn get_filename(&self) -> &str {
        &self.filename
    }
}

/// Everything the authority needs to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub max_members: usize,
    pub code_length: usize,
    pub code_alphabet: String,
    pub min_bpm: u32,
    pub max_bpm: u32,
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
}

impl ServerSettings {
    pub fn defaults() -> JsonValue {
        json::object! {
            "listen_addr": "0.0.0.0:3001",
            "max_members": 50,
            "code_length": 6,
            "code_alphabet": "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
            "min_bpm": 30,
            "max_bpm": 300,
            "sweep_interval_ms": 300_000,
            "idle_timeout_ms": 1_800_000
        }
    }

    pub fn from_config(config: &Config) -> Result<ServerSettings, ConfigError> {
        let settings = ServerSettings {
            listen_addr: config.get_str_value("listen_addr")?,
            max_members: config.get_usize_value("max_members")?,
            code_length: config.get_usize_value("code_length")?,
            code_alphabet: config.get_str_value("code_alphabet")?,
            min_bpm: config.get_u32_value("min_bpm")?,
            max_bpm: config.get_u32_value("max_bpm")?,
            sweep_interval: Duration::from_millis(config.get_u64_value("sweep_interval_ms")?),
            idle_timeout: Duration::from_millis(config.get_u64_value("idle_timeout_ms")?),
        };
        if settings.code_length == 0 || settings.code_alphabet.is_empty() {
            return Err(Config::invalid("code_length", "session codes cannot be empty"));
        }
        if settings.max_members == 0 {
            return Err(Config::invalid("max_members", "must be at least 1"));
        }
        if settings.min_bpm == 0 || settings.min_bpm > settings.max_bpm {
            return Err(Config::invalid("min_bpm", "must be positive and not above max_bpm"));
        }
        Ok(settings)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            listen_addr: "0.0.0.0:3001".to_string(),
            max_members: 50,
            code_length: 6,
            code_alphabet: "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_string(),
            min_bpm: 30,
            max_bpm: 300,
            sweep_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

/// Everything a metronome client needs to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub sync_interval: Duration,
    pub lookahead: Duration,
    pub schedule_ahead: Duration,
    pub manual_trim_ms: f64,
}

impl ClientSettings {
    pub fn defaults() -> JsonValue {
        json::object! {
            "server_url": "ws://localhost:3001",
            "sync_interval_ms": 2000,
            "lookahead_ms": 25,
            "schedule_ahead_ms": 100,
            "manual_trim_ms": 0
        }
    }

    pub fn from_config(config: &Config) -> Result<ClientSettings, ConfigError> {
        let server_url = config.get_str_value("server_url")?;
        if let Err(e) = url::Url::parse(&server_url) {
            return Err(Config::invalid("server_url", &e.to_string()));
        }
        let trim = config
            .lookup("manual_trim_ms")?
            .as_f64()
            .ok_or_else(|| Config::invalid("manual_trim_ms", "expected a number"))?;
        Ok(ClientSettings {
            server_url,
            sync_interval: Duration::from_millis(config.get_u64_value("sync_interval_ms")?),
            lookahead: Duration::from_millis(config.get_u64_value("lookahead_ms")?),
            schedule_ahead: Duration::from_millis(config.get_u64_value("schedule_ahead_ms")?),
            manual_trim_ms: trim,
        })
    }
}
