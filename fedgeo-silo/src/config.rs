use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use fedgeo_core::SiloId;
use fedgeo_crypto::PayloadKey;
use fedgeo_grid::GridConfig;
use fedgeo_networking::{NetworkingConfig, DEFAULT_SILO_ADDRESS};
use fedgeo_silo::SiloOptions;
use fedgeo_telemetry::TelemetryConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub silo: SiloSection,
    pub grid: GridConfig,
    #[serde(default)]
    pub networking: NetworkingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SiloSection {
    pub id: SiloId,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Record file (`count` line, then `id x y` lines).
    pub data_path: PathBuf,
    /// Serve `GetEncryptionKey` and the sealed release path.
    #[serde(default)]
    pub encryption: bool,
    /// Hex seed the payload key is derived from; random per process if unset.
    #[serde(default)]
    pub key_seed: Option<String>,
    /// Hex 32-byte seed for count noise and shuffles; random if unset.
    #[serde(default)]
    pub noise_seed: Option<String>,
    #[serde(default = "default_max_open_sessions")]
    pub max_open_sessions: usize,
}

fn default_listen() -> String {
    DEFAULT_SILO_ADDRESS.to_owned()
}

const fn default_max_open_sessions() -> usize {
    1024
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.grid.validate().map_err(ConfigError::Validation)?;
        self.networking.validate().map_err(ConfigError::Validation)?;
        if self.silo.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen address must be set".into()));
        }
        if self.silo.max_open_sessions == 0 {
            return Err(ConfigError::Validation(
                "max open sessions must be greater than zero".into(),
            ));
        }
        if self.silo.key_seed.is_some() && !self.silo.encryption {
            return Err(ConfigError::Validation(
                "key seed given but encryption is disabled".into(),
            ));
        }
        self.noise_seed()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn sample() -> Self {
        Self {
            silo: SiloSection {
                id: 0,
                listen: default_listen(),
                data_path: PathBuf::from("data/silo-0.txt"),
                encryption: false,
                key_seed: None,
                noise_seed: None,
                max_open_sessions: default_max_open_sessions(),
            },
            grid: GridConfig::sample(),
            networking: NetworkingConfig::sample(),
            telemetry: TelemetryConfig::sample("silo"),
        }
    }

    fn noise_seed(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(encoded) = &self.silo.noise_seed else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded)
            .map_err(|err| ConfigError::Validation(format!("noise seed is not hex: {err}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            ConfigError::Validation(format!("noise seed must be 32 bytes (got {})", bytes.len()))
        })?;
        Ok(Some(seed))
    }

    pub fn silo_options(&self) -> Result<SiloOptions, ConfigError> {
        let mut options = SiloOptions::new(self.silo.id, self.grid.clone());
        options.seed = self.noise_seed()?;
        options.max_open_sessions = self.silo.max_open_sessions;
        if self.silo.encryption {
            let key = match &self.silo.key_seed {
                Some(seed) => {
                    let seed = hex::decode(seed).map_err(|err| {
                        ConfigError::Validation(format!("key seed is not hex: {err}"))
                    })?;
                    PayloadKey::derive(&seed, &format!("silo-{}", self.silo.id))
                        .map_err(|err| ConfigError::Validation(err.to_string()))?
                }
                None => PayloadKey::generate(),
            };
            options.encryption = Some(key);
        }
        Ok(options)
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format,
                details: err.to_string(),
            })
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_is_valid() {
        Config::sample().validate().unwrap();
    }

    #[test]
    fn parses_toml_with_defaults() {
        let config = parse_config(
            r#"
            [silo]
            id = 2
            data-path = "data/silo-2.txt"
            encryption = true
            key-seed = "00112233"

            [grid]
            k = 16
            epsilon = 0.5
            "#,
            ConfigFormat::Toml,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.silo.listen, DEFAULT_SILO_ADDRESS);
        assert_eq!(config.grid.noise_cap, 100);
        let options = config.silo_options().unwrap();
        assert!(options.encryption.is_some());
        assert_eq!(options.grid.k, 16);
    }

    #[test]
    fn parses_yaml() {
        let config = parse_config(
            "silo:\n  id: 1\n  data-path: d.txt\ngrid:\n  epsilon: 2.0\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.grid.k, 10);
        assert_eq!(config.silo.id, 1);
    }

    #[test]
    fn rejects_short_noise_seed() {
        let mut config = Config::sample();
        config.silo.noise_seed = Some("abcd".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(reason)) if reason.contains("32 bytes")
        ));
    }

    #[test]
    fn rejects_non_positive_epsilon() {
        let mut config = Config::sample();
        config.grid.epsilon = 0.0;
        assert!(config.validate().is_err());
    }
}
