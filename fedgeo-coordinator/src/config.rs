use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use fedgeo_coordinator::ProtocolConfig;
use fedgeo_core::{load_addresses, SiloId};
use fedgeo_networking::NetworkingConfig;
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
    pub coordinator: CoordinatorSection,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub networking: NetworkingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoordinatorSection {
    /// Query file (`count` line, then `kind x y r` or `kind x y dx dy`).
    pub query_path: PathBuf,
    #[serde(default)]
    pub silos: Vec<SiloEndpoint>,
    /// Address file; silo ids follow line order starting at 0.
    #[serde(default)]
    pub silo_file: Option<PathBuf>,
    /// Hex 32-byte master seed for query noise; random if unset.
    #[serde(default)]
    pub seed: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SiloEndpoint {
    pub id: SiloId,
    pub address: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate().map_err(ConfigError::Validation)?;
        self.networking.validate().map_err(ConfigError::Validation)?;
        if self.coordinator.silos.is_empty() && self.coordinator.silo_file.is_none() {
            return Err(ConfigError::Validation(
                "no silos configured: set `silos` or `silo-file`".into(),
            ));
        }
        if self.coordinator.silos.iter().any(|s| s.address.trim().is_empty()) {
            return Err(ConfigError::Validation("silo address must be set".into()));
        }
        self.seed()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn sample() -> Self {
        Self {
            coordinator: CoordinatorSection {
                query_path: PathBuf::from("data/queries.txt"),
                silos: vec![
                    SiloEndpoint {
                        id: 0,
                        address: "127.0.0.1:50051".into(),
                    },
                    SiloEndpoint {
                        id: 1,
                        address: "127.0.0.1:50052".into(),
                    },
                ],
                silo_file: None,
                seed: None,
            },
            protocol: ProtocolConfig::sample(),
            networking: NetworkingConfig::sample(),
            telemetry: TelemetryConfig::sample("coordinator"),
        }
    }

    pub fn seed(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(encoded) = &self.coordinator.seed else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded)
            .map_err(|err| ConfigError::Validation(format!("seed is not hex: {err}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            ConfigError::Validation(format!("seed must be 32 bytes (got {})", bytes.len()))
        })?;
        Ok(Some(seed))
    }

    /// Explicit endpoints followed by those listed in the address file.
    pub fn endpoints(&self) -> Result<Vec<SiloEndpoint>, ConfigError> {
        let mut endpoints = self.coordinator.silos.clone();
        if let Some(path) = &self.coordinator.silo_file {
            let addresses =
                load_addresses(path).map_err(|err| ConfigError::Validation(err.to_string()))?;
            endpoints.extend(
                addresses
                    .into_iter()
                    .enumerate()
                    .map(|(id, address)| SiloEndpoint {
                        id: id as SiloId,
                        address,
                    }),
            );
        }
        if endpoints.is_empty() {
            return Err(ConfigError::Validation("silo list is empty".into()));
        }
        Ok(endpoints)
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
    use fedgeo_coordinator::{QueryMode, SpatialMechanism};
    use fedgeo_dp::BoundedSearch;

    #[test]
    fn sample_config_is_valid() {
        Config::sample().validate().unwrap();
    }

    #[test]
    fn parses_toml_with_bounded_mechanism() {
        let config = parse_config(
            r#"
            [coordinator]
            query-path = "q.txt"
            seed = "0101010101010101010101010101010101010101010101010101010101010101"

            [[coordinator.silos]]
            id = 0
            address = "10.0.0.1:50051"

            [protocol]
            epsilon-spatial = 0.25
            mode = "baseline"

            [protocol.mechanism]
            kind = "bounded"
            delta = 0.01
            "#,
            ConfigFormat::Toml,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.protocol.mode, QueryMode::Baseline);
        assert_eq!(
            config.protocol.mechanism,
            SpatialMechanism::Bounded {
                delta: 0.01,
                search: BoundedSearch::default()
            }
        );
        assert_eq!(config.seed().unwrap(), Some([1u8; 32]));
        assert_eq!(config.endpoints().unwrap().len(), 1);
    }

    #[test]
    fn parses_yaml_twice_laplace() {
        let config = parse_config(
            "coordinator:\n  query-path: q.txt\n  silos:\n    - id: 3\n      address: a:1\nprotocol:\n  epsilon-spatial: 1.0\n  mechanism:\n    kind: twice-laplace\n    sensitivity-x: 2.0\n    sensitivity-y: 3.0\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert!(matches!(
            config.protocol.mechanism,
            SpatialMechanism::TwiceLaplace { sensitivity_x, .. } if sensitivity_x == 2.0
        ));
        assert!(!config.protocol.encrypt_records);
    }

    #[test]
    fn requires_silos() {
        let mut config = Config::sample();
        config.coordinator.silos.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(reason)) if reason.contains("no silos")
        ));
    }

    #[test]
    fn rejects_zero_spatial_epsilon() {
        let mut config = Config::sample();
        config.protocol.epsilon_spatial = 0.0;
        assert!(config.validate().is_err());
    }
}
