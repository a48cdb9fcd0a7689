use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{chain::ChainType, error::ConfigError, sender::GAS_FACTOR_LIMIT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "main_chain_default")]
    pub main_chain: ChainConfig,
    #[serde(default = "side_chain_default")]
    pub side_chain: ChainConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            main_chain: main_chain_default(),
            side_chain: side_chain_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Seconds between event scans of each chain.
    #[serde(default = "queue_period_default")]
    pub queue_period: u64,
    /// Seconds between bridge discovery passes.
    #[serde(default = "bridge_period_default")]
    pub bridge_listener_queue_period: u64,
    /// Seconds between checks for bridge creation requests.
    #[serde(default = "bridge_period_default")]
    pub bridge_creation_queue_period: u64,
    /// Default log filter when `RUST_LOG` is not set.
    #[serde(default = "logging_level_default")]
    pub logging_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Where attestation progress is persisted.
    #[serde(default = "state_file_default")]
    pub state_file: PathBuf,
    /// Seconds between saves of the state file.
    #[serde(default = "state_save_period_default")]
    pub state_save_period: u64,
    #[serde(default)]
    pub dynamic_bridge_creation: bool,
    #[serde(default)]
    pub sequencer_url: String,
    #[serde(default)]
    pub min_bridge_signature_reward: u64,
    #[serde(default)]
    pub max_bridge_signature_reward: u64,
    /// Attempts per bridge creation request before it is abandoned.
    #[serde(default = "max_create_bridge_iterations_default")]
    pub max_create_bridge_iterations: u32,
    /// The base address of the OTLP collector. If not set, metrics will not be exported.
    #[serde(default)]
    pub otlp_collector_endpoint: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            queue_period: queue_period_default(),
            bridge_listener_queue_period: bridge_period_default(),
            bridge_creation_queue_period: bridge_period_default(),
            logging_level: logging_level_default(),
            log_format: LogFormat::default(),
            state_file: state_file_default(),
            state_save_period: state_save_period_default(),
            dynamic_bridge_creation: false,
            sequencer_url: String::new(),
            min_bridge_signature_reward: 0,
            max_bridge_signature_reward: 0,
            max_create_bridge_iterations: max_create_bridge_iterations_default(),
            otlp_collector_endpoint: None,
        }
    }
}

impl ServerConfig {
    pub fn queue_period(&self) -> Duration {
        Duration::from_secs(self.queue_period)
    }

    pub fn bridge_listener_queue_period(&self) -> Duration {
        Duration::from_secs(self.bridge_listener_queue_period)
    }

    pub fn bridge_creation_queue_period(&self) -> Duration {
        Duration::from_secs(self.bridge_creation_queue_period)
    }

    pub fn state_save_period(&self) -> Duration {
        Duration::from_secs(self.state_save_period)
    }
}

pub fn queue_period_default() -> u64 {
    5
}

pub fn bridge_period_default() -> u64 {
    30
}

pub fn logging_level_default() -> String {
    "info".to_owned()
}

pub fn state_file_default() -> PathBuf {
    PathBuf::from("state.lock")
}

pub fn state_save_period_default() -> u64 {
    15
}

pub fn max_create_bridge_iterations_default() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    /// Endpoint of the chain adapter.
    #[serde(default)]
    pub node: String,
    /// This witness's door account on the chain.
    #[serde(default)]
    pub door_address: String,
    /// First block to scan when no attestation progress has been saved.
    #[serde(default)]
    pub starting_block: u64,
    /// How long a signer-list membership answer is trusted, in seconds.
    #[serde(default = "signer_list_seconds_default")]
    pub signer_list_seconds: u64,
    /// Highest gas factor a transaction is re-priced to. Capped at [GAS_FACTOR_LIMIT].
    #[serde(default = "max_gas_factor_default")]
    pub max_gas_factor: u32,
    #[serde(default)]
    pub signer: Option<SignerConfig>,
}

impl ChainConfig {
    fn new(chain_type: ChainType) -> Self {
        ChainConfig {
            chain_type,
            node: String::new(),
            door_address: String::new(),
            starting_block: 0,
            signer_list_seconds: signer_list_seconds_default(),
            max_gas_factor: max_gas_factor_default(),
            signer: None,
        }
    }

    pub fn signer_list_ttl(&self) -> Duration {
        Duration::from_secs(self.signer_list_seconds)
    }
}

pub fn main_chain_default() -> ChainConfig {
    ChainConfig::new(ChainType::Xrp)
}

pub fn side_chain_default() -> ChainConfig {
    ChainConfig::new(ChainType::Evm)
}

pub fn signer_list_seconds_default() -> u64 {
    60
}

pub fn max_gas_factor_default() -> u32 {
    GAS_FACTOR_LIMIT
}

/// How the chain adapter signs for this witness.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignerConfig {
    Local {
        private_key: String,
    },
    Aws {
        region: String,
        access_key: String,
        secret_key: String,
        key_id: String,
    },
}

// Keeps key material out of logs.
impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerConfig::Local { .. } => f.debug_struct("Local").finish_non_exhaustive(),
            SignerConfig::Aws { region, key_id, .. } => f
                .debug_struct("Aws")
                .field("region", region)
                .field("key_id", key_id)
                .finish_non_exhaustive(),
        }
    }
}

impl Config {
    /// Read `path` if it exists, then apply environment overrides. The result is not yet validated.
    pub fn load(path: &Path) -> Result<Config> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides found through `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let env = Overrides {
            lookup: &|name: &str| lookup(name).filter(|v| !v.is_empty()),
        };
        let server = &mut self.server;
        env.number("SERVER_QUEUE_PERIOD", &mut server.queue_period)?;
        env.number(
            "SERVER_BRIDGE_LISTENER_QUEUE_PERIOD",
            &mut server.bridge_listener_queue_period,
        )?;
        env.number(
            "SERVER_BRIDGE_CREATION_QUEUE_PERIOD",
            &mut server.bridge_creation_queue_period,
        )?;
        env.string("SERVER_LOGGING_LEVEL", &mut server.logging_level);
        if let Some(format) = env.get("SERVER_LOG_FORMAT") {
            server.log_format = match format.as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Text,
            };
        }
        env.string("SERVER_SEQUENCER_URL", &mut server.sequencer_url);
        if let Some(enabled) = env.get("SERVER_DYNAMIC_BRIDGE_CREATION") {
            server.dynamic_bridge_creation = enabled != "false";
        }
        env.number(
            "SERVER_MIN_BRIDGE_SIGNATURE_REWARD",
            &mut server.min_bridge_signature_reward,
        )?;
        env.number(
            "SERVER_MAX_BRIDGE_SIGNATURE_REWARD",
            &mut server.max_bridge_signature_reward,
        )?;
        env.number(
            "SERVER_MAX_CREATE_BRIDGE_ITERATIONS",
            &mut server.max_create_bridge_iterations,
        )?;

        env.chain("MAINCHAIN", &mut self.main_chain)?;
        env.chain("SIDECHAIN", &mut self.side_chain)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        for (name, period) in [
            ("server.queue_period", server.queue_period),
            (
                "server.bridge_listener_queue_period",
                server.bridge_listener_queue_period,
            ),
            (
                "server.bridge_creation_queue_period",
                server.bridge_creation_queue_period,
            ),
            ("server.state_save_period", server.state_save_period),
        ] {
            if period == 0 {
                return Err(ConfigError::ZeroPeriod(name));
            }
        }
        if server.min_bridge_signature_reward > server.max_bridge_signature_reward {
            return Err(ConfigError::RewardBounds {
                min: server.min_bridge_signature_reward,
                max: server.max_bridge_signature_reward,
            });
        }
        if server.dynamic_bridge_creation && server.sequencer_url.is_empty() {
            return Err(ConfigError::MissingSequencer);
        }

        for (name, ttl, chain) in [
            ("main_chain", "main_chain.signer_list_seconds", &self.main_chain),
            ("side_chain", "side_chain.signer_list_seconds", &self.side_chain),
        ] {
            if chain.node.is_empty() {
                return Err(ConfigError::MissingNode(name));
            }
            if chain.signer_list_seconds == 0 {
                return Err(ConfigError::ZeroPeriod(ttl));
            }
            match &chain.signer {
                None => return Err(ConfigError::Signer(name, "no signer configured".to_owned())),
                Some(SignerConfig::Local { private_key }) => {
                    let key = private_key.strip_prefix("0x").unwrap_or(private_key);
                    match hex::decode(key) {
                        Ok(bytes) if bytes.len() == 32 => {}
                        _ => {
                            return Err(ConfigError::Signer(
                                name,
                                "private_key must be 32 hex-encoded bytes".to_owned(),
                            ));
                        }
                    }
                }
                Some(SignerConfig::Aws { key_id, .. }) if key_id.is_empty() => {
                    return Err(ConfigError::Signer(name, "key_id must be set".to_owned()));
                }
                Some(SignerConfig::Aws { .. }) => {}
            }
        }
        Ok(())
    }
}

struct Overrides<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Overrides<'_> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str, target: &mut String) {
        if let Some(value) = self.get(name) {
            *target = value;
        }
    }

    fn number<T: FromStr + fmt::Display>(&self, name: &str, target: &mut T) -> Result<(), ConfigError> {
        let Some(value) = self.get(name) else {
            return Ok(());
        };
        let parsed = value
            .parse()
            .map_err(|_| ConfigError::InvalidOverride(name.to_owned(), value.clone()))?;
        warn!(
            name,
            value = %parsed,
            "applying numeric environment override; releases before this one ignored it"
        );
        *target = parsed;
        Ok(())
    }

    fn chain(&self, prefix: &str, chain: &mut ChainConfig) -> Result<(), ConfigError> {
        let var = |suffix: &str| format!("{prefix}_{suffix}");
        if let Some(chain_type) = self.get(&var("TYPE")) {
            chain.chain_type = match chain_type.as_str() {
                "xrp" => ChainType::Xrp,
                "evm" => ChainType::Evm,
                _ => return Err(ConfigError::InvalidOverride(var("TYPE"), chain_type)),
            };
        }
        self.string(&var("NODE"), &mut chain.node);
        self.string(&var("DOOR_ADDRESS"), &mut chain.door_address);
        self.number(&var("STARTING_BLOCK"), &mut chain.starting_block)?;
        self.number(&var("SIGNER_LIST_SECONDS"), &mut chain.signer_list_seconds)?;
        self.number(&var("MAX_GAS_FACTOR"), &mut chain.max_gas_factor)?;

        let signer_type = self.get(&var("SIGNER_TYPE")).or_else(|| match &chain.signer {
            Some(SignerConfig::Local { .. }) => Some("local".to_owned()),
            Some(SignerConfig::Aws { .. }) => Some("aws".to_owned()),
            None => None,
        });
        match signer_type.as_deref() {
            None => {}
            Some("local") => {
                if let Some(private_key) = self.get(&var("SIGNER_PRIVATE_KEY")) {
                    chain.signer = Some(SignerConfig::Local { private_key });
                }
            }
            Some("aws") => {
                let (region, access_key, secret_key, key_id) = match chain.signer.take() {
                    Some(SignerConfig::Aws {
                        region,
                        access_key,
                        secret_key,
                        key_id,
                    }) => (region, access_key, secret_key, key_id),
                    _ => Default::default(),
                };
                chain.signer = Some(SignerConfig::Aws {
                    region: self.get(&var("SIGNER_AWS_REGION")).unwrap_or(region),
                    access_key: self.get("AWS_ACCESS_KEY").unwrap_or(access_key),
                    secret_key: self.get("AWS_SECRET_KEY").unwrap_or(secret_key),
                    key_id: self.get(&var("SIGNER_KMS_KEY_ID")).unwrap_or(key_id),
                });
            }
            Some(other) => {
                return Err(ConfigError::InvalidOverride(
                    var("SIGNER_TYPE"),
                    other.to_owned(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn valid() -> Config {
        toml::from_str(&format!(
            r#"
            [server]
            queue_period = 3

            [main_chain]
            type = "xrp"
            node = "http://127.0.0.1:9100"
            door_address = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh"
            signer = {{ type = "local", private_key = "{KEY}" }}

            [side_chain]
            type = "evm"
            node = "http://127.0.0.1:9200"
            door_address = "0xb5f762798a53d543a014caf8b297cff8f2f937e8"
            starting_block = 120
            signer = {{ type = "aws", region = "eu-west-1", access_key = "a", secret_key = "s", key_id = "k" }}
            "#
        ))
        .unwrap()
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn partial_files_take_defaults() {
        let config = valid();
        assert_eq!(config.server.queue_period, 3);
        assert_eq!(config.server.bridge_listener_queue_period, 30);
        assert_eq!(config.server.state_file, PathBuf::from("state.lock"));
        assert_eq!(config.server.log_format, LogFormat::Text);
        assert_eq!(config.side_chain.signer_list_seconds, 60);
        assert_eq!(config.side_chain.max_gas_factor, 10);
        assert_eq!(config.side_chain.starting_block, 120);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> = toml::from_str("[server]\nqueue_periods = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn environment_overrides_are_applied() {
        let mut config = valid();
        config
            .apply_overrides(env(&[
                ("SERVER_QUEUE_PERIOD", "9"),
                ("SERVER_LOG_FORMAT", "json"),
                ("SERVER_DYNAMIC_BRIDGE_CREATION", "true"),
                ("SERVER_SEQUENCER_URL", "http://sequencer"),
                ("MAINCHAIN_STARTING_BLOCK", "4000"),
                ("MAINCHAIN_NODE", ""),
                ("SIDECHAIN_MAX_GAS_FACTOR", "4"),
                ("SIDECHAIN_SIGNER_TYPE", "local"),
                ("SIDECHAIN_SIGNER_PRIVATE_KEY", KEY),
            ]))
            .unwrap();

        assert_eq!(config.server.queue_period, 9);
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert!(config.server.dynamic_bridge_creation);
        assert_eq!(config.main_chain.starting_block, 4000);
        assert_eq!(config.main_chain.node, "http://127.0.0.1:9100");
        assert_eq!(config.side_chain.max_gas_factor, 4);
        assert!(matches!(config.side_chain.signer, Some(SignerConfig::Local { .. })));
        config.validate().unwrap();
    }

    #[test]
    fn malformed_numeric_overrides_are_errors() {
        let mut config = valid();
        let error = config
            .apply_overrides(env(&[("SIDECHAIN_STARTING_BLOCK", "soon")]))
            .unwrap_err();
        assert_eq!(
            error,
            ConfigError::InvalidOverride("SIDECHAIN_STARTING_BLOCK".to_owned(), "soon".to_owned())
        );
    }

    #[test]
    fn aws_credentials_come_from_the_environment() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("MAINCHAIN_SIGNER_TYPE", "aws"),
                ("MAINCHAIN_SIGNER_AWS_REGION", "us-east-1"),
                ("MAINCHAIN_SIGNER_KMS_KEY_ID", "key"),
                ("AWS_ACCESS_KEY", "access"),
                ("AWS_SECRET_KEY", "secret"),
            ]))
            .unwrap();
        let Some(SignerConfig::Aws {
            region,
            access_key,
            key_id,
            ..
        }) = &config.main_chain.signer
        else {
            panic!("expected an aws signer");
        };
        assert_eq!((region.as_str(), access_key.as_str(), key_id.as_str()), ("us-east-1", "access", "key"));
        assert!(config.side_chain.signer.is_none());
    }

    #[test]
    fn validation_failures() {
        let mut config = valid();
        config.server.max_bridge_signature_reward = 5;
        config.server.min_bridge_signature_reward = 6;
        assert_eq!(
            config.validate(),
            Err(ConfigError::RewardBounds { min: 6, max: 5 })
        );

        let mut config = valid();
        config.server.dynamic_bridge_creation = true;
        assert_eq!(config.validate(), Err(ConfigError::MissingSequencer));

        let mut config = valid();
        config.server.state_save_period = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroPeriod("server.state_save_period"))
        );

        let mut config = valid();
        config.main_chain.node.clear();
        assert_eq!(config.validate(), Err(ConfigError::MissingNode("main_chain")));

        let mut config = valid();
        config.main_chain.signer = Some(SignerConfig::Local {
            private_key: "abcd".to_owned(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Signer("main_chain", _))
        ));
    }

    #[test]
    fn signer_debug_output_hides_keys() {
        let config = valid();
        let printed = format!("{config:?}");
        assert!(!printed.contains(KEY));
        assert!(printed.contains("eu-west-1"));
        assert!(!printed.contains("secret_key: \"s\""));
    }

    #[test]
    fn a_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.server.queue_period, queue_period_default());
    }
}
