//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_BACKEND: &str = "aws";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
    #[serde(rename = "install_definition", default)]
    pub install_definition: bool,
}

// -----------------------------------------------------------------------------
// Bootstrap structure

/// bounds the wait for the custom resource definition to be served by the
/// api server, all values are expressed in milliseconds
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Bootstrap {
    #[serde(rename = "initial_delay")]
    pub initial_delay: u64,
    #[serde(rename = "max_delay")]
    pub max_delay: u64,
    #[serde(rename = "max_wait")]
    pub max_wait: u64,
}

impl Bootstrap {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait)
    }
}

// -----------------------------------------------------------------------------
// Provider structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Provider {
    #[serde(rename = "backend")]
    pub backend: String,
}

// -----------------------------------------------------------------------------
// Aws structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Aws {
    #[serde(rename = "region", default)]
    pub region: Option<String>,
    /// maximum duration in seconds to wait for an instance to become available
    #[serde(rename = "availability_timeout", default = "default_availability_timeout")]
    pub availability_timeout: u64,
}

const fn default_availability_timeout() -> u64 {
    1800
}

impl Default for Aws {
    fn default() -> Self {
        Self {
            region: None,
            availability_timeout: default_availability_timeout(),
        }
    }
}

impl Aws {
    pub fn availability_timeout(&self) -> Duration {
        Duration::from_secs(self.availability_timeout)
    }
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to load configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "bootstrap")]
    pub bootstrap: Bootstrap,
    #[serde(rename = "provider")]
    pub provider: Provider,
    #[serde(rename = "aws", default)]
    pub aws: Aws,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults()?
            .add_source(File::from(path.to_owned()).required(true))
            .add_source(environment())
            .build()
            .map_err(|err| Error::File(path, err))?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut builder = defaults()?;
        for path in locations() {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .add_source(environment())
            .build()
            .map_err(Error::Cast)?
            .try_deserialize()
            .map_err(Error::Cast)
    }

    pub fn help(&self) {
        tracing::info!(
            listen = self.operator.listen.to_string(),
            backend = &self.provider.backend,
            install_definition = self.operator.install_definition,
            "Loaded configuration",
        );
    }
}

// -----------------------------------------------------------------------------
// helpers

fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_")).separator("__")
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, Error> {
    let mut builder = Config::builder();
    let defaults: [(&str, config::Value); 6] = [
        ("operator.listen", DEFAULT_LISTEN.into()),
        ("operator.install_definition", false.into()),
        ("bootstrap.initial_delay", 500_u64.into()),
        ("bootstrap.max_delay", 10_000_u64.into()),
        ("bootstrap.max_wait", 120_000_u64.into()),
        ("provider.backend", DEFAULT_BACKEND.into()),
    ];

    for (key, value) in defaults {
        builder = builder
            .set_default(key, value)
            .map_err(|err| Error::Default(key.into(), err))?;
    }

    Ok(builder)
}

/// returns well-known locations of the configuration file, the later
/// overrides the former
fn locations() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
        PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
    ];

    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        paths.push(home.join(".config").join(env!("CARGO_PKG_NAME")).join("config"));
        paths.push(
            home.join(".local")
                .join("share")
                .join(env!("CARGO_PKG_NAME"))
                .join("config"),
        );
    }

    paths.push(PathBuf::from("config"));
    paths
}
