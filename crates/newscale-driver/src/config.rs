//! Declarative setup: describe a manipulator in TOML, validate it, and
//! connect.
//!
//! ```toml
//! [interface]
//! kind = "serial"
//! port = "/dev/ttyUSB0"
//!
//! [timing]
//! move_timeout_ms = 10000
//!
//! [[axes]]
//! name = "x"
//! address = 1
//!
//! [[axes]]
//! name = "y"
//! address = 2
//! ```

use crate::error::{GroupError, StageError};
use crate::interface::{Address, Interface, DEFAULT_BAUD, DEFAULT_POE_PORT};
use crate::multistage::MultiStage;
use crate::stage::{M3LinearSmartStage, StageSettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Group(#[from] GroupError),
}

/// A full manipulator description: one link, its axes, shared timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiStageConfig {
    pub interface: InterfaceConfig,
    pub axes: Vec<AxisConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterfaceConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    Poe {
        host: String,
        #[serde(default = "default_poe_port")]
        port: u16,
    },
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_poe_port() -> u16 {
    DEFAULT_POE_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisConfig {
    pub name: String,
    pub address: u8,
}

/// Timing knobs in milliseconds, applied to every axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimingConfig {
    pub reply_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub move_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let defaults = StageSettings::default();
        Self {
            reply_timeout_ms: defaults.reply_timeout.as_millis() as u64,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            move_timeout_ms: defaults.move_timeout.as_millis() as u64,
        }
    }
}

impl From<TimingConfig> for StageSettings {
    fn from(timing: TimingConfig) -> Self {
        Self {
            reply_timeout: Duration::from_millis(timing.reply_timeout_ms),
            poll_interval: Duration::from_millis(timing.poll_interval_ms),
            move_timeout: Duration::from_millis(timing.move_timeout_ms),
        }
    }
}

impl MultiStageConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks the deserializer cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.axes.is_empty() {
            return Err(ConfigError::Invalid("no axes defined".to_string()));
        }
        for (i, axis) in self.axes.iter().enumerate() {
            if axis.name.is_empty() {
                return Err(ConfigError::Invalid("axis with empty name".to_string()));
            }
            for other in &self.axes[i + 1..] {
                if axis.name == other.name {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate axis name {:?}",
                        axis.name
                    )));
                }
                if axis.address == other.address {
                    return Err(ConfigError::Invalid(format!(
                        "axes {:?} and {:?} share address {:02X}",
                        axis.name, other.name, axis.address
                    )));
                }
            }
        }
        if self.timing.reply_timeout_ms == 0
            || self.timing.poll_interval_ms == 0
            || self.timing.move_timeout_ms == 0
        {
            return Err(ConfigError::Invalid(
                "timeouts and poll interval must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn settings(&self) -> StageSettings {
        self.timing.into()
    }

    /// Open the link and every configured axis.
    pub async fn connect(&self) -> Result<MultiStage, ConfigError> {
        self.validate()?;
        let interface = match &self.interface {
            InterfaceConfig::Serial { port, baud } => Interface::serial(port, *baud).await?,
            InterfaceConfig::Poe { host, port } => Interface::poe(host, *port).await?,
        };
        self.connect_on(interface).await
    }

    /// Open every configured axis on an already-open link. Used by the
    /// tests to connect over an in-memory stream.
    pub async fn connect_on(&self, interface: Interface) -> Result<MultiStage, ConfigError> {
        let settings = self.settings();
        let mut axes = Vec::with_capacity(self.axes.len());
        for axis in &self.axes {
            let stage = M3LinearSmartStage::open(
                interface.clone(),
                Address::new(axis.address),
                settings,
            )
            .await?;
            axes.push((axis.name.clone(), Arc::new(stage)));
        }
        Ok(MultiStage::new(axes)?)
    }
}
