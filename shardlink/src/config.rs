//! Configuration for the client
//!
//! The config is usually loaded from a TOML file with [`Config::load`].  Every field is
//! optional in the file, missing fields take their value from [`Config::default`].

use std::{path::Path, time::Duration};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    defaults::{
        DEFAULT_HOLDER_ADDR, DEFAULT_HOLDER_ADDR_ALT, PROBES_PER_SHARD, timeouts::PROBE_WINDOW,
    },
    probe::Prober,
};

#[allow(missing_docs)]
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("Failed to read config file {path}"))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Config must be valid toml"))]
    Parse { source: toml::de::Error },
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address of the control channel.
    ///
    /// Handed to the [`crate::Tunnel`] implementation.
    pub holder_addr: String,
    /// Address of the control channel tried when [`Config::holder_addr`] fails.
    pub holder_addr_alt: String,
    /// Probe round settings.
    pub probe: ProbeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            holder_addr: DEFAULT_HOLDER_ADDR.to_string(),
            holder_addr_alt: DEFAULT_HOLDER_ADDR_ALT.to_string(),
            probe: ProbeConfig::default(),
        }
    }
}

/// Probe round settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// How long replies are collected once all probes are sent, e.g. `"1s"` or `"750ms"`.
    #[serde(with = "serde_duration")]
    pub window: Duration,
    /// How many probes are sent to every shard.
    pub probes_per_shard: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            window: PROBE_WINDOW,
            probes_per_shard: PROBES_PER_SHARD,
        }
    }
}

impl Config {
    /// Loads the config from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path).await.context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_toml_str(&s)
    }

    /// Parses the config from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).context(ParseSnafu)
    }

    /// Creates the [`Prober`] described by this config.
    pub fn prober(&self) -> Prober {
        Prober::new(self.probe.window, self.probe.probes_per_shard)
    }
}

mod serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, de::Deserializer, ser::Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        } else {
            serde::Serialize::serialize(duration, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        } else {
            Duration::deserialize(deserializer)
        }
    }
}
