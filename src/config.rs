use std::path::{Path, PathBuf};

use serde::Deserialize;
use smart_default::SmartDefault;

use crate::errors::*;
use crate::history::DEFAULT_HISTORY_LENGTH;
use crate::monitors::{cpu, gpu, memory, network};
use crate::util;

#[derive(Deserialize, Debug, Clone, PartialEq, SmartDefault)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Samples kept per topic
    #[default(DEFAULT_HISTORY_LENGTH)]
    pub history_length: usize,
    pub cpu: cpu::Config,
    pub memory: memory::Config,
    pub network: network::Config,
    pub gpu: gpu::Config,
}

impl Config {
    /// Find the configuration file named on the command line. Without an explicit name a missing
    /// `config.toml` is not an error, the defaults are used instead.
    pub fn locate(name: Option<&str>) -> Result<Option<PathBuf>> {
        match name {
            Some(name) => util::find_file(name, None, Some("toml"))
                .map(Some)
                .or_error(|| format!("Configuration file '{name}' not found")),
            None => Ok(util::find_file("config.toml", None, None)),
        }
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = match path {
            Some(path) => util::deserialize_toml_file(path)?,
            None => Self::default(),
        };
        if config.history_length == 0 {
            return Err(Error::new("history_length must be at least 1"));
        }
        Ok(config)
    }
}
