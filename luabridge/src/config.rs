use std::{
    fs::File,
    io::{Error, ErrorKind, Read},
    path::Path,
};

use log::LevelFilter;
use luabridge_nls::Encoding;
use serde::{Deserialize, Serialize};

/// Logger configuration used by the engine front-ends.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggerConfig {
    pub app_level_filter: LevelFilter,
    pub level_filter: LevelFilter,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { app_level_filter: LevelFilter::Info, level_filter: LevelFilter::Info }
    }
}

/// Configuration of a [`crate::ScriptEngine`].
/// Please use [`EngineConfigBuilder`] if you want to build it from code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunk name used when a context carries no file name.
    pub(crate) default_chunk_name: String,
    /// Encoding of source text read from streams.
    pub(crate) source_encoding: Encoding,
    /// Whether the standard library is installed in a new runtime.
    pub(crate) open_libs: bool,
    /// Logger configuration to use.
    pub(crate) logger_config: Option<LoggerConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_chunk_name: "null".to_string(),
            source_encoding: Encoding::Utf8,
            open_libs: true,
            logger_config: Some(Default::default()),
        }
    }
}

impl EngineConfig {
    pub fn default_chunk_name(&self) -> &str {
        &self.default_chunk_name
    }

    pub fn source_encoding(&self) -> Encoding {
        self.source_encoding
    }

    pub fn open_libs(&self) -> bool {
        self.open_libs
    }

    pub fn logger_config(&self) -> Option<&LoggerConfig> {
        self.logger_config.as_ref()
    }

    /// Reads a TOML configuration file. Missing fields take their defaults.
    pub fn read(path: &Path) -> Result<EngineConfig, Error> {
        if !path.exists() {
            return Err(Error::new(ErrorKind::NotFound, "File not found"));
        }
        let mut file = File::open(path)?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<EngineConfig, Error> {
        toml::from_str(text).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }
}

/// `EngineConfigBuilder` is a convenience builder to create an `EngineConfig` from code.
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new `EngineConfigBuilder` builder
    pub fn new() -> Self {
        Self { config: Default::default() }
    }

    pub fn with_default_chunk_name(mut self, name: impl Into<String>) -> Self {
        self.config.default_chunk_name = name.into();
        self
    }

    pub fn with_source_encoding(mut self, encoding: Encoding) -> Self {
        self.config.source_encoding = encoding;
        self
    }

    pub fn with_open_libs(mut self, open_libs: bool) -> Self {
        self.config.open_libs = open_libs;
        self
    }

    /// Sets the logger configuration
    pub fn with_logger_config(mut self, logger_config: LoggerConfig) -> Self {
        self.config.logger_config = Some(logger_config);
        self
    }

    /// Retrieves the configuration built
    pub fn get(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::parse(
            r#"
            source_encoding = "shift_jis"

            [logger_config]
            app_level_filter = "DEBUG"
            level_filter = "WARN"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_chunk_name(), "null");
        assert_eq!(config.source_encoding(), Encoding::ShiftJis);
        assert!(config.open_libs());
        assert_eq!(
            config.logger_config(),
            Some(&LoggerConfig { app_level_filter: LevelFilter::Debug, level_filter: LevelFilter::Warn })
        );
    }

    #[test]
    fn builder_overrides() {
        let config = EngineConfigBuilder::new()
            .with_default_chunk_name("main")
            .with_open_libs(false)
            .get();
        assert_eq!(config.default_chunk_name(), "main");
        assert!(!config.open_libs());
    }

    #[test]
    fn bad_toml_is_invalid_data() {
        let err = EngineConfig::parse("open_libs = 3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn missing_file() {
        let err = EngineConfig::read(Path::new("/nonexistent/luab.toml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
