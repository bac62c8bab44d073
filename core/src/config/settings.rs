use super::StoreConfig;
use crate::{KatewayError, Result};
use config::{Config, Environment};

impl StoreConfig {
    /// Load the configuration from `KATEWAY_*` environment variables.
    ///
    /// Nested producer settings use a double underscore, for example
    /// `KATEWAY_SYNC_PRODUCER__DIAL_TIMEOUT_MS=5000`.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                Environment::with_prefix("KATEWAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| KatewayError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<StoreConfig>()
            .map_err(|e| KatewayError::Config(e.to_string()))?;
        let hostname = config.hostname.clone();
        let config = config.with_hostname(&hostname);

        config.validate().map_err(KatewayError::Config)?;
        Ok(config)
    }
}
