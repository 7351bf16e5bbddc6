use datacave_client::ConnectOptions;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectOptions,
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Settings taken from the `PG*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            connection: ConnectOptions::from_env()?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.connection.validate()?;
        Ok(())
    }
}
