use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Server configuration, loaded from `server.toml` with `SERVER_*`
/// environment overrides (`SERVER_PORT`, `SERVER_DB_PATH`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub file_port: u16,
    pub db_path: String,
    pub log_level: String,
    /// Idle cutoff for the presence cleaner, seconds.
    pub session_timeout: u64,
    /// Presence cleaner tick interval, seconds.
    pub presence_scan_interval: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("SERVER_CONFIG").unwrap_or_else(|_| "server.toml".to_string());

        let builder = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8088)?
            .set_default("file_port", 9090)?
            .set_default("db_path", "data/server.db")?
            .set_default("log_level", "INFO")?
            .set_default("session_timeout", 30)?
            .set_default("presence_scan_interval", 5)?;

        let builder = if Path::new(&config_path).exists() {
            builder.add_source(config::File::with_name(&config_path))
        } else {
            builder
        };

        let settings = builder
            .add_source(config::Environment::with_prefix("SERVER").try_parsing(true))
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_contract() {
        let config = AppConfig::load().unwrap();
        assert_eq!(config.port, 8088);
        assert_eq!(config.file_port, 9090);
        assert_eq!(config.session_timeout, 30);
        assert_eq!(config.presence_scan_interval, 5);
        assert_eq!(config.db_path, "data/server.db");
    }
}
