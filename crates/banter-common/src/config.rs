//! Client configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables elsewhere.
//! Config precedence: env vars > .env file > config.toml > defaults
//!
//! The loaded [`ClientConfig`] is handed to constructors explicitly rather
//! than parked in a process-wide global, so embedders can run several
//! differently-configured clients in one process.

use serde::Deserialize;

/// Load the client configuration from environment.
///
/// Environment variables use the `BANTER` prefix with `__` separators,
/// e.g. `BANTER_GATEWAY__ENDPOINTS`, `BANTER_VOICE__JOIN_TIMEOUT_MS`.
pub fn load() -> Result<ClientConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("gateway.endpoints", vec!["wss://gateway.banter.chat"])?
        .set_default("gateway.identify_timeout_ms", 10_000)?
        .set_default("gateway.reconnect_base_delay_ms", 300)?
        .set_default("gateway.reconnect_max_delay_ms", 5_000)?
        .set_default("voice.join_timeout_ms", 15_000)?
        .set_default("voice.negotiation_timeout_ms", 10_000)?
        .set_default("voice.speaking_threshold_dbfs", -50.0)?
        .set_default("voice.speaking_hang_ms", 300)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (BANTER_GATEWAY__ENDPOINTS, etc.)
        .add_source(
            config::Environment::with_prefix("BANTER")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("gateway.endpoints"),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub gateway: GatewayConfig,
    pub voice: VoiceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Candidate endpoint URLs, in preference order.
    pub endpoints: Vec<String>,
    /// How long to wait for the Hello/Ready handshake before cycling candidates.
    pub identify_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    /// Budget for the joined confirmation after sending the join intent.
    pub join_timeout_ms: u64,
    /// Budget for each transport/produce/consume confirmation.
    pub negotiation_timeout_ms: u64,
    /// RMS level above which the local user counts as speaking.
    pub speaking_threshold_dbfs: f32,
    /// How long speaking persists after the level drops below the threshold.
    pub speaking_hang_ms: u64,
}

impl GatewayConfig {
    /// Validate and return the endpoint candidates as parsed URLs.
    pub fn candidate_urls(&self) -> Result<Vec<url::Url>, url::ParseError> {
        self.endpoints.iter().map(|e| url::Url::parse(e)).collect()
    }
}
