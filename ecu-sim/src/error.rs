#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Settings file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Actuator setup error: {0}")]
    Actuator(#[from] ecu_actuators::Error),

    #[error("Report encoding error: {0}")]
    Report(#[from] serde_json::Error),
}
