use thiserror::Error;

/// Errors raised while loading or validating the bridge configuration.
/// Any of these aborts startup before a connector is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Unknown device class '{0}' (expected 40a, 45a or 60a)")]
    UnknownDeviceClass(String),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("No device session configured")]
    NoSessions,
    #[error("Duplicate session id: {0}")]
    DuplicateSession(String),
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// A message body that could not be turned into readings.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("dataStreams is not an array")]
    StreamsNotAList,
}

/// Failures building the broker transport.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid broker address: {0}")]
    Address(String),
}
