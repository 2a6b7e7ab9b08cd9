use thiserror::Error;

/// Errors from loading or validating [`crate::config::CoordinatorConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read or parse configuration: {0}")]
    Source(#[from] config::ConfigError),
}

/// Errors surfaced while decoding a single wire message. These map to the
/// "invalid input" error kind: the caller replies with `EINVAL` and keeps
/// the socket open, never propagating this as a hard failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("unknown command")]
    UnknownCommand,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_converts_from_serde_error() {
        let parse_err = serde_json::from_str::<crate::wire::Request>("not json").unwrap_err();
        let err = ProtocolError::from(parse_err);
        assert!(matches!(err, ProtocolError::MalformedJson(_)));
        assert!(err.to_string().starts_with("malformed json:"));
    }
}
