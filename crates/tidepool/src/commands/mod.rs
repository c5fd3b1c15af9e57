//! Command handlers: bridge CLI args -> session calls -> output formatting.

pub mod config_cmd;
pub mod models;
pub mod watch;

use serde_json::Value;

use crate::error::CliError;

/// Parse a JSON flag value.
pub fn parse_json(field: &str, text: &str) -> Result<Value, CliError> {
    serde_json::from_str(text).map_err(|source| CliError::Json {
        field: field.into(),
        source,
    })
}
