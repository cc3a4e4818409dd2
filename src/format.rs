//! Output format selection for the CLI.

use std::str::FromStr;

use anyhow::{Result, bail};
use serde::Serialize;

/// Output format for structured data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Plain text - compact, agent-friendly output
    #[default]
    Text,
    /// JSON - machine-parseable
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => bail!("Invalid format '{s}'. Use: text or json"),
        }
    }
}

impl OutputFormat {
    /// Resolve the output format: explicit flag > FORMAT env var > default.
    #[must_use]
    pub fn resolve(explicit: Option<Self>, json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        if let Some(fmt) = explicit {
            return fmt;
        }
        if let Ok(env_format) = std::env::var("FORMAT") {
            if let Ok(fmt) = env_format.parse::<Self>() {
                return fmt;
            }
        }
        Self::Text
    }

    /// Serialize data to the requested format.
    ///
    /// # Errors
    /// Fails when JSON serialization fails.
    pub fn serialize<T: Serialize>(self, data: &T) -> Result<String> {
        match self {
            Self::Json => serde_json::to_string_pretty(data)
                .map_err(|e| anyhow::anyhow!("JSON serialization failed: {e}")),
            Self::Text => serde_json::to_string(data)
                .map_err(|e| anyhow::anyhow!("serialization failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_wins() {
        assert_eq!(OutputFormat::resolve(Some(OutputFormat::Text), true), OutputFormat::Json);
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!("yaml".parse::<OutputFormat>().is_err());
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
    }
}
