//! Decoder configuration from environment variables or a TOML document.
//!
//! Environment values that are missing or fail to parse fall back to their
//! defaults; sizes are floored at 1.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `SPECDEC_MAX_BATCH_SIZE` | 8 | Sequence slots per layer |
//! | `SPECDEC_VOCAB_SIZE` | 32000 | Vocabulary size |
//! | `SPECDEC_VOCAB_SIZE_PADDED` | vocab rounded up to 128 | Row width of logits |
//! | `SPECDEC_MAX_DRAFT_TOKENS` | 4 | Draft tokens per cycle |
//! | `SPECDEC_MAX_SEQ_LEN` | 4096 | Output row capacity (tokens) |
//! | `SPECDEC_RANDOM_THRESHOLD` | true | Draw acceptance thresholds |
//! | `SPECDEC_CONSTANT_THRESHOLD` | 1.0 | Threshold when not drawn |
//! | `SPECDEC_LOG_LEVEL` | info | Log filter directive |
//! | `SPECDEC_LOG_FORMAT` | json | `json` or `pretty` |
//! | `SPECDEC_LOG_FILE` | unset | Log file path |

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::layers::{AcceptanceThreshold, DecoderDomain, DecodingError};
use crate::telemetry::{LogConfig, LogFormat};

/// Padded vocabularies are rounded up to a multiple of this.
pub const VOCAB_PAD_MULTIPLE: usize = 128;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid decoder configuration: {0}")]
    Invalid(#[from] DecodingError),
}

/// How acceptance thresholds are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AcceptanceConfig {
    pub use_random_threshold: bool,
    pub constant_threshold: f32,
}

impl Default for AcceptanceConfig {
    fn default() -> Self {
        Self {
            use_random_threshold: true,
            constant_threshold: 1.0,
        }
    }
}

impl AcceptanceConfig {
    pub fn threshold(&self) -> AcceptanceThreshold {
        if self.use_random_threshold {
            AcceptanceThreshold::Random
        } else {
            AcceptanceThreshold::Constant(self.constant_threshold)
        }
    }
}

/// Everything needed to build decoding layers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub max_batch_size: usize,
    pub vocab_size: usize,
    /// Defaults to `vocab_size` rounded up to [`VOCAB_PAD_MULTIPLE`].
    pub vocab_size_padded: Option<usize>,
    pub max_draft_tokens: usize,
    pub max_seq_len: usize,
    pub acceptance: AcceptanceConfig,
    pub logging: LogConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            vocab_size: 32000,
            vocab_size_padded: None,
            max_draft_tokens: 4,
            max_seq_len: 4096,
            acceptance: AcceptanceConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

impl DecoderConfig {
    /// Load from `SPECDEC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load from any variable source, e.g. a map in tests.
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_batch_size =
            parse_or(var("SPECDEC_MAX_BATCH_SIZE"), defaults.max_batch_size).max(1);
        let vocab_size = parse_or(var("SPECDEC_VOCAB_SIZE"), defaults.vocab_size).max(1);
        let vocab_size_padded =
            var("SPECDEC_VOCAB_SIZE_PADDED").and_then(|v| v.trim().parse::<usize>().ok());
        let max_draft_tokens =
            parse_or(var("SPECDEC_MAX_DRAFT_TOKENS"), defaults.max_draft_tokens).max(1);
        let max_seq_len = parse_or(var("SPECDEC_MAX_SEQ_LEN"), defaults.max_seq_len).max(1);

        let constant_threshold = parse_or(
            var("SPECDEC_CONSTANT_THRESHOLD"),
            defaults.acceptance.constant_threshold,
        );
        let acceptance = AcceptanceConfig {
            use_random_threshold: parse_or(
                var("SPECDEC_RANDOM_THRESHOLD"),
                defaults.acceptance.use_random_threshold,
            ),
            constant_threshold: if constant_threshold.is_finite() {
                constant_threshold.max(0.0)
            } else {
                defaults.acceptance.constant_threshold
            },
        };

        let logging = LogConfig {
            format: var("SPECDEC_LOG_FORMAT")
                .and_then(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.logging.format),
            level: var("SPECDEC_LOG_LEVEL").unwrap_or(defaults.logging.level),
            output_path: var("SPECDEC_LOG_FILE").map(PathBuf::from),
        };

        Self {
            max_batch_size,
            vocab_size,
            vocab_size_padded,
            max_draft_tokens,
            max_seq_len,
            acceptance,
            logging,
        }
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(document)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&document)
    }

    pub fn padded_vocab_size(&self) -> usize {
        self.vocab_size_padded
            .unwrap_or_else(|| self.vocab_size.div_ceil(VOCAB_PAD_MULTIPLE) * VOCAB_PAD_MULTIPLE)
    }

    /// Validated batch domain for the configured sizes.
    pub fn domain(&self) -> Result<DecoderDomain, ConfigError> {
        Ok(DecoderDomain::new(
            self.max_batch_size,
            self.vocab_size,
            self.padded_vocab_size(),
            self.max_draft_tokens,
            self.max_seq_len,
        )?)
    }
}
