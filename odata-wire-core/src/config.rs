//! Batch reader/writer settings and message quotas.
//!
//! Settings are plain values built with [`BatchSettings::builder`] or loaded
//! from the environment with [`BatchSettings::from_env`]:
//!
//! | Variable | Setting |
//! |---|---|
//! | `ODATA_WIRE_BASE_URI` | base URI for relative operation URLs |
//! | `ODATA_WIRE_MAX_PARTS_PER_BATCH` | [`MessageQuotas::max_parts_per_batch`] |
//! | `ODATA_WIRE_MAX_OPERATIONS_PER_CHANGESET` | [`MessageQuotas::max_operations_per_changeset`] |
//! | `ODATA_WIRE_MAX_MESSAGE_SIZE` | [`MessageQuotas::max_received_message_size`] |

use crate::error::{BatchError, Result};
use crate::uri::{PayloadUriConverter, PayloadUriOption, SharedUriConverter, ensure_trailing_slash};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// Default environment variable prefix.
pub const ENV_PREFIX: &str = "ODATA_WIRE";

/// Limits enforced while reading and writing batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuotas {
    /// Maximum number of top-level parts (operations and changesets) in a batch.
    pub max_parts_per_batch: usize,
    /// Maximum number of operations in a single changeset.
    pub max_operations_per_changeset: usize,
    /// Maximum number of bytes read from a batch payload.
    pub max_received_message_size: u64,
}

impl Default for MessageQuotas {
    fn default() -> Self {
        Self {
            max_parts_per_batch: 100,
            max_operations_per_changeset: 1000,
            max_received_message_size: 1024 * 1024, // 1 MiB
        }
    }
}

impl MessageQuotas {
    /// Quotas with every limit disabled.
    pub fn unlimited() -> Self {
        Self {
            max_parts_per_batch: usize::MAX,
            max_operations_per_changeset: usize::MAX,
            max_received_message_size: u64::MAX,
        }
    }
}

/// Settings shared by batch readers and writers.
#[derive(Debug, Clone, Default)]
pub struct BatchSettings {
    /// Base URI relative operation URLs are resolved against.
    pub base_uri: Option<Url>,
    /// How request URLs are rendered on request lines.
    pub payload_uri_option: PayloadUriOption,
    /// Size and count limits.
    pub quotas: MessageQuotas,
    /// Custom URL converter consulted before default resolution.
    pub uri_converter: Option<SharedUriConverter>,
}

impl BatchSettings {
    /// Create a new settings builder.
    pub fn builder() -> BatchSettingsBuilder {
        BatchSettingsBuilder::default()
    }

    /// Load settings from `ODATA_WIRE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(&EnvLoader::new(ENV_PREFIX))
    }

    /// Load settings through a specific environment loader.
    pub fn from_env_with(loader: &EnvLoader) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(raw) = loader.var("BASE_URI") {
            let url = Url::parse(&raw).map_err(|e| BatchError::InvalidSetting {
                key: loader.key("BASE_URI"),
                message: e.to_string(),
            })?;
            settings.base_uri = Some(ensure_trailing_slash(url));
        }
        if let Some(max) = loader.parsed("MAX_PARTS_PER_BATCH")? {
            settings.quotas.max_parts_per_batch = max;
        }
        if let Some(max) = loader.parsed("MAX_OPERATIONS_PER_CHANGESET")? {
            settings.quotas.max_operations_per_changeset = max;
        }
        if let Some(max) = loader.parsed("MAX_MESSAGE_SIZE")? {
            settings.quotas.max_received_message_size = max;
        }
        Ok(settings)
    }

    pub(crate) fn converter(&self) -> Option<&dyn PayloadUriConverter> {
        self.uri_converter.as_ref().map(|c| c.0.as_ref())
    }
}

/// Builder for [`BatchSettings`].
#[derive(Debug, Default)]
pub struct BatchSettingsBuilder {
    settings: BatchSettings,
}

impl BatchSettingsBuilder {
    /// Set the base URI. A trailing slash is appended if missing.
    pub fn base_uri(mut self, base_uri: Url) -> Self {
        self.settings.base_uri = Some(ensure_trailing_slash(base_uri));
        self
    }

    /// Set how request URLs are written.
    pub fn payload_uri_option(mut self, option: PayloadUriOption) -> Self {
        self.settings.payload_uri_option = option;
        self
    }

    /// Replace all quotas.
    pub fn quotas(mut self, quotas: MessageQuotas) -> Self {
        self.settings.quotas = quotas;
        self
    }

    /// Set the maximum number of parts per batch.
    pub fn max_parts_per_batch(mut self, max: usize) -> Self {
        self.settings.quotas.max_parts_per_batch = max;
        self
    }

    /// Set the maximum number of operations per changeset.
    pub fn max_operations_per_changeset(mut self, max: usize) -> Self {
        self.settings.quotas.max_operations_per_changeset = max;
        self
    }

    /// Set the maximum payload size accepted by readers.
    pub fn max_received_message_size(mut self, max: u64) -> Self {
        self.settings.quotas.max_received_message_size = max;
        self
    }

    /// Install a custom URL converter.
    pub fn uri_converter(mut self, converter: impl PayloadUriConverter + 'static) -> Self {
        self.settings.uri_converter = Some(SharedUriConverter(Arc::new(converter)));
        self
    }

    /// Build the settings.
    pub fn build(self) -> BatchSettings {
        self.settings
    }
}

/// Prefixed environment variable lookup.
#[derive(Debug, Clone)]
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    /// Create a loader for `<prefix>_<KEY>` variables.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Full variable name for `key`.
    pub fn key(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.to_uppercase())
    }

    /// Raw variable value, if set and non-empty.
    pub fn var(&self, key: &str) -> Option<String> {
        env::var(self.key(key)).ok().filter(|v| !v.trim().is_empty())
    }

    /// Parsed variable value.
    pub fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.var(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| BatchError::InvalidSetting {
                    key: self.key(key),
                    message: e.to_string(),
                }),
        }
    }
}
