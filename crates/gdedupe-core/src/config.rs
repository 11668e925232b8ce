//! Class-wide configuration and per-device options.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::block::DEFAULT_BLOCK_SIZE;
use crate::content_store::ContentStoreConfig;
use crate::error::{DedupeError, DedupeResult};

/// Configuration of a dedupe class instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// Dedupe block size in bytes (power of two, multiple of every sector size)
    pub block_size: u32,
    /// Content store hash index buckets (power of two)
    pub hash_buckets: usize,
    /// Range lock stripes per device
    pub lock_stripes: usize,
    /// Byte-compare content on every hash hit
    pub verify_on_dedupe: bool,
    /// Re-hash content on every read
    pub verify_on_read: bool,
    /// Forward a delete to the backing provider when a block is reclaimed
    pub discard_on_release: bool,
    /// Initial debug level
    pub debug_level: u32,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            hash_buckets: 64,
            lock_stripes: 256,
            verify_on_dedupe: false,
            verify_on_read: false,
            discard_on_release: false,
            debug_level: 0,
        }
    }
}

impl DedupeConfig {
    /// Load from a `.toml` or `.json` file, by extension.
    pub fn from_file(path: &Path) -> DedupeResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DedupeError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DedupeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| DedupeError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| DedupeError::Config(e.to_string()))?
            }
            _ => {
                return Err(DedupeError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check sizes are usable.
    pub fn validate(&self) -> DedupeResult<()> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(DedupeError::Config(format!(
                "block_size {} must be a power of two >= 512",
                self.block_size
            )));
        }
        if self.hash_buckets == 0 || !self.hash_buckets.is_power_of_two() {
            return Err(DedupeError::Config(format!(
                "hash_buckets {} must be a power of two",
                self.hash_buckets
            )));
        }
        if self.lock_stripes == 0 {
            return Err(DedupeError::Config("lock_stripes must be > 0".into()));
        }
        Ok(())
    }

    /// Content store settings derived from this config.
    pub fn store_config(&self) -> ContentStoreConfig {
        ContentStoreConfig {
            block_size: self.block_size,
            hash_buckets: self.hash_buckets,
            verify_on_dedupe: self.verify_on_dedupe,
            verify_on_read: self.verify_on_read,
            discard_on_release: self.discard_on_release,
        }
    }
}

/// Options of one device, changeable with `configure`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOptions {
    /// Percent of reads to fail (0..=100)
    pub read_fail_prob: u32,
    /// Percent of writes to fail (0..=100)
    pub write_fail_prob: u32,
    /// Re-hash content returned to readers of this device
    pub verify_on_read: bool,
}

impl DeviceOptions {
    /// Apply `key=value` settings. Keys: `rfailprob`, `wfailprob`, `verify_on_read`.
    ///
    /// Nothing is changed unless every setting parses.
    pub fn apply<S: AsRef<str>>(&self, settings: &[S]) -> DedupeResult<DeviceOptions> {
        let mut next = *self;
        for setting in settings {
            let setting = setting.as_ref();
            let (key, value) = setting
                .split_once('=')
                .ok_or_else(|| DedupeError::invalid(format!("expected key=value, got {:?}", setting)))?;
            let percent = || -> DedupeResult<u32> {
                let v: u32 = value
                    .trim()
                    .parse()
                    .map_err(|_| DedupeError::invalid(format!("{}: not a number: {:?}", key, value)))?;
                if v > 100 {
                    return Err(DedupeError::invalid(format!("{}: {} is over 100", key, v)));
                }
                Ok(v)
            };
            match key.trim() {
                "rfailprob" => next.read_fail_prob = percent()?,
                "wfailprob" => next.write_fail_prob = percent()?,
                "verify_on_read" => {
                    next.verify_on_read = match value.trim() {
                        "1" | "true" | "on" | "yes" => true,
                        "0" | "false" | "off" | "no" => false,
                        v => {
                            return Err(DedupeError::invalid(format!(
                                "verify_on_read: not a boolean: {:?}",
                                v
                            )))
                        }
                    }
                }
                other => {
                    return Err(DedupeError::invalid(format!("unknown option {:?}", other)));
                }
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = DedupeConfig::default();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.hash_buckets, 64);
        assert_eq!(config.lock_stripes, 256);
        assert!(!config.verify_on_dedupe);
        assert_eq!(config.debug_level, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
block_size = 8192
verify_on_dedupe = true
debug_level = 2
            "#
        )
        .unwrap();

        let config = DedupeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.block_size, 8192);
        assert!(config.verify_on_dedupe);
        assert_eq!(config.debug_level, 2);
        assert_eq!(config.hash_buckets, 64);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{ "hash_buckets": 16, "lock_stripes": 8 }}"#).unwrap();

        let config = DedupeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.hash_buckets, 16);
        assert_eq!(config.lock_stripes, 8);
        assert_eq!(config.block_size, 4096);
    }

    #[test]
    fn test_from_file_rejects_bad_values() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "block_size = 1000").unwrap();
        assert!(matches!(
            DedupeConfig::from_file(file.path()),
            Err(DedupeError::Config(_))
        ));
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(DedupeConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_store_config() {
        let config = DedupeConfig {
            discard_on_release: true,
            ..DedupeConfig::default()
        };
        let store = config.store_config();
        assert!(store.discard_on_release);
        assert_eq!(store.block_size, 4096);
    }

    #[test]
    fn test_device_options_apply() {
        let opts = DeviceOptions::default()
            .apply(&["rfailprob=10", "wfailprob=100"])
            .unwrap();
        assert_eq!(opts.read_fail_prob, 10);
        assert_eq!(opts.write_fail_prob, 100);
        assert!(!opts.verify_on_read);

        let opts = opts.apply(&["verify_on_read=on"]).unwrap();
        assert!(opts.verify_on_read);
        assert_eq!(opts.read_fail_prob, 10);
    }

    #[test]
    fn test_device_options_reject_all_or_nothing() {
        let opts = DeviceOptions::default();
        assert!(opts.apply(&["rfailprob=10", "bogus=1"]).is_err());
        assert!(opts.apply(&["wfailprob=101"]).is_err());
        assert!(opts.apply(&["wfailprob"]).is_err());
        assert!(opts.apply(&["rfailprob=x"]).is_err());
        assert!(opts.apply(&["verify_on_read=maybe"]).is_err());
        assert_eq!(opts, DeviceOptions::default());
    }
}
