//! Linker configuration (`asmlink.toml`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::jit::Arch;

/// How out-of-bounds heap accesses are caught.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoundsChecks {
    /// Guard pages where the architecture supports them, explicit checks
    /// elsewhere.
    #[default]
    Auto,
    /// Reserve guard pages and leave bounds-check immediates alone.
    GuardPages,
    /// Patch every bounds-check immediate on heap attach.
    Explicit,
}

impl BoundsChecks {
    /// Whether a module created for `arch` relies on guard-page faults.
    pub fn uses_signal_handlers(self, arch: Arch) -> bool {
        match self {
            BoundsChecks::Auto => arch.supports_guard_pages(),
            BoundsChecks::GuardPages => {
                if !arch.supports_guard_pages() {
                    log::warn!("{:?} has no guard-page heaps, using explicit checks", arch);
                }
                arch.supports_guard_pages()
            }
            BoundsChecks::Explicit => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapConfig {
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub bounds_checks: BoundsChecks,
}

fn default_min_length() -> usize {
    64 * 1024
}

fn default_max_length() -> usize {
    1 << 31
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            max_length: default_max_length(),
            bounds_checks: BoundsChecks::Auto,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory for cache entries; defaults to `<tmp>/asmlink-cache`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("asmlink-cache"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilingConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub heap: HeapConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub profiling: ProfilingConfig,
}

impl LinkConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        let config: LinkConfig =
            toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))?;
        if config.heap.min_length > config.heap.max_length {
            return Err(format!(
                "heap.min_length ({}) exceeds heap.max_length ({})",
                config.heap.min_length, config.heap.max_length
            ));
        }
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::from_toml_str("").unwrap();
        assert_eq!(config.heap.min_length, 65536);
        assert_eq!(config.heap.max_length, 1 << 31);
        assert_eq!(config.heap.bounds_checks, BoundsChecks::Auto);
        assert!(!config.cache.enabled);
        assert!(!config.profiling.enabled);
    }

    #[test]
    fn test_parse_full() {
        let config = LinkConfig::from_toml_str(
            r#"
            [heap]
            min_length = 4096
            max_length = 16777216
            bounds_checks = "explicit"

            [cache]
            enabled = true
            dir = "/tmp/cache-test"

            [profiling]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.heap.min_length, 4096);
        assert_eq!(config.heap.bounds_checks, BoundsChecks::Explicit);
        assert_eq!(config.cache.dir(), PathBuf::from("/tmp/cache-test"));
        assert!(config.profiling.enabled);
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let err = LinkConfig::from_toml_str("[heap]\nmin_length = 10\nmax_length = 5\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_bounds_check_strategy() {
        assert!(BoundsChecks::Auto.uses_signal_handlers(Arch::X64));
        assert!(!BoundsChecks::Auto.uses_signal_handlers(Arch::X86));
        assert!(!BoundsChecks::GuardPages.uses_signal_handlers(Arch::X86));
        assert!(!BoundsChecks::Explicit.uses_signal_handlers(Arch::AArch64));
    }

    #[test]
    fn test_roundtrip_serialization() {
        let config = LinkConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("bounds_checks = \"auto\""));
        let back = LinkConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.heap.min_length, config.heap.min_length);
    }
}
