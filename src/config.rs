//! Heap configuration - sizing, heap kind, stub page layout
//!
//! Serializable settings load from TOML (`[heap]` and `[stubs]` tables) and
//! can be overridden from the environment:
//!
//! - `LOADER_HEAP_RESERVE_SIZE`: bytes reserved per fresh block
//! - `LOADER_HEAP_COMMIT_SIZE`: minimum bytes committed per step
//! - `LOADER_HEAP_STUB_PAGE_SIZE`: interleave stride of stub heaps
//! - `LOADER_HEAP_WX`: `0` disables write-xor-execute page handling

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// What the committed pages of a heap are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeapKind {
    /// Read-write data.
    #[default]
    Data,
    /// Generated code; pages are executable.
    Executable,
    /// Fixed-size stubs on code pages paired with data pages.
    Interleaved,
}

impl HeapKind {
    #[inline]
    pub fn is_executable(self) -> bool {
        matches!(self, Self::Executable | Self::Interleaved)
    }

    #[inline]
    pub fn is_interleaved(self) -> bool {
        self == Self::Interleaved
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapConfig {
    #[serde(default)]
    pub kind: HeapKind,

    /// Bytes to reserve whenever a fresh block is needed.
    #[serde(default = "default_reserve_block_size")]
    pub reserve_block_size: usize,

    /// Minimum bytes to commit per commit step.
    #[serde(default = "default_commit_block_size")]
    pub commit_block_size: usize,

    /// Keep executable pages non-writable.
    #[serde(default = "default_true")]
    pub wx_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubPageConfig {
    /// Size of one code page, and distance from a stub to its data.
    #[serde(default = "default_stub_page_size")]
    pub code_page_size: usize,

    /// Bytes to reserve whenever a fresh run of page pairs is needed.
    #[serde(default = "default_reserve_block_size")]
    pub reserve_block_size: usize,

    #[serde(default = "default_true")]
    pub wx_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub heap: HeapConfig,

    #[serde(default)]
    pub stubs: StubPageConfig,
}

fn default_reserve_block_size() -> usize {
    64 * 1024
}

fn default_commit_block_size() -> usize {
    4 * 1024
}

fn default_stub_page_size() -> usize {
    if cfg!(target_arch = "arm") {
        // 32-bit ARM cannot easily encode a 16KB pc-relative offset
        4 * 1024
    } else {
        16 * 1024
    }
}

fn default_true() -> bool {
    true
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            kind: HeapKind::Data,
            reserve_block_size: default_reserve_block_size(),
            commit_block_size: default_commit_block_size(),
            wx_enabled: true,
        }
    }
}

impl HeapConfig {
    pub fn new(kind: HeapKind) -> Self {
        Self { kind, ..Self::default() }
    }

    pub fn reserve_block_size(mut self, bytes: usize) -> Self {
        self.reserve_block_size = bytes;
        self
    }

    pub fn commit_block_size(mut self, bytes: usize) -> Self {
        self.commit_block_size = bytes;
        self
    }

    pub fn wx_enabled(mut self, enabled: bool) -> Self {
        self.wx_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reserve_block_size == 0 {
            return Err(ConfigError::Invalid("heap.reserve_block_size must be non-zero".into()));
        }
        if self.commit_block_size == 0 {
            return Err(ConfigError::Invalid("heap.commit_block_size must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for StubPageConfig {
    fn default() -> Self {
        Self {
            code_page_size: default_stub_page_size(),
            reserve_block_size: default_reserve_block_size(),
            wx_enabled: true,
        }
    }
}

impl StubPageConfig {
    pub fn code_page_size(mut self, bytes: usize) -> Self {
        self.code_page_size = bytes;
        self
    }

    pub fn reserve_block_size(mut self, bytes: usize) -> Self {
        self.reserve_block_size = bytes;
        self
    }

    pub fn wx_enabled(mut self, enabled: bool) -> Self {
        self.wx_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.code_page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "stubs.code_page_size must be a power of two, got {}",
                self.code_page_size
            )));
        }
        if self.reserve_block_size == 0 {
            return Err(ConfigError::Invalid("stubs.reserve_block_size must be non-zero".into()));
        }
        Ok(())
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// File (if any), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = var("LOADER_HEAP_RESERVE_SIZE") {
            let bytes = parse_size("LOADER_HEAP_RESERVE_SIZE", &value)?;
            self.heap.reserve_block_size = bytes;
            self.stubs.reserve_block_size = bytes;
        }
        if let Some(value) = var("LOADER_HEAP_COMMIT_SIZE") {
            self.heap.commit_block_size = parse_size("LOADER_HEAP_COMMIT_SIZE", &value)?;
        }
        if let Some(value) = var("LOADER_HEAP_STUB_PAGE_SIZE") {
            self.stubs.code_page_size = parse_size("LOADER_HEAP_STUB_PAGE_SIZE", &value)?;
        }
        if let Some(value) = var("LOADER_HEAP_WX") {
            let enabled = !(value == "0" || value.eq_ignore_ascii_case("false"));
            self.heap.wx_enabled = enabled;
            self.stubs.wx_enabled = enabled;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.heap.validate()?;
        self.stubs.validate()
    }
}

/// Decimal or `0x` hexadecimal byte count.
fn parse_size(name: &str, value: &str) -> Result<usize, ConfigError> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| ConfigError::Invalid(format!("{name}: not a byte count: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().expect("defaults validate");
        assert_eq!(settings.heap.kind, HeapKind::Data);
        assert_eq!(settings.heap.reserve_block_size, 64 * 1024);
        assert!(settings.stubs.code_page_size.is_power_of_two());
    }

    #[test]
    fn parses_partial_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [heap]
            kind = "executable"
            commit_block_size = 8192

            [stubs]
            code_page_size = 4096
            "#,
        )
        .expect("parse");

        assert_eq!(settings.heap.kind, HeapKind::Executable);
        assert_eq!(settings.heap.commit_block_size, 8192);
        assert_eq!(settings.heap.reserve_block_size, 64 * 1024);
        assert_eq!(settings.stubs.code_page_size, 4096);
        assert!(settings.stubs.wx_enabled);
    }

    #[test]
    fn rejects_bad_toml() {
        let err = Settings::from_toml_str("[heap]\nkind = \"bogus\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("LOADER_HEAP_RESERVE_SIZE", "0x20000"),
            ("LOADER_HEAP_COMMIT_SIZE", "16384"),
            ("LOADER_HEAP_WX", "0"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .expect("apply");

        assert_eq!(settings.heap.reserve_block_size, 0x20000);
        assert_eq!(settings.stubs.reserve_block_size, 0x20000);
        assert_eq!(settings.heap.commit_block_size, 16384);
        assert!(!settings.heap.wx_enabled);
        assert!(!settings.stubs.wx_enabled);
    }

    #[test]
    fn env_rejects_garbage() {
        let mut settings = Settings::default();
        let err = settings
            .apply_vars(|name| (name == "LOADER_HEAP_COMMIT_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn validation_catches_bad_sizes() {
        let mut settings = Settings::default();
        settings.stubs.code_page_size = 12 * 1024;
        assert!(settings.validate().is_err());

        let config = HeapConfig::default().commit_block_size(0);
        assert!(config.validate().is_err());
    }
}
