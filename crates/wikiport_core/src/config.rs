use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::archive::{DEFAULT_SPECIAL_MARKER, DEFAULT_WIKI_DIR, PageFilter};
use crate::entities::DEFAULT_UTC_OFFSET_HOURS;
use crate::ids::{DEFAULT_ID_BITS, IdGenerator};
use crate::markup::{ConvertOptions, LineBreak};
use crate::path_codec::{DEFAULT_LEGACY_ENCODING, InvalidBytes, LegacyCodec};

pub const DEFAULT_CONFIG_FILE: &str = "wikiport.toml";
pub const DEFAULT_PATH_PREFIX: &str = "pukiwiki";
pub const DEFAULT_AUTHOR_NAME: &str = "pukiwiki";
pub const DEFAULT_TARGET_VERSION: &str = "5.0.2";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExportConfig {
    #[serde(default)]
    pub export: ExportSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExportSection {
    pub path_prefix: Option<String>,
    pub author_name: Option<String>,
    pub target_version: Option<String>,
    pub wiki_dir: Option<String>,
    pub special_marker: Option<String>,
    pub legacy_encoding: Option<String>,
    pub invalid_bytes: Option<InvalidBytes>,
    pub line_break: Option<LineBreak>,
    pub id_bits: Option<u32>,
    pub utc_offset_hours: Option<i32>,
}

impl ExportConfig {
    /// Resolve the page path prefix: env WIKIPORT_PATH_PREFIX > config > default.
    pub fn path_prefix(&self) -> String {
        resolve(
            env_value("WIKIPORT_PATH_PREFIX"),
            self.export.path_prefix.as_deref(),
            DEFAULT_PATH_PREFIX,
        )
    }

    /// Resolve the author account name: env WIKIPORT_AUTHOR > config > default.
    pub fn author_name(&self) -> String {
        resolve(
            env_value("WIKIPORT_AUTHOR"),
            self.export.author_name.as_deref(),
            DEFAULT_AUTHOR_NAME,
        )
    }

    /// Resolve the bundle version tag: env WIKIPORT_TARGET_VERSION > config > default.
    pub fn target_version(&self) -> String {
        resolve(
            env_value("WIKIPORT_TARGET_VERSION"),
            self.export.target_version.as_deref(),
            DEFAULT_TARGET_VERSION,
        )
    }

    /// Resolve the legacy encoding label: env WIKIPORT_LEGACY_ENCODING > config > EUC-JP.
    pub fn legacy_encoding(&self) -> String {
        resolve(
            env_value("WIKIPORT_LEGACY_ENCODING"),
            self.export.legacy_encoding.as_deref(),
            DEFAULT_LEGACY_ENCODING,
        )
    }

    pub fn invalid_bytes(&self) -> InvalidBytes {
        self.export.invalid_bytes.unwrap_or_default()
    }

    pub fn line_break(&self) -> LineBreak {
        self.export.line_break.unwrap_or_default()
    }

    pub fn id_bits(&self) -> u32 {
        self.export.id_bits.unwrap_or(DEFAULT_ID_BITS)
    }

    pub fn utc_offset_hours(&self) -> i32 {
        self.export
            .utc_offset_hours
            .unwrap_or(DEFAULT_UTC_OFFSET_HOURS)
    }

    pub fn codec(&self) -> Result<LegacyCodec> {
        let label = self.legacy_encoding();
        LegacyCodec::from_label(&label, self.invalid_bytes())
            .with_context(|| format!("invalid legacy_encoding {label:?}"))
    }

    pub fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            line_break: self.line_break(),
        }
    }

    pub fn id_generator(&self) -> IdGenerator {
        IdGenerator::with_bits(self.id_bits())
    }

    pub fn page_filter(&self) -> PageFilter {
        PageFilter {
            wiki_dir: self
                .export
                .wiki_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_WIKI_DIR.to_string()),
            special_marker: self
                .export
                .special_marker
                .clone()
                .unwrap_or_else(|| DEFAULT_SPECIAL_MARKER.to_string()),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Non-blank env value wins, then the configured value, then the default.
fn resolve(env_value: Option<String>, configured: Option<&str>, default: &str) -> String {
    if let Some(value) = env_value {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    configured.unwrap_or(default).to_string()
}

/// Load and parse an ExportConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ExportConfig> {
    if !config_path.exists() {
        return Ok(ExportConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ExportConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
