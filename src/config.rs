use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no source url configured")]
    NoSource,
    #[error("session duration must be greater than zero")]
    ZeroDuration,
    #[error("{codec} unit type {unit_type} is out of range (max {max})")]
    InvalidUnitType {
        codec: &'static str,
        unit_type: u8,
        max: u8,
    },
    #[error("slice range is empty: min {min} > max {max}")]
    InvalidSliceRange { min: u32, max: u32 },
}

fn default_transport() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_transport")]
    pub transport: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            transport: default_transport(),
        }
    }
}

fn default_duration_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
        }
    }
}

fn default_discontinuity_tolerance_ms() -> f64 {
    1000.0
}

fn default_reorder_window_ms() -> f64 {
    500.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriftConfig {
    /// Largest forward timestamp step (ms) not treated as a discontinuity.
    #[serde(default = "default_discontinuity_tolerance_ms")]
    pub discontinuity_tolerance_ms: f64,
    /// Packets without a DTS may fall this far (ms) behind the latest
    /// presentation time before it counts as a backward reset.
    #[serde(default = "default_reorder_window_ms")]
    pub reorder_window_ms: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            discontinuity_tolerance_ms: default_discontinuity_tolerance_ms(),
            reorder_window_ms: default_reorder_window_ms(),
        }
    }
}

fn default_min_h264_unit_size() -> usize {
    4
}

fn default_min_h265_unit_size() -> usize {
    5
}

fn default_min_audio_unit_size() -> usize {
    1
}

fn default_min_slices() -> u32 {
    1
}

fn default_max_slices() -> u32 {
    256
}

fn default_min_bytes_per_slice() -> usize {
    4
}

fn default_max_retained_payloads() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorruptionConfig {
    #[serde(default = "default_min_h264_unit_size")]
    pub min_h264_unit_size: usize,
    #[serde(default = "default_min_h265_unit_size")]
    pub min_h265_unit_size: usize,
    #[serde(default = "default_min_audio_unit_size")]
    pub min_audio_unit_size: usize,
    #[serde(default = "default_min_slices")]
    pub min_slices: u32,
    #[serde(default = "default_max_slices")]
    pub max_slices: u32,
    /// Smallest plausible slice; caps the slice count for small payloads.
    #[serde(default = "default_min_bytes_per_slice")]
    pub min_bytes_per_slice: usize,
    /// Keep payloads of corrupted packets on the session for forensic dumps.
    #[serde(default)]
    pub retain_payloads: bool,
    /// Payloads kept per session; later corrupted packets are only counted.
    #[serde(default = "default_max_retained_payloads")]
    pub max_retained_payloads: usize,
}

impl Default for CorruptionConfig {
    fn default() -> Self {
        Self {
            min_h264_unit_size: default_min_h264_unit_size(),
            min_h265_unit_size: default_min_h265_unit_size(),
            min_audio_unit_size: default_min_audio_unit_size(),
            min_slices: default_min_slices(),
            max_slices: default_max_slices(),
            min_bytes_per_slice: default_min_bytes_per_slice(),
            retain_payloads: false,
            max_retained_payloads: default_max_retained_payloads(),
        }
    }
}

/// What a NAL unit type contributes to the frame type of its packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitClass {
    I,
    P,
    B,
    /// Slice whose frame type is read from its slice header.
    SliceHeader,
    Ignore,
}

impl UnitClass {
    pub fn is_slice(self) -> bool {
        !matches!(self, UnitClass::Ignore)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UnitMapping {
    pub unit_type: u8,
    pub class: UnitClass,
}

/// Unit-type to frame-type mapping for one codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeTable {
    classes: [UnitClass; 64],
}

impl TypeTable {
    pub fn h264() -> Self {
        let mut classes = [UnitClass::Ignore; 64];
        classes[1] = UnitClass::SliceHeader;
        classes[2] = UnitClass::SliceHeader;
        classes[5] = UnitClass::I;
        Self { classes }
    }

    pub fn h265() -> Self {
        let mut classes = [UnitClass::Ignore; 64];
        for class in classes.iter_mut().take(10) {
            *class = UnitClass::SliceHeader;
        }
        for class in classes.iter_mut().take(22).skip(16) {
            *class = UnitClass::I;
        }
        Self { classes }
    }

    pub fn class_of(&self, unit_type: u8) -> UnitClass {
        self.classes
            .get(unit_type as usize)
            .copied()
            .unwrap_or(UnitClass::Ignore)
    }

    fn apply(
        mut self,
        codec: &'static str,
        max: u8,
        overrides: &[UnitMapping],
    ) -> Result<Self, ConfigError> {
        for mapping in overrides {
            if mapping.unit_type > max {
                return Err(ConfigError::InvalidUnitType {
                    codec,
                    unit_type: mapping.unit_type,
                    max,
                });
            }
            self.classes[mapping.unit_type as usize] = mapping.class;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecTables {
    pub h264: TypeTable,
    pub h265: TypeTable,
}

impl Default for CodecTables {
    fn default() -> Self {
        Self {
            h264: TypeTable::h264(),
            h265: TypeTable::h265(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodecOverrides {
    #[serde(default)]
    pub h264: Vec<UnitMapping>,
    #[serde(default)]
    pub h265: Vec<UnitMapping>,
}

impl CodecOverrides {
    pub fn tables(&self) -> Result<CodecTables, ConfigError> {
        Ok(CodecTables {
            h264: TypeTable::h264().apply("h264", 31, &self.h264)?,
            h265: TypeTable::h265().apply("h265", 63, &self.h265)?,
        })
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub flow_log: bool,
    #[serde(default = "default_true")]
    pub forensic: bool,
    #[serde(default = "default_true")]
    pub save_stream: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            flow_log: true,
            forensic: true,
            save_stream: true,
        }
    }
}

/// Everything the analysis core consumes, supplied explicitly at session creation.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub duration: Duration,
    pub drift: DriftConfig,
    pub corruption: CorruptionConfig,
    pub codecs: CodecTables,
}

impl AnalysisConfig {
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration,
            drift: DriftConfig::default(),
            corruption: CorruptionConfig::default(),
            codecs: CodecTables::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub corruption: CorruptionConfig,
    #[serde(default)]
    pub codecs: CodecOverrides,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Like `load_from`, but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load_from(path) {
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Config::default())
            }
            other => other,
        }
    }

    pub fn source_url(&self) -> Result<&str, ConfigError> {
        self.source
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::NoSource)
    }

    pub fn analysis(&self) -> Result<AnalysisConfig, ConfigError> {
        if self.session.duration_secs == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        if self.corruption.min_slices > self.corruption.max_slices {
            return Err(ConfigError::InvalidSliceRange {
                min: self.corruption.min_slices,
                max: self.corruption.max_slices,
            });
        }

        let mut corruption = self.corruption.clone();
        corruption.retain_payloads |= self.output.forensic;

        Ok(AnalysisConfig {
            duration: Duration::from_secs(self.session.duration_secs),
            drift: self.drift.clone(),
            corruption,
            codecs: self.codecs.tables()?,
        })
    }
}
