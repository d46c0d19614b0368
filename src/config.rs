//! Pipeline configuration
//!
//! [`Config`] replaces the process-wide path roots and patient registry with
//! one value that is handed to every component. Defaults match the
//! production dataset layout: 128 Hz samples, hour padding, hour buckets,
//! `US/Central` local clocks.

use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::Modality;

/// Default sample rate of every channel group (Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 128;

/// Default civil timezone of the recording device clocks
pub const DEFAULT_TIMEZONE: &str = "US/Central";

/// Boundary granularity used for padding and for chunk buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
}

impl Granularity {
    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::Minute => 60,
            Granularity::Hour => 3600,
        }
    }
}

/// How modality spans are combined into one session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinPolicy {
    /// Union of all modality spans, NaN where a modality has no data
    Outer,
    /// Intersection of the spans of the modalities that were read
    Inner,
}

/// Resolution of a local time that occurs twice on the fall-back night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguityPolicy {
    /// Daylight time, the first occurrence
    Earliest,
    /// Standard time, the second occurrence
    Latest,
}

/// Full configuration for conversion, splitting, labelling and auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the raw recordings: `<raw_root>/<patient>/.../<session>/<file>`
    pub raw_root: PathBuf,
    /// Root of the chunked output: `<chunk_root>/<patient>/[<split>/]<index>/`
    pub chunk_root: PathBuf,
    /// Directory holding `<patient>.csv` seizure tables
    pub seizure_root: PathBuf,
    /// Directory for reports and label tables
    pub artifacts_root: PathBuf,
    /// Registered patient ids; anything else is rejected
    pub patient_ids: Vec<String>,
    /// Split names in assignment order
    pub split_names: Vec<String>,
    /// Channel file name prefix, e.g. `Empatica-` in `Empatica-ACC.edf`
    pub file_prefix: String,
    /// Channel file extension without the dot
    pub file_extension: String,
    /// Sample rate every channel group must have (Hz)
    pub sample_rate: u32,
    /// Padding granularity of session tables
    pub padding: Granularity,
    /// Bucket size of persisted chunks
    pub bucket: Granularity,
    pub join: JoinPolicy,
    /// IANA name of the civil timezone of device clocks
    pub timezone: String,
    pub ambiguity: AmbiguityPolicy,
    /// Known fall-back instants (local) checked by the audit
    pub ambiguous_times: Vec<NaiveDateTime>,
    /// Warn when modality start or end times spread more than this (s)
    pub start_spread_warn_secs: f64,
    /// Worker threads for conversion; `None` uses the global rayon pool
    pub workers: Option<usize>,
    /// Default forecast window (s)
    pub forecast_window: i64,
    /// Default gap between forecast window and onset (s)
    pub setback: i64,
    /// Default minimum spacing for a seizure to count as a lead seizure (s)
    pub lead_gap: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            raw_root: PathBuf::from("data/edf"),
            chunk_root: PathBuf::from("data/chunks"),
            seizure_root: PathBuf::from("data/sztimes"),
            artifacts_root: PathBuf::from("data/artifacts"),
            patient_ids: ["1110", "1869", "1876", "1904", "1965", "2002"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            split_names: ["train", "test", "val"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            file_prefix: "Empatica-".to_string(),
            file_extension: "edf".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            padding: Granularity::Hour,
            bucket: Granularity::Hour,
            join: JoinPolicy::Outer,
            timezone: DEFAULT_TIMEZONE.to_string(),
            ambiguity: AmbiguityPolicy::Latest,
            ambiguous_times: default_ambiguous_times(),
            start_spread_warn_secs: 5.0,
            workers: None,
            forecast_window: 60 * 60,
            setback: 15 * 60,
            lead_gap: 4 * 60 * 60,
        }
    }
}

/// The repeated 01:00 local hour of each US fall-back night in the dataset.
pub fn default_ambiguous_times() -> Vec<NaiveDateTime> {
    [(2019, 11, 3), (2020, 11, 1), (2021, 11, 7), (2022, 11, 6)]
        .iter()
        .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)?.and_hms_opt(1, 0, 0))
        .collect()
}

impl Config {
    /// Config with every directory placed under one root.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            raw_root: root.join("edf"),
            chunk_root: root.join("chunks"),
            seizure_root: root.join("sztimes"),
            artifacts_root: root.join("artifacts"),
            ..Self::default()
        }
    }

    /// Load configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        if self.split_names.len() < 2 {
            return Err(ConfigError::Invalid(
                "at least two split names are required".into(),
            ));
        }
        for name in &self.split_names {
            if name.is_empty() || name.starts_with('.') || name.chars().all(|c| c.is_ascii_digit()) {
                return Err(ConfigError::Invalid(format!(
                    "split name {name:?} collides with session directory names"
                )));
            }
        }
        if self.forecast_window <= 0 || self.setback < 0 || self.lead_gap < 0 {
            return Err(ConfigError::Invalid(
                "forecast_window must be positive, setback and lead_gap non-negative".into(),
            ));
        }
        self.tz()?;
        Ok(())
    }

    /// Parsed civil timezone.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }

    pub fn is_registered(&self, patient_id: &str) -> bool {
        self.patient_ids.iter().any(|p| p == patient_id)
    }

    pub fn is_split_name(&self, name: &str) -> bool {
        self.split_names.iter().any(|s| s == name)
    }

    /// `<raw_root>/<patient>`
    pub fn raw_patient_dir(&self, patient_id: &str) -> PathBuf {
        self.raw_root.join(patient_id)
    }

    /// `<chunk_root>/<patient>`
    pub fn chunk_patient_dir(&self, patient_id: &str) -> PathBuf {
        self.chunk_root.join(patient_id)
    }

    /// `<chunk_root>/<patient>/<split>`
    pub fn split_dir(&self, patient_id: &str, split: &str) -> PathBuf {
        self.chunk_patient_dir(patient_id).join(split)
    }

    /// `<session_dir>/<prefix><MODALITY>.<ext>`
    pub fn channel_file(&self, session_dir: &Path, modality: Modality) -> PathBuf {
        session_dir.join(format!(
            "{}{}.{}",
            self.file_prefix,
            modality.file_stem(),
            self.file_extension
        ))
    }

    pub fn seizure_file(&self, patient_id: &str) -> PathBuf {
        self.seizure_root.join(format!("{patient_id}.csv"))
    }

    pub fn dodgy_report(&self, patient_id: &str) -> PathBuf {
        self.artifacts_root.join(patient_id).join("dodgy_files.txt")
    }

    pub fn labels_file(&self, patient_id: &str, split: &str) -> PathBuf {
        self.artifacts_root
            .join(format!("{patient_id}_{split}_labels.csv"))
    }
}

/// Zero-padded session directory name from its chronological index.
pub fn session_index_name(index: usize) -> String {
    format!("{index:03}")
}
