//! Channel-group readers
//!
//! A reader turns one channel-group file into raw samples. The conversion only
//! depends on the [`ChannelGroupReader`] trait; [`EdfReader`] is the
//! implementation for the wearable's EDF exports.

mod edf;

pub use edf::EdfReader;

use chrono::NaiveDateTime;
use ndarray::Array2;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::LoadError;
use crate::types::{ChannelGroupSample, Modality};

/// Raw contents of one channel-group file
#[derive(Debug, Clone)]
pub struct RawRecording {
    /// Samples x signals, physical units
    pub samples: Array2<f32>,
    /// Sample rate (Hz)
    pub sample_rate: f64,
    /// Civil start of the first sample
    pub start_local: NaiveDateTime,
    /// Recorded duration (seconds)
    pub duration_secs: f64,
}

/// Trait for channel-group file readers
pub trait ChannelGroupReader: Send + Sync {
    /// Read a whole file
    fn read(&self, path: &Path) -> Result<RawRecording, LoadError>;

    /// Read only the civil start time
    fn read_start(&self, path: &Path) -> Result<NaiveDateTime, LoadError> {
        Ok(self.read(path)?.start_local)
    }
}

/// Session directories of a patient: the leaf directories under
/// `patient_dir`, sorted by directory name, then by path. Hidden
/// directories are skipped.
pub fn find_sessions(patient_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut sessions = Vec::new();
    let mut stack = vec![patient_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut children = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden && entry.file_type()?.is_dir() {
                children.push(entry.path());
            }
        }
        if children.is_empty() {
            if dir != patient_dir {
                sessions.push(dir);
            }
        } else {
            stack.extend(children);
        }
    }
    // Session directory names are start timestamps
    sessions.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    Ok(sessions)
}

/// Load one modality of a session, checking it against the configured layout.
pub fn load_channel_group(
    reader: &dyn ChannelGroupReader,
    config: &Config,
    session_dir: &Path,
    modality: Modality,
) -> Result<ChannelGroupSample, LoadError> {
    let path = config.channel_file(session_dir, modality);
    if !path.is_file() {
        return Err(LoadError::Missing(path));
    }
    let raw = reader.read(&path)?;

    let expected = modality.columns().len();
    if raw.samples.ncols() != expected {
        return Err(LoadError::unsupported(
            &path,
            format!(
                "{} signals, expected {} for {}",
                raw.samples.ncols(),
                expected,
                modality.file_stem()
            ),
        ));
    }
    if (raw.sample_rate - config.sample_rate as f64).abs() > 1e-9 {
        return Err(LoadError::unsupported(
            &path,
            format!(
                "sample rate {} Hz, expected {} Hz",
                raw.sample_rate, config.sample_rate
            ),
        ));
    }
    if raw.samples.nrows() == 0 {
        return Err(LoadError::corrupt(&path, "no samples"));
    }

    Ok(ChannelGroupSample {
        modality,
        data: raw.samples,
        sample_rate: raw.sample_rate,
        start_local: raw.start_local,
    })
}

/// Load every modality of a session; failures are returned per modality.
pub fn load_session(
    reader: &dyn ChannelGroupReader,
    config: &Config,
    session_dir: &Path,
) -> Vec<(Modality, Result<ChannelGroupSample, LoadError>)> {
    Modality::ALL
        .iter()
        .map(|&m| (m, load_channel_group(reader, config, session_dir, m)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_edf, EdfSpec};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 5, 4)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap()
    }

    #[test]
    fn test_find_sessions_orders_by_session_name() {
        let dir = tempdir().unwrap();
        for p in ["b/2021_02", "a/2021_01", "a/2021_03", "b/2021_03", ".hidden/x"] {
            std::fs::create_dir_all(dir.path().join(p)).unwrap();
        }
        std::fs::write(dir.path().join("a/notes.txt"), b"x").unwrap();
        let sessions = find_sessions(dir.path()).unwrap();
        let names: Vec<String> = sessions
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["a/2021_01", "b/2021_02", "a/2021_03", "b/2021_03"]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let result = load_channel_group(&EdfReader, &config, dir.path(), Modality::Hr);
        assert!(matches!(result, Err(LoadError::Missing(_))));
    }

    #[test]
    fn test_wrong_signal_count_unsupported() {
        let dir = tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let path = config.channel_file(dir.path(), Modality::Acc);
        write_edf(&path, &EdfSpec::new(start(), 2, 128, 1)).unwrap();
        let result = load_channel_group(&EdfReader, &config, dir.path(), Modality::Acc);
        assert!(matches!(result, Err(LoadError::Unsupported { .. })));
    }

    #[test]
    fn test_wrong_rate_unsupported() {
        let dir = tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let path = config.channel_file(dir.path(), Modality::Hr);
        write_edf(&path, &EdfSpec::new(start(), 2, 64, 1)).unwrap();
        let result = load_channel_group(&EdfReader, &config, dir.path(), Modality::Hr);
        assert!(matches!(result, Err(LoadError::Unsupported { .. })));
    }

    #[test]
    fn test_load_session_reports_each_modality() {
        let dir = tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let path = config.channel_file(dir.path(), Modality::Temp);
        write_edf(&path, &EdfSpec::new(start(), 3, 128, 1)).unwrap();

        let loaded = load_session(&EdfReader, &config, dir.path());
        assert_eq!(loaded.len(), 5);
        let temp = loaded
            .iter()
            .find(|(m, _)| *m == Modality::Temp)
            .map(|(_, r)| r.as_ref().unwrap())
            .unwrap();
        assert_eq!(temp.n_samples(), 3 * 128);
        assert_eq!(temp.start_local, start());
        assert_eq!(
            loaded.iter().filter(|(_, r)| r.is_err()).count(),
            4
        );
    }
}
