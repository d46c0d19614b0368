//! Forecast labels
//!
//! A chunk is positive when its start falls in the forecast window that ends
//! `setback` seconds before a lead seizure. Positive minutes that are not
//! already a chunk start get an augmented chunk cut from two neighbouring
//! buckets of the same session.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::chunker::{ChunkFile, Chunker};
use crate::config::Config;
use crate::error::{pipeline_io, ChunkError, IoContext, PipelineError};
use crate::seizures::load_seizures;
use crate::split::session_dirs;
use crate::types::{LabelRecord, SessionTable};

/// Forecast window parameters (seconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub forecast_window: i64,
    pub setback: i64,
    pub lead_gap: i64,
}

impl WindowParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            forecast_window: config.forecast_window,
            setback: config.setback,
            lead_gap: config.lead_gap,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.forecast_window <= 0 {
            return Err(PipelineError::InvalidWindow(format!(
                "forecast window {}s must be positive",
                self.forecast_window
            )));
        }
        if self.setback < 0 || self.lead_gap < 0 {
            return Err(PipelineError::InvalidWindow(
                "setback and lead gap must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of labelling one split
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitLabels {
    pub split: String,
    pub path: PathBuf,
    pub records: usize,
    pub positives: usize,
    pub augmented: usize,
}

fn floor_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    // Truncation only fails for instants outside the nanosecond range
    t.duration_trunc(TimeDelta::minutes(1)).unwrap_or(t)
}

/// Onsets that follow the previous onset by at least `lead_gap` seconds.
/// The first onset is always kept.
pub fn lead_seizures(onsets: &[DateTime<Utc>], lead_gap: i64) -> Vec<DateTime<Utc>> {
    let mut sorted = onsets.to_vec();
    sorted.sort();
    let gap = TimeDelta::seconds(lead_gap);
    sorted
        .iter()
        .enumerate()
        .filter(|(i, t)| *i == 0 || **t - sorted[i - 1] >= gap)
        .map(|(_, t)| *t)
        .collect()
}

/// Minute floors of every instant in `(T - setback - forecast_window, T - setback]`
/// for each onset `T`.
///
/// This is the set `floor_minute(T - setback - k)` for `k` in
/// `[0, forecast_window)`. For an onset on a whole minute it has one more
/// minute than the half-open window `[T - setback - forecast_window, T - setback)`:
/// the minute starting at `T - setback` is positive too.
pub fn positive_times(onsets: &[DateTime<Utc>], params: &WindowParams) -> BTreeSet<DateTime<Utc>> {
    let mut positives = BTreeSet::new();
    for &onset in onsets {
        let end = onset - TimeDelta::seconds(params.setback);
        let first = floor_minute(end - TimeDelta::seconds(params.forecast_window) + TimeDelta::nanoseconds(1));
        let last = floor_minute(end);
        let mut t = first;
        while t <= last {
            positives.insert(t);
            t += TimeDelta::minutes(1);
        }
    }
    positives
}

/// Chunks of one session directory in a split
struct SessionChunks {
    dir: PathBuf,
    chunks: Vec<ChunkFile>,
}

impl SessionChunks {
    fn find(&self, start: DateTime<Utc>) -> Option<&ChunkFile> {
        self.chunks.iter().find(|c| c.start == start)
    }
}

pub struct Labeler<'a> {
    config: &'a Config,
    chunker: &'a Chunker,
}

impl<'a> Labeler<'a> {
    pub fn new(config: &'a Config, chunker: &'a Chunker) -> Self {
        Self { config, chunker }
    }

    fn check_splits(&self, patient_id: &str) -> Result<(), PipelineError> {
        if !self.config.is_registered(patient_id) {
            return Err(PipelineError::UnknownPatient(patient_id.to_string()));
        }
        let missing: Vec<String> = self
            .config
            .split_names
            .iter()
            .take(2)
            .filter(|s| !self.config.split_dir(patient_id, s).is_dir())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::MissingSplits {
                patient: patient_id.to_string(),
                missing,
            });
        }
        Ok(())
    }

    fn existing_splits(&self, patient_id: &str) -> Vec<String> {
        self.config
            .split_names
            .iter()
            .filter(|s| self.config.split_dir(patient_id, s).is_dir())
            .cloned()
            .collect()
    }

    fn load_split(&self, split_dir: &Path) -> Result<Vec<SessionChunks>, PipelineError> {
        session_dirs(self.config, split_dir)?
            .into_iter()
            .map(|dir| {
                let chunks = self.chunker.list(&dir)?;
                Ok::<_, PipelineError>(SessionChunks { dir, chunks })
            })
            .collect()
    }

    fn relative_path(&self, patient_id: &str, split: &str, path: &Path) -> String {
        let session = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{patient_id}/{split}/{session}/{file}")
    }

    /// Label every existing split of a patient, synthesizing augmented
    /// chunks for positive minutes between bucket starts.
    pub fn label(&self, patient_id: &str, params: &WindowParams) -> Result<Vec<SplitLabels>, PipelineError> {
        params.validate()?;
        self.check_splits(patient_id)?;
        let seizures = load_seizures(&self.config.seizure_file(patient_id))?;
        let onsets: Vec<DateTime<Utc>> = seizures.iter().map(|s| s.utc).collect();
        let leads = lead_seizures(&onsets, params.lead_gap);
        log::info!(
            "{}: {} of {} seizures are lead seizures",
            patient_id,
            leads.len(),
            onsets.len()
        );
        let positives = positive_times(&leads, params);

        let mut results = Vec::new();
        for split in self.existing_splits(patient_id) {
            log::info!("Creating labels for {} {} split", patient_id, split);
            let split_dir = self.config.split_dir(patient_id, &split);
            let mut sessions = self.load_split(&split_dir)?;
            let augmented = self.augment(&mut sessions, &positives)?;

            let mut records: Vec<LabelRecord> = sessions
                .iter()
                .flat_map(|s| s.chunks.iter())
                .map(|c| LabelRecord {
                    filepath: self.relative_path(patient_id, &split, &c.path),
                    label: positives.contains(&c.start) as u8,
                })
                .collect();
            records.sort_by(|a, b| a.filepath.cmp(&b.filepath));

            let n_positive = records.iter().filter(|r| r.label == 1).count();
            if n_positive == 0 {
                log::warn!("No positive labels for {} {}", patient_id, split);
            }
            let path = self.config.labels_file(patient_id, &split);
            write_labels(&path, &records)?;
            results.push(SplitLabels {
                split,
                path,
                records: records.len(),
                positives: n_positive,
                augmented,
            });
        }
        Ok(results)
    }

    /// Cut a chunk for every positive minute that is not yet a chunk start.
    fn augment(
        &self,
        sessions: &mut [SessionChunks],
        positives: &BTreeSet<DateTime<Utc>>,
    ) -> Result<usize, PipelineError> {
        let grid = self.chunker.grid();
        let bucket = self.chunker.bucket();
        let step = TimeDelta::seconds(bucket.seconds());
        let mut present: BTreeSet<DateTime<Utc>> = sessions
            .iter()
            .flat_map(|s| s.chunks.iter().map(|c| c.start))
            .collect();

        let mut cache: Option<(PathBuf, SessionTable)> = None;
        let mut created = 0;
        for &ts in positives {
            if present.contains(&ts) {
                continue;
            }
            let tick = grid.tick_of(ts);
            let containing = grid.instant_of(grid.floor(tick, bucket));
            let pair = sessions.iter().enumerate().find_map(|(i, s)| {
                let a = s.find(containing)?;
                let b = s.find(containing + step)?;
                Some((i, a.path.clone(), b.path.clone()))
            });
            let Some((idx, a, b)) = pair else {
                log::debug!("No neighbouring chunks for {}", ts);
                continue;
            };

            if cache.as_ref().map_or(true, |(key, _)| *key != a) {
                match self.chunker.join(&a, &b) {
                    Ok(table) => cache = Some((a.clone(), table)),
                    Err(ChunkError::NotAdjacent(_, _)) => {
                        log::debug!("Chunks around {} are not continuous", ts);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            let Some((_, joined)) = &cache else {
                continue;
            };
            let window = joined.slice_ticks(tick, tick + grid.step(bucket));
            if window.start_tick != tick || window.rows() as i64 != grid.step(bucket) {
                log::debug!("Chunks around {} do not cover a full window", ts);
                continue;
            }

            let session = &mut sessions[idx];
            let path = session.dir.join(self.chunker.file_name(ts));
            self.chunker.write_chunk(&path, &window)?;
            session.chunks.push(ChunkFile { start: ts, path });
            present.insert(ts);
            created += 1;
        }
        if created > 0 {
            log::info!("Created {} augmented chunks", created);
        }
        Ok(created)
    }

    /// Remove augmented chunks from every split and drop their label rows.
    /// Returns the number of files removed.
    pub fn clean(&self, patient_id: &str) -> Result<usize, PipelineError> {
        if !self.config.is_registered(patient_id) {
            return Err(PipelineError::UnknownPatient(patient_id.to_string()));
        }
        let mut removed = 0;
        for split in self.existing_splits(patient_id) {
            let split_dir = self.config.split_dir(patient_id, &split);
            let mut dropped = BTreeSet::new();
            for session in self.load_split(&split_dir)? {
                for chunk in session
                    .chunks
                    .iter()
                    .filter(|c| !self.chunker.is_bucket_start(c.start))
                {
                    std::fs::remove_file(&chunk.path).with_path(&chunk.path, pipeline_io)?;
                    dropped.insert(self.relative_path(patient_id, &split, &chunk.path));
                }
            }
            removed += dropped.len();

            let labels = self.config.labels_file(patient_id, &split);
            if !labels.is_file() {
                log::debug!("No label table at {}", labels.display());
                continue;
            }
            let kept: Vec<LabelRecord> = read_labels(&labels)?
                .into_iter()
                .filter(|r| !dropped.contains(&r.filepath))
                .collect();
            write_labels(&labels, &kept)?;
            log::info!("Removed {} augmented chunks from {} {}", dropped.len(), patient_id, split);
        }
        Ok(removed)
    }
}

pub fn write_labels(path: &Path, records: &[LabelRecord]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path(parent, pipeline_io)?;
    }
    let csv_err = |source| PipelineError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    if records.is_empty() {
        writer.write_record(["filepath", "label"]).map_err(csv_err)?;
    }
    for record in records {
        writer.serialize(record).map_err(csv_err)?;
    }
    writer
        .flush()
        .with_path(path, pipeline_io)?;
    Ok(())
}

pub fn read_labels(path: &Path) -> Result<Vec<LabelRecord>, PipelineError> {
    let csv_err = |source| PipelineError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    reader
        .deserialize()
        .collect::<Result<Vec<LabelRecord>, _>>()
        .map_err(csv_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligner::pad;
    use crate::config::Granularity;
    use crate::store::SafetensorsStore;
    use crate::testutil::write_seizures;
    use crate::types::COLUMNS;
    use chrono::TimeZone;
    use ndarray::Array2;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn utc(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, d, h, m, s).unwrap()
    }

    fn params() -> WindowParams {
        WindowParams {
            forecast_window: 3600,
            setback: 900,
            lead_gap: 14400,
        }
    }

    #[test]
    fn test_lead_gap_filtering() {
        let t = utc(1, 12, 0, 0);
        let leads = lead_seizures(&[t + TimeDelta::seconds(60), t], 14400);
        assert_eq!(leads, vec![t]);
        let spaced = lead_seizures(&[t, t + TimeDelta::hours(5)], 14400);
        assert_eq!(spaced.len(), 2);
    }

    #[test]
    fn test_positive_times_cover_window() {
        let t = utc(1, 12, 0, 30);
        let positives = positive_times(&[t], &params());
        for k in [0, 1, 59, 60, 1800, 3599] {
            let expect = floor_minute(t - TimeDelta::seconds(900 + k));
            assert!(positives.contains(&expect), "k = {k}");
        }
        // onset 12:00:30, setback to 11:45:30, window back to 10:45:30
        assert_eq!(positives.first(), Some(&utc(1, 10, 45, 0)));
        assert_eq!(positives.last(), Some(&utc(1, 11, 45, 0)));
        assert_eq!(positives.len(), 61);
        assert!(!positives.contains(&utc(1, 14, 0, 0)));
    }

    #[test]
    fn test_positive_times_on_minute_boundary() {
        let t = utc(1, 12, 0, 0);
        let positives = positive_times(&[t], &params());
        assert_eq!(positives.len(), 61);
        assert_eq!(positives.first(), Some(&utc(1, 10, 45, 0)));
        assert_eq!(positives.last(), Some(&utc(1, 11, 45, 0)));
    }

    #[test]
    fn test_invalid_window() {
        let mut p = params();
        p.forecast_window = 0;
        assert!(matches!(p.validate(), Err(PipelineError::InvalidWindow(_))));
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        chunker: Chunker,
    }

    /// One session in `train` spanning 09:00 to 13:00 UTC on 2021-03-01,
    /// one empty `test` split.
    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let chunker = Chunker::new(&config, Arc::new(SafetensorsStore));
        let grid = chunker.grid();
        let start = grid.tick_of(utc(1, 9, 0, 0));
        let rows = 4 * 3600 * 128;
        let mut data = Array2::from_elem((rows, COLUMNS.len()), f32::NAN);
        for i in 0..rows {
            data[[i, 6]] = i as f32;
        }
        let table = pad(&SessionTable::new(128, start, data), Granularity::Hour);
        chunker
            .write(&table, &config.split_dir("1110", "train").join("000"))
            .unwrap();
        std::fs::create_dir_all(config.split_dir("1110", "test")).unwrap();
        Fixture {
            _dir: dir,
            config,
            chunker,
        }
    }

    #[test]
    fn test_label_marks_and_augments() {
        let fx = fixture();
        let onset = utc(1, 12, 15, 0);
        write_seizures(
            &fx.config.seizure_file("1110"),
            &[(onset.naive_utc(), onset), (onset.naive_utc(), onset + TimeDelta::seconds(60))],
        )
        .unwrap();

        let labeler = Labeler::new(&fx.config, &fx.chunker);
        let results = labeler.label("1110", &params()).unwrap();
        assert_eq!(results.len(), 2);
        let train = &results[0];
        // Positive minutes 11:00..=12:00; 11:00 and 12:00 are bucket starts,
        // the 59 minutes between are cut from the 11:00 and 12:00 chunks
        assert_eq!(train.positives, 61);
        assert_eq!(train.augmented, 59);
        assert_eq!(train.records, 4 + 59);

        let records = read_labels(&train.path).unwrap();
        let find = |name: &str| records.iter().find(|r| r.filepath.ends_with(name)).unwrap();
        assert_eq!(find("UTC-2021_03_01-12_00_00.safetensors").label, 1);
        assert_eq!(find("UTC-2021_03_01-11_30_00.safetensors").label, 1);
        assert_eq!(find("UTC-2021_03_01-10_00_00.safetensors").label, 0);
        assert_eq!(find("UTC-2021_03_01-09_00_00.safetensors").label, 0);
        assert_eq!(
            records[0].filepath,
            "1110/train/000/UTC-2021_03_01-09_00_00.safetensors"
        );
        assert!(records.windows(2).all(|w| w[0].filepath < w[1].filepath));

        // Augmented chunk holds the rows of its window
        let augmented = fx
            .chunker
            .read(&fx.config.split_dir("1110", "train").join("000/UTC-2021_03_01-11_30_00.safetensors"))
            .unwrap();
        assert_eq!(augmented.rows(), 3600 * 128);
        assert_eq!(augmented.data[[0, 6]], (2.5 * 3600.0 * 128.0) as f32);

        assert_eq!(results[1].records, 0);
        assert_eq!(results[1].positives, 0);
    }

    #[test]
    fn test_label_requires_splits_and_seizures() {
        let fx = fixture();
        let labeler = Labeler::new(&fx.config, &fx.chunker);
        assert!(matches!(
            labeler.label("1110", &params()),
            Err(PipelineError::MissingSeizures(_))
        ));
        assert!(matches!(
            labeler.label("1869", &params()),
            Err(PipelineError::MissingSplits { .. })
        ));
        assert!(matches!(
            labeler.label("0000", &params()),
            Err(PipelineError::UnknownPatient(_))
        ));
    }

    #[test]
    fn test_window_past_session_end_is_skipped() {
        let fx = fixture();
        // Window 12:00..13:00 needs the 13:00 bucket, which does not exist
        let onset = utc(1, 13, 15, 0);
        write_seizures(&fx.config.seizure_file("1110"), &[(onset.naive_utc(), onset)]).unwrap();
        let labeler = Labeler::new(&fx.config, &fx.chunker);
        let results = labeler.label("1110", &params()).unwrap();
        assert_eq!(results[0].augmented, 0);
        assert_eq!(results[0].positives, 1);
    }

    #[test]
    fn test_clean_removes_augmented() {
        let fx = fixture();
        let onset = utc(1, 12, 15, 0);
        write_seizures(&fx.config.seizure_file("1110"), &[(onset.naive_utc(), onset)]).unwrap();
        let labeler = Labeler::new(&fx.config, &fx.chunker);
        labeler.label("1110", &params()).unwrap();

        assert_eq!(labeler.clean("1110").unwrap(), 59);
        let session = fx.config.split_dir("1110", "train").join("000");
        assert_eq!(fx.chunker.list(&session).unwrap().len(), 4);
        let records = read_labels(&fx.config.labels_file("1110", "train")).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records.iter().filter(|r| r.label == 1).count(), 2);
    }
}
