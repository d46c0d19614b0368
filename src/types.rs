//! Core types for the ea-convert pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: raw channel-group samples, aligned session tables, seizure events
//! and label records.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis, ShapeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::grid::SampleGrid;

/// Channel group identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Acc,
    Bvp,
    Eda,
    Hr,
    Temp,
}

impl Modality {
    /// All modalities in canonical column order
    pub const ALL: [Modality; 5] = [
        Modality::Acc,
        Modality::Bvp,
        Modality::Eda,
        Modality::Hr,
        Modality::Temp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Acc => "acc",
            Modality::Bvp => "bvp",
            Modality::Eda => "eda",
            Modality::Hr => "hr",
            Modality::Temp => "temp",
        }
    }

    /// Upper-case stem used in channel file names, e.g. `ACC`
    pub fn file_stem(&self) -> &'static str {
        match self {
            Modality::Acc => "ACC",
            Modality::Bvp => "BVP",
            Modality::Eda => "EDA",
            Modality::Hr => "HR",
            Modality::Temp => "TEMP",
        }
    }

    /// Column names contributed by this modality
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Modality::Acc => &COLUMNS[0..4],
            Modality::Bvp => &COLUMNS[4..5],
            Modality::Eda => &COLUMNS[5..6],
            Modality::Hr => &COLUMNS[6..7],
            Modality::Temp => &COLUMNS[7..8],
        }
    }

    /// Index of this modality's first column in [`COLUMNS`]
    pub fn column_offset(&self) -> usize {
        match self {
            Modality::Acc => 0,
            Modality::Bvp => 4,
            Modality::Eda => 5,
            Modality::Hr => 6,
            Modality::Temp => 7,
        }
    }
}

/// Canonical column order of every session table and chunk
pub const COLUMNS: [&str; 8] = [
    "acc_x", "acc_y", "acc_z", "acc_mag", "bvp", "eda", "hr", "temp",
];

/// One channel group's raw reading for a session.
///
/// Timestamps are civil (local, possibly ambiguous); conversion to UTC happens
/// in the aligner.
#[derive(Debug, Clone)]
pub struct ChannelGroupSample {
    pub modality: Modality,
    /// Samples x fields
    pub data: Array2<f32>,
    /// Sample rate (Hz)
    pub sample_rate: f64,
    /// Local start of the first sample
    pub start_local: NaiveDateTime,
}

impl ChannelGroupSample {
    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    /// Offset of each sample from the start (seconds)
    pub fn relative_times(&self) -> Vec<f64> {
        (0..self.n_samples())
            .map(|i| i as f64 / self.sample_rate)
            .collect()
    }

    /// Local instant one sample period after the last sample
    pub fn end_local(&self) -> NaiveDateTime {
        let nanos = (self.n_samples() as f64 / self.sample_rate * 1e9).round() as i64;
        self.start_local + Duration::nanoseconds(nanos)
    }
}

/// Aligned, UTC-indexed table on the global sample grid.
///
/// Row `i` sits at tick `start_tick + i`; the table covers the half-open
/// range `[start_tick, end_tick)`. Columns follow [`COLUMNS`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTable {
    pub sample_rate: u32,
    pub start_tick: i64,
    pub data: Array2<f32>,
}

impl SessionTable {
    pub fn new(sample_rate: u32, start_tick: i64, data: Array2<f32>) -> Self {
        Self {
            sample_rate,
            start_tick,
            data,
        }
    }

    /// All-NaN table spanning `[start_tick, end_tick)`
    pub fn nan(sample_rate: u32, start_tick: i64, end_tick: i64) -> Self {
        let rows = (end_tick - start_tick).max(0) as usize;
        Self::new(
            sample_rate,
            start_tick,
            Array2::from_elem((rows, COLUMNS.len()), f32::NAN),
        )
    }

    pub fn grid(&self) -> SampleGrid {
        SampleGrid::new(self.sample_rate)
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// Exclusive end tick
    pub fn end_tick(&self) -> i64 {
        self.start_tick + self.rows() as i64
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.grid().instant_of(self.start_tick)
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.grid().instant_of(self.end_tick())
    }

    /// Rows within `[from, to)`, clamped to the table.
    pub fn slice_ticks(&self, from: i64, to: i64) -> SessionTable {
        let from = from.clamp(self.start_tick, self.end_tick());
        let to = to.clamp(from, self.end_tick());
        let a = (from - self.start_tick) as usize;
        let b = (to - self.start_tick) as usize;
        SessionTable::new(
            self.sample_rate,
            from,
            self.data.slice(s![a..b, ..]).to_owned(),
        )
    }

    /// Concatenate `other` directly after `self`; the caller guarantees
    /// `other.start_tick == self.end_tick()`.
    pub fn append(&self, other: &SessionTable) -> Result<SessionTable, ShapeError> {
        let views: [ArrayView2<f32>; 2] = [self.data.view(), other.data.view()];
        let data = concatenate(Axis(0), &views)?;
        Ok(SessionTable::new(self.sample_rate, self.start_tick, data))
    }

    /// Number of rows with at least one non-NaN value
    pub fn populated_rows(&self) -> usize {
        self.data
            .rows()
            .into_iter()
            .filter(|r| r.iter().any(|v| !v.is_nan()))
            .count()
    }
}

/// A recorded seizure onset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeizureEvent {
    /// Civil onset as written in the clinical record
    pub local: NaiveDateTime,
    /// Onset in UTC
    pub utc: DateTime<Utc>,
}

/// One row of a label table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// Chunk path relative to the chunk root (`pid/split/session/file`)
    pub filepath: String,
    /// 1 if the chunk starts inside a forecast window, else 0
    pub label: u8,
}

/// Session directory name to split name
pub type SplitAssignment = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_modality_columns_cover_canonical_order() {
        let flat: Vec<&str> = Modality::ALL
            .iter()
            .flat_map(|m| m.columns().iter().copied())
            .collect();
        assert_eq!(flat, COLUMNS.to_vec());
        for m in Modality::ALL {
            assert_eq!(COLUMNS[m.column_offset()], m.columns()[0]);
        }
    }

    #[test]
    fn test_sample_end_local() {
        let start = NaiveDate::from_ymd_opt(2021, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let sample = ChannelGroupSample {
            modality: Modality::Hr,
            data: Array2::zeros((256, 1)),
            sample_rate: 128.0,
            start_local: start,
        };
        assert_eq!(sample.end_local(), start + Duration::seconds(2));
        let times = sample.relative_times();
        assert_eq!(times[128], 1.0);
    }

    #[test]
    fn test_slice_and_append() {
        let mut data = Array2::zeros((10, COLUMNS.len()));
        for i in 0..10 {
            data[[i, 0]] = i as f32;
        }
        let table = SessionTable::new(128, 100, data);
        let head = table.slice_ticks(90, 104);
        let tail = table.slice_ticks(104, 200);
        assert_eq!(head.start_tick, 100);
        assert_eq!(head.rows(), 4);
        assert_eq!(tail.start_tick, 104);
        assert_eq!(tail.end_tick(), 110);
        assert_eq!(head.append(&tail).unwrap(), table);
    }

    #[test]
    fn test_nan_table() {
        let table = SessionTable::nan(128, 0, 5);
        assert_eq!(table.rows(), 5);
        assert_eq!(table.populated_rows(), 0);
    }
}
