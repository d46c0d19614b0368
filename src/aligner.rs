//! Session alignment
//!
//! Places each channel group on the global sample grid, joins the groups
//! into one table of canonical columns and pads the table out to whole
//! minute or hour boundaries.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use ndarray::s;

use crate::config::{Config, Granularity, JoinPolicy};
use crate::error::{AlignError, ConfigError};
use crate::grid::SampleGrid;
use crate::timezone::CivilClock;
use crate::types::{ChannelGroupSample, Modality, SessionTable};

/// A channel group with its first sample placed on the grid
#[derive(Debug, Clone, Copy)]
pub struct Placed<'a> {
    pub sample: &'a ChannelGroupSample,
    pub start_tick: i64,
}

impl Placed<'_> {
    pub fn end_tick(&self) -> i64 {
        self.start_tick + self.sample.n_samples() as i64
    }
}

/// Merges per-modality samples of one session into a padded [`SessionTable`].
#[derive(Debug, Clone)]
pub struct SessionAligner {
    clock: CivilClock,
    grid: SampleGrid,
    join: JoinPolicy,
    padding: Granularity,
    spread_warn_secs: f64,
}

impl SessionAligner {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            clock: CivilClock::from_config(config)?,
            grid: SampleGrid::new(config.sample_rate),
            join: config.join,
            padding: config.padding,
            spread_warn_secs: config.start_spread_warn_secs,
        })
    }

    pub fn grid(&self) -> SampleGrid {
        self.grid
    }

    /// Align the samples of `session`.
    ///
    /// Returns `Ok(None)` when there is nothing to align: no modality was
    /// readable, or an inner join left an empty intersection.
    pub fn align(
        &self,
        session: &str,
        samples: &[ChannelGroupSample],
    ) -> Result<Option<SessionTable>, AlignError> {
        let mut seen: Vec<Modality> = Vec::with_capacity(samples.len());
        for sample in samples {
            if seen.contains(&sample.modality) {
                return Err(AlignError::DuplicateModality(sample.modality.file_stem()));
            }
            seen.push(sample.modality);
        }

        let placed = self.place(samples);
        if placed.is_empty() {
            return Ok(None);
        }
        self.warn_on_spread(session, &placed);

        let joined = match join(self.grid, &placed, self.join) {
            Some(t) => t,
            None => {
                log::warn!("{}: channel groups do not overlap", session);
                return Ok(None);
            }
        };
        let padded = pad(&joined, self.padding);
        check_row_count(session, &joined, &padded, self.padding)?;
        Ok(Some(padded))
    }

    /// Convert each civil start to UTC and snap it to the nearest tick.
    pub fn place<'a>(&self, samples: &'a [ChannelGroupSample]) -> Vec<Placed<'a>> {
        samples
            .iter()
            .filter(|s| s.n_samples() > 0)
            .map(|sample| {
                let utc = self.clock.to_utc(sample.start_local);
                Placed {
                    sample,
                    start_tick: self.grid.tick_of(utc),
                }
            })
            .collect()
    }

    fn warn_on_spread(&self, session: &str, placed: &[Placed]) {
        let spread = |ticks: Vec<i64>| -> f64 {
            let lo = ticks.iter().min().copied().unwrap_or(0);
            let hi = ticks.iter().max().copied().unwrap_or(0);
            (hi - lo) as f64 / self.grid.rate() as f64
        };
        let starts = spread(placed.iter().map(|p| p.start_tick).collect());
        let ends = spread(placed.iter().map(|p| p.end_tick()).collect());
        if starts > self.spread_warn_secs {
            log::warn!("{}: channel start times spread over {:.1}s", session, starts);
        }
        if ends > self.spread_warn_secs {
            log::warn!("{}: channel end times spread over {:.1}s", session, ends);
        }
    }
}

/// Join placed channel groups into one table of canonical columns.
///
/// Outer joins cover the union of all spans; inner joins cover the
/// intersection of the spans present. Columns of absent modalities, and
/// rows a modality does not reach, are NaN.
pub fn join(grid: SampleGrid, placed: &[Placed], policy: JoinPolicy) -> Option<SessionTable> {
    let starts = placed.iter().map(|p| p.start_tick);
    let ends = placed.iter().map(|p| p.end_tick());
    let (lo, hi) = match policy {
        JoinPolicy::Outer => (starts.min()?, ends.max()?),
        JoinPolicy::Inner => (starts.max()?, ends.min()?),
    };
    if lo >= hi {
        return None;
    }

    let mut table = SessionTable::nan(grid.rate(), lo, hi);
    for p in placed {
        let from = p.start_tick.max(lo);
        let to = p.end_tick().min(hi);
        if from >= to {
            continue;
        }
        let col = p.sample.modality.column_offset();
        let width = p.sample.modality.columns().len().min(p.sample.data.ncols());
        let src = p.sample.data.slice(s![
            (from - p.start_tick) as usize..(to - p.start_tick) as usize,
            ..width
        ]);
        table
            .data
            .slice_mut(s![(from - lo) as usize..(to - lo) as usize, col..col + width])
            .assign(&src);
    }
    Some(table)
}

/// Extend a table with NaN rows back to the floor of its first row and
/// forward to the ceiling of its exclusive end.
pub fn pad(table: &SessionTable, granularity: Granularity) -> SessionTable {
    let grid = table.grid();
    let lo = grid.floor(table.start_tick, granularity);
    let hi = grid.ceil(table.end_tick(), granularity);
    if lo == table.start_tick && hi == table.end_tick() {
        return table.clone();
    }
    let mut padded = SessionTable::nan(table.sample_rate, lo, hi);
    let offset = (table.start_tick - lo) as usize;
    padded
        .data
        .slice_mut(s![offset..offset + table.rows(), ..])
        .assign(&table.data);
    padded
}

fn boundary(t: DateTime<Utc>, granularity: Granularity, up: bool) -> Result<DateTime<Utc>, AlignError> {
    let step = TimeDelta::seconds(granularity.seconds());
    let floor = t
        .duration_trunc(step)
        .map_err(|_| AlignError::Rounding(t.to_rfc3339()))?;
    Ok(if up && floor != t { floor + step } else { floor })
}

/// Verify the padded row count against wall-clock boundaries of the
/// unpadded table.
pub fn check_row_count(
    session: &str,
    joined: &SessionTable,
    padded: &SessionTable,
    granularity: Granularity,
) -> Result<(), AlignError> {
    let start = boundary(joined.start_time(), granularity, false)?;
    let end = boundary(joined.end_time(), granularity, true)?;
    let expected = (end - start).num_seconds() * joined.sample_rate as i64;
    if expected != padded.rows() as i64 || padded.start_time() != start {
        log::error!("{}: padded table does not match {}..{}", session, start, end);
        return Err(AlignError::RowCountMismatch {
            session: session.to_string(),
            expected,
            actual: padded.rows(),
            boundary_start: start.to_rfc3339(),
            boundary_end: end.to_rfc3339(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use ndarray::Array2;
    use pretty_assertions::assert_eq;

    fn same(a: &SessionTable, b: &SessionTable) -> bool {
        a.start_tick == b.start_tick
            && a.data.dim() == b.data.dim()
            && a
                .data
                .iter()
                .zip(b.data.iter())
                .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
    }

    fn local(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 6, 10)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn sample(modality: Modality, start: NaiveDateTime, secs: usize) -> ChannelGroupSample {
        let width = modality.columns().len();
        ChannelGroupSample {
            modality,
            data: Array2::from_elem((secs * 128, width), modality.column_offset() as f32),
            sample_rate: 128.0,
            start_local: start,
        }
    }

    fn aligner(policy: JoinPolicy) -> SessionAligner {
        let config = Config {
            join: policy,
            ..Config::default()
        };
        SessionAligner::new(&config).unwrap()
    }

    #[test]
    fn test_pad_is_idempotent() {
        let grid = SampleGrid::new(128);
        let table = SessionTable::nan(128, grid.ticks_in(1_600_000_123) + 7, grid.ticks_in(1_600_000_900));
        for g in [Granularity::Minute, Granularity::Hour] {
            let once = pad(&table, g);
            let twice = pad(&once, g);
            assert!(same(&once, &twice));
            assert!(grid.is_aligned(once.start_tick, g));
            assert!(grid.is_aligned(once.end_tick(), g));
        }
    }

    #[test]
    fn test_pad_aligned_table_is_unchanged() {
        let mut data = Array2::zeros((128 * 60, 8));
        data[[0, 0]] = 3.0;
        let table = SessionTable::new(128, 128 * 3600 * 400_000, data);
        assert!(same(&pad(&table, Granularity::Minute), &table));
    }

    #[test]
    fn test_pad_keeps_values_in_place() {
        let mut data = Array2::zeros((10, 8));
        data[[0, 5]] = 9.0;
        let start = 128 * 3600 * 100 + 1000;
        let table = SessionTable::new(128, start, data);
        let padded = pad(&table, Granularity::Hour);
        assert_eq!(padded.rows(), 128 * 3600);
        assert_eq!(padded.data[[1000, 5]], 9.0);
        assert!(padded.data[[999, 5]].is_nan());
        assert!(padded.data[[1010, 5]].is_nan());
    }

    #[test]
    fn test_row_count_for_every_modality_combination() {
        let all: Vec<ChannelGroupSample> = Modality::ALL
            .iter()
            .enumerate()
            .map(|(i, m)| sample(*m, local(10, 12, 3 * i as u32), 200 + 40 * i))
            .collect();
        for policy in [JoinPolicy::Outer, JoinPolicy::Inner] {
            let aligner = aligner(policy);
            for mask in 1u32..32 {
                let present: Vec<ChannelGroupSample> = all
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, s)| s.clone())
                    .collect();
                let table = aligner.align("s", &present).unwrap().unwrap();
                assert_eq!(table.rows(), 3600 * 128, "mask {mask}");
                assert!(aligner.grid().is_aligned(table.start_tick, Granularity::Hour));
            }
        }
    }

    #[test]
    fn test_outer_join_fills_absent_with_nan() {
        let aligner = aligner(JoinPolicy::Outer);
        let hr = sample(Modality::Hr, local(10, 0, 0), 10);
        let temp = sample(Modality::Temp, local(10, 0, 5), 10);
        let placed = aligner.place(std::slice::from_ref(&hr));
        let placed_temp = aligner.place(std::slice::from_ref(&temp));
        let both: Vec<Placed> = placed.into_iter().chain(placed_temp).collect();
        let table = join(aligner.grid(), &both, JoinPolicy::Outer).unwrap();
        assert_eq!(table.rows(), 15 * 128);
        assert_eq!(table.data[[0, 6]], 6.0);
        assert!(table.data[[0, 7]].is_nan());
        assert_eq!(table.data[[15 * 128 - 1, 7]], 7.0);
        assert!(table.data[[15 * 128 - 1, 6]].is_nan());
        assert!(table.data[[0, 0]].is_nan());
    }

    #[test]
    fn test_inner_join_intersects() {
        let aligner = aligner(JoinPolicy::Inner);
        let samples = vec![
            sample(Modality::Hr, local(10, 0, 0), 10),
            sample(Modality::Temp, local(10, 0, 5), 10),
        ];
        let placed = aligner.place(&samples);
        let table = join(aligner.grid(), &placed, JoinPolicy::Inner).unwrap();
        assert_eq!(table.rows(), 5 * 128);
        assert_eq!(table.populated_rows(), 5 * 128);
    }

    #[test]
    fn test_inner_join_without_overlap_is_none() {
        let aligner = aligner(JoinPolicy::Inner);
        let samples = vec![
            sample(Modality::Hr, local(10, 0, 0), 10),
            sample(Modality::Temp, local(11, 0, 0), 10),
        ];
        assert!(aligner.align("s", &samples).unwrap().is_none());
    }

    #[test]
    fn test_no_samples_is_none() {
        assert!(aligner(JoinPolicy::Outer).align("s", &[]).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_modality_rejected() {
        let samples = vec![
            sample(Modality::Hr, local(10, 0, 0), 1),
            sample(Modality::Hr, local(10, 0, 0), 1),
        ];
        assert!(matches!(
            aligner(JoinPolicy::Outer).align("s", &samples),
            Err(AlignError::DuplicateModality("HR"))
        ));
    }

    #[test]
    fn test_local_start_converted_to_utc() {
        let aligner = aligner(JoinPolicy::Outer);
        let samples = vec![sample(Modality::Eda, local(10, 30, 0), 60)];
        let placed = aligner.place(&samples);
        let utc = aligner.grid().instant_of(placed[0].start_tick);
        // CDT, UTC-5
        assert_eq!(utc.naive_utc(), local(15, 30, 0));
    }

    #[test]
    fn test_row_count_mismatch_detected() {
        let joined = SessionTable::nan(128, 128 * 60 * 1000 + 5, 128 * 60 * 1000 + 50);
        let mut bad = pad(&joined, Granularity::Minute);
        bad.data = Array2::from_elem((bad.rows() - 1, 8), f32::NAN);
        let result = check_row_count("bad", &joined, &bad, Granularity::Minute);
        assert!(matches!(result, Err(AlignError::RowCountMismatch { .. })));
        let good = pad(&joined, Granularity::Minute);
        assert!(check_row_count("good", &joined, &good, Granularity::Minute).is_ok());
    }

    #[test]
    fn test_sub_sample_start_offset_snaps() {
        let aligner = aligner(JoinPolicy::Outer);
        let mut s = sample(Modality::Bvp, local(10, 0, 0), 1);
        s.start_local += Duration::milliseconds(3);
        let placed = aligner.place(std::slice::from_ref(&s));
        assert_eq!(placed[0].start_tick % 128, 0);
    }
}
