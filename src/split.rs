//! Train/test/validation partitioning of converted sessions
//!
//! Sessions are assigned to splits by cumulative byte footprint in
//! chronological order, so every split is a contiguous run of sessions.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{pipeline_io, IoContext, PipelineError};
use crate::types::SplitAssignment;

/// Tolerance on cumulative proportions, absorbs float error at bounds
const EPSILON: f64 = 1e-9;

/// Check and normalize split weights so they sum to one.
pub fn normalize(weights: &[f64], max_splits: usize) -> Result<Vec<f64>, PipelineError> {
    if weights.len() < 2 {
        return Err(PipelineError::InvalidProportions(
            "at least two proportions are required".into(),
        ));
    }
    if weights.len() > max_splits {
        return Err(PipelineError::InvalidProportions(format!(
            "{} proportions given but only {} split names are configured",
            weights.len(),
            max_splits
        )));
    }
    if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w <= 0.0) {
        return Err(PipelineError::InvalidProportions(format!(
            "proportion {w} is not a positive number"
        )));
    }
    let total: f64 = weights.iter().sum();
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Split index for each session, given session sizes in chronological order
/// and normalized weights.
///
/// A session goes to the first split whose cumulative weight bound covers
/// the session's cumulative proportion; the last split takes the remainder.
pub fn assign(sizes: &[u64], weights: &[f64]) -> Vec<usize> {
    let total: u64 = sizes.iter().sum();
    let bounds: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect();
    let last = weights.len().saturating_sub(1);

    let mut cumulative = 0u64;
    sizes
        .iter()
        .map(|size| {
            cumulative += size;
            let prop = if total == 0 {
                0.0
            } else {
                cumulative as f64 / total as f64
            };
            bounds
                .iter()
                .position(|b| prop <= b + EPSILON)
                .unwrap_or(last)
                .min(last)
        })
        .collect()
}

/// Non-hidden subdirectories of `dir` that are not split directories,
/// sorted by name.
pub fn session_dirs(config: &Config, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).with_path(dir, pipeline_io)? {
        let entry = entry.with_path(dir, pipeline_io)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || config.is_split_name(&name) || !entry.path().is_dir() {
            continue;
        }
        dirs.push(entry.path());
    }
    dirs.sort();
    Ok(dirs)
}

/// Sum of the sizes of the regular files directly inside `dir`
pub fn dir_size(dir: &Path) -> Result<u64, PipelineError> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir).with_path(dir, pipeline_io)? {
        let entry = entry.with_path(dir, pipeline_io)?;
        let meta = entry.metadata().with_path(&entry.path(), pipeline_io)?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Partitions a patient's chunked sessions into named split directories.
pub struct SplitAssigner<'a> {
    config: &'a Config,
}

impl<'a> SplitAssigner<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn patient_dir(&self, patient_id: &str) -> Result<PathBuf, PipelineError> {
        if !self.config.is_registered(patient_id) {
            return Err(PipelineError::UnknownPatient(patient_id.to_string()));
        }
        let dir = self.config.chunk_patient_dir(patient_id);
        if !dir.is_dir() {
            return Err(PipelineError::NoConvertedData(patient_id.to_string()));
        }
        Ok(dir)
    }

    /// Move every session in every split directory back into the unsplit
    /// pool and remove the split directories. Returns the number of
    /// sessions moved.
    pub fn undo_split(&self, patient_id: &str) -> Result<usize, PipelineError> {
        let patient_dir = self.patient_dir(patient_id)?;

        let mut moves = Vec::new();
        let mut split_dirs = Vec::new();
        for split in &self.config.split_names {
            let split_dir = patient_dir.join(split);
            if !split_dir.is_dir() {
                continue;
            }
            log::info!("Found {} split for {}, undoing", split, patient_id);
            for session in session_dirs(self.config, &split_dir)? {
                let target = patient_dir.join(session.file_name().unwrap_or_default());
                if target.exists() {
                    return Err(PipelineError::SessionCollision(target));
                }
                moves.push((session, target));
            }
            split_dirs.push(split_dir);
        }

        for (from, to) in &moves {
            std::fs::rename(from, to).with_path(from, pipeline_io)?;
        }
        for dir in split_dirs {
            std::fs::remove_dir_all(&dir).with_path(&dir, pipeline_io)?;
        }
        Ok(moves.len())
    }

    /// Rebuild the split of a patient's sessions from scratch.
    pub fn split(&self, patient_id: &str, proportions: &[f64]) -> Result<SplitAssignment, PipelineError> {
        let weights = normalize(proportions, self.config.split_names.len())?;
        let patient_dir = self.patient_dir(patient_id)?;
        self.undo_split(patient_id)?;

        let sessions = session_dirs(self.config, &patient_dir)?;
        let sizes = sessions
            .iter()
            .map(|d| dir_size(d))
            .collect::<Result<Vec<u64>, _>>()?;
        if sessions.is_empty() || sizes.iter().sum::<u64>() == 0 {
            return Err(PipelineError::NoConvertedData(patient_id.to_string()));
        }

        let names = &self.config.split_names[..weights.len()];
        log::info!(
            "Splitting {} sessions of {} as {}",
            sessions.len(),
            patient_id,
            names
                .iter()
                .zip(&weights)
                .map(|(n, w)| format!("{n}={w:.3}"))
                .collect::<Vec<_>>()
                .join(" : ")
        );

        let indices = assign(&sizes, &weights);
        for (k, name) in names.iter().enumerate() {
            let dir = patient_dir.join(name);
            std::fs::create_dir_all(&dir).with_path(&dir, pipeline_io)?;
            if !indices.contains(&k) {
                log::warn!("No sessions in {} split of {}", name, patient_id);
            }
        }

        let mut assignment = SplitAssignment::new();
        for (session, k) in sessions.iter().zip(indices) {
            let name = session
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let target = patient_dir.join(&names[k]).join(&name);
            std::fs::rename(session, &target).with_path(session, pipeline_io)?;
            assignment.insert(name, names[k].clone());
        }
        Ok(assignment)
    }
}
