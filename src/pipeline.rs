//! Pipeline orchestration
//!
//! This module provides the public API for ea-convert. [`Pipeline`] owns the
//! configuration, the channel-group reader and the chunk store, and runs the
//! convert, split, label, clean and audit phases for one patient at a time.

use rayon::prelude::*;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::aligner::SessionAligner;
use crate::audit::{AmbiguityAuditor, AuditReport};
use crate::chunker::Chunker;
use crate::config::{session_index_name, Config};
use crate::error::{pipeline_io, IoContext, PipelineError};
use crate::labeler::{Labeler, SplitLabels, WindowParams};
use crate::readers::{find_sessions, load_session, ChannelGroupReader, EdfReader};
use crate::split::SplitAssigner;
use crate::store::{ColumnarStore, SafetensorsStore};
use crate::types::{ChannelGroupSample, SplitAssignment};

/// Result of converting one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Chunks written to the output directory
    Converted { output: PathBuf, chunks: usize },
    /// No channel group could be read, or an inner join was empty
    Dodgy,
}

/// Summary of a patient conversion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvertReport {
    pub patient_id: String,
    pub sessions: usize,
    pub converted: usize,
    pub chunks: usize,
    pub dodgy: Vec<PathBuf>,
}

/// Convert every raw session of a patient with the default reader and store.
pub fn convert_patient(config: Config, patient_id: &str) -> Result<ConvertReport, PipelineError> {
    Pipeline::new(config)?.convert(patient_id)
}

pub struct Pipeline {
    config: Config,
    reader: Arc<dyn ChannelGroupReader>,
    aligner: SessionAligner,
    chunker: Chunker,
}

impl Pipeline {
    /// Pipeline reading EDF files and writing safetensors chunks
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        Self::with_components(config, Arc::new(EdfReader), Arc::new(SafetensorsStore))
    }

    pub fn with_components(
        config: Config,
        reader: Arc<dyn ChannelGroupReader>,
        store: Arc<dyn ColumnarStore>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let aligner = SessionAligner::new(&config)?;
        let chunker = Chunker::new(&config, store);
        Ok(Self {
            config,
            reader,
            aligner,
            chunker,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    fn require_patient(&self, patient_id: &str) -> Result<(), PipelineError> {
        if self.config.is_registered(patient_id) {
            Ok(())
        } else {
            Err(PipelineError::UnknownPatient(patient_id.to_string()))
        }
    }

    /// Convert one raw session directory into chunks under `output`.
    ///
    /// Stages:
    /// 1. load each channel group, treating failures as absent modalities
    /// 2. align and pad into one session table
    /// 3. write bucketed chunks
    pub fn convert_session(&self, session_dir: &Path, output: &Path) -> Result<SessionOutcome, PipelineError> {
        let name = session_dir.display().to_string();

        // Stage 1: Load channel groups
        let mut samples: Vec<ChannelGroupSample> = Vec::new();
        for (modality, result) in load_session(self.reader.as_ref(), &self.config, session_dir) {
            match result {
                Ok(sample) => samples.push(sample),
                Err(e) => log::debug!("{}: {} unreadable ({}): {}", name, modality.file_stem(), e.kind(), e),
            }
        }
        if samples.is_empty() {
            log::warn!("{}: no readable channel groups", name);
            return Ok(SessionOutcome::Dodgy);
        }

        // Stage 2: Align
        let table = match self.aligner.align(&name, &samples)? {
            Some(table) => table,
            None => return Ok(SessionOutcome::Dodgy),
        };

        // Stage 3: Write chunks
        let written = self.chunker.write(&table, output)?;
        Ok(SessionOutcome::Converted {
            output: output.to_path_buf(),
            chunks: written.len(),
        })
    }

    /// Convert every raw session of a patient.
    ///
    /// Sessions run in parallel. A session that fails alignment is not
    /// written; the others still finish and the run then reports the
    /// failures as [`PipelineError::AlignmentFailed`].
    pub fn convert(&self, patient_id: &str) -> Result<ConvertReport, PipelineError> {
        self.require_patient(patient_id)?;
        let raw_dir = self.config.raw_patient_dir(patient_id);
        if !raw_dir.is_dir() {
            return Err(PipelineError::NoRawData(patient_id.to_string()));
        }
        if self
            .config
            .split_names
            .iter()
            .any(|s| self.config.split_dir(patient_id, s).exists())
        {
            return Err(PipelineError::AlreadySplit(patient_id.to_string()));
        }
        let sessions = find_sessions(&raw_dir).with_path(&raw_dir, pipeline_io)?;
        if sessions.is_empty() {
            return Err(PipelineError::NoRawData(patient_id.to_string()));
        }

        let total = sessions.len();
        log::info!("Converting {} sessions of patient {}", total, patient_id);
        let out_dir = self.config.chunk_patient_dir(patient_id);
        remove_stale_sessions(&out_dir, total)?;
        let done = AtomicUsize::new(0);
        let run = || -> Vec<(PathBuf, Result<SessionOutcome, PipelineError>)> {
            sessions
                .par_iter()
                .enumerate()
                .map(|(i, session)| {
                    let output = out_dir.join(session_index_name(i));
                    let outcome = self.convert_session(session, &output);
                    let unpopulated = matches!(outcome, Ok(SessionOutcome::Dodgy) | Err(PipelineError::Align(_)));
                    if unpopulated && output.exists() {
                        // Leftover from an earlier conversion
                        if let Err(e) = std::fs::remove_dir_all(&output) {
                            log::warn!("Could not remove stale {}: {}", output.display(), e);
                        }
                    }
                    let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                    log::info!("[{}/{}] {}", n, total, session.display());
                    (session.clone(), outcome)
                })
                .collect()
        };
        let outcomes = match self.config.workers {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| PipelineError::ThreadPool(e.to_string()))?
                .install(run),
            None => run(),
        };

        let mut report = ConvertReport {
            patient_id: patient_id.to_string(),
            sessions: total,
            ..ConvertReport::default()
        };
        let mut misaligned = Vec::new();
        let mut first_error = None;
        for (session, outcome) in outcomes {
            match outcome {
                Ok(SessionOutcome::Converted { chunks, .. }) => {
                    report.converted += 1;
                    report.chunks += chunks;
                }
                Ok(SessionOutcome::Dodgy) => report.dodgy.push(session),
                Err(PipelineError::Align(e)) => {
                    log::error!("{}", e);
                    misaligned.push(session.display().to_string());
                }
                Err(e) => {
                    log::error!("{}: {}", session.display(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        report.dodgy.sort();
        self.write_dodgy_report(patient_id, &report.dodgy)?;

        if let Some(e) = first_error {
            return Err(e);
        }
        if !misaligned.is_empty() {
            misaligned.sort();
            return Err(PipelineError::AlignmentFailed(misaligned));
        }
        log::info!(
            "Patient {}: {} of {} sessions converted into {} chunks, {} dodgy",
            patient_id,
            report.converted,
            report.sessions,
            report.chunks,
            report.dodgy.len()
        );
        Ok(report)
    }

    fn write_dodgy_report(&self, patient_id: &str, dodgy: &[PathBuf]) -> Result<(), PipelineError> {
        let path = self.config.dodgy_report(patient_id);
        if dodgy.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).with_path(&path, pipeline_io)?;
            }
            return Ok(());
        }
        log::warn!("{} dodgy sessions for patient {}", dodgy.len(), patient_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent, pipeline_io)?;
        }
        let mut file = std::fs::File::create(&path).with_path(&path, pipeline_io)?;
        for session in dodgy {
            writeln!(file, "{}", session.display()).with_path(&path, pipeline_io)?;
        }
        Ok(())
    }

    /// Rebuild the split of a patient's sessions.
    pub fn split(&self, patient_id: &str, proportions: &[f64]) -> Result<SplitAssignment, PipelineError> {
        SplitAssigner::new(&self.config).split(patient_id, proportions)
    }

    /// Dissolve all split directories back into the unsplit pool.
    pub fn undo_split(&self, patient_id: &str) -> Result<usize, PipelineError> {
        SplitAssigner::new(&self.config).undo_split(patient_id)
    }

    /// Label every split, with window parameters from the configuration
    /// unless given.
    pub fn label(&self, patient_id: &str, params: Option<WindowParams>) -> Result<Vec<SplitLabels>, PipelineError> {
        let params = params.unwrap_or_else(|| WindowParams::from_config(&self.config));
        Labeler::new(&self.config, &self.chunker).label(patient_id, &params)
    }

    /// Remove augmented chunks and their label rows.
    pub fn clean(&self, patient_id: &str) -> Result<usize, PipelineError> {
        Labeler::new(&self.config, &self.chunker).clean(patient_id)
    }

    /// Report start times and onsets in ambiguous civil hours.
    pub fn audit(&self, patient_id: Option<&str>) -> Result<AuditReport, PipelineError> {
        AmbiguityAuditor::new(&self.config, self.reader.as_ref())?.audit(patient_id)
    }
}

/// Remove session output directories numbered at or beyond `count`.
fn remove_stale_sessions(out_dir: &Path, count: usize) -> Result<(), PipelineError> {
    if !out_dir.is_dir() {
        return Ok(());
    }
    let live: Vec<String> = (0..count).map(session_index_name).collect();
    for entry in std::fs::read_dir(out_dir).with_path(out_dir, pipeline_io)? {
        let path = entry.with_path(out_dir, pipeline_io)?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let numbered = !name.is_empty() && name.chars().all(|c| c.is_ascii_digit());
        if numbered && path.is_dir() && !live.contains(&name) {
            log::info!("Removing stale session output {}", path.display());
            std::fs::remove_dir_all(&path).with_path(&path, pipeline_io)?;
        }
    }
    Ok(())
}
