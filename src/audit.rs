//! Daylight-saving ambiguity audit
//!
//! Advisory scan of channel-file start times and seizure onsets against the
//! known fall-back hours, where a local time maps to two UTC instants.

use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{pipeline_io, IoContext, PipelineError};
use crate::readers::{find_sessions, ChannelGroupReader};
use crate::seizures::load_seizures;
use crate::timezone::CivilClock;
use crate::types::Modality;

pub const FILES_REPORT: &str = "files_with_ambiguous_start_times.txt";
pub const SEIZURES_REPORT: &str = "seizures_with_ambiguous_start_times.txt";

/// A local time that falls in a known ambiguous hour
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousTime {
    pub patient_id: String,
    pub local: NaiveDateTime,
    pub utc: DateTime<Utc>,
    /// Channel file the time came from, if any
    pub source: Option<PathBuf>,
}

impl AmbiguousTime {
    pub fn report_line(&self) -> String {
        format!(
            "{}, {} ({})",
            self.patient_id,
            self.local.format("%Y-%m-%d %H:%M:%S"),
            self.utc.format("%Y-%m-%d %H:%M:%S%:z")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub files: Vec<AmbiguousTime>,
    pub seizures: Vec<AmbiguousTime>,
}

fn floor_hour(t: NaiveDateTime) -> NaiveDateTime {
    t.duration_trunc(TimeDelta::hours(1)).unwrap_or(t)
}

pub struct AmbiguityAuditor<'a> {
    config: &'a Config,
    reader: &'a dyn ChannelGroupReader,
    clock: CivilClock,
    hours: Vec<NaiveDateTime>,
}

impl<'a> AmbiguityAuditor<'a> {
    pub fn new(config: &'a Config, reader: &'a dyn ChannelGroupReader) -> Result<Self, PipelineError> {
        let clock = CivilClock::from_config(config)?;
        for t in config.ambiguous_times.iter().filter(|t| !clock.is_ambiguous(**t)) {
            log::warn!("Configured ambiguous time {} is not ambiguous in {}", t, config.timezone);
        }
        Ok(Self {
            config,
            reader,
            clock,
            hours: config.ambiguous_times.iter().map(|t| floor_hour(*t)).collect(),
        })
    }

    fn is_ambiguous_hour(&self, local: NaiveDateTime) -> bool {
        self.hours.contains(&floor_hour(local))
    }

    fn matched(&self, patient_id: &str, local: NaiveDateTime, source: Option<PathBuf>) -> AmbiguousTime {
        AmbiguousTime {
            patient_id: patient_id.to_string(),
            local,
            utc: self.clock.resolve(local).0,
            source,
        }
    }

    /// Audit one patient, or every registered patient when `None`.
    pub fn audit(&self, patient_id: Option<&str>) -> Result<AuditReport, PipelineError> {
        let patients: Vec<String> = match patient_id {
            Some(pid) if self.config.is_registered(pid) => vec![pid.to_string()],
            Some(pid) => return Err(PipelineError::UnknownPatient(pid.to_string())),
            None => self.config.patient_ids.clone(),
        };

        let mut report = AuditReport::default();
        for pid in &patients {
            log::info!("Checking start times of patient {}", pid);
            report.files.extend(self.scan_files(pid)?);
            report.seizures.extend(self.scan_seizures(pid)?);
        }

        self.write_report(SEIZURES_REPORT, "seizure", &report.seizures)?;
        self.write_report(FILES_REPORT, "file", &report.files)?;
        Ok(report)
    }

    fn scan_files(&self, patient_id: &str) -> Result<Vec<AmbiguousTime>, PipelineError> {
        let patient_dir = self.config.raw_patient_dir(patient_id);
        if !patient_dir.is_dir() {
            log::info!("No raw data for {}", patient_id);
            return Ok(Vec::new());
        }
        let sessions = find_sessions(&patient_dir).with_path(&patient_dir, pipeline_io)?;
        let mut found = Vec::new();
        for session in sessions {
            for modality in Modality::ALL {
                let path = self.config.channel_file(&session, modality);
                if !path.is_file() {
                    continue;
                }
                match self.reader.read_start(&path) {
                    Ok(local) if self.is_ambiguous_hour(local) => {
                        found.push(self.matched(patient_id, local, Some(path)))
                    }
                    Ok(_) => {}
                    Err(e) => log::debug!("Skipping {}: {}", path.display(), e),
                }
            }
        }
        Ok(found)
    }

    fn scan_seizures(&self, patient_id: &str) -> Result<Vec<AmbiguousTime>, PipelineError> {
        let events = match load_seizures(&self.config.seizure_file(patient_id)) {
            Ok(events) => events,
            Err(PipelineError::MissingSeizures(path)) => {
                log::warn!("No seizure table at {}", path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(events
            .into_iter()
            .filter(|e| self.is_ambiguous_hour(e.local))
            .map(|e| AmbiguousTime {
                patient_id: patient_id.to_string(),
                local: e.local,
                utc: e.utc,
                source: None,
            })
            .collect())
    }

    fn write_report(&self, name: &str, what: &str, found: &[AmbiguousTime]) -> Result<(), PipelineError> {
        let path = self.config.artifacts_root.join(name);
        if found.is_empty() {
            log::info!("No {} start times are ambiguous", what);
            return remove_stale(&path);
        }
        log::warn!("{} {} start time(s) are ambiguous:", found.len(), what);
        std::fs::create_dir_all(&self.config.artifacts_root)
            .with_path(&self.config.artifacts_root, pipeline_io)?;
        let mut file = std::fs::File::create(&path).with_path(&path, pipeline_io)?;
        for t in found {
            let line = t.report_line();
            log::warn!("{}", line);
            writeln!(file, "{}", line).with_path(&path, pipeline_io)?;
        }
        Ok(())
    }
}

fn remove_stale(path: &Path) -> Result<(), PipelineError> {
    if path.exists() {
        std::fs::remove_file(path).with_path(path, pipeline_io)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::EdfReader;
    use crate::testutil::{write_edf, write_seizures, EdfSpec};
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_audit_finds_files_and_seizures() {
        let dir = tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let session = config.raw_patient_dir("1110").join("2021_11_07");
        let ambiguous = local(2021, 11, 7, 1, 20);
        write_edf(
            &config.channel_file(&session, Modality::Hr),
            &EdfSpec::new(ambiguous, 1, 128, 1),
        )
        .unwrap();
        write_edf(
            &config.channel_file(&session, Modality::Temp),
            &EdfSpec::new(local(2021, 11, 7, 2, 0), 1, 128, 1),
        )
        .unwrap();
        let onset_utc = Utc.with_ymd_and_hms(2020, 11, 1, 7, 45, 0).unwrap();
        write_seizures(
            &config.seizure_file("1110"),
            &[
                (local(2020, 11, 1, 1, 45), onset_utc),
                (local(2020, 6, 1, 1, 45), onset_utc),
            ],
        )
        .unwrap();

        let auditor = AmbiguityAuditor::new(&config, &EdfReader).unwrap();
        let report = auditor.audit(Some("1110")).unwrap();
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].local, ambiguous);
        assert_eq!(report.seizures.len(), 1);
        assert_eq!(
            report.seizures[0].report_line(),
            "1110, 2020-11-01 01:45:00 (2020-11-01 07:45:00+00:00)"
        );

        let text = std::fs::read_to_string(config.artifacts_root.join(FILES_REPORT)).unwrap();
        assert_eq!(text, "1110, 2021-11-07 01:20:00 (2021-11-07 07:20:00+00:00)\n");
        assert!(config.artifacts_root.join(SEIZURES_REPORT).is_file());
    }

    #[test]
    fn test_audit_all_patients_without_data() {
        let dir = tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let auditor = AmbiguityAuditor::new(&config, &EdfReader).unwrap();
        let report = auditor.audit(None).unwrap();
        assert_eq!(report, AuditReport::default());
        assert!(!config.artifacts_root.join(FILES_REPORT).exists());
    }

    #[test]
    fn test_audit_unknown_patient() {
        let dir = tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let auditor = AmbiguityAuditor::new(&config, &EdfReader).unwrap();
        assert!(matches!(
            auditor.audit(Some("42")),
            Err(PipelineError::UnknownPatient(_))
        ));
    }
}
