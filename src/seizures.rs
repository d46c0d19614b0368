//! Seizure onset tables

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::path::Path;

use crate::error::PipelineError;
use crate::types::SeizureEvent;

#[derive(Debug, Deserialize)]
struct SeizureRow {
    local: NaiveDateTime,
    utc: DateTime<Utc>,
}

/// Load `local,utc` onset rows from a CSV file; extra columns are ignored.
/// Events are returned sorted by UTC onset.
pub fn load_seizures(path: &Path) -> Result<Vec<SeizureEvent>, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::MissingSeizures(path.to_path_buf()));
    }
    let csv_err = |source| PipelineError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let mut events = reader
        .deserialize::<SeizureRow>()
        .map(|row| {
            row.map(|r| SeizureEvent {
                local: r.local,
                utc: r.utc,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(csv_err)?;
    events.sort_by_key(|e| e.utc);
    Ok(events)
}
