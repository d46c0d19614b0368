//! Fixture writers for tests: minimal EDF files and seizure tables.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::io::Write;
use std::path::Path;

use crate::config::Config;
use crate::types::Modality;

const PHYS_MIN: f64 = -1000.0;
const PHYS_MAX: f64 = 1000.0;
const DIG_MIN: f64 = -32768.0;
const DIG_MAX: f64 = 32767.0;

/// Shape of a generated EDF file: one-second data records
#[derive(Debug, Clone)]
pub struct EdfSpec {
    pub start: NaiveDateTime,
    pub records: usize,
    pub rate: usize,
    pub signals: usize,
    pub value: f32,
}

impl EdfSpec {
    pub fn new(start: NaiveDateTime, records: usize, rate: usize, signals: usize) -> Self {
        Self {
            start,
            records,
            rate,
            signals,
            value: 1.0,
        }
    }

    pub fn with_value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }
}

fn field(out: &mut Vec<u8>, text: &str, width: usize) {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(width, b' ');
    out.extend_from_slice(&bytes[..width]);
}

pub fn write_edf(path: &Path, spec: &EdfSpec) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let ns = spec.signals;
    let mut out = Vec::new();
    field(&mut out, "0", 8);
    field(&mut out, "X X X X", 80);
    field(&mut out, "Startdate X X X X", 80);
    field(&mut out, &spec.start.format("%d.%m.%y").to_string(), 8);
    field(&mut out, &spec.start.format("%H.%M.%S").to_string(), 8);
    field(&mut out, &(256 * (ns + 1)).to_string(), 8);
    field(&mut out, "", 44);
    field(&mut out, &spec.records.to_string(), 8);
    field(&mut out, "1", 8);
    field(&mut out, &ns.to_string(), 4);

    let each = |out: &mut Vec<u8>, text: &str, width: usize| {
        for _ in 0..ns {
            field(out, text, width);
        }
    };
    for i in 0..ns {
        field(&mut out, &format!("ch{i}"), 16);
    }
    each(&mut out, "", 80);
    each(&mut out, "uV", 8);
    each(&mut out, &PHYS_MIN.to_string(), 8);
    each(&mut out, &PHYS_MAX.to_string(), 8);
    each(&mut out, &DIG_MIN.to_string(), 8);
    each(&mut out, &DIG_MAX.to_string(), 8);
    each(&mut out, "", 80);
    each(&mut out, &spec.rate.to_string(), 8);
    each(&mut out, "", 32);

    let digital = ((spec.value as f64 - PHYS_MIN) / (PHYS_MAX - PHYS_MIN) * (DIG_MAX - DIG_MIN)
        + DIG_MIN)
        .round() as i16;
    for _ in 0..spec.records {
        for _ in 0..ns * spec.rate {
            out.extend_from_slice(&digital.to_le_bytes());
        }
    }
    std::fs::write(path, out)
}

/// Write every modality of a session, each `secs` long, starting at the
/// given local times.
pub fn write_session(
    config: &Config,
    session_dir: &Path,
    starts: &[(Modality, NaiveDateTime)],
    secs: usize,
) -> std::io::Result<()> {
    for (i, (m, start)) in starts.iter().enumerate() {
        let spec = EdfSpec::new(*start, secs, config.sample_rate as usize, m.columns().len())
            .with_value(i as f32 + 1.0);
        write_edf(&config.channel_file(session_dir, *m), &spec)?;
    }
    Ok(())
}

/// All five modalities starting at `start`, each offset by `stagger` seconds.
pub fn staggered(start: NaiveDateTime, stagger: i64) -> Vec<(Modality, NaiveDateTime)> {
    Modality::ALL
        .iter()
        .enumerate()
        .map(|(i, m)| (*m, start + Duration::seconds(stagger * i as i64)))
        .collect()
}

pub fn write_corrupt(config: &Config, session_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(session_dir)?;
    for m in Modality::ALL {
        std::fs::write(config.channel_file(session_dir, m), b"0       garbage")?;
    }
    Ok(())
}

pub fn write_seizures(path: &Path, onsets: &[(NaiveDateTime, DateTime<Utc>)]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "local,utc,note")?;
    for (local, utc) in onsets {
        writeln!(
            file,
            "{},{},x",
            local.format("%Y-%m-%dT%H:%M:%S"),
            utc.to_rfc3339()
        )?;
    }
    Ok(())
}
