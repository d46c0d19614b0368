//! EDF channel-group reader
//!
//! Reads the 256-byte main header, the per-signal header blocks and the
//! little-endian 16-bit data records of a European Data Format file. EDF+
//! annotation signals are skipped. Every remaining signal must share one
//! sample rate.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ndarray::Array2;
use std::path::Path;

use super::{ChannelGroupReader, RawRecording};
use crate::error::LoadError;

const MAIN_HEADER_LEN: usize = 256;
const SIGNAL_HEADER_LEN: usize = 256;
const ANNOTATION_LABEL: &str = "EDF Annotations";

/// Reader for EDF/EDF+ channel files
#[derive(Debug, Clone, Copy, Default)]
pub struct EdfReader;

/// Per-signal header fields needed for decoding
#[derive(Debug, Clone)]
struct SignalHeader {
    label: String,
    physical_min: f64,
    physical_max: f64,
    digital_min: f64,
    digital_max: f64,
    samples_per_record: usize,
}

impl SignalHeader {
    fn is_annotation(&self) -> bool {
        self.label == ANNOTATION_LABEL
    }

    fn gain(&self) -> f64 {
        let span = self.digital_max - self.digital_min;
        if span == 0.0 {
            1.0
        } else {
            (self.physical_max - self.physical_min) / span
        }
    }

    fn to_physical(&self, digital: i16) -> f32 {
        ((digital as f64 - self.digital_min) * self.gain() + self.physical_min) as f32
    }
}

#[derive(Debug, Clone)]
struct EdfHeader {
    start: NaiveDateTime,
    header_bytes: usize,
    n_records: usize,
    record_duration: f64,
    signals: Vec<SignalHeader>,
}

impl EdfHeader {
    fn record_bytes(&self) -> usize {
        self.signals.iter().map(|s| s.samples_per_record * 2).sum()
    }
}

/// Cursor over a header field region
struct Fields<'a> {
    path: &'a Path,
    bytes: &'a [u8],
}

impl<'a> Fields<'a> {
    fn text(&self, start: usize, len: usize) -> Result<String, LoadError> {
        let raw = self
            .bytes
            .get(start..start + len)
            .ok_or_else(|| LoadError::corrupt(self.path, "header truncated"))?;
        Ok(String::from_utf8_lossy(raw).trim().to_string())
    }

    fn number<T: std::str::FromStr>(&self, start: usize, len: usize, name: &str) -> Result<T, LoadError> {
        let text = self.text(start, len)?;
        text.parse::<T>().map_err(|_| {
            LoadError::corrupt(self.path, format!("non-numeric {name} field {text:?}"))
        })
    }
}

fn parse_start(path: &Path, date: &str, time: &str) -> Result<NaiveDateTime, LoadError> {
    let bad = || LoadError::corrupt(path, format!("invalid start {date} {time}"));
    let parts = |s: &str| -> Option<Vec<u32>> {
        let parts: Option<Vec<u32>> = s.split('.').map(|p| p.trim().parse().ok()).collect();
        parts.filter(|p| p.len() == 3)
    };
    let d = parts(date).ok_or_else(bad)?;
    let t = parts(time).ok_or_else(bad)?;
    let year = d[2] as i32 + if d[2] > 84 { 1900 } else { 2000 };
    let date = NaiveDate::from_ymd_opt(year, d[1], d[0]).ok_or_else(bad)?;
    let time = NaiveTime::from_hms_opt(t[0], t[1], t[2]).ok_or_else(bad)?;
    Ok(NaiveDateTime::new(date, time))
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<EdfHeader, LoadError> {
    if bytes.len() < MAIN_HEADER_LEN {
        return Err(LoadError::corrupt(path, "shorter than the main header"));
    }
    let main = Fields { path, bytes };
    if !main.text(0, 8)?.starts_with('0') {
        return Err(LoadError::unsupported(path, "not an EDF file"));
    }
    let start = parse_start(path, &main.text(168, 8)?, &main.text(176, 8)?)?;
    let header_bytes: usize = main.number(184, 8, "header size")?;
    let declared_records: i64 = main.number(236, 8, "record count")?;
    let record_duration: f64 = main.number(244, 8, "record duration")?;
    let ns: usize = main.number(252, 4, "signal count")?;

    if ns == 0 {
        return Err(LoadError::corrupt(path, "no signals"));
    }
    if header_bytes != MAIN_HEADER_LEN + ns * SIGNAL_HEADER_LEN {
        return Err(LoadError::corrupt(
            path,
            format!("header size {header_bytes} does not match {ns} signals"),
        ));
    }
    if !(record_duration > 0.0) {
        return Err(LoadError::unsupported(path, "record duration must be positive"));
    }

    let block = Fields {
        path,
        bytes: bytes
            .get(MAIN_HEADER_LEN..header_bytes)
            .ok_or_else(|| LoadError::corrupt(path, "signal headers truncated"))?,
    };
    // Field blocks are laid out field-major: all labels, then all transducers, ...
    let at = |offset: usize, width: usize, i: usize| offset * ns + i * width;
    let mut signals = Vec::with_capacity(ns);
    for i in 0..ns {
        signals.push(SignalHeader {
            label: block.text(at(0, 16, i), 16)?,
            physical_min: block.number(at(104, 8, i), 8, "physical minimum")?,
            physical_max: block.number(at(112, 8, i), 8, "physical maximum")?,
            digital_min: block.number(at(120, 8, i), 8, "digital minimum")?,
            digital_max: block.number(at(128, 8, i), 8, "digital maximum")?,
            samples_per_record: block.number(at(216, 8, i), 8, "samples per record")?,
        });
    }

    let mut header = EdfHeader {
        start,
        header_bytes,
        n_records: 0,
        record_duration,
        signals,
    };
    let record_bytes = header.record_bytes();
    if record_bytes == 0 {
        return Err(LoadError::corrupt(path, "empty data records"));
    }
    let available = (bytes.len() - header_bytes) / record_bytes;
    header.n_records = if declared_records < 0 {
        available
    } else {
        let declared = declared_records as usize;
        if declared > available {
            return Err(LoadError::corrupt(
                path,
                format!("{declared} records declared, {available} present"),
            ));
        }
        declared
    };
    Ok(header)
}

fn decode(path: &Path, bytes: &[u8]) -> Result<RawRecording, LoadError> {
    let header = parse_header(path, bytes)?;
    let data_signals: Vec<(usize, &SignalHeader)> = header
        .signals
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_annotation())
        .collect();
    let spr = match data_signals.first() {
        Some((_, s)) => s.samples_per_record,
        None => return Err(LoadError::unsupported(path, "no data signals")),
    };
    if data_signals.iter().any(|(_, s)| s.samples_per_record != spr) {
        return Err(LoadError::unsupported(path, "signals have different sample rates"));
    }

    // Byte offset of each signal within a data record
    let offsets: Vec<usize> = header
        .signals
        .iter()
        .scan(0usize, |acc, s| {
            let start = *acc;
            *acc += s.samples_per_record * 2;
            Some(start)
        })
        .collect();

    let record_bytes = header.record_bytes();
    let n_samples = header.n_records * spr;
    let mut samples = Array2::<f32>::zeros((n_samples, data_signals.len()));
    for record in 0..header.n_records {
        let base = header.header_bytes + record * record_bytes;
        for (col, (sig_idx, sig)) in data_signals.iter().enumerate() {
            let start = base + offsets[*sig_idx];
            for k in 0..spr {
                let at = start + 2 * k;
                let digital = i16::from_le_bytes([bytes[at], bytes[at + 1]]);
                samples[[record * spr + k, col]] = sig.to_physical(digital);
            }
        }
    }

    Ok(RawRecording {
        samples,
        sample_rate: spr as f64 / header.record_duration,
        start_local: header.start,
        duration_secs: header.n_records as f64 * header.record_duration,
    })
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, LoadError> {
    std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LoadError::Missing(path.to_path_buf()),
        _ => LoadError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

impl ChannelGroupReader for EdfReader {
    fn read(&self, path: &Path) -> Result<RawRecording, LoadError> {
        let bytes = read_bytes(path)?;
        decode(path, &bytes)
    }

    fn read_start(&self, path: &Path) -> Result<NaiveDateTime, LoadError> {
        let bytes = read_bytes(path)?;
        if bytes.len() < MAIN_HEADER_LEN {
            return Err(LoadError::corrupt(path, "shorter than the main header"));
        }
        let main = Fields { path, bytes: &bytes };
        parse_start(path, &main.text(168, 8)?, &main.text(176, 8)?)
    }
}
