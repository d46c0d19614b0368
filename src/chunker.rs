//! Time-bucketed chunk files
//!
//! A padded session table is cut at bucket boundaries and each piece is
//! written as one file named by its UTC bucket start. The exact first-row
//! instant and sample rate go into the file metadata, so a partial leading
//! chunk keeps its time axis.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{Config, Granularity};
use crate::error::{chunk_io, ChunkError, IoContext};
use crate::grid::SampleGrid;
use crate::store::{ColumnarStore, StoredTable};
use crate::types::{SessionTable, COLUMNS};

const NAME_FORMAT: &str = "UTC-%Y_%m_%d-%H_%M_%S";
const META_FIRST_SAMPLE: &str = "first_sample";
const META_SAMPLE_RATE: &str = "sample_rate";

/// A chunk file and the UTC start encoded in its name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkFile {
    pub start: DateTime<Utc>,
    pub path: PathBuf,
}

/// File stem for a chunk starting at `t`
pub fn chunk_stem(t: DateTime<Utc>) -> String {
    t.format(NAME_FORMAT).to_string()
}

/// UTC start encoded in a chunk file name
pub fn parse_chunk_name(path: &Path) -> Result<DateTime<Utc>, ChunkError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| NaiveDateTime::parse_from_str(s, NAME_FORMAT).ok())
        .map(|t| t.and_utc())
        .ok_or_else(|| ChunkError::BadName(path.to_path_buf()))
}

pub struct Chunker {
    store: Arc<dyn ColumnarStore>,
    grid: SampleGrid,
    bucket: Granularity,
}

impl Chunker {
    pub fn new(config: &Config, store: Arc<dyn ColumnarStore>) -> Self {
        Self {
            store,
            grid: SampleGrid::new(config.sample_rate),
            bucket: config.bucket,
        }
    }

    pub fn grid(&self) -> SampleGrid {
        self.grid
    }

    pub fn bucket(&self) -> Granularity {
        self.bucket
    }

    /// Chunk file name for a chunk starting at `t`
    pub fn file_name(&self, t: DateTime<Utc>) -> String {
        format!("{}.{}", chunk_stem(t), self.store.extension())
    }

    /// Whether `t` lies on a bucket boundary
    pub fn is_bucket_start(&self, t: DateTime<Utc>) -> bool {
        t.timestamp_subsec_nanos() == 0 && t.timestamp().rem_euclid(self.bucket.seconds()) == 0
    }

    /// Write one chunk file.
    pub fn write_chunk(&self, path: &Path, table: &SessionTable) -> Result<(), ChunkError> {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            META_FIRST_SAMPLE.to_string(),
            table
                .start_time()
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        metadata.insert(META_SAMPLE_RATE.to_string(), table.sample_rate.to_string());
        let stored = StoredTable {
            columns: COLUMNS.iter().map(|c| c.to_string()).collect(),
            data: table.data.clone(),
            metadata,
        };
        self.store.write(path, &stored)?;
        Ok(())
    }

    /// Write a table as bucketed chunks into `session_dir`, replacing any
    /// previous contents. Returns the written paths in time order.
    pub fn write(&self, table: &SessionTable, session_dir: &Path) -> Result<Vec<PathBuf>, ChunkError> {
        let parent = session_dir.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).with_path(parent, chunk_io)?;
        let name = session_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let staging = parent.join(format!(".{}.{}.partial", name, Uuid::new_v4()));
        std::fs::create_dir(&staging).with_path(&staging, chunk_io)?;

        let written = match self.write_buckets(table, &staging) {
            Ok(names) => names,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(e);
            }
        };

        if session_dir.exists() {
            std::fs::remove_dir_all(session_dir).with_path(session_dir, chunk_io)?;
        }
        std::fs::rename(&staging, session_dir).with_path(session_dir, chunk_io)?;
        Ok(written.into_iter().map(|n| session_dir.join(n)).collect())
    }

    fn write_buckets(&self, table: &SessionTable, dir: &Path) -> Result<Vec<String>, ChunkError> {
        let step = self.grid.step(self.bucket);
        let mut names = Vec::new();
        let mut bucket = self.grid.floor(table.start_tick, self.bucket);
        while bucket < table.end_tick() {
            let piece = table.slice_ticks(bucket, bucket + step);
            if !piece.is_empty() {
                let name = self.file_name(self.grid.instant_of(bucket));
                self.write_chunk(&dir.join(&name), &piece)?;
                names.push(name);
            }
            bucket += step;
        }
        Ok(names)
    }

    /// Load one chunk with its time axis.
    pub fn read(&self, path: &Path) -> Result<SessionTable, ChunkError> {
        let bucket_start = parse_chunk_name(path)?;
        let stored = self.store.read(path)?;
        let schema = |reason: String| ChunkError::Schema {
            path: path.to_path_buf(),
            reason,
        };
        if stored.columns.iter().map(String::as_str).ne(COLUMNS.iter().copied()) {
            return Err(schema(format!("columns {:?}", stored.columns)));
        }
        if let Some(rate) = stored.metadata.get(META_SAMPLE_RATE) {
            if rate.parse::<u32>().ok() != Some(self.grid.rate()) {
                return Err(schema(format!("sample rate {rate}")));
            }
        }
        let first = match stored.metadata.get(META_FIRST_SAMPLE) {
            Some(s) => DateTime::parse_from_rfc3339(s)
                .map_err(|_| schema(format!("first_sample {s:?}")))?
                .with_timezone(&Utc),
            None => bucket_start,
        };
        Ok(SessionTable::new(
            self.grid.rate(),
            self.grid.tick_of(first),
            stored.data,
        ))
    }

    /// Chunk files directly inside `session_dir`, in time order.
    pub fn list(&self, session_dir: &Path) -> Result<Vec<ChunkFile>, ChunkError> {
        let mut chunks = Vec::new();
        for entry in std::fs::read_dir(session_dir).with_path(session_dir, chunk_io)? {
            let path = entry.with_path(session_dir, chunk_io)?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(self.store.extension()) {
                continue;
            }
            match parse_chunk_name(&path) {
                Ok(start) => chunks.push(ChunkFile { start, path }),
                Err(_) => log::debug!("Ignoring {}", path.display()),
            }
        }
        chunks.sort();
        Ok(chunks)
    }

    /// Load two neighbouring chunks of one session as one continuous table.
    pub fn join(&self, a: &Path, b: &Path) -> Result<SessionTable, ChunkError> {
        if a.parent() != b.parent() {
            return Err(ChunkError::NotSameSession(a.to_path_buf(), b.to_path_buf()));
        }
        let start_a = parse_chunk_name(a)?;
        let start_b = parse_chunk_name(b)?;
        if start_b - start_a != chrono::TimeDelta::seconds(self.bucket.seconds()) {
            return Err(ChunkError::NotAdjacent(a.to_path_buf(), b.to_path_buf()));
        }
        let first = self.read(a)?;
        let second = self.read(b)?;
        if first.end_tick() != second.start_tick {
            return Err(ChunkError::NotAdjacent(a.to_path_buf(), b.to_path_buf()));
        }
        first.append(&second).map_err(|e| ChunkError::Schema {
            path: b.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
