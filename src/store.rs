//! Columnar chunk files
//!
//! Chunks are stored in the safetensors layout: an 8-byte little-endian header
//! length, a JSON header describing each tensor, then the raw tensor bytes.
//! Each column is one F32 tensor of shape `[rows]`; string metadata lives
//! under the `__metadata__` key.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::error::{store_io, IoContext, StoreError};

const METADATA_KEY: &str = "__metadata__";

/// A table as it is written to or read from a chunk file
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTable {
    pub columns: Vec<String>,
    /// Rows x columns
    pub data: Array2<f32>,
    pub metadata: BTreeMap<String, String>,
}

/// Trait for columnar chunk writers/readers
pub trait ColumnarStore: Send + Sync {
    /// File extension without the dot
    fn extension(&self) -> &str;

    fn write(&self, path: &Path, table: &StoredTable) -> Result<(), StoreError>;

    fn read(&self, path: &Path) -> Result<StoredTable, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum HeaderEntry {
    Tensor(TensorInfo),
    Metadata(BTreeMap<String, String>),
}

/// Safetensors-format chunk store
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsStore;

impl SafetensorsStore {
    fn malformed(path: &Path, reason: impl Into<String>) -> StoreError {
        StoreError::Malformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

impl ColumnarStore for SafetensorsStore {
    fn extension(&self) -> &str {
        "safetensors"
    }

    fn write(&self, path: &Path, table: &StoredTable) -> Result<(), StoreError> {
        if table.columns.len() != table.data.ncols() {
            return Err(Self::malformed(
                path,
                format!(
                    "{} column names for {} columns",
                    table.columns.len(),
                    table.data.ncols()
                ),
            ));
        }
        let rows = table.data.nrows();
        let mut header: BTreeMap<String, HeaderEntry> = BTreeMap::new();
        let mut body: Vec<u8> = Vec::with_capacity(rows * table.columns.len() * 4);
        for (j, name) in table.columns.iter().enumerate() {
            let start = body.len();
            body.extend(table.data.column(j).iter().flat_map(|v| v.to_le_bytes()));
            header.insert(
                name.clone(),
                HeaderEntry::Tensor(TensorInfo {
                    dtype: "F32".to_string(),
                    shape: vec![rows],
                    data_offsets: [start, body.len()],
                }),
            );
        }
        if !table.metadata.is_empty() {
            header.insert(
                METADATA_KEY.to_string(),
                HeaderEntry::Metadata(table.metadata.clone()),
            );
        }

        let mut header_bytes = serde_json::to_vec(&header)?;
        let pad = (8 - header_bytes.len() % 8) % 8;
        header_bytes.extend(std::iter::repeat(b' ').take(pad));

        let mut f = std::fs::File::create(path).with_path(path, store_io)?;
        f.write_all(&(header_bytes.len() as u64).to_le_bytes())
            .and_then(|_| f.write_all(&header_bytes))
            .and_then(|_| f.write_all(&body))
            .and_then(|_| f.sync_all())
            .with_path(path, store_io)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<StoredTable, StoreError> {
        let bytes = std::fs::read(path).with_path(path, store_io)?;
        let len_bytes: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Self::malformed(path, "file too small"))?;
        let n = u64::from_le_bytes(len_bytes) as usize;
        let data_start = 8usize
            .checked_add(n)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| Self::malformed(path, "header length out of range"))?;
        let header: BTreeMap<String, HeaderEntry> = serde_json::from_slice(&bytes[8..data_start])?;

        let mut metadata = BTreeMap::new();
        let mut tensors: Vec<(String, TensorInfo)> = Vec::new();
        for (name, entry) in header {
            match entry {
                HeaderEntry::Metadata(m) if name == METADATA_KEY => metadata = m,
                HeaderEntry::Metadata(_) => {
                    return Err(Self::malformed(path, format!("entry {name} is not a tensor")))
                }
                HeaderEntry::Tensor(info) => tensors.push((name, info)),
            }
        }
        // Columns are laid out in write order
        tensors.sort_by_key(|(_, info)| info.data_offsets[0]);

        let rows = tensors
            .first()
            .and_then(|(_, info)| info.shape.first().copied())
            .unwrap_or(0);
        let body = &bytes[data_start..];
        let mut data = Array2::<f32>::zeros((rows, tensors.len()));
        for (j, (name, info)) in tensors.iter().enumerate() {
            if info.dtype != "F32" || info.shape != [rows] {
                return Err(Self::malformed(
                    path,
                    format!("column {name} is {} {:?}, expected F32 [{rows}]", info.dtype, info.shape),
                ));
            }
            let [s, e] = info.data_offsets;
            let raw = body
                .get(s..e)
                .filter(|raw| raw.len() == rows * 4)
                .ok_or_else(|| Self::malformed(path, format!("column {name} out of range")))?;
            for (i, b) in raw.chunks_exact(4).enumerate() {
                data[[i, j]] = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
        }

        Ok(StoredTable {
            columns: tensors.into_iter().map(|(name, _)| name).collect(),
            data,
            metadata,
        })
    }
}
