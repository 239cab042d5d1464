//! Empirical MFU lookup tables.
//!
//! The roofline model scales peak FLOPs by a measured model-FLOP-
//! utilization factor. MFU varies with the workload shape, so the database
//! holds three CSV-backed tables per GPU:
//!
//! - `mha/prefill/<gpu>/<config>.csv`: (seq_len, mfu), linear
//!   interpolation over sequence length
//! - `mha/decode/<gpu>/<config>-tp<n>.csv`: (batch_size, kv_len, mfu),
//!   bilinear interpolation over the (batch, kv) grid
//! - `gemm/<gpu>/data.csv`: (m, k, n, mfu), nearest (k, n) group then
//!   linear interpolation over m
//!
//! Every value must parse finite and non-negative; anything else is a
//! load-time error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MfuError {
    #[error("failed to read benchmark file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse benchmark file {path}: {message}")]
    Csv { path: PathBuf, message: String },

    #[error("benchmark file {path} row {row}: MFU value {value} is not finite and non-negative")]
    BadValue {
        path: PathBuf,
        row: usize,
        value: f64,
    },

    #[error("benchmark file {path} has no rows")]
    Empty { path: PathBuf },
}

#[derive(Debug, Deserialize)]
struct PrefillRow {
    seq_len: u64,
    mfu: f64,
}

#[derive(Debug, Deserialize)]
struct DecodeRow {
    batch_size: u64,
    kv_len: u64,
    mfu: f64,
}

#[derive(Debug, Deserialize)]
struct GemmRow {
    m: u64,
    k: u64,
    n: u64,
    mfu: f64,
}

/// CSV-backed MFU tables for one (GPU, model config, TP) combination.
#[derive(Debug, Clone)]
pub struct MfuDatabase {
    /// (seq_len, mfu), sorted by seq_len.
    prefill: Vec<(f64, f64)>,
    /// batch_size -> (kv_len, mfu) rows sorted by kv_len.
    decode: BTreeMap<u64, Vec<(f64, f64)>>,
    /// (k, n) -> (m, mfu) rows sorted by m.
    gemm: BTreeMap<(u64, u64), Vec<(f64, f64)>>,
}

impl MfuDatabase {
    /// Load the three tables from the benchmark directory layout.
    pub fn load(root: &Path, gpu: &str, config: &str, tp: usize) -> Result<Self, MfuError> {
        let prefill_path = root
            .join("mha")
            .join("prefill")
            .join(gpu)
            .join(format!("{config}.csv"));
        let decode_path = root
            .join("mha")
            .join("decode")
            .join(gpu)
            .join(format!("{config}-tp{tp}.csv"));
        let gemm_path = root.join("gemm").join(gpu).join("data.csv");

        let mut prefill = Vec::new();
        for (row_index, row) in read_rows::<PrefillRow>(&prefill_path)?.into_iter().enumerate() {
            check_value(&prefill_path, row_index, row.mfu)?;
            prefill.push((row.seq_len as f64, row.mfu));
        }
        prefill.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut decode: BTreeMap<u64, Vec<(f64, f64)>> = BTreeMap::new();
        for (row_index, row) in read_rows::<DecodeRow>(&decode_path)?.into_iter().enumerate() {
            check_value(&decode_path, row_index, row.mfu)?;
            decode
                .entry(row.batch_size)
                .or_default()
                .push((row.kv_len as f64, row.mfu));
        }
        for rows in decode.values_mut() {
            rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        }

        let mut gemm: BTreeMap<(u64, u64), Vec<(f64, f64)>> = BTreeMap::new();
        for (row_index, row) in read_rows::<GemmRow>(&gemm_path)?.into_iter().enumerate() {
            check_value(&gemm_path, row_index, row.mfu)?;
            gemm.entry((row.k, row.n))
                .or_default()
                .push((row.m as f64, row.mfu));
        }
        for rows in gemm.values_mut() {
            rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        }

        Self::from_tables(prefill, decode, gemm).ok_or(MfuError::Empty {
            path: prefill_path,
        })
    }

    /// Build from in-memory tables. Returns `None` if any table is empty;
    /// used by tests and by callers that bring their own benchmark data.
    pub fn from_tables(
        prefill: Vec<(f64, f64)>,
        decode: BTreeMap<u64, Vec<(f64, f64)>>,
        gemm: BTreeMap<(u64, u64), Vec<(f64, f64)>>,
    ) -> Option<Self> {
        if prefill.is_empty() || decode.is_empty() || gemm.is_empty() {
            return None;
        }
        Some(Self {
            prefill,
            decode,
            gemm,
        })
    }

    /// Prefill MFU at the given chunk length, linearly interpolated.
    pub fn prefill_mfu(&self, seq_len: usize) -> f64 {
        interpolate(&self.prefill, seq_len as f64)
    }

    /// Decode MFU, bilinear over the (batch size, KV length) grid.
    pub fn decode_mfu(&self, batch_size: usize, kv_len: usize) -> f64 {
        let batch = batch_size as u64;
        let kv = kv_len as f64;

        let below = self.decode.range(..=batch).next_back();
        let above = self.decode.range(batch..).next();
        match (below, above) {
            (Some((&b0, rows0)), Some((&b1, rows1))) => {
                let v0 = interpolate(rows0, kv);
                if b0 == b1 {
                    return v0;
                }
                let v1 = interpolate(rows1, kv);
                let t = (batch_size as f64 - b0 as f64) / (b1 as f64 - b0 as f64);
                v0 + (v1 - v0) * t
            }
            (Some((_, rows)), None) | (None, Some((_, rows))) => interpolate(rows, kv),
            (None, None) => unreachable!("decode table is non-empty"),
        }
    }

    /// GEMM MFU: nearest (k, n) group, then linear interpolation over m.
    pub fn gemm_mfu(&self, m: usize, k: usize, n: usize) -> f64 {
        let target_k = k as f64;
        let target_n = n as f64;
        let (_, rows) = self
            .gemm
            .iter()
            .min_by(|(a, _), (b, _)| {
                let da = (a.0 as f64 - target_k).abs() + (a.1 as f64 - target_n).abs();
                let db = (b.0 as f64 - target_k).abs() + (b.1 as f64 - target_n).abs();
                da.total_cmp(&db).then_with(|| a.cmp(b))
            })
            .expect("gemm table is non-empty");
        interpolate(rows, m as f64)
    }
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, MfuError> {
    let file = std::fs::File::open(path).map_err(|source| MfuError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::Reader::from_reader(file);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: T = record.map_err(|e| MfuError::Csv {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(MfuError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(rows)
}

fn check_value(path: &Path, row: usize, value: f64) -> Result<(), MfuError> {
    if !value.is_finite() || value < 0.0 {
        return Err(MfuError::BadValue {
            path: path.to_path_buf(),
            row,
            value,
        });
    }
    Ok(())
}

/// Linear interpolation over sorted (x, y) points, clamped at the ends.
fn interpolate(points: &[(f64, f64)], x: f64) -> f64 {
    debug_assert!(!points.is_empty());
    if x <= points[0].0 {
        return points[0].1;
    }
    if let Some(last) = points.last() {
        if x >= last.0 {
            return last.1;
        }
    }
    for window in points.windows(2) {
        let (x0, y0) = window[0];
        let (x1, y1) = window[1];
        if x >= x0 && x <= x1 {
            if x1 == x0 {
                return y0;
            }
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    points.last().map(|p| p.1).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> MfuDatabase {
        let prefill = vec![(128.0, 0.2), (512.0, 0.4), (2048.0, 0.5)];
        let mut decode = BTreeMap::new();
        decode.insert(1, vec![(128.0, 0.05), (1024.0, 0.10)]);
        decode.insert(8, vec![(128.0, 0.20), (1024.0, 0.40)]);
        let mut gemm = BTreeMap::new();
        gemm.insert((4096, 4096), vec![(16.0, 0.1), (256.0, 0.6)]);
        gemm.insert((4096, 11008), vec![(16.0, 0.15), (256.0, 0.7)]);
        MfuDatabase::from_tables(prefill, decode, gemm).unwrap()
    }

    #[test]
    fn test_prefill_interpolation_and_clamping() {
        let db = database();
        assert!((db.prefill_mfu(128) - 0.2).abs() < 1e-9);
        assert!((db.prefill_mfu(320) - 0.3).abs() < 1e-9);
        assert!((db.prefill_mfu(64) - 0.2).abs() < 1e-9);
        assert!((db.prefill_mfu(10_000) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_bilinear() {
        let db = database();
        // Exact corners.
        assert!((db.decode_mfu(1, 128) - 0.05).abs() < 1e-9);
        assert!((db.decode_mfu(8, 1024) - 0.40).abs() < 1e-9);
        // Midpoint in both axes: kv 576 -> (0.075, 0.30), batch 4.5/7 of
        // the way... batch 4 is 3/7 between 1 and 8.
        let v = db.decode_mfu(4, 576);
        let row1 = 0.075;
        let row8 = 0.30;
        let expected = row1 + (row8 - row1) * (3.0 / 7.0);
        assert!((v - expected).abs() < 1e-9);
    }

    #[test]
    fn test_gemm_two_stage() {
        let db = database();
        // Nearest group (4096, 4096), midpoint of m.
        let v = db.gemm_mfu(136, 4096, 4000);
        assert!((v - 0.35).abs() < 1e-9);
        // Closer to the (4096, 11008) group.
        let v = db.gemm_mfu(16, 4096, 11000);
        assert!((v - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let gpu_prefill = root.join("mha/prefill/h100");
        let gpu_decode = root.join("mha/decode/h100");
        let gpu_gemm = root.join("gemm/h100");
        std::fs::create_dir_all(&gpu_prefill).unwrap();
        std::fs::create_dir_all(&gpu_decode).unwrap();
        std::fs::create_dir_all(&gpu_gemm).unwrap();

        std::fs::write(
            gpu_prefill.join("llama-3-8b.csv"),
            "seq_len,mfu\n128,0.2\n512,0.4\n",
        )
        .unwrap();
        std::fs::write(
            gpu_decode.join("llama-3-8b-tp1.csv"),
            "batch_size,kv_len,mfu\n1,128,0.05\n1,1024,0.1\n",
        )
        .unwrap();
        std::fs::write(gpu_gemm.join("data.csv"), "m,k,n,mfu\n16,4096,4096,0.1\n").unwrap();

        let db = MfuDatabase::load(root, "h100", "llama-3-8b", 1).unwrap();
        assert!((db.prefill_mfu(512) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_negative_mfu_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("mha/prefill/h100")).unwrap();
        std::fs::write(
            root.join("mha/prefill/h100/m.csv"),
            "seq_len,mfu\n128,-0.5\n",
        )
        .unwrap();
        let err = MfuDatabase::load(root, "h100", "m", 1);
        assert!(matches!(err, Err(MfuError::BadValue { .. })));
    }
}
