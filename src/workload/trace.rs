//! CSV trace ingestion.
//!
//! Row shape: `id, arrival_delta, input_tokens, output_tokens` plus
//! optional `slo_class, tenant, model` columns. Arrival deltas are ticks
//! between consecutive requests; absolute arrival times are their running
//! sum. Token contents are synthesized deterministically from the request
//! ID so a trace replays identically on every run.

use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::core::request::{Request, SloClass};
use crate::workload::{WorkloadError, VOCAB};

#[derive(Debug, Deserialize)]
struct TraceRow {
    id: u64,
    arrival_delta: u64,
    input_tokens: usize,
    output_tokens: usize,
    #[serde(default)]
    slo_class: String,
    #[serde(default)]
    tenant: String,
    #[serde(default)]
    model: String,
}

/// Deterministic token sequence for one request.
fn tokens_for(id: u64, stream: u64, count: usize) -> Vec<u32> {
    let mut rng = ChaCha8Rng::seed_from_u64(id ^ (stream << 32));
    (0..count).map(|_| rng.gen_range(0..VOCAB)).collect()
}

/// Read a trace file into requests ordered by arrival.
pub fn read_trace(path: &Path) -> Result<Vec<Request>, WorkloadError> {
    let file = std::fs::File::open(path).map_err(|source| WorkloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut requests = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut clock = 0u64;

    for (row_index, record) in reader.deserialize().enumerate() {
        let row: TraceRow = record.map_err(|e| WorkloadError::Csv {
            path: path.to_path_buf(),
            row: row_index + 1,
            message: e.to_string(),
        })?;

        if !seen.insert(row.id) {
            return Err(WorkloadError::DuplicateId {
                path: path.to_path_buf(),
                id: row.id,
            });
        }

        clock += row.arrival_delta;
        let mut req = Request::new(
            row.id,
            tokens_for(row.id, 0, row.input_tokens),
            tokens_for(row.id, 1, row.output_tokens),
        );
        req.arrival_time = clock;
        req.slo_class = SloClass::parse(&row.slo_class);
        req.tenant_id = row.tenant;
        req.model = row.model;
        requests.push(req);
    }

    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_trace(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_reads_rows_with_cumulative_arrivals() {
        let file = write_trace(
            "id,arrival_delta,input_tokens,output_tokens,slo_class,tenant,model\n\
             1,1000,30,5,critical,acme,llama-3-8b\n\
             2,500,64,10,,,\n",
        );
        let requests = read_trace(file.path()).unwrap();
        assert_eq!(requests.len(), 2);

        assert_eq!(requests[0].arrival_time, 1000);
        assert_eq!(requests[0].input_len(), 30);
        assert_eq!(requests[0].output_len(), 5);
        assert_eq!(requests[0].slo_class, SloClass::Critical);
        assert_eq!(requests[0].tenant_id, "acme");

        assert_eq!(requests[1].arrival_time, 1500);
        assert_eq!(requests[1].slo_class, SloClass::None);
    }

    #[test]
    fn test_token_contents_deterministic() {
        let file = write_trace(
            "id,arrival_delta,input_tokens,output_tokens\n7,0,32,4\n",
        );
        let a = read_trace(file.path()).unwrap();
        let b = read_trace(file.path()).unwrap();
        assert_eq!(a[0].input_tokens, b[0].input_tokens);
        assert_eq!(a[0].output_tokens, b[0].output_tokens);
        assert!(a[0].input_tokens.iter().all(|&t| t < VOCAB));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let file = write_trace(
            "id,arrival_delta,input_tokens,output_tokens\n1,0,8,1\n1,10,8,1\n",
        );
        assert!(matches!(
            read_trace(file.path()),
            Err(WorkloadError::DuplicateId { id: 1, .. })
        ));
    }

    #[test]
    fn test_malformed_row_reports_position() {
        let file = write_trace(
            "id,arrival_delta,input_tokens,output_tokens\n1,0,not-a-number,1\n",
        );
        assert!(matches!(
            read_trace(file.path()),
            Err(WorkloadError::Csv { row: 1, .. })
        ));
    }
}
