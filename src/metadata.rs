//! Run fingerprints and reproducibility tracking.

use crate::types::{EquityPoint, TradeRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::warn;

/// Metadata about a price file used in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileMetadata {
    /// File path.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// SHA256 checksum of the file contents.
    pub checksum: String,
}

/// Hashes identifying a run's inputs and outputs.
///
/// Two runs with equal fingerprints produced bit-identical equity paths and
/// trade logs from the same configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFingerprint {
    pub config_hash: String,
    pub equity_hash: String,
    pub trades_hash: String,
}

impl RunFingerprint {
    pub fn compute<T: Serialize>(config: &T, equity: &[EquityPoint], trades: &[TradeRecord]) -> Self {
        Self {
            config_hash: compute_config_hash(config),
            equity_hash: fingerprint_equity(equity),
            trades_hash: fingerprint_trades(trades),
        }
    }
}

/// Compute SHA256 checksum of a file.
pub fn compute_file_checksum(path: impl AsRef<Path>) -> std::io::Result<String> {
    let data = std::fs::read(path.as_ref())?;
    Ok(compute_hash(&data))
}

/// Compute SHA256 hash of arbitrary bytes.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute configuration hash from JSON serialization.
pub fn compute_config_hash<T: Serialize>(config: &T) -> String {
    match serde_json::to_vec(config) {
        Ok(bytes) => compute_hash(&bytes),
        Err(e) => {
            warn!("Failed to serialize config for hashing: {}", e);
            String::new()
        }
    }
}

/// Hash of the exact bit patterns of an equity path.
pub fn fingerprint_equity(points: &[EquityPoint]) -> String {
    let mut hasher = Sha256::new();
    for p in points {
        hasher.update(p.date.to_string().as_bytes());
        for v in [p.value, p.cash, p.positions_value] {
            hasher.update(v.to_bits().to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Hash of a trade log, field by field.
pub fn fingerprint_trades(trades: &[TradeRecord]) -> String {
    let mut hasher = Sha256::new();
    for t in trades {
        hasher.update(t.date.to_string().as_bytes());
        hasher.update(t.asset.as_bytes());
        hasher.update(t.shares.to_le_bytes());
        for v in [t.price, t.value, t.commission] {
            hasher.update(v.to_bits().to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Track data file metadata.
pub fn track_data_file(path: impl AsRef<Path>) -> std::io::Result<DataFileMetadata> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    let checksum = compute_file_checksum(path)?;

    Ok(DataFileMetadata {
        path: path.display().to_string(),
        size,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::NaiveDate;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn point(day: u32, value: f64) -> EquityPoint {
        EquityPoint {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            value,
            cash: value,
            positions_value: 0.0,
            drawdown: 0.0,
            drawdown_pct: 0.0,
        }
    }

    #[test]
    fn test_compute_file_checksum() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "test data").unwrap();
        temp_file.flush().unwrap();

        let checksum = compute_file_checksum(temp_file.path()).unwrap();
        assert_eq!(checksum.len(), 64);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_equity_fingerprint_sensitive_to_last_bit() {
        let a = vec![point(2, 100.0), point(3, 101.0)];
        let b = vec![point(2, 100.0), point(3, f64::from_bits(101.0f64.to_bits() + 1))];
        assert_eq!(fingerprint_equity(&a), fingerprint_equity(&a.clone()));
        assert_ne!(fingerprint_equity(&a), fingerprint_equity(&b));
    }

    #[test]
    fn test_trade_fingerprint() {
        let trade = TradeRecord {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            asset: "SPY".to_string(),
            shares: 100,
            price: 400.0,
            value: 40_000.0,
            commission: 12.0,
            side: Side::Buy,
        };
        let mut other = trade.clone();
        other.shares = 200;
        assert_ne!(fingerprint_trades(&[trade.clone()]), fingerprint_trades(&[other]));
        assert_eq!(fingerprint_trades(&[]), compute_hash(b""));
    }

    #[test]
    fn test_track_data_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "date,SPY").unwrap();
        temp_file.flush().unwrap();

        let metadata = track_data_file(temp_file.path()).unwrap();
        assert!(metadata.size > 0);
        assert_eq!(metadata.checksum.len(), 64);
    }
}
