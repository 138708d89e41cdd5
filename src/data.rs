//! Price data: the date-aligned price table and the wide CSV loader.
//!
//! A [`PriceSeries`] is built once per run and never mutated. It guarantees a
//! non-empty universe, unique asset names, strictly increasing dates and one
//! value per asset on every row. Prices themselves are not required to be
//! valid: a non-positive or non-finite price is rejected later, where it is
//! used (an execution leg or a return window).

use crate::error::{BacktestError, Result};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Date-ordered, asset-keyed price table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    assets: Vec<String>,
    dates: Vec<NaiveDate>,
    /// Row-major: `rows[day][asset]`.
    rows: Vec<Vec<f64>>,
}

impl PriceSeries {
    /// Build a validated price table.
    pub fn new(assets: Vec<String>, dates: Vec<NaiveDate>, rows: Vec<Vec<f64>>) -> Result<Self> {
        if assets.is_empty() {
            return Err(BacktestError::ConfigError("Empty asset universe".to_string()));
        }

        let mut seen = HashSet::new();
        for asset in &assets {
            if !seen.insert(asset.as_str()) {
                return Err(BacktestError::ConfigError(format!(
                    "Duplicate asset in universe: {}",
                    asset
                )));
            }
        }

        if dates.len() != rows.len() {
            return Err(BacktestError::DataError(format!(
                "{} dates but {} price rows",
                dates.len(),
                rows.len()
            )));
        }

        for (i, window) in dates.windows(2).enumerate() {
            if window[1] <= window[0] {
                return Err(BacktestError::DataError(format!(
                    "Dates not strictly increasing at row {}: {} then {}",
                    i + 1,
                    window[0],
                    window[1]
                )));
            }
        }

        for (i, row) in rows.iter().enumerate() {
            if row.len() != assets.len() {
                return Err(BacktestError::DataError(format!(
                    "Row {} ({}) has {} prices, expected {}",
                    i,
                    dates[i],
                    row.len(),
                    assets.len()
                )));
            }
        }

        Ok(Self {
            assets,
            dates,
            rows,
        })
    }

    /// Build from per-asset columns of equal length.
    pub fn from_columns(
        assets: Vec<String>,
        dates: Vec<NaiveDate>,
        columns: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if columns.len() != assets.len() {
            return Err(BacktestError::DataError(format!(
                "{} assets but {} price columns",
                assets.len(),
                columns.len()
            )));
        }
        if let Some(bad) = columns.iter().position(|c| c.len() != dates.len()) {
            return Err(BacktestError::DataError(format!(
                "Column {} has {} prices, expected {}",
                assets[bad],
                columns[bad].len(),
                dates.len()
            )));
        }

        let rows = (0..dates.len())
            .map(|t| columns.iter().map(|c| c[t]).collect())
            .collect();
        Self::new(assets, dates, rows)
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn n_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn asset_index(&self, asset: &str) -> Option<usize> {
        self.assets.iter().position(|a| a == asset)
    }

    /// Prices of every asset on one day, in universe order.
    pub fn row(&self, day: usize) -> &[f64] {
        &self.rows[day]
    }

    pub fn date(&self, day: usize) -> NaiveDate {
        self.dates[day]
    }

    /// Prices of one asset over rows `0..=through`, without copying.
    pub fn column_iter(&self, asset: usize, through: usize) -> impl Iterator<Item = f64> + '_ {
        let end = through.saturating_add(1).min(self.len());
        self.rows[..end].iter().map(move |r| r[asset])
    }

    /// The last `len` prices of one asset up to and including row `through`.
    /// Shorter near the start of the series.
    pub fn column_tail(&self, asset: usize, through: usize, len: usize) -> Vec<f64> {
        let end = through.saturating_add(1).min(self.len());
        self.rows[end.saturating_sub(len)..end]
            .iter()
            .map(|r| r[asset])
            .collect()
    }

    /// Keep only the first `len` rows.
    pub fn truncated(&self, len: usize) -> Self {
        let len = len.min(self.len());
        Self {
            assets: self.assets.clone(),
            dates: self.dates[..len].to_vec(),
            rows: self.rows[..len].to_vec(),
        }
    }

    /// Simple returns over the `lookback` prices ending the day before `day`.
    ///
    /// `lookback` prices give `lookback - 1` return rows, each with one
    /// return per asset. Fails when fewer than `lookback` prior prices exist
    /// or when a price in the window is not a usable positive number.
    pub fn return_window(&self, day: usize, lookback: usize) -> Result<Vec<Vec<f64>>> {
        if lookback < 2 {
            return Err(BacktestError::ConfigError(format!(
                "Lookback must be at least 2, got {}",
                lookback
            )));
        }
        if day < lookback || day > self.len() {
            return Err(BacktestError::DataError(format!(
                "Need {} prior prices for day {}, have {}",
                lookback,
                day,
                day.min(self.len())
            )));
        }

        let window = &self.rows[day - lookback..day];
        let mut returns = Vec::with_capacity(lookback - 1);
        for (offset, pair) in window.windows(2).enumerate() {
            let mut row = Vec::with_capacity(self.n_assets());
            for (a, (&prev, &curr)) in pair[0].iter().zip(pair[1].iter()).enumerate() {
                let r = curr / prev - 1.0;
                if prev <= 0.0 || curr <= 0.0 || !r.is_finite() {
                    return Err(BacktestError::DataError(format!(
                        "Invalid return for {} on {}",
                        self.assets[a],
                        self.dates[day - lookback + offset + 1]
                    )));
                }
                row.push(r);
            }
            returns.push(row);
        }

        Ok(returns)
    }
}

/// Simple period-over-period returns of a price path.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices.windows(2).map(|w| w[1] / w[0] - 1.0).collect()
}

/// Settings for the wide price CSV (`date,ASSET1,ASSET2,...`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceCsvConfig {
    /// Explicit date format (chrono syntax). Common formats are tried otherwise.
    pub date_format: Option<String>,
    /// Field delimiter.
    pub delimiter: u8,
    /// Drop rows with a missing or unparsable price instead of failing.
    pub drop_incomplete_rows: bool,
    /// Restrict and reorder the universe to these columns.
    pub assets: Option<Vec<String>>,
}

impl Default for PriceCsvConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            delimiter: b',',
            drop_incomplete_rows: true,
            assets: None,
        }
    }
}

fn parse_date(s: &str, format: Option<&str>) -> Result<NaiveDate> {
    let s = s.trim();
    if let Some(fmt) = format {
        return Ok(NaiveDate::parse_from_str(s, fmt)?);
    }

    let formats = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d/%m/%Y", "%m/%d/%Y"];
    for fmt in &formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }

    // Timestamps such as "2024-01-02 00:00:00" keep only the date part.
    if let Some(head) = s.split([' ', 'T']).next() {
        if let Ok(d) = NaiveDate::parse_from_str(head, "%Y-%m-%d") {
            return Ok(d);
        }
    }

    Err(BacktestError::DataError(format!("Unable to parse date: {}", s)))
}

/// Load a wide price table: first column dates, one column per asset.
pub fn load_price_csv(path: impl AsRef<Path>, config: &PriceCsvConfig) -> Result<PriceSeries> {
    let path = path.as_ref();
    info!("Loading prices from: {}", path.display());

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(config.delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(BacktestError::DataError(
            "Price file needs a date column and at least one asset column".to_string(),
        ));
    }

    let all_assets: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();
    let selected: Vec<(usize, String)> = match &config.assets {
        Some(wanted) => wanted
            .iter()
            .map(|w| {
                all_assets
                    .iter()
                    .position(|a| a == w)
                    .map(|i| (i + 1, w.clone()))
                    .ok_or_else(|| {
                        BacktestError::ConfigError(format!("Asset {} not found in price file", w))
                    })
            })
            .collect::<Result<_>>()?,
        None => all_assets
            .iter()
            .enumerate()
            .map(|(i, a)| (i + 1, a.clone()))
            .collect(),
    };

    let mut parsed: Vec<(NaiveDate, Vec<f64>)> = Vec::new();
    let mut dropped = 0usize;

    for (row_num, record) in reader.records().enumerate() {
        let record = record?;
        let date = parse_date(record.get(0).unwrap_or(""), config.date_format.as_deref())?;

        let values: Option<Vec<f64>> = selected
            .iter()
            .map(|(col, _)| {
                record
                    .get(*col)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|v| v.is_finite())
            })
            .collect();

        match values {
            Some(v) => parsed.push((date, v)),
            None if config.drop_incomplete_rows => {
                debug!("Dropping incomplete row {} ({})", row_num + 1, date);
                dropped += 1;
            }
            None => {
                return Err(BacktestError::DataError(format!(
                    "Missing price on row {} ({})",
                    row_num + 1,
                    date
                )))
            }
        }
    }

    if parsed.is_empty() {
        return Err(BacktestError::NoData);
    }

    parsed.sort_by_key(|(d, _)| *d);
    let (dates, rows): (Vec<_>, Vec<_>) = parsed.into_iter().unzip();

    info!(
        "Loaded {} rows for {} assets ({} incomplete rows dropped)",
        dates.len(),
        selected.len(),
        dropped
    );

    PriceSeries::new(selected.into_iter().map(|(_, a)| a).collect(), dates, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn sample_series() -> PriceSeries {
        PriceSeries::from_columns(
            vec!["A".to_string(), "B".to_string()],
            (1..=5).map(d).collect(),
            vec![
                vec![100.0, 101.0, 102.0, 103.0, 104.0],
                vec![50.0, 49.0, 50.0, 51.0, 50.0],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_empty_universe() {
        let result = PriceSeries::new(vec![], vec![d(1)], vec![vec![]]);
        assert!(matches!(result, Err(BacktestError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_unordered_dates() {
        let result = PriceSeries::new(
            vec!["A".to_string()],
            vec![d(2), d(1)],
            vec![vec![1.0], vec![1.0]],
        );
        assert!(matches!(result, Err(BacktestError::DataError(_))));
    }

    #[test]
    fn test_rejects_ragged_rows() {
        let result = PriceSeries::new(
            vec!["A".to_string(), "B".to_string()],
            vec![d(1), d(2)],
            vec![vec![1.0, 2.0], vec![1.0]],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_return_window_ends_before_day() {
        let series = sample_series();
        let window = series.return_window(4, 3).unwrap();
        // Prices on days 1..=3 (indices 1, 2, 3), i.e. up to the day before index 4.
        assert_eq!(window.len(), 2);
        assert!((window[0][0] - (102.0 / 101.0 - 1.0)).abs() < 1e-12);
        assert!((window[1][1] - (51.0 / 50.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_return_window_insufficient_history() {
        let series = sample_series();
        assert!(matches!(
            series.return_window(2, 3),
            Err(BacktestError::DataError(_))
        ));
        assert!(series.return_window(3, 3).is_ok());
    }

    #[test]
    fn test_return_window_invalid_price() {
        let series = PriceSeries::from_columns(
            vec!["A".to_string()],
            (1..=4).map(d).collect(),
            vec![vec![100.0, f64::NAN, 101.0, 102.0]],
        )
        .unwrap();
        assert!(series.return_window(3, 3).is_err());
    }

    #[test]
    fn test_column_accessors() {
        let prices = sample_series();
        assert_eq!(prices.column_tail(0, 3, 2), vec![102.0, 103.0]);
        assert_eq!(prices.column_tail(1, 1, 10), vec![50.0, 49.0]);
        assert_eq!(prices.column_tail(0, 99, 1), vec![104.0]);
        assert!(prices.column_tail(0, 2, 0).is_empty());

        let prefix: Vec<f64> = prices.column_iter(1, 2).collect();
        assert_eq!(prefix, vec![50.0, 49.0, 50.0]);
        assert_eq!(prices.column_iter(0, 99).count(), 5);
    }

    #[test]
    fn test_truncated_keeps_prefix() {
        let series = sample_series();
        let short = series.truncated(3);
        assert_eq!(short.len(), 3);
        assert_eq!(short.row(2), series.row(2));
    }

    #[test]
    fn test_load_price_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,SPY,TLT,GLD").unwrap();
        writeln!(file, "2024-01-03,470.0,98.0,190.0").unwrap();
        writeln!(file, "2024-01-02,472.0,97.5,").unwrap();
        writeln!(file, "2024-01-04,468.0,98.4,191.2").unwrap();

        let series = load_price_csv(file.path(), &PriceCsvConfig::default()).unwrap();
        assert_eq!(series.assets(), &["SPY", "TLT", "GLD"]);
        assert_eq!(series.len(), 2);
        assert_eq!(series.date(0), NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());

        let strict = PriceCsvConfig {
            drop_incomplete_rows: false,
            ..Default::default()
        };
        assert!(load_price_csv(file.path(), &strict).is_err());
    }

    #[test]
    fn test_load_price_csv_asset_selection() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Date,SPY,TLT").unwrap();
        writeln!(file, "2024/01/02,470.0,98.0").unwrap();
        writeln!(file, "2024/01/03,471.0,98.5").unwrap();

        let config = PriceCsvConfig {
            assets: Some(vec!["TLT".to_string()]),
            ..Default::default()
        };
        let series = load_price_csv(file.path(), &config).unwrap();
        assert_eq!(series.assets(), &["TLT"]);
        assert_eq!(series.row(1), &[98.5]);

        let missing = PriceCsvConfig {
            assets: Some(vec!["QQQ".to_string()]),
            ..Default::default()
        };
        assert!(load_price_csv(file.path(), &missing).is_err());
    }

    #[test]
    fn test_simple_returns() {
        let r = simple_returns(&[100.0, 110.0, 99.0]);
        assert!((r[0] - 0.1).abs() < 1e-12);
        assert!((r[1] + 0.1).abs() < 1e-12);
    }
}
