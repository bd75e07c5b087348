use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::CandleSource;
use crate::series::Candle;

// One line of the JSONL price dump. Extra per-symbol fields are ignored.
#[derive(Debug, Clone, Deserialize)]
struct DumpedSymbolSnapshot {
    price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct DumpedDataEntry {
    timestamp: i64,
    prices: HashMap<String, DumpedSymbolSnapshot>,
}

/// Serves closes from a recorded price dump.
#[derive(Debug)]
pub struct ReplaySource {
    data: Vec<DumpedDataEntry>,
}

impl ReplaySource {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open replay file {}", path_ref.display()))?;
        let reader = BufReader::new(file);
        let mut data = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.with_context(|| {
                format!("failed to read replay line {} of {}", line_no + 1, path_ref.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpedDataEntry = serde_json::from_str(&line).with_context(|| {
                format!("failed to parse replay entry on line {}", line_no + 1)
            })?;
            data.push(entry);
        }

        if data.is_empty() {
            return Err(anyhow!(
                "data dump file {} is empty or invalid",
                path_ref.display()
            ));
        }
        data.sort_by_key(|entry| entry.timestamp);
        log::info!(
            "[DATA] replay {} loaded {} snapshots",
            path_ref.display(),
            data.len()
        );
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl CandleSource for ReplaySource {
    async fn fetch_closes(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let mut closes = Vec::new();
        for entry in &self.data {
            let Some(snapshot) = entry.prices.get(symbol) else {
                continue;
            };
            let ts = Utc
                .timestamp_millis_opt(entry.timestamp)
                .single()
                .ok_or_else(|| anyhow!("invalid replay timestamp {}", entry.timestamp))?;
            closes.push(Candle {
                ts,
                close: snapshot.price,
            });
        }
        if closes.is_empty() {
            return Err(anyhow!("symbol '{}' not found in replay data", symbol));
        }
        let skip = closes.len().saturating_sub(limit);
        Ok(closes.split_off(skip))
    }
}
