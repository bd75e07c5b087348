use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::CandleSource;
use crate::series::Candle;

const HTTP_TIMEOUT_SECS: u64 = 30;
const BINANCE_MAX_LIMIT: usize = 1000;
const KRAKEN_INTERVALS_MIN: [i64; 9] = [1, 5, 15, 30, 60, 240, 1440, 10080, 21600];
const BINANCE_INTERVALS: [(i64, &str); 14] = [
    (1, "1m"),
    (3, "3m"),
    (5, "5m"),
    (15, "15m"),
    (30, "30m"),
    (60, "1h"),
    (120, "2h"),
    (240, "4h"),
    (360, "6h"),
    (480, "8h"),
    (720, "12h"),
    (1440, "1d"),
    (4320, "3d"),
    (10080, "1w"),
];

/// Public OHLC endpoints keyed by `exchange_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Kraken,
    Binance,
}

impl FromStr for Exchange {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kraken" => Ok(Exchange::Kraken),
            "binance" => Ok(Exchange::Binance),
            other => Err(anyhow!("unsupported exchange_id '{}'", other)),
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Exchange::Kraken => write!(f, "kraken"),
            Exchange::Binance => write!(f, "binance"),
        }
    }
}

impl Exchange {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Exchange::Kraken => "https://api.kraken.com",
            Exchange::Binance => "https://api.binance.com",
        }
    }

    fn ohlc_path(self) -> &'static str {
        match self {
            Exchange::Kraken => "/0/public/OHLC",
            Exchange::Binance => "/api/v3/klines",
        }
    }

    /// Maps `BASE/QUOTE` to the venue's market code, e.g. `XBTUSD` or `BTCUSDT`.
    pub fn market_symbol(self, symbol: &str) -> Result<String> {
        let symbol = symbol.trim().to_uppercase();
        let (base, quote) = match symbol.split_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => (base, quote),
            _ => bail!("symbol '{}' is not of the form BASE/QUOTE", symbol),
        };
        Ok(match self {
            Exchange::Kraken => {
                let kraken = |code: &str| if code == "BTC" { "XBT".to_string() } else { code.to_string() };
                format!("{}{}", kraken(base), kraken(quote))
            }
            Exchange::Binance => format!("{}{}", base, quote),
        })
    }

    /// Interval parameter for one bar, if the venue serves that bar size.
    pub fn interval(self, bar: Duration) -> Result<String> {
        let minutes = bar.num_minutes();
        if bar != Duration::minutes(minutes) {
            bail!("{} has no sub-minute bars", self);
        }
        let interval = match self {
            Exchange::Kraken => KRAKEN_INTERVALS_MIN
                .contains(&minutes)
                .then(|| minutes.to_string()),
            Exchange::Binance => BINANCE_INTERVALS
                .iter()
                .find(|(m, _)| *m == minutes)
                .map(|(_, code)| code.to_string()),
        };
        interval.ok_or_else(|| anyhow!("{} does not serve {}-minute bars", self, minutes))
    }
}

fn decimal_field(row: &[Value], idx: usize) -> Result<Decimal> {
    let value = row
        .get(idx)
        .ok_or_else(|| anyhow!("OHLC row is missing column {}", idx))?;
    match value {
        Value::String(s) => Decimal::from_str(s).with_context(|| format!("bad close '{}'", s)),
        Value::Number(n) => Decimal::from_str(&n.to_string()).with_context(|| format!("bad close {}", n)),
        other => Err(anyhow!("unexpected close {}", other)),
    }
}

fn timestamp_field(row: &[Value], millis: bool) -> Result<DateTime<Utc>> {
    let raw = row
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("OHLC row has no integer open time"))?;
    let ts = if millis {
        DateTime::<Utc>::from_timestamp_millis(raw)
    } else {
        DateTime::<Utc>::from_timestamp(raw, 0)
    };
    ts.ok_or_else(|| anyhow!("open time {} is out of range", raw))
}

/// `{"error":[],"result":{"<pair>":[[time, o, h, l, c, vwap, vol, count], ...], "last": n}}`
pub fn parse_kraken_ohlc(body: &Value) -> Result<Vec<Candle>> {
    if let Some(errors) = body.get("error").and_then(Value::as_array) {
        if !errors.is_empty() {
            let joined: Vec<String> = errors
                .iter()
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .collect();
            bail!("kraken OHLC error: {}", joined.join(", "));
        }
    }
    let result = body
        .get("result")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("kraken OHLC response has no result object"))?;
    let rows = result
        .iter()
        .find(|(key, _)| key.as_str() != "last")
        .and_then(|(_, rows)| rows.as_array())
        .ok_or_else(|| anyhow!("kraken OHLC result has no pair rows"))?;
    rows.iter()
        .map(|row| {
            let row = row
                .as_array()
                .ok_or_else(|| anyhow!("kraken OHLC row is not an array"))?;
            Ok(Candle {
                ts: timestamp_field(row, false)?,
                close: decimal_field(row, 4)?,
            })
        })
        .collect()
}

/// `[[open_time_ms, "o", "h", "l", "c", ...], ...]`
pub fn parse_binance_klines(body: &Value) -> Result<Vec<Candle>> {
    let rows = body
        .as_array()
        .ok_or_else(|| anyhow!("binance klines response is not an array: {}", body))?;
    rows.iter()
        .map(|row| {
            let row = row
                .as_array()
                .ok_or_else(|| anyhow!("binance kline is not an array"))?;
            Ok(Candle {
                ts: timestamp_field(row, true)?,
                close: decimal_field(row, 4)?,
            })
        })
        .collect()
}

/// Pulls closes from a venue's public OHLC endpoint.
#[derive(Debug, Clone)]
pub struct ExchangeSource {
    http: reqwest::Client,
    exchange: Exchange,
    base_url: String,
    bar: Duration,
}

impl ExchangeSource {
    pub fn new(exchange_id: &str, bar: Duration, base_url: Option<&str>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;
        Self::with_client(http, exchange_id, bar, base_url)
    }

    pub fn with_client(
        http: reqwest::Client,
        exchange_id: &str,
        bar: Duration,
        base_url: Option<&str>,
    ) -> Result<Self> {
        let exchange: Exchange = exchange_id.parse()?;
        exchange.interval(bar)?;
        let base_url = base_url
            .unwrap_or(exchange.default_base_url())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            http,
            exchange,
            base_url,
            bar,
        })
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }
}

#[async_trait]
impl CandleSource for ExchangeSource {
    async fn fetch_closes(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let market = self.exchange.market_symbol(symbol)?;
        let interval = self.exchange.interval(self.bar)?;
        let endpoint = format!("{}{}", self.base_url, self.exchange.ohlc_path());
        let query: Vec<(&str, String)> = match self.exchange {
            Exchange::Kraken => vec![("pair", market.clone()), ("interval", interval)],
            Exchange::Binance => vec![
                ("symbol", market.clone()),
                ("interval", interval),
                ("limit", limit.min(BINANCE_MAX_LIMIT).to_string()),
            ],
        };
        let body: Value = self
            .http
            .get(&endpoint)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("{} OHLC HTTP failed for {}", self.exchange, market))?
            .error_for_status()
            .with_context(|| format!("{} OHLC returned error status for {}", self.exchange, market))?
            .json()
            .await
            .with_context(|| format!("{} OHLC JSON parse failed for {}", self.exchange, market))?;

        let mut candles = match self.exchange {
            Exchange::Kraken => parse_kraken_ohlc(&body)?,
            Exchange::Binance => parse_binance_klines(&body)?,
        };
        candles.sort_by_key(|c| c.ts);
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        if candles.len() < limit {
            log::warn!(
                "[DATA] {} returned {} of {} requested {} closes",
                self.exchange,
                candles.len(),
                limit,
                market
            );
        }
        log::debug!("[DATA] {} {} -> {} closes", self.exchange, market, candles.len());
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn kraken_body() -> Value {
        json!({
            "error": [],
            "result": {
                "XXBTZUSD": [
                    [1700003600, "36500.0", "36600.0", "36400.0", "36550.5", "36520.1", "12.3", 410],
                    [1700000000, "36400.0", "36550.0", "36300.0", "36500.0", "36450.0", "10.1", 380],
                    [1700007200, "36550.5", "36700.0", "36500.0", "36680.0", "36600.0", "9.8", 350]
                ],
                "last": 1700007200
            }
        })
    }

    /// Serves one canned JSON response and hands back the request head.
    async fn serve_once(body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{}", addr), handle)
    }

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[test]
    fn exchange_ids_parse_case_insensitively() {
        assert_eq!("Kraken".parse::<Exchange>().unwrap(), Exchange::Kraken);
        assert_eq!(" binance ".parse::<Exchange>().unwrap(), Exchange::Binance);
        assert!("ftx".parse::<Exchange>().is_err());
    }

    #[test]
    fn symbols_map_to_market_codes() {
        assert_eq!(Exchange::Kraken.market_symbol("BTC/USD").unwrap(), "XBTUSD");
        assert_eq!(Exchange::Kraken.market_symbol("eth/usd").unwrap(), "ETHUSD");
        assert_eq!(Exchange::Binance.market_symbol("BTC/USDT").unwrap(), "BTCUSDT");
        assert!(Exchange::Binance.market_symbol("BTCUSDT").is_err());
        assert!(Exchange::Kraken.market_symbol("BTC/").is_err());
    }

    #[test]
    fn intervals_follow_each_venue() {
        assert_eq!(Exchange::Kraken.interval(Duration::hours(1)).unwrap(), "60");
        assert_eq!(Exchange::Kraken.interval(Duration::days(1)).unwrap(), "1440");
        assert!(Exchange::Kraken.interval(Duration::hours(2)).is_err());
        assert_eq!(Exchange::Binance.interval(Duration::hours(2)).unwrap(), "2h");
        assert_eq!(Exchange::Binance.interval(Duration::weeks(1)).unwrap(), "1w");
        assert!(Exchange::Binance.interval(Duration::minutes(7)).is_err());
        assert!(Exchange::Binance.interval(Duration::seconds(90)).is_err());
    }

    #[test]
    fn kraken_rows_parse_into_closes() {
        let candles = parse_kraken_ohlc(&kraken_body()).unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].ts.timestamp(), 1_700_003_600);
        assert_eq!(candles[0].close, dec!(36550.5));
    }

    #[test]
    fn kraken_error_array_is_surfaced() {
        let body = json!({"error": ["EQuery:Unknown asset pair"]});
        let err = parse_kraken_ohlc(&body).unwrap_err();
        assert!(err.to_string().contains("Unknown asset pair"));
    }

    #[test]
    fn binance_rows_parse_into_closes() {
        let body = json!([
            [1700000000000i64, "1.0", "1.2", "0.9", "1.1", "100", 1700003599999i64],
            [1700003600000i64, "1.1", "1.3", "1.0", "1.25", "90", 1700007199999i64]
        ]);
        let candles = parse_binance_klines(&body).unwrap();
        assert_eq!(candles[1].ts.timestamp(), 1_700_003_600);
        assert_eq!(candles[1].close, dec!(1.25));
        assert!(parse_binance_klines(&json!({"code": -1121, "msg": "Invalid symbol."})).is_err());
    }

    #[test]
    fn unsupported_settings_are_rejected_up_front() {
        assert!(ExchangeSource::new("ftx", Duration::hours(1), None).is_err());
        assert!(ExchangeSource::new("kraken", Duration::hours(3), None).is_err());
    }

    #[tokio::test]
    async fn kraken_fetch_sorts_and_keeps_the_latest_bars() {
        let (base_url, server) = serve_once(kraken_body().to_string()).await;
        let source =
            ExchangeSource::with_client(local_client(), "kraken", Duration::hours(1), Some(&base_url))
                .unwrap();
        let candles = source.fetch_closes("BTC/USD", 2).await.unwrap();
        let request = server.await.unwrap();

        assert!(request.starts_with("GET /0/public/OHLC?pair=XBTUSD&interval=60 "));
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, dec!(36550.5));
        assert_eq!(candles[1].close, dec!(36680.0));
        assert!(candles[0].ts < candles[1].ts);
    }

    #[tokio::test]
    async fn binance_fetch_caps_the_limit_parameter() {
        let body = json!([[1700000000000i64, "2.0", "2.0", "2.0", "2.5", "1"]]).to_string();
        let (base_url, server) = serve_once(body).await;
        let source =
            ExchangeSource::with_client(local_client(), "binance", Duration::hours(4), Some(&base_url))
                .unwrap();
        let candles = source.fetch_closes("ETH/USDT", 5000).await.unwrap();
        let request = server.await.unwrap();

        assert!(request.starts_with("GET /api/v3/klines?symbol=ETHUSDT&interval=4h&limit=1000 "));
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, dec!(2.5));
    }
}
