use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use pairtrade_backtest::config::BacktestConfig;
use pairtrade_backtest::pipeline::run_pipeline;
use pairtrade_backtest::ports::{load_pair, source_from_config};
use pairtrade_backtest::report::ReportWriter;
use std::env;
use std::io::Write;
use std::str::FromStr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "0".to_string())
        .parse::<i32>()
        .context("invalid TIMEZONE_OFFSET")?;
    let offset = FixedOffset::east_opt(offset_seconds).context("TIMEZONE_OFFSET out of range")?;
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    let cfg = BacktestConfig::from_env_or_yaml()?;
    cfg.validate().context("invalid backtest config")?;
    log::info!(
        "[CONFIG] {} {}/{} {} limit={} source={}",
        cfg.exchange_id,
        cfg.symbol_y,
        cfg.symbol_x,
        cfg.timeframe,
        cfg.limit,
        cfg.data_source
    );

    let source = source_from_config(&cfg)?;
    let prices = load_pair(source.as_ref(), &cfg.symbol_y, &cfg.symbol_x, cfg.limit).await?;
    let output = run_pipeline(&prices, &cfg)?;
    let summary = output.summary(&cfg.timeframe);

    println!("{}", serde_json::to_string_pretty(&summary)?);
    ReportWriter::new(&cfg.results_dir).write(&output, &summary)?;
    Ok(())
}
