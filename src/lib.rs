// src/lib.rs
pub mod backtest;
pub mod coint;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod ports;
pub mod positions;
pub mod report;
pub mod series;
pub mod signals;
