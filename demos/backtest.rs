//! A small quantitative backtest wired through the task engine.
//!
//! Synthetic price histories stand in for a market data feed; the point is
//! the pipeline shape: prices -> returns -> signal -> backtest, cached in a
//! file-backed store so a second run executes nothing.

use anyhow::Result;
use chrono::NaiveDate;
use karakuri::{
    Artifact, Derive, FsStore, Outputs, ParamKind, ParamValue, Pipeline, Registry,
};

/// Deterministic fake price path seeded from the symbol name.
fn synthetic_prices(symbol: &str, days: u64) -> Vec<f64> {
    let mut state: u64 = symbol.bytes().fold(0xdead_beef, |acc, byte| {
        acc.wrapping_mul(31).wrapping_add(byte as u64)
    });
    let mut price = 100.0;
    let mut series = Vec::with_capacity(days as usize);
    for _ in 0..days {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let step = ((state >> 33) as f64 / u32::MAX as f64) - 0.5;
        price = (price + step).max(1.0);
        series.push(price);
    }
    series
}

fn registry() -> Result<Registry<()>> {
    let mut registry: Registry<()> = Registry::new();

    registry
        .task("prices")
        .param("symbols", ParamKind::list(ParamKind::Str))
        .param("date_start", ParamKind::Date)
        .param("date_end", ParamKind::Date)
        .output("frame")
        .run(|ctx| {
            let symbols = ctx.params.strings("symbols")?;
            let days = (ctx.params.date("date_end")? - ctx.params.date("date_start")?).num_days();
            let frame: Vec<(String, Vec<f64>)> = symbols
                .into_iter()
                .map(|symbol| {
                    let series = synthetic_prices(&symbol, days as u64);
                    (symbol, series)
                })
                .collect();
            Ok(Outputs::one("frame", Artifact::encode(&frame)?))
        })?;

    registry
        .task("returns")
        .param("symbols", ParamKind::list(ParamKind::Str))
        .param("date_start", ParamKind::Date)
        .param("date_end", ParamKind::Date)
        .requires("prices", Derive::inherit())
        .output("frame")
        .run(|ctx| {
            let prices: Vec<(String, Vec<f64>)> = ctx.decode("prices", "frame")?;
            let frame: Vec<(String, Vec<f64>)> = prices
                .into_iter()
                .map(|(symbol, series)| {
                    let returns = series.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
                    (symbol, returns)
                })
                .collect();
            Ok(Outputs::one("frame", Artifact::encode(&frame)?))
        })?;

    registry
        .task("signal")
        .param("symbols", ParamKind::list(ParamKind::Str))
        .param("date_start", ParamKind::Date)
        .param("date_end", ParamKind::Date)
        .param_default("lookback", ParamKind::Int, 21)
        .requires("returns", Derive::inherit())
        .output("weights")
        .run(|ctx| {
            let returns: Vec<(String, Vec<f64>)> = ctx.decode("returns", "frame")?;
            let lookback = ctx.params.int("lookback")? as usize;
            // Long the symbols with positive trailing momentum, equal weight.
            let momentum: Vec<(String, f64)> = returns
                .iter()
                .map(|(symbol, series)| {
                    let tail = &series[series.len().saturating_sub(lookback)..];
                    (symbol.clone(), tail.iter().sum::<f64>())
                })
                .collect();
            let longs = momentum.iter().filter(|(_, m)| *m > 0.0).count().max(1);
            let weights: Vec<(String, f64)> = momentum
                .into_iter()
                .map(|(symbol, m)| (symbol, if m > 0.0 { 1.0 / longs as f64 } else { 0.0 }))
                .collect();
            Ok(Outputs::one("weights", Artifact::encode(&weights)?))
        })?;

    registry
        .task("backtest")
        .param("symbols", ParamKind::list(ParamKind::Str))
        .param("date_start", ParamKind::Date)
        .param("date_end", ParamKind::Date)
        .param_default("lookback", ParamKind::Int, 21)
        .requires("returns", Derive::inherit())
        .requires("signal", Derive::inherit())
        .output("portfolio")
        .output("pnl")
        .run(|ctx| {
            let returns: Vec<(String, Vec<f64>)> = ctx.decode("returns", "frame")?;
            let weights: Vec<(String, f64)> = ctx.decode("signal", "weights")?;

            let days = returns.first().map(|(_, r)| r.len()).unwrap_or(0);
            let mut pnl = vec![0.0_f64; days];
            for (symbol, series) in &returns {
                let weight = weights
                    .iter()
                    .find(|(held, _)| held == symbol)
                    .map(|(_, w)| *w)
                    .unwrap_or(0.0);
                for (day, value) in series.iter().enumerate() {
                    pnl[day] += weight * value;
                }
            }

            let mut outputs = Outputs::new();
            outputs.insert("portfolio", Artifact::encode(&weights)?);
            outputs.insert("pnl", Artifact::encode(&pnl)?);
            Ok(outputs)
        })?;

    Ok(registry)
}

fn main() -> Result<()> {
    #[cfg(feature = "logging")]
    karakuri::init_logging()?;

    let pipeline = Pipeline::new(registry()?, FsStore::new(".karakuri-cache"));

    let params: Vec<(&str, ParamValue)> = vec![
        ("symbols", vec!["SPY", "TLT", "GLD"].into()),
        ("date_start", NaiveDate::from_ymd_opt(2018, 1, 1).unwrap().into()),
        ("date_end", NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().into()),
        ("lookback", 21.into()),
    ];
    let instance = pipeline.instance("backtest", params)?;

    println!("plan:\n{}", pipeline.preview(&instance)?);

    let report = pipeline.run(&instance)?;
    println!("first run:\n{report}");

    let report = pipeline.run(&instance)?;
    println!("second run (fully cached):\n{report}");

    let pnl: Vec<f64> = pipeline.output(&instance, "pnl")?.decode()?;
    println!("cumulative pnl: {:+.4}", pnl.iter().sum::<f64>());

    Ok(())
}
