use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ingest::{CycleOutcome, Ingestor};

/// Parse an interval such as `30s`, `1m`, `1h30m` or `250ms`.
///
/// Units are `ms`, `s`, `m` and `h`; numbers may carry a fraction. The result
/// must be strictly positive.
pub fn parse_interval(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("interval is empty".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("interval must be positive: {}", input));
    }

    let mut total = 0f64;
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid interval: {}", input));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in interval: {}", input))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in interval: {}", input)),
            unit => return Err(format!("unknown unit '{}' in interval: {}", unit, input)),
        };
        rest = &rest[unit_len..];

        total += value * seconds_per_unit;
    }

    if total <= 0.0 {
        return Err(format!("interval must be positive: {}", input));
    }
    Duration::try_from_secs_f64(total).map_err(|_| format!("interval out of range: {}", input))
}

/// Runs ingestion cycles back to back, one feed at a time.
pub struct Scheduler {
    ingestor: Ingestor,
    period: Duration,
}

impl Scheduler {
    pub fn new(ingestor: Ingestor, period: Duration) -> Result<Self, String> {
        if period.is_zero() {
            return Err("interval must be positive".to_string());
        }
        Ok(Self { ingestor, period })
    }

    /// Run until `cancel` fires. The first cycle starts immediately.
    ///
    /// Returns the number of cycles that ran.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        info!("Collecting feeds every {:?}", self.period);

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = self.ingestor.run_cycle(&cancel).await;
            cycles += 1;
            if let CycleOutcome::Completed { feed, stats } = &outcome {
                info!("Cycle {} finished '{}' ({} new)", cycles, feed.name, stats.inserted);
            }
        }

        info!("Feed collection stopped after {} cycles", cycles);
        cycles
    }
}
