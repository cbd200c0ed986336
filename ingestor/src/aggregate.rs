//! Windowed statistics over a sensor's readings.
//!
//! `[from, to]` is cut into contiguous windows of `window` length aligned to
//! `from`. Every window is half-open `[start, end)` except the last, which
//! is truncated to `to` and closed. Empty windows are still emitted so
//! callers always see full coverage of the requested range.

use crate::errors::{Error, Result};
use crate::model::{Reading, SeriesStat, WindowStat};
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

/// Running accumulator for one measurement type.
#[derive(Debug, Default)]
struct SeriesAccumulator {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl SeriesAccumulator {
    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    fn finish(self) -> SeriesStat {
        SeriesStat {
            count: self.count,
            min: self.min,
            max: self.max,
            mean: (self.count > 0).then(|| self.sum / self.count as f64),
        }
    }
}

/// Checks the request shape and returns how many windows it produces.
pub fn window_count(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    window: Duration,
    max_windows: usize,
) -> Result<usize> {
    if window <= Duration::zero() {
        return Err(Error::InvalidRange(format!(
            "window size must be positive, got {}ms",
            window.num_milliseconds()
        )));
    }
    // Windows are counted and stepped in whole milliseconds, the storage resolution.
    if window.subsec_nanos() % 1_000_000 != 0 {
        return Err(Error::InvalidRange(format!(
            "window size must be a whole number of milliseconds, got {}",
            window
        )));
    }
    if from > to {
        return Err(Error::InvalidRange(format!(
            "from {} is after to {}",
            from.to_rfc3339(),
            to.to_rfc3339()
        )));
    }

    let span = to - from;
    let span = span.num_milliseconds() + i64::from(span.subsec_nanos() % 1_000_000 != 0);
    let step = window.num_milliseconds();
    let count = (span / step + i64::from(span % step != 0)).max(1);
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    if count > max_windows {
        return Err(Error::InvalidRange(format!(
            "request spans {} windows, limit is {}",
            count, max_windows
        )));
    }
    Ok(count)
}

/// Computes window statistics over `readings`, which must be sorted by
/// `observed_at` ascending. Readings outside `[from, to]` are ignored.
///
/// `cancel` is checked between windows; a cancelled request returns
/// [`Error::Cancelled`] without partial output.
pub fn aggregate(
    readings: &[Reading],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    window: Duration,
    max_windows: usize,
    cancel: &CancellationToken,
) -> Result<Vec<WindowStat>> {
    let count = window_count(from, to, window, max_windows)?;
    let mut windows = Vec::with_capacity(count);
    let mut rest = readings;

    // Skip anything before the range.
    let skip = rest.partition_point(|r| r.observed_at < from);
    rest = &rest[skip..];

    for i in 0..count {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let start = from + window * i as i32;
        let last = i + 1 == count;
        let end = if last { to } else { (start + window).min(to) };

        let in_window = if last {
            rest.partition_point(|r| r.observed_at <= end)
        } else {
            rest.partition_point(|r| r.observed_at < end)
        };
        let (current, remaining) = rest.split_at(in_window);
        rest = remaining;

        let mut temperature = SeriesAccumulator::default();
        let mut humidity = SeriesAccumulator::default();
        for reading in current {
            if let Some(t) = reading.temperature {
                temperature.add(t);
            }
            if let Some(h) = reading.humidity {
                humidity.add(h);
            }
        }

        windows.push(WindowStat {
            start,
            end,
            count: current.len() as u64,
            temperature: temperature.finish(),
            humidity: humidity.finish(),
        });
    }

    Ok(windows)
}
