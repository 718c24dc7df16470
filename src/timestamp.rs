//! Timebases, the shared timestamp tracker and timecode output.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::hw::{HW_TIMEBASE, TIMESTAMP_UNKNOWN};

/// `num / den` seconds per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl From<(i32, i32)> for Rational {
    fn from((num, den): (i32, i32)) -> Self {
        Self { num, den }
    }
}

impl From<Rational> for (i32, i32) {
    fn from(r: Rational) -> Self {
        (r.num, r.den)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Timebase of timestamps stored on hardware surfaces.
    pub const fn hw() -> Self {
        Self::new(1, HW_TIMEBASE)
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn inv(self) -> Self {
        Self::new(self.den, self.num)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

/// Convert `value` ticks of `from` into ticks of `to`, rounding to nearest
/// (halves away from zero).
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let num = i128::from(value) * i128::from(from.num) * i128::from(to.den);
    let den = i128::from(from.den) * i128::from(to.num);
    if den == 0 {
        return value;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let half = den / 2;
    let rounded = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    i64::try_from(rounded).unwrap_or(if rounded > 0 { i64::MAX } else { i64::MIN })
}

/// How the timestamp-correction stage treats source timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvSyncMode {
    /// Assume constant frame rate; source timestamps are ignored.
    #[default]
    Cfr,
    /// Follow the source timestamps.
    Vfr,
    /// Follow the source timestamps. Frame drop/duplication to force a
    /// constant rate is not performed.
    ForceCfr,
}

impl AvSyncMode {
    pub fn uses_source_timestamps(self) -> bool {
        matches!(self, Self::Vfr | Self::ForceCfr)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    durations: BTreeMap<i64, i64>,
    last: Option<(i64, i64)>,
}

/// Registered timestamps kept by a tracker that nobody checks against.
pub const TRACKER_CAPACITY: usize = 256;

/// Timestamps registered after correction, used by the encoder to repair
/// frames that lost theirs (e.g. the second field of a doubled frame comes
/// out of the video processor as UNKNOWN).
///
/// At most `capacity` registrations are kept; the oldest go first.
#[derive(Debug)]
pub struct TimestampTracker {
    state: Mutex<TrackerState>,
    capacity: usize,
}

impl Default for TimestampTracker {
    fn default() -> Self {
        Self::with_capacity(TRACKER_CAPACITY)
    }
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::default(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::Poisoned("timestamp tracker"))
    }

    pub fn add(&self, timestamp: i64, duration: i64) -> Result<()> {
        let mut state = self.state()?;
        state.durations.insert(timestamp, duration);
        while state.durations.len() > self.capacity {
            state.durations.pop_first();
        }
        Ok(())
    }

    pub fn pending(&self) -> Result<usize> {
        Ok(self.state()?.durations.len())
    }

    /// Return the timestamp to encode for a frame carrying `raw`.
    ///
    /// Results are strictly increasing. UNKNOWN, or a timestamp at or
    /// before the previous result, becomes the previous result plus its
    /// duration. Anything else passes through.
    pub fn check(&self, raw: i64) -> Result<i64> {
        let mut state = self.state()?;
        let last = state.last;
        let resolved = match last {
            Some((prev, duration)) if raw == TIMESTAMP_UNKNOWN || raw <= prev => {
                if raw != TIMESTAMP_UNKNOWN {
                    state.durations.remove(&raw);
                }
                let estimated = prev + duration.max(1);
                let duration = state.durations.remove(&estimated).unwrap_or(duration);
                state.last = Some((estimated, duration));
                estimated
            }
            _ if raw == TIMESTAMP_UNKNOWN => raw,
            last => {
                let duration = match state.durations.remove(&raw) {
                    Some(duration) => duration,
                    None => last.map(|(_, d)| d).unwrap_or(0),
                };
                state.last = Some((raw, duration));
                raw
            }
        };
        let stale: Vec<i64> = state
            .durations
            .range(..resolved)
            .map(|(ts, _)| *ts)
            .collect();
        for ts in stale {
            state.durations.remove(&ts);
        }
        Ok(resolved)
    }
}

/// Receives the final timestamp of every encoded frame.
pub trait TimecodeSink: Send {
    fn write(&mut self, timestamp: i64, timebase: Rational) -> Result<()>;
}

/// Writes a "timecode format v2" file: one millisecond value per frame.
pub struct TimecodeWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> TimecodeWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        writeln!(out, "# timecode format v2")?;
        Ok(Self { out })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> TimecodeSink for TimecodeWriter<W> {
    fn write(&mut self, timestamp: i64, timebase: Rational) -> Result<()> {
        let millis = timestamp as f64 * timebase.as_f64() * 1000.0;
        writeln!(self.out, "{millis:.6}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_rounds_to_nearest() {
        let ms = Rational::new(1, 1000);
        assert_eq!(rescale(1, Rational::hw(), ms), 0);
        assert_eq!(rescale(45, Rational::hw(), ms), 1);
        assert_eq!(rescale(-45, Rational::hw(), ms), -1);
        assert_eq!(rescale(3003, Rational::new(1, 30000), Rational::hw()), 9009);
    }

    #[test]
    fn rescale_with_zero_denominator_is_identity() {
        assert_eq!(rescale(42, Rational::new(1, 0), Rational::hw()), 42);
    }

    #[test]
    fn tracker_fills_unknown_from_previous() {
        let tracker = TimestampTracker::new();
        tracker.add(0, 3000).unwrap();
        tracker.add(3000, 3000).unwrap();
        assert_eq!(tracker.check(0).unwrap(), 0);
        assert_eq!(tracker.check(TIMESTAMP_UNKNOWN).unwrap(), 3000);
        assert_eq!(tracker.check(TIMESTAMP_UNKNOWN).unwrap(), 6000);
        assert_eq!(tracker.pending().unwrap(), 0);
    }

    #[test]
    fn tracker_never_repeats_a_timestamp() {
        let tracker = TimestampTracker::new();
        tracker.add(0, 3000).unwrap();
        tracker.add(3000, 3000).unwrap();
        tracker.add(6000, 3000).unwrap();
        let resolved: Vec<i64> = [0, TIMESTAMP_UNKNOWN, 3000, TIMESTAMP_UNKNOWN, 6000]
            .into_iter()
            .map(|raw| tracker.check(raw).unwrap())
            .collect();
        assert_eq!(resolved, vec![0, 3000, 6000, 9000, 12000]);
    }

    #[test]
    fn tracker_forgets_the_oldest_registrations() {
        let tracker = TimestampTracker::with_capacity(4);
        for n in 0..10 {
            tracker.add(n * 3000, 3000).unwrap();
        }
        assert_eq!(tracker.pending().unwrap(), 4);
        assert_eq!(tracker.check(6 * 3000).unwrap(), 18000);
        assert_eq!(tracker.pending().unwrap(), 3);
    }

    #[test]
    fn tracker_without_history_passes_unknown_through() {
        let tracker = TimestampTracker::new();
        assert_eq!(tracker.check(TIMESTAMP_UNKNOWN).unwrap(), TIMESTAMP_UNKNOWN);
    }

    #[test]
    fn timecode_writer_emits_v2_header_and_millis() {
        let mut writer = TimecodeWriter::new(Vec::new()).unwrap();
        writer.write(0, Rational::hw()).unwrap();
        writer.write(3003, Rational::hw()).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text, "# timecode format v2\n0.000000\n33.366667\n");
    }
}
