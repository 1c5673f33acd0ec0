//! Simulated drone telemetry.
//!
//! Each request gets a fresh sample: a position inside a small box around the
//! configured site, an altitude band, and attitude offsets on three axes, plus
//! the local wall-clock time and date. Nothing is persisted between samples.

use chrono::{DateTime, Local};
use rand::Rng;
use serde::Serialize;
use std::ops::RangeInclusive;

pub const DEFAULT_LOCATION: &str = "Bangalore, India";

const LATITUDE: RangeInclusive<f64> = 12.900..=12.950;
const LONGITUDE: RangeInclusive<f64> = 77.500..=77.550;
const ALTITUDE: RangeInclusive<f64> = 50.0..=100.0;
const OFFSET: RangeInclusive<f64> = -5.0..=5.0;

/// One telemetry reading, serialized in this field order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// Degrees, 6 decimals.
    pub latitude: f64,
    /// Degrees, 6 decimals.
    pub longitude: f64,
    /// Metres, 2 decimals.
    pub altitude: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// `HH:MM:SS`, local time.
    pub time: String,
    /// `YYYY-MM-DD`, local date.
    pub date: String,
    pub location: String,
}

#[derive(Clone, Debug)]
pub struct SimulatedTelemetry {
    location: String,
}

impl SimulatedTelemetry {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }

    pub fn sample(&self) -> TelemetrySample {
        self.sample_with(&mut rand::thread_rng(), Local::now())
    }

    pub fn sample_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        now: DateTime<Local>,
    ) -> TelemetrySample {
        TelemetrySample {
            latitude: round_to(rng.gen_range(LATITUDE), 6),
            longitude: round_to(rng.gen_range(LONGITUDE), 6),
            altitude: round_to(rng.gen_range(ALTITUDE), 2),
            x: round_to(rng.gen_range(OFFSET), 2),
            y: round_to(rng.gen_range(OFFSET), 2),
            z: round_to(rng.gen_range(OFFSET), 2),
            time: now.format("%H:%M:%S").to_string(),
            date: now.format("%Y-%m-%d").to_string(),
            location: self.location.clone(),
        }
    }
}

impl Default for SimulatedTelemetry {
    fn default() -> Self {
        Self::new(DEFAULT_LOCATION)
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn decimals(value: f64) -> usize {
        let text = value.to_string();
        text.split_once('.').map(|(_, frac)| frac.len()).unwrap_or(0)
    }

    #[test]
    fn samples_stay_in_range_with_fixed_precision() {
        let telemetry = SimulatedTelemetry::default();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..200 {
            let s = telemetry.sample_with(&mut rng, Local::now());
            assert!(LATITUDE.contains(&s.latitude));
            assert!(LONGITUDE.contains(&s.longitude));
            assert!(ALTITUDE.contains(&s.altitude));
            for v in [s.x, s.y, s.z] {
                assert!(OFFSET.contains(&v));
                assert!(decimals(v) <= 2);
            }
            assert!(decimals(s.latitude) <= 6);
            assert!(decimals(s.altitude) <= 2);
        }
    }

    #[test]
    fn serializes_expected_keys_in_order() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap();
        let sample =
            SimulatedTelemetry::default().sample_with(&mut StdRng::seed_from_u64(1), now);
        assert_eq!(sample.time, "07:05:03");
        assert_eq!(sample.date, "2024-03-09");

        let json = serde_json::to_string(&sample).unwrap();
        let keys = [
            "latitude", "longitude", "altitude", "x", "y", "z", "time", "date", "location",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|k| json.find(&format!("\"{}\":", k)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(json.contains("\"location\":\"Bangalore, India\""));
    }
}
