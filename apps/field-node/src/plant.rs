use crate::calibration::MoistureCalibration;
use crate::records::PlantSummary;
use crate::sensors::{read, ColorSample, SensorSource};
use crate::validate::{ValidationFailure, Validator};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct PlantSchedule {
    pub interval: Duration,
    pub readings: usize,
    pub spacing: Duration,
}

impl Default for PlantSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            readings: 4,
            spacing: Duration::from_secs(2),
        }
    }
}

/// Blocking: takes `readings` colour samples spaced `spacing` apart and keeps
/// the ones that validate.
pub fn collect(
    source: &mut dyn SensorSource,
    validator: &Validator,
    schedule: PlantSchedule,
) -> (Vec<ColorSample>, Vec<ValidationFailure>) {
    let mut samples = Vec::with_capacity(schedule.readings);
    let mut failures = Vec::new();
    for idx in 0..schedule.readings {
        if idx > 0 && !schedule.spacing.is_zero() {
            std::thread::sleep(schedule.spacing);
        }
        let reading = read(source, Utc::now());
        let Some(raw) = reading.raw else {
            continue;
        };
        match validator.color(raw) {
            Ok(sample) => samples.push(sample),
            Err(failure) => failures.push(failure),
        }
    }
    (samples, failures)
}

/// Averages the valid sub-readings. Moisture is `null` without a usable
/// calibration or without samples.
pub fn summarize(
    timestamp: DateTime<Utc>,
    samples: &[ColorSample],
    calibration: Option<&MoistureCalibration>,
) -> PlantSummary {
    if samples.is_empty() {
        return PlantSummary {
            timestamp,
            ..PlantSummary::default()
        };
    }
    let count = samples.len() as f64;
    let blue = samples.iter().map(|sample| sample.blue).sum::<f64>() / count;
    let lux = samples.iter().map(|sample| sample.lux).sum::<f64>() / count;
    PlantSummary {
        timestamp,
        moisture_pct: calibration.map(|calibration| calibration.percent(blue)),
        blue: Some(blue),
        lux: Some(lux),
        samples: samples.len(),
    }
}
