use crate::calibration::{Compass, WindCalibration};
use crate::metric::{MetricId, Range, ValidationLimits};
use crate::sensors::{ColorSample, RawValue, Reading, SensorKind};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Pressure transducer output span: 0.5 V at 0 psi, 4.5 V at full scale.
const PRESSURE_ZERO_VOLTS: f64 = 0.5;
const PRESSURE_SPAN_VOLTS: f64 = 4.0;
const PRESSURE_FULL_SCALE_PSI: f64 = 100.0;
const KPA_PER_PSI: f64 = 6.89476;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("{metric} value {value} outside [{}, {}]", .range.min, .range.max)]
    OutOfRange {
        metric: MetricId,
        value: f64,
        range: Range,
    },
    #[error("flow {pulses} pulses ({litres:.3} L) outside sane bounds")]
    Flow { pulses: u64, litres: f64 },
    #[error("{metric} sampled over an empty window")]
    EmptyWindow { metric: MetricId },
    #[error("{kind} source returned an unexpected value shape")]
    Shape { kind: SensorKind },
}

impl ValidationFailure {
    pub fn kind_label(&self) -> &'static str {
        match self {
            ValidationFailure::OutOfRange { metric, .. } => metric.as_str(),
            ValidationFailure::Flow { .. } => MetricId::Flow.as_str(),
            ValidationFailure::EmptyWindow { metric } => metric.as_str(),
            ValidationFailure::Shape { kind } => kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowValue {
    pub pulses: u64,
    pub litres: f64,
    pub litres_per_minute: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureValue {
    pub volts: f64,
    pub psi: f64,
    pub kpa: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindSpeedValue {
    pub pulses: u64,
    pub metres_per_second: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindDirectionValue {
    pub raw: i64,
    pub degrees: f64,
    pub compass: Compass,
}

/// Validated values of one tick. Absent fields are `null` downstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSnapshot {
    pub timestamp: DateTime<Utc>,
    pub flow: Option<FlowValue>,
    pub pressure: Option<PressureValue>,
    pub wind_speed: Option<WindSpeedValue>,
    pub wind_direction: Option<WindDirectionValue>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub soil_temperature_c: Option<f64>,
}

impl TickSnapshot {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    /// The value each windowed metric aggregates.
    pub fn metric_value(&self, metric: MetricId) -> Option<f64> {
        match metric {
            MetricId::Flow => self.flow.map(|flow| flow.litres_per_minute),
            MetricId::Pressure => self.pressure.map(|pressure| pressure.psi),
            MetricId::WindSpeed => self.wind_speed.map(|wind| wind.metres_per_second),
            MetricId::WindDirection => self.wind_direction.map(|wind| wind.degrees),
            MetricId::Temperature => self.temperature_c,
            MetricId::Humidity => self.humidity_pct,
            MetricId::SoilTemperature => self.soil_temperature_c,
            MetricId::Moisture | MetricId::Lux => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conversions {
    pub flow_pulses_per_litre: f64,
    pub wind_pulses_per_rotation: f64,
    pub wind_metres_per_rotation: f64,
}

impl Default for Conversions {
    fn default() -> Self {
        Self {
            flow_pulses_per_litre: 450.0,
            wind_pulses_per_rotation: 20.0,
            wind_metres_per_rotation: 1.75,
        }
    }
}

/// Range checks plus the linear conversions from raw units.
#[derive(Debug, Clone)]
pub struct Validator {
    limits: ValidationLimits,
    conversions: Conversions,
    wind: WindCalibration,
}

impl Validator {
    pub fn new(limits: ValidationLimits, conversions: Conversions, wind: WindCalibration) -> Self {
        Self {
            limits,
            conversions,
            wind,
        }
    }

    /// Folds one reading into `snapshot`. Unavailable readings leave their
    /// fields untouched and are not failures.
    pub fn apply(
        &self,
        reading: &Reading,
        snapshot: &mut TickSnapshot,
        failures: &mut Vec<ValidationFailure>,
    ) {
        let Some(raw) = reading.raw else {
            return;
        };
        let mut keep = |result: Result<(), ValidationFailure>| {
            if let Err(failure) = result {
                failures.push(failure);
            }
        };
        match reading.kind {
            SensorKind::Flow => keep(self.flow(raw).map(|value| snapshot.flow = Some(value))),
            SensorKind::Pressure => {
                keep(self.pressure(raw).map(|value| snapshot.pressure = Some(value)))
            }
            SensorKind::WindSpeed => {
                keep(self.wind_speed(raw).map(|value| snapshot.wind_speed = Some(value)))
            }
            SensorKind::WindDirection => keep(
                self.wind_direction(raw)
                    .map(|value| snapshot.wind_direction = Some(value)),
            ),
            SensorKind::Climate => match raw {
                RawValue::Climate {
                    temperature_c,
                    humidity_pct,
                } => {
                    keep(
                        check(MetricId::Temperature, temperature_c, self.limits.temperature_c)
                            .map(|value| snapshot.temperature_c = Some(value)),
                    );
                    keep(
                        check(MetricId::Humidity, humidity_pct, self.limits.humidity_pct)
                            .map(|value| snapshot.humidity_pct = Some(value)),
                    );
                }
                _ => keep(Err(ValidationFailure::Shape {
                    kind: SensorKind::Climate,
                })),
            },
            SensorKind::SoilTemperature => keep(
                self.soil_temperature(raw)
                    .map(|value| snapshot.soil_temperature_c = Some(value)),
            ),
            SensorKind::Color => keep(Err(ValidationFailure::Shape {
                kind: SensorKind::Color,
            })),
        }
    }

    pub fn flow(&self, raw: RawValue) -> Result<FlowValue, ValidationFailure> {
        let RawValue::Pulses { count, window } = raw else {
            return Err(ValidationFailure::Shape {
                kind: SensorKind::Flow,
            });
        };
        let seconds = window_seconds(window, MetricId::Flow)?;
        let litres = count as f64 / self.conversions.flow_pulses_per_litre;
        if !self.limits.flow_pulses.contains(count as f64) || !self.limits.flow_litres.contains(litres)
        {
            return Err(ValidationFailure::Flow {
                pulses: count,
                litres,
            });
        }
        Ok(FlowValue {
            pulses: count,
            litres,
            litres_per_minute: litres * 60.0 / seconds,
        })
    }

    pub fn pressure(&self, raw: RawValue) -> Result<PressureValue, ValidationFailure> {
        let RawValue::Volts(volts) = raw else {
            return Err(ValidationFailure::Shape {
                kind: SensorKind::Pressure,
            });
        };
        let volts = check(MetricId::Pressure, volts, self.limits.pressure_volts)?;
        let psi = ((volts - PRESSURE_ZERO_VOLTS) * (PRESSURE_FULL_SCALE_PSI / PRESSURE_SPAN_VOLTS))
            .clamp(0.0, PRESSURE_FULL_SCALE_PSI);
        Ok(PressureValue {
            volts,
            psi,
            kpa: psi * KPA_PER_PSI,
        })
    }

    pub fn wind_speed(&self, raw: RawValue) -> Result<WindSpeedValue, ValidationFailure> {
        let RawValue::Pulses { count, window } = raw else {
            return Err(ValidationFailure::Shape {
                kind: SensorKind::WindSpeed,
            });
        };
        let seconds = window_seconds(window, MetricId::WindSpeed)?;
        let rotations = count as f64 / self.conversions.wind_pulses_per_rotation;
        let speed = rotations * self.conversions.wind_metres_per_rotation / seconds;
        let speed = check(MetricId::WindSpeed, speed, self.limits.wind_speed_ms)?;
        Ok(WindSpeedValue {
            pulses: count,
            metres_per_second: speed,
        })
    }

    pub fn wind_direction(&self, raw: RawValue) -> Result<WindDirectionValue, ValidationFailure> {
        let RawValue::Adc(adc) = raw else {
            return Err(ValidationFailure::Shape {
                kind: SensorKind::WindDirection,
            });
        };
        check(MetricId::WindDirection, adc as f64, self.limits.wind_direction_raw)?;
        let degrees = self.wind.bearing(adc as f64);
        Ok(WindDirectionValue {
            raw: adc,
            degrees,
            compass: Compass::from_degrees(degrees),
        })
    }

    pub fn soil_temperature(&self, raw: RawValue) -> Result<f64, ValidationFailure> {
        let RawValue::Celsius(celsius) = raw else {
            return Err(ValidationFailure::Shape {
                kind: SensorKind::SoilTemperature,
            });
        };
        check(
            MetricId::SoilTemperature,
            celsius,
            self.limits.soil_temperature_c,
        )
    }

    pub fn color(&self, raw: RawValue) -> Result<ColorSample, ValidationFailure> {
        let RawValue::Color(sample) = raw else {
            return Err(ValidationFailure::Shape {
                kind: SensorKind::Color,
            });
        };
        for channel in [sample.red, sample.green, sample.blue] {
            check(MetricId::Moisture, channel, self.limits.color_channel)?;
        }
        check(MetricId::Lux, sample.lux, self.limits.lux)?;
        Ok(sample)
    }
}

fn check(metric: MetricId, value: f64, range: Range) -> Result<f64, ValidationFailure> {
    if range.contains(value) {
        Ok(value)
    } else {
        Err(ValidationFailure::OutOfRange {
            metric,
            value,
            range,
        })
    }
}

fn window_seconds(window: Duration, metric: MetricId) -> Result<f64, ValidationFailure> {
    if window.is_zero() {
        return Err(ValidationFailure::EmptyWindow { metric });
    }
    Ok(window.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(
            ValidationLimits::default(),
            Conversions::default(),
            WindCalibration::default(),
        )
    }

    fn pulses(count: u64) -> RawValue {
        RawValue::Pulses {
            count,
            window: Duration::from_secs(1),
        }
    }

    fn reading(kind: SensorKind, raw: Option<RawValue>) -> Reading {
        Reading {
            kind,
            timestamp: Utc::now(),
            raw,
        }
    }

    #[test]
    fn flow_converts_pulses_to_rate() {
        let flow = validator().flow(pulses(450)).unwrap();
        assert_eq!(flow.litres, 1.0);
        assert_eq!(flow.litres_per_minute, 60.0);
    }

    #[test]
    fn flow_rejects_implausible_pulse_counts() {
        assert!(matches!(
            validator().flow(pulses(5000)),
            Err(ValidationFailure::Flow { pulses: 5000, .. })
        ));
    }

    #[test]
    fn flow_litres_bound_applies_independently() {
        let mut limits = ValidationLimits::default();
        limits.flow_litres = Range::new(0.0, 1.0);
        let strict = Validator::new(limits, Conversions::default(), WindCalibration::default());
        assert!(strict.flow(pulses(450)).is_ok());
        assert!(strict.flow(pulses(500)).is_err());
    }

    #[test]
    fn pressure_clamps_psi_but_rejects_out_of_range_volts() {
        let validator = validator();
        let low = validator.pressure(RawValue::Volts(0.2)).unwrap();
        assert_eq!(low.psi, 0.0);
        let mid = validator.pressure(RawValue::Volts(2.5)).unwrap();
        assert_eq!(mid.psi, 50.0);
        assert!((mid.kpa - 344.738).abs() < 1e-9);
        let high = validator.pressure(RawValue::Volts(5.0)).unwrap();
        assert_eq!(high.psi, 100.0);
        assert!(validator.pressure(RawValue::Volts(6.0)).is_err());
        assert!(validator.pressure(RawValue::Volts(f64::NAN)).is_err());
    }

    #[test]
    fn wind_speed_uses_rotation_constants() {
        let speed = validator().wind_speed(pulses(40)).unwrap();
        assert!((speed.metres_per_second - 3.5).abs() < 1e-9);
        assert!(validator().wind_speed(pulses(2000)).is_err());
        assert!(matches!(
            validator().wind_speed(RawValue::Pulses {
                count: 3,
                window: Duration::ZERO
            }),
            Err(ValidationFailure::EmptyWindow { .. })
        ));
    }

    #[test]
    fn failed_values_never_reach_the_snapshot() {
        let validator = validator();
        let mut snapshot = TickSnapshot::new(Utc::now());
        let mut failures = Vec::new();
        let readings = [
            reading(SensorKind::Flow, Some(pulses(9999))),
            reading(SensorKind::Pressure, Some(RawValue::Volts(9.0))),
            reading(SensorKind::WindSpeed, Some(pulses(1_000_000))),
            reading(SensorKind::WindDirection, Some(RawValue::Adc(-4))),
            reading(
                SensorKind::Climate,
                Some(RawValue::Climate {
                    temperature_c: 120.0,
                    humidity_pct: 55.0,
                }),
            ),
        ];
        for reading in &readings {
            validator.apply(reading, &mut snapshot, &mut failures);
        }
        assert_eq!(failures.len(), 5);
        assert!(snapshot.flow.is_none());
        assert!(snapshot.pressure.is_none());
        assert!(snapshot.wind_speed.is_none());
        assert!(snapshot.wind_direction.is_none());
        assert!(snapshot.temperature_c.is_none());
        assert_eq!(snapshot.humidity_pct, Some(55.0));
    }

    #[test]
    fn accepted_values_stay_inside_their_ranges() {
        let validator = validator();
        let limits = ValidationLimits::default();
        for volts in [-1.0, 0.0, 0.4, 2.2, 5.5, 5.6, 40.0] {
            if let Ok(value) = validator.pressure(RawValue::Volts(volts)) {
                assert!(limits.pressure_volts.contains(value.volts));
                assert!((0.0..=100.0).contains(&value.psi));
            }
        }
        for raw in [-100_i64, 0, 20_000, 32_767, 40_000] {
            if let Ok(value) = validator.wind_direction(RawValue::Adc(raw)) {
                assert!(limits.wind_direction_raw.contains(value.raw as f64));
                assert!((0.0..360.0).contains(&value.degrees));
            }
        }
        for count in [0_u64, 10, 2000, 2001, 90_000] {
            if let Ok(flow) = validator.flow(pulses(count)) {
                assert!(limits.flow_pulses.contains(flow.pulses as f64));
                assert!(limits.flow_litres.contains(flow.litres));
            }
        }
    }

    #[test]
    fn unavailable_readings_are_not_failures() {
        let mut snapshot = TickSnapshot::new(Utc::now());
        let mut failures = Vec::new();
        validator().apply(&reading(SensorKind::Flow, None), &mut snapshot, &mut failures);
        assert!(failures.is_empty());
        assert!(snapshot.flow.is_none());
    }

    #[test]
    fn mismatched_shape_is_a_failure() {
        let mut snapshot = TickSnapshot::new(Utc::now());
        let mut failures = Vec::new();
        validator().apply(
            &reading(SensorKind::Pressure, Some(RawValue::Adc(3))),
            &mut snapshot,
            &mut failures,
        );
        assert_eq!(
            failures,
            vec![ValidationFailure::Shape {
                kind: SensorKind::Pressure
            }]
        );
    }

    #[test]
    fn color_channels_checked() {
        let sample = ColorSample {
            red: 10.0,
            green: 12.0,
            blue: 17.0,
            lux: 300.0,
        };
        assert_eq!(validator().color(RawValue::Color(sample)).unwrap(), sample);
        let dark = ColorSample { lux: -1.0, ..sample };
        assert!(validator().color(RawValue::Color(dark)).is_err());
    }

    #[test]
    fn soil_temperature_uses_ds18b20_range() {
        let validator = validator();
        assert_eq!(validator.soil_temperature(RawValue::Celsius(-12.5)), Ok(-12.5));
        assert!(validator.soil_temperature(RawValue::Celsius(125.5)).is_err());
        assert!(validator.soil_temperature(RawValue::Volts(1.0)).is_err());

        let mut snapshot = TickSnapshot::new(Utc::now());
        let mut failures = Vec::new();
        validator.apply(
            &reading(SensorKind::SoilTemperature, Some(RawValue::Celsius(17.25))),
            &mut snapshot,
            &mut failures,
        );
        assert!(failures.is_empty());
        assert_eq!(snapshot.metric_value(MetricId::SoilTemperature), Some(17.25));
        assert!(snapshot.temperature_c.is_none());
    }
}
