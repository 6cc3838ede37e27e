use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricId {
    Flow,
    Pressure,
    WindSpeed,
    WindDirection,
    Temperature,
    Humidity,
    SoilTemperature,
    Moisture,
    Lux,
}

impl MetricId {
    /// Metrics that are sampled every tick and rolled into windows.
    pub const WINDOWED: [MetricId; 7] = [
        MetricId::Flow,
        MetricId::Pressure,
        MetricId::WindSpeed,
        MetricId::WindDirection,
        MetricId::Temperature,
        MetricId::Humidity,
        MetricId::SoilTemperature,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricId::Flow => "flow",
            MetricId::Pressure => "pressure",
            MetricId::WindSpeed => "wind_speed",
            MetricId::WindDirection => "wind_direction",
            MetricId::Temperature => "temperature",
            MetricId::Humidity => "humidity",
            MetricId::SoilTemperature => "soil_temperature",
            MetricId::Moisture => "moisture",
            MetricId::Lux => "lux",
        }
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive sanity bounds for one raw quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }

    pub fn is_well_formed(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Pulses counted during one sampling window.
    pub flow_pulses: Range,
    /// Litres derived from one sampling window.
    pub flow_litres: Range,
    pub pressure_volts: Range,
    pub wind_speed_ms: Range,
    pub wind_direction_raw: Range,
    pub temperature_c: Range,
    pub humidity_pct: Range,
    /// DS18B20 operating range.
    pub soil_temperature_c: Range,
    pub color_channel: Range,
    pub lux: Range,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            flow_pulses: Range::new(0.0, 2000.0),
            flow_litres: Range::new(0.0, 5.0),
            pressure_volts: Range::new(0.0, 5.5),
            wind_speed_ms: Range::new(0.0, 75.0),
            wind_direction_raw: Range::new(0.0, 32767.0),
            temperature_c: Range::new(-40.0, 80.0),
            humidity_pct: Range::new(0.0, 100.0),
            soil_temperature_c: Range::new(-55.0, 125.0),
            color_channel: Range::new(0.0, 65535.0),
            lux: Range::new(0.0, 100_000.0),
        }
    }
}

impl ValidationLimits {
    pub fn is_well_formed(&self) -> bool {
        [
            self.flow_pulses,
            self.flow_litres,
            self.pressure_volts,
            self.wind_speed_ms,
            self.wind_direction_raw,
            self.temperature_c,
            self.humidity_pct,
            self.soil_temperature_c,
            self.color_channel,
            self.lux,
        ]
        .iter()
        .all(Range::is_well_formed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_rejects_non_finite_and_out_of_bounds() {
        let range = Range::new(0.0, 10.0);
        assert!(range.contains(0.0));
        assert!(range.contains(10.0));
        assert!(!range.contains(-0.1));
        assert!(!range.contains(10.1));
        assert!(!range.contains(f64::NAN));
        assert!(!range.contains(f64::INFINITY));
    }

    #[test]
    fn partial_limits_fill_from_defaults() {
        let parsed: ValidationLimits =
            serde_json::from_str(r#"{"temperature_c":{"min":-10.0,"max":50.0}}"#).unwrap();
        assert_eq!(parsed.temperature_c, Range::new(-10.0, 50.0));
        assert_eq!(parsed.humidity_pct, ValidationLimits::default().humidity_pct);
        assert!(parsed.is_well_formed());
    }
}
