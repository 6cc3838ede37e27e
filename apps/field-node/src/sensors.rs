use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorKind {
    Flow,
    Pressure,
    WindSpeed,
    WindDirection,
    Climate,
    SoilTemperature,
    Color,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Flow => "flow",
            SensorKind::Pressure => "pressure",
            SensorKind::WindSpeed => "wind_speed",
            SensorKind::WindDirection => "wind_direction",
            SensorKind::Climate => "climate",
            SensorKind::SoilTemperature => "soil_temperature",
            SensorKind::Color => "color",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorSample {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub lux: f64,
}

/// Unvalidated value as reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    /// Pulses counted over `window`.
    Pulses { count: u64, window: Duration },
    Volts(f64),
    Adc(i64),
    Climate { temperature_c: f64, humidity_pct: f64 },
    Celsius(f64),
    Color(ColorSample),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: SensorKind,
    pub timestamp: DateTime<Utc>,
    /// `None` when the source could not be read this tick.
    pub raw: Option<RawValue>,
}

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unparseable value {raw:?} in {}", .path.display())]
    Parse { path: PathBuf, raw: String },
    #[error("{0}")]
    Unavailable(String),
}

pub trait SensorSource: Send {
    fn kind(&self) -> SensorKind;

    /// Blocking read. May sleep for the source's counting window.
    fn sample(&mut self) -> Result<RawValue, SensorError>;
}

/// Samples a source, folding driver errors into an unavailable reading.
pub fn read(source: &mut dyn SensorSource, timestamp: DateTime<Utc>) -> Reading {
    let kind = source.kind();
    let raw = match source.sample() {
        Ok(raw) => Some(raw),
        Err(err) => {
            tracing::debug!(sensor = %kind, error = %err, "sensor unavailable");
            None
        }
    };
    Reading {
        kind,
        timestamp,
        raw,
    }
}

pub type SensorSlot = Arc<Mutex<Box<dyn SensorSource>>>;

pub fn slot(source: impl SensorSource + 'static) -> SensorSlot {
    let boxed: Box<dyn SensorSource> = Box::new(source);
    Arc::new(Mutex::new(boxed))
}

/// One optional source per capability; `None` means disabled.
#[derive(Default, Clone)]
pub struct SensorSlots {
    pub flow: Option<SensorSlot>,
    pub pressure: Option<SensorSlot>,
    pub wind_speed: Option<SensorSlot>,
    pub wind_direction: Option<SensorSlot>,
    pub climate: Option<SensorSlot>,
    pub soil_temperature: Option<SensorSlot>,
    pub color: Option<SensorSlot>,
}

impl SensorSlots {
    pub fn enabled_count(&self) -> usize {
        self.per_tick().len() + usize::from(self.color.is_some())
    }

    /// Sources sampled on every tick. Colour runs on the plant cadence.
    pub fn per_tick(&self) -> Vec<SensorSlot> {
        [
            &self.flow,
            &self.pressure,
            &self.wind_speed,
            &self.wind_direction,
            &self.climate,
            &self.soil_temperature,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

/// Reads every slot concurrently on the blocking pool. All readings share `timestamp`.
pub async fn sample_all(slots: &[SensorSlot], timestamp: DateTime<Utc>) -> Vec<Reading> {
    let tasks = slots.iter().cloned().map(|slot| {
        tokio::task::spawn_blocking(move || {
            let mut source = slot.lock().unwrap_or_else(PoisonError::into_inner);
            read(&mut **source, timestamp)
        })
    });

    join_all(tasks)
        .await
        .into_iter()
        .filter_map(|joined| match joined {
            Ok(reading) => Some(reading),
            Err(err) => {
                tracing::warn!(error = %err, "sensor task failed");
                None
            }
        })
        .collect()
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a script of results, then repeats the last one.
    pub struct ScriptedSource {
        kind: SensorKind,
        script: VecDeque<Option<RawValue>>,
        last: Option<RawValue>,
    }

    impl ScriptedSource {
        pub fn new(kind: SensorKind, script: Vec<Option<RawValue>>) -> Self {
            Self {
                kind,
                script: script.into(),
                last: None,
            }
        }

        pub fn constant(kind: SensorKind, value: RawValue) -> Self {
            Self::new(kind, vec![Some(value)])
        }
    }

    impl SensorSource for ScriptedSource {
        fn kind(&self) -> SensorKind {
            self.kind
        }

        fn sample(&mut self) -> Result<RawValue, SensorError> {
            let next = match self.script.pop_front() {
                Some(next) => {
                    self.last = next;
                    next
                }
                None => self.last,
            };
            next.ok_or_else(|| SensorError::Unavailable(format!("{} offline", self.kind)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedSource;
    use super::*;

    #[test]
    fn driver_errors_become_unavailable_readings() {
        let mut source = ScriptedSource::new(SensorKind::Pressure, vec![None]);
        let reading = read(&mut source, Utc::now());
        assert_eq!(reading.kind, SensorKind::Pressure);
        assert!(reading.raw.is_none());
    }

    #[tokio::test]
    async fn concurrent_sampling_shares_one_timestamp() {
        let slots = SensorSlots {
            pressure: Some(slot(ScriptedSource::constant(
                SensorKind::Pressure,
                RawValue::Volts(2.5),
            ))),
            wind_direction: Some(slot(ScriptedSource::constant(
                SensorKind::WindDirection,
                RawValue::Adc(14350),
            ))),
            climate: Some(slot(ScriptedSource::new(SensorKind::Climate, vec![None]))),
            color: Some(slot(ScriptedSource::new(SensorKind::Color, vec![None]))),
            ..SensorSlots::default()
        };
        assert_eq!(slots.enabled_count(), 4);

        let now = Utc::now();
        let readings = sample_all(&slots.per_tick(), now).await;
        assert_eq!(readings.len(), 3);
        assert!(readings.iter().all(|reading| reading.timestamp == now));
        assert!(!readings.iter().any(|reading| reading.kind == SensorKind::Color));
        let climate = readings
            .iter()
            .find(|reading| reading.kind == SensorKind::Climate)
            .unwrap();
        assert!(climate.raw.is_none());
    }
}
