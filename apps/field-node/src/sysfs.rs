use crate::config::{
    AdcSensorConfig, ClimateSensorConfig, ColorSensorConfig, PulseSensorConfig, SensorConfig,
    W1SensorConfig,
};
use crate::sensors::{slot, ColorSample, RawValue, SensorError, SensorKind, SensorSlots, SensorSource};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

fn read_value<T: FromStr>(path: &Path) -> Result<T, SensorError> {
    let raw = fs::read_to_string(path).map_err(|source| SensorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let trimmed = raw.trim();
    trimmed.parse().map_err(|_| SensorError::Parse {
        path: path.to_path_buf(),
        raw: trimmed.to_string(),
    })
}

/// Pulse count from the Linux counter subsystem, differenced over a fixed window.
pub struct PulseCounter {
    kind: SensorKind,
    count_path: PathBuf,
    window: Duration,
}

impl PulseCounter {
    pub fn new(kind: SensorKind, config: &PulseSensorConfig) -> Self {
        Self {
            kind,
            count_path: config.count_path.clone(),
            window: config.window,
        }
    }
}

impl SensorSource for PulseCounter {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn sample(&mut self) -> Result<RawValue, SensorError> {
        let start: u64 = read_value(&self.count_path)?;
        std::thread::sleep(self.window);
        let end: u64 = read_value(&self.count_path)?;
        let count = end.checked_sub(start).ok_or_else(|| {
            SensorError::Unavailable(format!("counter went backwards ({start} -> {end})"))
        })?;
        Ok(RawValue::Pulses {
            count,
            window: self.window,
        })
    }
}

/// IIO ADC channel scaled to volts (`raw * scale` is in millivolts).
pub struct IioVoltage {
    kind: SensorKind,
    raw_path: PathBuf,
    scale_path: Option<PathBuf>,
}

impl IioVoltage {
    pub fn new(kind: SensorKind, config: &AdcSensorConfig) -> Self {
        Self {
            kind,
            raw_path: config.raw_path.clone(),
            scale_path: config.scale_path.clone(),
        }
    }
}

impl SensorSource for IioVoltage {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn sample(&mut self) -> Result<RawValue, SensorError> {
        let raw: f64 = read_value(&self.raw_path)?;
        let scale_mv: f64 = match &self.scale_path {
            Some(path) => read_value(path)?,
            None => 1.0,
        };
        Ok(RawValue::Volts(raw * scale_mv / 1000.0))
    }
}

/// Unscaled IIO ADC counts.
pub struct IioRaw {
    kind: SensorKind,
    raw_path: PathBuf,
}

impl IioRaw {
    pub fn new(kind: SensorKind, config: &AdcSensorConfig) -> Self {
        Self {
            kind,
            raw_path: config.raw_path.clone(),
        }
    }
}

impl SensorSource for IioRaw {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn sample(&mut self) -> Result<RawValue, SensorError> {
        Ok(RawValue::Adc(read_value(&self.raw_path)?))
    }
}

/// IIO humidity/temperature device. Both values come from the same read
/// attempt; a failure on either drops both.
pub struct IioClimate {
    temperature_path: PathBuf,
    humidity_path: PathBuf,
    attempts: u32,
    retry_delay: Duration,
}

impl IioClimate {
    pub fn new(config: &ClimateSensorConfig) -> Self {
        Self {
            temperature_path: config.device_dir.join("in_temp_input"),
            humidity_path: config.device_dir.join("in_humidityrelative_input"),
            attempts: config.attempts.max(1),
            retry_delay: config.retry_delay,
        }
    }

    fn read_once(&self) -> Result<RawValue, SensorError> {
        let milli_c: f64 = read_value(&self.temperature_path)?;
        let milli_pct: f64 = read_value(&self.humidity_path)?;
        Ok(RawValue::Climate {
            temperature_c: milli_c / 1000.0,
            humidity_pct: milli_pct / 1000.0,
        })
    }
}

impl SensorSource for IioClimate {
    fn kind(&self) -> SensorKind {
        SensorKind::Climate
    }

    fn sample(&mut self) -> Result<RawValue, SensorError> {
        let mut attempt = 1;
        loop {
            match self.read_once() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts => return Err(err),
                Err(err) => {
                    tracing::trace!(attempt, error = %err, "climate read failed; retrying");
                    attempt += 1;
                    std::thread::sleep(self.retry_delay);
                }
            }
        }
    }
}

/// IIO colour sensor; the clear channel stands in for lux.
pub struct IioColor {
    red: PathBuf,
    green: PathBuf,
    blue: PathBuf,
    clear: PathBuf,
}

impl IioColor {
    pub fn new(config: &ColorSensorConfig) -> Self {
        let dir = &config.device_dir;
        Self {
            red: dir.join("in_intensity_red_raw"),
            green: dir.join("in_intensity_green_raw"),
            blue: dir.join("in_intensity_blue_raw"),
            clear: dir.join("in_intensity_clear_raw"),
        }
    }
}

impl SensorSource for IioColor {
    fn kind(&self) -> SensorKind {
        SensorKind::Color
    }

    fn sample(&mut self) -> Result<RawValue, SensorError> {
        Ok(RawValue::Color(ColorSample {
            red: read_value(&self.red)?,
            green: read_value(&self.green)?,
            blue: read_value(&self.blue)?,
            lux: read_value(&self.clear)?,
        }))
    }
}

/// DS18B20 on the 1-Wire bus. `w1_slave` holds two lines: the CRC verdict
/// (ending in `YES` when the frame is good) and the reading as `t=<milli °C>`.
pub struct W1Thermometer {
    slave_path: PathBuf,
}

impl W1Thermometer {
    pub fn new(config: &W1SensorConfig) -> Self {
        Self {
            slave_path: config.slave_path.clone(),
        }
    }
}

fn parse_w1_slave(path: &Path, raw: &str) -> Result<f64, SensorError> {
    let mut lines = raw.lines();
    let verdict = lines.next().unwrap_or_default().trim_end();
    if !verdict.ends_with("YES") {
        return Err(SensorError::Unavailable(format!(
            "1-wire CRC check failed on {}",
            path.display()
        )));
    }
    let parse_error = || SensorError::Parse {
        path: path.to_path_buf(),
        raw: raw.trim().to_string(),
    };
    let milli_c: i64 = lines
        .next()
        .and_then(|line| line.rsplit_once("t="))
        .ok_or_else(parse_error)?
        .1
        .trim()
        .parse()
        .map_err(|_| parse_error())?;
    Ok(milli_c as f64 / 1000.0)
}

impl SensorSource for W1Thermometer {
    fn kind(&self) -> SensorKind {
        SensorKind::SoilTemperature
    }

    fn sample(&mut self) -> Result<RawValue, SensorError> {
        let raw = fs::read_to_string(&self.slave_path).map_err(|source| SensorError::Io {
            path: self.slave_path.clone(),
            source,
        })?;
        parse_w1_slave(&self.slave_path, &raw).map(RawValue::Celsius)
    }
}

pub fn build_slots(config: &SensorConfig) -> SensorSlots {
    SensorSlots {
        flow: config
            .flow
            .as_ref()
            .map(|flow| slot(PulseCounter::new(SensorKind::Flow, flow))),
        pressure: config
            .pressure
            .as_ref()
            .map(|adc| slot(IioVoltage::new(SensorKind::Pressure, adc))),
        wind_speed: config
            .wind_speed
            .as_ref()
            .map(|counter| slot(PulseCounter::new(SensorKind::WindSpeed, counter))),
        wind_direction: config
            .wind_direction
            .as_ref()
            .map(|adc| slot(IioRaw::new(SensorKind::WindDirection, adc))),
        climate: config.climate.as_ref().map(|climate| slot(IioClimate::new(climate))),
        soil_temperature: config
            .soil_temperature
            .as_ref()
            .map(|w1| slot(W1Thermometer::new(w1))),
        color: config.color.as_ref().map(|color| slot(IioColor::new(color))),
    }
}
