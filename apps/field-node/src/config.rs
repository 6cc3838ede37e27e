use crate::broker::MqttSettings;
use crate::calibration::WindCalibration;
use crate::metric::ValidationLimits;
use crate::plant::PlantSchedule;
use crate::publisher::BackoffPolicy;
use crate::retry::QueueLimits;
use crate::validate::Conversions;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/opt/field-node/setup/config.json";
const IIO_DEVICES: &str = "/sys/bus/iio/devices";
const COUNTER_DEVICES: &str = "/sys/bus/counter/devices";
const W1_DEVICES: &str = "/sys/bus/w1/devices";
const DS18B20_FAMILY: &str = "28-";

#[derive(Debug, Clone, PartialEq)]
pub struct PulseSensorConfig {
    pub count_path: PathBuf,
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdcSensorConfig {
    pub raw_path: PathBuf,
    pub scale_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClimateSensorConfig {
    pub device_dir: PathBuf,
    pub attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorSensorConfig {
    pub device_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct W1SensorConfig {
    pub slave_path: PathBuf,
}

/// A `None` entry disables that sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorConfig {
    pub flow: Option<PulseSensorConfig>,
    pub pressure: Option<AdcSensorConfig>,
    pub wind_speed: Option<PulseSensorConfig>,
    pub wind_direction: Option<AdcSensorConfig>,
    pub climate: Option<ClimateSensorConfig>,
    pub soil_temperature: Option<W1SensorConfig>,
    pub color: Option<ColorSensorConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub software_version: String,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive: Duration,
    pub mqtt_topic_prefix: String,
    pub mqtt_status_prefix: String,

    pub http_bind: String,

    pub data_dir: PathBuf,
    pub calibration_path: PathBuf,

    pub tick_period: Duration,
    pub window_length: Duration,
    pub burst_window: Duration,
    pub plant: PlantSchedule,
    pub status_interval: Duration,

    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,

    pub error_log_max_lines: usize,
    pub average_log_max_lines: usize,
    pub max_queued_records: usize,
    pub keep_free_bytes: u64,

    pub sensors: SensorConfig,
    pub conversions: Conversions,
    pub limits: ValidationLimits,
    pub wind_calibration: WindCalibration,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    node_name: Option<String>,
    #[serde(default)]
    validation_limits: Option<ValidationLimits>,
    #[serde(default)]
    wind_calibration: Option<WindCalibration>,
    #[serde(default)]
    flow_pulses_per_litre: Option<f64>,
}

fn setup_config_path() -> PathBuf {
    env_optional("FIELD_NODE_SETUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "field-node failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "field-node failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) {
    if let Some(name) = overrides
        .node_name
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        config.node_name = name.to_string();
    }
    if let Some(limits) = &overrides.validation_limits {
        if limits.is_well_formed() {
            config.limits = limits.clone();
        } else {
            tracing::warn!("setup config validation limits malformed; keeping defaults");
        }
    }
    if let Some(wind) = overrides.wind_calibration {
        if wind.is_well_formed() {
            config.wind_calibration = wind;
        } else {
            tracing::warn!("setup config wind calibration anchors out of order; keeping defaults");
        }
    }
    if let Some(ppl) = overrides
        .flow_pulses_per_litre
        .filter(|v| v.is_finite() && *v > 0.0)
    {
        config.conversions.flow_pulses_per_litre = ppl;
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let node_name = env_string("FIELD_NODE_NAME", Some("field-node".to_string()))?;
        let software_version = env_string(
            "FIELD_NODE_VERSION",
            Some(env!("CARGO_PKG_VERSION").to_string()),
        )?;

        let mqtt_url = env_string(
            "FIELD_NODE_MQTT_URL",
            Some("mqtt://127.0.0.1:1883".to_string()),
        )?;
        let url = Url::parse(&mqtt_url).context("invalid FIELD_NODE_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("FIELD_NODE_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = env_optional("FIELD_NODE_MQTT_USERNAME");
        let mqtt_password = env_optional("FIELD_NODE_MQTT_PASSWORD");
        let mqtt_client_id = env_string(
            "FIELD_NODE_MQTT_CLIENT_ID",
            Some(format!("field-node-{node_name}")),
        )?;
        let mqtt_keepalive =
            Duration::from_secs(env_u64("FIELD_NODE_MQTT_KEEPALIVE_SECS", Some(15))?.max(5));
        let mqtt_topic_prefix =
            env_string("FIELD_NODE_MQTT_TOPIC_PREFIX", Some("sensors".to_string()))?;
        let mqtt_status_prefix =
            env_string("FIELD_NODE_MQTT_STATUS_PREFIX", Some("status".to_string()))?;

        let http_bind = env_string("FIELD_NODE_HTTP_BIND", Some("127.0.0.1:9102".to_string()))?;

        let data_dir = PathBuf::from(env_string(
            "FIELD_NODE_DATA_DIR",
            Some("/opt/field-node/data".to_string()),
        )?);
        let calibration_path = env_optional("FIELD_NODE_CALIBRATION_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("calibration.json"));

        let tick_period = Duration::from_millis(env_u64("FIELD_NODE_TICK_MS", Some(1000))?.max(10));
        let window_length =
            Duration::from_secs(env_u64("FIELD_NODE_WINDOW_SECONDS", Some(300))?.max(1));
        let burst_window =
            Duration::from_secs(env_u64("FIELD_NODE_BURST_WINDOW_SECONDS", Some(5))?.max(1));
        let plant = PlantSchedule {
            interval: Duration::from_secs(
                env_u64("FIELD_NODE_PLANT_INTERVAL_SECONDS", Some(300))?.max(1),
            ),
            readings: env_u64("FIELD_NODE_PLANT_READINGS", Some(4))?.max(1) as usize,
            spacing: Duration::from_millis(env_u64("FIELD_NODE_PLANT_SPACING_MS", Some(2000))?),
        };
        let status_interval =
            Duration::from_secs(env_u64("FIELD_NODE_STATUS_INTERVAL_SECONDS", Some(10))?.max(1));

        let backoff_initial =
            Duration::from_secs(env_u64("FIELD_NODE_BACKOFF_INITIAL_SECONDS", Some(5))?.max(1));
        let backoff_max = Duration::from_secs(env_u64("FIELD_NODE_BACKOFF_MAX_SECONDS", Some(60))?)
            .max(backoff_initial);
        let connect_timeout =
            Duration::from_secs(env_u64("FIELD_NODE_CONNECT_TIMEOUT_SECONDS", Some(10))?.max(1));

        let error_log_max_lines = env_u64("FIELD_NODE_ERROR_LOG_MAX_LINES", Some(100))?.max(1) as usize;
        let average_log_max_lines =
            env_u64("FIELD_NODE_AVERAGE_LOG_MAX_LINES", Some(10_000))?.max(1) as usize;
        let max_queued_records =
            env_u64("FIELD_NODE_MAX_QUEUED_RECORDS", Some(100_000))?.max(1) as usize;
        let keep_free_bytes = env_u64("FIELD_NODE_KEEP_FREE_BYTES", Some(64 * 1024 * 1024))?;

        let sensors = sensor_config_from_env()?;
        let conversions = Conversions {
            flow_pulses_per_litre: env_f64("FIELD_NODE_FLOW_PULSES_PER_LITRE", 450.0)?,
            wind_pulses_per_rotation: env_f64("FIELD_NODE_WIND_PULSES_PER_ROTATION", 20.0)?,
            wind_metres_per_rotation: env_f64("FIELD_NODE_WIND_METRES_PER_ROTATION", 1.75)?,
        };
        if [
            conversions.flow_pulses_per_litre,
            conversions.wind_pulses_per_rotation,
            conversions.wind_metres_per_rotation,
        ]
        .iter()
        .any(|v| !v.is_finite() || *v <= 0.0)
        {
            return Err(anyhow!("pulse conversion constants must be positive"));
        }

        let mut config = Self {
            node_name,
            software_version,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive,
            mqtt_topic_prefix,
            mqtt_status_prefix,
            http_bind,
            data_dir,
            calibration_path,
            tick_period,
            window_length,
            burst_window,
            plant,
            status_interval,
            backoff_initial,
            backoff_max,
            connect_timeout,
            error_log_max_lines,
            average_log_max_lines,
            max_queued_records,
            keep_free_bytes,
            sensors,
            conversions,
            limits: ValidationLimits::default(),
            wind_calibration: WindCalibration::default(),
        };

        if let Some(overrides) = load_setup_config_overrides(&setup_config_path()) {
            apply_setup_overrides(&mut config, &overrides);
        }

        Ok(config)
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            client_id: self.mqtt_client_id.clone(),
            keep_alive: self.mqtt_keepalive,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.backoff_initial,
            max: self.backoff_max,
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            max_records: self.max_queued_records,
            keep_free_bytes: self.keep_free_bytes,
        }
    }
}

fn sensor_config_from_env() -> Result<SensorConfig> {
    let pulse_window = |key: &str| -> Result<Duration> {
        Ok(Duration::from_millis(env_u64(key, Some(1000))?))
    };
    let iio = |device: &str, file: &str| PathBuf::from(IIO_DEVICES).join(device).join(file);

    let flow = if env_bool("FIELD_NODE_FLOW_ENABLED", true)? {
        Some(PulseSensorConfig {
            count_path: env_path(
                "FIELD_NODE_FLOW_COUNT_PATH",
                PathBuf::from(COUNTER_DEVICES).join("counter0/count0/count"),
            ),
            window: pulse_window("FIELD_NODE_FLOW_SAMPLE_MS")?,
        })
    } else {
        None
    };

    let pressure = if env_bool("FIELD_NODE_PRESSURE_ENABLED", true)? {
        Some(AdcSensorConfig {
            raw_path: env_path(
                "FIELD_NODE_PRESSURE_RAW_PATH",
                iio("iio:device0", "in_voltage0_raw"),
            ),
            scale_path: Some(env_path(
                "FIELD_NODE_PRESSURE_SCALE_PATH",
                iio("iio:device0", "in_voltage0_scale"),
            )),
        })
    } else {
        None
    };

    let wind_speed = if env_bool("FIELD_NODE_WIND_SPEED_ENABLED", true)? {
        Some(PulseSensorConfig {
            count_path: env_path(
                "FIELD_NODE_WIND_SPEED_COUNT_PATH",
                PathBuf::from(COUNTER_DEVICES).join("counter1/count0/count"),
            ),
            window: pulse_window("FIELD_NODE_WIND_SPEED_SAMPLE_MS")?,
        })
    } else {
        None
    };

    let wind_direction = if env_bool("FIELD_NODE_WIND_DIRECTION_ENABLED", true)? {
        Some(AdcSensorConfig {
            raw_path: env_path(
                "FIELD_NODE_WIND_DIRECTION_RAW_PATH",
                iio("iio:device0", "in_voltage1_raw"),
            ),
            scale_path: None,
        })
    } else {
        None
    };

    let climate = if env_bool("FIELD_NODE_CLIMATE_ENABLED", true)? {
        Some(ClimateSensorConfig {
            device_dir: env_path(
                "FIELD_NODE_CLIMATE_DEVICE_DIR",
                PathBuf::from(IIO_DEVICES).join("iio:device1"),
            ),
            attempts: env_u64("FIELD_NODE_CLIMATE_ATTEMPTS", Some(3))?.max(1) as u32,
            retry_delay: Duration::from_millis(env_u64("FIELD_NODE_CLIMATE_RETRY_MS", Some(500))?),
        })
    } else {
        None
    };

    let soil_temperature = if env_bool("FIELD_NODE_SOIL_TEMP_ENABLED", false)? {
        let slave_path = match (
            env_optional("FIELD_NODE_SOIL_TEMP_PATH"),
            env_optional("FIELD_NODE_SOIL_TEMP_DEVICE"),
        ) {
            (Some(path), _) => Some(PathBuf::from(path)),
            (None, Some(device)) => Some(PathBuf::from(W1_DEVICES).join(device).join("w1_slave")),
            (None, None) => discover_w1_slave(Path::new(W1_DEVICES)),
        };
        if slave_path.is_none() {
            tracing::warn!(
                dir = W1_DEVICES,
                "no DS18B20 found on the 1-wire bus; soil temperature disabled"
            );
        }
        slave_path.map(|slave_path| W1SensorConfig { slave_path })
    } else {
        None
    };

    let color = if env_bool("FIELD_NODE_COLOR_ENABLED", true)? {
        Some(ColorSensorConfig {
            device_dir: env_path(
                "FIELD_NODE_COLOR_DEVICE_DIR",
                PathBuf::from(IIO_DEVICES).join("iio:device2"),
            ),
        })
    } else {
        None
    };

    Ok(SensorConfig {
        flow,
        pressure,
        wind_speed,
        wind_direction,
        climate,
        soil_temperature,
        color,
    })
}

/// First DS18B20 (family code 28) under the 1-wire device directory, by name.
fn discover_w1_slave(devices: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(devices)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(DS18B20_FAMILY))
        .map(|entry| entry.path().join("w1_slave"))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match env_optional(key) {
        Some(value) => value.parse::<f64>().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_optional(key) {
        Some(value) => parse_bool(&value).ok_or_else(|| anyhow!("invalid {key}: {value}")),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env_optional(key).map(PathBuf::from).unwrap_or(default)
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
