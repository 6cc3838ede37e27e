use crate::errlog::ErrorEvent;
use crate::health::HostReport;
use crate::validate::TickSnapshot;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Sets,
    Environment,
    Plant,
}

impl Group {
    pub fn as_str(self) -> &'static str {
        match self {
            Group::Sets => "sets",
            Group::Environment => "environment",
            Group::Plant => "plant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlantSummary {
    pub timestamp: DateTime<Utc>,
    pub moisture_pct: Option<f64>,
    pub blue: Option<f64>,
    pub lux: Option<f64>,
    pub samples: usize,
}

/// Node health records, published under the status prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChannel {
    System,
    Errors,
}

impl StatusChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusChannel::System => "system",
            StatusChannel::Errors => "errors",
        }
    }
}

/// Builds the per-group telemetry records. Every record names the node, the
/// sample time and the software version; missing metrics are `null`.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    topic_prefix: String,
    status_prefix: String,
    node_name: String,
    version: String,
}

impl RecordBuilder {
    pub fn new(topic_prefix: &str, node_name: &str, version: &str) -> Self {
        Self {
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            status_prefix: "status".to_string(),
            node_name: node_name.to_string(),
            version: version.to_string(),
        }
    }

    pub fn with_status_prefix(mut self, prefix: &str) -> Self {
        self.status_prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn topic(&self, group: Group) -> String {
        format!("{}/{}", self.topic_prefix, group.as_str())
    }

    pub fn status_topic(&self, channel: StatusChannel) -> String {
        format!("{}/{}", self.status_prefix, channel.as_str())
    }

    pub fn sets(&self, snapshot: &TickSnapshot) -> PublishRecord {
        let flow = snapshot.flow;
        let pressure = snapshot.pressure;
        PublishRecord {
            topic: self.topic(Group::Sets),
            payload: json!({
                "sensor_name": self.node_name,
                "timestamp": timestamp(snapshot.timestamp),
                "version": self.version,
                "flow_pulses": flow.map(|flow| flow.pulses),
                "flow_litres": flow.map(|flow| flow.litres),
                "flow_lpm": flow.map(|flow| flow.litres_per_minute),
                "pressure_volts": pressure.map(|pressure| pressure.volts),
                "pressure_psi": pressure.map(|pressure| pressure.psi),
                "pressure_kpa": pressure.map(|pressure| pressure.kpa),
            }),
        }
    }

    pub fn environment(&self, snapshot: &TickSnapshot) -> PublishRecord {
        let wind_speed = snapshot.wind_speed;
        let wind_direction = snapshot.wind_direction;
        PublishRecord {
            topic: self.topic(Group::Environment),
            payload: json!({
                "sensor_name": self.node_name,
                "timestamp": timestamp(snapshot.timestamp),
                "version": self.version,
                "temperature_c": snapshot.temperature_c,
                "humidity_pct": snapshot.humidity_pct,
                "soil_temperature_c": snapshot.soil_temperature_c,
                "wind_speed_ms": wind_speed.map(|wind| wind.metres_per_second),
                "wind_pulses": wind_speed.map(|wind| wind.pulses),
                "wind_direction_deg": wind_direction.map(|wind| wind.degrees),
                "wind_direction_raw": wind_direction.map(|wind| wind.raw),
                "wind_direction_compass": wind_direction.map(|wind| wind.compass.as_str()),
            }),
        }
    }

    pub fn plant(&self, summary: &PlantSummary) -> PublishRecord {
        PublishRecord {
            topic: self.topic(Group::Plant),
            payload: json!({
                "sensor_name": self.node_name,
                "timestamp": timestamp(summary.timestamp),
                "version": self.version,
                "moisture_pct": summary.moisture_pct,
                "blue": summary.blue,
                "lux": summary.lux,
                "samples": summary.samples,
            }),
        }
    }

    /// Host health alongside the latest ambient and soil temperatures.
    pub fn system(
        &self,
        snapshot: &TickSnapshot,
        host: &HostReport,
        queue_depth: usize,
    ) -> PublishRecord {
        PublishRecord {
            topic: self.status_topic(StatusChannel::System),
            payload: json!({
                "sensor_name": self.node_name,
                "timestamp": timestamp(snapshot.timestamp),
                "version": self.version,
                "hostname": host.hostname,
                "cpu_temp_c": host.cpu_temp_c,
                "cpu_temp_warning": host.cpu_warning().map(|warning| warning.as_str()),
                "env_temp_c": snapshot.temperature_c,
                "soil_temp_c": snapshot.soil_temperature_c,
                "mem": host.memory.map(|mem| json!({
                    "total_kb": mem.total_kb,
                    "free_kb": mem.free_kb,
                })),
                "disk": host.disk.map(|disk| json!({
                    "total_bytes": disk.total_bytes,
                    "free_bytes": disk.free_bytes,
                })),
                "uptime_sec": host.uptime_secs,
                "loadavg": host.load.map(|load| json!({
                    "1min": load.one,
                    "5min": load.five,
                    "15min": load.fifteen,
                })),
                "system_health": host.health(),
                "queued_records": queue_depth,
            }),
        }
    }

    pub fn error(&self, event: &ErrorEvent) -> PublishRecord {
        PublishRecord {
            topic: self.status_topic(StatusChannel::Errors),
            payload: json!({
                "sensor_name": self.node_name,
                "timestamp": timestamp(event.timestamp),
                "version": self.version,
                "error": event.message,
            }),
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{LoadAverage, MemoryUsage};
    use crate::store::DiskUsage;
    use crate::validate::PressureValue;

    #[test]
    fn groups_are_emitted_with_null_fields() {
        let builder = RecordBuilder::new("sensors/", "orchard-1", "1.2.0");
        let mut snapshot = TickSnapshot::new(Utc::now());
        snapshot.pressure = Some(PressureValue {
            volts: 2.5,
            psi: 50.0,
            kpa: 344.738,
        });

        let sets = builder.sets(&snapshot);
        assert_eq!(sets.topic, "sensors/sets");
        assert_eq!(sets.payload["sensor_name"], "orchard-1");
        assert_eq!(sets.payload["version"], "1.2.0");
        assert!(sets.payload["flow_lpm"].is_null());
        assert_eq!(sets.payload["pressure_psi"], 50.0);

        let environment = builder.environment(&snapshot);
        assert_eq!(environment.topic, "sensors/environment");
        assert!(environment.payload["temperature_c"].is_null());
        assert!(environment.payload["wind_direction_compass"].is_null());

        let plant = builder.plant(&PlantSummary::default());
        assert_eq!(plant.topic, "sensors/plant");
        assert!(plant.payload["moisture_pct"].is_null());
        assert_eq!(plant.payload["samples"], 0);
    }

    #[test]
    fn system_record_flags_hot_cpu_and_carries_host_fields() {
        let builder = RecordBuilder::new("sensors", "orchard-1", "1.2.0").with_status_prefix("status/");
        let mut snapshot = TickSnapshot::new(Utc::now());
        snapshot.temperature_c = Some(18.5);
        snapshot.soil_temperature_c = Some(12.25);
        let host = HostReport {
            hostname: Some("orchard-pi".to_string()),
            cpu_temp_c: Some(64.0),
            memory: Some(MemoryUsage {
                total_kb: 4000,
                free_kb: 1000,
            }),
            disk: Some(DiskUsage {
                total_bytes: 8_000,
                free_bytes: 3_000,
            }),
            uptime_secs: Some(120.5),
            load: Some(LoadAverage {
                one: 0.5,
                five: 0.25,
                fifteen: 0.125,
            }),
        };

        let record = builder.system(&snapshot, &host, 7);
        assert_eq!(record.topic, "status/system");
        let payload = &record.payload;
        assert_eq!(payload["hostname"], "orchard-pi");
        assert_eq!(payload["cpu_temp_warning"], "ELEVATED_TEMP");
        assert_eq!(payload["system_health"], "ELEVATED_TEMP");
        assert_eq!(payload["env_temp_c"], 18.5);
        assert_eq!(payload["soil_temp_c"], 12.25);
        assert_eq!(payload["mem"]["free_kb"], 1000);
        assert_eq!(payload["disk"]["total_bytes"], 8_000);
        assert_eq!(payload["loadavg"]["15min"], 0.125);
        assert_eq!(payload["uptime_sec"], 120.5);
        assert_eq!(payload["queued_records"], 7);

        let bare = builder.system(&TickSnapshot::new(Utc::now()), &HostReport::default(), 0);
        assert!(bare.payload["cpu_temp_warning"].is_null());
        assert!(bare.payload["mem"].is_null());
        assert_eq!(bare.payload["system_health"], "OK");
    }

    #[test]
    fn error_record_goes_to_the_errors_channel() {
        let builder = RecordBuilder::new("sensors", "orchard-1", "1.2.0");
        let at = Utc::now();
        let record = builder.error(&ErrorEvent {
            timestamp: at,
            message: "validation failed: pressure value 9".to_string(),
        });
        assert_eq!(record.topic, "status/errors");
        assert_eq!(record.payload["error"], "validation failed: pressure value 9");
        assert_eq!(record.payload["sensor_name"], "orchard-1");
        assert_eq!(record.payload["timestamp"], timestamp(at));
    }
}
