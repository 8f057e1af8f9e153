use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque identifier of a logical push stream (e.g. one building's occupancy feed)
pub type TopicKey = String;

/// Identifier of a single sensor
pub type SensorId = String;

/// Identifier of one `subscribe()` call
pub type SubscriptionId = u64;

/// Event type the SSE protocol assigns when a server omits the `event:` field
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// A single sensor update delivered over the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(alias = "sensorId")]
    pub sensor_id: SensorId,
    #[serde(alias = "value")]
    pub payload: serde_json::Value,
    /// Unparseable timestamps read as absent; they never reject the update
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(sensor_id: impl Into<SensorId>, payload: serde_json::Value) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            payload,
            timestamp: None,
        }
    }
}

/// Accepts RFC 3339, naive `YYYY-MM-DD HH:MM:SS` (read as UTC) and epoch milliseconds
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&raw))
}

fn parse_timestamp(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    match raw {
        serde_json::Value::Number(n) => {
            let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::<Utc>::from_timestamp_millis(ms)
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            s.parse::<i64>().ok().and_then(DateTime::<Utc>::from_timestamp_millis)
        }
        _ => None,
    }
}

/// Lifecycle and data events a push connection reports upstream
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The stream was (re)established
    Open,
    /// A dispatched server event
    Event {
        event_type: String,
        data: String,
        id: Option<String>,
    },
    /// A transport-level failure; the transport decides whether to reconnect
    Error(String),
}

impl TransportEvent {
    /// Convenience constructor for a default-typed event
    pub fn message(data: impl Into<String>) -> Self {
        TransportEvent::Event {
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            data: data.into(),
            id: None,
        }
    }
}

/// Measurement kind of a sensor; decides how its value is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// CO2 concentration in parts per million
    Co2,
    /// Air temperature in degrees Celsius
    Temperature,
    /// Relative humidity in percent
    Humidity,
    /// Space occupancy in percent of capacity
    Occupancy,
    /// Paired entry/exit people counter
    PeopleCount,
    /// Energy consumption reported in watt-hours
    Energy,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Co2 => "co2",
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Occupancy => "occupancy",
            SensorKind::PeopleCount => "people_count",
            SensorKind::Energy => "energy",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "co2" => Ok(SensorKind::Co2),
            "temperature" | "temp" => Ok(SensorKind::Temperature),
            "humidity" => Ok(SensorKind::Humidity),
            "occupancy" => Ok(SensorKind::Occupancy),
            "people_count" | "people" | "counter" => Ok(SensorKind::PeopleCount),
            "energy" => Ok(SensorKind::Energy),
            other => Err(format!("unknown sensor kind: {}", other)),
        }
    }
}

/// A sensor belonging to the currently displayed view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub id: SensorId,
    pub kind: SensorKind,
}

impl SensorDescriptor {
    pub fn new(id: impl Into<SensorId>, kind: SensorKind) -> Self {
        Self { id: id.into(), kind }
    }
}

/// Last known state of a sensor in the active view
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub id: SensorId,
    pub kind: SensorKind,
    pub last_value: Option<serde_json::Value>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl From<SensorDescriptor> for SensorRecord {
    fn from(descriptor: SensorDescriptor) -> Self {
        Self {
            id: descriptor.id,
            kind: descriptor.kind,
            last_value: None,
            last_timestamp: None,
        }
    }
}
