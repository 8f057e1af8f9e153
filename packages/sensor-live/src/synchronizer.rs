use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::multiplexer::Handler;
use crate::traits::{ElementLookup, LiveError, LiveResult, SnapshotSink, TextElement};
use crate::types::{Message, SensorDescriptor, SensorId, SensorKind, SensorRecord};

/// Text rendered when a value cannot be formatted for its sensor kind
pub const PLACEHOLDER: &str = "--";

/// Prefix joined with a sensor id to form its element id
pub const DEFAULT_ELEMENT_PREFIX: &str = "sensor-value-";

/// Keeps the last value of every sensor in the active view and writes
/// formatted values straight into the rendered elements
pub struct SensorSynchronizer<L: ElementLookup> {
    records: HashMap<SensorId, SensorRecord>,
    lookup: L,
    element_id_prefix: String,
}

impl<L: ElementLookup> SensorSynchronizer<L> {
    pub fn new(lookup: L) -> Self {
        Self::with_prefix(lookup, DEFAULT_ELEMENT_PREFIX)
    }

    pub fn with_prefix(lookup: L, element_id_prefix: impl Into<String>) -> Self {
        Self {
            records: HashMap::new(),
            lookup,
            element_id_prefix: element_id_prefix.into(),
        }
    }

    /// Swap in the sensor set of a new view; previous records are discarded
    pub fn replace_sensors<I>(&mut self, sensors: I)
    where
        I: IntoIterator<Item = SensorDescriptor>,
    {
        self.records = sensors
            .into_iter()
            .map(|descriptor| (descriptor.id.clone(), SensorRecord::from(descriptor)))
            .collect();
        debug!("Sensor set replaced ({} sensors)", self.records.len());
    }

    /// Apply one value to a sensor of the active view
    ///
    /// Returns `false` without touching the view when the sensor is not part
    /// of the current set. A missing element is not an error.
    pub fn apply_update(&mut self, sensor_id: &str, value: Value, timestamp: DateTime<Utc>) -> bool {
        let Some(record) = self.records.get_mut(sensor_id) else {
            debug!("Ignoring update for sensor {} outside the current view", sensor_id);
            return false;
        };

        let text = format_value(record.kind, &value).unwrap_or_else(|| {
            warn!(
                "Cannot format value {} for {} sensor {}",
                value, record.kind, sensor_id
            );
            PLACEHOLDER.to_string()
        });
        record.last_value = Some(value);
        record.last_timestamp = Some(timestamp);

        let element_id = element_id(&self.element_id_prefix, sensor_id);
        match self.lookup.lookup_element_by_id(&element_id) {
            Some(mut element) => element.set_text(&text),
            None => debug!("Element {} not rendered, skipping", element_id),
        }

        true
    }

    /// Apply a push message; messages without a timestamp are stamped now
    pub fn apply_message(&mut self, message: &Message) -> bool {
        let timestamp = message.timestamp.unwrap_or_else(Utc::now);
        self.apply_update(&message.sensor_id, message.payload.clone(), timestamp)
    }

    /// Apply every reading of a snapshot, returning how many hit the view
    ///
    /// Accepts an array of readings or an object holding one under
    /// `sensors` or `readings`.
    pub fn apply_readings(&mut self, snapshot: &Value) -> LiveResult<usize> {
        let readings = match snapshot {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("sensors").or_else(|| map.get("readings")) {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(LiveError::Snapshot(
                        "snapshot object has no sensors array".to_string(),
                    ))
                }
            },
            other => {
                return Err(LiveError::Snapshot(format!(
                    "unexpected snapshot shape: {}",
                    json_kind(other)
                )))
            }
        };

        let mut applied = 0;
        for reading in readings {
            match serde_json::from_value::<Message>(reading.clone()) {
                Ok(message) => {
                    if self.apply_message(&message) {
                        applied += 1;
                    }
                }
                Err(e) => warn!("Skipping malformed snapshot reading: {}", e),
            }
        }
        Ok(applied)
    }

    pub fn record(&self, sensor_id: &str) -> Option<&SensorRecord> {
        self.records.get(sensor_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Element id under which a sensor's value is rendered
pub fn element_id(prefix: &str, sensor_id: &str) -> String {
    format!("{}{}", prefix, sensor_id)
}

/// Render a value the way its sensor kind is displayed
pub fn format_value(kind: SensorKind, value: &Value) -> Option<String> {
    match kind {
        SensorKind::Co2 => numeric(value).map(|v| format!("{:.0} ppm", v)),
        SensorKind::Temperature => numeric(value).map(|v| format!("{:.1} °C", v)),
        SensorKind::Humidity | SensorKind::Occupancy => numeric(value).map(|v| format!("{:.1} %", v)),
        SensorKind::PeopleCount => {
            let (entered, left) = counter_pair(value)?;
            Some(format!("{} in / {} out", entered, left))
        }
        SensorKind::Energy => {
            let wh = numeric(value)?;
            if wh.abs() >= 1_000_000.0 {
                Some(format!("{:.2} MWh", wh / 1_000_000.0))
            } else {
                Some(format!("{:.2} kWh", wh / 1_000.0))
            }
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn count(value: &Value) -> Option<i64> {
    numeric(value).map(|v| v.round() as i64)
}

fn counter_pair(value: &Value) -> Option<(i64, i64)> {
    match value {
        Value::Object(map) => {
            let entered = map.get("in").or_else(|| map.get("entries"))?;
            let left = map.get("out").or_else(|| map.get("exits"))?;
            Some((count(entered)?, count(left)?))
        }
        Value::Array(items) if items.len() == 2 => Some((count(&items[0])?, count(&items[1])?)),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A synchronizer shared between the push and poll channels
pub struct SharedSynchronizer<L: ElementLookup> {
    inner: Arc<Mutex<SensorSynchronizer<L>>>,
}

impl<L: ElementLookup> Clone for SharedSynchronizer<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: ElementLookup + 'static> SharedSynchronizer<L> {
    pub fn new(synchronizer: SensorSynchronizer<L>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(synchronizer)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SensorSynchronizer<L>> {
        self.inner.lock()
    }

    pub fn replace_sensors<I>(&self, sensors: I)
    where
        I: IntoIterator<Item = SensorDescriptor>,
    {
        self.inner.lock().replace_sensors(sensors);
    }

    pub fn apply_update(&self, sensor_id: &str, value: Value, timestamp: DateTime<Utc>) -> bool {
        self.inner.lock().apply_update(sensor_id, value, timestamp)
    }

    /// Multiplexer handler routing push messages into this synchronizer
    pub fn handler(&self) -> Handler {
        let inner = self.inner.clone();
        Arc::new(move |message: &Message| {
            inner.lock().apply_message(message);
            Ok(())
        })
    }
}

impl<L: ElementLookup + 'static> SnapshotSink for SharedSynchronizer<L> {
    fn apply_snapshot(&self, snapshot: Value) -> LiveResult<()> {
        let applied = self.inner.lock().apply_readings(&snapshot)?;
        debug!("Snapshot applied to {} sensors", applied);
        Ok(())
    }
}
