//! Import of remote feature payloads into an in-memory store.
//!
//! The wire shape is a JSON array of `{"id", "geom", "fields"}` items:
//! `geom` is WKT (optional), `fields` maps attribute names to values.
//! Date-typed attributes arrive as calendar objects (`{"year", "month",
//! "day"}`, optionally with `"hour"`, `"minute"`, `"second"`).
//!
//! A payload that fails to parse as a whole is an error; an individual
//! malformed item is logged and skipped so one bad feature cannot sink
//! the dataset.

use super::resource::ResourceService;
use crate::feature::{FeatureRecord, FieldValue};
use crate::geometry::Geometry;
use crate::reconcile::RemoteError;
use crate::store::MemoryStore;
use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;
use tracing::{debug, warn};

/// Counts of one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: usize,
    pub skipped: usize,
}

/// Parse a feature payload and seed every well-formed feature into the
/// store under its remote identifier.
pub fn import_features(payload: &str, store: &MemoryStore) -> Result<ImportStats, RemoteError> {
    let items: Vec<Value> =
        serde_json::from_str(payload).map_err(|e| RemoteError::Payload(e.to_string()))?;

    let mut stats = ImportStats::default();
    for item in &items {
        match parse_feature(item) {
            Some(record) => {
                store.seed(record);
                stats.imported += 1;
            }
            None => {
                warn!(item = %item, "skipping malformed feature entry");
                stats.skipped += 1;
            }
        }
    }
    debug!(
        imported = stats.imported,
        skipped = stats.skipped,
        "feature payload imported"
    );
    Ok(stats)
}

/// Fetch a vector resource's features and import them.
pub async fn load_remote_features(
    service: &dyn ResourceService,
    resource_id: i64,
    store: &MemoryStore,
) -> Result<ImportStats, RemoteError> {
    let payload = service.fetch_features(resource_id).await?;
    import_features(&payload, store)
}

fn parse_feature(item: &Value) -> Option<FeatureRecord> {
    let id = item.get("id")?.as_i64()?;
    let mut record = FeatureRecord::new(id);

    match item.get("geom") {
        Some(Value::String(wkt)) => {
            // A geometry that claims to exist but cannot be read makes the
            // whole item malformed.
            record = record.with_geometry(Geometry::from_wkt(wkt)?);
        }
        Some(Value::Null) | None => {}
        Some(_) => return None,
    }

    if let Some(fields) = item.get("fields") {
        let map = fields.as_object()?;
        for value in map.values() {
            record = record.with_field(field_value(value));
        }
    }
    Some(record)
}

fn field_value(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Int(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                FieldValue::Int(i)
            } else {
                FieldValue::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => FieldValue::Str(s.clone()),
        Value::Object(map) => calendar_value(map).unwrap_or(FieldValue::Null),
        Value::Array(items) => list_value(items),
    }
}

/// Calendar objects: date, time, or datetime depending on which keys are
/// present. Out-of-range components degrade to `Null`.
fn calendar_value(map: &serde_json::Map<String, Value>) -> Option<FieldValue> {
    let part = |key: &str| map.get(key).and_then(Value::as_i64);
    let date = match (part("year"), part("month"), part("day")) {
        (Some(y), Some(m), Some(d)) => {
            Some(NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)?)
        }
        _ => None,
    };
    let time = match (part("hour"), part("minute")) {
        (Some(h), Some(min)) => {
            let s = part("second").unwrap_or(0);
            Some(NaiveTime::from_hms_opt(h as u32, min as u32, s as u32)?)
        }
        _ => None,
    };
    match (date, time) {
        (Some(date), Some(time)) => Some(FieldValue::DateTime(date.and_time(time))),
        (Some(date), None) => Some(FieldValue::Date(date)),
        (None, Some(time)) => Some(FieldValue::Time(time)),
        (None, None) => None,
    }
}

fn list_value(items: &[Value]) -> FieldValue {
    if items.iter().all(|v| v.as_i64().is_some()) {
        FieldValue::IntList(items.iter().filter_map(Value::as_i64).collect())
    } else if items.iter().all(|v| v.as_f64().is_some()) {
        FieldValue::RealList(items.iter().filter_map(Value::as_f64).collect())
    } else if items.iter().all(|v| v.as_str().is_some()) {
        FieldValue::StrList(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    } else {
        FieldValue::Null
    }
}
