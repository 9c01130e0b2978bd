//! One-time upgrade of persisted cache records to the current layout.
//!
//! Version 1 records came straight from the directory API: feeds carried
//! their freshness fields in a nested `_meta` object, timestamps were epoch
//! milliseconds, ids were numbers and episodes lived under flat
//! `episode/<id>` keys. Version 2 is what the domain types serialize to.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::domain::{format_duration, keys};
use crate::store::Entries;

pub const SCHEMA_VERSION: u32 = 2;
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Rewrite every entry into the current schema. Entries already in the
/// current shape come out unchanged, so running it twice is harmless.
pub fn migrate(entries: &Entries) -> Entries {
    migrate_at(entries, Utc::now())
}

pub(crate) fn migrate_at(entries: &Entries, now: DateTime<Utc>) -> Entries {
    let mut out = Entries::new();

    for (key, value) in entries {
        let value = unwrap_json_string(value.clone());

        if key.starts_with(keys::FEED_PREFIX) {
            out.insert(key.clone(), migrate_feed(value, now));
        } else if key.starts_with(keys::EPISODE_PREFIX) {
            let episode = migrate_episode(value);
            let feed_id = episode.get("feedId").and_then(Value::as_str);
            let id = episode.get("id").and_then(Value::as_str);
            match (feed_id, id) {
                (Some(feed_id), Some(id)) => {
                    out.insert(keys::episode_index(id), Value::String(feed_id.to_string()));
                    out.insert(keys::episode(feed_id, id), episode);
                }
                _ => warn!(key = %key, "Dropping episode without feed or id"),
            }
        } else if key == keys::CURRENT_EPISODE_ID {
            out.insert(key.clone(), id_to_string(value));
        } else if !out.contains_key(key) {
            out.insert(key.clone(), value);
        }
    }

    out
}

fn unwrap_json_string(value: Value) -> Value {
    if let Value::String(s) = &value {
        if s.starts_with('{') {
            if let Ok(parsed) = serde_json::from_str(s) {
                return parsed;
            }
        }
    }
    value
}

fn id_to_string(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::String(n.to_string()),
        other => other,
    }
}

fn millis_to_rfc3339(ms: i64) -> Option<Value> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| Value::String(dt.to_rfc3339()))
}

/// Numbers are epoch milliseconds; anything else is left as is.
fn normalize_timestamp(map: &mut Map<String, Value>, field: &str) {
    if let Some(ms) = map.get(field).and_then(Value::as_f64) {
        match millis_to_rfc3339(ms as i64) {
            Some(value) => {
                map.insert(field.to_string(), value);
            }
            None => {
                map.remove(field);
            }
        }
    }
}

fn migrate_feed(value: Value, now: DateTime<Utc>) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };

    if let Some(Value::Object(meta)) = map.remove("_meta") {
        for (field, v) in meta {
            map.insert(field, v);
        }
    }
    if let Some(id) = map.remove("id") {
        map.insert("id".into(), id_to_string(id));
    }
    for field in ["lastUpdatedAt", "lastAccessedAt", "lastSubscribedAt"] {
        normalize_timestamp(&mut map, field);
    }
    for field in ["lastUpdatedAt", "lastAccessedAt"] {
        map.entry(field)
            .or_insert_with(|| Value::String(now.to_rfc3339()));
    }

    Value::Object(map)
}

fn migrate_episode(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };

    for field in ["id", "feedId"] {
        if let Some(id) = map.remove(field) {
            map.insert(field.into(), id_to_string(id));
        }
    }

    // The directory publishes seconds; older cache writes used milliseconds.
    if let Some(n) = map.get("datePublished").and_then(Value::as_f64) {
        let ms = if n < 1e11 { n * 1000.0 } else { n };
        if let Some(value) = millis_to_rfc3339(ms as i64) {
            map.insert("datePublished".into(), value);
        }
    }

    match map.get("lastPlayedAt").and_then(Value::as_f64) {
        Some(ms) if ms <= 0.0 => {
            map.insert("lastPlayedAt".into(), Value::Null);
        }
        Some(_) => normalize_timestamp(&mut map, "lastPlayedAt"),
        None => {}
    }

    if let Some(flag) = map.get("explicit").and_then(Value::as_u64) {
        map.insert("explicit".into(), Value::Bool(flag == 1));
    }

    if let Some(duration) = map.get("duration").and_then(Value::as_f64) {
        let secs = duration.max(0.0) as u64;
        map.insert("duration".into(), Value::from(secs));
        if !map.contains_key("durationFormatted") {
            map.insert(
                "durationFormatted".into(),
                Value::String(format_duration(secs)),
            );
        }
    }

    Value::Object(map)
}
