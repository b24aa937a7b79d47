use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

pub fn datetime_to_filename(dt: DateTime<Utc>) -> String {
    // Example: 2023-03-15T123456Z
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
        .replace(':', "")
}

pub fn parse_rgb(rgb_str: &str) -> Result<[u8; 3], String> {
    let trimmed = rgb_str
        .trim()
        .trim_start_matches("rgb(")
        .trim_end_matches(')');

    let parts: Vec<&str> = trimmed.split(',').collect();

    if parts.len() != 3 {
        return Err(format!("Invalid RGB format: {rgb_str}"));
    }

    let channel = |part: &str, name: &str| {
        part.trim()
            .parse::<u8>()
            .map_err(|_| format!("Invalid {name} value in {rgb_str}"))
    };

    Ok([
        channel(parts[0], "red")?,
        channel(parts[1], "green")?,
        channel(parts[2], "blue")?,
    ])
}

pub fn serialize_dt<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if let Some(dt) = dt {
        dt.format("%m/%d/%Y %H:%M")
            .to_string()
            .serialize(serializer)
    } else {
        serializer.serialize_none()
    }
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
