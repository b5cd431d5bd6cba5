use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub(crate) fn serialize_duration_option_as_int_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) if duration.as_millis() > i32::MAX as u128 => {
            serializer.serialize_i64(duration.as_millis() as i64)
        }
        Some(duration) => serializer.serialize_i32(duration.as_millis() as i32),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_duration_option_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

pub(crate) fn serialize_duration_option_as_int_secs<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) if duration.as_secs() > i32::MAX as u64 => {
            serializer.serialize_i64(duration.as_secs() as i64)
        }
        Some(duration) => serializer.serialize_i32(duration.as_secs() as i32),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_duration_option_from_u64_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = Option::<u64>::deserialize(deserializer)?;
    Ok(secs.map(Duration::from_secs))
}

pub(crate) fn serialize_u32_as_i32<S: Serializer>(
    val: &u32,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match i32::try_from(*val) {
        Ok(val) => serializer.serialize_i32(val),
        Err(_) => Err(serde::ser::Error::custom("u32 specified does not fit into an i32")),
    }
}

/// Serializes a `Result<T, Error>` as either the value or the error's string form. Used to
/// surface monitor errors in serialized server descriptions.
pub(crate) fn serialize_result_error_as_string<S: Serializer, T: serde::Serialize>(
    val: &crate::error::Result<T>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Ok(val) => val.serialize(serializer),
        Err(e) => serializer.serialize_str(&e.to_string()),
    }
}
