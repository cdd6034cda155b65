//! Reversible object/record conversion for every polymorphic family.
//!
//! A serializer maps a strongly typed value to a JSON record and back. For
//! every supported value `o` the round trip `validate_value(to_value(o))`
//! yields an equal value, and on records produced by `to_value` the reverse
//! composition is the identity. Polymorphic families (auth schemes, call
//! templates, variable loaders, repositories, search strategies,
//! post-processors) pair one dispatcher serializer, which routes on the
//! family's discriminator key, with one serializer per concrete variant.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{UtcpError, UtcpResult};

pub trait Serializer<T>: Send + Sync {
    /// Produce the stable record representation of `obj`.
    fn to_value(&self, obj: &T) -> UtcpResult<Value>;

    /// Validate a record and produce the typed value, or fail with a
    /// precise serializer-validation error.
    fn validate_value(&self, value: &Value) -> UtcpResult<T>;

    /// Deep copy derived from the round trip.
    fn copy(&self, obj: &T) -> UtcpResult<T> {
        self.validate_value(&self.to_value(obj)?)
    }
}

/// Serde-backed serializer for plain (non-polymorphic) records such as
/// tools, manuals and the client configuration.
pub struct JsonSerializer<T> {
    type_name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub const fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            _marker: PhantomData,
        }
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn to_value(&self, obj: &T) -> UtcpResult<Value> {
        serde_json::to_value(obj).map_err(|err| UtcpError::validation(self.type_name, err))
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<T> {
        serde_json::from_value(value.clone())
            .map_err(|err| UtcpError::validation(self.type_name, err))
    }
}

/// Read a required string discriminator out of a polymorphic record.
pub(crate) fn discriminator<'a>(
    value: &'a Value,
    key: &str,
    type_name: &'static str,
) -> UtcpResult<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| UtcpError::validation(type_name, format!("missing '{key}' discriminator")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn round_trip_holds_for_plain_records() {
        let serializer = JsonSerializer::<Sample>::new("Sample");
        let sample = Sample {
            name: "echo".into(),
            count: 3,
        };
        let value = serializer.to_value(&sample).unwrap();
        assert_eq!(serializer.validate_value(&value).unwrap(), sample);
        assert_eq!(serializer.to_value(&serializer.validate_value(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn validation_failure_names_the_type() {
        let serializer = JsonSerializer::<Sample>::new("Sample");
        let err = serializer
            .validate_value(&serde_json::json!({"name": 1}))
            .unwrap_err();
        assert!(err.to_string().contains("Sample"));
        assert_eq!(err.code(), "UTCP_E001");
    }

    #[test]
    fn copy_is_a_deep_round_trip() {
        let serializer = JsonSerializer::<Sample>::new("Sample");
        let sample = Sample {
            name: "echo".into(),
            count: 3,
        };
        assert_eq!(serializer.copy(&sample).unwrap(), sample);
    }
}
