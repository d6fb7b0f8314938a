//! Validation helpers shared by the configuration structs

use crate::error::{ConfigError, ConfigResult};
use std::fmt::Display;

/// Serde adapter that reads and writes a `Duration` as whole milliseconds.
///
/// ```rust
/// use mesh_components::config::millis;
/// use serde::Deserialize;
/// use std::time::Duration;
///
/// #[derive(Deserialize)]
/// struct Timeouts {
///     #[serde(with = "millis")]
///     connect: Duration,
/// }
///
/// let t: Timeouts = serde_json::from_str(r#"{"connect": 250}"#).unwrap();
/// assert_eq!(t.connect, Duration::from_millis(250));
/// ```
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `value` must lie in `[min, max]`.
pub fn validate_range<T: PartialOrd + Display>(field: &str, value: T, min: T, max: T) -> ConfigResult<()> {
    if value < min || value > max {
        Err(ConfigError::ConstraintViolation {
            field: field.to_string(),
            constraint: format!("between {min} and {max}"),
        })
    } else {
        Ok(())
    }
}

/// `value` must be strictly greater than its type's default (zero).
pub fn validate_positive<T: PartialOrd + Default>(field: &str, value: T) -> ConfigResult<()> {
    if value <= T::default() {
        Err(ConfigError::ConstraintViolation {
            field: field.to_string(),
            constraint: "positive".to_string(),
        })
    } else {
        Ok(())
    }
}

/// `low` must not exceed `high`.
pub fn validate_ordered<T: PartialOrd + std::fmt::Debug>(
    low_field: &str,
    low: T,
    high_field: &str,
    high: T,
) -> ConfigResult<()> {
    if low > high {
        Err(ConfigError::InvalidValue {
            field: low_field.to_string(),
            reason: format!("{low:?} exceeds {high_field} ({high:?})"),
        })
    } else {
        Ok(())
    }
}

pub fn validate_non_empty(field: &str, value: &str) -> ConfigResult<()> {
    if value.is_empty() {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: "cannot be empty".to_string(),
        })
    } else {
        Ok(())
    }
}
