//! Request tag keys and typed accessors.
//!
//! Tags ride the `ExecRequest.tags` map. The dispatcher stamps the
//! host-owned keys at admission; callers may pre-set the caller-owned
//! keys. Workers treat all of them as opaque strings except where the UDF
//! glue reads the severity floor.
//!
//! The key strings are wire contract and never change spelling.

use std::collections::HashMap;
use std::time::Duration;

/// Stamped by the dispatcher at admission; opaque to the UDF.
pub const REQUEST_UUID: &str = "roma.request_uuid";

/// Caller-supplied correlation id, passed through untouched.
pub const REQUEST_ID: &str = "roma.request_id";

/// Integer severity floor for log egress; see [`Severity`].
pub const MIN_LOG_LEVEL: &str = "roma.min_log_level";

/// Optional duration string overriding the default execute deadline.
pub const TIMEOUT: &str = "roma.timeout";

/// `bytes` disables JSON stringification of the output; default is JSON.
pub const INPUT_TYPE: &str = "roma.input_type";

/// Value of [`INPUT_TYPE`] that requests raw byte output.
pub const INPUT_TYPE_BYTES: &str = "bytes";

/// Log severity carried as an integer in [`MIN_LOG_LEVEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Severity {
    /// Parses the integer wire form.
    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            _ => None,
        }
    }

    /// Integer wire form.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        self as u8
    }
}

/// Errors from reading typed tag values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    /// [`TIMEOUT`] was present but not a parsable duration.
    #[error("tag {TIMEOUT}={0:?} is not a duration")]
    Timeout(String),

    /// [`MIN_LOG_LEVEL`] was present but not a known severity integer.
    #[error("tag {MIN_LOG_LEVEL}={0:?} is not a severity")]
    Severity(String),
}

/// Stamps the host-owned keys into a tag map at admission.
pub fn stamp(tags: &mut HashMap<String, String>, uuid: &str, min_log_level: Severity) {
    tags.insert(REQUEST_UUID.to_owned(), uuid.to_owned());
    tags.insert(
        MIN_LOG_LEVEL.to_owned(),
        min_log_level.to_wire().to_string(),
    );
}

/// Reads the deadline override, falling back to `default`.
///
/// # Errors
///
/// Returns [`TagError::Timeout`] when the tag is present but malformed.
pub fn timeout(tags: &HashMap<String, String>, default: Duration) -> Result<Duration, TagError> {
    match tags.get(TIMEOUT) {
        None => Ok(default),
        Some(text) => humantime::parse_duration(text).map_err(|_| TagError::Timeout(text.clone())),
    }
}

/// Reads the severity floor, if stamped.
///
/// # Errors
///
/// Returns [`TagError::Severity`] when the tag is present but malformed.
pub fn min_log_level(tags: &HashMap<String, String>) -> Result<Option<Severity>, TagError> {
    match tags.get(MIN_LOG_LEVEL) {
        None => Ok(None),
        Some(text) => text
            .parse::<u8>()
            .ok()
            .and_then(Severity::from_wire)
            .map(Some)
            .ok_or_else(|| TagError::Severity(text.clone())),
    }
}

/// True when the caller asked for raw byte output.
#[must_use]
pub fn wants_raw_output(tags: &HashMap<String, String>) -> bool {
    tags.get(INPUT_TYPE).map(String::as_str) == Some(INPUT_TYPE_BYTES)
}
