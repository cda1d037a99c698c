//! RFC 3339 timestamps, both as a serde `with` module and as plain scalar helpers for storage.

use serde::{Deserialize, Deserializer, Serializer};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::Result;

/// Deserialize an RFC 3339 formatted string into an OffsetDateTime
pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    OffsetDateTime::parse(&s, &Rfc3339).map_err(serde::de::Error::custom)
}

/// Serialize an OffsetDateTime into an RFC 3339 formatted string
pub fn serialize<S>(datetime: &OffsetDateTime, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = datetime
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&s)
}

/// Formats a timestamp as an RFC 3339 string.
pub fn format(datetime: OffsetDateTime) -> Result<String> {
    Ok(datetime.format(&Rfc3339)?)
}

/// Parses an RFC 3339 string into a timestamp.
pub fn parse(s: &str) -> Result<OffsetDateTime> {
    Ok(OffsetDateTime::parse(s.trim(), &Rfc3339)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn scalar_helpers() {
        let when = datetime!(2025-06-01 8:30:00 UTC);
        let text = format(when).unwrap();
        assert_eq!(text, "2025-06-01T08:30:00Z");
        assert_eq!(parse(&text).unwrap(), when);
        assert!(parse("yesterday").is_err());
    }
}
