use crate::{Error, Result, USER_ID_PREFIX};
use chrono::DateTime;

/// Parse an RFC 3339 timestamp into unix epoch milliseconds.
pub fn parse_timestamp_ms(timestamp_iso: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(timestamp_iso.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| Error::MalformedEvent(format!("bad timestamp {timestamp_iso:?}: {e}")))
}

/// Random local user id, e.g. `user_3f2a9c0b1d4e5f60`.
pub fn generate_user_id() -> String {
    let bytes: [u8; 8] = rand::random();
    format!("{}{}", USER_ID_PREFIX, hex::encode(bytes))
}

pub(crate) fn require_non_empty(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid(format!("{what} must not be empty")));
    }
    Ok(())
}
