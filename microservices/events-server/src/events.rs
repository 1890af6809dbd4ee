//! Stream line to stored record

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use events_core::{Event, Result};
use events_storage::Record;

/// Decode one stream line and wrap the raw bytes for storage.
///
/// The payload is stored verbatim; only `eventCreatedOn` is interpreted.
pub fn encode_record(line: &str) -> Result<Record> {
    let event = Event::decode(line)?;
    Ok(Record {
        event_base64: STANDARD.encode(line.as_bytes()),
        event_created_on: event.event_created_on,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_record() {
        let line = r#"{"type":"ref-updated","eventCreatedOn":1672567200}"#;
        let record = encode_record(line).unwrap();
        assert_eq!(record.event_created_on, 1672567200);

        let raw = STANDARD.decode(&record.event_base64).unwrap();
        assert_eq!(raw, line.as_bytes());
    }

    #[test]
    fn test_untimed_event_is_kept() {
        let line = r#"{"type":"ref-replicated","project":"x"}"#;
        let record = encode_record(line).unwrap();
        assert_eq!(record.event_created_on, 0);
        assert_eq!(STANDARD.decode(&record.event_base64).unwrap(), line.as_bytes());
    }

    #[test]
    fn test_rejects_non_event() {
        assert!(encode_record("not json").is_err());
        assert!(encode_record(r#"{"type":"#).is_err());
    }
}
