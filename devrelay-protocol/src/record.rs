//! Device record model.

use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// One telemetry record sent by a device.
///
/// Decoding is lenient in the way device firmware expects:
/// - every field is optional and absent fields are zero
/// - a `null` field leaves the value untouched, as if it were absent
/// - keys match ignoring ASCII case (`"ID"` fills `id`)
/// - a repeated key overwrites the earlier value
/// - unknown keys are ignored
/// - a top-level `null` is an all-zero record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// Device-assigned sequence number or identity marker.
    pub id: i64,
    /// Opaque content relayed verbatim to the broker.
    #[serde(rename = "data")]
    pub payload: String,
    /// Epoch time as supplied by the sender.
    pub timestamp: i64,
    /// Owning user identifier.
    pub user_id: i64,
    /// Device identity marker.
    pub device_id: String,
}

impl DeviceRecord {
    /// Creates a record carrying the given payload, all other fields zeroed.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Returns the payload bytes that get published.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Encodes the record in its wire form (no trailing separator).
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

enum Field {
    Id,
    Payload,
    Timestamp,
    UserId,
    DeviceId,
}

impl Field {
    fn from_key(key: &str) -> Option<Self> {
        const FIELDS: [(&str, Field); 5] = [
            ("id", Field::Id),
            ("data", Field::Payload),
            ("timestamp", Field::Timestamp),
            ("user_id", Field::UserId),
            ("device_id", Field::DeviceId),
        ];
        FIELDS
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, field)| field)
    }
}

/// Overwrites `slot` unless the wire value is `null`.
fn assign<'de, A, T>(map: &mut A, slot: &mut T) -> Result<(), A::Error>
where
    A: MapAccess<'de>,
    T: Deserialize<'de>,
{
    if let Some(value) = map.next_value::<Option<T>>()? {
        *slot = value;
    }
    Ok(())
}

struct RecordVisitor;

impl<'de> Visitor<'de> for RecordVisitor {
    type Value = DeviceRecord;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a device record object")
    }

    fn visit_unit<E: de::Error>(self) -> Result<DeviceRecord, E> {
        Ok(DeviceRecord::default())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<DeviceRecord, A::Error> {
        let mut record = DeviceRecord::default();

        while let Some(key) = map.next_key::<String>()? {
            match Field::from_key(&key) {
                Some(Field::Id) => assign(&mut map, &mut record.id)?,
                Some(Field::Payload) => assign(&mut map, &mut record.payload)?,
                Some(Field::Timestamp) => assign(&mut map, &mut record.timestamp)?,
                Some(Field::UserId) => assign(&mut map, &mut record.user_id)?,
                Some(Field::DeviceId) => assign(&mut map, &mut record.device_id)?,
                None => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        Ok(record)
    }
}

impl<'de> Deserialize<'de> for DeviceRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RecordVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_record() {
        let json = r#"{"id":1,"data":"{\"t\":21.5}","timestamp":1700000000,"user_id":7,"device_id":"dev-A"}"#;
        let record: DeviceRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.id, 1);
        assert_eq!(record.payload, r#"{"t":21.5}"#);
        assert_eq!(record.timestamp, 1_700_000_000);
        assert_eq!(record.user_id, 7);
        assert_eq!(record.device_id, "dev-A");
    }

    #[test]
    fn test_missing_fields_are_zero() {
        let record: DeviceRecord = serde_json::from_str("{}").unwrap();
        assert_eq!(record, DeviceRecord::default());

        let record: DeviceRecord = serde_json::from_str(r#"{"data":"x"}"#).unwrap();
        assert_eq!(record.id, 0);
        assert_eq!(record.payload, "x");
        assert_eq!(record.device_id, "");
    }

    #[test]
    fn test_null_fields_are_zero() {
        let json = r#"{"id":null,"data":null,"timestamp":null,"user_id":null,"device_id":null}"#;
        let record: DeviceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record, DeviceRecord::default());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{"id":3,"firmware":"1.2.3","extra":{"nested":[1,2]}}"#;
        let record: DeviceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 3);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        assert!(serde_json::from_str::<DeviceRecord>(r#"{"id":"one"}"#).is_err());
        assert!(serde_json::from_str::<DeviceRecord>(r#"{"data":42}"#).is_err());
        assert!(serde_json::from_str::<DeviceRecord>(r#"{"timestamp":1.5}"#).is_err());
        assert!(serde_json::from_str::<DeviceRecord>(r#"[1,2,3]"#).is_err());
    }

    #[test]
    fn test_repeated_key_last_wins() {
        let record: DeviceRecord =
            serde_json::from_str(r#"{"id":1,"data":"a","data":"b","id":2}"#).unwrap();
        assert_eq!(record.id, 2);
        assert_eq!(record.payload, "b");

        // null never clears a value seen earlier
        let record: DeviceRecord = serde_json::from_str(r#"{"id":5,"id":null}"#).unwrap();
        assert_eq!(record.id, 5);
    }

    #[test]
    fn test_keys_match_ignoring_case() {
        let record: DeviceRecord =
            serde_json::from_str(r#"{"ID":5,"Data":"x","USER_ID":3,"Device_Id":"d"}"#).unwrap();
        assert_eq!(record.id, 5);
        assert_eq!(record.payload, "x");
        assert_eq!(record.user_id, 3);
        assert_eq!(record.device_id, "d");

        let record: DeviceRecord = serde_json::from_str(r#"{"id":1,"ID":2}"#).unwrap();
        assert_eq!(record.id, 2);
    }

    #[test]
    fn test_top_level_null_is_zero_record() {
        let record: DeviceRecord = serde_json::from_str("null").unwrap();
        assert_eq!(record, DeviceRecord::default());
    }

    #[test]
    fn test_non_object_values_rejected() {
        assert!(serde_json::from_str::<DeviceRecord>("42").is_err());
        assert!(serde_json::from_str::<DeviceRecord>(r#""text""#).is_err());
        assert!(serde_json::from_str::<DeviceRecord>("true").is_err());
    }

    #[test]
    fn test_wire_field_names() {
        let record = DeviceRecord::new("p")
            .with_id(9)
            .with_timestamp(10)
            .with_user_id(11)
            .with_device_id("d");
        let value: serde_json::Value = serde_json::from_slice(&record.to_json().unwrap()).unwrap();

        assert_eq!(value["data"], "p");
        assert_eq!(value["user_id"], 11);
        assert_eq!(value["device_id"], "d");
        assert!(value.get("payload").is_none());
    }
}
