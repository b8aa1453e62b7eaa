use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::HintTransportError;

/// Request payload sent to the remote collector.
///
/// Exactly one of the two record kinds per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Query {
    SampleBatches(SampleBatchesPayload),
    Stream(StreamPayload),
}

impl Query {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HintTransportError> {
        serde_json::to_vec(self).map_err(HintTransportError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HintTransportError> {
        serde_json::from_slice(data).map_err(HintTransportError::Deserialization)
    }
}

/// One discrete value of a batch. `subpart` is absent for single-valued parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpart: Option<String>,
    pub value: f64,
}

/// Values read from one sensor at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatchPayload {
    pub timestamp: DateTime<Utc>,
    /// Sensor path without subpart.
    #[serde(rename = "path")]
    pub bare_path: String,
    pub samples: Vec<NumericSample>,
}

/// Batches grouped under the sending module's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatchesPayload {
    pub module: String,
    pub batches: Vec<SampleBatchPayload>,
}

impl SampleBatchesPayload {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            batches: Vec::new(),
        }
    }
}

/// A block of high-rate samples, compressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPayload {
    pub path: String,
    pub t0: DateTime<Utc>,
    pub seq0: u64,
    /// Sample period in whole microseconds.
    pub period: i64,
    pub range: f64,
    /// Sample type tag; `"h"` is signed 16 bit.
    #[serde(rename = "type")]
    pub sample_type: String,
    /// bzip2 of the little-endian sample array.
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

mod base64_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn stream_data_is_base64_text() {
        let query = Query::Stream(StreamPayload {
            path: "lsm303d/hub/0/accel-x".into(),
            t0: t0(),
            seq0: 7,
            period: 2500,
            range: 2.0,
            sample_type: "h".into(),
            data: vec![0, 1, 2, 255],
        });
        let json: serde_json::Value = serde_json::from_slice(&query.to_bytes().unwrap()).unwrap();
        assert_eq!(json["stream"]["data"], "AAEC/w==");
        assert_eq!(json["stream"]["type"], "h");
        assert_eq!(json["stream"]["period"], 2500);
    }

    #[test]
    fn absent_subpart_is_omitted() {
        let mut payload = SampleBatchesPayload::new("hub");
        payload.batches.push(SampleBatchPayload {
            timestamp: t0(),
            bare_path: "ds18b20/hub/28-0001".into(),
            samples: vec![NumericSample {
                subpart: None,
                value: 293.5,
            }],
        });
        let bytes = Query::SampleBatches(payload.clone()).to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains("subpart"));
        assert!(text.contains("\"sample-batches\""));

        let back = Query::from_bytes(&bytes).unwrap();
        assert_eq!(back, Query::SampleBatches(payload));
    }

    #[test]
    fn non_finite_value_does_not_decode() {
        let mut payload = SampleBatchesPayload::new("hub");
        payload.batches.push(SampleBatchPayload {
            timestamp: t0(),
            bare_path: "ds18b20/hub/28-0001".into(),
            samples: vec![NumericSample {
                subpart: None,
                value: f64::NAN,
            }],
        });
        let bytes = Query::SampleBatches(payload).to_bytes().unwrap();
        assert!(String::from_utf8(bytes.clone()).unwrap().contains("\"value\":null"));
        assert!(matches!(Query::from_bytes(&bytes), Err(HintTransportError::Deserialization(_))));
    }

    #[test]
    fn rejects_corrupt_base64() {
        let text = r#"{"stream":{"path":"p","t0":"2024-05-01T12:00:00Z","seq0":0,
            "period":1,"range":1.0,"type":"h","data":"%%%"}}"#;
        let err = Query::from_bytes(text.as_bytes()).unwrap_err();
        assert!(matches!(err, HintTransportError::Deserialization(_)));
        assert!(err.to_string().starts_with("payload deserialization failed"));
    }
}
