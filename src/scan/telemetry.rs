//! Raw telemetry accumulation.
//!
//! A scan streams its raw samples as chunks of parallel arrays: every chunk
//! carries the same field names, and within a chunk every field has the
//! same number of samples. Appending is atomic across fields, so the
//! parallel-length invariant holds at every observable point.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// One decoded telemetry chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryChunk {
    fields: BTreeMap<String, Vec<f64>>,
    len: usize,
}

impl TelemetryChunk {
    /// Decode a chunk from its wire value: an object mapping field names to
    /// equally sized arrays of numbers.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::protocol("telemetry chunk is not an object"))?;
        if obj.is_empty() {
            return Err(Error::protocol("telemetry chunk has no fields"));
        }

        let mut fields = BTreeMap::new();
        let mut len: Option<usize> = None;

        for (name, samples) in obj {
            let arr = samples.as_array().ok_or_else(|| {
                Error::protocol(format!("telemetry field '{name}' is not an array"))
            })?;
            let mut decoded = Vec::with_capacity(arr.len());
            for v in arr {
                let f = v.as_f64().ok_or_else(|| {
                    Error::protocol(format!("telemetry field '{name}' has a non-numeric sample"))
                })?;
                decoded.push(f);
            }

            match len {
                None => len = Some(decoded.len()),
                Some(expected) if expected != decoded.len() => {
                    return Err(Error::protocol(format!(
                        "telemetry field '{name}' has {} samples, expected {expected}",
                        decoded.len()
                    )));
                }
                Some(_) => {}
            }

            fields.insert(name.clone(), decoded);
        }

        Ok(Self {
            fields,
            len: len.unwrap_or(0),
        })
    }

    /// Samples per field in this chunk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the chunk carries no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Append-only store of parallel sample fields.
///
/// The first appended chunk fixes the field set; every later chunk must
/// carry exactly the same fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTelemetry {
    fields: BTreeMap<String, Vec<f64>>,
    len: usize,
}

impl RawTelemetry {
    /// Append one chunk across all fields simultaneously.
    pub fn append(&mut self, chunk: TelemetryChunk) -> Result<()> {
        if self.fields.is_empty() && self.len == 0 {
            self.len = chunk.len;
            self.fields = chunk.fields;
            return Ok(());
        }

        let ours: Vec<&String> = self.fields.keys().collect();
        let theirs: Vec<&String> = chunk.fields.keys().collect();
        if ours != theirs {
            return Err(Error::protocol(
                "telemetry chunk field set does not match earlier chunks",
            ));
        }

        for (name, mut samples) in chunk.fields {
            self.fields
                .get_mut(&name)
                .expect("field checked above")
                .append(&mut samples);
        }
        self.len += chunk.len;
        Ok(())
    }

    /// Total samples accumulated per field.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether anything has been accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The samples of one field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&[f64]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Field names, sorted.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn append_keeps_fields_parallel() {
        let mut t = RawTelemetry::default();
        t.append(TelemetryChunk::from_value(&json!({"x": [1, 2], "y": [3, 4]})).unwrap())
            .unwrap();
        t.append(TelemetryChunk::from_value(&json!({"x": [5], "y": [6]})).unwrap())
            .unwrap();

        assert_eq!(t.len(), 3);
        assert_eq!(t.field("x"), Some([1.0, 2.0, 5.0].as_slice()));
        assert_eq!(t.field("y"), Some([3.0, 4.0, 6.0].as_slice()));
    }

    #[test]
    fn ragged_chunk_is_rejected() {
        let err = TelemetryChunk::from_value(&json!({"x": [1, 2], "y": [3]})).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
    }

    #[test]
    fn mismatched_field_set_is_rejected() {
        let mut t = RawTelemetry::default();
        t.append(TelemetryChunk::from_value(&json!({"x": [1]})).unwrap())
            .unwrap();
        let err = t
            .append(TelemetryChunk::from_value(&json!({"z": [1]})).unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);

        // A failed append leaves the store untouched.
        assert_eq!(t.len(), 1);
        assert!(t.field("z").is_none());
    }
}
