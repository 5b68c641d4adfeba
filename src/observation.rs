use crate::{AtmoError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One station's weather record: an opaque mapping of field name to value
/// with a single mandatory field, `id`.
///
/// Fields other than `id` are carried verbatim and never interpreted, so a
/// publisher can add or drop fields without any schema change here. Values
/// are JSON strings or numbers in practice, but any JSON value round-trips.
///
/// # Example
/// ```rust
/// use atmo::Observation;
///
/// let obs = Observation::from_json(r#"{"id":"IDS60901","air_temp":13.3}"#).unwrap();
/// assert_eq!(obs.station_id(), Some("IDS60901"));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Observation(BTreeMap<String, Value>);

impl Observation {
    /// creates a record with no fields; callers build it up with
    /// [`insert`](Self::insert)
    pub fn new() -> Self {
        Observation(BTreeMap::new())
    }

    /// parses `text` as a single JSON object.
    ///
    /// # Errors
    /// returns [`AtmoError::Serialization`] if the text is not valid JSON, or
    /// [`AtmoError::Parsing`] if it is valid JSON but not an object. Both are
    /// the "parse failure" class the server answers with 500.
    pub fn from_json(text: &str) -> Result<Observation> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Object(map) => Ok(Observation(map.into_iter().collect())),
            other => Err(AtmoError::Parsing(format!(
                "expected a JSON object, got: {}",
                other
            ))),
        }
    }

    /// serializes the record as a compact JSON object
    pub fn to_json(&self) -> String {
        // a map of plain keys and Values cannot fail to serialize
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// returns the station id iff the record carries a non-empty string `id`
    pub fn station_id(&self) -> Option<&str> {
        match self.0.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    /// returns the value of the given field, if present
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// inserts a field, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    /// iterates over the fields in stable (sorted) order
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// number of fields in the record
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// true when the record has no fields at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Observation {
    fn default() -> Self {
        Self::new()
    }
}
