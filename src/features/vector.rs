//! Fixed-shape numeric feature records.

use serde::Serialize;

/// Field names of a traffic feature vector, in order.
pub const TRAFFIC_FIELDS: &[&str] = &["packet_size", "response_time"];

/// An ordered tuple of named numeric fields.
///
/// The field names travel with the values so the scaler and model can reject a
/// vector whose shape differs from the one they were fitted on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    #[serde(skip)]
    fields: &'static [&'static str],
    values: Vec<f64>,
}

impl FeatureVector {
    /// Build a vector over `fields`. Returns `None` when the lengths differ.
    pub fn new(fields: &'static [&'static str], values: Vec<f64>) -> Option<Self> {
        (fields.len() == values.len()).then_some(Self { fields, values })
    }

    /// A traffic vector over [`TRAFFIC_FIELDS`].
    pub fn traffic(packet_size: f64, response_time: f64) -> Self {
        Self {
            fields: TRAFFIC_FIELDS,
            values: vec![packet_size, response_time],
        }
    }

    pub fn fields(&self) -> &'static [&'static str] {
        self.fields
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of the named field, if present.
    pub fn get(&self, field: &str) -> Option<f64> {
        self.fields
            .iter()
            .position(|f| *f == field)
            .map(|i| self.values[i])
    }

    /// Same field set, same order.
    pub fn same_shape(&self, fields: &[&str]) -> bool {
        self.fields == fields
    }

    /// Copy of this vector carrying `values` in place of the current ones.
    pub(crate) fn with_values(&self, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), self.fields.len());
        Self {
            fields: self.fields,
            values,
        }
    }
}
