//! Strict JSON-schema derivation for structured model output.
//!
//! Schemas are generated from Rust types with `schemars` and tightened for
//! strict mode: providers reject object schemas that permit additional
//! properties.

use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;

/// Types the model can be asked to produce.
///
/// Blanket-implemented for anything deriving `JsonSchema + Deserialize`.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    /// Strict-mode JSON schema for this type.
    fn output_schema() -> serde_json::Value {
        let schema = schema_for!(Self);
        let mut value = serde_json::to_value(schema).unwrap_or_default();
        deny_additional_properties(&mut value);
        value
    }

    /// Name the schema is registered under in the request.
    fn schema_name() -> String {
        <Self as JsonSchema>::schema_name()
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

/// Recursively set `additionalProperties: false` on every object schema.
fn deny_additional_properties(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            if map.get("type") == Some(&serde_json::Value::String("object".to_string())) {
                map.insert(
                    "additionalProperties".to_string(),
                    serde_json::Value::Bool(false),
                );
            }
            for (_, v) in map.iter_mut() {
                deny_additional_properties(v);
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr.iter_mut() {
                deny_additional_properties(item);
            }
        }
        _ => {}
    }
}
