//! Portable encoding of node arguments and results.
//!
//! Backends that cross a process or network boundary exchange JSON
//! bytes. Opaque values fail to encode rather than being dropped.

use serde_json::{Map, Value};
use trellis_core::{NodeValue, SerializationError};
use trellis_plan::NodeInputs;

/// Encode bound inputs as a JSON object
///
/// # Errors
///
/// Returns error if any input is an opaque value
pub fn encode_inputs(inputs: &NodeInputs) -> Result<Vec<u8>, SerializationError> {
    let mut object = Map::new();
    for (name, value) in inputs.iter() {
        let data = value.as_data().ok_or_else(|| {
            SerializationError::new(
                value.type_label(),
                format!("input '{}' cannot cross an executor boundary", name),
            )
        })?;
        object.insert(name.clone(), data.clone());
    }
    Ok(serde_json::to_vec(&Value::Object(object))?)
}

/// Decode inputs encoded by [`encode_inputs`]
///
/// # Errors
///
/// Returns error if the payload is not a JSON object
pub fn decode_inputs(bytes: &[u8]) -> Result<NodeInputs, SerializationError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(object) => Ok(object
            .into_iter()
            .map(|(name, value)| (name, NodeValue::Data(value)))
            .collect()),
        other => Err(SerializationError::new(
            "payload",
            format!("expected an object of inputs, got {}", NodeValue::Data(other).type_label()),
        )),
    }
}

/// Encode a node result
///
/// # Errors
///
/// Returns error if the value is opaque
pub fn encode_output(value: &NodeValue) -> Result<Vec<u8>, SerializationError> {
    value.to_bytes()
}

/// Decode a node result
///
/// # Errors
///
/// Returns error if the payload is not valid JSON
pub fn decode_output(bytes: &[u8]) -> Result<NodeValue, SerializationError> {
    NodeValue::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inputs_cross_boundary() {
        let mut inputs = NodeInputs::new();
        inputs.insert("rows", NodeValue::data(json!([1, 2])));
        inputs.insert("region", NodeValue::from("eu"));

        let decoded = decode_inputs(&encode_inputs(&inputs).unwrap()).unwrap();
        assert_eq!(decoded.data("rows").unwrap(), &json!([1, 2]));
        assert_eq!(decoded.data("region").unwrap(), &json!("eu"));
    }

    #[test]
    fn test_opaque_input_fails_with_name() {
        let mut inputs = NodeInputs::new();
        inputs.insert("conn", NodeValue::opaque(String::from("socket")));
        let err = encode_inputs(&inputs).unwrap_err();
        assert!(err.reason.contains("conn"));
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(decode_inputs(b"[1, 2]").is_err());
        assert!(decode_inputs(b"not json").is_err());
    }
}
