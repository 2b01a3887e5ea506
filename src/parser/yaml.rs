use super::types::TestFlow;
use crate::error::FlowError;
use serde::Deserialize;
use serde_yaml::Value;

/// Parse a flow document into a `TestFlow`.
///
/// Tolerates two layouts: a single mapping document, or two documents where
/// the first holds the base fields and the second is either a sequence
/// (assigned to `steps`) or a mapping (shallow-merged over the first). Any
/// other shape is a load error.
pub fn load_flow(text: &str) -> Result<TestFlow, FlowError> {
    if text.trim().is_empty() {
        return Err(FlowError::Load("empty flow document".to_string()));
    }

    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(de)
            .map_err(|e| FlowError::Load(format!("invalid YAML: {}", e)))?;
        if !value.is_null() {
            docs.push(value);
        }
    }

    let flow = match docs.len() {
        0 => return Err(FlowError::Load("empty flow document".to_string())),
        1 => flow_from_mapping(docs.pop().unwrap())?,
        2 => {
            let second = docs.pop().unwrap();
            let first = docs.pop().unwrap();
            match second {
                Value::Sequence(steps) => {
                    let mut flow = flow_from_mapping(first)?;
                    flow.steps = serde_yaml::from_value(Value::Sequence(steps))
                        .map_err(|e| FlowError::Load(format!("invalid step list: {}", e)))?;
                    flow
                }
                Value::Mapping(overlay) => {
                    let Value::Mapping(mut base) = first else {
                        return Err(FlowError::Load(
                            "first document must be a mapping".to_string(),
                        ));
                    };
                    for (k, v) in overlay {
                        base.insert(k, v);
                    }
                    flow_from_mapping(Value::Mapping(base))?
                }
                _ => {
                    return Err(FlowError::Load(
                        "second document must be a sequence of steps or a mapping".to_string(),
                    ))
                }
            }
        }
        n => {
            return Err(FlowError::Load(format!(
                "expected one or two YAML documents, found {}",
                n
            )))
        }
    };

    for step in flow.flattened_steps() {
        step.validate().map_err(FlowError::Load)?;
    }

    Ok(flow)
}

fn flow_from_mapping(value: Value) -> Result<TestFlow, FlowError> {
    if !value.is_mapping() {
        return Err(FlowError::Load(
            "flow document must be a mapping".to_string(),
        ));
    }
    serde_yaml::from_value(value).map_err(|e| FlowError::Load(format!("invalid flow: {}", e)))
}
