//! Argument checking against a [`ToolContract`].
//!
//! Validation is pure: it never talks to the engine. Node paths are
//! normalized and made absolute here; whether they exist is the adapter's
//! question.

use serde_json::{Map, Value};

use crate::addressing::EntityPath;
use crate::contract::{ArgSpec, ArgType, ToolContract};
use crate::error::BridgeError;

/// Check `args` against `contract` and return the normalized argument map.
///
/// Unknown keys are rejected, `null` counts as absent, defaults are filled
/// in and relative node paths are resolved against `cwd`.
pub fn validate(
    contract: &ToolContract,
    args: &Map<String, Value>,
    cwd: &EntityPath,
) -> Result<Map<String, Value>, BridgeError> {
    let mut input: Map<String, Value> = args
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for arg in contract.args {
        if let ArgType::Vector(components) = arg.ty {
            fold_components(arg, components, &mut input)?;
        }
    }

    if let Some(unknown) = input.keys().find(|k| contract.arg(k).is_none()) {
        return Err(BridgeError::InvalidArgument(format!(
            "{} does not take argument `{unknown}`",
            contract.name
        )));
    }

    let mut out = Map::new();
    for arg in contract.args {
        let value = match input.remove(arg.name) {
            Some(value) => value,
            None => match arg.default.to_value() {
                Some(default) => default,
                None if arg.required => {
                    return Err(BridgeError::InvalidArgument(format!(
                        "{} requires argument `{}`",
                        contract.name, arg.name
                    )));
                }
                None => continue,
            },
        };
        out.insert(arg.name.to_string(), check(arg, value, cwd)?);
    }
    Ok(out)
}

/// Merge `posx`/`pos_x` style component keys into one array under the base
/// name. An explicit base value wins over components.
fn fold_components(
    arg: &ArgSpec,
    components: &[&str],
    input: &mut Map<String, Value>,
) -> Result<(), BridgeError> {
    let mut found: Vec<Option<Value>> = Vec::with_capacity(components.len());
    let mut any = false;
    for component in components {
        let joined = format!("{}{component}", arg.name);
        let underscored = format!("{}_{component}", arg.name);
        let value = input.remove(&joined).or_else(|| input.remove(&underscored));
        any |= value.is_some();
        found.push(value);
    }
    if !any || input.contains_key(arg.name) {
        return Ok(());
    }

    let fallback = arg.default.to_value();
    let mut folded = Vec::with_capacity(components.len());
    for (i, (component, value)) in components.iter().zip(found).enumerate() {
        let value = value
            .or_else(|| fallback.as_ref().and_then(|d| d.get(i).cloned()))
            .ok_or_else(|| {
                BridgeError::InvalidArgument(format!(
                    "`{}` is missing component `{component}`",
                    arg.name
                ))
            })?;
        folded.push(value);
    }
    input.insert(arg.name.to_string(), Value::Array(folded));
    Ok(())
}

fn mismatch(arg: &ArgSpec, expected: &str, got: &Value) -> BridgeError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    BridgeError::InvalidArgument(format!("`{}` must be {expected}, got {got}", arg.name))
}

fn check(arg: &ArgSpec, value: Value, cwd: &EntityPath) -> Result<Value, BridgeError> {
    match arg.ty {
        ArgType::String => match value {
            Value::String(_) => Ok(value),
            other => Err(mismatch(arg, "a string", &other)),
        },
        ArgType::Number => match value {
            Value::Number(_) => Ok(value),
            other => Err(mismatch(arg, "a number", &other)),
        },
        ArgType::Integer => {
            let int = match &value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                _ => None,
            };
            int.map(Value::from)
                .ok_or_else(|| mismatch(arg, "an integer", &value))
        }
        ArgType::Bool => match value {
            Value::Bool(_) => Ok(value),
            other => Err(mismatch(arg, "a boolean", &other)),
        },
        ArgType::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => Ok(value),
            Some(s) => Err(BridgeError::InvalidArgument(format!(
                "`{}` must be one of {}, got `{s}`",
                arg.name,
                allowed.join(", ")
            ))),
            None => Err(mismatch(arg, "a string", &value)),
        },
        ArgType::NodePath => match value.as_str() {
            Some(raw) => Ok(Value::String(EntityPath::resolve(raw, cwd)?.as_str().to_string())),
            None => Err(mismatch(arg, "a node path", &value)),
        },
        ArgType::PrimPath => match value.as_str() {
            Some(raw) => Ok(Value::String(EntityPath::prim(raw)?.as_str().to_string())),
            None => Err(mismatch(arg, "a prim path", &value)),
        },
        ArgType::Object => match value {
            Value::Object(_) => Ok(value),
            other => Err(mismatch(arg, "an object", &other)),
        },
        ArgType::Any => Ok(value),
        ArgType::Vector(components) => match &value {
            Value::Array(items)
                if items.len() == components.len() && items.iter().all(Value::is_number) =>
            {
                Ok(value)
            }
            _ => Err(mismatch(
                arg,
                &format!("an array of {} numbers", components.len()),
                &value,
            )),
        },
        ArgType::Invocations => check_invocations(arg, value),
    }
}

fn check_invocations(arg: &ArgSpec, value: Value) -> Result<Value, BridgeError> {
    let Value::Array(steps) = &value else {
        return Err(mismatch(arg, "an array of steps", &value));
    };
    for (i, step) in steps.iter().enumerate() {
        let position = i + 1;
        let Value::Object(fields) = step else {
            return Err(BridgeError::InvalidArgument(format!(
                "step {position} must be an object with `tool` and `arguments`"
            )));
        };
        if !fields.get("tool").is_some_and(Value::is_string) {
            return Err(BridgeError::InvalidArgument(format!(
                "step {position} needs a string `tool`"
            )));
        }
        if let Some(args) = fields.get("arguments")
            && !(args.is_object() || args.is_null())
        {
            return Err(BridgeError::InvalidArgument(format!(
                "step {position}: `arguments` must be an object"
            )));
        }
        if let Some(extra) = fields.keys().find(|k| *k != "tool" && *k != "arguments") {
            return Err(BridgeError::InvalidArgument(format!(
                "step {position}: unexpected field `{extra}`"
            )));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::catalogue::Catalogue;

    fn run(tool: &str, args: Value) -> Result<Map<String, Value>, BridgeError> {
        let catalogue = Catalogue::builtin();
        let contract = catalogue.get(tool).unwrap();
        let cwd = EntityPath::parse("/obj").unwrap();
        validate(contract, args.as_object().unwrap(), &cwd)
    }

    #[test]
    fn fills_defaults_and_resolves_relative_paths() {
        let out = run("create-node", json!({"type": "sphere", "parent": "geo1"})).unwrap();
        assert_eq!(out["parent"], "/obj/geo1");
        assert!(!out.contains_key("name"));

        let out = run("create-node", json!({"type": "sphere"})).unwrap();
        assert_eq!(out["parent"], "/obj");
    }

    #[test]
    fn missing_required_argument_is_rejected() {
        let err = run("set-parameter", json!({"path": "/obj/geo1", "name": "scale"})).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(ref m) if m.contains("`value`")));
    }

    #[test]
    fn unknown_argument_is_rejected() {
        let err = run("get-node", json!({"path": "/obj", "verbose": true})).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(ref m) if m.contains("verbose")));
    }

    #[test]
    fn null_counts_as_absent() {
        let out = run("node-tree", json!({"root": null})).unwrap();
        assert_eq!(out["root"], "/obj");
        assert_eq!(out["depth"], 2);
    }

    #[test]
    fn type_mismatches_are_named() {
        let err = run("node-tree", json!({"depth": "deep"})).unwrap_err();
        assert!(err.to_string().contains("`depth` must be an integer"));

        let err = run("set-flag", json!({"path": "/obj/geo1", "flag": "hidden"})).unwrap_err();
        assert!(err.to_string().contains("one of"));
    }

    #[test]
    fn whole_float_is_an_integer() {
        let out = run("node-tree", json!({"depth": 3.0})).unwrap();
        assert_eq!(out["depth"], json!(3));
    }

    #[test]
    fn vector_components_fold_into_array() {
        let out = run(
            "create-node",
            json!({"type": "null", "positionx": 2.0, "position_y": -1.5}),
        )
        .unwrap();
        assert_eq!(out["position"], json!([2.0, -1.5]));
    }

    #[test]
    fn base_vector_wins_over_components() {
        let out = run(
            "create-node",
            json!({"type": "null", "position": [1.0, 1.0], "positionx": 9.0}),
        )
        .unwrap();
        assert_eq!(out["position"], json!([1.0, 1.0]));
    }

    #[test]
    fn missing_component_uses_default_or_fails() {
        let out = run("render-snapshot", json!({"resolutionx": 640})).unwrap();
        assert_eq!(out["resolution"], json!([640, 1080]));

        let out = run("render-snapshot", json!({"resolution_y": 720})).unwrap();
        assert_eq!(out["resolution"], json!([1920, 720]));

        let err = run("create-node", json!({"type": "null", "positionx": 1.0})).unwrap_err();
        assert!(err.to_string().contains("component `y`"));
    }

    #[test]
    fn escaping_the_root_is_invalid() {
        let err = run("get-node", json!({"path": "../../.."})).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[test]
    fn prim_paths_are_made_absolute() {
        let out = run("prim-get", json!({"path": "/stage", "prim_path": "world//geo"})).unwrap();
        assert_eq!(out["prim_path"], "/world/geo");
    }

    #[test]
    fn batch_steps_are_shape_checked() {
        assert!(run("batch", json!({"operations": [{"tool": "ping"}]})).is_ok());
        let err = run("batch", json!({"operations": [{"name": "ping"}]})).unwrap_err();
        assert!(err.to_string().contains("step 1"));
        let err = run("batch", json!({"operations": [{"tool": "ping", "arguments": 3}]})).unwrap_err();
        assert!(err.to_string().contains("`arguments`"));
    }
}
