use serde_json::{Map, Value, json};

use crate::engine::Route;
use crate::jobs::JobKind;

/// Coarse argument types understood by validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgType {
    String,
    Number,
    Integer,
    Bool,
    Enum(&'static [&'static str]),
    /// Node path, resolved against the current network and then the engine.
    NodePath,
    /// Stage prim path, normalized only.
    PrimPath,
    Object,
    Any,
    /// Fixed-size numeric vector addressable per component
    /// (`position`, `positionx`, `position_y`, ...).
    Vector(&'static [&'static str]),
    /// The step list of a batch.
    Invocations,
}

impl ArgType {
    fn schema(self) -> Value {
        match self {
            ArgType::String | ArgType::NodePath | ArgType::PrimPath => json!({ "type": "string" }),
            ArgType::Number => json!({ "type": "number" }),
            ArgType::Integer => json!({ "type": "integer" }),
            ArgType::Bool => json!({ "type": "boolean" }),
            ArgType::Enum(values) => json!({ "type": "string", "enum": values }),
            ArgType::Object => json!({ "type": "object" }),
            ArgType::Any => json!({}),
            ArgType::Vector(components) => json!({
                "type": "array",
                "items": { "type": "number" },
                "minItems": components.len(),
                "maxItems": components.len(),
            }),
            ArgType::Invocations => json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "tool": { "type": "string" },
                        "arguments": { "type": "object" }
                    },
                    "required": ["tool"]
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgDefault {
    None,
    Str(&'static str),
    Int(i64),
    Num(f64),
    Bool(bool),
    Pair(i64, i64),
}

impl ArgDefault {
    pub fn to_value(self) -> Option<Value> {
        match self {
            ArgDefault::None => None,
            ArgDefault::Str(s) => Some(json!(s)),
            ArgDefault::Int(i) => Some(json!(i)),
            ArgDefault::Num(n) => Some(json!(n)),
            ArgDefault::Bool(b) => Some(json!(b)),
            ArgDefault::Pair(a, b) => Some(json!([a, b])),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub ty: ArgType,
    pub required: bool,
    pub default: ArgDefault,
    pub description: &'static str,
}

impl ArgSpec {
    pub const fn required(name: &'static str, ty: ArgType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: true,
            default: ArgDefault::None,
            description,
        }
    }

    pub const fn optional(name: &'static str, ty: ArgType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: ArgDefault::None,
            description,
        }
    }

    pub const fn or(self, default: ArgDefault) -> Self {
        Self { default, ..self }
    }
}

/// Where a validated call goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToolTarget {
    Engine(Route),
    StartJob(JobKind),
    JobStatus,
    CancelJob,
    ListJobs,
    Batch,
    Stats,
}

/// How a batch undoes a successful step of this tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inverse {
    /// Read-only tools have nothing to undo.
    None,
    /// Delete the node whose path the step returned.
    DeleteCreated,
    /// Set `name` on `path` back to the value read before the step.
    RestoreParameter,
    RestoreFlag,
    RenameBack,
    /// Re-wire (or clear) the input the step changed.
    RestoreInput,
    RestoreFrame,
    /// Cancel the job the step started.
    CancelStartedJob,
    /// Mutating, but no compensation exists.
    NotAttempted,
}

/// Immutable descriptor of one tool in the catalogue.
#[derive(Debug, Clone, Copy)]
pub struct ToolContract {
    pub name: &'static str,
    pub description: &'static str,
    pub args: &'static [ArgSpec],
    /// Top-level fields of a successful result.
    pub returns: &'static [&'static str],
    pub target: ToolTarget,
    pub mutating: bool,
    pub cancellable: bool,
    pub inverse: Inverse,
}

impl ToolContract {
    pub fn arg(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.name == name)
    }

    /// Argument names holding node paths, which the adapter re-resolves.
    pub fn node_fields(&self) -> Vec<&'static str> {
        self.args
            .iter()
            .filter(|a| a.ty == ArgType::NodePath)
            .map(|a| a.name)
            .collect()
    }

    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for arg in self.args {
            let mut schema = arg.ty.schema();
            schema["description"] = json!(arg.description);
            if let Some(default) = arg.default.to_value() {
                schema["default"] = default;
            }
            properties.insert(arg.name.to_string(), schema);
        }
        let required: Vec<&str> = self
            .args
            .iter()
            .filter(|a| a.required)
            .map(|a| a.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    pub fn result_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .returns
            .iter()
            .map(|field| (field.to_string(), json!({})))
            .collect();
        json!({ "type": "object", "properties": properties })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema(),
            "result_schema": self.result_schema(),
            "mutating": self.mutating,
            "cancellable": self.cancellable,
        })
    }
}
