//! The closed set of tools this bridge version exposes.
//!
//! Tools are additive-only across versions: renaming one or changing the
//! meaning of an argument breaks agents that already call it.

use std::collections::HashMap;

use crate::contract::{ArgDefault as D, ArgSpec as A, ArgType as T, Inverse, ToolContract, ToolTarget};
use crate::engine::Route;
use crate::jobs::JobKind;

const XY: &[&str] = &["x", "y"];
const RANGE: &[&str] = &["start", "end"];

const FLAG_NAMES: &[&str] = &["display", "render", "bypass", "template", "selectable"];
const EXPORT_FORMATS: &[&str] = &["obj", "gltf", "glb", "usd", "usda", "ply", "bgeo"];
const SNAPSHOT_MODES: &[&str] = &["viewport", "karma"];
const EXPR_LANGUAGES: &[&str] = &["hscript", "python"];
const IMPORT_METHODS: &[&str] = &["reference", "sublayer"];
const ATTRIB_CLASSES: &[&str] = &["point", "vertex", "primitive", "detail"];
const WORK_ITEM_STATES: &[&str] = &["waiting", "cooking", "success", "failed", "cancelled"];
const JOB_STATES: &[&str] = &["pending", "running", "succeeded", "failed", "cancelled"];

macro_rules! read_tool {
    ($name:expr, $description:expr, $route:expr, $args:expr, $returns:expr $(,)?) => {
        ToolContract {
            name: $name,
            description: $description,
            args: $args,
            returns: $returns,
            target: ToolTarget::Engine($route),
            mutating: false,
            cancellable: false,
            inverse: Inverse::None,
        }
    };
}

macro_rules! write_tool {
    ($name:expr, $description:expr, $route:expr, $args:expr, $returns:expr, $inverse:expr $(,)?) => {
        ToolContract {
            name: $name,
            description: $description,
            args: $args,
            returns: $returns,
            target: ToolTarget::Engine($route),
            mutating: true,
            cancellable: false,
            inverse: $inverse,
        }
    };
}

macro_rules! job_tool {
    ($name:expr, $description:expr, $kind:expr, $args:expr $(,)?) => {
        ToolContract {
            name: $name,
            description: $description,
            args: $args,
            returns: &["job_id", "kind", "target", "state"],
            target: ToolTarget::StartJob($kind),
            mutating: true,
            cancellable: true,
            inverse: Inverse::CancelStartedJob,
        }
    };
}

pub static TOOLS: &[ToolContract] = &[
    // ── Scene and node reads ────────────────────────────────────────────────
    read_tool!("ping", "Check that the engine bridge is reachable.", Route::Ping, &[], &["status", "engine", "version"]),
    read_tool!(
        "scene-info",
        "Current scene file, frame and node count.",
        Route::SceneInfo,
        &[],
        &["file", "frame", "fps", "node_count"],
    ),
    read_tool!(
        "get-node",
        "Type, flags, wired inputs and children of one node.",
        Route::GetNode,
        &[A::required("path", T::NodePath, "Node path")],
        &["path", "name", "type", "category", "flags", "inputs", "children"],
    ),
    read_tool!(
        "list-children",
        "Direct children of a network.",
        Route::ListChildren,
        &[A::required("path", T::NodePath, "Network path")],
        &["path", "count", "children"],
    ),
    read_tool!(
        "node-tree",
        "Nested node hierarchy below a root.",
        Route::NodeTree,
        &[
            A::optional("root", T::NodePath, "Root of the tree").or(D::Str("/obj")),
            A::optional("depth", T::Integer, "Levels to descend").or(D::Int(2)),
        ],
        &["path", "name", "type", "children"],
    ),
    read_tool!(
        "search-nodes",
        "Find nodes by name glob and optional type below a root.",
        Route::SearchNodes,
        &[
            A::optional("pattern", T::String, "Glob on node names").or(D::Str("*")),
            A::optional("type", T::String, "Only nodes of this type"),
            A::optional("root", T::NodePath, "Search below this node").or(D::Str("/")),
        ],
        &["count", "matches"],
    ),
    read_tool!(
        "get-parameter",
        "Value of one parameter, or all parameters when no name is given.",
        Route::GetParameter,
        &[
            A::required("path", T::NodePath, "Node path"),
            A::optional("name", T::String, "Parameter name"),
        ],
        &["path", "name", "value", "expression", "parameters"],
    ),
    read_tool!(
        "parameter-template",
        "Parameter names, types and defaults of a node.",
        Route::ParameterTemplate,
        &[A::required("path", T::NodePath, "Node path")],
        &["path", "parameters"],
    ),
    read_tool!(
        "cook-status",
        "Networks currently cooking.",
        Route::CookStatus,
        &[],
        &["active", "cooking"],
    ),
    read_tool!(
        "work-items",
        "Work items of the most recent cook of a TOP network.",
        Route::WorkItems,
        &[
            A::required("path", T::NodePath, "TOP network path"),
            A::optional("state", T::Enum(WORK_ITEM_STATES), "Only items in this state"),
        ],
        &["path", "count", "items"],
    ),
    // ── Stage (LOP) reads ───────────────────────────────────────────────────
    read_tool!(
        "stage-info",
        "Prim and layer summary of a LOP network's stage.",
        Route::StageInfo,
        &[A::required("path", T::NodePath, "LOP node or network")],
        &["path", "prim_count", "root_prims", "layers"],
    ),
    read_tool!(
        "prim-get",
        "One prim of a stage.",
        Route::PrimGet,
        &[
            A::required("path", T::NodePath, "LOP node or network"),
            A::required("prim_path", T::PrimPath, "Prim path on the stage"),
            A::optional("include_attrs", T::Bool, "Include attributes").or(D::Bool(true)),
        ],
        &["prim_path", "type_name", "source_node", "attributes"],
    ),
    read_tool!(
        "layer-info",
        "Layers contributing to a stage.",
        Route::LayerInfo,
        &[A::required("path", T::NodePath, "LOP node or network")],
        &["path", "layers"],
    ),
    read_tool!(
        "prim-search",
        "Find prims by path glob and optional type name.",
        Route::PrimSearch,
        &[
            A::required("path", T::NodePath, "LOP node or network"),
            A::optional("pattern", T::String, "Glob on prim paths").or(D::Str("/**")),
            A::optional("type_name", T::String, "Only prims of this type"),
        ],
        &["count", "matches"],
    ),
    // ── Digital assets ──────────────────────────────────────────────────────
    read_tool!(
        "hda-list",
        "Installed digital asset definitions.",
        Route::HdaList,
        &[A::optional("category", T::String, "Only this node category")],
        &["count", "definitions"],
    ),
    read_tool!(
        "hda-get",
        "One digital asset definition.",
        Route::HdaGet,
        &[
            A::required("node_type", T::String, "Asset node type"),
            A::optional("category", T::String, "Node category"),
        ],
        &["node_type", "label", "category", "file_path", "version"],
    ),
    // ── Geometry extraction ─────────────────────────────────────────────────
    read_tool!(
        "geo-info",
        "Point, primitive and attribute summary of a geometry node.",
        Route::GeoInfo,
        &[A::required("path", T::NodePath, "Geometry node")],
        &["path", "point_count", "primitive_count", "vertex_count", "attributes"],
    ),
    read_tool!(
        "attrib-read",
        "Read a window of attribute values.",
        Route::AttribRead,
        &[
            A::required("path", T::NodePath, "Geometry node"),
            A::required("attrib_name", T::String, "Attribute name"),
            A::optional("attrib_class", T::Enum(ATTRIB_CLASSES), "Attribute class").or(D::Str("point")),
            A::optional("start", T::Integer, "First element").or(D::Int(0)),
            A::optional("count", T::Integer, "Elements to read, -1 for all").or(D::Int(-1)),
        ],
        &["path", "attrib_name", "start", "count", "values"],
    ),
    read_tool!(
        "aov-list",
        "Render passes configured on a render node, mapped to known pass types where possible.",
        Route::AovList,
        &[A::required("path", T::NodePath, "Render or LOP node")],
        &["path", "count", "aovs"],
    ),
    read_tool!(
        "camera-get",
        "Camera lens, clipping, resolution and world transform (4x4, row-major).",
        Route::CameraGet,
        &[A::required("path", T::NodePath, "Camera node")],
        &["path", "resolution", "focal_length", "aperture", "near_clip", "far_clip", "transform"],
    ),
    read_tool!(
        "scene-events",
        "Drain the queue of scene change events recorded since the last call.",
        Route::SceneEvents,
        &[],
        &["count", "events"],
    ),
    // ── Graph mutations ─────────────────────────────────────────────────────
    write_tool!(
        "create-node",
        "Create a node inside a network.",
        Route::CreateNode,
        &[
            A::required("type", T::String, "Node type"),
            A::optional("parent", T::NodePath, "Parent network").or(D::Str("/obj")),
            A::optional("name", T::String, "Node name, generated when omitted"),
            A::optional("position", T::Vector(XY), "Network editor position"),
        ],
        &["path", "name", "type"],
        Inverse::DeleteCreated,
    ),
    write_tool!(
        "delete-node",
        "Delete a node and everything below it.",
        Route::DeleteNode,
        &[A::required("path", T::NodePath, "Node path")],
        &["deleted"],
        Inverse::NotAttempted,
    ),
    write_tool!(
        "rename-node",
        "Rename a node. Paths below it change too.",
        Route::RenameNode,
        &[
            A::required("path", T::NodePath, "Node path"),
            A::required("name", T::String, "New name"),
        ],
        &["path", "old_path"],
        Inverse::RenameBack,
    ),
    write_tool!(
        "connect",
        "Wire an output of one node into an input of another.",
        Route::Connect,
        &[
            A::required("from", T::NodePath, "Upstream node"),
            A::required("to", T::NodePath, "Downstream node"),
            A::optional("input", T::Integer, "Input index on `to`").or(D::Int(0)),
            A::optional("output", T::Integer, "Output index on `from`").or(D::Int(0)),
        ],
        &["from", "to", "input", "output"],
        Inverse::RestoreInput,
    ),
    write_tool!(
        "disconnect",
        "Clear one input of a node.",
        Route::Disconnect,
        &[
            A::required("path", T::NodePath, "Node path"),
            A::optional("input", T::Integer, "Input index").or(D::Int(0)),
        ],
        &["path", "input", "disconnected"],
        Inverse::RestoreInput,
    ),
    write_tool!(
        "set-flag",
        "Set a node flag.",
        Route::SetFlag,
        &[
            A::required("path", T::NodePath, "Node path"),
            A::required("flag", T::Enum(FLAG_NAMES), "Flag name"),
            A::optional("value", T::Bool, "Flag value").or(D::Bool(true)),
        ],
        &["path", "flag", "value"],
        Inverse::RestoreFlag,
    ),
    write_tool!(
        "layout-children",
        "Auto-arrange the children of a network.",
        Route::LayoutChildren,
        &[A::optional("path", T::NodePath, "Network path").or(D::Str("/obj"))],
        &["path", "count"],
        Inverse::NotAttempted,
    ),
    // ── Parameters ──────────────────────────────────────────────────────────
    write_tool!(
        "set-parameter",
        "Set a parameter value. Vector values take the full array.",
        Route::SetParameter,
        &[
            A::required("path", T::NodePath, "Node path"),
            A::required("name", T::String, "Parameter name"),
            A::required("value", T::Any, "New value"),
        ],
        &["path", "name", "value"],
        Inverse::RestoreParameter,
    ),
    write_tool!(
        "set-expression",
        "Drive a parameter with an expression.",
        Route::SetExpression,
        &[
            A::required("path", T::NodePath, "Node path"),
            A::required("name", T::String, "Parameter name"),
            A::required("expression", T::String, "Expression source"),
            A::optional("language", T::Enum(EXPR_LANGUAGES), "Expression language").or(D::Str("hscript")),
        ],
        &["path", "name", "expression", "language"],
        Inverse::RestoreParameter,
    ),
    write_tool!(
        "revert-parameter",
        "Reset a parameter to its default.",
        Route::RevertParameter,
        &[
            A::required("path", T::NodePath, "Node path"),
            A::required("name", T::String, "Parameter name"),
        ],
        &["path", "name", "value"],
        Inverse::RestoreParameter,
    ),
    // ── Scene ───────────────────────────────────────────────────────────────
    write_tool!(
        "set-frame",
        "Move the playhead.",
        Route::SetFrame,
        &[A::required("frame", T::Number, "Frame number")],
        &["frame"],
        Inverse::RestoreFrame,
    ),
    write_tool!(
        "scene-save",
        "Save the scene, optionally to a new file.",
        Route::SceneSave,
        &[A::optional("file", T::String, "Target file")],
        &["file", "saved"],
        Inverse::NotAttempted,
    ),
    write_tool!(
        "export-geometry",
        "Write a geometry node's output to a file.",
        Route::ExportGeometry,
        &[
            A::required("path", T::NodePath, "Geometry node"),
            A::optional("format", T::Enum(EXPORT_FORMATS), "File format").or(D::Str("obj")),
            A::optional("output", T::String, "Output file"),
        ],
        &["path", "format", "output"],
        Inverse::NotAttempted,
    ),
    write_tool!(
        "render-snapshot",
        "Capture the viewport or a quick render to an image.",
        Route::RenderSnapshot,
        &[
            A::optional("mode", T::Enum(SNAPSHOT_MODES), "Capture mode").or(D::Str("viewport")),
            A::optional("output", T::String, "Output image"),
            A::optional("resolution", T::Vector(XY), "Image size in pixels").or(D::Pair(1920, 1080)),
            A::optional("lop_node", T::NodePath, "LOP node to render in karma mode"),
        ],
        &["mode", "output", "resolution"],
        Inverse::NotAttempted,
    ),
    write_tool!(
        "render-flipbook",
        "Render a frame sequence from the viewport.",
        Route::RenderFlipbook,
        &[
            A::required("frame_range", T::Vector(RANGE), "First and last frame"),
            A::optional("output", T::String, "Output path pattern, $F for the frame number"),
            A::optional("resolution", T::Vector(XY), "Image size in pixels").or(D::Pair(1920, 1080)),
        ],
        &["output", "frame_range", "frames", "resolution"],
        Inverse::NotAttempted,
    ),
    write_tool!(
        "dirty-cook",
        "Dirty a TOP network so the next cook starts fresh.",
        Route::DirtyCook,
        &[
            A::required("path", T::NodePath, "TOP network"),
            A::optional("dirty_all", T::Bool, "Also dirty upstream nodes").or(D::Bool(false)),
        ],
        &["path", "dirtied"],
        Inverse::NotAttempted,
    ),
    write_tool!(
        "lop-import",
        "Reference or sublayer a USD file into a LOP network.",
        Route::LopImport,
        &[
            A::required("path", T::NodePath, "LOP network"),
            A::required("file", T::String, "USD file"),
            A::optional("method", T::Enum(IMPORT_METHODS), "Import method").or(D::Str("reference")),
            A::optional("prim_path", T::PrimPath, "Destination prim"),
        ],
        &["path", "file", "method", "prim_path"],
        Inverse::DeleteCreated,
    ),
    write_tool!(
        "hda-create",
        "Turn a subnetwork into a digital asset.",
        Route::HdaCreate,
        &[
            A::required("node_path", T::NodePath, "Source subnetwork"),
            A::required("name", T::String, "Asset node type name"),
            A::required("label", T::String, "Display label"),
            A::required("file_path", T::String, "Library file to write"),
            A::optional("version", T::String, "Asset version"),
            A::optional("min_inputs", T::Integer, "Minimum inputs"),
            A::optional("max_inputs", T::Integer, "Maximum inputs"),
        ],
        &["node_type", "label", "category", "file_path", "version"],
        Inverse::NotAttempted,
    ),
    write_tool!(
        "hda-install",
        "Install digital assets from a library file.",
        Route::HdaInstall,
        &[A::required("file_path", T::String, "Library file")],
        &["file_path", "definitions"],
        Inverse::NotAttempted,
    ),
    write_tool!(
        "hda-reload",
        "Reload digital asset libraries.",
        Route::HdaReload,
        &[A::optional("file_path", T::String, "Only this library file")],
        &["reloaded"],
        Inverse::NotAttempted,
    ),
    // ── Jobs ────────────────────────────────────────────────────────────────
    job_tool!(
        "start-cook",
        "Start cooking a TOP network. Returns a job id to poll.",
        JobKind::Cook,
        &[
            A::required("target", T::NodePath, "TOP network"),
            A::optional("tops_only", T::Bool, "Cook only TOP nodes").or(D::Bool(true)),
        ],
    ),
    job_tool!(
        "start-render",
        "Start a render. Returns a job id to poll.",
        JobKind::Render,
        &[
            A::required("target", T::NodePath, "Render node"),
            A::optional("output", T::String, "Output image"),
            A::optional("resolution", T::Vector(XY), "Image size in pixels"),
            A::optional("frame_range", T::Vector(RANGE), "First and last frame"),
        ],
    ),
    job_tool!(
        "start-inference",
        "Start an inference job. Returns a job id to poll.",
        JobKind::Inference,
        &[
            A::required("target", T::NodePath, "Node providing the input"),
            A::optional("params", T::Object, "Model parameters"),
        ],
    ),
    ToolContract {
        name: "job-status",
        description: "Current state and progress of a job.",
        args: &[A::required("job_id", T::String, "Job id")],
        returns: &[
            "id",
            "kind",
            "target",
            "state",
            "progress",
            "started_at",
            "finished_at",
            "error",
            "result",
            "cancellation_requested",
        ],
        target: ToolTarget::JobStatus,
        mutating: false,
        cancellable: false,
        inverse: Inverse::None,
    },
    ToolContract {
        name: "cancel-job",
        description: "Request cancellation of a job. Poll job-status for the outcome.",
        args: &[A::required("job_id", T::String, "Job id")],
        returns: &["id", "state", "cancellation_requested"],
        target: ToolTarget::CancelJob,
        mutating: true,
        cancellable: false,
        inverse: Inverse::NotAttempted,
    },
    ToolContract {
        name: "list-jobs",
        description: "Jobs the bridge is tracking.",
        args: &[A::optional("state", T::Enum(JOB_STATES), "Only jobs in this state")],
        returns: &["count", "jobs"],
        target: ToolTarget::ListJobs,
        mutating: false,
        cancellable: false,
        inverse: Inverse::None,
    },
    // ── Bridge ──────────────────────────────────────────────────────────────
    ToolContract {
        name: "batch",
        description: "Run tool calls in order as one unit. On failure, applied steps are undone where possible.",
        args: &[
            A::required("operations", T::Invocations, "Steps as {tool, arguments}"),
            A::optional("cwd", T::NodePath, "Network that relative paths start from"),
        ],
        returns: &["count", "results"],
        target: ToolTarget::Batch,
        mutating: true,
        cancellable: false,
        inverse: Inverse::NotAttempted,
    },
    ToolContract {
        name: "bridge-stats",
        description: "Call, failure, batch and job counters of this bridge.",
        args: &[],
        returns: &["calls", "failures", "batches_run", "jobs_started"],
        target: ToolTarget::Stats,
        mutating: false,
        cancellable: false,
        inverse: Inverse::None,
    },
];

/// Name-indexed view over [`TOOLS`], built once at startup.
pub struct Catalogue {
    by_name: HashMap<&'static str, &'static ToolContract>,
}

impl Default for Catalogue {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalogue {
    pub fn builtin() -> Self {
        Self {
            by_name: TOOLS.iter().map(|t| (t.name, t)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&'static ToolContract> {
        self.by_name.get(name).copied()
    }

    /// Contracts in catalogue order.
    pub fn iter(&self) -> impl Iterator<Item = &'static ToolContract> {
        TOOLS.iter()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        assert_eq!(Catalogue::builtin().len(), TOOLS.len());
    }

    #[test]
    fn every_mutating_tool_declares_rollback() {
        for tool in TOOLS {
            assert_eq!(
                tool.mutating,
                tool.inverse != Inverse::None,
                "{} must declare an inverse or NotAttempted exactly when it mutates",
                tool.name
            );
        }
    }

    #[test]
    fn engine_targets_match_route_direction() {
        for tool in TOOLS {
            if let ToolTarget::Engine(route) = tool.target {
                assert_eq!(route.is_read(), !tool.mutating, "{}", tool.name);
            }
        }
    }

    #[test]
    fn only_job_starts_are_cancellable() {
        for tool in TOOLS {
            assert_eq!(
                tool.cancellable,
                matches!(tool.target, ToolTarget::StartJob(_)),
                "{}",
                tool.name
            );
        }
    }

    #[test]
    fn lookup_by_name() {
        let catalogue = Catalogue::builtin();
        assert_eq!(catalogue.get("create-node").unwrap().inverse, Inverse::DeleteCreated);
        assert!(catalogue.get("create_node").is_none());
    }

    #[test]
    fn schemas_are_objects() {
        for tool in TOOLS {
            assert_eq!(tool.input_schema()["type"], "object", "{}", tool.name);
        }
    }
}
