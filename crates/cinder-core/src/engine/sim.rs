//! In-memory stand-in for the scene engine.
//!
//! Models just enough of a node graph (typed nodes, parameters, wires, flags,
//! LOP layers, HDA definitions, cooperative jobs) to exercise every route
//! deterministically. Jobs advance one step per status poll.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::addressing::PathGlob;
use crate::engine::{EngineBackend, Route};
use crate::error::EngineError;

const FLAGS: &[&str] = &["display", "render", "bypass", "template", "selectable"];

/// Oldest change events are dropped past this many undrained.
const MAX_EVENTS: usize = 1000;

/// Known render passes: name, type, data type, format, source.
const CANONICAL_AOVS: &[(&str, &str, &str, &str, &str)] = &[
    ("depth", "DEPTH", "float", "float32", "builtin"),
    ("N_world", "NORMAL_WORLD", "vector3f", "float16", "primvar"),
    ("P_world", "POSITION_WORLD", "point3f", "float32", "primvar"),
    ("albedo", "ALBEDO", "color3f", "float16", "lpe"),
    ("diffuse", "DIFFUSE", "color3f", "float16", "lpe"),
    ("specular", "SPECULAR", "color3f", "float16", "lpe"),
    ("shadow", "SHADOW", "float", "float16", "lpe"),
    ("irradiance", "IRRADIANCE", "color3f", "float32", "lpe"),
    ("motion", "MOTION_VECTOR", "vector3f", "float16", "builtin"),
    ("crypto_object", "CRYPTOMATTE_OBJECT", "color4f", "float32", "cryptomatte"),
    ("crypto_material", "CRYPTOMATTE_MATERIAL", "color4f", "float32", "cryptomatte"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Wire {
    pub from: String,
    pub output: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub file: String,
    pub method: String,
    pub prim_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimNode {
    pub node_type: String,
    pub category: String,
    pub parameters: BTreeMap<String, Value>,
    pub defaults: BTreeMap<String, Value>,
    pub expressions: BTreeMap<String, String>,
    pub inputs: BTreeMap<u64, Wire>,
    pub flags: BTreeMap<String, bool>,
    pub position: [f64; 2],
    pub layer: Option<Layer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HdaDefinition {
    pub node_type: String,
    pub label: String,
    pub category: String,
    pub file_path: String,
    pub version: String,
}

impl HdaDefinition {
    fn to_json(&self) -> Value {
        json!({
            "node_type": self.node_type,
            "label": self.label,
            "category": self.category,
            "file_path": self.file_path,
            "version": self.version,
        })
    }
}

/// Observable graph state. Jobs are not part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub nodes: BTreeMap<String, SimNode>,
    pub frame: f64,
    pub file: String,
    pub saves: u64,
    pub exports: Vec<String>,
    pub snapshots: Vec<String>,
    pub dirty_generation: u64,
    pub hdas: BTreeMap<String, HdaDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimJobKind {
    Cook,
    Render,
    Inference,
}

#[derive(Debug, Clone, PartialEq)]
enum SimJobState {
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
struct SimJob {
    seq: u64,
    kind: SimJobKind,
    target: String,
    total: u64,
    done: u64,
    state: SimJobState,
    cancel_requested: bool,
}

struct SimState {
    scene: Scene,
    jobs: BTreeMap<String, SimJob>,
    next_handle: u64,
    faults: HashMap<Route, EngineError>,
    failing_targets: BTreeSet<String>,
    ignore_cancel: bool,
    events: VecDeque<Value>,
}

/// Deterministic [`EngineBackend`] backed by an in-memory graph.
pub struct SimulatedEngine {
    state: Mutex<SimState>,
    latency: Option<Duration>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    /// A scene with `/obj/geo1`, `/obj/topnet1` (one generator),
    /// `/out/karma1` and an empty `/stage`.
    pub fn new() -> Self {
        let mut scene = Scene {
            nodes: BTreeMap::new(),
            frame: 1.0,
            file: "untitled.hip".into(),
            saves: 0,
            exports: Vec::new(),
            snapshots: Vec::new(),
            dirty_generation: 0,
            hdas: BTreeMap::new(),
        };
        for (path, node_type) in [
            ("/", "root"),
            ("/obj", "obj"),
            ("/obj/geo1", "geo"),
            ("/obj/topnet1", "topnet"),
            ("/obj/topnet1/generator1", "genericgenerator"),
            ("/out", "out"),
            ("/out/karma1", "karma"),
            ("/stage", "stage"),
        ] {
            if let Some(node) = SimNode::new(node_type, &scene.hdas) {
                scene.nodes.insert(path.to_string(), node);
            }
        }
        Self {
            state: Mutex::new(SimState {
                scene,
                jobs: BTreeMap::new(),
                next_handle: 1,
                faults: HashMap::new(),
                failing_targets: BTreeSet::new(),
                ignore_cancel: false,
                events: VecDeque::new(),
            }),
            latency: None,
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn scene(&self) -> Scene {
        self.state.lock().await.scene.clone()
    }

    /// Make the next call to `route` fail with `error`.
    pub async fn fail_next(&self, route: Route, error: EngineError) {
        self.state.lock().await.faults.insert(route, error);
    }

    /// Jobs started on `target` fail half-way through.
    pub async fn fail_jobs_on(&self, target: &str) {
        self.state
            .lock()
            .await
            .failing_targets
            .insert(target.to_string());
    }

    /// Keep running jobs going after a cancel request.
    pub async fn ignore_cancel(&self, ignore: bool) {
        self.state.lock().await.ignore_cancel = ignore;
    }

    /// Finish every running job at once, as if the engine got there while
    /// nobody was polling.
    pub async fn complete_running_jobs(&self) {
        let mut state = self.state.lock().await;
        for job in state.jobs.values_mut() {
            if job.state == SimJobState::Running {
                job.done = job.total;
                job.state = SimJobState::Succeeded;
            }
        }
    }
}

impl EngineBackend for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated"
    }

    fn call<'a>(
        &'a self,
        route: Route,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let mut state = self.state.lock().await;
            if let Some(err) = state.faults.remove(&route) {
                return Err(err);
            }
            state.handle(route, payload)
        })
    }
}

impl SimNode {
    fn new(node_type: &str, hdas: &BTreeMap<String, HdaDefinition>) -> Option<Self> {
        let (category, defaults): (&str, Vec<(&str, Value)>) = match node_type {
            "root" => ("Director", vec![]),
            "obj" | "out" => ("Manager", vec![]),
            "geo" => ("Object", vec![("scale", json!(1.0))]),
            "subnet" => ("Object", vec![]),
            "sphere" => (
                "Sop",
                vec![("rad", json!([1.0, 1.0, 1.0])), ("rows", json!(13)), ("cols", json!(24))],
            ),
            "box" => ("Sop", vec![("size", json!([1.0, 1.0, 1.0]))]),
            "scatter" => ("Sop", vec![("npts", json!(1000)), ("seed", json!(0))]),
            "null" | "merge" => ("Sop", vec![]),
            "topnet" => ("TopNet", vec![]),
            "genericgenerator" => ("Top", vec![("itemcount", json!(4))]),
            "stage" | "lopnet" => ("LopNet", vec![]),
            "sublayer" => ("Lop", vec![("filepath1", json!(""))]),
            "reference" => ("Lop", vec![("filepath1", json!("")), ("primpath", json!(""))]),
            "karma" => (
                "Driver",
                vec![
                    ("picture", json!("render.exr")),
                    ("resolution", json!([1920, 1080])),
                    ("aovs", json!("")),
                ],
            ),
            "cam" => (
                "Object",
                vec![
                    ("focal", json!(50.0)),
                    ("aperture", json!(41.4214)),
                    ("near", json!(0.01)),
                    ("far", json!(10000.0)),
                    ("resx", json!(1920)),
                    ("resy", json!(1080)),
                    ("t", json!([0.0, 0.0, 0.0])),
                    ("r", json!([0.0, 0.0, 0.0])),
                ],
            ),
            other => match hdas.get(other) {
                Some(def) => (def.category.as_str(), vec![]),
                None => return None,
            },
        };
        let defaults: BTreeMap<String, Value> = defaults
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        let flags = FLAGS
            .iter()
            .map(|f| (f.to_string(), *f == "selectable"))
            .collect();
        Some(Self {
            node_type: node_type.to_string(),
            category: category.to_string(),
            parameters: defaults.clone(),
            defaults,
            expressions: BTreeMap::new(),
            inputs: BTreeMap::new(),
            flags,
            position: [0.0, 0.0],
            layer: None,
        })
    }

    fn point_count(&self) -> i64 {
        let int = |name: &str| self.parameters.get(name).and_then(Value::as_i64);
        match (int("npts"), int("rows"), int("cols")) {
            (Some(npts), _, _) => npts,
            (None, Some(rows), Some(cols)) => rows * cols,
            _ if self.node_type == "box" => 8,
            _ => 0,
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn within(path: &str, root: &str) -> bool {
    root == "/" || path == root || path.starts_with(&format!("{root}/"))
}

fn reparent(path: &str, old_root: &str, new_root: &str) -> String {
    format!("{new_root}{}", &path[old_root.len()..])
}

fn text(payload: &Value, key: &str) -> Result<String, EngineError> {
    opt_text(payload, key)
        .ok_or_else(|| EngineError::InvalidArgument(format!("missing argument `{key}`")))
}

fn opt_text(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn integer(payload: &Value, key: &str, default: i64) -> Result<i64, EngineError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| EngineError::InvalidArgument(format!("`{key}` must be an integer"))),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| EngineError::InvalidArgument(format!("`{key}` must be an integer"))),
        Some(_) => Err(EngineError::InvalidArgument(format!("`{key}` must be an integer"))),
    }
}

fn index(payload: &Value, key: &str) -> Result<u64, EngineError> {
    let value = integer(payload, key, 0)?;
    u64::try_from(value)
        .map_err(|_| EngineError::InvalidArgument(format!("`{key}` must not be negative")))
}

fn boolean(payload: &Value, key: &str, default: bool) -> bool {
    match payload.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => default,
    }
}

fn pattern_of(pattern: &str) -> Result<PathGlob, EngineError> {
    PathGlob::new(pattern)
        .map_err(|e| EngineError::InvalidArgument(format!("invalid pattern `{pattern}`: {e}")))
}

fn not_found(path: &str) -> EngineError {
    EngineError::NotFound(format!("node not found: {path}"))
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EngineError::InvalidArgument(format!(
            "invalid node name `{name}`"
        )));
    }
    Ok(())
}

fn aov_entry(name: &str) -> Value {
    match CANONICAL_AOVS.iter().find(|(canonical, ..)| *canonical == name) {
        Some((_, aov_type, data_type, format, source)) => json!({
            "aov_name": name,
            "aov_type": aov_type,
            "data_type": data_type,
            "format": format,
            "source": source,
        }),
        None => json!({
            "aov_name": name,
            "aov_type": "CUSTOM",
            "data_type": "color3f",
            "format": "float16",
            "source": "raw",
        }),
    }
}

fn compatible(current: &Value, new: &Value) -> bool {
    match (current, new) {
        (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_)) => true,
        (Value::Array(a), Value::Array(b)) => a.len() == b.len() && b.iter().all(Value::is_number),
        _ => false,
    }
}

fn parm_kind(value: &Value) -> &'static str {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Bool(_) => "toggle",
        Value::Array(_) => "vector",
        _ => "data",
    }
}

impl SimState {
    fn handle(&mut self, route: Route, payload: &Value) -> Result<Value, EngineError> {
        let result = self.dispatch(route, payload)?;
        self.note_change(route, payload, &result);
        Ok(result)
    }

    fn dispatch(&mut self, route: Route, payload: &Value) -> Result<Value, EngineError> {
        match route {
            Route::Ping => Ok(json!({
                "status": "ok",
                "engine": "cinder-sim",
                "version": env!("CARGO_PKG_VERSION"),
            })),
            Route::SceneInfo => Ok(json!({
                "file": self.scene.file,
                "frame": self.scene.frame,
                "fps": 24.0,
                "node_count": self.scene.nodes.len(),
            })),
            Route::ResolveNode => self.resolve(payload),
            Route::GetNode => self.get_node(payload),
            Route::ListChildren => self.list_children(payload),
            Route::NodeTree => self.node_tree(payload),
            Route::SearchNodes => self.search_nodes(payload),
            Route::GetParameter => self.get_parameter(payload),
            Route::ParameterTemplate => self.parameter_template(payload),
            Route::CookStatus => Ok(self.cook_status()),
            Route::WorkItems => self.work_items(payload),
            Route::StageInfo => self.stage_info(payload),
            Route::PrimGet => self.prim_get(payload),
            Route::LayerInfo => self.layer_info(payload),
            Route::PrimSearch => self.prim_search(payload),
            Route::HdaList => Ok(self.hda_list(payload)),
            Route::HdaGet => self.hda_get(payload),
            Route::GeoInfo => self.geo_info(payload),
            Route::AttribRead => self.attrib_read(payload),
            Route::AovList => self.aov_list(payload),
            Route::CameraGet => self.camera_get(payload),
            Route::SceneEvents => Ok(self.drain_events()),
            Route::CreateNode => self.create_node(payload),
            Route::DeleteNode => self.delete_node(payload),
            Route::RenameNode => self.rename_node(payload),
            Route::Connect => self.connect(payload),
            Route::Disconnect => self.disconnect(payload),
            Route::SetFlag => self.set_flag(payload),
            Route::LayoutChildren => self.layout_children(payload),
            Route::SetParameter => self.set_parameter(payload),
            Route::SetExpression => self.set_expression(payload),
            Route::RevertParameter => self.revert_parameter(payload),
            Route::SetFrame => self.set_frame(payload),
            Route::SceneSave => Ok(self.scene_save(payload)),
            Route::ExportGeometry => self.export_geometry(payload),
            Route::RenderSnapshot => Ok(self.render_snapshot(payload)),
            Route::RenderFlipbook => self.render_flipbook(payload),
            Route::DirtyCook => self.dirty_cook(payload),
            Route::LopImport => self.lop_import(payload),
            Route::HdaCreate => self.hda_create(payload),
            Route::HdaInstall => self.hda_install(payload),
            Route::HdaReload => self.hda_reload(payload),
            Route::StartCook => self.start_job(SimJobKind::Cook, payload),
            Route::StartRender => self.start_job(SimJobKind::Render, payload),
            Route::StartInference => self.start_job(SimJobKind::Inference, payload),
            Route::CookJobStatus => self.job_status(SimJobKind::Cook, payload),
            Route::RenderJobStatus => self.job_status(SimJobKind::Render, payload),
            Route::InferenceJobStatus => self.job_status(SimJobKind::Inference, payload),
            Route::CancelCook => self.cancel_job(SimJobKind::Cook, payload),
            Route::CancelRender => self.cancel_job(SimJobKind::Render, payload),
            Route::CancelInference => self.cancel_job(SimJobKind::Inference, payload),
        }
    }

    fn push_event(&mut self, event_type: &str, scope: &str, path: &str) {
        let timestamp = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        self.events.push_back(json!({
            "event": "invalidate",
            "scope": scope,
            "path": path,
            "event_type": event_type,
            "timestamp": timestamp,
        }));
        while self.events.len() > MAX_EVENTS {
            self.events.pop_front();
        }
    }

    /// Queue the invalidation events a successful call implies.
    fn note_change(&mut self, route: Route, payload: &Value, result: &Value) {
        let field = |value: &Value, key: &str| value.get(key).and_then(Value::as_str).unwrap_or("/").to_string();
        match route {
            Route::CreateNode => self.push_event("node_created", "network", &field(result, "path")),
            Route::DeleteNode => {
                let deleted = field(result, "deleted");
                self.push_event("node_deleted", "network", parent_of(&deleted).unwrap_or("/"));
            }
            Route::RenameNode => {
                let old = field(result, "old_path");
                self.push_event("node_deleted", "network", parent_of(&old).unwrap_or("/"));
                self.push_event("node_created", "network", &field(result, "path"));
            }
            Route::SetParameter | Route::SetExpression | Route::RevertParameter => {
                let path = format!("{}/{}", field(payload, "path"), field(payload, "name"));
                self.push_event("parm_changed", "node", &path);
            }
            Route::Connect => self.push_event("connection_changed", "node", &field(payload, "to")),
            Route::Disconnect => self.push_event("connection_changed", "node", &field(payload, "path")),
            Route::SetFrame => {
                let frame = result.get("frame").cloned().unwrap_or(Value::Null);
                self.push_event("frame_changed", "scene", &format!("frame:{frame}"));
            }
            Route::SceneSave => self.push_event("hip_saved", "scene", &field(result, "file")),
            _ => {}
        }
    }

    fn drain_events(&mut self) -> Value {
        let events: Vec<Value> = self.events.drain(..).collect();
        json!({ "count": events.len(), "events": events })
    }

    fn node(&self, path: &str) -> Result<&SimNode, EngineError> {
        self.scene.nodes.get(path).ok_or_else(|| not_found(path))
    }

    fn node_mut(&mut self, path: &str) -> Result<&mut SimNode, EngineError> {
        self.scene.nodes.get_mut(path).ok_or_else(|| not_found(path))
    }

    fn children(&self, path: &str) -> Vec<(&String, &SimNode)> {
        self.scene
            .nodes
            .iter()
            .filter(|(p, _)| parent_of(p) == Some(path))
            .collect()
    }

    fn layers_under(&self, path: &str) -> Vec<(&String, &Layer)> {
        self.scene
            .nodes
            .iter()
            .filter(|(p, _)| within(p, path))
            .filter_map(|(p, n)| n.layer.as_ref().map(|l| (p, l)))
            .collect()
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    fn resolve(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let node = self.node(&path)?;
        Ok(json!({ "path": path, "type": node.node_type, "category": node.category }))
    }

    fn get_node(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let node = self.node(&path)?;
        let inputs: Vec<Value> = node
            .inputs
            .iter()
            .map(|(idx, wire)| json!({ "index": idx, "from": wire.from, "output": wire.output }))
            .collect();
        let children: Vec<&str> = self
            .children(&path)
            .into_iter()
            .map(|(p, _)| name_of(p))
            .collect();
        Ok(json!({
            "path": path,
            "name": name_of(&path),
            "type": node.node_type,
            "category": node.category,
            "flags": node.flags,
            "inputs": inputs,
            "children": children,
            "position": node.position,
        }))
    }

    fn list_children(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        self.node(&path)?;
        let children: Vec<Value> = self
            .children(&path)
            .iter()
            .map(|(p, n)| json!({ "name": name_of(p), "path": p, "type": n.node_type }))
            .collect();
        Ok(json!({ "path": path, "count": children.len(), "children": children }))
    }

    fn tree(&self, path: &str, depth: i64) -> Value {
        let children: Vec<Value> = if depth > 0 {
            self.children(path)
                .iter()
                .map(|(p, _)| self.tree(p, depth - 1))
                .collect()
        } else {
            Vec::new()
        };
        let node_type = self
            .scene
            .nodes
            .get(path)
            .map(|n| n.node_type.as_str())
            .unwrap_or_default();
        json!({ "path": path, "name": name_of(path), "type": node_type, "children": children })
    }

    fn node_tree(&self, payload: &Value) -> Result<Value, EngineError> {
        let root = opt_text(payload, "root").unwrap_or_else(|| "/obj".into());
        self.node(&root)?;
        let depth = integer(payload, "depth", 2)?.max(0);
        Ok(self.tree(&root, depth))
    }

    fn search_nodes(&self, payload: &Value) -> Result<Value, EngineError> {
        let pattern = opt_text(payload, "pattern").unwrap_or_else(|| "*".into());
        let root = opt_text(payload, "root").unwrap_or_else(|| "/".into());
        let node_type = opt_text(payload, "type");
        let glob = pattern_of(&pattern)?;
        self.node(&root)?;
        let matches: Vec<Value> = self
            .scene
            .nodes
            .iter()
            .filter(|(p, _)| p.as_str() != root && within(p, &root))
            .filter(|(p, _)| glob.matches(name_of(p)))
            .filter(|(_, n)| node_type.as_deref().is_none_or(|t| n.node_type == t))
            .map(|(p, n)| json!({ "path": p, "type": n.node_type }))
            .collect();
        Ok(json!({ "count": matches.len(), "matches": matches }))
    }

    fn get_parameter(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let node = self.node(&path)?;
        match opt_text(payload, "name") {
            Some(name) => {
                let value = node.parameters.get(&name).ok_or_else(|| {
                    EngineError::NotFound(format!("parameter `{name}` not found on {path}"))
                })?;
                Ok(json!({
                    "path": path,
                    "name": name,
                    "value": value,
                    "expression": node.expressions.get(&name),
                }))
            }
            None => Ok(json!({ "path": path, "parameters": node.parameters })),
        }
    }

    fn parameter_template(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let node = self.node(&path)?;
        let parameters: Vec<Value> = node
            .defaults
            .iter()
            .map(|(name, default)| json!({ "name": name, "type": parm_kind(default), "default": default }))
            .collect();
        Ok(json!({ "path": path, "parameters": parameters }))
    }

    fn cook_status(&self) -> Value {
        let cooking: Vec<&str> = self
            .jobs
            .values()
            .filter(|j| j.kind == SimJobKind::Cook && j.state == SimJobState::Running)
            .map(|j| j.target.as_str())
            .collect();
        json!({ "active": cooking.len(), "cooking": cooking })
    }

    fn work_items(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        self.node(&path)?;
        let filter = opt_text(payload, "state");
        let Some(job) = self
            .jobs
            .values()
            .filter(|j| j.kind == SimJobKind::Cook && j.target == path)
            .max_by_key(|j| j.seq)
        else {
            return Ok(json!({ "path": path, "count": 0, "items": [] }));
        };
        let items: Vec<Value> = (0..job.total)
            .map(|i| {
                let state = match &job.state {
                    SimJobState::Failed(_) if i + 1 == job.done => "failed",
                    _ if i < job.done => "success",
                    SimJobState::Running if i == job.done => "cooking",
                    SimJobState::Cancelled => "cancelled",
                    _ => "waiting",
                };
                (i, state)
            })
            .filter(|(_, state)| filter.as_deref().is_none_or(|f| f == *state))
            .map(|(i, state)| json!({ "id": i, "index": i, "state": state }))
            .collect();
        Ok(json!({ "path": path, "count": items.len(), "items": items }))
    }

    fn stage_info(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        self.node(&path)?;
        let layers = self.layers_under(&path);
        let root_prims: BTreeSet<String> = layers
            .iter()
            .filter_map(|(_, l)| l.prim_path.split('/').find(|s| !s.is_empty()))
            .map(|s| format!("/{s}"))
            .collect();
        let files: Vec<&str> = layers.iter().map(|(_, l)| l.file.as_str()).collect();
        Ok(json!({
            "path": path,
            "prim_count": layers.len(),
            "root_prims": root_prims,
            "layers": files,
        }))
    }

    fn prim_get(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let prim_path = text(payload, "prim_path")?;
        self.node(&path)?;
        let (node, layer) = self
            .layers_under(&path)
            .into_iter()
            .find(|(_, l)| l.prim_path == prim_path)
            .ok_or_else(|| EngineError::NotFound(format!("prim not found: {prim_path}")))?;
        let mut prim = json!({
            "prim_path": prim_path,
            "type_name": "Xform",
            "source_node": node,
            "file": layer.file,
        });
        if boolean(payload, "include_attrs", true) {
            prim["attributes"] = json!({ "visibility": "inherited", "purpose": "default" });
        }
        Ok(prim)
    }

    fn layer_info(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        self.node(&path)?;
        let layers: Vec<Value> = self
            .layers_under(&path)
            .iter()
            .map(|(p, l)| json!({ "node": p, "file": l.file, "method": l.method }))
            .collect();
        Ok(json!({ "path": path, "layers": layers }))
    }

    fn prim_search(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        self.node(&path)?;
        let pattern = opt_text(payload, "pattern").unwrap_or_else(|| "/**".into());
        let glob = pattern_of(&pattern)?;
        let type_name = opt_text(payload, "type_name");
        let matches: Vec<&str> = self
            .layers_under(&path)
            .into_iter()
            .map(|(_, l)| l.prim_path.as_str())
            .filter(|p| glob.matches(p))
            .filter(|_| type_name.as_deref().is_none_or(|t| t == "Xform"))
            .collect();
        Ok(json!({ "count": matches.len(), "matches": matches }))
    }

    fn hda_list(&self, payload: &Value) -> Value {
        let category = opt_text(payload, "category");
        let definitions: Vec<Value> = self
            .scene
            .hdas
            .values()
            .filter(|d| category.as_deref().is_none_or(|c| d.category == c))
            .map(HdaDefinition::to_json)
            .collect();
        json!({ "count": definitions.len(), "definitions": definitions })
    }

    fn hda_get(&self, payload: &Value) -> Result<Value, EngineError> {
        let node_type = text(payload, "node_type")?;
        let category = opt_text(payload, "category");
        self.scene
            .hdas
            .get(&node_type)
            .filter(|d| category.as_deref().is_none_or(|c| d.category == c))
            .map(HdaDefinition::to_json)
            .ok_or_else(|| EngineError::NotFound(format!("no HDA definition for `{node_type}`")))
    }

    fn geometry_node(&self, path: &str) -> Result<&SimNode, EngineError> {
        let node = self.node(path)?;
        if node.category != "Sop" {
            return Err(EngineError::InvalidArgument(format!(
                "{path} is not a geometry node"
            )));
        }
        Ok(node)
    }

    fn geo_info(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let points = self.geometry_node(&path)?.point_count();
        Ok(json!({
            "path": path,
            "point_count": points,
            "primitive_count": points / 2,
            "vertex_count": points,
            "attributes": { "point": ["P"], "primitive": [], "vertex": [], "detail": [] },
        }))
    }

    fn attrib_read(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let attrib = text(payload, "attrib_name")?;
        let class = opt_text(payload, "attrib_class").unwrap_or_else(|| "point".into());
        let total = self.geometry_node(&path)?.point_count();
        if attrib != "P" || class != "point" {
            return Err(EngineError::NotFound(format!(
                "{class} attribute `{attrib}` not found on {path}"
            )));
        }
        let start = integer(payload, "start", 0)?;
        let count = integer(payload, "count", -1)?;
        if start < 0 || start > total {
            return Err(EngineError::InvalidArgument(format!(
                "start {start} is outside 0..={total}"
            )));
        }
        let end = if count < 0 { total } else { (start + count).min(total) };
        let values: Vec<Value> = (start..end).map(|i| json!([i as f64, 0.0, 0.0])).collect();
        Ok(json!({
            "path": path,
            "attrib_name": attrib,
            "attrib_class": class,
            "start": start,
            "count": values.len(),
            "values": values,
        }))
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    fn aov_list(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let node = self.node(&path)?;
        let mut aovs: Vec<Value> = node
            .parameters
            .get("aovs")
            .and_then(Value::as_str)
            .unwrap_or("")
            .split_whitespace()
            .map(aov_entry)
            .collect();
        if aovs.is_empty() && node.category == "Driver" {
            aovs.push(json!({
                "aov_name": "beauty",
                "aov_type": "BEAUTY",
                "data_type": "color3f",
                "format": "float16",
                "source": "builtin",
            }));
        }
        Ok(json!({ "path": path, "count": aovs.len(), "aovs": aovs }))
    }

    fn camera_get(&self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let node = self.node(&path)?;
        if node.node_type != "cam" {
            return Err(EngineError::InvalidArgument(format!(
                "{path} is a {} node, not a camera",
                node.node_type
            )));
        }
        let parm = |name: &str| node.parameters.get(name).cloned().unwrap_or(Value::Null);
        let translate: Vec<f64> = parm("t")
            .as_array()
            .map(|t| t.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_else(|| vec![0.0; 3]);
        // Row-major with translation in the last row. Rotation is not composed in.
        let mut world_matrix = [[0.0; 4]; 4];
        for (i, row) in world_matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        for (col, value) in translate.iter().take(3).enumerate() {
            world_matrix[3][col] = *value;
        }
        Ok(json!({
            "path": path,
            "resolution": [parm("resx"), parm("resy")],
            "focal_length": parm("focal"),
            "aperture": parm("aperture"),
            "near_clip": parm("near"),
            "far_clip": parm("far"),
            "transform": {
                "translate": translate,
                "rotate": parm("r"),
                "world_matrix": world_matrix,
            },
        }))
    }

    fn unique_name(&self, parent: &str, base: &str) -> String {
        (1..)
            .map(|n| format!("{base}{n}"))
            .find(|name| !self.scene.nodes.contains_key(&join(parent, name)))
            .unwrap_or_else(|| base.to_string())
    }

    fn insert_node(
        &mut self,
        parent: &str,
        node_type: &str,
        name: Option<String>,
    ) -> Result<String, EngineError> {
        self.node(parent)?;
        let node = SimNode::new(node_type, &self.scene.hdas).ok_or_else(|| {
            EngineError::InvalidArgument(format!("unknown node type `{node_type}`"))
        })?;
        let name = match name {
            Some(name) => {
                validate_name(&name)?;
                name
            }
            None => self.unique_name(parent, node_type),
        };
        let path = join(parent, &name);
        if self.scene.nodes.contains_key(&path) {
            return Err(EngineError::InvalidArgument(format!(
                "a node named `{name}` already exists under {parent}"
            )));
        }
        self.scene.nodes.insert(path.clone(), node);
        Ok(path)
    }

    fn create_node(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let node_type = text(payload, "type")?;
        let parent = opt_text(payload, "parent").unwrap_or_else(|| "/obj".into());
        let path = self.insert_node(&parent, &node_type, opt_text(payload, "name"))?;
        if let Some(Value::Array(pos)) = payload.get("position")
            && let [Some(x), Some(y)] = [pos.first(), pos.get(1)].map(|v| v.and_then(Value::as_f64))
            && let Some(node) = self.scene.nodes.get_mut(&path)
        {
            node.position = [x, y];
        }
        Ok(json!({ "path": path, "name": name_of(&path), "type": node_type }))
    }

    fn delete_node(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        if path == "/" {
            return Err(EngineError::InvalidArgument("cannot delete the root".into()));
        }
        self.node(&path)?;
        self.scene.nodes.retain(|p, _| !within(p, &path));
        for node in self.scene.nodes.values_mut() {
            node.inputs.retain(|_, wire| !within(&wire.from, &path));
        }
        Ok(json!({ "deleted": path }))
    }

    fn rename_node(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let name = text(payload, "name")?;
        validate_name(&name)?;
        self.node(&path)?;
        let parent = parent_of(&path)
            .ok_or_else(|| EngineError::InvalidArgument("cannot rename the root".into()))?;
        let new_path = join(parent, &name);
        if new_path == path {
            return Ok(json!({ "path": path, "old_path": path }));
        }
        if self.scene.nodes.contains_key(&new_path) {
            return Err(EngineError::InvalidArgument(format!(
                "a node named `{name}` already exists under {parent}"
            )));
        }
        let moved: Vec<String> = self
            .scene
            .nodes
            .keys()
            .filter(|p| within(p, &path))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = self.scene.nodes.remove(&old) {
                self.scene.nodes.insert(reparent(&old, &path, &new_path), node);
            }
        }
        for node in self.scene.nodes.values_mut() {
            for wire in node.inputs.values_mut() {
                if within(&wire.from, &path) {
                    wire.from = reparent(&wire.from, &path, &new_path);
                }
            }
        }
        Ok(json!({ "path": new_path, "old_path": path }))
    }

    fn connect(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let from = text(payload, "from")?;
        let to = text(payload, "to")?;
        let input = index(payload, "input")?;
        let output = index(payload, "output")?;
        if from == to {
            return Err(EngineError::InvalidArgument("cannot wire a node to itself".into()));
        }
        self.node(&from)?;
        self.node_mut(&to)?.inputs.insert(
            input,
            Wire {
                from: from.clone(),
                output,
            },
        );
        Ok(json!({ "from": from, "to": to, "input": input, "output": output }))
    }

    fn disconnect(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let input = index(payload, "input")?;
        let previous = self.node_mut(&path)?.inputs.remove(&input);
        Ok(json!({
            "path": path,
            "input": input,
            "disconnected": previous.map(|w| w.from),
        }))
    }

    fn set_flag(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let flag = text(payload, "flag")?;
        if !FLAGS.contains(&flag.as_str()) {
            return Err(EngineError::InvalidArgument(format!("unknown flag `{flag}`")));
        }
        let value = boolean(payload, "value", true);
        self.node_mut(&path)?.flags.insert(flag.clone(), value);
        Ok(json!({ "path": path, "flag": flag, "value": value }))
    }

    fn layout_children(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        self.node(&path)?;
        let mut count = 0;
        for (p, node) in self.scene.nodes.iter_mut() {
            if parent_of(p) == Some(path.as_str()) {
                node.position = [0.0, -(count as f64)];
                count += 1;
            }
        }
        Ok(json!({ "path": path, "count": count }))
    }

    fn parameter_mut(&mut self, path: &str, name: &str) -> Result<&mut SimNode, EngineError> {
        let node = self.node_mut(path)?;
        if !node.parameters.contains_key(name) {
            return Err(EngineError::NotFound(format!(
                "parameter `{name}` not found on {path}"
            )));
        }
        Ok(node)
    }

    fn set_parameter(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let name = text(payload, "name")?;
        let value = payload
            .get("value")
            .cloned()
            .ok_or_else(|| EngineError::InvalidArgument("missing argument `value`".into()))?;
        let node = self.parameter_mut(&path, &name)?;
        if let Some(current) = node.parameters.get(&name)
            && !compatible(current, &value)
        {
            return Err(EngineError::InvalidArgument(format!(
                "type mismatch for `{name}`: expected {}",
                parm_kind(current)
            )));
        }
        node.expressions.remove(&name);
        node.parameters.insert(name.clone(), value.clone());
        Ok(json!({ "path": path, "name": name, "value": value }))
    }

    fn set_expression(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let name = text(payload, "name")?;
        let expression = text(payload, "expression")?;
        let language = opt_text(payload, "language").unwrap_or_else(|| "hscript".into());
        let node = self.parameter_mut(&path, &name)?;
        node.expressions.insert(name.clone(), expression.clone());
        Ok(json!({ "path": path, "name": name, "expression": expression, "language": language }))
    }

    fn revert_parameter(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let name = text(payload, "name")?;
        let node = self.parameter_mut(&path, &name)?;
        let default = node.defaults.get(&name).cloned().unwrap_or(Value::Null);
        node.expressions.remove(&name);
        node.parameters.insert(name.clone(), default.clone());
        Ok(json!({ "path": path, "name": name, "value": default }))
    }

    fn set_frame(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let frame = payload
            .get("frame")
            .and_then(Value::as_f64)
            .ok_or_else(|| EngineError::InvalidArgument("`frame` must be a number".into()))?;
        self.scene.frame = frame;
        Ok(json!({ "frame": frame }))
    }

    fn scene_save(&mut self, payload: &Value) -> Value {
        if let Some(file) = opt_text(payload, "file") {
            self.scene.file = file;
        }
        self.scene.saves += 1;
        json!({ "file": self.scene.file, "saved": true })
    }

    fn export_geometry(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        let format = opt_text(payload, "format").unwrap_or_else(|| "obj".into());
        self.geometry_node(&path)?;
        let output = opt_text(payload, "output")
            .unwrap_or_else(|| format!("$HIP/export/{}.{format}", name_of(&path)));
        self.scene.exports.push(output.clone());
        Ok(json!({ "path": path, "format": format, "output": output }))
    }

    fn render_snapshot(&mut self, payload: &Value) -> Value {
        let mode = opt_text(payload, "mode").unwrap_or_else(|| "viewport".into());
        let output = opt_text(payload, "output").unwrap_or_else(|| {
            format!("$HIP/render/snapshot_{}.png", self.scene.snapshots.len() + 1)
        });
        let resolution = payload.get("resolution").cloned().unwrap_or(json!([1920, 1080]));
        self.scene.snapshots.push(output.clone());
        json!({ "mode": mode, "output": output, "resolution": resolution })
    }

    fn render_flipbook(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let range = payload
            .get("frame_range")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_f64).collect::<Vec<_>>())
            .unwrap_or_default();
        let &[start, end] = range.as_slice() else {
            return Err(EngineError::InvalidArgument(
                "`frame_range` must be [start, end]".into(),
            ));
        };
        if end < start {
            return Err(EngineError::InvalidArgument(format!(
                "frame range {start}..{end} is empty"
            )));
        }
        let output = opt_text(payload, "output").unwrap_or_else(|| {
            format!("$HIP/flipbook/flipbook_{}.$F4.png", self.scene.snapshots.len() + 1)
        });
        let resolution = payload.get("resolution").cloned().unwrap_or(json!([1920, 1080]));
        self.scene.snapshots.push(output.clone());
        Ok(json!({
            "output": output,
            "frame_range": [start, end],
            "frames": (end - start).floor() as i64 + 1,
            "resolution": resolution,
        }))
    }

    fn dirty_cook(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let path = text(payload, "path")?;
        self.node(&path)?;
        let dirtied = if boolean(payload, "dirty_all", false) {
            self.scene.nodes.keys().filter(|p| within(p, &path)).count()
        } else {
            1
        };
        self.scene.dirty_generation += 1;
        Ok(json!({ "path": path, "dirtied": dirtied }))
    }

    fn lop_import(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let parent = text(payload, "path")?;
        let file = text(payload, "file")?;
        let method = opt_text(payload, "method").unwrap_or_else(|| "reference".into());
        if !matches!(method.as_str(), "reference" | "sublayer") {
            return Err(EngineError::InvalidArgument(format!(
                "unknown import method `{method}`"
            )));
        }
        let category = &self.node(&parent)?.category;
        if category != "LopNet" && category != "Lop" {
            return Err(EngineError::InvalidArgument(format!(
                "{parent} is not a LOP network"
            )));
        }
        let stem = file
            .rsplit('/')
            .next()
            .and_then(|f| f.split('.').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("layer");
        let prim_path = opt_text(payload, "prim_path").unwrap_or_else(|| format!("/{stem}"));
        let path = self.insert_node(&parent, &method, None)?;
        if let Some(node) = self.scene.nodes.get_mut(&path) {
            node.parameters.insert("filepath1".into(), json!(file));
            node.layer = Some(Layer {
                file: file.clone(),
                method: method.clone(),
                prim_path: prim_path.clone(),
            });
        }
        Ok(json!({ "path": path, "file": file, "method": method, "prim_path": prim_path }))
    }

    fn hda_create(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let node_path = text(payload, "node_path")?;
        let name = text(payload, "name")?;
        let label = text(payload, "label")?;
        let file_path = text(payload, "file_path")?;
        let category = self.node(&node_path)?.category.clone();
        validate_name(&name)?;
        if self.scene.hdas.contains_key(&name) || SimNode::new(&name, &BTreeMap::new()).is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "node type `{name}` already exists"
            )));
        }
        let def = HdaDefinition {
            node_type: name.clone(),
            label,
            category,
            file_path,
            version: opt_text(payload, "version").unwrap_or_else(|| "1.0".into()),
        };
        let json = def.to_json();
        self.scene.hdas.insert(name, def);
        Ok(json)
    }

    fn hda_install(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let file_path = text(payload, "file_path")?;
        let mut names: Vec<String> = self
            .scene
            .hdas
            .values()
            .filter(|d| d.file_path == file_path)
            .map(|d| d.node_type.clone())
            .collect();
        if names.is_empty() {
            let stem = file_path
                .rsplit('/')
                .next()
                .and_then(|f| f.split('.').next())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| EngineError::InvalidArgument(format!("bad HDA file `{file_path}`")))?
                .to_string();
            self.scene.hdas.insert(
                stem.clone(),
                HdaDefinition {
                    node_type: stem.clone(),
                    label: stem.clone(),
                    category: "Sop".into(),
                    file_path: file_path.clone(),
                    version: "1.0".into(),
                },
            );
            names.push(stem);
        }
        Ok(json!({ "file_path": file_path, "definitions": names }))
    }

    fn hda_reload(&mut self, payload: &Value) -> Result<Value, EngineError> {
        let file_path = opt_text(payload, "file_path");
        let reloaded = self
            .scene
            .hdas
            .values()
            .filter(|d| file_path.as_deref().is_none_or(|f| d.file_path == f))
            .count();
        if let Some(file) = &file_path
            && reloaded == 0
        {
            return Err(EngineError::NotFound(format!("no HDA loaded from {file}")));
        }
        Ok(json!({ "reloaded": reloaded }))
    }

    // ── Jobs ─────────────────────────────────────────────────────────────────

    fn start_job(&mut self, kind: SimJobKind, payload: &Value) -> Result<Value, EngineError> {
        let target = text(payload, "target")?;
        self.node(&target)?;
        let total = match kind {
            SimJobKind::Cook => {
                let items: i64 = self
                    .children(&target)
                    .iter()
                    .filter_map(|(_, n)| n.parameters.get("itemcount").and_then(Value::as_i64))
                    .sum();
                if items > 0 { items as u64 } else { 4 }
            }
            SimJobKind::Render | SimJobKind::Inference => 4,
        };
        let prefix = match kind {
            SimJobKind::Cook => "cook",
            SimJobKind::Render => "render",
            SimJobKind::Inference => "infer",
        };
        let seq = self.next_handle;
        let handle = format!("{prefix}-{seq}");
        self.next_handle += 1;
        self.jobs.insert(
            handle.clone(),
            SimJob {
                seq,
                kind,
                target: target.clone(),
                total,
                done: 0,
                state: SimJobState::Running,
                cancel_requested: false,
            },
        );
        Ok(json!({ "handle": handle, "target": target }))
    }

    fn job_mut(&mut self, kind: SimJobKind, payload: &Value) -> Result<&mut SimJob, EngineError> {
        let handle = text(payload, "handle")?;
        self.jobs
            .get_mut(&handle)
            .filter(|j| j.kind == kind)
            .ok_or_else(|| EngineError::NotFound(format!("no job with handle {handle}")))
    }

    fn job_status(&mut self, kind: SimJobKind, payload: &Value) -> Result<Value, EngineError> {
        let ignore_cancel = self.ignore_cancel;
        let failing = self.failing_targets.clone();
        let job = self.job_mut(kind, payload)?;
        let was_running = job.state == SimJobState::Running;

        if job.state == SimJobState::Running {
            if job.cancel_requested && !ignore_cancel {
                job.state = SimJobState::Cancelled;
            } else {
                job.done += 1;
                if failing.contains(&job.target) && job.done * 2 >= job.total {
                    job.state = SimJobState::Failed(format!(
                        "work item {} failed while cooking {}",
                        job.done, job.target
                    ));
                } else if job.done >= job.total {
                    job.state = SimJobState::Succeeded;
                }
            }
        }
        let job = job.clone();
        if kind == SimJobKind::Cook && was_running && job.state == SimJobState::Succeeded {
            self.push_event("cook_complete", "node", &job.target);
        }

        if kind == SimJobKind::Cook {
            let failed = u64::from(matches!(job.state, SimJobState::Failed(_)));
            let success = job.done - failed;
            let cooking = u64::from(job.state == SimJobState::Running);
            let cancelled = if job.state == SimJobState::Cancelled {
                job.total - job.done
            } else {
                0
            };
            let waiting = job.total - job.done - cancelled - cooking.min(job.total - job.done);
            let cook_state = match &job.state {
                SimJobState::Running => "cooking",
                SimJobState::Succeeded => "cooked",
                SimJobState::Failed(_) => "failed",
                SimJobState::Cancelled => "cancelled",
            };
            let mut status = json!({
                "cook_state": cook_state,
                "target": job.target,
                "work_item_counts": {
                    "waiting": waiting,
                    "uncooked": 0,
                    "cooking": cooking,
                    "cooked": success,
                    "success": success,
                    "failed": failed,
                    "cancelled": cancelled,
                    "total": job.total,
                },
            });
            if let SimJobState::Failed(err) = &job.state {
                status["error"] = json!(err);
            }
            return Ok(status);
        }

        let progress = job.done as f64 / job.total as f64;
        let mut status = json!({ "state": "running", "progress": progress });
        match &job.state {
            SimJobState::Running => {}
            SimJobState::Succeeded => {
                status["state"] = json!("succeeded");
                status["result"] = match kind {
                    SimJobKind::Render => json!({
                        "output": format!("$HIP/render/{}.exr", name_of(&job.target)),
                        "frames": job.total,
                    }),
                    _ => json!({ "target": job.target, "steps": job.total }),
                };
            }
            SimJobState::Failed(err) => {
                status["state"] = json!("failed");
                status["error"] = json!(err);
            }
            SimJobState::Cancelled => status["state"] = json!("cancelled"),
        }
        Ok(status)
    }

    fn cancel_job(&mut self, kind: SimJobKind, payload: &Value) -> Result<Value, EngineError> {
        let job = self.job_mut(kind, payload)?;
        job.cancel_requested = true;
        Ok(json!({ "cancelling": job.state == SimJobState::Running }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn call(engine: &SimulatedEngine, route: Route, payload: Value) -> Result<Value, EngineError> {
        engine.call(route, &payload).await
    }

    #[tokio::test]
    async fn create_then_delete_restores_children() {
        let engine = SimulatedEngine::new();
        let before = engine.scene().await;

        let created = call(&engine, Route::CreateNode, json!({"type": "sphere", "parent": "/obj/geo1"}))
            .await
            .unwrap();
        assert_eq!(created["path"], "/obj/geo1/sphere1");
        call(&engine, Route::DeleteNode, json!({"path": "/obj/geo1/sphere1"}))
            .await
            .unwrap();

        assert_eq!(engine.scene().await, before);
    }

    #[tokio::test]
    async fn unique_names_count_up() {
        let engine = SimulatedEngine::new();
        for expected in ["/obj/geo1/box1", "/obj/geo1/box2"] {
            let created = call(&engine, Route::CreateNode, json!({"type": "box", "parent": "/obj/geo1"}))
                .await
                .unwrap();
            assert_eq!(created["path"], expected);
        }
    }

    #[tokio::test]
    async fn unknown_type_and_duplicate_name_are_rejected() {
        let engine = SimulatedEngine::new();
        let err = call(&engine, Route::CreateNode, json!({"type": "teapot", "parent": "/obj/geo1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let err = call(&engine, Route::CreateNode, json!({"type": "geo", "parent": "/obj", "name": "geo1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn rename_moves_subtree_and_wires() {
        let engine = SimulatedEngine::new();
        for node_type in ["sphere", "scatter"] {
            call(&engine, Route::CreateNode, json!({"type": node_type, "parent": "/obj/geo1"}))
                .await
                .unwrap();
        }
        call(
            &engine,
            Route::Connect,
            json!({"from": "/obj/geo1/sphere1", "to": "/obj/geo1/scatter1", "input": 0}),
        )
        .await
        .unwrap();

        let renamed = call(&engine, Route::RenameNode, json!({"path": "/obj/geo1", "name": "rock"}))
            .await
            .unwrap();
        assert_eq!(renamed["path"], "/obj/rock");

        let scene = engine.scene().await;
        assert!(scene.nodes.contains_key("/obj/rock/sphere1"));
        assert!(!scene.nodes.contains_key("/obj/geo1"));
        assert_eq!(
            scene.nodes["/obj/rock/scatter1"].inputs[&0].from,
            "/obj/rock/sphere1"
        );
    }

    #[tokio::test]
    async fn set_parameter_checks_type() {
        let engine = SimulatedEngine::new();
        call(&engine, Route::CreateNode, json!({"type": "scatter", "parent": "/obj/geo1"}))
            .await
            .unwrap();

        let err = call(
            &engine,
            Route::SetParameter,
            json!({"path": "/obj/geo1/scatter1", "name": "npts", "value": "many"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let err = call(
            &engine,
            Route::SetParameter,
            json!({"path": "/obj/geo1/scatter1", "name": "nope", "value": 1}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn revert_restores_default_and_clears_expression() {
        let engine = SimulatedEngine::new();
        call(&engine, Route::CreateNode, json!({"type": "scatter", "parent": "/obj/geo1"}))
            .await
            .unwrap();
        let path = "/obj/geo1/scatter1";
        call(&engine, Route::SetParameter, json!({"path": path, "name": "npts", "value": 42}))
            .await
            .unwrap();
        call(
            &engine,
            Route::SetExpression,
            json!({"path": path, "name": "npts", "expression": "$F * 10"}),
        )
        .await
        .unwrap();

        let reverted = call(&engine, Route::RevertParameter, json!({"path": path, "name": "npts"}))
            .await
            .unwrap();
        assert_eq!(reverted["value"], 1000);
        let scene = engine.scene().await;
        assert!(scene.nodes[path].expressions.is_empty());
    }

    #[tokio::test]
    async fn cook_job_advances_per_poll() {
        let engine = SimulatedEngine::new();
        let started = call(&engine, Route::StartCook, json!({"target": "/obj/topnet1"}))
            .await
            .unwrap();
        let handle = started["handle"].as_str().unwrap().to_string();

        let mut last = String::new();
        for _ in 0..4 {
            let status = call(&engine, Route::CookJobStatus, json!({"handle": handle}))
                .await
                .unwrap();
            assert_eq!(status["work_item_counts"]["total"], 4);
            last = status["cook_state"].as_str().unwrap().to_string();
        }
        assert_eq!(last, "cooked");
    }

    #[tokio::test]
    async fn failing_target_fails_midway() {
        let engine = SimulatedEngine::new();
        engine.fail_jobs_on("/out/karma1").await;
        let started = call(&engine, Route::StartRender, json!({"target": "/out/karma1"}))
            .await
            .unwrap();
        let handle = started["handle"].clone();

        let first = call(&engine, Route::RenderJobStatus, json!({"handle": handle}))
            .await
            .unwrap();
        assert_eq!(first["state"], "running");
        let second = call(&engine, Route::RenderJobStatus, json!({"handle": handle}))
            .await
            .unwrap();
        assert_eq!(second["state"], "failed");
        assert!(second["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn cancel_is_observed_on_next_poll() {
        let engine = SimulatedEngine::new();
        let started = call(&engine, Route::StartInference, json!({"target": "/obj/geo1"}))
            .await
            .unwrap();
        let handle = started["handle"].clone();
        call(&engine, Route::CancelInference, json!({"handle": handle}))
            .await
            .unwrap();
        let status = call(&engine, Route::InferenceJobStatus, json!({"handle": handle}))
            .await
            .unwrap();
        assert_eq!(status["state"], "cancelled");
    }

    #[tokio::test]
    async fn fail_next_is_one_shot() {
        let engine = SimulatedEngine::new();
        engine
            .fail_next(Route::Ping, EngineError::Busy("cooking".into()))
            .await;
        assert!(call(&engine, Route::Ping, json!({})).await.is_err());
        assert!(call(&engine, Route::Ping, json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn lop_import_creates_layer_node() {
        let engine = SimulatedEngine::new();
        let imported = call(
            &engine,
            Route::LopImport,
            json!({"path": "/stage", "file": "/assets/tree.usd", "method": "sublayer"}),
        )
        .await
        .unwrap();
        assert_eq!(imported["path"], "/stage/sublayer1");
        assert_eq!(imported["prim_path"], "/tree");

        let info = call(&engine, Route::StageInfo, json!({"path": "/stage"})).await.unwrap();
        assert_eq!(info["prim_count"], 1);
        let prim = call(&engine, Route::PrimGet, json!({"path": "/stage", "prim_path": "/tree"}))
            .await
            .unwrap();
        assert_eq!(prim["file"], "/assets/tree.usd");
    }

    #[tokio::test]
    async fn attrib_read_windows_points() {
        let engine = SimulatedEngine::new();
        call(&engine, Route::CreateNode, json!({"type": "scatter", "parent": "/obj/geo1"}))
            .await
            .unwrap();
        let read = call(
            &engine,
            Route::AttribRead,
            json!({"path": "/obj/geo1/scatter1", "attrib_name": "P", "start": 998, "count": 10}),
        )
        .await
        .unwrap();
        assert_eq!(read["count"], 2);
    }

    #[tokio::test]
    async fn search_patterns_use_segment_globs() {
        let engine = SimulatedEngine::new();
        let found = call(&engine, Route::SearchNodes, json!({"pattern": "geo*", "root": "/obj"}))
            .await
            .unwrap();
        assert_eq!(found["count"], 1);
        assert_eq!(found["matches"][0]["path"], "/obj/geo1");

        let err = call(&engine, Route::SearchNodes, json!({"pattern": "**a**b"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(ref m) if m.contains("invalid pattern")));
    }
    #[tokio::test]
    async fn camera_get_reports_lens_and_transform() {
        let engine = SimulatedEngine::new();
        call(&engine, Route::CreateNode, json!({"type": "cam", "parent": "/obj"}))
            .await
            .unwrap();
        call(
            &engine,
            Route::SetParameter,
            json!({"path": "/obj/cam1", "name": "t", "value": [1.0, 2.0, 3.0]}),
        )
        .await
        .unwrap();

        let cam = call(&engine, Route::CameraGet, json!({"path": "/obj/cam1"})).await.unwrap();
        assert_eq!(cam["resolution"], json!([1920, 1080]));
        assert_eq!(cam["focal_length"], json!(50.0));
        assert_eq!(cam["transform"]["world_matrix"][3], json!([1.0, 2.0, 3.0, 1.0]));
        assert_eq!(cam["transform"]["world_matrix"][0], json!([1.0, 0.0, 0.0, 0.0]));

        let err = call(&engine, Route::CameraGet, json!({"path": "/obj/geo1"})).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn aov_list_maps_known_passes() {
        let engine = SimulatedEngine::new();
        let beauty = call(&engine, Route::AovList, json!({"path": "/out/karma1"})).await.unwrap();
        assert_eq!(beauty["count"], 1);
        assert_eq!(beauty["aovs"][0]["aov_type"], "BEAUTY");

        call(
            &engine,
            Route::SetParameter,
            json!({"path": "/out/karma1", "name": "aovs", "value": "depth albedo fog"}),
        )
        .await
        .unwrap();
        let aovs = call(&engine, Route::AovList, json!({"path": "/out/karma1"})).await.unwrap();
        assert_eq!(aovs["count"], 3);
        assert_eq!(aovs["aovs"][0]["aov_type"], "DEPTH");
        assert_eq!(aovs["aovs"][1]["source"], "lpe");
        assert_eq!(aovs["aovs"][2]["aov_type"], "CUSTOM");

        let none = call(&engine, Route::AovList, json!({"path": "/obj/geo1"})).await.unwrap();
        assert_eq!(none["count"], 0);
    }

    #[tokio::test]
    async fn scene_events_drain_in_order() {
        let engine = SimulatedEngine::new();
        call(&engine, Route::CreateNode, json!({"type": "box", "parent": "/obj/geo1"}))
            .await
            .unwrap();
        call(&engine, Route::SetFrame, json!({"frame": 12})).await.unwrap();
        call(&engine, Route::DeleteNode, json!({"path": "/obj/missing"}))
            .await
            .unwrap_err();

        let drained = call(&engine, Route::SceneEvents, json!({})).await.unwrap();
        assert_eq!(drained["count"], 2);
        assert_eq!(drained["events"][0]["event_type"], "node_created");
        assert_eq!(drained["events"][0]["path"], "/obj/geo1/box1");
        assert_eq!(drained["events"][1]["event_type"], "frame_changed");
        assert_eq!(drained["events"][1]["scope"], "scene");

        let again = call(&engine, Route::SceneEvents, json!({})).await.unwrap();
        assert_eq!(again["count"], 0);
    }

    #[tokio::test]
    async fn finished_cook_queues_cook_complete() {
        let engine = SimulatedEngine::new();
        let started = call(&engine, Route::StartCook, json!({"target": "/obj/topnet1"}))
            .await
            .unwrap();
        for _ in 0..6 {
            call(&engine, Route::CookJobStatus, json!({"handle": started["handle"]}))
                .await
                .unwrap();
        }
        let drained = call(&engine, Route::SceneEvents, json!({})).await.unwrap();
        let completions: Vec<&Value> = drained["events"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["event_type"] == "cook_complete")
            .collect();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0]["path"], "/obj/topnet1");
    }

    #[tokio::test]
    async fn flipbook_needs_an_ordered_range() {
        let engine = SimulatedEngine::new();
        let book = call(&engine, Route::RenderFlipbook, json!({"frame_range": [1, 24]}))
            .await
            .unwrap();
        assert_eq!(book["frames"], 24);
        assert_eq!(book["resolution"], json!([1920, 1080]));
        assert_eq!(engine.scene().await.snapshots.len(), 1);

        let err = call(&engine, Route::RenderFlipbook, json!({"frame_range": [10, 1]}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        let err = call(&engine, Route::RenderFlipbook, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
