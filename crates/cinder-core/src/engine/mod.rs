//! Engine-facing side of the bridge.
//!
//! [`EngineBackend`] is the transport seam: the HTTP client in
//! `cinder-engine` and the in-memory [`SimulatedEngine`] both implement it.
//! [`EngineAdapter`] wraps a backend with the single mutual-exclusion
//! boundary every engine call passes through.

pub mod adapter;
pub mod sim;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::EngineError;

pub use adapter::{EngineAdapter, EngineSession};
pub use sim::SimulatedEngine;

/// Transport to one engine instance.
///
/// Implementations must not retry internally. Read routes must leave the
/// engine's graph untouched.
pub trait EngineBackend: Send + Sync {
    fn name(&self) -> &str;

    fn call<'a>(
        &'a self,
        route: Route,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Every endpoint of the engine-facing control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Ping,
    SceneInfo,
    ResolveNode,
    GetNode,
    ListChildren,
    NodeTree,
    SearchNodes,
    GetParameter,
    ParameterTemplate,
    CookStatus,
    WorkItems,
    StageInfo,
    PrimGet,
    LayerInfo,
    PrimSearch,
    HdaList,
    HdaGet,
    GeoInfo,
    AttribRead,
    AovList,
    CameraGet,
    SceneEvents,
    CreateNode,
    DeleteNode,
    RenameNode,
    Connect,
    Disconnect,
    SetFlag,
    LayoutChildren,
    SetParameter,
    SetExpression,
    RevertParameter,
    SetFrame,
    SceneSave,
    ExportGeometry,
    RenderSnapshot,
    RenderFlipbook,
    DirtyCook,
    LopImport,
    HdaCreate,
    HdaInstall,
    HdaReload,
    StartCook,
    CookJobStatus,
    CancelCook,
    StartRender,
    RenderJobStatus,
    CancelRender,
    StartInference,
    InferenceJobStatus,
    CancelInference,
}

impl Route {
    pub const ALL: &'static [Route] = &[
        Route::Ping,
        Route::SceneInfo,
        Route::ResolveNode,
        Route::GetNode,
        Route::ListChildren,
        Route::NodeTree,
        Route::SearchNodes,
        Route::GetParameter,
        Route::ParameterTemplate,
        Route::CookStatus,
        Route::WorkItems,
        Route::StageInfo,
        Route::PrimGet,
        Route::LayerInfo,
        Route::PrimSearch,
        Route::HdaList,
        Route::HdaGet,
        Route::GeoInfo,
        Route::AttribRead,
        Route::AovList,
        Route::CameraGet,
        Route::SceneEvents,
        Route::CreateNode,
        Route::DeleteNode,
        Route::RenameNode,
        Route::Connect,
        Route::Disconnect,
        Route::SetFlag,
        Route::LayoutChildren,
        Route::SetParameter,
        Route::SetExpression,
        Route::RevertParameter,
        Route::SetFrame,
        Route::SceneSave,
        Route::ExportGeometry,
        Route::RenderSnapshot,
        Route::RenderFlipbook,
        Route::DirtyCook,
        Route::LopImport,
        Route::HdaCreate,
        Route::HdaInstall,
        Route::HdaReload,
        Route::StartCook,
        Route::CookJobStatus,
        Route::CancelCook,
        Route::StartRender,
        Route::RenderJobStatus,
        Route::CancelRender,
        Route::StartInference,
        Route::InferenceJobStatus,
        Route::CancelInference,
    ];

    pub fn endpoint(self) -> &'static str {
        match self {
            Route::Ping => "/ping",
            Route::SceneInfo => "/scene/info",
            Route::ResolveNode => "/node/resolve",
            Route::GetNode => "/node/get",
            Route::ListChildren => "/node/children",
            Route::NodeTree => "/node/tree",
            Route::SearchNodes => "/node/search",
            Route::GetParameter => "/parm/get",
            Route::ParameterTemplate => "/parm/template",
            Route::CookStatus => "/cook/status",
            Route::WorkItems => "/pdg/workitems",
            Route::StageInfo => "/lop/stage/info",
            Route::PrimGet => "/lop/prim/get",
            Route::LayerInfo => "/lop/layer/info",
            Route::PrimSearch => "/lop/prim/search",
            Route::HdaList => "/hda/list",
            Route::HdaGet => "/hda/get",
            Route::GeoInfo => "/extract/geo_info",
            Route::AttribRead => "/extract/attrib_read",
            Route::AovList => "/extract/aov_list",
            Route::CameraGet => "/extract/camera_get",
            Route::SceneEvents => "/extract/events",
            Route::CreateNode => "/node/create",
            Route::DeleteNode => "/node/delete",
            Route::RenameNode => "/node/rename",
            Route::Connect => "/node/connect",
            Route::Disconnect => "/node/disconnect",
            Route::SetFlag => "/node/flag",
            Route::LayoutChildren => "/node/layout",
            Route::SetParameter => "/parm/set",
            Route::SetExpression => "/parm/expression",
            Route::RevertParameter => "/parm/revert",
            Route::SetFrame => "/frame/set",
            Route::SceneSave => "/scene/save",
            Route::ExportGeometry => "/geo/export",
            Route::RenderSnapshot => "/render/snapshot",
            Route::RenderFlipbook => "/render/flipbook",
            Route::DirtyCook => "/pdg/dirty",
            Route::LopImport => "/lop/import",
            Route::HdaCreate => "/hda/create",
            Route::HdaInstall => "/hda/install",
            Route::HdaReload => "/hda/reload",
            Route::StartCook => "/pdg/cook",
            Route::CookJobStatus => "/pdg/status",
            Route::CancelCook => "/pdg/cancel",
            Route::StartRender => "/render/start",
            Route::RenderJobStatus => "/render/status",
            Route::CancelRender => "/render/cancel",
            Route::StartInference => "/inference/start",
            Route::InferenceJobStatus => "/inference/status",
            Route::CancelInference => "/inference/cancel",
        }
    }

    /// Reads use GET with query parameters, everything else POSTs a body.
    pub fn method(self) -> Method {
        if self.is_read() {
            Method::Get
        } else {
            Method::Post
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Route::Ping
                | Route::SceneInfo
                | Route::ResolveNode
                | Route::GetNode
                | Route::ListChildren
                | Route::NodeTree
                | Route::SearchNodes
                | Route::GetParameter
                | Route::ParameterTemplate
                | Route::CookStatus
                | Route::WorkItems
                | Route::StageInfo
                | Route::PrimGet
                | Route::LayerInfo
                | Route::PrimSearch
                | Route::HdaList
                | Route::HdaGet
                | Route::GeoInfo
                | Route::AttribRead
                | Route::AovList
                | Route::CameraGet
                | Route::SceneEvents
                | Route::CookJobStatus
                | Route::RenderJobStatus
                | Route::InferenceJobStatus
        )
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn endpoints_are_unique() {
        let endpoints: HashSet<&str> = Route::ALL.iter().map(|r| r.endpoint()).collect();
        assert_eq!(endpoints.len(), Route::ALL.len());
    }

    #[test]
    fn status_routes_are_reads() {
        assert_eq!(Route::CookJobStatus.method(), Method::Get);
        assert_eq!(Route::GetParameter.method(), Method::Get);
        assert_eq!(Route::SetParameter.method(), Method::Post);
        assert_eq!(Route::CancelCook.method(), Method::Post);
    }
}
