use std::fmt;

use glob::{MatchOptions, Pattern, PatternError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// A normalized, absolute address inside the engine's graph.
///
/// Paths are opaque to the bridge beyond their `/`-separated structure. They
/// are not stable across renames, so nothing holds on to one longer than a
/// single call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityPath(String);

impl EntityPath {
    pub fn root() -> Self {
        Self("/".into())
    }

    /// Parse an absolute path, collapsing redundant separators.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let trimmed = raw.trim();
        if !trimmed.starts_with('/') {
            return Err(BridgeError::InvalidArgument(format!(
                "expected an absolute path, got `{raw}`"
            )));
        }
        Self::from_segments(Vec::new(), trimmed)
    }

    /// Resolve `raw` against `cwd` when it is relative.
    pub fn resolve(raw: &str, cwd: &EntityPath) -> Result<Self, BridgeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::InvalidArgument("empty path".into()));
        }
        if trimmed.starts_with('/') {
            return Self::parse(trimmed);
        }
        Self::from_segments(cwd.segments().map(str::to_string).collect(), trimmed)
    }

    /// Normalize a prim path. Prim paths live in the stage namespace and are
    /// never looked up in the node graph, so a missing leading `/` is implied.
    pub fn prim(raw: &str) -> Result<Self, BridgeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::InvalidArgument("empty prim path".into()));
        }
        Self::from_segments(Vec::new(), trimmed)
    }

    fn from_segments(mut segments: Vec<String>, raw: &str) -> Result<Self, BridgeError> {
        for segment in raw.split('/') {
            match segment.trim() {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(BridgeError::InvalidArgument(format!(
                            "path `{raw}` escapes the root"
                        )));
                    }
                }
                name => segments.push(name.to_string()),
            }
        }
        Ok(Self(format!("/{}", segments.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, empty for the root.
    pub fn name(&self) -> &str {
        self.segments().last().unwrap_or("")
    }

    pub fn parent(&self) -> Option<EntityPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    pub fn join(&self, name: &str) -> EntityPath {
        if self.is_root() {
            Self(format!("/{name}"))
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }

    /// True when `self` is `other` or lies underneath it.
    pub fn is_within(&self, other: &EntityPath) -> bool {
        other.is_root() || self.0 == other.0 || self.0.starts_with(&format!("{}/", other.0))
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node as the engine reported it during one adapter call.
///
/// Handles are never cached: the adapter produces them under the engine lock
/// and they are dropped when that call returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityHandle {
    pub path: EntityPath,
    #[serde(rename = "type")]
    pub node_type: String,
    pub category: String,
}

impl EntityHandle {
    pub fn from_engine(value: &Value, requested: &EntityPath) -> Result<Self, BridgeError> {
        let path = match value.get("path").and_then(Value::as_str) {
            Some(raw) => EntityPath::parse(raw)?,
            None => requested.clone(),
        };
        Ok(Self {
            path,
            node_type: value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            category: value
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// A name or path glob where `*` and `?` stay within one segment and a
/// whole-segment `**` crosses any number of them.
#[derive(Debug, Clone)]
pub struct PathGlob(Pattern);

const SEGMENT_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl PathGlob {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Pattern::new(pattern).map(Self)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.0.matches_with(text, SEGMENT_MATCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_collapses_separators() {
        let path = EntityPath::parse("  //obj///geo1/ ").unwrap();
        assert_eq!(path.as_str(), "/obj/geo1");
        assert_eq!(EntityPath::parse("/").unwrap(), EntityPath::root());
    }

    #[test]
    fn parse_rejects_relative() {
        assert!(matches!(
            EntityPath::parse("obj/geo1"),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn resolve_relative_against_cwd() {
        let cwd = EntityPath::parse("/obj/geo1").unwrap();
        assert_eq!(
            EntityPath::resolve("sphere1", &cwd).unwrap().as_str(),
            "/obj/geo1/sphere1"
        );
        assert_eq!(
            EntityPath::resolve("../topnet1", &cwd).unwrap().as_str(),
            "/obj/topnet1"
        );
        assert_eq!(
            EntityPath::resolve("/stage", &cwd).unwrap().as_str(),
            "/stage"
        );
    }

    #[test]
    fn resolve_rejects_escape_and_empty() {
        let cwd = EntityPath::root();
        assert!(EntityPath::resolve("..", &cwd).is_err());
        assert!(EntityPath::resolve("   ", &cwd).is_err());
    }

    #[test]
    fn prim_paths_are_made_absolute() {
        assert_eq!(EntityPath::prim("World/geo").unwrap().as_str(), "/World/geo");
    }

    #[test]
    fn parent_name_and_join() {
        let path = EntityPath::parse("/obj/geo1").unwrap();
        assert_eq!(path.name(), "geo1");
        assert_eq!(path.parent().unwrap().as_str(), "/obj");
        assert_eq!(path.parent().unwrap().parent().unwrap(), EntityPath::root());
        assert!(EntityPath::root().parent().is_none());
        assert_eq!(EntityPath::root().join("obj").as_str(), "/obj");
        assert_eq!(path.join("box1").as_str(), "/obj/geo1/box1");
    }

    #[test]
    fn is_within_respects_segment_boundaries() {
        let geo1 = EntityPath::parse("/obj/geo1").unwrap();
        let geo10 = EntityPath::parse("/obj/geo10").unwrap();
        let child = EntityPath::parse("/obj/geo1/sphere1").unwrap();
        assert!(child.is_within(&geo1));
        assert!(geo1.is_within(&geo1));
        assert!(!geo10.is_within(&geo1));
        assert!(geo10.is_within(&EntityPath::root()));
    }

    fn glob(pattern: &str) -> PathGlob {
        PathGlob::new(pattern).unwrap()
    }

    #[test]
    fn glob_single_and_double_star() {
        assert!(glob("sphere*").matches("sphere12"));
        assert!(!glob("sphere*").matches("box1"));
        assert!(glob("*").matches("anything"));
        assert!(glob("/World/*").matches("/World/geo"));
        assert!(!glob("/World/*").matches("/World/geo/mesh"));
        assert!(glob("/**").matches("/World/geo/mesh"));
        assert!(glob("/World/**/mesh").matches("/World/geo/a/mesh"));
        assert!(glob("geo?").matches("geo1"));
        assert!(!glob("geo?").matches("geo/"));
    }

    #[test]
    fn glob_rejects_partial_recursive_segments() {
        assert!(PathGlob::new("**a**a**a**a**a**a**a**a**ab").is_err());
        assert!(PathGlob::new("[abc").is_err());
    }

    #[test]
    fn glob_stays_fast_on_many_stars() {
        let pattern = glob(&format!("{}b", "*a".repeat(12)));
        let text = "a".repeat(40);
        let started = std::time::Instant::now();
        assert!(!pattern.matches(&text));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn handle_from_engine_payload() {
        let requested = EntityPath::parse("/obj/geo1").unwrap();
        let handle = EntityHandle::from_engine(
            &serde_json::json!({"path": "/obj/geo1", "type": "geo", "category": "Object"}),
            &requested,
        )
        .unwrap();
        assert_eq!(handle.node_type, "geo");
        assert_eq!(handle.category, "Object");
        assert_eq!(handle.path, requested);
    }
}
