//! On-disk description of a routing graph.

use crate::error::Result;
use crate::handler::{HandlerId, Properties};
use crate::task::{DEFAULT_CAPACITY, Priority};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const PATCH_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default queue capacity for handlers running a task.
    pub queue_capacity: usize,
    /// Default priority of handler worker threads.
    pub priority: Priority,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_CAPACITY,
            priority: Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: HandlerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

/// A `tail -> head` edge. `source` optionally tags where the connection came from, e.g. the tool
/// that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub tail: HandlerId,
    pub head: HandlerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ConnectionSpec {
    pub fn new(tail: HandlerId, head: HandlerId) -> Self {
        Self {
            tail,
            head,
            source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub handlers: Vec<HandlerSpec>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
}

impl Patch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: PATCH_VERSION.to_string(),
            settings: Settings::default(),
            handlers: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn from_ron(text: &str) -> Result<Self> {
        Ok(ron::from_str(text)?)
    }

    pub fn to_ron(&self) -> Result<String> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }

    /// Writes the patch to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_ron()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let patch = Self::from_ron(&fs::read_to_string(path)?)?;
        if patch.version != PATCH_VERSION {
            tracing::warn!(
                path = %path.display(),
                version = %patch.version,
                "unexpected patch version"
            );
        }
        Ok(patch)
    }
}
