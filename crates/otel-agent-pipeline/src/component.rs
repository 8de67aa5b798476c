//! Component identity, lifecycle and host contract.

use crate::error::{ComponentError, IdError};
use crate::pipeline::Signal;
use crate::storage::StorageExtension;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const TYPE_SEPARATOR: char = '/';
const MAX_TYPE_LEN: usize = 63;

/// The type token of a component, such as `otlp` or `batch`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentType(String);

impl ComponentType {
    /// Validates and wraps a type token.
    ///
    /// A type starts with an ASCII letter, continues with ASCII letters, digits
    /// or underscores, and is at most 63 characters long.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the token is empty or malformed.
    pub fn new(ty: impl Into<String>) -> Result<Self, IdError> {
        let ty = ty.into();
        let mut chars = ty.chars();
        match chars.next() {
            None => return Err(IdError::EmptyType),
            Some(first) if !first.is_ascii_alphabetic() => return Err(IdError::InvalidType(ty)),
            Some(_) => {}
        }
        if ty.len() > MAX_TYPE_LEN || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(IdError::InvalidType(ty));
        }
        Ok(Self(ty))
    }

    /// Wraps a type token known at compile time.
    ///
    /// # Panics
    ///
    /// Panics if `ty` is not a valid type token.
    pub fn from_static(ty: &'static str) -> Self {
        match Self::new(ty) {
            Ok(ty) => ty,
            Err(e) => panic!("invalid component type {ty:?}: {e}"),
        }
    }

    /// Returns the token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ComponentType {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifies one configured component instance: `type` or `type/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentId {
    ty: ComponentType,
    name: Option<String>,
}

impl ComponentId {
    /// Creates an id with no name.
    pub fn new(ty: ComponentType) -> Self {
        Self { ty, name: None }
    }

    /// Creates an id with a name.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the name is empty or contains whitespace or
    /// control characters.
    pub fn with_name(ty: ComponentType, name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            ty,
            name: Some(name),
        })
    }

    /// Returns the component type.
    pub fn component_type(&self) -> &ComponentType {
        &self.ty
    }

    /// Returns the instance name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

fn validate_name(name: &str) -> Result<(), IdError> {
    if name.is_empty() {
        return Err(IdError::EmptyName);
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}{TYPE_SEPARATOR}{name}", self.ty),
            None => write!(f, "{}", self.ty),
        }
    }
}

impl FromStr for ComponentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(TYPE_SEPARATOR) {
            Some((ty, name)) => Self::with_name(ComponentType::new(ty.trim())?, name.trim()),
            None => Ok(Self::new(ComponentType::new(s.trim())?)),
        }
    }
}

impl TryFrom<String> for ComponentId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ComponentId> for String {
    fn from(id: ComponentId) -> Self {
        id.to_string()
    }
}

/// The role a component plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Produces data into pipelines.
    Receiver,
    /// Transforms data inside a pipeline.
    Processor,
    /// Sends data out of the agent.
    Exporter,
    /// Exporter of one pipeline and receiver of another.
    Connector,
    /// Provides capabilities to other components, outside any pipeline.
    Extension,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Receiver => "receiver",
            Kind::Processor => "processor",
            Kind::Exporter => "exporter",
            Kind::Connector => "connector",
            Kind::Extension => "extension",
        })
    }
}

/// Maturity of a component's support for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum StabilityLevel {
    /// The signal is not supported.
    #[default]
    Undefined,
    /// No longer maintained.
    Unmaintained,
    /// Scheduled for removal.
    Deprecated,
    /// Under active development, not for production use.
    Development,
    /// Usable, configuration may still change.
    Alpha,
    /// Feature complete, configuration settling.
    Beta,
    /// Production ready.
    Stable,
}

impl StabilityLevel {
    /// Returns whether the level denotes a supported signal.
    pub fn is_supported(self) -> bool {
        self != StabilityLevel::Undefined
    }
}

impl fmt::Display for StabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StabilityLevel::Undefined => "undefined",
            StabilityLevel::Unmaintained => "unmaintained",
            StabilityLevel::Deprecated => "deprecated",
            StabilityLevel::Development => "development",
            StabilityLevel::Alpha => "alpha",
            StabilityLevel::Beta => "beta",
            StabilityLevel::Stable => "stable",
        })
    }
}

/// Identity of the running agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    /// Executable name.
    pub command: String,
    /// Human readable description.
    pub description: String,
    /// Version string.
    pub version: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            command: "otel-agent".to_string(),
            description: "OpenTelemetry collection agent".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Per-instance settings handed to every factory constructor.
#[derive(Debug, Clone)]
pub struct CreateSettings {
    /// Id of the instance being created.
    pub id: ComponentId,
    /// Kind of the instance being created.
    pub kind: Kind,
    /// Build information of the agent.
    pub build_info: BuildInfo,
    /// Span every log line of the instance is attached to.
    pub span: tracing::Span,
}

impl CreateSettings {
    /// Creates settings for one component instance.
    pub fn new(id: ComponentId, kind: Kind, build_info: BuildInfo) -> Self {
        let span = tracing::info_span!(
            "component",
            otelcol.component.id = %id,
            otelcol.component.kind = %kind,
        );
        Self {
            id,
            kind,
            build_info,
            span,
        }
    }

    /// Builds the error returned by a factory asked for a signal it lacks.
    pub fn signal_not_supported(&self, signal: Signal) -> ComponentError {
        ComponentError::SignalNotSupported {
            kind: self.kind,
            id: self.id.clone(),
            signal,
        }
    }
}

/// Lifecycle shared by every component.
///
/// A component is created by its factory, started once with a host, and shut
/// down once. Shutdown must be safe without a prior start and must release
/// every external resource.
#[async_trait]
pub trait Component: Send + Sync {
    /// Starts the component.
    async fn start(&self, host: &dyn Host) -> Result<(), ComponentError>;

    /// Stops the component, draining in-flight work where practical.
    async fn shutdown(&self) -> Result<(), ComponentError>;
}

/// A component living outside pipelines, resolvable through the [`Host`].
pub trait Extension: Component {
    /// Returns the storage capability when this extension provides one.
    fn as_storage(&self) -> Option<&dyn StorageExtension> {
        None
    }
}

/// What components see of the running service.
pub trait Host: Send + Sync {
    /// Returns every running extension by id.
    fn extensions(&self) -> &BTreeMap<ComponentId, Arc<dyn Extension>>;
}
