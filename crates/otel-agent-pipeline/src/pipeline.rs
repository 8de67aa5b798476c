//! Signal types and pipeline identity.

use crate::error::IdError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of telemetry a pipeline carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Spans.
    Traces,
    /// Metric data points.
    Metrics,
    /// Log records.
    Logs,
    /// Profiling samples.
    Profiles,
}

impl Signal {
    /// Returns the lowercase name of the signal.
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
            Signal::Profiles => "profiles",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "traces" => Ok(Signal::Traces),
            "metrics" => Ok(Signal::Metrics),
            "logs" => Ok(Signal::Logs),
            "profiles" => Ok(Signal::Profiles),
            "" => Err(IdError::EmptyType),
            other => Err(IdError::UnknownSignal(other.to_string())),
        }
    }
}

/// Identifies a pipeline: `signal` or `signal/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PipelineId {
    signal: Signal,
    name: Option<String>,
}

impl PipelineId {
    /// Creates an unnamed pipeline id.
    pub fn new(signal: Signal) -> Self {
        Self { signal, name: None }
    }

    /// Creates a named pipeline id.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::EmptyName`] for an empty name and
    /// [`IdError::InvalidName`] for names with whitespace or control characters.
    pub fn with_name(signal: Signal, name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdError::EmptyName);
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(IdError::InvalidName(name));
        }
        Ok(Self {
            signal,
            name: Some(name),
        })
    }

    /// Returns the signal carried by the pipeline.
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Returns the pipeline name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{name}", self.signal),
            None => write!(f, "{}", self.signal),
        }
    }
}

impl FromStr for PipelineId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((signal, name)) => Self::with_name(signal.trim().parse()?, name.trim()),
            None => Ok(Self::new(s.trim().parse()?)),
        }
    }
}

impl TryFrom<String> for PipelineId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PipelineId> for String {
    fn from(id: PipelineId) -> Self {
        id.to_string()
    }
}
