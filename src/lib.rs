//! Workspace package hosting the end-to-end tests.
//!
//! The functionality lives in the member crates:
//!
//! - `otel-agent-pdata`: telemetry batch types with copy-on-share semantics
//! - `otel-agent-pipeline`: pipeline graph, queues, exporter helper and the
//!   component contracts
//! - `otel-agent`: the built-in components, configuration loading and the
//!   agent binary
