//! Receivers: where telemetry enters the agent.

pub mod otlp;

pub use otlp::{OtlpReceiver, OtlpReceiverConfig, OtlpReceiverFactory};
