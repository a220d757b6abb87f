//! Kubist agent: wires resource watchers, fan-in and apply lanes together.

#![forbid(unsafe_code)]

pub mod aggregator;
mod agent;
pub mod lanes;

pub use agent::{AgentConfig, AgentError, AgentReport, ReflectionAgent};
pub use aggregator::{AggregatorError, ChannelAggregator};
pub use lanes::{ApplyCounts, ApplyPool, LaneClosed};
