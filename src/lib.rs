//! A client-side, coordination-free load balancer for chat completion
//! requests across a fleet of Azure OpenAI deployments.
//!
//! Selection is power-of-two-choices over per-deployment utilization, with
//! session affinity for callers that want sticky routing. No shared state
//! beyond process memory: every `Switchboard` instance balances
//! independently, so horizontally scaled callers each run their own.
//!
//! See [`Switchboard`] for the entry point.

pub mod config;
pub mod deployment;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod selection;
pub mod session_map;
pub mod supervisor;
pub mod switchboard;
pub mod types;

pub use config::{DeploymentDefinition, SwitchboardConfig};
pub use deployment::{AzureInferenceClient, ChatStream, Deployment, HealthStatus, InferenceClient};
pub use error::{CooldownReason, Result, SwitchboardError};
pub use metrics::{Metrics, RequestStatus, TokenKind};
pub use retry::BackoffPolicy;
pub use selection::{AffinityOutcome, SelectionEngine};
pub use session_map::SessionMap;
pub use switchboard::{ClientFactory, Switchboard};
pub use types::{ChatChoice, ChatChunk, ChatMessage, ChatRequest, ChatResponse, MessageRole, Usage};
