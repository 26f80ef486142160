//! Client for the asynchronous coding-agent service.
//!
//! Wire records are decoded once here into typed values: an activity's
//! payload arrives as a tagged union, so callers never branch on which of
//! several optional fields happens to be populated.

mod client;
mod error;
mod traits;
mod types;

pub use client::AgentClient;
pub use error::{AgentError, Result};
pub use traits::AgentService;
pub use types::{
    Activity, ActivityId, ActivityPage, ActivityPayload, Artifact, Originator, Output,
    PlanStep, Session, SessionId, Source,
};
