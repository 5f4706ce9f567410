//! Reasoning agents: profiles, tools and the service client.

pub mod client;
pub mod profiles;
pub mod tools;

#[cfg(test)]
pub mod testing;

pub use client::{invoke_structured, OpenAiReasoning, ReasoningService};
pub use profiles::AgentProfile;
pub use tools::ToolSet;
