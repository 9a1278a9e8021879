//! Agent runner - subprocess adapter for agent steps.

mod runner;

pub use runner::{AgentInvocation, AgentRunResult, AgentRunner, AnswerRouter, CommandAgentRunner};
