//! Core orchestration for prism: turn a conversation's file changes into a
//! pushed branch and a structured infrastructure plan.

pub mod error;
pub mod git;
pub mod materialize;
pub mod model;
pub mod planner;
pub mod process;
pub mod remote;
pub mod secrets;
pub mod state;
pub mod workflow;
pub mod workspace;

pub use error::{Error, ErrorCategory, ErrorKind, RemoteServiceError, Result, Service};
pub use model::{ConversationFiles, FileChange, PlanResult, RepoTarget, SecretSet};
pub use workflow::{ChangeRequest, ChangeSource, Collaborators, ConversationWorkflow, WorkflowConfig};
