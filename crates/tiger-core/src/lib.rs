//! Worker runtime for the tiger coding-agent fleet.
//!
//! A long-lived agent process picks tasks off a queue, materializes a
//! working tree, drives an external LLM executor under a path/command
//! policy, verifies the result, self-repairs through a layered recovery
//! cascade, and finalizes run/task/lease/agent state transactionally.

pub mod config;
pub mod environment;
pub mod executor;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod recovery;
pub mod repo;
pub mod vcs;
pub mod verify;
pub mod worker;
