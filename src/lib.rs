//! Brain -- TEE-resident orchestrator for the DisCard payments stack.
//!
//! Receives natural-language user requests, parses them into structured
//! intents, materializes multi-step execution plans, and dispatches each
//! step as a verified tool call against the sibling "Soul" enclave.
//! Callers observe execution as an ordered event stream over gRPC; a
//! small HTTP surface exposes liveness and attestation diagnostics.
#![allow(missing_docs)] // TODO: enforce once the wire types stop churning

pub mod config;
pub mod context;
pub mod intent;
pub mod llm;
pub mod logging;
pub mod pb;
pub mod planner;
pub mod server;
pub mod soul;
pub mod tools;
pub mod types;
