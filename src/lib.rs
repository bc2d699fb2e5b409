//! ntquery - ask number-theory questions in plain language
//!
//! A question is turned into a plan of executable steps (by a hosted model or
//! by the companion bridge), each step runs in a sandboxed interpreter, and the
//! resulting display blocks are rendered one at a time at a steady pace.

pub mod auth;
pub mod block;
pub mod bridge;
pub mod codeassist;
pub mod config;
pub mod docs;
pub mod error;
pub mod executor;
pub mod interp;
pub mod models;
pub mod openrouter;
pub mod orchestrator;
pub mod planner;
pub mod prober;
pub mod render;
pub mod sse;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
