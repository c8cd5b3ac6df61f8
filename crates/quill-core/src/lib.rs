//! quill-core – OpenAI-compatible chat on top of plain text-generation
//! engines.
//!
//! A request flows through four stages:
//!
//! 1. [`compiler`] flattens the structured conversation into one prompt
//!    string using a model family's [`template`] tokens and the tool
//!    protocol's call/result formats.
//! 2. [`tool_prompt`] renders the system-prompt block that teaches the model
//!    the tool protocol, and later extracts tool invocations from its output.
//! 3. [`decoder`] watches the streamed fragments and holds back anything
//!    that turns out to be a tool call.
//! 4. [`tools`] executes detected calls against the registry, after which
//!    [`service`] runs one more generation with the results.
//!
//! The [`engine`] module defines the generation contract and ships an HTTP
//! engine for llama.cpp-compatible servers.

pub mod compiler;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod openai;
pub mod service;
pub mod template;
pub mod tool_prompt;
pub mod tools;
pub mod types;

pub use config::{ModelProfile, Settings};
pub use error::{ChatError, ConfigError, EngineError, ToolError};
pub use service::{ChatService, ModelContext};
pub use tools::{ToolHandler, ToolOrchestrator, ToolRegistry, tool_fn};
pub use types::{Message, Role, ToolDeclaration, ToolInvocation, ToolResult};
