//! Airdock - local session broker for an AI coding agent
//!
//! Airdock runs next to a project's dev server. Thin clients (a phone
//! widget, a browser tab) connect over WebSocket, send prompts, and watch
//! the agent's output stream in as it edits the working tree. Every client
//! sees the same conversation; only one query runs at a time.
//!
//! ## Architecture
//!
//! ```text
//!  clients ──ws──▶ ┌──────────────────────────────────────────┐
//!                  │                 Broker                   │
//!  POST /upload ──▶│  protocol ─▶ executor ─▶ AgentEngine     │──▶ claude CLI
//!                  │      │           │                       │
//!                  │      ▼           ▼                       │
//!                  │  git handlers  SessionStore ─▶ .airdock.local.json
//!                  │      │                                   │
//!                  │      ▼                                   │
//!                  │  GitCoordinator (stash protect) + watcher│──▶ git / gh
//!                  └──────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`broker`]: WebSocket/HTTP surface, query executor, git handlers
//! - [`engine`]: Agent engine trait and the `claude` CLI driver
//! - [`git`]: Working-tree snapshots and stash-protected branch switching
//! - [`session`]: Conversation history and its JSON file store
//! - [`upload`]: Multipart parsing and image persistence
//! - [`config`]: Configuration management

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod session;
pub mod upload;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{Error, Result};
