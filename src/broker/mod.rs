//! Session broker
//!
//! Accepts WebSocket clients, runs one agent query at a time and fans its
//! output out to every connected client. Also serves uploads and the git
//! branch workflow over the same port.

mod clients;
mod executor;
mod git_handlers;
mod hmr;
mod http;
pub mod protocol;
mod server;

pub use clients::{ClientId, Outbound};
pub use executor::build_prompt;
pub use protocol::{BrokerStatus, ClientMessage, ServerEvent, ToolPhase};
pub use server::Broker;
