//! Composition root for the panel host: wires the server supervisor, the
//! opencode client, and the panel message bridge together behind a JSON
//! lines stdio protocol.

pub mod bridge;
pub mod cli;
pub mod messages;
pub mod reconciler;
