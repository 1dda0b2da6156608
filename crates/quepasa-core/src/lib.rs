//! # quepasa-core
//!
//! Core types, traits, configuration, and error handling for the Quepasa
//! gateway: the tri-state option model, the cached message model, the
//! connection state machine, JID helpers, and the WhatsApp client library
//! (WCL) adapter contract that the rest of the workspace consumes.

pub mod config;
pub mod error;
pub mod jid;
pub mod message;
pub mod options;
pub mod state;
pub mod wcl;
