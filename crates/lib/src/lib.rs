//! Palaver core library: streaming chat client, context compaction, conversation controller,
//! and chat persistence used by the CLI.

pub mod config;
pub mod context;
pub mod controller;
pub mod init;
pub mod llm;
pub mod persona;
pub mod session;
pub mod store;
