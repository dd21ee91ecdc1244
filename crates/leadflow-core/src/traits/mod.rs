//! Collaborator traits consumed by the transfer engine.

pub mod lead_store;
pub mod notifier;
pub mod user_directory;
