//! # LeadFlow Core
//!
//! Shared building blocks for the lead auto-transfer engine:
//! configuration, the crate-wide error type, the lead/user domain model,
//! and the collaborator traits the engine consumes.
//!
//! ## Collaborators
//! ```text
//! LeadStore      — find / get / update_owner / assignment log / timeline note
//! UserDirectory  — resolve_names / role_of
//! AuditNotifier  — one notice per affected user per cycle
//! ```

pub mod config;
pub mod error;
pub mod lead;
pub mod timefmt;
pub mod traits;

pub use config::LeadFlowConfig;
pub use error::{LeadFlowError, Result};
