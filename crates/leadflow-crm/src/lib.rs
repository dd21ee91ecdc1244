//! # LeadFlow CRM
//!
//! SQLite implementation of the CRM collaborators the transfer engine
//! consumes: the lead store (find / get / owner writes / audit rows) and
//! the user directory (names and roles).

pub mod sqlite;

pub use sqlite::SqliteCrm;
