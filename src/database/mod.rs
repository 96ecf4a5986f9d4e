//! Embedded database layer backing the local bookmark store.
//!
//! # Usage
//!
//! ```no_run
//! use marksync::database::Database;
//!
//! // Open a persistent database
//! let db = Database::open("marksync.db").expect("failed to open database");
//!
//! // Or use an in-memory database for testing
//! let db = Database::open_in_memory().expect("failed to open in-memory database");
//!
//! // Lock the connection for a query
//! let conn = db.connection();
//! ```

pub mod connection;
pub mod migrations;

pub use connection::Database;
