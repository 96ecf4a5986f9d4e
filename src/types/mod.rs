// marksync shared type definitions
// Each submodule defines types used across the library, binaries and tests.

pub mod bookmark;
pub mod errors;
pub mod events;
pub mod session;
pub mod settings;
pub mod validation;
