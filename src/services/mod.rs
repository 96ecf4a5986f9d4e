// marksync services
// Stateless or config-level functionality: input validation, identity, settings.

pub mod auth;
pub mod settings_engine;
pub mod validation;
