// marksync state managers
// Managers own per-session state: the reconciled bookmark list and the session driving it.

pub mod bookmark_state;
pub mod session_manager;
