//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers building a gate or a database
//! connection from configuration need not depend on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};
