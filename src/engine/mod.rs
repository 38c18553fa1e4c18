//! Engine: the dispatcher and the control plane that drives it.

pub mod control;
pub mod dispatcher;

pub use control::ControlPlane;
pub use dispatcher::{DispatchConfig, Dispatcher, IngestOutcome};
