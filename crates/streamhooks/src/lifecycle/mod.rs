//! Process lifecycle: ordered startup, post-bind activation, and
//! best-effort ordered shutdown.
//!
//! # Invariants
//!
//! - Phases only move forward (`initializing` → … → `terminated`).
//! - The encrypted listener binds iff the TLS bundle is complete; the plain
//!   listener always binds.
//! - Activation runs at most once, and only after the encrypted listener bound.
//! - Shutdown runs once, attempts every step, and never drops a recorded
//!   outcome.

pub mod activation;
pub mod phase;
pub mod resources;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use activation::ActivationStatus;
pub use phase::{LifecyclePhase, PhaseTracker};
pub use shutdown::{ShutdownSequencer, ShutdownTrigger};
pub use startup::{PlatformSubsystems, Startup};
