//! Router state
//!
//! The index maintains the router's view of which host and path is served by
//! which backends. Events flow through a chain of plugins; the last stages
//! live here:
//!
//! - [`UniqueHost`] arbitrates between routes that claim the same host and
//!   path. The oldest route owns the claim; other claimants wait in line and
//!   are reported as rejected.
//! - [`TemplatePlugin`] applies admitted routes and endpoint tables to the
//!   shared [`RouterState`] and publishes the state's generation when a batch
//!   of events is committed.
//!
//! ```text
//! [ ... ] -> [ UniqueHost ] -> [ TemplatePlugin ] -> [ RouterState ]
//! ```
//!
//! The state is only mutated by the single task that owns the chain. Readers
//! (the commit scheduler and metrics) take read locks.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod endpoints;
pub mod metrics;
mod state;
mod template_plugin;
mod unique_host;


pub use self::{
    endpoints::endpoints_table,
    state::{RouterState, SharedState, Snapshot},
    template_plugin::TemplatePlugin,
    unique_host::UniqueHost,
};
