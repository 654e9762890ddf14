//! Proxy configuration synthesis
//!
//! Routes carry untrusted path strings that end up embedded in the proxy's
//! configuration language, where whitespace, `#`, quotes and backslashes are
//! syntax. The [`rewrite`] scanner decides whether a value can be embedded
//! verbatim; [`config`] renders a [`Snapshot`] of the router state, leaving
//! out any route whose values cannot be embedded; and the [`CommitScheduler`]
//! writes, checks and reloads the configuration whenever the state changes.
//!
//! [`Snapshot`]: router_controller_k8s_index::Snapshot

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
mod proxy;
pub mod rewrite;
mod scheduler;

pub use self::{
    config::{render, RenderError, RenderOptions, RenderedConfig, UnsafeRoute},
    proxy::{ProxyCommand, ProxyControl},
    rewrite::{accept_value, UnsafeValue},
    scheduler::{CommitMetrics, CommitScheduler, Outcome},
};
