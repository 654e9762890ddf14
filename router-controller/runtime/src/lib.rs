#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use router_controller_core as core;
pub use router_controller_k8s_api as k8s;
pub use router_controller_k8s_index as index;
pub use router_controller_k8s_status as status;
pub use router_controller_template as template;
pub use router_controller_validation as validation;

mod args;
mod event_loop;
mod watch;

pub use self::{
    args::Args,
    event_loop::{chain, ChainConfig, Event, EventLoop, Kind},
    watch::{IntoEvent, NamespaceWatch, Watch},
};
