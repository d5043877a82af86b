#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use rbac_collector_core as core;
pub use rbac_collector_k8s_api as k8s;
pub use rbac_collector_k8s_index as index;

mod args;
pub mod controller;
mod metrics;
pub mod publish;
pub mod server;
pub mod verify;

pub use self::{
    args::Args,
    controller::{Controller, DiffGate},
    metrics::ControllerMetrics,
    publish::{ConfigMapSink, FileSink, Publish, Sinks},
};
