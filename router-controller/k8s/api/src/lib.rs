#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod route;

pub use self::route::{
    InvalidTermination, Route, RouteIngress, RouteIngressCondition, RoutePort, RouteSpec,
    RouteStatus, RouteTargetReference, TargetPort, TlsConfig, TlsTermination,
    REWRITE_TARGET_ANNOTATION,
};
pub use k8s_openapi::{
    api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Namespace, Node,
        ObjectReference,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    runtime::watcher,
    Client, Resource,
};
