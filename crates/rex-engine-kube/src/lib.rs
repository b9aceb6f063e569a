//! A cluster-scheduler `Engine` backend skeleton for the pipeline
//! execution runtime, built on `kube`/`k8s-openapi`.

pub mod kube_engine;

pub use kube_engine::KubeEngine;
