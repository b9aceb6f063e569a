//! A local container-daemon `Engine` backend for the pipeline
//! execution runtime, built on `bollard`.

pub mod docker;

pub use docker::DockerEngine;
