// Build module - the task engine
//
// Turns a project snapshot and a tag string into login, build, tag and push
// operations on an external build tool, with per-registry builders and
// optional proxy injection into the Dockerfile.

pub(crate) mod backend;
pub(crate) mod builder;
mod docker;
pub(crate) mod dockerfile_proxy;
pub(crate) mod error;
pub(crate) mod pipeline;
mod proxy;
pub(crate) mod tags;

pub(crate) use backend::BuildBackend;
pub(crate) use builder::{BuilderManager, BuilderPolicy};
pub(crate) use docker::DockerCli;
pub(crate) use error::PipelineError;
pub(crate) use pipeline::{Pipeline, PipelineRequest};
