#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod engine;
mod error;
mod graph;
mod param;
mod pipeline;
mod report;
mod store;
mod task;
mod utils;

pub use crate::engine::{CancelToken, Invalidation, RunOptions};
pub use crate::error::*;
pub use crate::param::{ParamKind, ParamValue, Params, Signature};
pub use crate::pipeline::{OutputHandle, Pipeline};
pub use crate::report::{Action, NodeReport, Plan, PlanNode, Report};
pub use crate::store::{Artifact, FsStore, MemoryStore, Store, StoreKey};
pub use crate::task::{Derive, Outputs, Registry, TaskContext, TaskDef, TaskInstance};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
