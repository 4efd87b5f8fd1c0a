//! metaflow-lite core: a DAG execution engine for data-science
//! pipelines.
//!
//! A flow is a directed acyclic graph of named steps declared with
//! [`flow::FlowBuilder`]. The [`scheduler::Scheduler`] walks the analysed
//! graph, materialises tasks, and runs each attempt in an isolated child
//! process via [`executor`]; [`client::MetaflowClient`] is the read-only
//! mirror over the datastore and metadata providers.

pub mod cards;
pub mod client;
pub mod config;
pub mod current;
pub mod datastore;
pub mod datastore_local;
pub mod datastore_s3;
pub mod decorator;
pub mod error;
pub mod executor;
pub mod flow;
pub mod graph;
pub mod metadata;
pub mod metadata_local;
pub mod metadata_service;
pub mod params;
pub mod runner;
pub mod scheduler;
pub mod scope;
pub mod types;
pub mod worker;

pub use error::{CoreError, Result};
pub use flow::{FlowBuilder, FlowDef, FlowRegistry, Next, StepDef};
pub use scope::{FlowScope, Inputs};
pub use types::Pathspec;
