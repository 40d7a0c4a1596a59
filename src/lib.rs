// src/lib.rs

//! taskloom: a task execution orchestration engine.
//!
//! Units of work ("processes") belong to runs, and runs may be chained into
//! multi-stage workflows. The engine guarantees at-most-one active execution
//! per process, bounded concurrency per run and per workflow, FIFO dispatch
//! by creation time, timeout detection, and a flat, reconstructable restart
//! history, all under concurrent callers.
//!
//! This crate is a library: job-queue consumers call
//! [`Engine::dispatch_for_run`]/[`Engine::dispatch_for_workflow`] and
//! [`Engine::run_process`] after dequeuing, and request handlers call the
//! start/stop/resume/restart operations. What work actually *does* lives
//! behind the [`runner::Runner`] contract; where records live is behind
//! [`store::ProcessStore`].

pub mod config;
pub mod engine;
pub mod errors;
pub mod lock;
pub mod logging;
pub mod model;
pub mod runner;
pub mod store;
pub mod types;

pub use config::{EngineConfig, LockConfig};
pub use engine::{ChannelDispatchSink, DispatchSink, Engine};
pub use errors::{Result, TaskloomError, TransientFailure};
pub use lock::{LockGuard, MutexService};
pub use model::{
    ArtifactRecord, ProcessRecord, ProcessStatus, RunRecord, RunStatus, TaskDefinition,
    WorkflowEdge, WorkflowGraph, WorkflowNode, WorkflowRun,
};
pub use runner::{
    ErrorClassifier, Runner, RunnerContext, RunnerRegistry, TransientMarkerClassifier,
};
pub use store::{
    ArtifactSeed, MemoryStore, NodeSeed, ProcessSeed, ProcessStore, RunSeed, WorkflowSeed,
};
pub use types::{
    ArtifactId, NodeId, ProcessId, RunId, TaskDefId, WorkerContext, WorkerId, WorkflowRunId,
};
