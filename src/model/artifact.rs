// src/model/artifact.rs

//! Artifact references. Content handling lives outside this engine; only
//! identity, ownership, and tree shape matter here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ArtifactId, TaskDefId};

/// A unit of input/output data, immutable once produced.
///
/// Artifacts are shared: multiple processes across runs may reference the
/// same record. A process only ever mutates artifacts owned by its own
/// run's task definition; `prepare` deep-copies anything else first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: ArtifactId,
    /// Owning task definition, if any.
    pub task_def_id: Option<TaskDefId>,
    /// Parent in the artifact tree (e.g. a file split into chunks).
    pub parent_id: Option<ArtifactId>,
    /// Store-assigned creation sequence.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}
