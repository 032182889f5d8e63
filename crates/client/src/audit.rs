//! Emit-only audit surface. The fabric reports state transitions here and
//! nothing else; storage, buffering, and delivery belong to whatever sink
//! an integrator plugs in. The default sink renders to `tracing`.

use models::{JobRecord, JobStatus, NodeStatus, SyncConflict};

#[derive(Debug)]
pub enum AuditEvent<'a> {
    JobTransition {
        job: &'a JobRecord,
        from: JobStatus,
        to: JobStatus,
    },
    NodeStatusChanged {
        node_id: &'a str,
        from: NodeStatus,
        to: NodeStatus,
    },
    ConflictDetected {
        conflict: &'a SyncConflict,
    },
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent<'_>);
}

/// Renders audit events as structured log events.
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn emit(&self, event: AuditEvent<'_>) {
        match event {
            AuditEvent::JobTransition { job, from, to } => {
                tracing::info!(
                    job_id = %job.job_id,
                    kind = %job.kind,
                    from = %from,
                    to = %to,
                    retry_count = job.retry_count,
                    "job transition"
                );
            }
            AuditEvent::NodeStatusChanged { node_id, from, to } => {
                tracing::info!(node_id, from = %from, to = %to, "node status changed");
            }
            AuditEvent::ConflictDetected { conflict } => {
                tracing::warn!(
                    study_uid = %conflict.study_uid,
                    config_id = %conflict.config_id,
                    kind = conflict.kind.as_str(),
                    "sync conflict detected"
                );
            }
        }
    }
}
