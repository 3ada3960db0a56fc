//! Outbound hook events.
//!
//! The core only builds the structured payload and hands it to a
//! caller-supplied sink; running scripts or webhooks is the dispatcher's
//! business and its failures never reach the loop.

use serde_json::Value;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use steroids_state::InvocationRole;
use steroids_state::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    TaskUpdated {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskCompleted {
        task_id: String,
        title: String,
    },
    TaskFailed {
        task_id: String,
        reason: String,
    },
    ReviewApproved {
        task_id: String,
    },
    ReviewRejected {
        task_id: String,
        rejection_count: i64,
    },
    SectionCompleted {
        section_id: String,
    },
    DisputeCreated {
        dispute_id: String,
        task_id: String,
    },
    CreditExhausted {
        provider: String,
        model: String,
        role: InvocationRole,
    },
    CreditResolved {
        provider: String,
        model: String,
        role: InvocationRole,
        resolution: String,
    },
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::TaskUpdated { .. } => "task.updated",
            HookEvent::TaskCompleted { .. } => "task.completed",
            HookEvent::TaskFailed { .. } => "task.failed",
            HookEvent::ReviewApproved { .. } => "review.approved",
            HookEvent::ReviewRejected { .. } => "review.rejected",
            HookEvent::SectionCompleted { .. } => "section.completed",
            HookEvent::DisputeCreated { .. } => "dispute.created",
            HookEvent::CreditExhausted { .. } => "credit.exhausted",
            HookEvent::CreditResolved { .. } => "credit.resolved",
        }
    }

    /// The wire payload: event name, timestamp, project, event fields.
    pub fn payload(&self, project: &str) -> Value {
        let fields = match self {
            HookEvent::TaskUpdated { task_id, from, to } => json!({
                "taskId": task_id,
                "from": from.as_str(),
                "to": to.as_str(),
            }),
            HookEvent::TaskCompleted { task_id, title } => json!({
                "taskId": task_id,
                "title": title,
            }),
            HookEvent::TaskFailed { task_id, reason } => json!({
                "taskId": task_id,
                "reason": reason,
            }),
            HookEvent::ReviewApproved { task_id } => json!({ "taskId": task_id }),
            HookEvent::ReviewRejected {
                task_id,
                rejection_count,
            } => json!({
                "taskId": task_id,
                "rejectionCount": rejection_count,
            }),
            HookEvent::SectionCompleted { section_id } => json!({ "sectionId": section_id }),
            HookEvent::DisputeCreated {
                dispute_id,
                task_id,
            } => json!({
                "disputeId": dispute_id,
                "taskId": task_id,
            }),
            HookEvent::CreditExhausted {
                provider,
                model,
                role,
            } => json!({
                "provider": provider,
                "model": model,
                "role": role.as_str(),
            }),
            HookEvent::CreditResolved {
                provider,
                model,
                role,
                resolution,
            } => json!({
                "provider": provider,
                "model": model,
                "role": role.as_str(),
                "resolution": resolution,
            }),
        };
        json!({
            "event": self.name(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "project": project,
            "payload": fields,
        })
    }
}

/// Receives fully-built payloads. Implementations own their error handling.
pub trait HookSink: Send + Sync {
    fn dispatch(&self, payload: Value);
}

pub type SharedHookSink = Arc<dyn HookSink>;

pub fn emit(sink: Option<&SharedHookSink>, project: &str, event: &HookEvent) {
    let Some(sink) = sink else {
        return;
    };
    debug!(event = event.name(), "emitting hook event");
    sink.dispatch(event.payload(project));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn payload_carries_name_project_and_fields() {
        let event = HookEvent::ReviewRejected {
            task_id: "t1".to_string(),
            rejection_count: 4,
        };
        let payload = event.payload("/work/proj");
        assert_eq!(payload["event"], "review.rejected");
        assert_eq!(payload["project"], "/work/proj");
        assert_eq!(payload["payload"]["taskId"], "t1");
        assert_eq!(payload["payload"]["rejectionCount"], 4);
        assert!(payload["timestamp"].is_string());
    }
}
