use super::*;

/// Best-effort fan-out: no observers, no delivery, never an error back into
/// the run that emitted.
pub(super) fn broadcast_json(sender: &broadcast::Sender<String>, value: serde_json::Value) {
    let _ = sender.send(value.to_string());
}

/// Observers re-read task state when they see this.
pub(super) fn emit_task_update(sender: &broadcast::Sender<String>) {
    broadcast_json(
        sender,
        json!({
            "event": "task-update",
            "at": Utc::now().to_rfc3339(),
        }),
    );
}

pub(super) fn emit_task_progress(
    sender: &broadcast::Sender<String>,
    task_id: i64,
    percent: u8,
    speed: &str,
) {
    broadcast_json(
        sender,
        json!({
            "event": "task-progress",
            "task_id": task_id,
            "percent": percent,
            "speed": speed,
            "at": Utc::now().to_rfc3339(),
        }),
    );
}
