use serde::{Deserialize, Serialize};

/// Lifecycle notification for UI and notification collaborators.
///
/// Serialized as `{"event": "upload-progress", "taskId": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum UploadEvent {
    #[serde(rename_all = "camelCase")]
    UploadProgress { task_id: String, progress: u8 },
    #[serde(rename_all = "camelCase")]
    UploadComplete { task_id: String },
    #[serde(rename_all = "camelCase")]
    UploadError { task_id: String, error: String },
}

impl UploadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            UploadEvent::UploadProgress { task_id, .. }
            | UploadEvent::UploadComplete { task_id }
            | UploadEvent::UploadError { task_id, .. } => task_id,
        }
    }

    /// Returns the external event name (`upload-progress`, ...).
    pub fn name(&self) -> &'static str {
        use crate::constants::event_names;
        match self {
            UploadEvent::UploadProgress { .. } => event_names::UPLOAD_PROGRESS,
            UploadEvent::UploadComplete { .. } => event_names::UPLOAD_COMPLETE,
            UploadEvent::UploadError { .. } => event_names::UPLOAD_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_event_shape() {
        let ev = UploadEvent::UploadProgress {
            task_id: "t1".into(),
            progress: 67,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "upload-progress");
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["progress"], 67);
        assert_eq!(ev.name(), "upload-progress");
    }

    #[test]
    fn error_event_roundtrip() {
        let json = r#"{"event":"upload-error","taskId":"t2","error":"rejected"}"#;
        let ev: UploadEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.task_id(), "t2");
        assert_eq!(ev.name(), "upload-error");
    }
}
