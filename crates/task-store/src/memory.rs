use std::collections::HashMap;
use std::sync::RwLock;

use reelup_transfer::{ChunkInfo, TaskId, UploadTask};

use crate::{StoreError, TaskStore};

/// Volatile task store. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, UploadTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn put(&self, task: &UploadTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get(&self, task_id: &TaskId) -> Result<Option<UploadTask>, StoreError> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.get(task_id).cloned())
    }

    fn put_chunk(&self, task_id: &TaskId, chunk: &ChunkInfo) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
        let slot = task
            .chunk_plan
            .get_mut(chunk.index as usize)
            .ok_or_else(|| StoreError::Corrupt {
                task_id: task_id.to_string(),
                reason: format!("chunk {} outside the plan", chunk.index),
            })?;
        *slot = chunk.clone();
        Ok(())
    }

    fn list(&self) -> Result<Vec<UploadTask>, StoreError> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<UploadTask> = tasks.values().cloned().collect();
        all.sort_by_key(|t| t.created_at);
        Ok(all)
    }

    fn purge(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.remove(task_id).is_some())
    }
}
