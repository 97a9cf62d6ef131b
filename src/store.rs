//! Persistence seams.
//!
//! The gateway never talks to a database directly. It goes through
//! [`ProjectStore`] and [`MessageStore`], which a deployment backs with its
//! document store. [`MemoryStore`] implements both in process and is what the
//! binary and the tests run against.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Message, Project};

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn load_project(&self, project_id: &str) -> Result<Option<Project>, StoreError>;

    /// Replaces the whole record. Callers serialize writes per project.
    async fn save_project(&self, project: Project) -> Result<(), StoreError>;

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably appends a message and returns it with its server-assigned
    /// id and timestamp.
    async fn persist_message(
        &self,
        project_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Messages of one project, oldest first.
    async fn load_messages(&self, project_id: &str) -> Result<Vec<Message>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<String, Project>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn load_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        let projects = self.projects.read().await;
        Ok(projects.get(project_id).cloned())
    }

    async fn save_project(&self, project: Project) -> Result<(), StoreError> {
        let mut projects = self.projects.write().await;
        projects.insert(project.id.clone(), project);
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let projects = self.projects.read().await;
        let mut all: Vec<Project> = projects.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist_message(
        &self,
        project_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut messages = self.messages.write().await;
        let log = messages.entry(project_id.to_string()).or_default();

        // Wall clocks can step backwards; the per-project log must not.
        let mut created_at = Utc::now();
        if let Some(last) = log.last() {
            created_at = created_at.max(last.created_at);
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at,
        };
        log.push(message.clone());
        Ok(message)
    }

    async fn load_messages(&self, project_id: &str) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages.get(project_id).cloned().unwrap_or_default())
    }
}
