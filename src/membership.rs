//! Project membership and role state machine.
//!
//! Every mutation runs under the project's own lock: load a snapshot,
//! apply the change to a private copy, verify invariants, save. Nothing is
//! written if any step fails, and readers only ever see whole snapshots.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};

use crate::error::MembershipError;
use crate::locks::KeyedLocks;
use crate::models::{NewProject, Project, ProjectStatus, ProjectUpdate};
use crate::store::ProjectStore;

pub struct MembershipAuthority {
    store: Arc<dyn ProjectStore>,
    locks: KeyedLocks,
    last_admin_guard: bool,
}

impl MembershipAuthority {
    /// `last_admin_guard` refuses demotions that would leave a project
    /// without admins. Without it, demotion is unguarded.
    pub fn new(store: Arc<dyn ProjectStore>, last_admin_guard: bool) -> Self {
        MembershipAuthority {
            store,
            locks: KeyedLocks::new(),
            last_admin_guard,
        }
    }

    pub async fn create_project(
        &self,
        creator_id: &str,
        details: NewProject,
    ) -> Result<Project, MembershipError> {
        let project = Project::new(creator_id, details)?;
        let _guard = self.locks.lock(&project.id).await;
        self.store.save_project(project.clone()).await?;
        info!("Project {} created by {}", project.id, creator_id);
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project, MembershipError> {
        self.store
            .load_project(project_id)
            .await?
            .ok_or_else(|| MembershipError::ProjectNotFound {
                project_id: project_id.to_string(),
            })
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, MembershipError> {
        Ok(self.store.list_projects().await?)
    }

    pub async fn is_member(&self, project_id: &str, user_id: &str) -> Result<bool, MembershipError> {
        Ok(self.get_project(project_id).await?.is_member(user_id))
    }

    pub async fn is_admin(&self, project_id: &str, user_id: &str) -> Result<bool, MembershipError> {
        Ok(self.get_project(project_id).await?.is_admin(user_id))
    }

    pub async fn request_join(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<Project, MembershipError> {
        self.mutate(project_id, |project| {
            if project.is_member(user_id) {
                return Err(MembershipError::AlreadyMember {
                    project_id: project_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
            if !project.join_requests.insert(user_id.to_string()) {
                return Err(MembershipError::DuplicateRequest {
                    project_id: project_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    pub async fn accept_invite(
        &self,
        project_id: &str,
        acting_user_id: &str,
        target_user_id: &str,
    ) -> Result<Project, MembershipError> {
        self.mutate(project_id, |project| {
            require_admin(project, acting_user_id)?;
            if !project.join_requests.remove(target_user_id) {
                return Err(MembershipError::NoSuchRequest {
                    project_id: project_id.to_string(),
                    user_id: target_user_id.to_string(),
                });
            }
            project.members.insert(target_user_id.to_string());
            Ok(())
        })
        .await
    }

    pub async fn promote_admin(
        &self,
        project_id: &str,
        acting_user_id: &str,
        target_user_id: &str,
    ) -> Result<Project, MembershipError> {
        self.mutate(project_id, |project| {
            require_admin(project, acting_user_id)?;
            if !project.is_member(target_user_id) {
                return Err(MembershipError::NotAMember {
                    project_id: project_id.to_string(),
                    user_id: target_user_id.to_string(),
                });
            }
            if !project.admins.insert(target_user_id.to_string()) {
                return Err(MembershipError::AlreadyAdmin {
                    project_id: project_id.to_string(),
                    user_id: target_user_id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    pub async fn demote_admin(
        &self,
        project_id: &str,
        acting_user_id: &str,
        target_user_id: &str,
    ) -> Result<Project, MembershipError> {
        let guard = self.last_admin_guard;
        self.mutate(project_id, |project| {
            require_admin(project, acting_user_id)?;
            if !project.is_admin(target_user_id) {
                return Err(MembershipError::NotAnAdmin {
                    project_id: project_id.to_string(),
                    user_id: target_user_id.to_string(),
                });
            }
            if guard && project.admins.len() == 1 {
                return Err(MembershipError::LastAdmin {
                    project_id: project_id.to_string(),
                    user_id: target_user_id.to_string(),
                });
            }
            project.admins.remove(target_user_id);
            Ok(())
        })
        .await
    }

    pub async fn update_status(
        &self,
        project_id: &str,
        acting_user_id: &str,
        status: ProjectStatus,
    ) -> Result<Project, MembershipError> {
        self.update_project(
            project_id,
            acting_user_id,
            ProjectUpdate {
                status: Some(status),
                ..ProjectUpdate::default()
            },
        )
        .await
    }

    pub async fn update_project(
        &self,
        project_id: &str,
        acting_user_id: &str,
        update: ProjectUpdate,
    ) -> Result<Project, MembershipError> {
        self.mutate(project_id, |project| {
            require_admin(project, acting_user_id)?;
            if let Some(title) = update.title {
                let title = title.trim();
                if title.is_empty() {
                    return Err(MembershipError::Validation("title must not be empty".into()));
                }
                project.title = title.to_string();
            }
            if let Some(description) = update.description {
                project.description = description;
            }
            if let Some(status) = update.status {
                project.status = status;
            }
            Ok(())
        })
        .await
    }

    async fn mutate<F>(&self, project_id: &str, apply: F) -> Result<Project, MembershipError>
    where
        F: FnOnce(&mut Project) -> Result<(), MembershipError>,
    {
        let _guard = self.locks.lock(project_id).await;
        let mut project = self.get_project(project_id).await?;

        apply(&mut project)?;
        project
            .check_invariants()
            .map_err(|reason| MembershipError::InvariantViolated {
                project_id: project_id.to_string(),
                reason,
            })?;
        project.updated_at = Utc::now();

        self.store.save_project(project.clone()).await?;
        debug!("Project {} committed", project_id);
        Ok(project)
    }
}

fn require_admin(project: &Project, user_id: &str) -> Result<(), MembershipError> {
    if project.is_admin(user_id) {
        Ok(())
    } else {
        Err(MembershipError::NotAuthorized {
            project_id: project.id.clone(),
            user_id: user_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn authority(last_admin_guard: bool) -> MembershipAuthority {
        MembershipAuthority::new(Arc::new(MemoryStore::new()), last_admin_guard)
    }

    async fn project_of(authority: &MembershipAuthority, creator: &str) -> Project {
        authority
            .create_project(
                creator,
                NewProject {
                    title: "Apollo".into(),
                    ..NewProject::default()
                },
            )
            .await
            .unwrap()
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| (*id).to_string()).collect()
    }

    #[tokio::test]
    async fn full_membership_scenario() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;
        assert_eq!(project.status, ProjectStatus::Planning);
        assert_eq!(project.members, set(&["u1"]));
        assert_eq!(project.admins, set(&["u1"]));

        let project = authority.request_join(&project.id, "u2").await.unwrap();
        assert_eq!(project.join_requests, set(&["u2"]));

        let project = authority.accept_invite(&project.id, "u1", "u2").await.unwrap();
        assert_eq!(project.members, set(&["u1", "u2"]));
        assert!(project.join_requests.is_empty());

        let project = authority.promote_admin(&project.id, "u1", "u2").await.unwrap();
        assert_eq!(project.admins, set(&["u1", "u2"]));

        let project = authority
            .update_status(&project.id, "u2", ProjectStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(project.status, ProjectStatus::InProgress);
        assert!(authority.is_admin(&project.id, "u2").await.unwrap());
    }

    #[tokio::test]
    async fn second_join_request_is_reported_not_duplicated() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;

        authority.request_join(&project.id, "u2").await.unwrap();
        let second = authority.request_join(&project.id, "u2").await;
        assert_matches!(second, Err(MembershipError::DuplicateRequest { .. }));

        let stored = authority.get_project(&project.id).await.unwrap();
        assert_eq!(stored.join_requests, set(&["u2"]));

        let member = authority.request_join(&project.id, "u1").await;
        assert_matches!(member, Err(MembershipError::AlreadyMember { .. }));
    }

    #[tokio::test]
    async fn concurrent_accepts_admit_exactly_once() {
        let authority = Arc::new(authority(true));
        let project = project_of(&authority, "u1").await;
        authority.request_join(&project.id, "u2").await.unwrap();

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let authority = Arc::clone(&authority);
                let id = project.id.clone();
                tokio::spawn(async move { authority.accept_invite(&id, "u1", "u2").await })
            })
            .collect();

        let mut successes = 0;
        let mut missing = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => successes += 1,
                Err(MembershipError::NoSuchRequest { .. }) => missing += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((successes, missing), (1, 1));

        let stored = authority.get_project(&project.id).await.unwrap();
        assert_eq!(stored.members, set(&["u1", "u2"]));
        assert!(stored.join_requests.is_empty());
    }

    #[tokio::test]
    async fn non_admin_cannot_promote() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;
        authority.request_join(&project.id, "u2").await.unwrap();
        authority.accept_invite(&project.id, "u1", "u2").await.unwrap();

        let result = authority.promote_admin(&project.id, "u2", "u2").await;
        assert_matches!(
            result,
            Err(MembershipError::NotAuthorized { user_id, .. }) if user_id == "u2"
        );
        let stored = authority.get_project(&project.id).await.unwrap();
        assert_eq!(stored.admins, set(&["u1"]));
    }

    #[tokio::test]
    async fn promotion_preconditions() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;

        let outsider = authority.promote_admin(&project.id, "u1", "u3").await;
        assert_matches!(outsider, Err(MembershipError::NotAMember { .. }));

        let again = authority.promote_admin(&project.id, "u1", "u1").await;
        assert_matches!(again, Err(MembershipError::AlreadyAdmin { .. }));

        let unknown = authority.accept_invite(&project.id, "u1", "u3").await;
        assert_matches!(unknown, Err(MembershipError::NoSuchRequest { .. }));
    }

    #[tokio::test]
    async fn admin_rights_are_rechecked_on_every_call() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;
        authority.request_join(&project.id, "u2").await.unwrap();
        authority.accept_invite(&project.id, "u1", "u2").await.unwrap();
        authority.promote_admin(&project.id, "u1", "u2").await.unwrap();

        authority
            .update_status(&project.id, "u2", ProjectStatus::InProgress)
            .await
            .unwrap();
        authority.demote_admin(&project.id, "u1", "u2").await.unwrap();

        let result = authority
            .update_status(&project.id, "u2", ProjectStatus::Completed)
            .await;
        assert_matches!(result, Err(MembershipError::NotAuthorized { .. }));
    }

    #[tokio::test]
    async fn last_admin_guard_keeps_one_admin() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;

        let result = authority.demote_admin(&project.id, "u1", "u1").await;
        assert_matches!(result, Err(MembershipError::LastAdmin { .. }));
        assert_eq!(authority.get_project(&project.id).await.unwrap().admins, set(&["u1"]));
    }

    #[tokio::test]
    async fn without_guard_last_admin_can_be_removed() {
        let authority = authority(false);
        let project = project_of(&authority, "u1").await;

        let project = authority.demote_admin(&project.id, "u1", "u1").await.unwrap();
        assert!(project.admins.is_empty());
        assert!(project.is_member("u1"));
        assert!(project.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn update_project_applies_partial_changes() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;

        let updated = authority
            .update_project(
                &project.id,
                "u1",
                ProjectUpdate {
                    description: Some("moonshot".into()),
                    ..ProjectUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Apollo");
        assert_eq!(updated.description, "moonshot");
        assert!(updated.updated_at >= project.updated_at);

        let blank = authority
            .update_project(
                &project.id,
                "u1",
                ProjectUpdate {
                    title: Some("   ".into()),
                    ..ProjectUpdate::default()
                },
            )
            .await;
        assert_matches!(blank, Err(MembershipError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let authority = authority(true);
        assert_matches!(
            authority.request_join("nope", "u1").await,
            Err(MembershipError::ProjectNotFound { .. })
        );
        assert_matches!(
            authority.is_member("nope", "u1").await,
            Err(MembershipError::ProjectNotFound { .. })
        );
    }

    #[tokio::test]
    async fn invariants_hold_across_mixed_operations() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;
        let id = project.id.clone();

        for user in ["u2", "u3", "u4", "u5"] {
            authority.request_join(&id, user).await.unwrap();
        }
        let _ = authority.accept_invite(&id, "u1", "u2").await;
        let _ = authority.accept_invite(&id, "u1", "u3").await;
        let _ = authority.promote_admin(&id, "u1", "u3").await;
        let _ = authority.promote_admin(&id, "u1", "u4").await;
        let _ = authority.accept_invite(&id, "u3", "u4").await;
        let _ = authority.request_join(&id, "u4").await;
        let _ = authority.demote_admin(&id, "u3", "u1").await;
        let _ = authority.accept_invite(&id, "u2", "u5").await;

        let stored = authority.get_project(&id).await.unwrap();
        assert!(stored.check_invariants().is_ok());
        assert!(!stored.admins.is_empty());
        assert_eq!(stored.members, set(&["u1", "u2", "u3", "u4"]));
        assert_eq!(stored.join_requests, set(&["u5"]));
        assert_eq!(stored.admins, set(&["u3"]));
    }

    #[tokio::test]
    async fn project_locks_are_released_after_every_call() {
        let authority = authority(true);
        let project = project_of(&authority, "u1").await;

        for i in 0..100 {
            let missing = format!("missing-{i}");
            assert_matches!(
                authority.request_join(&missing, "u2").await,
                Err(MembershipError::ProjectNotFound { .. })
            );
        }
        authority.request_join(&project.id, "u2").await.unwrap();
        let _ = authority.promote_admin(&project.id, "u2", "u2").await;

        assert!(authority.locks.is_empty());
    }

    /// Holds every save until `stall` is cleared.
    struct SlowSaves {
        inner: MemoryStore,
        stall: AtomicBool,
    }

    #[async_trait]
    impl ProjectStore for SlowSaves {
        async fn load_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
            self.inner.load_project(project_id).await
        }

        async fn save_project(&self, project: Project) -> Result<(), StoreError> {
            while self.stall.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.inner.save_project(project).await
        }

        async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
            self.inner.list_projects().await
        }
    }

    #[tokio::test]
    async fn cancelled_accept_changes_nothing() {
        let store = Arc::new(SlowSaves {
            inner: MemoryStore::new(),
            stall: AtomicBool::new(false),
        });
        let authority = Arc::new(MembershipAuthority::new(store.clone(), true));
        let project = project_of(&authority, "u1").await;
        authority.request_join(&project.id, "u2").await.unwrap();

        store.stall.store(true, Ordering::SeqCst);
        let pending = {
            let authority = Arc::clone(&authority);
            let id = project.id.clone();
            tokio::spawn(async move { authority.accept_invite(&id, "u1", "u2").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        store.stall.store(false, Ordering::SeqCst);

        let stored = authority.get_project(&project.id).await.unwrap();
        assert!(stored.check_invariants().is_ok());
        assert_eq!(stored.members, set(&["u1"]));
        assert_eq!(stored.join_requests, set(&["u2"]));
        assert!(authority.locks.is_empty());

        let accepted = authority.accept_invite(&project.id, "u1", "u2").await.unwrap();
        assert_eq!(accepted.members, set(&["u1", "u2"]));
    }
}
