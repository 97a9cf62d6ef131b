use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::MembershipError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProjectStatus {
    #[default]
    #[serde(rename = "planning")]
    Planning,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 3] = [
        ProjectStatus::Planning,
        ProjectStatus::InProgress,
        ProjectStatus::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Planning => "planning",
            ProjectStatus::InProgress => "in-progress",
            ProjectStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProjectStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| MembershipError::InvalidStatus {
                value: s.to_string(),
            })
    }
}

fn sorted<S: Serializer>(set: &HashSet<String>, serializer: S) -> Result<S::Ok, S::Error> {
    let mut ids: Vec<&String> = set.iter().collect();
    ids.sort();
    serializer.collect_seq(ids)
}

/// Membership-relevant view of a project record.
///
/// Role sets are hash sets so that every authorization check is a single
/// lookup; on the wire they are arrays in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default, serialize_with = "sorted")]
    pub members: HashSet<String>,
    #[serde(default, serialize_with = "sorted")]
    pub admins: HashSet<String>,
    #[serde(default, serialize_with = "sorted")]
    pub join_requests: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewProject {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
}

impl Project {
    /// Builds a fresh project with `creator` as its only member and admin.
    pub fn new(creator: &str, details: NewProject) -> Result<Self, MembershipError> {
        let title = details.title.trim();
        if title.is_empty() {
            return Err(MembershipError::Validation("title must not be empty".into()));
        }

        let now = Utc::now();
        Ok(Project {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: details.description.unwrap_or_default(),
            status: details.status.unwrap_or_default(),
            members: HashSet::from([creator.to_string()]),
            admins: HashSet::from([creator.to_string()]),
            join_requests: HashSet::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }

    pub fn has_requested(&self, user_id: &str) -> bool {
        self.join_requests.contains(user_id)
    }

    /// Checks `admins ⊆ members` and `members ∩ joinRequests = ∅`.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(admin) = self.admins.iter().find(|a| !self.members.contains(*a)) {
            return Err(format!("admin {admin} is not a member"));
        }
        if let Some(user) = self.members.intersection(&self.join_requests).next() {
            return Err(format!("member {user} still has a pending join request"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
