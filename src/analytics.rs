use std::collections::HashSet;

use serde::Serialize;

use crate::models::{Project, ProjectStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub status: ProjectStatus,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAnalytics {
    pub distribution: Vec<StatusCount>,
    /// Distinct members across the user's projects, the user included.
    pub team_reach: usize,
    /// Percentage of the user's projects that are completed, one decimal.
    pub completion_rate: f64,
}

/// Summarises the projects `user_id` is a member of.
pub fn user_analytics(projects: &[Project], user_id: &str) -> UserAnalytics {
    let mine: Vec<&Project> = projects.iter().filter(|p| p.is_member(user_id)).collect();

    let distribution = ProjectStatus::ALL
        .into_iter()
        .map(|status| StatusCount {
            status,
            count: mine.iter().filter(|p| p.status == status).count(),
        })
        .filter(|entry| entry.count > 0)
        .collect();

    let team_reach = mine
        .iter()
        .flat_map(|p| p.members.iter())
        .collect::<HashSet<_>>()
        .len();

    let completed = mine
        .iter()
        .filter(|p| p.status == ProjectStatus::Completed)
        .count();
    #[allow(clippy::cast_precision_loss)]
    let completion_rate = if mine.is_empty() {
        0.0
    } else {
        (completed as f64 / mine.len() as f64 * 1000.0).round() / 10.0
    };

    UserAnalytics {
        distribution,
        team_reach,
        completion_rate,
    }
}
