//! Invalidation helpers for write paths.
//!
//! A missing profile id is a no-op everywhere except the exercise catalog,
//! where it targets the public scope.

use super::layer::CacheLayer;
use super::strategy::{CacheResource, ResourceParams};

fn present(profile_id: Option<&str>) -> Option<&str> {
    profile_id.filter(|id| !id.is_empty())
}

impl CacheLayer {
    pub async fn invalidate_profile_summary(&self, profile_id: Option<&str>) {
        let Some(profile_id) = present(profile_id) else {
            return;
        };
        self.invalidate(&ResourceParams::ProfileSummary {
            profile_id: profile_id.to_string(),
        })
        .await;
    }

    pub fn invalidate_reports(&self, profile_id: Option<&str>) {
        if let Some(profile_id) = present(profile_id) {
            self.bump_scope(CacheResource::Reports, profile_id);
        }
    }

    pub fn invalidate_exercise_catalog(&self, profile_id: Option<&str>) {
        self.bump_scope(
            CacheResource::ExerciseCatalog,
            present(profile_id).unwrap_or("public"),
        );
    }

    pub fn invalidate_assistant_notes(&self, profile_id: Option<&str>) {
        if let Some(profile_id) = present(profile_id) {
            self.bump_scope(CacheResource::AssistantNotesPage, profile_id);
        }
    }

    /// Everything derived from a profile's training sessions.
    pub async fn invalidate_session_derived(&self, profile_id: Option<&str>) {
        let Some(profile_id) = present(profile_id) else {
            return;
        };
        self.invalidate_reports(Some(profile_id));
        self.invalidate_exercise_catalog(Some(profile_id));
        self.invalidate_profile_summary(Some(profile_id)).await;
    }
}
