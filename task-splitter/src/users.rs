//! User profile management.
//!
//! Profiles are keyed by an opaque identity token supplied by the caller's
//! auth layer; this module never validates identities itself. The avatar is
//! stored as an opaque blob reference only.

use anyhow::{anyhow, Result};
use task_splitter_sdk::UserProfile;

use crate::database::SharedDatabase;

/// Partial profile update; `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub avatar_blob: Option<String>,
}

pub struct ProfileService {
    db: SharedDatabase,
}

impl ProfileService {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Update-or-create the profile for an identity token.
    pub fn update_profile(&self, token_identifier: &str, update: ProfileUpdate) -> Result<UserProfile> {
        if token_identifier.trim().is_empty() {
            return Err(anyhow!("identity token must not be empty"));
        }
        let db = self.db.lock().unwrap();
        db.upsert_profile(token_identifier, &update)
    }

    /// Fetch the profile for an identity token, if one exists.
    pub fn get_profile(&self, token_identifier: &str) -> Result<Option<UserProfile>> {
        let db = self.db.lock().unwrap();
        db.get_profile(token_identifier)
    }

    /// Attach an uploaded avatar by its storage reference.
    pub fn set_avatar(&self, token_identifier: &str, blob_ref: &str) -> Result<UserProfile> {
        self.update_profile(
            token_identifier,
            ProfileUpdate {
                avatar_blob: Some(blob_ref.to_string()),
                ..Default::default()
            },
        )
    }

    /// Flag the profile as having finished onboarding.
    pub fn complete_onboarding(&self, token_identifier: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        if !db.set_onboarded(token_identifier)? {
            return Err(anyhow!("no profile for token {}", token_identifier));
        }
        Ok(())
    }
}
