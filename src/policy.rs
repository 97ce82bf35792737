use crate::errors::{AppError, AppResult};
use crate::models::AppSettings;
use crate::session::{Identity, Role};
use std::collections::BTreeMap;

const MIN_PAGE_SIZE: u32 = 1;
const MAX_PAGE_SIZE: u32 = 5_000;
const MAX_DELETION_PAGE_SIZE: u32 = 10_000;
const MIN_POLL_INTERVAL_MS: u64 = 250;
const MAX_POLL_INTERVAL_MS: u64 = 600_000;
const MIN_CLOSE_DEBOUNCE_MS: u64 = 100;
const MAX_CLOSE_DEBOUNCE_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    ReadUserData,
    EditEntity,
    ManageDevice,
    AdministerModels,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadUserData => "read user data",
            Self::EditEntity => "edit entities",
            Self::ManageDevice => "manage device installs",
            Self::AdministerModels => "administer device models",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    /// Roles that may perform each action; an empty list means any signed-in user.
    grants: BTreeMap<Action, Vec<Role>>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessPolicy {
    pub fn new() -> Self {
        let grants = BTreeMap::from([
            (Action::ReadUserData, Vec::new()),
            (Action::EditEntity, Vec::new()),
            (Action::ManageDevice, vec![Role::Operator, Role::Admin]),
            (Action::AdministerModels, vec![Role::Admin]),
        ]);
        Self { grants }
    }

    pub fn authorize(&self, action: Action, identity: Option<&Identity>) -> AppResult<()> {
        let Some(identity) = identity else {
            return Err(AppError::NotAuthenticated(format!(
                "sign in to {}",
                action.as_str()
            )));
        };

        let required = self.grants.get(&action).map(Vec::as_slice).unwrap_or_default();
        if required.is_empty() || identity.has_any_role(required) {
            return Ok(());
        }

        Err(AppError::Forbidden(format!(
            "user {} may not {}",
            identity.user_id,
            action.as_str()
        )))
    }

    pub fn validate_settings(&self, settings: &AppSettings) -> AppResult<()> {
        let sync = &settings.sync;
        if let Some(page_size) = sync.entity_page_size {
            check_page_size("entityPageSize", page_size, MAX_PAGE_SIZE)?;
        }
        check_page_size("reactionPageSize", sync.reaction_page_size, MAX_PAGE_SIZE)?;
        check_page_size("deletionPageSize", sync.deletion_page_size, MAX_DELETION_PAGE_SIZE)?;

        let installer = &settings.installer;
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&installer.poll_interval_ms) {
            return Err(AppError::Policy(format!(
                "pollIntervalMs {} is out of allowed range ({}..={})",
                installer.poll_interval_ms, MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS
            )));
        }
        if !(MIN_CLOSE_DEBOUNCE_MS..=MAX_CLOSE_DEBOUNCE_MS).contains(&installer.close_debounce_ms) {
            return Err(AppError::Policy(format!(
                "closeDebounceMs {} is out of allowed range ({}..={})",
                installer.close_debounce_ms, MIN_CLOSE_DEBOUNCE_MS, MAX_CLOSE_DEBOUNCE_MS
            )));
        }

        Ok(())
    }
}

fn check_page_size(name: &str, value: u32, max: u32) -> AppResult<()> {
    if !(MIN_PAGE_SIZE..=max).contains(&value) {
        return Err(AppError::Policy(format!(
            "{} {} is out of allowed range ({}..={})",
            name, value, MIN_PAGE_SIZE, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{AccessPolicy, Action};
    use crate::errors::AppError;
    use crate::models::AppSettings;
    use crate::session::{Identity, Role};

    #[test]
    fn signed_out_is_not_authenticated() {
        let policy = AccessPolicy::new();
        let err = policy.authorize(Action::ReadUserData, None).expect_err("signed out");
        assert!(matches!(err, AppError::NotAuthenticated(_)));
    }

    #[test]
    fn members_read_but_do_not_manage_devices() {
        let policy = AccessPolicy::new();
        let member = Identity::new("u-1");
        assert!(policy.authorize(Action::ReadUserData, Some(&member)).is_ok());
        assert!(policy.authorize(Action::EditEntity, Some(&member)).is_ok());

        let err = policy.authorize(Action::ManageDevice, Some(&member)).expect_err("member");
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn model_administration_requires_admin() {
        let policy = AccessPolicy::new();
        let operator = Identity::new("u-2").with_role(Role::Operator);
        assert!(policy.authorize(Action::ManageDevice, Some(&operator)).is_ok());
        assert!(matches!(
            policy.authorize(Action::AdministerModels, Some(&operator)),
            Err(AppError::Forbidden(_))
        ));

        let admin = Identity::new("u-3").with_role(Role::Admin);
        assert!(policy.authorize(Action::AdministerModels, Some(&admin)).is_ok());
        assert!(policy.authorize(Action::ManageDevice, Some(&admin)).is_ok());
    }

    #[test]
    fn default_settings_are_within_bounds() {
        assert!(AccessPolicy::new().validate_settings(&AppSettings::default()).is_ok());
    }

    #[test]
    fn rejects_out_of_range_settings() {
        let policy = AccessPolicy::new();

        let mut settings = AppSettings::default();
        settings.sync.reaction_page_size = 0;
        assert!(matches!(policy.validate_settings(&settings), Err(AppError::Policy(_))));

        let mut settings = AppSettings::default();
        settings.installer.close_debounce_ms = 20;
        let err = policy.validate_settings(&settings).expect_err("debounce too short");
        assert!(err.to_string().contains("closeDebounceMs"));

        let mut settings = AppSettings::default();
        settings.sync.entity_page_size = Some(50_000);
        assert!(policy.validate_settings(&settings).is_err());
    }
}
