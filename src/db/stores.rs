use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{DatabaseScope, Table};
use std::sync::Arc;

/// The two logical databases: app-scoped, and per signed-in user when there is one.
#[derive(Debug, Clone)]
pub struct Stores {
    app: Arc<Database>,
    user: Option<Arc<Database>>,
}

impl Stores {
    pub fn new(app: Arc<Database>, user: Option<Arc<Database>>) -> Self {
        Self { app, user }
    }

    pub fn app(&self) -> &Arc<Database> {
        &self.app
    }

    pub fn user(&self) -> AppResult<&Arc<Database>> {
        self.user
            .as_ref()
            .ok_or_else(|| AppError::NotAuthenticated("user data requires a signed-in identity".to_string()))
    }

    pub fn has_user(&self) -> bool {
        self.user.is_some()
    }

    pub fn for_scope(&self, scope: DatabaseScope) -> AppResult<&Arc<Database>> {
        match scope {
            DatabaseScope::App => Ok(&self.app),
            DatabaseScope::User => self.user(),
        }
    }

    pub fn for_table(&self, table: Table) -> AppResult<&Arc<Database>> {
        self.for_scope(table.scope())
    }

    /// Durable key-value settings for the current identity; the app database when signed out.
    pub fn settings(&self) -> &Arc<Database> {
        self.user.as_ref().unwrap_or(&self.app)
    }

    /// Tables that have local storage under the current identity.
    pub fn tables(&self) -> Vec<Table> {
        Table::ALL
            .into_iter()
            .filter(|table| table.scope() == DatabaseScope::App || self.user.is_some())
            .collect()
    }
}
