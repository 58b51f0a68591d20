use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A registered account as the account service reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
}

/// Account lookup; storage lives outside this core.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn get_user(&self, id: u64) -> Result<Option<User>>;
}

/// Directory backed by the account HTTP API.
pub struct HttpUserDirectory {
    base: String,
    http: reqwest::Client,
}

impl HttpUserDirectory {
    pub fn new(base: String) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn get_user(&self, id: u64) -> Result<Option<User>> {
        let resp = self
            .http
            .get(format!("{}/users/{id}", self.base))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(
            resp.error_for_status()?
                .json()
                .await
                .context("malformed user response")?,
        ))
    }
}

/// Fixed set of accounts; used by tests and offline development.
#[derive(Default)]
pub struct FixedUserDirectory {
    users: Vec<User>,
}

impl FixedUserDirectory {
    pub fn with(users: Vec<User>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserDirectory for FixedUserDirectory {
    async fn get_user(&self, id: u64) -> Result<Option<User>> {
        Ok(self.users.iter().find(|u| u.id == id).cloned())
    }
}
