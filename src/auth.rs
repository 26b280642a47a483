use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_HOLDER_LEN;
use crate::model::Role;

/// Who may log in and with which role. Everyone shares one password; the
/// login user is the holder identity and the role comes from the rosters.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    password: String,
    admins: HashSet<String>,
    super_admins: HashSet<String>,
}

impl AccessPolicy {
    pub fn new(
        password: String,
        admins: impl IntoIterator<Item = String>,
        super_admins: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            password,
            admins: roster(admins),
            super_admins: roster(super_admins),
        }
    }

    /// Holder names compare case-insensitively, so rosters do too.
    pub fn role_of(&self, user: &str) -> Role {
        let user = user.trim().to_lowercase();
        if self.super_admins.contains(&user) {
            Role::SuperAdmin
        } else if self.admins.contains(&user) {
            Role::Admin
        } else {
            Role::Operator
        }
    }
}

#[derive(Debug)]
pub struct SlotlockAuthSource {
    policy: Arc<AccessPolicy>,
}

impl SlotlockAuthSource {
    pub fn new(policy: Arc<AccessPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AuthSource for SlotlockAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match login.user() {
            Some(user) if usable_login(user) => {
                Ok(Password::new(None, self.policy.password.as_bytes().to_vec()))
            }
            _ => Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "login user must be a non-blank holder name".into(),
            )))),
        }
    }
}

fn roster(names: impl IntoIterator<Item = String>) -> HashSet<String> {
    names.into_iter().map(|n| n.trim().to_lowercase()).collect()
}

fn usable_login(user: &str) -> bool {
    !user.trim().is_empty() && user.len() <= MAX_HOLDER_LEN
}
