/// Account credentials and jid addressing
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Login material for one realtime session.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub resource: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
            resource: resource.into(),
        }
    }

    /// Full address: `username@domain/resource`
    pub fn jid(&self) -> String {
        format!("{}/{}", self.bare_jid(), self.resource)
    }

    /// Contact address: `username@domain`
    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }

    /// Reject credentials that can never authenticate.
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(ChatError::Credentials("username is empty".to_string()));
        }
        if self.username.contains('@') || self.username.contains('/') {
            return Err(ChatError::Credentials(format!(
                "username contains a reserved character: {}",
                self.username
            )));
        }
        if self.password.is_empty() {
            return Err(ChatError::Credentials("password is empty".to_string()));
        }
        if self.domain.trim().is_empty() {
            return Err(ChatError::Credentials("domain is empty".to_string()));
        }
        Ok(())
    }
}

// Keep the password out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("jid", &self.jid())
            .finish_non_exhaustive()
    }
}

/// Strip the resource part from an address.
pub fn bare(jid: &str) -> &str {
    jid.split_once('/').map(|(b, _)| b).unwrap_or(jid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jid_forms() {
        let creds = Credentials::new("alice", "pw", "tradepost.local", "web");
        assert_eq!(creds.jid(), "alice@tradepost.local/web");
        assert_eq!(creds.bare_jid(), "alice@tradepost.local");
        assert_eq!(bare("alice@tradepost.local/web"), "alice@tradepost.local");
        assert_eq!(bare("bob@tradepost.local"), "bob@tradepost.local");
    }

    #[test]
    fn test_validate() {
        assert!(Credentials::new("alice", "pw", "d", "r").validate().is_ok());
        assert!(Credentials::new("", "pw", "d", "r").validate().is_err());
        assert!(Credentials::new("al@ice", "pw", "d", "r").validate().is_err());
        assert!(Credentials::new("alice", "", "d", "r").validate().is_err());
        assert!(Credentials::new("alice", "pw", " ", "r").validate().is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = Credentials::new("alice", "hunter2", "d", "r");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
