use std::sync::Mutex;

/// Read-only source of the bearer token attached to outgoing calls.
///
/// Token lifecycle (login, refresh, storage) is owned elsewhere; the core
/// only ever reads the current value.
pub trait CredentialProvider: Send + Sync {
    /// Current bearer token, if the user has one.
    fn credential(&self) -> Option<String>;
}

/// Fixed token, mostly useful for tests and one-shot tools.
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Reads the token from an environment variable on every call, so a token
/// exported after startup is picked up without a restart.
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvCredentials {
    fn credential(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|t| !t.is_empty())
    }
}

/// Mutable token slot shared with the embedding application.
pub struct SharedCredentials {
    token: Mutex<Option<String>>,
}

impl SharedCredentials {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(None),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.lock().unwrap() = token;
    }
}

impl Default for SharedCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for SharedCredentials {
    fn credential(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials() {
        assert_eq!(
            StaticCredentials::new("tok").credential(),
            Some("tok".to_string())
        );
        assert_eq!(StaticCredentials::anonymous().credential(), None);
    }

    #[test]
    fn test_shared_credentials_update() {
        let creds = SharedCredentials::new();
        assert_eq!(creds.credential(), None);

        creds.set(Some("abc".to_string()));
        assert_eq!(creds.credential(), Some("abc".to_string()));

        creds.set(None);
        assert_eq!(creds.credential(), None);
    }
}
