use secrecy::SecretString;

/// Application credentials presented to the synthesis provider on every socket.
#[derive(Clone)]
pub struct UpstreamCredentials {
    pub app_key: String,
    pub access_key: SecretString,
}

impl UpstreamCredentials {
    pub fn new(app_key: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            access_key: SecretString::from(access_key.into()),
        }
    }
}

impl std::fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("app_key", &self.app_key)
            .field("access_key", &"[REDACTED]")
            .finish()
    }
}
