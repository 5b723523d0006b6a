use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Authenticated user attached to a client connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
}

impl Identity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            user_type: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token not provided")]
    MissingToken,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Validates client credentials. Issuing them is someone else's job.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;

    #[async_trait]
    impl TokenVerifier for AcceptAll {
        async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
            if token.is_empty() {
                return Err(AuthError::MissingToken);
            }
            Ok(Identity::new(token))
        }
    }

    #[tokio::test]
    async fn verifier_is_object_safe() {
        let verifier: Box<dyn TokenVerifier> = Box::new(AcceptAll);
        assert_eq!(verifier.verify("u1").await.unwrap().uid, "u1");
        assert_eq!(verifier.verify("").await, Err(AuthError::MissingToken));
    }

    #[test]
    fn identity_serde_uses_camel_case() {
        let identity = Identity {
            uid: "42".into(),
            user_type: Some("admin".into()),
        };
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["userType"], "admin");

        let plain: Identity = serde_json::from_str(r#"{"uid":"7"}"#).unwrap();
        assert_eq!(plain, Identity::new("7"));
    }
}
