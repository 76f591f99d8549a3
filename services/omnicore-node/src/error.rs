use axum::{http::StatusCode, response::IntoResponse, Json};
use omnicore_federation::FederationError;
use omnicore_identity::{AdminError, IdentityError, KeyStoreError, SessionError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Missing or malformed bearer token")]
    MissingToken,
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        ApiError::Identity(err.into())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError::Identity(err.into())
    }
}

impl From<KeyStoreError> for ApiError {
    fn from(err: KeyStoreError) -> Self {
        ApiError::Identity(err.into())
    }
}

fn session_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::Expired | SessionError::NotFound => StatusCode::UNAUTHORIZED,
        SessionError::LockPoisoned => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Identity(err) => match err {
                IdentityError::KeyStore(e) => match e {
                    KeyStoreError::InvalidClientId(_)
                    | KeyStoreError::InvalidPublicKeyFormat(_)
                    | KeyStoreError::Crypto(_) => StatusCode::BAD_REQUEST,
                    KeyStoreError::AlreadyRegistered(_)
                    | KeyStoreError::IncompleteRegistration(_) => StatusCode::CONFLICT,
                    KeyStoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    KeyStoreError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
                    KeyStoreError::Storage(_) | KeyStoreError::LockPoisoned(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                },
                IdentityError::Session(e) => session_status(e),
                IdentityError::Admin(e) => match e {
                    AdminError::InvalidCredential => StatusCode::UNAUTHORIZED,
                    AdminError::Forbidden => StatusCode::FORBIDDEN,
                    AdminError::Session(e) => session_status(e),
                    AdminError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                },
                IdentityError::NoPendingRegistration(_) => StatusCode::NOT_FOUND,
                IdentityError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Federation(err) => match err {
                FederationError::InvalidDescriptor(_)
                | FederationError::InvalidTrustLevel(_)
                | FederationError::Crypto(_) => StatusCode::BAD_REQUEST,
                FederationError::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
                FederationError::KeyMismatch { .. } | FederationError::Stale { .. } => {
                    StatusCode::CONFLICT
                }
                FederationError::NotFound(_) => StatusCode::NOT_FOUND,
                FederationError::PeerNotAuthenticated(_)
                | FederationError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
                FederationError::PeerUnreachable(_)
                | FederationError::Timeout(_)
                | FederationError::Transport(_) => StatusCode::BAD_GATEWAY,
                FederationError::Storage(_) | FederationError::LockPoisoned(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::MissingToken => StatusCode::UNAUTHORIZED,
        }
    }

    /// Server-side failures whose message is safe to show the caller.
    fn is_disclosable(&self) -> bool {
        matches!(
            self,
            ApiError::Federation(FederationError::CapacityExceeded { .. })
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        // Internal details stay in the log
        let message = if status.is_server_error() && !self.is_disclosable() {
            error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            warn!(status = status.as_u16(), error = %self, "Request rejected");
            self.to_string()
        };

        (
            status,
            Json(json!({
                "error": message,
                "status": status.as_u16(),
            })),
        )
            .into_response()
    }
}
