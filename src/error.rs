// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Error types shared by the session controller and its adapters.
//!
//! Every public operation resolves to a value: either its success payload or
//! an [`AuthError`]. Screens render [`AuthError::message`] in a blocking alert.

use serde::Serialize;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Failure of an identity, storage or controller operation.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request never reached the provider or timed out.
    #[error("Network request failed: {0}")]
    Connectivity(String),

    /// The provider rejected the credentials (wrong password, duplicate email...).
    #[error("{0}")]
    Credential(String),

    /// The operation needs a signed-in user and there is none.
    #[error("No authenticated user")]
    NotAuthenticated,

    /// Input rejected locally before any network call.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The backend answered with a non-success status.
    #[error("Backend error (HTTP {status}): {message}")]
    Backend { status: u16, message: String },

    /// Local session persistence failed.
    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Serializable error payload handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "app/src/generated/")
)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl AuthError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Connectivity(_) => "connectivity",
            AuthError::Credential(_) => "credential",
            AuthError::NotAuthenticated => "not_authenticated",
            AuthError::Validation(_) => "validation",
            AuthError::Backend { .. } => "backend",
            AuthError::Storage(_) => "storage",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Human readable message, never empty.
    pub fn message(&self) -> String {
        let message = self.to_string();
        if message.trim().is_empty() {
            format!("Request failed ({})", self.kind())
        } else {
            message
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, AuthError::Connectivity(_))
    }

    /// True when the provider refused a token or credential outright.
    pub fn is_rejection(&self) -> bool {
        match self {
            AuthError::Credential(_) => true,
            AuthError::Backend { status, .. } => matches!(status, 400 | 401 | 403),
            _ => false,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind().to_string(),
            message: self.message(),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            AuthError::Connectivity(err.to_string())
        } else if err.is_decode() {
            AuthError::Internal(anyhow::anyhow!("Malformed response body: {}", err))
        } else {
            AuthError::Internal(anyhow::anyhow!(err))
        }
    }
}

/// Result type alias for controller and adapter operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_message_is_verbatim() {
        let err = AuthError::Credential("Invalid login credentials".to_string());
        assert_eq!(err.message(), "Invalid login credentials");
        assert_eq!(err.kind(), "credential");
        assert!(err.is_rejection());
    }

    #[test]
    fn empty_credential_message_falls_back() {
        let err = AuthError::Credential(String::new());
        assert_eq!(err.message(), "Request failed (credential)");
    }

    #[test]
    fn body_carries_kind_and_message() {
        let body = AuthError::NotAuthenticated.to_body();
        assert_eq!(body.error, "not_authenticated");
        assert_eq!(body.message, "No authenticated user");
    }

    #[test]
    fn server_errors_are_not_rejections() {
        let err = AuthError::Backend {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(!err.is_rejection());
        assert!(!err.is_connectivity());
    }
}
