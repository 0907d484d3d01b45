//! API error surface. Every failure maps to HTTP 400 with a plain-text body
//! `Error: <msg>`, matching what the CLI and test drivers expect.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use groupchat_raft::{CommandError, RaftError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Deterministic state-machine failure (user/room existence and so on).
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Consensus-layer failure: rejected proposal, read timeout, shutdown.
    #[error(transparent)]
    Raft(#[from] RaftError),

    /// Malformed request body, query, or path.
    #[error("{0}")]
    BadRequest(String),

    #[error("token is missing")]
    TokenMissing,

    #[error("token is invalid")]
    TokenInvalid,

    #[error("password is wrong")]
    WrongPassword,

    #[error("cluster has not started yet")]
    ClusterNotStarted,
}

impl ApiError {
    pub fn bad_request(err: impl std::fmt::Display) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::BadRequest()
            .content_type("text/plain")
            .body(format!("Error: {self}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_keep_their_wording() {
        assert_eq!(
            ApiError::from(CommandError::UserNotExists).to_string(),
            "user not exists"
        );
        assert_eq!(ApiError::TokenMissing.to_string(), "token is missing");
    }

    #[test]
    fn responses_are_400_plain_text() {
        let resp = ApiError::ClusterNotStarted.error_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
