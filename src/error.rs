use serde::{Deserialize, Serialize};
use thiserror::Error;
use warp::http::StatusCode;

/// Coarse error taxonomy shared by the HTTP API and the WebSocket gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Authorization,
    Conflict,
    NotFound,
    Validation,
    Persistence,
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Persistence => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Implemented by every error that can reach a client.
pub trait Classify: std::fmt::Display {
    fn kind(&self) -> ErrorKind;

    /// Stable machine-readable name, e.g. `AlreadyMember`.
    fn code(&self) -> &'static str;

    fn project_id(&self) -> Option<&str> {
        None
    }

    fn user_id(&self) -> Option<&str> {
        None
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store write timed out")]
    Timeout,
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Persistence
    }

    fn code(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "StoreUnavailable",
            StoreError::Timeout => "StoreTimeout",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("authentication timed out")]
    Timeout,
}

impl Classify for AuthError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Authentication
    }

    fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "MissingCredential",
            AuthError::InvalidCredential(_) => "InvalidCredential",
            AuthError::Timeout => "AuthenticationTimeout",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("project {project_id} not found")]
    ProjectNotFound { project_id: String },
    #[error("user {user_id} is not authorized as admin of project {project_id}")]
    NotAuthorized { project_id: String, user_id: String },
    #[error("user {user_id} is already a member of project {project_id}")]
    AlreadyMember { project_id: String, user_id: String },
    #[error("user {user_id} already requested to join project {project_id}")]
    DuplicateRequest { project_id: String, user_id: String },
    #[error("user {user_id} has not requested to join project {project_id}")]
    NoSuchRequest { project_id: String, user_id: String },
    #[error("user {user_id} must be a member of project {project_id} first")]
    NotAMember { project_id: String, user_id: String },
    #[error("user {user_id} is already an admin of project {project_id}")]
    AlreadyAdmin { project_id: String, user_id: String },
    #[error("user {user_id} is not an admin of project {project_id}")]
    NotAnAdmin { project_id: String, user_id: String },
    #[error("user {user_id} is the last admin of project {project_id}")]
    LastAdmin { project_id: String, user_id: String },
    #[error("invalid status {value:?}, expected planning, in-progress or completed")]
    InvalidStatus { value: String },
    #[error("invalid project: {0}")]
    Validation(String),
    #[error("project {project_id} would violate an invariant: {reason}")]
    InvariantViolated { project_id: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for MembershipError {
    fn kind(&self) -> ErrorKind {
        match self {
            MembershipError::NotAuthorized { .. } => ErrorKind::Authorization,
            MembershipError::AlreadyMember { .. }
            | MembershipError::DuplicateRequest { .. }
            | MembershipError::AlreadyAdmin { .. }
            | MembershipError::LastAdmin { .. } => ErrorKind::Conflict,
            MembershipError::ProjectNotFound { .. } | MembershipError::NoSuchRequest { .. } => {
                ErrorKind::NotFound
            }
            MembershipError::NotAMember { .. }
            | MembershipError::NotAnAdmin { .. }
            | MembershipError::InvalidStatus { .. }
            | MembershipError::Validation(_) => ErrorKind::Validation,
            MembershipError::InvariantViolated { .. } => ErrorKind::Internal,
            MembershipError::Store(e) => e.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            MembershipError::ProjectNotFound { .. } => "ProjectNotFound",
            MembershipError::NotAuthorized { .. } => "NotAuthorized",
            MembershipError::AlreadyMember { .. } => "AlreadyMember",
            MembershipError::DuplicateRequest { .. } => "DuplicateRequest",
            MembershipError::NoSuchRequest { .. } => "NoSuchRequest",
            MembershipError::NotAMember { .. } => "NotAMember",
            MembershipError::AlreadyAdmin { .. } => "AlreadyAdmin",
            MembershipError::NotAnAdmin { .. } => "NotAnAdmin",
            MembershipError::LastAdmin { .. } => "LastAdmin",
            MembershipError::InvalidStatus { .. } => "InvalidStatus",
            MembershipError::Validation(_) => "Validation",
            MembershipError::InvariantViolated { .. } => "InvariantViolated",
            MembershipError::Store(e) => e.code(),
        }
    }

    fn project_id(&self) -> Option<&str> {
        match self {
            MembershipError::ProjectNotFound { project_id }
            | MembershipError::InvariantViolated { project_id, .. }
            | MembershipError::NotAuthorized { project_id, .. }
            | MembershipError::AlreadyMember { project_id, .. }
            | MembershipError::DuplicateRequest { project_id, .. }
            | MembershipError::NoSuchRequest { project_id, .. }
            | MembershipError::NotAMember { project_id, .. }
            | MembershipError::AlreadyAdmin { project_id, .. }
            | MembershipError::NotAnAdmin { project_id, .. }
            | MembershipError::LastAdmin { project_id, .. } => Some(project_id),
            _ => None,
        }
    }

    fn user_id(&self) -> Option<&str> {
        match self {
            MembershipError::NotAuthorized { user_id, .. }
            | MembershipError::AlreadyMember { user_id, .. }
            | MembershipError::DuplicateRequest { user_id, .. }
            | MembershipError::NoSuchRequest { user_id, .. }
            | MembershipError::NotAMember { user_id, .. }
            | MembershipError::AlreadyAdmin { user_id, .. }
            | MembershipError::NotAnAdmin { user_id, .. }
            | MembershipError::LastAdmin { user_id, .. } => Some(user_id),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("connection has not joined room {room_id}")]
    NotInRoom { room_id: String },
    #[error("connection {connection_id} is no longer registered")]
    SessionClosed { connection_id: String },
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for GatewayError {
    fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Malformed(_) | GatewayError::EmptyContent => ErrorKind::Validation,
            GatewayError::NotInRoom { .. } => ErrorKind::Authorization,
            GatewayError::SessionClosed { .. } => ErrorKind::NotFound,
            GatewayError::Membership(e) => e.kind(),
            GatewayError::Store(e) => e.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::Malformed(_) => "MalformedFrame",
            GatewayError::EmptyContent => "EmptyContent",
            GatewayError::NotInRoom { .. } => "NotInRoom",
            GatewayError::SessionClosed { .. } => "SessionClosed",
            GatewayError::Membership(e) => e.code(),
            GatewayError::Store(e) => e.code(),
        }
    }

    fn project_id(&self) -> Option<&str> {
        match self {
            GatewayError::NotInRoom { room_id } => Some(room_id),
            GatewayError::Membership(e) => e.project_id(),
            _ => None,
        }
    }

    fn user_id(&self) -> Option<&str> {
        match self {
            GatewayError::Membership(e) => e.user_id(),
            _ => None,
        }
    }
}

/// JSON body carried by API error responses and gateway `error` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ErrorBody {
    pub fn from_error<E: Classify + ?Sized>(err: &E) -> Self {
        ErrorBody {
            kind: err.kind(),
            code: err.code().to_string(),
            message: err.to_string(),
            project_id: err.project_id().map(str::to_string),
            user_id: err.user_id().map(str::to_string),
        }
    }
}
