//! Mapping of manager errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use dbflow_core::{
    flow::FlowError, pipeline::PipelineError, ticket::TicketError, todo::TodoError,
    ManagerError,
};

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// An error with the status code it is answered with.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let status = match &err {
            ManagerError::Validation(_) => StatusCode::BAD_REQUEST,
            ManagerError::TicketNotFound(_) => StatusCode::NOT_FOUND,
            ManagerError::InvalidState { .. } => StatusCode::CONFLICT,
            ManagerError::TicketStore(e) => match e {
                TicketError::NotFound(_) => StatusCode::NOT_FOUND,
                TicketError::InvalidState { .. } => StatusCode::CONFLICT,
                TicketError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ManagerError::Todo(e) => match e {
                TodoError::NotFound(_) => StatusCode::NOT_FOUND,
                TodoError::WrongOperator { .. } => StatusCode::FORBIDDEN,
                TodoError::AlreadyResolved { .. } => StatusCode::CONFLICT,
                TodoError::InvalidAction { .. } => StatusCode::BAD_REQUEST,
                TodoError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ManagerError::Pipeline(e) => pipeline_status(e),
            ManagerError::Flow(FlowError::External(_)) => StatusCode::BAD_GATEWAY,
            ManagerError::Flow(FlowError::Pipeline(e)) => pipeline_status(e),
            ManagerError::Flow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn pipeline_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::PipelineNotFound(_) | PipelineError::NodeNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        PipelineError::InvalidState { .. } => StatusCode::CONFLICT,
        PipelineError::MissingContext { .. }
        | PipelineError::Empty(_)
        | PipelineError::UnknownActivity(_) => StatusCode::BAD_REQUEST,
        PipelineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbflow_core::{todo::TodoStatus, TicketStatus};

    #[test]
    fn test_status_mapping() {
        let cases = vec![
            (
                ManagerError::Validation("cluster_id is required".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ManagerError::TicketNotFound("t-1".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                ManagerError::InvalidState {
                    ticket_id: "t-1".to_string(),
                    status: TicketStatus::Terminated,
                    operation: "retry".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                ManagerError::Todo(TodoError::WrongOperator {
                    todo_id: "d-1".to_string(),
                    username: "mallory".to_string(),
                }),
                StatusCode::FORBIDDEN,
            ),
            (
                ManagerError::Todo(TodoError::AlreadyResolved {
                    todo_id: "d-1".to_string(),
                    status: TodoStatus::Done,
                }),
                StatusCode::CONFLICT,
            ),
            (
                ManagerError::Pipeline(PipelineError::NodeNotFound("n-1".to_string())),
                StatusCode::NOT_FOUND,
            ),
        ];

        for (err, expected) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status, expected, "{}", api.message);
        }
    }

    #[test]
    fn test_message_is_kept() {
        let api = ApiError::from(ManagerError::TicketNotFound("t-9".to_string()));
        assert_eq!(api.message, "ticket not found: t-9");
    }
}
