use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Non-success response from the agent service.
    #[error("agent service error: status={status} body={body}")]
    Remote { status: u16, body: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl AgentError {
    /// The session (or other resource) is unknown to the service, usually because it expired.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Remote { status, body } => {
                *status == 404
                    || body.contains("NOT_FOUND")
                    || body.to_ascii_lowercase().contains("not found")
            }
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_detected_by_status() {
        let err = AgentError::Remote {
            status: 404,
            body: String::new(),
        };
        assert!(err.is_not_found());
    }

    #[test]
    fn not_found_is_detected_by_body_content() {
        let err = AgentError::Remote {
            status: 400,
            body: r#"{"error":{"status":"NOT_FOUND","message":"Session not found"}}"#.to_string(),
        };
        assert!(err.is_not_found());

        let err = AgentError::Remote {
            status: 500,
            body: "Requested entity was not found.".to_string(),
        };
        assert!(err.is_not_found());
    }

    #[test]
    fn other_failures_are_not_not_found() {
        let err = AgentError::Remote {
            status: 500,
            body: "internal".to_string(),
        };
        assert!(!err.is_not_found());
        assert!(!AgentError::Http("connection reset".to_string()).is_not_found());
    }
}
