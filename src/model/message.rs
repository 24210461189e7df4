use rouille::Response;
use serde::Serialize;

use crate::error::SessionError;

/// JSON body of every error reply.
#[derive(Debug, Serialize)]
pub struct Message {
    pub status: u8,
    pub payload: String,
}

impl Message {
    pub fn failure(payload: impl Into<String>) -> Message {
        Message {
            status: 0,
            payload: payload.into(),
        }
    }

    /// Indented JSON reply with the given status code.
    pub fn into_response(self, status_code: u16) -> Response {
        let body = serde_json::to_vec_pretty(&self).unwrap_or_default();
        Response::from_data("application/json; charset=utf-8", body).with_status_code(status_code)
    }
}

impl From<&SessionError> for Response {
    fn from(err: &SessionError) -> Response {
        Message::failure(err.to_string()).into_response(err.status_code())
    }
}
