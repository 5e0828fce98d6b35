//! Line-delimited JSON command protocol.
//!
//! Requests are `{"cmd": "<name>"}` objects, one per line. Every request gets
//! exactly one response line.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::models::{Circle, DetectionResult};

/// Error codes carried in the `error` field of failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("no frame has been captured yet")]
    NoFrame,
    #[error("request is not a JSON object")]
    InvalidJson,
    #[error("unknown command")]
    UnknownCommand,
    #[error("detection failed")]
    DetectionFailed,
    #[error("too many sessions")]
    ServerBusy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Carries the name as sent, so the `detecet` alias is echoed back unchanged.
    Detect(String),
    Ping,
    Unknown(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Detect(name) => name,
            Command::Ping => "ping",
            Command::Unknown(name) => name,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object")]
    NotObject,
    #[error("\"cmd\" must be a string")]
    CommandNotString,
}

/// Parse one trimmed, non-empty record. Unknown fields are ignored; a missing
/// `cmd` is an unknown command with an empty name.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(fields) = value else {
        return Err(ParseError::NotObject);
    };

    let name = match fields.get("cmd") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_lowercase(),
        Some(_) => return Err(ParseError::CommandNotString),
    };

    Ok(match name.as_str() {
        "detect" | "detecet" => Command::Detect(name),
        "ping" => Command::Ping,
        _ => Command::Unknown(name),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircleReport {
    pub center_x: u32,
    pub center_y: u32,
    pub radius: u32,
    pub diameter: u32,
    pub image: ImageSize,
}

impl CircleReport {
    fn new(circle: &Circle, image: ImageSize) -> Self {
        Self {
            center_x: circle.center_x,
            center_y: circle.center_y,
            radius: circle.radius,
            diameter: circle.diameter(),
            image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circles: Option<Vec<CircleReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

impl Response {
    pub fn pong() -> Self {
        Self {
            success: true,
            error: None,
            cmd: Some("ping".to_string()),
            circles: None,
            message: Some("pong".to_string()),
            timestamp: timestamp(),
        }
    }

    pub fn error(code: ErrorCode, cmd: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(code),
            cmd: cmd.map(str::to_string),
            circles: None,
            message: Some(message.into()),
            timestamp: timestamp(),
        }
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::error(ErrorCode::UnknownCommand, Some(name), format!("unknown command: {name:?}"))
    }

    pub fn invalid_json(reason: impl std::fmt::Display) -> Self {
        Self::error(ErrorCode::InvalidJson, None, reason.to_string())
    }

    /// Answer to a finished detection. A failed pipeline run becomes
    /// `detection_failed`; an empty success keeps its diagnostic message.
    pub fn detection(cmd: &str, result: &DetectionResult) -> Self {
        if !result.is_success() {
            let message = result.message.clone().unwrap_or_else(|| ErrorCode::DetectionFailed.to_string());
            return Self::error(ErrorCode::DetectionFailed, Some(cmd), message);
        }

        let image = ImageSize {
            width: result.width,
            height: result.height,
        };
        Self {
            success: true,
            error: None,
            cmd: Some(cmd.to_string()),
            circles: Some(result.circles.iter().map(|c| CircleReport::new(c, image)).collect()),
            message: result.message.clone(),
            timestamp: timestamp(),
        }
    }

    /// Serialized response including the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// RFC 3339 local time, falling back to UTC when the offset is unknown.
pub fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string())
}
