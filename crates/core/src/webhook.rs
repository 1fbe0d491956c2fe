use crate::form::FormParams;
use crate::UNKNOWN_LABEL;

/// Message status callback payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStatusCallback {
    pub message_sid: String,
    pub account_sid: String,
    pub from: String,
    pub to: String,
    pub message_status: String,
    pub error_code: String,
}

/// Call status callback payload. `disconnect_reason` is read from `CallbackSource`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStatusCallback {
    pub call_sid: String,
    pub account_sid: String,
    pub from: String,
    pub to: String,
    pub call_status: String,
    pub call_duration: String,
    pub timestamp: String,
    pub recording_url: String,
    pub reason: String,
    pub disconnect_reason: String,
}

/// Counter a message callback contributes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    Delivered,
    Failed { error_code: String },
    Unrecorded,
}

/// Counter a call callback contributes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Completed { call_status: String },
    Failed { disconnect_reason: String },
    Unrecorded,
}

impl MessageStatusCallback {
    pub fn from_form(params: &FormParams) -> Self {
        Self {
            message_sid: params.get("MessageSid").to_string(),
            account_sid: params.get("AccountSid").to_string(),
            from: params.get("From").to_string(),
            to: params.get("To").to_string(),
            message_status: params.get("MessageStatus").to_string(),
            error_code: params.get("ErrorCode").to_string(),
        }
    }

    pub fn classify(&self) -> MessageEvent {
        match self.message_status.as_str() {
            "delivered" => MessageEvent::Delivered,
            "failed" | "undelivered" => MessageEvent::Failed {
                error_code: if self.error_code.is_empty() {
                    UNKNOWN_LABEL.to_string()
                } else {
                    self.error_code.clone()
                },
            },
            _ => MessageEvent::Unrecorded,
        }
    }
}

impl CallStatusCallback {
    pub fn from_form(params: &FormParams) -> Self {
        Self {
            call_sid: params.get("CallSid").to_string(),
            account_sid: params.get("AccountSid").to_string(),
            from: params.get("From").to_string(),
            to: params.get("To").to_string(),
            call_status: params.get("CallStatus").to_string(),
            call_duration: params.get("CallDuration").to_string(),
            timestamp: params.get("Timestamp").to_string(),
            recording_url: params.get("RecordingUrl").to_string(),
            reason: params.get("Reason").to_string(),
            disconnect_reason: params.get("CallbackSource").to_string(),
        }
    }

    pub fn classify(&self) -> CallEvent {
        match self.call_status.as_str() {
            "completed" => CallEvent::Completed {
                call_status: self.call_status.clone(),
            },
            "failed" | "no-answer" | "busy" => CallEvent::Failed {
                disconnect_reason: self.disconnect_reason.clone(),
            },
            _ => CallEvent::Unrecorded,
        }
    }
}
