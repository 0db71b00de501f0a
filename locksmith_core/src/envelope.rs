//! JSON result envelope for machine callers.
//!
//! ```json
//! {"status": "success", "data": {...}, "message": "...", "new_lock_no": 42}
//! {"status": "error", "error": "..."}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_lock_no: Option<u16>,
    },
    Error {
        error: String,
    },
}

impl Envelope {
    pub fn success() -> Self {
        Envelope::Success {
            data: None,
            message: None,
            new_lock_no: None,
        }
    }

    /// Success carrying a serialized payload
    pub fn with_data<T: Serialize>(data: &T) -> crate::Result<Self> {
        Ok(Envelope::Success {
            data: Some(serde_json::to_value(data)?),
            message: None,
            new_lock_no: None,
        })
    }

    pub fn error(error: impl std::fmt::Display) -> Self {
        Envelope::Error {
            error: error.to_string(),
        }
    }

    pub fn message(mut self, text: impl Into<String>) -> Self {
        if let Envelope::Success { message, .. } = &mut self {
            *message = Some(text.into());
        }
        self
    }

    pub fn new_lock_no(mut self, lock_no: Option<u16>) -> Self {
        if let Envelope::Success { new_lock_no, .. } = &mut self {
            *new_lock_no = lock_no;
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
