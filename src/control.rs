use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::contract::StreamError;

/// Sent to the stream source to request encoder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Config {
        /// Longest picture edge in pixels.
        max_size: u32,
        /// Megabits per second; the source converts to bps.
        bit_rate: u32,
    },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string(self).map_err(|e| StreamError::Control(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StatusMessage {
    Connected {
        #[serde(default)]
        message: Option<String>,
    },
    /// The source switched to still images; binary chunks are now PNG/JPEG.
    Fallback {
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl StatusMessage {
    pub fn parse(text: &str) -> Result<Self, StreamError> {
        serde_json::from_str(text).map_err(|e| StreamError::Control(format!("bad status message: {e}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,
    pub fallback_mode: bool,
    pub last_error: Option<String>,
}

impl LinkStatus {
    pub fn apply(&mut self, status: &StatusMessage) {
        match status {
            StatusMessage::Connected { message } => {
                info!("source connected: {}", message.as_deref().unwrap_or("-"));
                self.connected = true;
                self.fallback_mode = false;
                self.last_error = None;
            }
            StatusMessage::Fallback { message } => {
                info!("source switched to still images: {}", message.as_deref().unwrap_or("-"));
                self.connected = true;
                self.fallback_mode = true;
                self.last_error = None;
            }
            StatusMessage::Error { message } => {
                let message = message.clone().unwrap_or_else(|| "source error".to_string());
                warn!("source reported error: {message}");
                self.last_error = Some(message);
            }
            StatusMessage::Unknown => {}
        }
    }
}
