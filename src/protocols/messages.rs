//! Messages exchanged with back-end peers.
//!
//! The wire form is JSON with a single top-level key naming the variant,
//! one line per message:
//!
//! ```text
//! {"askRequest":{"id":7,"senderComputerName":"iPhone",...}}
//! {"askResponse":{"id":12,"replyTo":7,"accepted":true}}
//! ```
//!
//! Every message carries an `id` unique on its channel. Requests sent by
//! the bridge carry no `replyTo`; responses from the peer echo the id of
//! the request they answer in `replyTo`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HubMessage {
    /// First message from a freshly connected peer; names it.
    Connect(Connect),
    AskRequest(AskRequestMsg),
    AskResponse(AskResponseMsg),
    FileUploadRequest(FileUploadRequest),
    FileUploadResponse(FileUploadResponse),
}

impl HubMessage {
    pub fn id(&self) -> u64 {
        match self {
            HubMessage::Connect(m) => m.id,
            HubMessage::AskRequest(m) => m.id,
            HubMessage::AskResponse(m) => m.id,
            HubMessage::FileUploadRequest(m) => m.id,
            HubMessage::FileUploadResponse(m) => m.id,
        }
    }

    pub fn reply_to(&self) -> Option<u64> {
        match self {
            HubMessage::Connect(m) => m.reply_to,
            HubMessage::AskRequest(m) => m.reply_to,
            HubMessage::AskResponse(m) => m.reply_to,
            HubMessage::FileUploadRequest(m) => m.reply_to,
            HubMessage::FileUploadResponse(m) => m.reply_to,
        }
    }

    pub fn variant(&self) -> &'static str {
        match self {
            HubMessage::Connect(_) => "connect",
            HubMessage::AskRequest(_) => "askRequest",
            HubMessage::AskResponse(_) => "askResponse",
            HubMessage::FileUploadRequest(_) => "fileUploadRequest",
            HubMessage::FileUploadResponse(_) => "fileUploadResponse",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Connect {
    pub id: u64,
    pub reply_to: Option<u64>,
    /// Display name the peer wants advertised on its behalf.
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AskRequestMsg {
    pub id: u64,
    pub reply_to: Option<u64>,
    pub sender_computer_name: String,
    pub sender_model_name: String,
    pub sender_id: String,
    pub bundle_id: String,
    /// Base64 of the sender's JPEG 2000 preview icon, when present.
    pub icon: Option<String>,
    pub files: Vec<AskFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AskFile {
    pub name: String,
    pub file_type: String,
    pub is_directory: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AskResponseMsg {
    pub id: u64,
    pub reply_to: Option<u64>,
    pub accepted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileUploadRequest {
    pub id: u64,
    pub reply_to: Option<u64>,
    /// Archive-relative name of the delivered file.
    pub name: String,
    /// Where the peer can download it from.
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileUploadResponse {
    pub id: u64,
    pub reply_to: Option<u64>,
}
