//! JSON frames exchanged over the WebSocket.
//!
//! Every inbound frame looks like `{"type": ..., "vId": ..., "token": ..., "data": ...}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::filetree::DirListing;

/// Fields shared by every inbound frame
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(rename = "vId", default)]
    pub view_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardKind {
    Cut,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShareRequest {
    pub location: String,
    #[serde(default, alias = "attachement")]
    pub attachment: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaveRequest {
    pub to: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClipboardRequest {
    pub src: String,
    pub dst: String,
    #[serde(rename = "type")]
    pub kind: ClipboardKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RenameRequest {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserUpdate {
    pub name: String,
    /// An empty password deletes the user
    #[serde(default)]
    pub pass: String,
    #[serde(default, rename = "priv")]
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateFilesRequest {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateFoldersRequest {
    pub folders: Vec<String>,
}

/// Requests a client can send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    RequestSettings,
    RequestUpdate(String),
    DestroyView,
    RequestSharelink(ShareRequest),
    DeleteFile(String),
    SaveFile(SaveRequest),
    Clipboard(ClipboardRequest),
    CreateFolder(String),
    CreateFile(String),
    Rename(RenameRequest),
    GetUsers,
    UpdateUser(UserUpdate),
    CreateFiles(CreateFilesRequest),
    CreateFolders(CreateFoldersRequest),
}

impl ClientMessage {
    /// Parse a text frame into its envelope and message.
    pub fn parse(text: &str) -> Result<(Envelope, ClientMessage), serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let envelope = Envelope::deserialize(&value)?;
        let message = ClientMessage::deserialize(value)?;
        Ok((envelope, message))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub version: String,
    pub debug: bool,
    pub public: bool,
    pub read_only: bool,
    #[serde(rename = "priv")]
    pub privileged: bool,
    pub engine: String,
    pub case_sensitive: bool,
}

/// Events the server pushes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Settings {
        #[serde(rename = "vId")]
        view_id: u32,
        settings: Settings,
    },
    UpdateBeFile {
        #[serde(rename = "vId")]
        view_id: u32,
        folder: String,
        file: String,
        #[serde(rename = "isFile")]
        is_file: bool,
    },
    UpdateDirectory {
        #[serde(rename = "vId")]
        view_id: u32,
        folder: String,
        data: DirListing,
    },
    Sharelink {
        #[serde(rename = "vId")]
        view_id: u32,
        link: String,
        attachment: bool,
    },
    Error {
        #[serde(rename = "vId", skip_serializing_if = "Option::is_none")]
        view_id: Option<u32>,
        text: String,
    },
    SaveStatus {
        #[serde(rename = "vId")]
        view_id: u32,
        status: u8,
    },
    UserList {
        users: BTreeMap<String, bool>,
    },
    Reload,
}

impl ServerMessage {
    pub fn error(view_id: u32, text: impl Into<String>) -> Self {
        ServerMessage::Error {
            view_id: Some(view_id),
            text: text.into(),
        }
    }
}

/// Work queued for a connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Message(ServerMessage),
    /// Render and send the current listing of this view's directory
    Directory(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_message() {
        let (envelope, message) =
            ClientMessage::parse(r#"{"type":"REQUEST_SETTINGS","vId":1,"token":"abc"}"#).unwrap();
        assert_eq!(envelope.view_id, 1);
        assert_eq!(envelope.token.as_deref(), Some("abc"));
        assert_eq!(message, ClientMessage::RequestSettings);
    }

    #[test]
    fn test_parse_payload_messages() {
        let (_, message) =
            ClientMessage::parse(r#"{"type":"REQUEST_UPDATE","vId":0,"data":"/docs"}"#).unwrap();
        assert_eq!(message, ClientMessage::RequestUpdate("/docs".to_string()));

        let (_, message) = ClientMessage::parse(
            r#"{"type":"CLIPBOARD","data":{"src":"/a","dst":"/b","type":"cut"}}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            ClientMessage::Clipboard(ClipboardRequest {
                src: "/a".to_string(),
                dst: "/b".to_string(),
                kind: ClipboardKind::Cut,
            })
        );

        let (_, message) = ClientMessage::parse(
            r#"{"type":"REQUEST_SHARELINK","data":{"location":"/a","attachement":true}}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            ClientMessage::RequestSharelink(ShareRequest {
                location: "/a".to_string(),
                attachment: true,
            })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(ClientMessage::parse(r#"{"type":"FORMAT_DISK"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let json = serde_json::to_value(ServerMessage::SaveStatus {
            view_id: 2,
            status: 0,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "SAVE_STATUS", "vId": 2, "status": 0})
        );

        let json = serde_json::to_value(ServerMessage::Reload).unwrap();
        assert_eq!(json, serde_json::json!({"type": "RELOAD"}));

        let json = serde_json::to_value(ServerMessage::Error {
            view_id: None,
            text: "nope".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "ERROR", "text": "nope"}));
    }
}
