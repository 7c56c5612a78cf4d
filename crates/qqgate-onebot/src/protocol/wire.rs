// SPDX-License-Identifier: MIT
//! OneBot v11 wire types (spec §6 "Wire (inbound)" / "Wire (outbound)").
//!
//! `messagePostFormat` **must be `array`** — the string form is best-effort
//! and loses structured media fields, so [`MessageContent`] only models the
//! array shape plus a raw-string fallback for logging.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostType {
    Message,
    Notice,
    Request,
    MetaEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Private,
    Group,
    Guild,
}

/// One segment of a OneBot v11 array-form message (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    At { qq: String },
    Image(#[serde(flatten)] MediaSegmentData),
    Record(#[serde(flatten)] MediaSegmentData),
    Video(#[serde(flatten)] MediaSegmentData),
    File(#[serde(flatten)] MediaSegmentData),
    Reply { id: String },
    Forward { id: String },
    Json { data: String },
    Face { id: String },
    /// Anything this gateway doesn't need to interpret structurally.
    #[serde(other)]
    Unknown,
}

/// Raw field bag carried by `image|video|record|file` segments. Consumers
/// (the inbound media resolver) probe these by name rather than requiring
/// any one of them — implementations in the wild are duck-typed (spec §4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaSegmentData {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub temp_file: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "b64")]
    pub base64: Option<String>,
    #[serde(flatten)]
    pub extra: std::collections::HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: Option<String>,
    pub nickname: Option<String>,
    #[serde(default)]
    pub card: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// The full inbound event envelope (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub time: i64,
    pub self_id: String,
    pub post_type: PostType,
    pub message_type: Option<MessageType>,
    pub sub_type: Option<String>,
    pub message_id: Option<String>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    #[serde(default)]
    pub message: Option<Vec<Segment>>,
    pub raw_message: Option<String>,
    pub sender: Option<Sender>,
}

/// An outbound action request. `echo` is used to match the eventual response
/// (spec §4.1 "echo-matched, 5s timeout").
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub action: String,
    pub params: Value,
    pub echo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Ok,
    Failed,
    Async,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionResponse {
    pub status: ActionStatus,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub echo: Option<String>,
}

impl ActionResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, ActionStatus::Ok | ActionStatus::Async)
    }
}

/// The superset of actions probed/used across the gateway (spec §6).
pub mod actions {
    pub const SEND_PRIVATE_MSG: &str = "send_private_msg";
    pub const SEND_GROUP_MSG: &str = "send_group_msg";
    pub const SEND_GUILD_CHANNEL_MSG: &str = "send_guild_channel_msg";
    pub const DELETE_MSG: &str = "delete_msg";
    pub const GET_MSG: &str = "get_msg";
    pub const GET_FORWARD_MSG: &str = "get_forward_msg";
    pub const GET_LOGIN_INFO: &str = "get_login_info";
    pub const GET_FRIEND_LIST: &str = "get_friend_list";
    pub const GET_GROUP_LIST: &str = "get_group_list";
    pub const GET_GUILD_LIST: &str = "get_guild_list";
    pub const GET_GROUP_MEMBER_INFO: &str = "get_group_member_info";
    pub const CAN_SEND_RECORD: &str = "can_send_record";
    pub const CAN_SEND_IMAGE: &str = "can_send_image";
    pub const SET_INPUT_STATUS: &str = "set_input_status";
    pub const GET_IMAGE: &str = "get_image";
    pub const GET_RECORD: &str = "get_record";
    pub const GET_FILE: &str = "get_file";
    pub const DOWNLOAD_FILE: &str = "download_file";
    pub const DOWNLOAD_FILE_STREAM: &str = "download_file_stream";
    pub const UPLOAD_FILE_STREAM: &str = "upload_file_stream";
    pub const CLEAN_STREAM_TEMP_FILE: &str = "clean_stream_temp_file";
}
