//! Version 1 of the catalog contract.
use derive_more::{From, TryInto};
use serde::{Deserialize, Serialize};

use crate::{
    message::{BidiStreaming, BidiStreamingMsg, ClientStreaming, ClientStreamingMsg, Msg},
    message::{RpcMsg, ServerStreaming, ServerStreamingMsg},
    Service,
};

/// Unary ping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    /// Text echoed back in the response
    pub message: String,
}

/// Answer to a [PingRequest]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// `pong: {message}`
    pub message: String,
    /// Server clock when the ping was answered
    pub server_time_unix_ms: i64,
}

/// Subscribe to a finite stream of catalog updates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCatalogRequest {
    /// Pause after each update. Zero or less means 500.
    pub interval_ms: i32,
    /// Number of updates. Zero or less means 10.
    pub max_updates: i32,
}

/// One item of a catalog watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogUpdate {
    /// 1 based, contiguous within one call
    pub sequence: i64,
    #[allow(missing_docs)]
    pub text: String,
    #[allow(missing_docs)]
    pub server_time_unix_ms: i64,
}

/// Opens an upload of [CatalogEvent]s
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCatalogEvents;

/// An event uploaded by a client. The server only counts them.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub client_time_unix_ms: i64,
}

/// Result of an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    /// Events received before the client finished the upload
    pub received_count: i32,
    #[allow(missing_docs)]
    pub server_time_unix_ms: i64,
}

/// Opens a chat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat;

/// A chat message, in both directions
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    pub time_unix_ms: i64,
}

/// request enum
#[allow(missing_docs)]
#[derive(Debug, Serialize, Deserialize, From, TryInto)]
pub enum Request {
    Ping(PingRequest),
    WatchCatalog(WatchCatalogRequest),
    UploadCatalogEvents(UploadCatalogEvents),
    CatalogEvent(CatalogEvent),
    Chat(Chat),
    ChatMessage(ChatMessage),
}

/// response enum
#[allow(missing_docs)]
#[derive(Debug, Serialize, Deserialize, From, TryInto)]
pub enum Response {
    Ping(PingResponse),
    CatalogUpdate(CatalogUpdate),
    UploadSummary(UploadSummary),
    ChatMessage(ChatMessage),
}

/// The v1 catalog api
#[derive(Debug, Clone, Copy)]
pub struct CatalogApiV1;

impl Service for CatalogApiV1 {
    type Req = Request;
    type Res = Response;
}

impl RpcMsg<CatalogApiV1> for PingRequest {
    type Response = PingResponse;
}

impl Msg<CatalogApiV1> for WatchCatalogRequest {
    type Pattern = ServerStreaming;
}

impl ServerStreamingMsg<CatalogApiV1> for WatchCatalogRequest {
    type Response = CatalogUpdate;
}

impl Msg<CatalogApiV1> for UploadCatalogEvents {
    type Pattern = ClientStreaming;
}

impl ClientStreamingMsg<CatalogApiV1> for UploadCatalogEvents {
    type Update = CatalogEvent;
    type Response = UploadSummary;
}

impl Msg<CatalogApiV1> for Chat {
    type Pattern = BidiStreaming;
}

impl BidiStreamingMsg<CatalogApiV1> for Chat {
    type Update = ChatMessage;
    type Response = ChatMessage;
}
