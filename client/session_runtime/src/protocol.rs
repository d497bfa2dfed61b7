use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;

pub const CLIENT_TO_SERVER_CAP: usize = 1_048_576;
pub const SERVER_TO_CLIENT_CAP: usize = 1_048_576;

/// Server-to-client envelope as it arrives on the wire.
///
/// Besides the optional `hash` and `metadata` siblings, exactly one variant
/// key must be present. The variant is decoded lazily by
/// [`RawForwardMsg::decode_variant`] so an unknown tag can be reported
/// without losing the rest of the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawForwardMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ForwardMsgMetadata>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardMsgMetadata {
    #[serde(default)]
    pub delta_path: Vec<u32>,
}

/// The closed set of inbound variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardMsgType {
    NewSession(NewSession),
    SessionStatusChanged(SessionStatus),
    SessionEvent(SessionEvent),
    Delta(Delta),
    PageConfigChanged(PageConfig),
    PageInfoChanged(PageInfo),
    PagesChanged(PagesChanged),
    PageNotFound(PageNotFound),
    GitInfoChanged(GitInfo),
    ScriptFinished(ScriptFinishedStatus),
    PageProfile(PageProfile),
}

impl RawForwardMsg {
    pub fn new(variant: &str, payload: Value) -> Self {
        let mut body = Map::new();
        body.insert(variant.to_string(), payload);
        Self {
            hash: None,
            metadata: None,
            body,
        }
    }

    pub fn with_delta_path(mut self, delta_path: Vec<u32>) -> Self {
        self.metadata = Some(ForwardMsgMetadata { delta_path });
        self
    }

    /// Variant key of this envelope, if exactly one is set.
    pub fn tag(&self) -> Option<&str> {
        let mut tags = self.set_variants();
        match (tags.next(), tags.next()) {
            (Some(tag), None) => Some(tag),
            _ => None,
        }
    }

    fn set_variants(&self) -> impl Iterator<Item = &str> {
        self.body
            .iter()
            .filter(|(_, payload)| !payload.is_null())
            .map(|(tag, _)| tag.as_str())
    }

    pub fn decode_variant(&self) -> Result<ForwardMsgType, ProtocolError> {
        let mut set = self.body.iter().filter(|(_, payload)| !payload.is_null());
        let (tag, payload) = match (set.next(), set.next()) {
            (None, _) => return Err(ProtocolError::UnknownVariant(None)),
            (Some(only), None) => only,
            (Some(_), Some(_)) => {
                return Err(ProtocolError::AmbiguousEnvelope(
                    self.set_variants().map(str::to_string).collect(),
                ));
            }
        };

        match tag.as_str() {
            "newSession" => payload_as("newSession", payload).map(ForwardMsgType::NewSession),
            "sessionStatusChanged" | "sessionStateChanged" => {
                payload_as("sessionStatusChanged", payload)
                    .map(ForwardMsgType::SessionStatusChanged)
            }
            "sessionEvent" => payload_as("sessionEvent", payload).map(ForwardMsgType::SessionEvent),
            "delta" => payload_as("delta", payload).map(ForwardMsgType::Delta),
            "pageConfigChanged" => {
                payload_as("pageConfigChanged", payload).map(ForwardMsgType::PageConfigChanged)
            }
            "pageInfoChanged" => {
                payload_as("pageInfoChanged", payload).map(ForwardMsgType::PageInfoChanged)
            }
            "pagesChanged" => payload_as("pagesChanged", payload).map(ForwardMsgType::PagesChanged),
            "pageNotFound" => payload_as("pageNotFound", payload).map(ForwardMsgType::PageNotFound),
            "gitInfoChanged" => {
                payload_as("gitInfoChanged", payload).map(ForwardMsgType::GitInfoChanged)
            }
            "scriptFinished" => {
                payload_as("scriptFinished", payload).map(ForwardMsgType::ScriptFinished)
            }
            "pageProfile" => payload_as("pageProfile", payload).map(ForwardMsgType::PageProfile),
            other => Err(ProtocolError::UnknownVariant(Some(other.to_string()))),
        }
    }

    pub fn delta_path(&self) -> Option<&[u32]> {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.delta_path.as_slice())
            .filter(|path| !path.is_empty())
    }
}

fn payload_as<T: DeserializeOwned>(variant: &'static str, payload: &Value) -> Result<T, ProtocolError> {
    T::deserialize(payload).map_err(|source| ProtocolError::MalformedPayload { variant, source })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub initialize: Initialize,
    pub script_run_id: String,
    #[serde(default)]
    pub name: String,
    pub main_script_path: String,
    #[serde(default)]
    pub page_script_hash: String,
    #[serde(default)]
    pub app_pages: Vec<PageDescriptor>,
    #[serde(default)]
    pub config: AppConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initialize {
    pub server_version: String,
    pub installation_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub session_status: SessionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub allow_run_on_save: bool,
    #[serde(default)]
    pub hide_top_bar: bool,
    #[serde(default)]
    pub hide_sidebar_nav: bool,
    #[serde(default)]
    pub toolbar_mode: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default)]
    pub run_on_save: bool,
    #[serde(default)]
    pub script_is_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEvent {
    ScriptChangedOnDisk(bool),
    ScriptWasManuallyStopped(bool),
    ScriptCompilationException(ExceptionInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Delta {
    NewElement(Element),
    AddBlock(Block),
    AddRows(AddRows),
}

/// A leaf UI element. Widgets carry an `id`; elements inside a form carry
/// the owning `formId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl Element {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            form_id: None,
            props: Map::new(),
        }
    }

    pub fn widget(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(kind)
        }
    }

    pub fn with_prop(mut self, key: &str, value: Value) -> Self {
        self.props.insert(key.to_string(), value);
        self
    }

    pub fn widget_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl Block {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            form_id: None,
            props: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddRows {
    pub rows: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub favicon: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub initial_sidebar_state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub query_string: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagesChanged {
    #[serde(default)]
    pub app_pages: Vec<PageDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageNotFound {
    #[serde(default)]
    pub page_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDescriptor {
    pub page_script_hash: String,
    pub page_name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub untracked_files: Vec<String>,
    #[serde(default)]
    pub uncommitted_files: Vec<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptFinishedStatus {
    FinishedSuccessfully,
    FinishedWithCompileError,
    FinishedEarlyForRerun,
    FinishedFragmentRunSuccessfully,
}

impl ScriptFinishedStatus {
    /// Whether the finished run redrew the whole page, so nodes and widgets
    /// it did not touch are stale.
    pub fn triggers_reconciliation(self) -> bool {
        matches!(self, Self::FinishedSuccessfully | Self::FinishedEarlyForRerun)
    }

    /// Whether the run produced output at all.
    pub fn completed_run(self) -> bool {
        self != Self::FinishedWithCompileError
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageProfile {
    #[serde(default)]
    pub commands: Vec<CommandProfile>,
    #[serde(default)]
    pub exec_time: u64,
    #[serde(default)]
    pub prep_time: u64,
    #[serde(default)]
    pub uncaught_exception: Option<String>,
    #[serde(default)]
    pub is_fragment_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandProfile {
    pub name: String,
    #[serde(default)]
    pub time: u64,
}

/// Client-to-server control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackMsg {
    RerunScript(ClientState),
    StopScript,
    SetRunOnSave(bool),
    ClearCache,
    LoadGitInfo,
    UpdateWidgets(WidgetStates),
    DebugShutdownRuntime,
    DebugDisconnectWebsocket,
}

impl BackMsg {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RerunScript(_) => "rerunScript",
            Self::StopScript => "stopScript",
            Self::SetRunOnSave(_) => "setRunOnSave",
            Self::ClearCache => "clearCache",
            Self::LoadGitInfo => "loadGitInfo",
            Self::UpdateWidgets(_) => "updateWidgets",
            Self::DebugShutdownRuntime => "debugShutdownRuntime",
            Self::DebugDisconnectWebsocket => "debugDisconnectWebsocket",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    pub query_string: String,
    pub widget_states: WidgetStates,
    pub page_script_hash: String,
    pub page_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetStates {
    pub widgets: Vec<WidgetState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetState {
    pub id: String,
    #[serde(flatten)]
    pub value: WidgetValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WidgetValue {
    TriggerValue(bool),
    BoolValue(bool),
    IntValue(i64),
    DoubleValue(f64),
    StringValue(String),
    StringArrayValue(Vec<String>),
    IntArrayValue(Vec<i64>),
    DoubleArrayValue(Vec<f64>),
    JsonValue(String),
}

pub fn writer_loop(rx: Receiver<BackMsg>) -> io::Result<()> {
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    for msg in rx {
        let payload = encode_back_msg(&msg)?;
        write_frame(&mut writer, &payload, CLIENT_TO_SERVER_CAP)?;
        writer.flush()?;
    }

    Ok(())
}

/// Reads frames from stdin until EOF. Frames that are not valid JSON
/// envelopes are handed to the callback as errors; only transport failures
/// end the loop.
pub fn reader_loop<F>(max_payload: usize, mut on_envelope: F) -> io::Result<()>
where
    F: FnMut(Result<RawForwardMsg, ProtocolError>),
{
    let stdin = io::stdin();
    let mut reader = stdin.lock();

    loop {
        match read_frame(&mut reader, max_payload) {
            Ok(payload) => on_envelope(decode_forward_msg(&payload)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

pub fn encode_back_msg(msg: &BackMsg) -> io::Result<Vec<u8>> {
    serde_json::to_vec(msg).map_err(json_error)
}

pub fn decode_forward_msg(payload: &[u8]) -> Result<RawForwardMsg, ProtocolError> {
    let value: Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}

pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32"))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

fn json_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn truncated_frame_is_rejected() {
        let data = vec![0, 0, 0, 5, b'a', b'b'];
        let mut cursor = Cursor::new(data);
        let err = read_frame(&mut cursor, SERVER_TO_CLIENT_CAP).expect_err("expected eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let len = (SERVER_TO_CLIENT_CAP as u32) + 1;
        let data = len.to_be_bytes().to_vec();
        let mut cursor = Cursor::new(data);
        let err = read_frame(&mut cursor, SERVER_TO_CLIENT_CAP).expect_err("expected too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn frame_length_prefix_is_big_endian() {
        let mut out = Vec::new();
        write_frame(&mut out, b"abc", CLIENT_TO_SERVER_CAP).expect("frame write");
        assert_eq!(&out[0..4], &[0, 0, 0, 3]);

        let mut cursor = Cursor::new(out);
        let decoded = read_frame(&mut cursor, CLIENT_TO_SERVER_CAP).expect("frame read");
        assert_eq!(decoded, b"abc");
    }

    #[test]
    fn decodes_delta_with_metadata() {
        let payload = br#"{"hash":"h1","metadata":{"deltaPath":[0,2]},"delta":{"newElement":{"type":"markdown","body":"hi"}}}"#;
        let raw = decode_forward_msg(payload).expect("decode envelope");

        assert_eq!(raw.tag(), Some("delta"));
        assert_eq!(raw.delta_path(), Some(&[0, 2][..]));

        match raw.decode_variant().expect("decode variant") {
            ForwardMsgType::Delta(Delta::NewElement(element)) => {
                assert_eq!(element.kind, "markdown");
                assert_eq!(element.props["body"], "hi");
                assert_eq!(element.widget_id(), None);
            }
            other => panic!("expected newElement delta, got {other:?}"),
        }
    }

    #[test]
    fn unknown_variant_is_named() {
        let raw = RawForwardMsg::new("fileUrlsResponse", json!({}));
        match raw.decode_variant() {
            Err(ProtocolError::UnknownVariant(Some(tag))) => assert_eq!(tag, "fileUrlsResponse"),
            other => panic!("expected unknown variant, got {other:?}"),
        }
    }

    #[test]
    fn missing_variant_is_unknown() {
        let raw = decode_forward_msg(br#"{"hash":"h"}"#).expect("decode envelope");
        assert!(matches!(
            raw.decode_variant(),
            Err(ProtocolError::UnknownVariant(None))
        ));
    }

    #[test]
    fn two_variants_are_rejected() {
        let raw = decode_forward_msg(br#"{"pageInfoChanged":{},"pageNotFound":{}}"#)
            .expect("decode envelope");
        assert_eq!(raw.tag(), None);
        assert!(matches!(
            raw.decode_variant(),
            Err(ProtocolError::AmbiguousEnvelope(_))
        ));
    }

    #[test]
    fn non_object_frame_is_rejected() {
        assert!(matches!(
            decode_forward_msg(b"[1,2]"),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn script_finished_status_uses_wire_names() {
        let raw = RawForwardMsg::new("scriptFinished", json!("FINISHED_EARLY_FOR_RERUN"));
        assert_eq!(
            raw.decode_variant().expect("decode"),
            ForwardMsgType::ScriptFinished(ScriptFinishedStatus::FinishedEarlyForRerun)
        );
        assert!(ScriptFinishedStatus::FinishedEarlyForRerun.triggers_reconciliation());
        assert!(!ScriptFinishedStatus::FinishedWithCompileError.triggers_reconciliation());
        assert!(!ScriptFinishedStatus::FinishedFragmentRunSuccessfully.triggers_reconciliation());
        assert!(ScriptFinishedStatus::FinishedFragmentRunSuccessfully.completed_run());
        assert!(!ScriptFinishedStatus::FinishedWithCompileError.completed_run());
    }

    #[test]
    fn malformed_payload_names_variant() {
        let raw = RawForwardMsg::new("newSession", json!({"scriptRunId": 4}));
        match raw.decode_variant() {
            Err(ProtocolError::MalformedPayload { variant, .. }) => assert_eq!(variant, "newSession"),
            other => panic!("expected malformed payload, got {other:?}"),
        }
    }

    #[test]
    fn encodes_rerun_back_msg() {
        let msg = BackMsg::RerunScript(ClientState {
            query_string: "a=1".to_string(),
            widget_states: WidgetStates {
                widgets: vec![WidgetState {
                    id: "slider".to_string(),
                    value: WidgetValue::IntValue(7),
                }],
            },
            page_script_hash: "p1".to_string(),
            page_name: String::new(),
        });

        let encoded = encode_back_msg(&msg).expect("encode rerun");
        let value: Value = serde_json::from_slice(&encoded).expect("parse encoded json");
        assert_eq!(value["rerunScript"]["queryString"], "a=1");
        assert_eq!(value["rerunScript"]["pageScriptHash"], "p1");
        assert_eq!(value["rerunScript"]["widgetStates"]["widgets"][0]["id"], "slider");
        assert_eq!(value["rerunScript"]["widgetStates"]["widgets"][0]["intValue"], 7);
    }

    #[test]
    fn encodes_unit_back_msgs_as_names() {
        let encoded = encode_back_msg(&BackMsg::StopScript).expect("encode stop");
        assert_eq!(encoded, br#""stopScript""#);
        assert_eq!(BackMsg::ClearCache.name(), "clearCache");
    }
}
