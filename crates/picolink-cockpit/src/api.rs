//! Request routing for the façade's HTTP surface.
//!
//! [`route`] is a pure function of the request line, the body and the
//! [`FacadeContext`]; the socket handling lives in
//! [`server`][crate::server].
//!
//! | Method | Path | Effect |
//! |---|---|---|
//! | `GET` | `/` | Embedded UI |
//! | `GET` | `/api/logs` | `{lines, db_loading}` |
//! | `POST` | `/api/command` | Encode an action and publish it |
//! | `POST` | `/api/send` | Publish raw text |

use std::sync::Arc;

use picolink_middleware::BusClient;
use picolink_types::{BridgeError, CommandAction, CommandEncoder};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::aggregator::LogAggregator;

/// The compiled-in single-page UI.
pub(crate) const INDEX_HTML: &str = include_str!("index.html");

/// Top-N used when the request carries a value that is not a number.
const FALLBACK_TOP_N: i64 = 3;

/// Everything a request handler may touch.
pub struct FacadeContext {
    pub aggregator: Arc<LogAggregator>,
    pub bus: Arc<dyn BusClient>,
    pub encoder: CommandEncoder,
    pub command_topic: String,
}

impl FacadeContext {
    pub fn new(
        aggregator: Arc<LogAggregator>,
        bus: Arc<dyn BusClient>,
        encoder: CommandEncoder,
        command_topic: impl Into<String>,
    ) -> Self {
        Self {
            aggregator,
            bus,
            encoder,
            command_topic: command_topic.into(),
        }
    }

    fn publish_command(&self, action: &CommandAction) -> Result<(), BridgeError> {
        let bytes = self.encoder.encode(action)?;
        debug!(
            topic = %self.command_topic,
            command = %String::from_utf8_lossy(&bytes).escape_debug(),
            "publishing command"
        );
        self.bus.publish(&self.command_topic, &bytes);
        Ok(())
    }
}

/// A fully rendered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    pub fn html(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.to_string(),
        }
    }

    pub fn ok() -> Self {
        Self::json(200, &json!({ "ok": true }))
    }

    pub fn error(status: u16, reason: &str) -> Self {
        Self::json(status, &json!({ "ok": false, "error": reason }))
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            411 => "Length Required",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    /// Serialize as an HTTP/1.1 response that closes the connection.
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Cache-Control: no-store\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            self.status,
            self.reason_phrase(),
            self.content_type,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

/// Dispatch one request.
pub fn route(method: &str, path: &str, body: &[u8], ctx: &FacadeContext) -> HttpResponse {
    let path = path.split_once('?').map_or(path, |(p, _)| p);
    match (method, path) {
        ("GET", "/") => HttpResponse::html(INDEX_HTML),
        ("GET", "/api/logs") => match serde_json::to_value(ctx.aggregator.snapshot()) {
            Ok(value) => HttpResponse::json(200, &value),
            Err(e) => HttpResponse::error(500, &e.to_string()),
        },
        ("POST", "/api/command") => respond(handle_command(body, ctx)),
        ("POST", "/api/send") => respond(handle_send(body, ctx)),
        (_, "/" | "/api/logs" | "/api/command" | "/api/send") => {
            HttpResponse::error(405, "method not allowed")
        }
        _ => HttpResponse::error(404, "not found"),
    }
}

fn respond(result: Result<(), BridgeError>) -> HttpResponse {
    match result {
        Ok(()) => HttpResponse::ok(),
        Err(BridgeError::InvalidInput(reason)) => HttpResponse::error(400, &reason),
        Err(e) => HttpResponse::error(500, &e.to_string()),
    }
}

fn parse_body(body: &[u8]) -> Result<serde_json::Map<String, Value>, BridgeError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(BridgeError::InvalidInput("expected a JSON object".to_string())),
        Err(e) => Err(BridgeError::InvalidInput(format!("malformed JSON: {e}"))),
    }
}

fn handle_command(body: &[u8], ctx: &FacadeContext) -> Result<(), BridgeError> {
    let request = parse_body(body)?;
    let action = parse_action(&request)?;
    ctx.publish_command(&action)?;
    info!(action = ?action, "command accepted");
    Ok(())
}

fn handle_send(body: &[u8], ctx: &FacadeContext) -> Result<(), BridgeError> {
    let request = parse_body(body)?;
    let data = match request.get("data") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(BridgeError::InvalidInput("empty payload".to_string())),
    };
    ctx.publish_command(&CommandAction::RawSend(data.as_bytes().to_vec()))
}

/// Map a `/api/command` body onto a [`CommandAction`].
///
/// # Errors
///
/// [`BridgeError::InvalidInput`] for an unknown action or a missing,
/// non-string or blank `filename` on `restore_choose`.
pub fn parse_action(request: &serde_json::Map<String, Value>) -> Result<CommandAction, BridgeError> {
    let action = request.get("action").and_then(Value::as_str).unwrap_or("");
    let action = match action {
        "identify" => CommandAction::Identify(parse_top_n(request.get("topN"))),
        "backup" => CommandAction::Backup,
        "restore" | "restore_latest" => CommandAction::RestoreLatest,
        "restore_choose" => match request.get("filename") {
            Some(Value::String(name)) => CommandAction::RestoreChoose(name.clone()),
            Some(Value::Null) | None => {
                return Err(BridgeError::InvalidInput("missing filename".to_string()));
            }
            Some(_) => return Err(BridgeError::InvalidInput("invalid filename".to_string())),
        },
        "list_images" => CommandAction::ListImages,
        "quit" => CommandAction::Quit,
        "resume" => CommandAction::Resume,
        _ => return Err(BridgeError::InvalidInput("unknown action".to_string())),
    };
    Ok(action)
}

/// Absent or `null` means "no top-N"; anything unparseable becomes 3.
/// Clamping happens in the encoder.
fn parse_top_n(value: Option<&Value>) -> Option<i64> {
    let n = match value? {
        Value::Null => return None,
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(FALLBACK_TOP_N),
        Value::String(s) => s.trim().parse().unwrap_or(FALLBACK_TOP_N),
        Value::Bool(b) => i64::from(*b),
        _ => FALLBACK_TOP_N,
    };
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use picolink_types::DeviceProtocol;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl BusClient for RecordingBus {
        fn publish(&self, topic: &str, payload: &[u8]) {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
        }

        fn subscribe(
            &self,
            _topic: &str,
            _handler: picolink_middleware::MessageHandler,
        ) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    fn context(protocol: DeviceProtocol) -> (FacadeContext, Arc<RecordingBus>) {
        let bus = Arc::new(RecordingBus::default());
        let ctx = FacadeContext::new(
            Arc::new(LogAggregator::new(10)),
            bus.clone(),
            CommandEncoder::new(protocol),
            "pico/cmd",
        );
        (ctx, bus)
    }

    fn post(ctx: &FacadeContext, path: &str, body: &str) -> (u16, Value) {
        let resp = route("POST", path, body.as_bytes(), ctx);
        let value = serde_json::from_str(&resp.body).unwrap();
        (resp.status, value)
    }

    fn sent(bus: &RecordingBus) -> Vec<String> {
        bus.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, bytes)| {
                assert_eq!(topic, "pico/cmd");
                String::from_utf8(bytes.clone()).unwrap()
            })
            .collect()
    }

    #[test]
    fn index_serves_html() {
        let (ctx, _) = context(DeviceProtocol::Classic);
        let resp = route("GET", "/", b"", &ctx);
        assert_eq!(resp.status, 200);
        assert!(resp.content_type.starts_with("text/html"));
        assert!(resp.body.contains("/api/logs"));
    }

    #[test]
    fn logs_returns_snapshot_shape() {
        let (ctx, _) = context(DeviceProtocol::Classic);
        ctx.aggregator.append("--- Loading database from SD card ---\n");
        let resp = route("GET", "/api/logs?t=123", b"", &ctx);
        assert_eq!(resp.status, 200);
        let value: Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(value["lines"][0], "--- Loading database from SD card ---\n");
        assert_eq!(value["db_loading"], true);
    }

    #[test]
    fn identify_variants() {
        let (ctx, bus) = context(DeviceProtocol::Classic);
        for body in [
            r#"{"action":"identify"}"#,
            r#"{"action":"identify","topN":null}"#,
            r#"{"action":"identify","topN":5}"#,
            r#"{"action":"identify","topN":"7"}"#,
            r#"{"action":"identify","topN":"lots"}"#,
            r#"{"action":"identify","topN":0}"#,
            r#"{"action":"identify","topN":15}"#,
            r#"{"action":"identify","topN":4.9}"#,
            r#"{"action":"identify","topN":[1]}"#,
        ] {
            assert_eq!(post(&ctx, "/api/command", body).0, 200, "{body}");
        }
        assert_eq!(
            sent(&bus),
            vec!["1", "1", "15\n", "17\n", "13\n", "11\n", "110\n", "14\n", "13\n"]
        );
    }

    #[test]
    fn menu_actions_map_to_keys() {
        let (ctx, bus) = context(DeviceProtocol::Classic);
        for action in ["backup", "restore", "restore_latest", "list_images", "quit", "resume"] {
            let (status, value) = post(&ctx, "/api/command", &format!(r#"{{"action":"{action}"}}"#));
            assert_eq!(status, 200);
            assert_eq!(value, json!({ "ok": true }));
        }
        assert_eq!(sent(&bus), vec!["2", "3", "3", "5", "q", "m"]);
    }

    #[test]
    fn revised_protocol_changes_list_and_resume() {
        let (ctx, bus) = context(DeviceProtocol::Revised);
        post(&ctx, "/api/command", r#"{"action":"list_images"}"#);
        post(&ctx, "/api/command", r#"{"action":"resume"}"#);
        assert_eq!(sent(&bus), vec!["5\n", "r"]);
    }

    #[test]
    fn restore_choose_validates_filename() {
        let (ctx, bus) = context(DeviceProtocol::Classic);

        let (status, _) = post(
            &ctx,
            "/api/command",
            r#"{"action":"restore_choose","filename":"  img1.fimg "}"#,
        );
        assert_eq!(status, 200);

        for body in [
            r#"{"action":"restore_choose"}"#,
            r#"{"action":"restore_choose","filename":null}"#,
            r#"{"action":"restore_choose","filename":"   "}"#,
            r#"{"action":"restore_choose","filename":42}"#,
        ] {
            let (status, value) = post(&ctx, "/api/command", body);
            assert_eq!(status, 400, "{body}");
            assert_eq!(value["ok"], false);
            assert!(value["error"].is_string());
        }
        assert_eq!(sent(&bus), vec!["4img1.fimg\n"]);
    }

    #[test]
    fn unknown_or_malformed_command_is_rejected() {
        let (ctx, bus) = context(DeviceProtocol::Classic);
        let (status, value) = post(&ctx, "/api/command", r#"{"action":"reboot"}"#);
        assert_eq!(status, 400);
        assert_eq!(value["error"], "unknown action");

        assert_eq!(post(&ctx, "/api/command", "{not json").0, 400);
        assert_eq!(post(&ctx, "/api/command", "[1,2]").0, 400);
        assert_eq!(post(&ctx, "/api/command", "{}").0, 400);
        assert!(sent(&bus).is_empty());
    }

    #[test]
    fn send_forwards_raw_text() {
        let (ctx, bus) = context(DeviceProtocol::Classic);
        assert_eq!(post(&ctx, "/api/send", r#"{"data":"4\r\n"}"#).0, 200);

        for body in [r#"{"data":""}"#, r#"{"data":5}"#, r#"{}"#, "null"] {
            let (status, value) = post(&ctx, "/api/send", body);
            assert_eq!(status, 400, "{body}");
            assert_eq!(value["ok"], false);
        }
        assert_eq!(sent(&bus), vec!["4\r\n"]);
    }

    #[test]
    fn unknown_path_and_wrong_method() {
        let (ctx, _) = context(DeviceProtocol::Classic);
        assert_eq!(route("GET", "/nope", b"", &ctx).status, 404);
        assert_eq!(route("POST", "/api/logs", b"", &ctx).status, 405);
        assert_eq!(route("GET", "/api/command", b"", &ctx).status, 405);
        assert_eq!(route("DELETE", "/", b"", &ctx).status, 405);
    }

    #[test]
    fn response_serialization() {
        let bytes = HttpResponse::error(404, "not found").to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.ends_with(r#"{"error":"not found","ok":false}"#));
    }
}
