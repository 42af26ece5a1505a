//! Twilio Media Streams handler
//!
//! One WebSocket per call. Inbound `media` payloads are base64 mu-law audio
//! forwarded to the recognizer; outbound audio is sent back as `media`
//! messages followed by a `mark`, and a `clear` flushes whatever the
//! telephony side still has buffered.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

use phone_agent_agent::{spawn_session, SessionEvent, SessionSettings};
use phone_agent_core::{CallerId, OutboundFrame};

use crate::state::{AppState, CallGuard};

/// Inbound Twilio stream messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TwilioInbound {
    Connected {
        #[serde(default)]
        protocol: String,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Stop,
    #[serde(other)]
    Unknown,
}

impl TwilioInbound {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub call_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

impl StartMetadata {
    /// Caller number passed by the TwiML `<Parameter>`
    pub fn caller_number(&self) -> Option<&str> {
        self.custom_parameters
            .get("callerNumber")
            .or_else(|| self.custom_parameters.get("From"))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Outbound Twilio stream messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TwilioOutbound {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

impl TwilioOutbound {
    pub fn from_frame(stream_sid: &str, frame: OutboundFrame) -> Self {
        let stream_sid = stream_sid.to_string();
        match frame {
            OutboundFrame::Audio(audio) => TwilioOutbound::Media {
                stream_sid,
                media: MediaPayload {
                    payload: BASE64.encode(&audio),
                },
            },
            OutboundFrame::Mark(name) => TwilioOutbound::Mark {
                stream_sid,
                mark: MarkPayload { name },
            },
            OutboundFrame::Clear => TwilioOutbound::Clear { stream_sid },
        }
    }
}

/// `GET {media_stream_path}` upgrade
pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let Some(guard) = state.calls.try_register() else {
        tracing::warn!(
            active = state.calls.count(),
            "Rejecting media stream: call capacity reached"
        );
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, guard)))
}

async fn handle_socket(socket: WebSocket, state: AppState, guard: CallGuard) {
    let (sink, mut stream) = socket.split();

    // Nothing can happen until the stream identifies the call
    let (stream_sid, start) = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match TwilioInbound::parse(&text) {
                Ok(TwilioInbound::Start { stream_sid, start }) => break (stream_sid, start),
                Ok(TwilioInbound::Connected { protocol }) => {
                    tracing::debug!(protocol = %protocol, "Media stream connected");
                }
                Ok(TwilioInbound::Stop) => return,
                Ok(other) => tracing::debug!(message = ?other, "Message before start ignored"),
                Err(e) => tracing::warn!(error = %e, "Unparseable stream message"),
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Media stream error before start");
                return;
            }
        }
    };

    guard.bind_call(&start.call_sid);
    let (settings, buffer) = {
        let config = state.get_config();
        (
            SessionSettings::from(&config.session),
            config.session.event_buffer,
        )
    };

    let (out_tx, out_rx) = mpsc::channel(buffer);
    let session = spawn_session(settings, state.collaborators.clone(), out_tx, buffer);
    let writer = tokio::spawn(write_frames(sink, out_rx, stream_sid.clone()));

    let start_event = SessionEvent::Start {
        call_id: start.call_sid.clone(),
        stream_id: stream_sid.clone(),
        caller_id: CallerId::parse(start.caller_number()),
    };
    if session.send(start_event).await.is_ok() {
        while let Some(message) = stream.next().await {
            let event = match message {
                Ok(Message::Text(text)) => match TwilioInbound::parse(&text) {
                    Ok(inbound) => match to_session_event(inbound) {
                        Some(event) => event,
                        None => continue,
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "Unparseable stream message");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(call_id = %start.call_sid, error = %e, "Media stream error");
                    break;
                }
            };

            let stop = matches!(event, SessionEvent::Stop);
            // Fails once the session has closed itself
            if session.send(event).await.is_err() || stop {
                break;
            }
        }
    }

    let _ = session.send(SessionEvent::Stop).await;
    match session.join().await {
        Ok(finished) => tracing::info!(
            call_id = %finished.call_id(),
            turns = finished.turn_counter(),
            escalated = finished.is_escalated(),
            "Call ended"
        ),
        Err(e) => tracing::error!(error = %e, "Call session ended abnormally"),
    }
    let _ = writer.await;
}

fn to_session_event(inbound: TwilioInbound) -> Option<SessionEvent> {
    match inbound {
        TwilioInbound::Media { media } => match BASE64.decode(media.payload.as_bytes()) {
            Ok(audio) => Some(SessionEvent::Media(Bytes::from(audio))),
            Err(e) => {
                tracing::debug!(error = %e, "Undecodable media payload");
                None
            }
        },
        TwilioInbound::Mark { mark } => Some(SessionEvent::MarkAcknowledged { label: mark.name }),
        TwilioInbound::Stop => Some(SessionEvent::Stop),
        TwilioInbound::Start { .. } => {
            tracing::warn!("Duplicate start message");
            None
        }
        TwilioInbound::Connected { .. } | TwilioInbound::Unknown => None,
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<OutboundFrame>,
    stream_sid: String,
) {
    while let Some(frame) = frames.recv().await {
        let message = TwilioOutbound::from_frame(&stream_sid, frame);
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode outbound frame");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            tracing::debug!(stream_sid = %stream_sid, "Media stream closed by peer");
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let text = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC123",
                "streamSid": "MZ456",
                "callSid": "CA789",
                "tracks": ["inbound"],
                "customParameters": {"callerNumber": "+1 (555) 123-4567"},
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            },
            "streamSid": "MZ456"
        }"#;
        match TwilioInbound::parse(text).unwrap() {
            TwilioInbound::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ456");
                assert_eq!(start.call_sid, "CA789");
                assert_eq!(start.caller_number(), Some("+1 (555) 123-4567"));
                assert_eq!(
                    CallerId::parse(start.caller_number()).as_str(),
                    "+15551234567"
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_start_without_caller() {
        let text = r#"{"event":"start","streamSid":"MZ1","start":{"callSid":"CA1"}}"#;
        match TwilioInbound::parse(text).unwrap() {
            TwilioInbound::Start { start, .. } => assert_eq!(start.caller_number(), None),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_media_and_mark_become_session_events() {
        let media = TwilioInbound::parse(
            r#"{"event":"media","sequenceNumber":"3","media":{"track":"inbound","chunk":"1","timestamp":"5","payload":"/w=="},"streamSid":"MZ1"}"#,
        )
        .unwrap();
        match to_session_event(media) {
            Some(SessionEvent::Media(audio)) => assert_eq!(audio, Bytes::from_static(&[0xff])),
            other => panic!("unexpected event: {:?}", other),
        }

        let mark = TwilioInbound::parse(
            r#"{"event":"mark","sequenceNumber":"4","streamSid":"MZ1","mark":{"name":"chunk-3"}}"#,
        )
        .unwrap();
        match to_session_event(mark) {
            Some(SessionEvent::MarkAcknowledged { label }) => assert_eq!(label, "chunk-3"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_stop_and_unknown_events() {
        let stop = TwilioInbound::parse(
            r#"{"event":"stop","sequenceNumber":"9","streamSid":"MZ1","stop":{"callSid":"CA1"}}"#,
        )
        .unwrap();
        assert!(matches!(to_session_event(stop), Some(SessionEvent::Stop)));

        let dtmf = TwilioInbound::parse(r#"{"event":"dtmf","dtmf":{"digit":"1"}}"#).unwrap();
        assert!(to_session_event(dtmf).is_none());
    }

    #[test]
    fn test_bad_media_payload_dropped() {
        let media = TwilioInbound::Media {
            media: MediaPayload {
                payload: "not base64!".to_string(),
            },
        };
        assert!(to_session_event(media).is_none());
    }

    #[test]
    fn test_outbound_serialization() {
        let media = TwilioOutbound::from_frame("MZ1", OutboundFrame::Audio(Bytes::from_static(&[0xff])));
        assert_eq!(
            serde_json::to_value(&media).unwrap(),
            serde_json::json!({"event": "media", "streamSid": "MZ1", "media": {"payload": "/w=="}})
        );

        let mark = TwilioOutbound::from_frame("MZ1", OutboundFrame::Mark("chunk-0".to_string()));
        assert_eq!(
            serde_json::to_value(&mark).unwrap(),
            serde_json::json!({"event": "mark", "streamSid": "MZ1", "mark": {"name": "chunk-0"}})
        );

        let clear = TwilioOutbound::from_frame("MZ1", OutboundFrame::Clear);
        assert_eq!(
            serde_json::to_value(&clear).unwrap(),
            serde_json::json!({"event": "clear", "streamSid": "MZ1"})
        );
    }
}
