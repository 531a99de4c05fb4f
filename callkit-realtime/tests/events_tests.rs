//! Tests for the side-channel event protocol.

use callkit_realtime::{ClientEvent, ConnectionState, ServerEvent};
use proptest::prelude::*;
use serde_json::json;

#[test]
fn test_input_transcript_completed() {
    let event = ServerEvent::parse(
        r#"{"type":"conversation.item.input_audio_transcription.completed","event_id":"e1","item_id":"item_7","content_index":0,"transcript":"Saya merasa cemas"}"#,
    )
    .unwrap();
    assert!(matches!(
        &event,
        ServerEvent::InputTranscriptCompleted { item_id: Some(id), transcript } if id == "item_7" && transcript == "Saya merasa cemas"
    ));

    let mut state = ConnectionState::default();
    assert!(event.apply(&mut state));
    assert_eq!(state.transcript, "Saya merasa cemas");
    assert!(state.ai_response.is_empty());
}

#[test]
fn test_response_done_takes_first_transcript() {
    let event = ServerEvent::parse(
        &json!({
            "type": "response.done",
            "response": {
                "id": "resp_1",
                "status": "completed",
                "output": [
                    {"type": "message", "content": [{"type": "audio", "transcript": "Halo"}]},
                    {"type": "message", "content": [{"type": "audio", "transcript": "Dunia"}]}
                ]
            }
        })
        .to_string(),
    )
    .unwrap();

    let mut state = ConnectionState::default();
    assert!(event.apply(&mut state));
    assert_eq!(state.ai_response, "Halo");
}

#[test]
fn test_response_done_falls_back_to_text() {
    let event = ServerEvent::parse(
        r#"{"type":"response.done","response":{"output":[{"content":[{"type":"text","text":"typed reply"}]}]}}"#,
    )
    .unwrap();
    let mut state = ConnectionState::default();
    assert!(event.apply(&mut state));
    assert_eq!(state.ai_response, "typed reply");
}

#[test]
fn test_response_done_without_output_changes_nothing() {
    let event = ServerEvent::parse(r#"{"type":"response.done","response":{"status":"cancelled","output":[]}}"#)
        .unwrap();
    let mut state = ConnectionState { ai_response: "earlier".into(), ..Default::default() };
    assert!(!event.apply(&mut state));
    assert_eq!(state.ai_response, "earlier");
}

#[test]
fn test_flat_legacy_events() {
    let mut state = ConnectionState::default();
    ServerEvent::parse(r#"{"type":"transcript","text":"hi"}"#).unwrap().apply(&mut state);
    ServerEvent::parse(r#"{"type":"response","text":"hello"}"#).unwrap().apply(&mut state);
    assert_eq!(state.transcript, "hi");
    assert_eq!(state.ai_response, "hello");
}

#[test]
fn test_unknown_kinds_are_ignored() {
    for raw in [
        r#"{"type":"session.created","session":{"id":"s"}}"#,
        r#"{"type":"response.audio_transcript.delta","delta":"Ha"}"#,
        r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":120}"#,
        r#"{"type":"rate_limits.updated","rate_limits":[]}"#,
    ] {
        let event = ServerEvent::parse(raw).unwrap();
        assert_eq!(event, ServerEvent::Unknown, "{raw}");
        let mut state = ConnectionState::default();
        assert!(!event.apply(&mut state));
        assert_eq!(state, ConnectionState::default());
    }
}

#[test]
fn test_error_event_does_not_touch_state() {
    let event = ServerEvent::parse(
        r#"{"type":"error","error":{"type":"invalid_request_error","code":"bad","message":"nope"}}"#,
    )
    .unwrap();
    let mut state = ConnectionState::default();
    assert!(!event.apply(&mut state));
    assert!(state.error.is_none());
}

#[test]
fn test_malformed_messages_fail_to_parse() {
    assert!(ServerEvent::parse("{not json").is_err());
    assert!(ServerEvent::parse("[]").is_err());
}

#[test]
fn test_client_event_wire_format() {
    let update = ClientEvent::SessionUpdate { session: json!({"voice": "alloy"}) };
    let value: serde_json::Value = serde_json::from_str(&update.to_json().unwrap()).unwrap();
    assert_eq!(value, json!({"type": "session.update", "session": {"voice": "alloy"}}));

    let cancel = ClientEvent::ResponseCancel.to_json().unwrap();
    assert_eq!(cancel, r#"{"type":"response.cancel"}"#);

    let create = ClientEvent::ResponseCreate { response: Some(json!({"modalities": ["audio"]})) };
    let value: serde_json::Value = serde_json::from_str(&create.to_json().unwrap()).unwrap();
    assert_eq!(value["response"]["modalities"][0], "audio");
}

#[derive(Debug, Clone)]
enum Incoming {
    Transcript(String),
    Reply(String),
    Noise,
}

fn arb_incoming() -> impl Strategy<Value = Incoming> {
    prop_oneof![
        "[a-zA-Z ]{0,20}".prop_map(Incoming::Transcript),
        "[a-zA-Z ]{1,20}".prop_map(Incoming::Reply),
        Just(Incoming::Noise),
    ]
}

fn encode(incoming: &Incoming) -> String {
    match incoming {
        Incoming::Transcript(t) => json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": t
        })
        .to_string(),
        Incoming::Reply(t) => json!({
            "type": "response.done",
            "response": {"output": [{"content": [{"transcript": t}]}]}
        })
        .to_string(),
        Incoming::Noise => r#"{"type":"response.audio.delta","delta":"AAAA"}"#.to_string(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// After any message sequence, each field holds the last event of its kind.
    #[test]
    fn prop_fields_reflect_latest_event(messages in proptest::collection::vec(arb_incoming(), 0..30)) {
        let mut state = ConnectionState::default();
        for message in &messages {
            ServerEvent::parse(&encode(message)).unwrap().apply(&mut state);
        }

        let last_transcript = messages.iter().rev().find_map(|m| match m {
            Incoming::Transcript(t) => Some(t.clone()),
            _ => None,
        });
        let last_reply = messages.iter().rev().find_map(|m| match m {
            Incoming::Reply(t) => Some(t.clone()),
            _ => None,
        });

        prop_assert_eq!(state.transcript, last_transcript.unwrap_or_default());
        prop_assert_eq!(state.ai_response, last_reply.unwrap_or_default());
    }
}
