//! Voice pipeline integration tests
//!
//! Exercises the staged pipeline with mock backends and synthetic
//! audio; no hardware or network involved.

use std::sync::Arc;
use std::time::Duration;

mod common;

use common::{FailingTranscriber, FixedTranscriber, ScriptedChat};

const RATE: usize = 16_000;

fn none_reply(text: &str) -> String {
    format!(r#"{{"command": "none", "args": [], "text": "{text}"}}"#)
}

#[tokio::test]
async fn typed_text_produces_a_response() {
    let chat = ScriptedChat::new(&[&none_reply("Good morning.")]);
    let t = common::build_assistant(Arc::clone(&chat) as _, Arc::new(FixedTranscriber(String::new())));

    assert!(t.assistant.begin().await.expect("begin"));
    t.assistant.send_text("good morning").await.expect("send");

    let response = t
        .assistant
        .last_response(Duration::from_secs(5))
        .await
        .expect("response");
    assert!(response.success);
    assert_eq!(response.text, "Good morning.");
    assert_eq!(response.command, "none");

    // The model saw the system prompt with the command list
    let calls = chat.calls();
    assert_eq!(calls[0][0].role, "system");
    assert!(calls[0][0].content.contains("ping"));
    // And the user turn
    assert!(calls[0].iter().any(|m| m.role == "user" && m.content == "good morning"));

    t.assistant.end().await;
}

#[tokio::test]
async fn registered_command_is_executed() {
    let chat = ScriptedChat::new(&[r#"{"command": "ping", "args": [], "text": "Pinging."}"#]);
    let t = common::build_assistant(chat, Arc::new(FixedTranscriber(String::new())));

    t.assistant.begin().await.expect("begin");
    t.assistant.send_text("are you alive").await.expect("send");

    let response = t
        .assistant
        .last_response(Duration::from_secs(5))
        .await
        .expect("response");
    assert!(response.success);
    assert_eq!(response.command, "ping");
    assert_eq!(response.text, "Pinging.");

    // Raw command output lands in the history entry
    let entries = t.conversation.entries();
    let assistant_turn = entries.last().expect("assistant turn");
    assert_eq!(assistant_turn.command, "ping");
    assert_eq!(assistant_turn.output, "pong");

    t.assistant.end().await;
}

#[tokio::test]
async fn unknown_command_fails_the_turn() {
    let chat = ScriptedChat::new(&[r#"{"command": "warp_drive", "args": [], "text": "Engaging."}"#]);
    let t = common::build_assistant(chat, Arc::new(FixedTranscriber(String::new())));

    t.assistant.begin().await.expect("begin");
    t.assistant.send_text("engage").await.expect("send");

    let response = t
        .assistant
        .last_response(Duration::from_secs(5))
        .await
        .expect("response");
    assert!(!response.success);
    assert_eq!(response.command, "warp_drive");

    t.assistant.end().await;
}

#[tokio::test]
async fn script_output_is_refined_before_speaking() {
    let chat = ScriptedChat::new(&[
        r#"{"command": "script", "args": ["println('42')"], "text": "Let me check."}"#,
        "The answer is 42.",
    ]);
    let t = common::build_assistant(Arc::clone(&chat) as _, Arc::new(FixedTranscriber(String::new())));

    t.assistant.begin().await.expect("begin");
    t.assistant.send_text("what is the answer").await.expect("send");

    let response = t
        .assistant
        .last_response(Duration::from_secs(5))
        .await
        .expect("response");
    assert!(response.success);
    assert_eq!(response.command, "script");
    assert_eq!(response.text, "The answer is 42.");

    let entries = t.conversation.entries();
    let assistant_turn = entries.last().expect("assistant turn");
    assert_eq!(assistant_turn.output, "42");
    assert_eq!(assistant_turn.refined_output, "The answer is 42.");

    // Two model calls: the turn itself and the refinement pass
    assert_eq!(chat.calls().len(), 2);

    t.assistant.end().await;
}

#[tokio::test]
async fn plain_prose_reply_is_spoken_as_is() {
    let chat = ScriptedChat::new(&["Just a plain sentence."]);
    let t = common::build_assistant(chat, Arc::new(FixedTranscriber(String::new())));

    t.assistant.begin().await.expect("begin");
    t.assistant.send_text("say something").await.expect("send");

    let response = t
        .assistant
        .last_response(Duration::from_secs(5))
        .await
        .expect("response");
    assert!(response.success);
    assert_eq!(response.command, "none");
    assert_eq!(response.text, "Just a plain sentence.");

    t.assistant.end().await;
}

#[tokio::test]
async fn begin_respects_the_feature_toggle() {
    let chat = ScriptedChat::new(&[]);
    let t = common::build_assistant(chat, Arc::new(FixedTranscriber(String::new())));

    t.settings.set_voice_assistant_enabled(false);
    assert!(!t.assistant.begin().await.expect("begin"));
    assert!(!t.assistant.is_running());
    assert!(t.playback.voice_modes().is_empty());

    t.settings.set_voice_assistant_enabled(true);
    assert!(t.assistant.begin().await.expect("begin"));
    // Idempotent
    assert!(t.assistant.begin().await.expect("begin"));
    assert!(t.assistant.is_running());

    t.assistant.end().await;
    assert!(!t.assistant.is_running());
}

#[tokio::test]
async fn voice_mode_follows_the_pipeline_lifecycle() {
    let chat = ScriptedChat::new(&[]);
    let t = common::build_assistant(chat, Arc::new(FixedTranscriber(String::new())));

    t.assistant.begin().await.expect("begin");
    t.assistant.end().await;

    assert_eq!(t.playback.voice_modes(), vec![true, false]);
}

#[tokio::test]
async fn concurrent_begins_start_one_pipeline() {
    let chat = ScriptedChat::new(&[]);
    let t = common::build_assistant(chat, Arc::new(FixedTranscriber(String::new())));

    let first = Arc::clone(&t.assistant);
    let second = Arc::clone(&t.assistant);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.begin().await }),
        tokio::spawn(async move { second.begin().await }),
    );
    assert!(a.expect("join").expect("begin"));
    assert!(b.expect("join").expect("begin"));

    // Only one of the two claimed startup and toggled voice mode
    assert_eq!(t.playback.voice_modes(), vec![true]);

    t.assistant.end().await;
    assert!(!t.assistant.is_running());
    assert_eq!(t.playback.voice_modes(), vec![true, false]);
}

#[tokio::test]
async fn failed_capture_start_reverts_voice_mode() {
    // Continuous mode with no capture source: begin must fail and undo
    // the voice-mode switch
    let chat = ScriptedChat::new(&[]);
    let t = common::build_continuous_assistant(
        chat,
        Arc::new(FixedTranscriber(String::new())),
        Vec::new(),
    );

    assert!(t.assistant.begin().await.is_err());
    assert!(!t.assistant.is_running());
    assert_eq!(t.playback.voice_modes(), vec![true, false]);
}

#[tokio::test]
async fn send_text_requires_a_running_pipeline() {
    let chat = ScriptedChat::new(&[]);
    let t = common::build_assistant(chat, Arc::new(FixedTranscriber(String::new())));

    assert!(t.assistant.send_text("hello").await.is_err());
}

#[tokio::test]
async fn continuous_capture_segments_and_answers() {
    // One second of speech followed by enough silence to close the
    // utterance
    let mut samples = vec![5000i16; RATE];
    samples.extend(vec![0i16; RATE * 5 / 2]);

    let chat = ScriptedChat::new(&[&none_reply("Lights are on.")]);
    let t = common::build_continuous_assistant(
        chat,
        Arc::new(FixedTranscriber("turn on the lights".to_string())),
        samples,
    );

    t.assistant.begin().await.expect("begin");

    let response = t
        .assistant
        .last_response(Duration::from_secs(10))
        .await
        .expect("response");
    assert!(response.success);
    assert_eq!(response.text, "Lights are on.");

    // Capture holds the hardware, so playback was stopped on acquire
    assert!(t.playback.stop_count() >= 1);

    t.assistant.end().await;
}

#[tokio::test]
async fn push_to_talk_recording_flows_through_the_pipeline() {
    let chat = ScriptedChat::new(&[&none_reply("Recorded and understood.")]);
    let t = common::build_assistant_with_source(
        chat,
        Arc::new(FixedTranscriber("what time is it".to_string())),
        vec![3000i16; RATE],
    );

    t.assistant.start_recording().expect("start recording");
    // A second recording while one is active is refused
    assert!(t.assistant.start_recording().is_err());

    tokio::time::sleep(Duration::from_millis(300)).await;
    t.assistant
        .stop_recording_and_process()
        .await
        .expect("stop and process");

    let response = t
        .assistant
        .last_response(Duration::from_secs(5))
        .await
        .expect("response");
    assert!(response.success);
    assert_eq!(response.text, "Recorded and understood.");

    t.assistant.end().await;
}

#[tokio::test]
async fn stop_without_start_is_an_error() {
    let chat = ScriptedChat::new(&[]);
    let t = common::build_assistant(chat, Arc::new(FixedTranscriber(String::new())));

    assert!(t.assistant.stop_recording_and_process().await.is_err());
}

#[tokio::test]
async fn transcription_failure_surfaces_as_failed_turn() {
    let chat = ScriptedChat::new(&[]);
    let t = common::build_assistant_with_source(
        chat,
        Arc::new(FailingTranscriber),
        vec![3000i16; RATE],
    );

    t.assistant.start_recording().expect("start recording");
    tokio::time::sleep(Duration::from_millis(300)).await;
    t.assistant
        .stop_recording_and_process()
        .await
        .expect("stop and process");

    let response = t
        .assistant
        .last_response(Duration::from_secs(5))
        .await
        .expect("response");
    assert!(!response.success);
    assert!(response.text.contains("transcription failed"));

    t.assistant.end().await;
}
