//! Stopping a completion and reading telemetry from other threads.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use llm_session::inference::stub::StubEngine;
use llm_session::{ChatRole, Completion, FinishReason, InferenceSession, SessionState};

use common::{raw_config, write_gguf};

const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached");
}

#[test]
fn test_stop_from_another_thread_ends_within_one_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), Some(4096));
    let engine = Arc::new(StubEngine::scripted(ALPHABET).with_step_delay(Duration::from_millis(5)));
    let mut session = InferenceSession::load(engine.clone(), &path, raw_config(256)).unwrap();
    let controller = session.controller();

    session.start_completion("go").unwrap();
    let driver = thread::spawn(move || {
        let mut text = String::new();
        while let Completion::Fragment(fragment) = session.completion_loop().unwrap() {
            text.push_str(&fragment);
        }
        (session, text)
    });

    wait_for(|| controller.snapshot().tokens_generated >= 2);
    let steps_at_stop = engine.step_count();
    controller.stop_completion();
    // Repeated requests are harmless.
    controller.stop_completion();

    let (session, text) = driver.join().unwrap();
    assert!(engine.step_count() <= steps_at_stop + 1);
    assert!(text.len() < ALPHABET.len());
    assert!(ALPHABET.starts_with(&text));

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(session.last_finish_reason(), Some(FinishReason::Cancelled));

    let last = session.history().last().unwrap();
    assert_eq!(last.role, ChatRole::Assistant);
    assert_eq!(last.content, text);
    session.close().unwrap();
}

#[test]
fn test_stop_before_first_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), Some(4096));
    let engine = Arc::new(StubEngine::scripted(ALPHABET));
    let mut session = InferenceSession::load(engine.clone(), &path, raw_config(256)).unwrap();
    let controller = session.controller();

    session.start_completion("go").unwrap();
    controller.stop_completion();
    assert_eq!(controller.state(), SessionState::Cancelling);

    assert_eq!(session.completion_loop().unwrap(), Completion::EndOfGeneration);
    assert_eq!(engine.step_count(), 0);
    let turns = session.history().turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].role, ChatRole::Assistant);
    assert_eq!(turns[1].content, "");
}

#[test]
fn test_stop_while_idle_does_not_affect_next_turn() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), Some(4096));
    let mut session =
        InferenceSession::load(Arc::new(StubEngine::scripted("ok")), &path, raw_config(64))
            .unwrap();
    let controller = session.controller();

    controller.stop_completion();
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(session.get_response("hi").unwrap(), "ok");
    assert_eq!(session.last_finish_reason(), Some(FinishReason::EndToken));
}

#[test]
fn test_concurrent_telemetry_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), Some(4096));
    let engine = StubEngine::scripted(ALPHABET).with_step_delay(Duration::from_millis(1));
    let mut session = InferenceSession::load(Arc::new(engine), &path, raw_config(128)).unwrap();
    let controller = session.controller();
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let done = done.clone();
        thread::spawn(move || {
            let mut last_used = 0;
            let mut reads = 0;
            while !done.load(Ordering::Acquire) {
                let used = controller.context_size_used();
                assert!(used >= last_used);
                assert!(used <= 128);
                assert!(controller.generation_speed() >= 0.0);
                last_used = used;
                reads += 1;
            }
            reads
        })
    };

    let response = session.get_response("q").unwrap();
    done.store(true, Ordering::Release);
    let reads = reader.join().unwrap();

    assert_eq!(response, ALPHABET);
    assert!(reads > 0);
    assert_eq!(session.context_size_used(), 2 + ALPHABET.len());
    assert!(session.generation_speed() > 0.0);
}

#[test]
fn test_controller_outlives_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), Some(4096));
    let engine = Arc::new(StubEngine::scripted("ok"));
    let mut session = InferenceSession::load(engine.clone(), &path, raw_config(64)).unwrap();
    let controller = session.controller();
    assert_eq!(controller.session_id(), session.id());

    session.get_response("hi").unwrap();
    session.close().unwrap();

    controller.stop_completion();
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(controller.snapshot().tokens_generated, 2);
    assert_eq!(engine.release_count(), 1);
}
