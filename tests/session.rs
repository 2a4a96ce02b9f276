//! Session manager integration tests
//!
//! Drives join/leave, the playback queue and its completion path through
//! in-memory gateway mocks.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use vigil::{Error, JoinOutcome, LoopMode, PlaybackState};

mod common;
use common::{
    GUILD, MEMBER, OTHER_VOICE, VOICE, current_title, harness, pending_titles, settle, wait_for,
    wait_for_current, wait_for_status,
};

#[tokio::test]
async fn first_enqueue_starts_the_first_track() {
    let (manager, gateway, _) = harness();
    assert_eq!(
        manager.join_session(GUILD, VOICE).await.unwrap(),
        JoinOutcome::Connected
    );

    let first = manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();
    assert!(first.started);
    let second = manager.enqueue_track(GUILD, "b.mp3", "b").await.unwrap();
    assert!(!second.started);
    assert_eq!(second.position, 1);

    let status = manager.session_status(GUILD).await;
    let playback = status.playback.unwrap();
    assert_eq!(playback.state, PlaybackState::Playing);
    assert_eq!(playback.current.unwrap().title, "a");
    assert_eq!(gateway.last_connection().played(), vec!["a"]);
}

#[tokio::test]
async fn enqueue_requires_join() {
    let (manager, _, _) = harness();
    let err = manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn natural_completion_moves_to_history() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    for name in ["a", "b"] {
        manager.enqueue_track(GUILD, format!("{name}.mp3"), name).await.unwrap();
    }

    let conn = gateway.last_connection();
    conn.finish_current();
    wait_for_current(&manager, GUILD, Some("b")).await;

    let playback = manager.session_status(GUILD).await.playback.unwrap();
    assert_eq!(playback.history_len, 1);
    assert!(playback.pending.is_empty());

    conn.finish_current();
    wait_for_current(&manager, GUILD, None).await;
    let playback = manager.session_status(GUILD).await.playback.unwrap();
    assert_eq!(playback.state, PlaybackState::Idle);
    assert_eq!(playback.history_len, 2);
}

#[tokio::test]
async fn single_loop_repeats_until_skipped() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    manager.set_loop_mode(GUILD, LoopMode::Single).await.unwrap();
    manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();
    manager.enqueue_track(GUILD, "b.mp3", "b").await.unwrap();

    let conn = gateway.last_connection();
    for round in 2..=4 {
        conn.finish_current();
        wait_for("a to repeat", || conn.played().len() == round).await;
    }
    assert_eq!(conn.played(), vec!["a", "a", "a", "a"]);
    assert_eq!(pending_titles(&manager, GUILD).await, vec!["b"]);

    manager.skip(GUILD).await.unwrap();
    wait_for_current(&manager, GUILD, Some("b")).await;
    let playback = manager.session_status(GUILD).await.playback.unwrap();
    assert_eq!(playback.history_len, 1);
}

#[tokio::test]
async fn all_loop_cycles_in_order() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    manager.set_loop_mode(GUILD, LoopMode::All).await.unwrap();
    for name in ["a", "b", "c"] {
        manager.enqueue_track(GUILD, format!("{name}.mp3"), name).await.unwrap();
    }

    let conn = gateway.last_connection();
    for round in 2..=4 {
        conn.finish_current();
        wait_for("next track", || conn.played().len() == round).await;
    }

    assert_eq!(conn.played(), vec!["a", "b", "c", "a"]);
    assert_eq!(current_title(&manager, GUILD).await.as_deref(), Some("a"));
    assert_eq!(pending_titles(&manager, GUILD).await, vec!["b", "c"]);
    let playback = manager.session_status(GUILD).await.playback.unwrap();
    assert_eq!(playback.history_len, 0);
}

#[tokio::test]
async fn previous_without_history_changes_nothing() {
    let (manager, _, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();
    manager.enqueue_track(GUILD, "b.mp3", "b").await.unwrap();

    let before = manager.session_status(GUILD).await.playback;
    let err = manager.previous(GUILD).await.unwrap_err();
    assert!(matches!(err, Error::NoHistory));
    assert_eq!(manager.session_status(GUILD).await.playback, before);
}

#[tokio::test]
async fn previous_replays_last_track_then_current() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    for name in ["a", "b", "c"] {
        manager.enqueue_track(GUILD, format!("{name}.mp3"), name).await.unwrap();
    }
    let conn = gateway.last_connection();
    conn.finish_current();
    wait_for_current(&manager, GUILD, Some("b")).await;

    manager.previous(GUILD).await.unwrap();
    wait_for_current(&manager, GUILD, Some("a")).await;
    assert_eq!(pending_titles(&manager, GUILD).await, vec!["b", "c"]);
    assert_eq!(conn.played(), vec!["a", "b", "a"]);
}

#[tokio::test]
async fn skip_racing_completion_consumes_one_track() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    for name in ["a", "b", "c", "d"] {
        manager.enqueue_track(GUILD, format!("{name}.mp3"), name).await.unwrap();
    }
    let sink = gateway.last_connection().last_sink();

    let (skipped, ()) = tokio::join!(manager.skip(GUILD), async { sink.finish(None) });
    skipped.unwrap();
    settle().await;

    assert_eq!(current_title(&manager, GUILD).await.as_deref(), Some("b"));
    assert_eq!(pending_titles(&manager, GUILD).await, vec!["c", "d"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn skip_and_completion_on_another_thread_never_lose_a_track() {
    let titles = ["a", "b", "c", "d", "e", "f"];
    for _ in 0..25 {
        let (manager, gateway, _) = harness();
        manager.join_session(GUILD, VOICE).await.unwrap();
        for name in titles {
            manager.enqueue_track(GUILD, format!("{name}.mp3"), name).await.unwrap();
        }
        let conn = gateway.last_connection();
        let sink = conn.last_sink();

        let barrier = Arc::new(Barrier::new(2));
        let finisher = std::thread::spawn({
            let barrier = Arc::clone(&barrier);
            move || {
                barrier.wait();
                sink.finish(None);
            }
        });
        tokio::task::block_in_place(|| barrier.wait());
        manager.skip(GUILD).await.unwrap();
        finisher.join().unwrap();
        wait_for_status(&manager, GUILD, "playback to settle", |status| {
            status
                .playback
                .as_ref()
                .is_some_and(|p| p.current.is_some() && p.history_len + 1 == conn.played().len())
        })
        .await;
        settle().await;

        // Either the skip hit "a" (one advance) or it landed after the
        // completion and hit "b" (two advances). Every consumed track must
        // have been started exactly once and the tail must be untouched.
        let status = manager.session_status(GUILD).await.playback.unwrap();
        let current = status.current.unwrap().title;
        let played = conn.played();
        let unique: HashSet<_> = played.iter().collect();
        assert_eq!(unique.len(), played.len(), "a track started twice: {played:?}");
        assert!(matches!(status.history_len, 1 | 2), "history {}", status.history_len);
        assert_eq!(played.len(), status.history_len + 1, "played {played:?}");
        assert!(played.contains(&current));

        let consumed = status.history_len + 1;
        let expected_pending: Vec<_> = titles[consumed..].iter().map(ToString::to_string).collect();
        let pending: Vec<_> = status.pending.into_iter().map(|t| t.title).collect();
        assert_eq!(pending, expected_pending);
    }
}

#[tokio::test]
async fn late_completion_after_forced_advance_is_ignored() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    let conn = gateway.last_connection();
    conn.set_stuck_stop(true);
    for name in ["a", "b", "c"] {
        manager.enqueue_track(GUILD, format!("{name}.mp3"), name).await.unwrap();
    }
    let first = conn.last_sink();

    // The stop is refused, so skip advances by itself
    manager.skip(GUILD).await.unwrap();
    assert_eq!(first.stops(), 1);
    assert_eq!(current_title(&manager, GUILD).await.as_deref(), Some("b"));

    // The original track's end arrives afterwards and must not advance again
    first.finish(None);
    settle().await;
    assert_eq!(current_title(&manager, GUILD).await.as_deref(), Some("b"));
    assert_eq!(pending_titles(&manager, GUILD).await, vec!["c"]);
}

#[tokio::test]
async fn skip_reports_empty_queue_and_idle() {
    let (manager, _, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    assert!(matches!(
        manager.skip(GUILD).await.unwrap_err(),
        Error::NoActiveTrack
    ));

    manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();
    assert!(matches!(manager.skip(GUILD).await.unwrap_err(), Error::QueueEmpty));
    assert_eq!(current_title(&manager, GUILD).await.as_deref(), Some("a"));
}

#[tokio::test]
async fn playback_error_still_advances() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();
    manager.enqueue_track(GUILD, "b.mp3", "b").await.unwrap();

    gateway
        .last_connection()
        .last_sink()
        .finish(Some("decoder crashed".to_string()));
    wait_for_current(&manager, GUILD, Some("b")).await;
}

#[tokio::test]
async fn track_that_fails_to_start_is_skipped() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    manager.set_loop_mode(GUILD, LoopMode::Single).await.unwrap();
    let conn = gateway.last_connection();
    conn.break_source("broken.mp3");

    manager.enqueue_track(GUILD, "broken.mp3", "broken").await.unwrap();
    let playback = manager.session_status(GUILD).await.playback.unwrap();
    assert_eq!(playback.state, PlaybackState::Idle);
    assert_eq!(playback.history_len, 1);

    manager.enqueue_track(GUILD, "good.mp3", "good").await.unwrap();
    assert_eq!(conn.played(), vec!["good"]);
}

#[tokio::test]
async fn leave_tears_everything_down() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();
    manager.enqueue_track(GUILD, "b.mp3", "b").await.unwrap();
    let conn = gateway.last_connection();

    assert!(manager.leave_session(GUILD).await);
    assert!(conn.is_disconnected());
    assert!(conn.last_sink().stops() >= 1);

    assert!(matches!(
        manager.enqueue_track(GUILD, "c.mp3", "c").await.unwrap_err(),
        Error::NotConnected
    ));
    assert!(matches!(manager.skip(GUILD).await.unwrap_err(), Error::NotConnected));
    assert!(matches!(manager.previous(GUILD).await.unwrap_err(), Error::NotConnected));
    assert!(matches!(manager.pause(GUILD).await.unwrap_err(), Error::NotConnected));

    let status = manager.session_status(GUILD).await;
    assert!(!status.attached);
    assert!(status.playback.is_none());
    assert!(status.desired_channel_id.is_none());

    // Idempotent
    assert!(!manager.leave_session(GUILD).await);
    settle().await;
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn rejoin_after_leave_starts_fresh() {
    let (manager, _, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();
    manager.leave_session(GUILD).await;

    manager.join_session(GUILD, VOICE).await.unwrap();
    let status = manager.session_status(GUILD).await;
    assert!(status.attached);
    assert!(status.playback.is_none());
}

#[tokio::test]
async fn join_moves_or_stays() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    assert_eq!(
        manager.join_session(GUILD, VOICE).await.unwrap(),
        JoinOutcome::AlreadyThere
    );
    assert_eq!(
        manager.join_session(GUILD, OTHER_VOICE).await.unwrap(),
        JoinOutcome::Moved
    );
    assert_eq!(gateway.attempts(), 1);

    let status = manager.session_status(GUILD).await;
    assert_eq!(status.channel_id, Some(OTHER_VOICE));
    assert_eq!(status.desired_channel_id, Some(OTHER_VOICE));
}

#[tokio::test]
async fn join_follows_member_into_voice() {
    let (manager, gateway, _) = harness();
    assert!(matches!(
        manager.join_member_channel(GUILD, MEMBER, None).await.unwrap_err(),
        Error::NoVoiceChannel
    ));

    gateway.put_member(MEMBER, OTHER_VOICE);
    let (channel, outcome) = manager.join_member_channel(GUILD, MEMBER, None).await.unwrap();
    assert_eq!(channel, OTHER_VOICE);
    assert_eq!(outcome, JoinOutcome::Connected);
}

#[tokio::test]
async fn hung_connect_times_out() {
    let (manager, gateway, _) = harness();
    gateway.set_delay(Duration::from_secs(5));

    let err = manager.join_session(GUILD, VOICE).await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    assert!(err.is_retryable());

    // Still pinned, so the watchdog will retry
    let status = manager.session_status(GUILD).await;
    assert!(!status.attached);
    assert_eq!(status.desired_channel_id, Some(VOICE));
}

#[tokio::test]
async fn volume_is_clamped_and_applied_live() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();

    let applied = manager.set_volume(GUILD, 5.0).await.unwrap();
    assert!((applied - 2.0).abs() < f32::EPSILON);
    let sink = gateway.last_connection().last_sink();
    assert!((sink.volume() - 2.0).abs() < f32::EPSILON);

    let applied = manager.set_volume(GUILD, -1.0).await.unwrap();
    assert!(applied.abs() < f32::EPSILON);
}

#[tokio::test]
async fn pause_and_resume_report_state() {
    let (manager, gateway, _) = harness();
    manager.join_session(GUILD, VOICE).await.unwrap();
    assert_eq!(manager.pause(GUILD).await.unwrap(), PlaybackState::Idle);

    manager.enqueue_track(GUILD, "a.mp3", "a").await.unwrap();
    let sink = gateway.last_connection().last_sink();

    assert_eq!(manager.resume(GUILD).await.unwrap(), PlaybackState::Playing);
    assert_eq!(manager.pause(GUILD).await.unwrap(), PlaybackState::Paused);
    assert!(sink.is_paused());
    assert_eq!(manager.pause(GUILD).await.unwrap(), PlaybackState::Paused);
    assert_eq!(manager.resume(GUILD).await.unwrap(), PlaybackState::Playing);
    assert!(!sink.is_paused());
}

#[tokio::test]
async fn latency_comes_from_gateway() {
    let (manager, _, _) = harness();
    assert_eq!(manager.latency().await, Some(Duration::from_millis(42)));
}
