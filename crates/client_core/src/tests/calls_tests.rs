use std::{sync::Mutex as StdMutex, time::Duration};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use storage::CallStatusUpdate;

use super::*;
use crate::{
    test_support::{next_event, scripted_engine, test_config, ScriptedTransport, StoreFixture},
    ChatEngine, EngineConfig, NoPresence,
};

/// Records media steps; fails every step when `broken`.
#[derive(Default)]
struct RecordingMedia {
    steps: StdMutex<Vec<(&'static str, CallId)>>,
    broken: bool,
}

impl RecordingMedia {
    fn steps(&self) -> Vec<(&'static str, CallId)> {
        self.steps.lock().expect("steps").clone()
    }

    fn record(&self, step: &'static str, call: &CallSession) -> anyhow::Result<()> {
        self.steps.lock().expect("steps").push((step, call.call_id));
        if self.broken {
            anyhow::bail!("no audio device");
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for RecordingMedia {
    async fn initiate(&self, call: &CallSession) -> anyhow::Result<()> {
        self.record("initiate", call)
    }

    async fn accept(&self, call: &CallSession) -> anyhow::Result<()> {
        self.record("accept", call)
    }

    async fn close(&self, call: &CallSession) -> anyhow::Result<()> {
        self.record("close", call)
    }
}

async fn engine_with_media(fx: &StoreFixture, user_id: UserId, media: Arc<RecordingMedia>) -> ChatEngine {
    ChatEngine::builder(test_config(), user_id)
        .primary(ScriptedTransport::down("rpc"))
        .secondary(fx.direct())
        .presence(Arc::new(NoPresence))
        .media(media)
        .build()
        .await
        .expect("engine")
}

#[tokio::test]
async fn direct_call_lifecycle_records_duration() {
    let fx = StoreFixture::new().await;
    let alice_media = Arc::new(RecordingMedia::default());
    let alice = engine_with_media(&fx, fx.alice, alice_media.clone()).await;
    let bob = fx.engine_for(fx.bob).await;
    let mut bob_events = bob.subscribe_events();

    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Video)
        .await
        .expect("start");
    assert_eq!(call.status, CallStatus::Calling);
    assert_eq!(call.caller_id, fx.alice);
    assert!(!call.is_group_call());

    bob.calls().refresh_calls().await;
    let incoming = next_event(&mut bob_events, |event| match event {
        ClientEvent::IncomingCall(call) => Some(call.call_id),
        _ => None,
    })
    .await;
    assert_eq!(incoming, call.call_id);
    assert_eq!(bob.calls().incoming_calls().await.len(), 1);

    // Connected 37 seconds ago.
    let connected = fx
        .storage
        .update_call_status(
            call.call_id,
            CallStatus::Calling,
            &CallStatusUpdate {
                status: CallStatus::Answered,
                started_at: Some(Utc::now() - ChronoDuration::seconds(37)),
                ended_at: None,
                duration_seconds: None,
            },
        )
        .await
        .expect("update");
    assert!(connected);

    alice.calls().refresh_calls().await;
    assert_eq!(
        alice.calls().call(call.call_id).await.expect("call").status,
        CallStatus::Answered
    );

    let ended = alice.calls().end_call(call.call_id).await.expect("end");
    assert_eq!(ended.status, CallStatus::Ended);
    assert_eq!(ended.duration_seconds, Some(37));
    assert!(ended.ended_at.is_some());
    assert_eq!(
        alice_media.steps(),
        vec![("initiate", call.call_id), ("close", call.call_id)]
    );

    bob.calls().refresh_calls().await;
    assert!(bob.calls().incoming_calls().await.is_empty());
    assert_eq!(
        bob.calls().call(call.call_id).await.expect("call").status,
        CallStatus::Ended
    );
}

#[tokio::test]
async fn answering_sets_started_at_and_accepts_media() {
    let fx = StoreFixture::new().await;
    let alice = fx.engine_for(fx.alice).await;
    let bob_media = Arc::new(RecordingMedia::default());
    let bob = engine_with_media(&fx, fx.bob, bob_media.clone()).await;

    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");
    bob.calls().refresh_calls().await;
    let answered = bob.calls().answer_call(call.call_id).await.expect("answer");
    assert_eq!(answered.status, CallStatus::Answered);
    assert!(answered.started_at.is_some());
    assert_eq!(bob_media.steps(), vec![("accept", call.call_id)]);
}

#[tokio::test]
async fn media_is_closed_when_the_peer_declines() {
    let fx = StoreFixture::new().await;
    let alice_media = Arc::new(RecordingMedia::default());
    let alice = engine_with_media(&fx, fx.alice, alice_media.clone()).await;
    let bob = fx.engine_for(fx.bob).await;

    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");
    bob.calls().refresh_calls().await;
    bob.calls().decline_call(call.call_id).await.expect("decline");

    alice.calls().refresh_calls().await;
    assert_eq!(
        alice.calls().call(call.call_id).await.expect("call").status,
        CallStatus::Declined
    );
    assert_eq!(
        alice_media.steps(),
        vec![("initiate", call.call_id), ("close", call.call_id)]
    );

    // Later refreshes do not close it again.
    alice.calls().refresh_calls().await;
    assert_eq!(alice_media.steps().len(), 2);
}

#[tokio::test]
async fn media_is_closed_when_an_outgoing_call_is_missed() {
    let fx = StoreFixture::new().await;
    let media = Arc::new(RecordingMedia::default());
    let config = EngineConfig {
        ring_timeout: Duration::ZERO,
        ..test_config()
    };
    let alice = ChatEngine::builder(config, fx.alice)
        .primary(ScriptedTransport::down("rpc"))
        .secondary(fx.direct())
        .presence(Arc::new(NoPresence))
        .media(media.clone())
        .build()
        .await
        .expect("engine");

    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");
    alice.calls().refresh_calls().await;
    assert_eq!(
        alice.calls().call(call.call_id).await.expect("call").status,
        CallStatus::Missed
    );
    assert_eq!(
        media.steps(),
        vec![("initiate", call.call_id), ("close", call.call_id)]
    );
}

#[tokio::test]
async fn callers_cannot_answer_their_own_call() {
    let fx = StoreFixture::new().await;
    let alice = fx.engine_for(fx.alice).await;
    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");

    let err = alice
        .calls()
        .answer_call(call.call_id)
        .await
        .expect_err("own call");
    assert!(matches!(err, EngineError::AccessDenied(_)));
    let stored = fx.storage.call(call.call_id).await.expect("load").expect("row");
    assert_eq!(stored.status, CallStatus::Calling);
    assert!(stored.started_at.is_none());
}

#[tokio::test]
async fn illegal_transitions_are_refused_locally() {
    let fx = StoreFixture::new().await;
    let alice = fx.engine_for(fx.alice).await;
    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");
    alice.calls().end_call(call.call_id).await.expect("end");

    let err = alice
        .calls()
        .answer_call(call.call_id)
        .await
        .expect_err("ended");
    assert_eq!(
        err,
        EngineError::IllegalTransition {
            from: CallStatus::Ended,
            to: CallStatus::Answered,
        }
    );
    let stored = fx.storage.call(call.call_id).await.expect("load").expect("row");
    assert_eq!(stored.status, CallStatus::Ended);
    assert!(stored.started_at.is_none());

    let err = alice
        .calls()
        .mark_missed(call.call_id)
        .await
        .expect_err("ended");
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
}

#[tokio::test]
async fn server_conflict_is_reported_against_local_status() {
    let fx = StoreFixture::new().await;
    let alice = fx.engine_for(fx.alice).await;
    let bob = fx.engine_for(fx.bob).await;
    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");
    bob.calls().refresh_calls().await;

    // Declined elsewhere; bob's copy is still ringing.
    fx.storage
        .update_call_status(
            call.call_id,
            CallStatus::Calling,
            &CallStatusUpdate {
                status: CallStatus::Declined,
                started_at: None,
                ended_at: Some(Utc::now()),
                duration_seconds: None,
            },
        )
        .await
        .expect("update");

    let err = bob
        .calls()
        .answer_call(call.call_id)
        .await
        .expect_err("conflict");
    assert_eq!(
        err,
        EngineError::IllegalTransition {
            from: CallStatus::Calling,
            to: CallStatus::Answered,
        }
    );
    assert_eq!(
        bob.calls().call(call.call_id).await.expect("call").status,
        CallStatus::Calling
    );
}

#[tokio::test]
async fn group_call_members_answer_and_join() {
    let fx = StoreFixture::new().await;
    let alice = fx.engine_for(fx.alice).await;
    let bob = fx.engine_for(fx.bob).await;
    let carol = fx.engine_for(fx.carol).await;
    let group = alice
        .groups()
        .create_group("Standup", None, vec![fx.bob, fx.carol])
        .await
        .expect("group");

    let call = alice
        .calls()
        .start_call(None, Some(group.group_id), CallKind::Voice)
        .await
        .expect("start");
    assert!(call.is_group_call());
    assert_eq!(call.participants.len(), 2);
    assert!(call
        .participants
        .iter()
        .all(|p| p.status == ParticipantStatus::Invited));

    bob.calls().refresh_calls().await;
    carol.calls().refresh_calls().await;
    assert_eq!(carol.calls().incoming_calls().await.len(), 1);

    let answered = bob.calls().answer_call(call.call_id).await.expect("answer");
    assert_eq!(answered.status, CallStatus::Answered);

    // Carol's copy moves to answered and she is still invited, so she joins.
    carol.calls().refresh_calls().await;
    assert!(carol.calls().incoming_calls().await.is_empty());
    let joined = carol.calls().answer_call(call.call_id).await.expect("join");
    assert_eq!(joined.status, CallStatus::Answered);
    assert!(joined
        .participants
        .iter()
        .all(|p| p.status == ParticipantStatus::Joined));

    // Joining twice is not a transition any more.
    let err = carol
        .calls()
        .answer_call(call.call_id)
        .await
        .expect_err("already joined");
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
}

#[tokio::test]
async fn group_call_is_declined_once_every_member_declines() {
    let fx = StoreFixture::new().await;
    let alice = fx.engine_for(fx.alice).await;
    let bob = fx.engine_for(fx.bob).await;
    let carol = fx.engine_for(fx.carol).await;
    let group = alice
        .groups()
        .create_group("Standup", None, vec![fx.bob, fx.carol])
        .await
        .expect("group");
    let call = alice
        .calls()
        .start_call(None, Some(group.group_id), CallKind::Video)
        .await
        .expect("start");

    bob.calls().refresh_calls().await;
    carol.calls().refresh_calls().await;

    let after_bob = bob.calls().decline_call(call.call_id).await.expect("decline");
    assert_eq!(after_bob.status, CallStatus::Calling);
    assert!(bob.calls().incoming_calls().await.is_empty());
    assert_eq!(carol.calls().incoming_calls().await.len(), 1);

    let after_carol = carol.calls().decline_call(call.call_id).await.expect("decline");
    assert_eq!(after_carol.status, CallStatus::Declined);

    alice.calls().refresh_calls().await;
    assert_eq!(
        alice.calls().call(call.call_id).await.expect("call").status,
        CallStatus::Declined
    );
}

#[tokio::test]
async fn call_targets_are_validated_before_sending() {
    let remote = ScriptedTransport::down("direct");
    let engine = scripted_engine(
        UserId(1),
        ScriptedTransport::down("rpc"),
        remote.clone(),
    )
    .await;

    for (receiver, group) in [
        (None, None),
        (Some(UserId(2)), Some(GroupId(3))),
        (Some(UserId(1)), None),
    ] {
        let err = engine
            .calls()
            .start_call(receiver, group, CallKind::Voice)
            .await
            .expect_err("invalid target");
        assert!(matches!(err, EngineError::Validation(_)), "{err:?}");
    }
    assert!(remote.requests().is_empty());

    let err = engine
        .calls()
        .answer_call(CallId(99))
        .await
        .expect_err("unknown call");
    assert!(matches!(err, EngineError::NotLoaded(_)));
}

#[tokio::test]
async fn non_members_cannot_start_group_calls() {
    let fx = StoreFixture::new().await;
    let alice = fx.engine_for(fx.alice).await;
    let carol = fx.engine_for(fx.carol).await;
    let group = alice
        .groups()
        .create_group("Private", None, vec![fx.bob])
        .await
        .expect("group");

    let err = carol
        .calls()
        .start_call(None, Some(group.group_id), CallKind::Voice)
        .await
        .expect_err("not a member");
    assert!(matches!(err, EngineError::AccessDenied(_)));
}

#[tokio::test]
async fn media_failures_do_not_fail_the_call() {
    let fx = StoreFixture::new().await;
    let media = Arc::new(RecordingMedia {
        broken: true,
        ..RecordingMedia::default()
    });
    let alice = engine_with_media(&fx, fx.alice, media.clone()).await;

    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");
    assert_eq!(media.steps(), vec![("initiate", call.call_id)]);
    assert!(alice.calls().call(call.call_id).await.is_some());
}

#[tokio::test]
async fn unanswered_outgoing_calls_become_missed() {
    let fx = StoreFixture::new().await;
    let config = EngineConfig {
        ring_timeout: Duration::ZERO,
        ..test_config()
    };
    let alice = fx.engine_with(fx.alice, config).await;
    let bob = fx.engine_for(fx.bob).await;

    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");
    let calls = alice.calls().refresh_calls().await;
    let missed = calls
        .iter()
        .find(|c| c.call_id == call.call_id)
        .expect("call");
    assert_eq!(missed.status, CallStatus::Missed);

    // The receiver never expires calls it did not place.
    bob.calls().refresh_calls().await;
    assert_eq!(
        bob.calls().call(call.call_id).await.expect("call").status,
        CallStatus::Missed
    );
}

#[tokio::test]
async fn poller_announces_incoming_calls_once() {
    let fx = StoreFixture::new().await;
    let alice = fx.engine_for(fx.alice).await;
    let config = EngineConfig {
        call_poll_interval: Duration::from_millis(50),
        ..test_config()
    };
    let bob = fx.engine_with(fx.bob, config).await;
    let mut events = bob.subscribe_events();

    bob.calls().spawn_poller();
    assert!(bob.calls().is_polling());

    let call = alice
        .calls()
        .start_call(Some(fx.bob), None, CallKind::Voice)
        .await
        .expect("start");
    let announced = next_event(&mut events, |event| match event {
        ClientEvent::IncomingCall(call) => Some(call.call_id),
        _ => None,
    })
    .await;
    assert_eq!(announced, call.call_id);

    // A few more polls must not announce it again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut repeats = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ClientEvent::IncomingCall(_)) {
            repeats += 1;
        }
    }
    assert_eq!(repeats, 0);

    bob.calls().stop_polling();
    assert!(!bob.calls().is_polling());
}
