// End-to-end tests for CallSession
//
// Two sessions meet on the in-process relay. Their peer bindings are scripted
// to report Connected once offer and answer have been exchanged, so the
// whole signaling and negotiation path runs without a network.

mod common;

use anyhow::Result;
use common::{test_config, wait_until, FakeBinding, FakeBindingFactory, MemorySink};
use interview_rtc::error::CallError;
use interview_rtc::media::{MediaState, TrackKind};
use interview_rtc::negotiation::{BindingEvent, LinkState, NegotiationState};
use interview_rtc::recording::RecordingState;
use interview_rtc::signaling::{ConnectionStatus, MemoryRelay, Role, SendOutcome};
use interview_rtc::{
    ArtifactSink, CallDeps, CallEvent, CallSession, FileArtifactSink, SyntheticSource,
    WavEncoderFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(5);

struct Participant {
    call: CallSession,
    bindings: Arc<FakeBindingFactory>,
}

fn participant(relay: &MemoryRelay, name: &str, sink: Arc<dyn ArtifactSink>) -> Participant {
    participant_with(relay, FakeBindingFactory::auto(name), sink)
}

fn participant_with(
    relay: &MemoryRelay,
    bindings: FakeBindingFactory,
    sink: Arc<dyn ArtifactSink>,
) -> Participant {
    let mut config = test_config();
    // Relay outages in these tests should heal quickly
    config.signaling.initial_backoff_ms = 20;
    config.signaling.max_backoff_ms = 100;
    let bindings = Arc::new(bindings);
    let call = CallSession::new(
        config.clone(),
        CallDeps {
            connector: Arc::new(relay.clone()),
            bindings: bindings.clone(),
            media: Arc::new(SyntheticSource::new(config.devices.clone())),
            encoder: Arc::new(WavEncoderFactory),
            sink,
        },
    );
    Participant { call, bindings }
}

fn connected(call: &CallSession) -> bool {
    call.negotiator().state() == NegotiationState::Connected
}

/// Alice (offerer) and Bob (answerer) in room-1, connected to each other
async fn connected_pair(
    relay: &MemoryRelay,
    sink: Arc<dyn ArtifactSink>,
) -> Result<(Participant, Participant)> {
    let alice = participant(relay, "alice", sink.clone());
    let bob = participant(relay, "bob", sink);

    alice.call.connect("alice").await?;
    bob.call.connect("bob").await?;

    let room = alice.call.join("room-1", "iv-1").await?;
    assert_eq!(room.role, Role::Offerer);
    let room = bob.call.join("room-1", "iv-1").await?;
    assert_eq!(room.role, Role::Answerer);

    assert!(wait_until(LIMIT, || connected(&alice.call) && connected(&bob.call)).await);
    Ok((alice, bob))
}

#[tokio::test]
async fn test_two_participants_connect() -> Result<()> {
    let relay = MemoryRelay::new();
    let sink: Arc<dyn ArtifactSink> = Arc::new(MemorySink::default());

    let alice = participant(&relay, "alice", sink.clone());
    let bob = participant(&relay, "bob", sink);
    let (_sub, mut streams) = bob.call.events().channel("remote-stream-available");

    alice.call.connect("alice").await?;
    bob.call.connect("bob").await?;
    alice.call.join("room-1", "iv-1").await?;
    bob.call.join("room-1", "iv-1").await?;

    assert!(wait_until(LIMIT, || connected(&alice.call) && connected(&bob.call)).await);

    match timeout(LIMIT, streams.recv()).await? {
        Some(CallEvent::RemoteStreamAvailable(stream)) => {
            assert!(stream.audio_track().is_some())
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // One offer, one answer, and each side applied the other's candidate
    let alice_binding = alice.bindings.last().expect("alice binding");
    let bob_binding = bob.bindings.last().expect("bob binding");
    assert_eq!(alice_binding.log.lock().offers_created, 1);
    assert_eq!(
        bob_binding.log.lock().remote.as_ref().map(|d| d.sdp.clone()),
        Some("v=0 offer alice #1".to_string())
    );
    assert_eq!(
        alice_binding.log.lock().remote.as_ref().map(|d| d.sdp.clone()),
        Some("v=0 answer bob".to_string())
    );
    assert!(
        wait_until(LIMIT, || {
            alice_binding.log.lock().candidates.len() == 1
                && bob_binding.log.lock().candidates.len() == 1
        })
        .await
    );

    let status = alice.call.status();
    assert_eq!(status.negotiation, NegotiationState::Connected);
    assert_eq!(status.room.map(|r| r.room_id), Some("room-1".to_string()));

    Ok(())
}

#[tokio::test]
async fn test_chat_and_media_state_reach_the_peer() -> Result<()> {
    let relay = MemoryRelay::new();
    let (alice, bob) = connected_pair(&relay, Arc::new(MemorySink::default())).await?;

    let (_c, mut chats) = bob.call.events().channel("chat-message");
    let (_m, mut media) = bob.call.events().channel("remote-media-state");

    let outcome = alice.call.send_chat("Tell me about yourself").await?;
    assert!(matches!(outcome, SendOutcome::Acknowledged(_)));

    match timeout(LIMIT, chats.recv()).await? {
        Some(CallEvent::ChatMessage { sender, text }) => {
            assert_eq!(sender, "alice");
            assert_eq!(text, "Tell me about yourself");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert!(alice.call.toggle(TrackKind::Video, false).await);
    match timeout(LIMIT, media.recv()).await? {
        Some(CallEvent::RemoteMediaState { sender, state }) => {
            assert_eq!(sender, "alice");
            assert_eq!(
                state,
                MediaState {
                    audio_enabled: true,
                    video_enabled: false
                }
            );
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Soft toggles never renegotiate
    assert_eq!(alice.bindings.created(), 1);
    assert_eq!(alice.bindings.last().expect("binding").log.lock().offers_created, 1);

    Ok(())
}

#[tokio::test]
async fn test_requires_an_active_call() -> Result<()> {
    let relay = MemoryRelay::new();
    let alice = participant(&relay, "alice", Arc::new(MemorySink::default()));
    alice.call.connect("alice").await?;

    assert!(matches!(
        alice.call.send_chat("hello?").await,
        Err(CallError::NotJoined)
    ));
    assert!(matches!(
        alice.call.start_recording().await,
        Err(CallError::NotJoined)
    ));
    assert!(matches!(
        alice.call.stop_recording().await,
        Err(CallError::Recording(_))
    ));

    // Leaving without a call is harmless
    alice.call.leave().await;
    Ok(())
}

#[tokio::test]
async fn test_leave_is_idempotent_and_peer_starts_over() -> Result<()> {
    let relay = MemoryRelay::new();
    let (alice, bob) = connected_pair(&relay, Arc::new(MemorySink::default())).await?;

    alice.call.leave().await;
    alice.call.leave().await;

    let status = alice.call.status();
    assert!(status.room.is_none());
    assert_eq!(status.negotiation, NegotiationState::Idle);
    assert!(alice.bindings.last().expect("binding").log.lock().closed);
    assert_eq!(relay.members("room-1"), vec!["bob".to_string()]);

    // Bob's connection is replaced with a fresh one waiting for an offer
    assert!(
        wait_until(LIMIT, || {
            bob.bindings.created() == 2
                && bob.call.negotiator().state() == NegotiationState::Initializing
        })
        .await
    );
    assert!(bob.bindings.bindings.lock()[0].log.lock().closed);

    // Local devices stay with the participant until disconnect
    assert!(alice.call.devices().local_stream().audio_track().is_some());
    alice.call.disconnect().await;
    assert!(alice
        .call
        .devices()
        .local_stream()
        .tracks()
        .iter()
        .all(|t| t.is_stopped()));

    Ok(())
}

#[tokio::test]
async fn test_room_end_closes_the_call() -> Result<()> {
    let relay = MemoryRelay::new();
    let (alice, _bob) = connected_pair(&relay, Arc::new(MemorySink::default())).await?;
    let (_sub, mut ended) = alice.call.events().channel("call-ended");

    relay.end_room("room-1");

    match timeout(LIMIT, ended.recv()).await? {
        Some(CallEvent::CallEnded { room_id, reason }) => {
            assert_eq!(room_id, "room-1");
            assert_eq!(reason, "room ended");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(alice.call.negotiator().state(), NegotiationState::Idle);
    assert!(matches!(
        alice.call.send_chat("still there?").await,
        Err(CallError::NotJoined)
    ));

    Ok(())
}

#[tokio::test]
async fn test_recording_is_saved_to_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relay = MemoryRelay::new();
    let sink: Arc<dyn ArtifactSink> = Arc::new(FileArtifactSink::new(dir.path()));
    let (alice, _bob) = connected_pair(&relay, sink).await?;
    let (_sub, mut states) = alice.call.events().channel("recording-state");

    let info = alice.call.start_recording().await?;
    assert!(info.has_local);
    assert!(info.has_remote);
    assert_eq!(alice.call.status().recording, RecordingState::Recording);

    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.call.pause_recording().await?;
    alice.call.resume_recording().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let saved = alice.call.stop_recording().await?;
    assert_eq!(saved.artifact.recording_id, info.recording_id);
    assert_eq!(saved.artifact.interview_id.as_deref(), Some("iv-1"));
    assert!(saved.artifact.duration_ms >= 300);
    assert!(saved.artifact.video_frames > 0);

    let location = saved.location.expect("stored by the file sink");
    assert!(location.ends_with(".wav"));
    let written = std::fs::read(&location)?;
    assert_eq!(written.len() as u64, saved.artifact.size_bytes);
    let reader = hound::WavReader::new(std::io::Cursor::new(written))?;
    assert_eq!(reader.spec().sample_rate, 48_000);

    let mut seen = Vec::new();
    while let Ok(CallEvent::RecordingState(state)) = states.try_recv() {
        seen.push(state);
    }
    assert_eq!(seen.first(), Some(&RecordingState::Recording));
    assert_eq!(seen.last(), Some(&RecordingState::Inactive));

    Ok(())
}

#[tokio::test]
async fn test_leaving_finishes_an_active_recording() -> Result<()> {
    let relay = MemoryRelay::new();
    let sink = Arc::new(MemorySink::default());
    let (alice, _bob) = connected_pair(&relay, sink.clone()).await?;

    alice.call.start_recording().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.call.leave().await;

    assert_eq!(alice.call.recorder().state(), RecordingState::Inactive);
    let stored = sink.stored.lock();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].interview_id.as_deref(), Some("iv-1"));

    Ok(())
}

fn remote_sdp(binding: &FakeBinding) -> Option<String> {
    binding.log.lock().remote.as_ref().map(|d| d.sdp.clone())
}

fn local_sdp(binding: &FakeBinding) -> Option<String> {
    binding.log.lock().local.as_ref().map(|d| d.sdp.clone())
}

#[tokio::test]
async fn test_answerer_outage_recovers_through_ready() -> Result<()> {
    let relay = MemoryRelay::new();
    let sink = Arc::new(MemorySink::default());
    let (alice, bob) = connected_pair(&relay, sink.clone()).await?;
    alice.call.start_recording().await?;

    // Only Bob loses the relay, and the media path dies with it
    assert_eq!(relay.drop_links_of("bob"), 1);
    let alice_first = alice.bindings.last().expect("alice binding");
    let bob_first = bob.bindings.last().expect("bob binding");
    alice_first.emit(BindingEvent::StateChanged(LinkState::Failed));
    bob_first.emit(BindingEvent::StateChanged(LinkState::Failed));

    // Alice's restart offer goes nowhere; Bob asks again once he is back
    assert!(
        wait_until(LIMIT, || {
            alice.bindings.created() >= 2
                && bob.bindings.created() >= 2
                && connected(&alice.call)
                && connected(&bob.call)
        })
        .await
    );
    assert_eq!(bob.call.transport().status(), ConnectionStatus::Connected);

    let alice_now = alice.bindings.last().expect("alice binding");
    let bob_now = bob.bindings.last().expect("bob binding");
    assert!(alice_first.log.lock().closed);
    assert!(bob_first.log.lock().closed);
    assert_eq!(remote_sdp(&bob_now), local_sdp(&alice_now));
    assert!(remote_sdp(&bob_now).map_or(false, |sdp| sdp.starts_with("v=0 offer alice")));
    assert_ne!(remote_sdp(&bob_now), Some("v=0 offer alice #1".to_string()));

    // The restart finished the recording that was running
    assert_eq!(alice.call.recorder().state(), RecordingState::Inactive);
    assert_eq!(sink.stored.lock().len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_relay_outage_mid_handshake_starts_over() -> Result<()> {
    let relay = MemoryRelay::new();
    let sink = Arc::new(MemorySink::default());
    let alice = participant_with(&relay, FakeBindingFactory::manual_named("alice"), sink.clone());
    let bob = participant_with(&relay, FakeBindingFactory::manual_named("bob"), sink.clone());

    alice.call.connect("alice").await?;
    bob.call.connect("bob").await?;
    alice.call.join("room-1", "iv-1").await?;
    bob.call.join("room-1", "iv-1").await?;

    // Offer and answer are through, the transport never connects
    let alice_first = alice.bindings.last().expect("alice binding");
    assert!(wait_until(LIMIT, || remote_sdp(&alice_first).is_some()).await);
    assert_eq!(alice.call.negotiator().state(), NegotiationState::AnswerReceived);

    alice.call.start_recording().await?;
    assert_eq!(alice.call.recorder().state(), RecordingState::Recording);

    relay.drop_links();

    // Both sides replace their PeerConnection and Alice offers again
    assert!(
        wait_until(LIMIT, || {
            let (Some(a), Some(b)) = (alice.bindings.last(), bob.bindings.last()) else {
                return false;
            };
            alice.bindings.created() == 2
                && bob.bindings.created() == 2
                && remote_sdp(&b).is_some()
                && remote_sdp(&b) == local_sdp(&a)
                && remote_sdp(&a) == Some("v=0 answer bob".to_string())
        })
        .await
    );
    assert!(alice_first.log.lock().closed);
    assert!(bob.bindings.bindings.lock()[0].log.lock().closed);

    let alice_now = alice.bindings.last().expect("alice binding");
    let bob_now = bob.bindings.last().expect("bob binding");
    assert_eq!(local_sdp(&alice_now), Some("v=0 offer alice #2".to_string()));
    assert_eq!(alice_now.log.lock().offers_created, 1);

    assert_eq!(alice.call.recorder().state(), RecordingState::Inactive);
    assert_eq!(sink.stored.lock().len(), 1);

    alice_now.emit(BindingEvent::StateChanged(LinkState::Connected));
    bob_now.emit(BindingEvent::StateChanged(LinkState::Connected));
    assert!(wait_until(LIMIT, || connected(&alice.call) && connected(&bob.call)).await);

    Ok(())
}

#[tokio::test]
async fn test_failed_join_leaves_devices_alone() -> Result<()> {
    let relay = MemoryRelay::new();
    let sink: Arc<dyn ArtifactSink> = Arc::new(MemorySink::default());
    let (_alice, _bob) = connected_pair(&relay, sink.clone()).await?;

    // Not connected to the relay yet
    let carol = participant(&relay, "carol", sink);
    assert!(carol.call.join("room-1", "iv-1").await.is_err());
    assert!(carol.call.devices().local_stream().is_empty());

    // Connected, but the room is full
    carol.call.connect("carol").await?;
    assert!(matches!(
        carol.call.join("room-1", "iv-1").await,
        Err(CallError::Transport(_))
    ));
    assert!(carol.call.devices().local_stream().is_empty());
    assert!(carol.call.status().room.is_none());
    assert_eq!(carol.bindings.created(), 0);

    Ok(())
}
