// Two webrtc-rs peers in one process
//
// Offer, answer and candidates are carried by hand between two Negotiators
// over loopback. Local frames go through the passthrough codec, across RTP,
// and are decoded onto the remote track on the other side.

mod common;

use anyhow::{Context, Result};
use common::{wait_until, RawCodecs};
use interview_rtc::config::WebRtcConfig;
use interview_rtc::media::codec::spawn_encoding;
use interview_rtc::media::{
    AudioFrame, CodecFactory, FrameFormat, MediaStream, MediaTrack, StreamOrigin, TrackKind,
    VideoFrame,
};
use interview_rtc::negotiation::{
    NegotiationEvent, NegotiationState, Negotiator, PeerConnection, WebRtcBindingFactory,
};
use interview_rtc::signaling::Role;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RED: [u8; 4] = [255, 0, 0, 255];
const TONE: i16 = 1_234;

fn format() -> FrameFormat {
    FrameFormat {
        width: 4,
        height: 4,
        fps: 25,
        sample_rate: 48_000,
        channels: 1,
    }
}

fn loopback_negotiator() -> Negotiator {
    let factory = WebRtcBindingFactory::new(WebRtcConfig {
        include_loopback: true,
        ..WebRtcConfig::default()
    })
    .with_codecs(Arc::new(RawCodecs), format());
    Negotiator::new(Arc::new(factory))
}

fn encoded_stream() -> Result<MediaStream> {
    let stream = MediaStream::new(StreamOrigin::Local);
    for kind in [TrackKind::Audio, TrackKind::Video] {
        let track = Arc::new(MediaTrack::local(kind, None, kind.to_string()));
        spawn_encoding(&track, RawCodecs.encoder(kind, &format())?);
        stream.set_track(track);
    }
    Ok(stream)
}

/// Hand every local candidate of one side to the other
fn forward_candidates(
    mut candidates: mpsc::UnboundedReceiver<NegotiationEvent>,
    to: Arc<PeerConnection>,
) {
    tokio::spawn(async move {
        while let Some(event) = candidates.recv().await {
            if let NegotiationEvent::LocalCandidate { candidate, .. } = event {
                let _ = to.add_remote_candidate(candidate).await;
            }
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offer_answer_carries_media_between_peers() -> Result<()> {
    let alice = loopback_negotiator();
    let bob = loopback_negotiator();
    let (_a, alice_candidates) = alice.events().channel("local-candidate");
    let (_b, bob_candidates) = bob.events().channel("local-candidate");
    let (_t, mut bob_tracks) = bob.events().channel("remote-track");

    let alice_stream = encoded_stream()?;
    let alice_peer = alice.initialize(Role::Offerer, &alice_stream).await?;
    let bob_peer = bob.initialize(Role::Answerer, &encoded_stream()?).await?;

    // Remote candidates are queued by the peer until its remote description is set
    forward_candidates(alice_candidates, bob_peer.clone());
    forward_candidates(bob_candidates, alice_peer.clone());

    let offer = alice_peer.create_offer().await?;
    let answer = bob_peer.handle_remote_offer(offer).await?;
    alice_peer.handle_remote_answer(answer).await?;

    // Remote tracks only surface once RTP flows, so keep capturing
    let audio = alice_stream.audio_track().context("local audio")?;
    let video = alice_stream.video_track().context("local video")?;
    let capture = tokio::spawn(async move {
        let mut ts = 0;
        loop {
            video.push_video(VideoFrame::solid(4, 4, RED, ts));
            let mut frame = AudioFrame::silence(48_000, 1, 2, ts, StreamOrigin::Local);
            frame.samples.fill(TONE);
            audio.push_audio(frame);
            ts += 20;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    assert!(
        wait_until(Duration::from_secs(15), || alice_peer.is_connected()
            && bob_peer.is_connected())
        .await
    );
    assert_eq!(alice.state(), NegotiationState::Connected);
    assert_eq!(bob.state(), NegotiationState::Connected);

    let mut remote_audio = None;
    let mut remote_video = None;
    while remote_audio.is_none() || remote_video.is_none() {
        let event = tokio::time::timeout(Duration::from_secs(10), bob_tracks.recv())
            .await
            .context("remote track never arrived")?
            .context("dispatcher closed")?;
        if let NegotiationEvent::RemoteTrack { track, .. } = event {
            match track.kind() {
                TrackKind::Audio => remote_audio = Some(track),
                TrackKind::Video => remote_video = Some(track),
            }
        }
    }
    let remote_audio = remote_audio.context("remote audio")?;
    let remote_video = remote_video.context("remote video")?;
    assert_eq!(remote_video.origin(), StreamOrigin::Remote);

    let decoded_red = wait_until(Duration::from_secs(10), || {
        remote_video
            .latest_video()
            .and_then(|frame| frame.pixel(1, 1))
            == Some(RED)
    })
    .await;
    assert!(decoded_red, "no decoded video frame reached the answerer");

    let mut frames = remote_audio.subscribe_audio();
    let heard = tokio::time::timeout(Duration::from_secs(10), frames.recv())
        .await
        .context("no decoded audio reached the answerer")??;
    assert_eq!(heard.samples.len(), 96);
    assert!(heard.samples.iter().all(|&s| s == TONE));
    assert_eq!(heard.origin, StreamOrigin::Remote);

    capture.abort();
    alice.close().await;
    bob.close().await;
    assert_eq!(alice.state(), NegotiationState::Idle);

    Ok(())
}
