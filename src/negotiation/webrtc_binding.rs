//! `PeerTransportBinding` backed by webrtc-rs
//!
//! One audio and one video `TrackLocalStaticSample` are added when the
//! connection is created. Local `MediaTrack`s are bound to them by a
//! forwarding task that copies encoded samples, so replacing a track only
//! swaps the forwarder and never touches SDP.
//!
//! Remote RTP is reassembled into samples by a `SampleBuilder` and published
//! on the remote track; with a codec factory configured the samples are also
//! decoded into frames.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::binding::{
    BindingEvent, LinkState, PeerBindingFactory, PeerTransportBinding, SdpType,
    SessionDescription,
};
use crate::config::WebRtcConfig;
use crate::error::NegotiationError;
use crate::media::codec::{self, CodecFactory, FrameFormat, SampleDecoder};
use crate::media::{EncodedSample, MediaTrack, TrackKind};
use crate::signaling::IceCandidate;

const STREAM_ID: &str = "interview-rtc";

/// Packets the sample builder waits for a gap to fill before dropping it
const MAX_LATE_PACKETS: u16 = 64;

fn binding_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Binding(e.to_string())
}

fn description_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Description(e.to_string())
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

/// Creates webrtc-rs peer connections with the configured ICE servers
pub struct WebRtcBindingFactory {
    config: WebRtcConfig,
    codecs: Option<(Arc<dyn CodecFactory>, FrameFormat)>,
}

impl WebRtcBindingFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            config,
            codecs: None,
        }
    }

    /// Decode remote samples into frames of `format`
    pub fn with_codecs(mut self, codecs: Arc<dyn CodecFactory>, format: FrameFormat) -> Self {
        self.codecs = Some((codecs, format));
        self
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();

        if !self.config.stun_servers.is_empty() {
            servers.push(RTCIceServer {
                urls: self.config.stun_servers.clone(),
                ..Default::default()
            });
        }

        for turn in &self.config.turn_servers {
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        servers
    }
}

#[async_trait]
impl PeerBindingFactory for WebRtcBindingFactory {
    async fn create(
        &self,
    ) -> Result<
        (
            Arc<dyn PeerTransportBinding>,
            mpsc::UnboundedReceiver<BindingEvent>,
        ),
        NegotiationError,
    > {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(binding_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(binding_err)?;

        let mut settings = SettingEngine::default();
        if self.config.include_loopback {
            settings.set_include_loopback_candidate(true);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers(),
                ..Default::default()
            })
            .await
            .map_err(binding_err)?,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        register_callbacks(&pc, tx, self.codecs.clone());

        let mut outbound = HashMap::new();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(kind),
                kind.to_string(),
                STREAM_ID.to_string(),
            ));

            let sender = pc
                .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(binding_err)?;

            // RTCP has to be read for interceptors to work
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });

            outbound.insert(
                kind,
                Outbound {
                    local,
                    forwarder: Mutex::new(None),
                },
            );
        }

        info!("WebRTC peer connection created");

        let binding: Arc<dyn PeerTransportBinding> = Arc::new(WebRtcBinding { pc, outbound });
        Ok((binding, rx))
    }

    fn name(&self) -> &str {
        "webrtc"
    }
}

fn register_callbacks(
    pc: &Arc<RTCPeerConnection>,
    tx: mpsc::UnboundedSender<BindingEvent>,
    codecs: Option<(Arc<dyn CodecFactory>, FrameFormat)>,
) {
    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let link = match s {
            RTCPeerConnectionState::New => Some(LinkState::New),
            RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            _ => None,
        };
        if let Some(link) = link {
            let _ = state_tx.send(BindingEvent::StateChanged(link));
        }
        Box::pin(async {})
    }));

    let candidate_tx = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = candidate_tx.send(BindingEvent::CandidateDiscovered(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        } else {
            debug!("ICE gathering complete");
        }
        Box::pin(async {})
    }));

    let track_tx = tx;
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };

        let media = kind.map(|kind| Arc::new(MediaTrack::remote(kind, track.id())));
        if let Some(media) = &media {
            let _ = track_tx.send(BindingEvent::RemoteTrack(media.clone()));
        }

        let decoder = kind.zip(codecs.as_ref()).and_then(|(kind, (codecs, format))| {
            codecs
                .decoder(kind, format)
                .map_err(|e| warn!("Remote {} stays encoded-only: {}", kind, e))
                .ok()
        });

        Box::pin(async move {
            let (Some(kind), Some(media)) = (kind, media) else {
                return;
            };
            match kind {
                TrackKind::Audio => {
                    let builder = SampleBuilder::new(MAX_LATE_PACKETS, OpusPacket, 48_000);
                    receive_remote(track, media, builder, decoder).await
                }
                TrackKind::Video => {
                    let builder =
                        SampleBuilder::new(MAX_LATE_PACKETS, Vp8Packet::default(), 90_000);
                    receive_remote(track, media, builder, decoder).await
                }
            }
            debug!("Remote {} track ended", kind);
        })
    }));
}

/// Reassemble RTP into samples, publish them and decode them into frames
async fn receive_remote<T: Depacketizer + Send>(
    track: Arc<TrackRemote>,
    media: Arc<MediaTrack>,
    mut builder: SampleBuilder<T>,
    mut decoder: Option<Box<dyn SampleDecoder>>,
) {
    while let Ok((packet, _)) = track.read_rtp().await {
        if media.is_stopped() {
            break;
        }
        builder.push(packet);

        while let Some(sample) = builder.pop() {
            let sample = EncodedSample {
                data: sample.data,
                duration: sample.duration,
            };
            media.push_encoded(sample.clone());

            let Some(current) = decoder.take() else {
                continue;
            };
            let Some((current, result)) = codec::decode_blocking(current, sample).await else {
                break;
            };
            match result {
                Ok(frames) => {
                    for frame in frames {
                        codec::deliver(&media, frame);
                    }
                    decoder = Some(current);
                }
                Err(e) => warn!("Decoding remote {} stopped: {}", media.kind(), e),
            }
        }
    }
}

struct Outbound {
    local: Arc<TrackLocalStaticSample>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Outbound {
    fn bind(&self, track: Option<Arc<MediaTrack>>) {
        let next = track.map(|track| {
            let local = self.local.clone();
            let mut samples = track.subscribe_encoded();
            tokio::spawn(async move {
                loop {
                    match samples.recv().await {
                        Ok(sample) => {
                            // Disabled tracks stay bound but send nothing
                            if !track.is_enabled() {
                                continue;
                            }
                            let sample = Sample {
                                data: sample.data,
                                duration: sample.duration,
                                ..Default::default()
                            };
                            if let Err(e) = local.write_sample(&sample).await {
                                debug!("Dropping outbound sample: {}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Outbound forwarder skipped {} samples", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });

        if let Some(previous) = std::mem::replace(&mut *self.forwarder.lock(), next) {
            previous.abort();
        }
    }
}

struct WebRtcBinding {
    pc: Arc<RTCPeerConnection>,
    outbound: HashMap<TrackKind, Outbound>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let rtc = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    rtc.map_err(description_err)
}

#[async_trait]
impl PeerTransportBinding for WebRtcBinding {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(description_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(description_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(description_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(description_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(binding_err)
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), NegotiationError> {
        let kind = track.kind();
        self.replace_track(kind, Some(track)).await
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        let outbound = self
            .outbound
            .get(&kind)
            .ok_or_else(|| NegotiationError::Binding(format!("no {} sender", kind)))?;
        outbound.bind(track);
        Ok(())
    }

    async fn close(&self) {
        for outbound in self.outbound.values() {
            outbound.bind(None);
        }
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
    }
}
