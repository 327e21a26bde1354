//! WebRTC transport
//!
//! One `RTCPeerConnection` per negotiation round with a single send-only
//! Opus track. PCM handed over by the engine goes through a bounded queue to
//! a per-peer task that encodes and writes samples, so the mixing thread
//! never waits on the network.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::audio::engine::{AudioFrame, Feed};
use crate::codec::OpusEncoder;
use crate::config::{AudioConfig, RtcConfig};
use crate::error::TransportError;
use crate::transport::{Connectivity, IceCandidate, LocalCandidateFn, PeerFactory, PeerTransport};

/// Frames queued per peer before new ones are dropped
const SEND_QUEUE_FRAMES: usize = 50;

/// Builds WebRTC peers
pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
    sample_rate: u32,
    frame_samples: usize,
    frame_duration: Duration,
    bitrate: u32,
}

impl RtcPeerFactory {
    pub fn new(audio: &AudioConfig, rtc: &RtcConfig) -> Self {
        Self {
            ice_servers: rtc.ice_servers.clone(),
            sample_rate: audio.sample_rate,
            frame_samples: audio.frame_samples(),
            frame_duration: audio.frame_duration(),
            bitrate: rtc.opus_bitrate,
        }
    }

    async fn peer_connection(&self) -> Result<RTCPeerConnection, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Create(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Create(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if self.ice_servers.is_empty() {
                vec![]
            } else {
                vec![RTCIceServer {
                    urls: self.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map_err(|e| TransportError::Create(e.to_string()))
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        feed: Feed,
        on_candidate: LocalCandidateFn,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let encoder = OpusEncoder::new(self.sample_rate, self.frame_samples, self.bitrate)
            .map_err(|e| TransportError::Create(e.to_string()))?;
        let pc = Arc::new(self.peer_connection().await?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                clock_rate: self.sample_rate,
                channels: 1,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            format!("mixcast-{}", feed.as_str()),
        ));
        let rtp_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Create(format!("Failed to add track: {}", e)))?;

        // RTCP has to be drained for the interceptors to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let state = Arc::new(AtomicU8::new(Connectivity::New.to_u8()));
        let state_for_cb = state.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::debug!("Peer connection state: {}", s);
            state_for_cb.store(map_state(s).to_u8(), Ordering::Release);
            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let on_candidate = on_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => on_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => tracing::warn!("Cannot serialize local candidate: {}", e),
                }
            })
        }));

        let (frames_tx, frames_rx) = mpsc::channel::<Vec<i16>>(SEND_QUEUE_FRAMES);
        tokio::spawn(pump_media(encoder, track, frames_rx, self.frame_duration));

        Ok(Arc::new(RtcPeer {
            pc,
            state,
            pending: tokio::sync::Mutex::new(PendingCandidates::default()),
            frames_tx: Mutex::new(Some(frames_tx)),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Default)]
struct PendingCandidates {
    remote_set: bool,
    queued: Vec<RTCIceCandidateInit>,
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    state: Arc<AtomicU8>,
    pending: tokio::sync::Mutex<PendingCandidates>,
    frames_tx: Mutex<Option<mpsc::Sender<Vec<i16>>>>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())
            .map_err(|e| TransportError::RemoteDescription(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::RemoteDescription(e.to_string()))?;

        {
            let mut pending = self.pending.lock().await;
            pending.remote_set = true;
            for init in pending.queued.drain(..) {
                if let Err(e) = self.pc.add_ice_candidate(init).await {
                    tracing::warn!("Buffered candidate rejected: {}", e);
                }
            }
        }

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Answer(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::Answer(e.to_string()))?;

        Ok(self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or(answer.sdp))
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        let mut pending = self.pending.lock().await;
        if !pending.remote_set {
            pending.queued.push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    fn connectivity(&self) -> Connectivity {
        Connectivity::from_u8(self.state.load(Ordering::Acquire))
    }

    fn deliver(&self, frame: &AudioFrame) {
        if self.connectivity() != Connectivity::Connected {
            return;
        }
        if let Some(tx) = self.frames_tx.lock().as_ref() {
            // Full queue means the network is behind; dropping is the recovery
            let _ = tx.try_send(frame.samples.clone());
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.frames_tx.lock().take();
        self.state.store(Connectivity::Closed.to_u8(), Ordering::Release);

        let pc = self.pc.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        tracing::debug!("Peer connection close: {}", e);
                    }
                });
            }
            Err(_) => tracing::warn!("No runtime to close peer connection on"),
        }
    }
}

async fn pump_media(
    mut encoder: OpusEncoder,
    track: Arc<TrackLocalStaticSample>,
    mut frames: mpsc::Receiver<Vec<i16>>,
    duration: Duration,
) {
    while let Some(pcm) = frames.recv().await {
        let data = match encoder.encode(&pcm) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Opus encode failed: {}", e);
                continue;
            }
        };
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::debug!("Failed to write sample: {}", e);
        }
    }
    let stats = encoder.stats();
    tracing::debug!(
        "Media pump done: {} frames, {:.1} bytes avg",
        stats.frames_encoded,
        stats.average_frame_size
    );
}

fn map_state(state: RTCPeerConnectionState) -> Connectivity {
    match state {
        RTCPeerConnectionState::Connecting => Connectivity::Checking,
        RTCPeerConnectionState::Connected => Connectivity::Connected,
        RTCPeerConnectionState::Disconnected => Connectivity::Disconnected,
        RTCPeerConnectionState::Failed => Connectivity::Failed,
        RTCPeerConnectionState::Closed => Connectivity::Closed,
        _ => Connectivity::New,
    }
}
