//! Server-side mixing engine
//!
//! Owns the microphone and player buses. A dedicated thread pops one frame
//! from each bus every frame period, applies the gains derived from the
//! current [`MixParameters`], and hands the result to every attached
//! listener tap.
//!
//! ```text
//!   mic ring ────┐                         ┌─▶ Feed::Microphone taps (raw, silenced when muted)
//!                ├─▶ gains ─▶ route ───────┼─▶ Feed::Program taps (direct or mixed)
//!   player ring ─┘                         └─▶ Feed::Player taps (raw)
//! ```

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::mixer::{apply_gain, mix_into, resolve_route, Gains, Route, RouteSelector, SourceKind};
use crate::audio::params::{MixParameters, MixSnapshot};
use crate::audio::ring::{PcmConsumer, PcmProducer, PcmRingBuffer};
use crate::config::AudioConfig;
use crate::error::AudioError;
use crate::session::SessionId;

/// Ticks we are allowed to fall behind before the clock is re-anchored
const MAX_LATE_TICKS: u32 = 5;

/// Which engine output a listener receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    /// Raw microphone bus
    Microphone,
    /// Raw player bus
    Player,
    /// Server-routed output: one bus direct, or both mixed
    Program,
}

impl Feed {
    pub fn as_str(self) -> &'static str {
        match self {
            Feed::Microphone => "microphone",
            Feed::Player => "player",
            Feed::Program => "program",
        }
    }
}

/// One frame of mono PCM headed for the transport
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sequence: u32,
    /// Microseconds since the engine started
    pub timestamp_us: u64,
}

impl AudioFrame {
    fn silent(len: usize) -> Self {
        Self {
            samples: vec![0; len],
            sequence: 0,
            timestamp_us: 0,
        }
    }
}

/// Receiver of engine output. Called on the mixing thread, so it must not block.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, feed: Feed, frame: &AudioFrame);
}

struct Tap {
    feed: Feed,
    sink: Arc<dyn FrameSink>,
}

/// Producer slot of a bus. `attached` only changes under the slot lock, so a
/// detach can never clear the flag of a newer attach.
struct Bus {
    attached: AtomicBool,
    slot: Mutex<Option<PcmProducer>>,
}

impl Bus {
    fn new(producer: PcmProducer) -> Arc<Self> {
        Arc::new(Self {
            attached: AtomicBool::new(false),
            slot: Mutex::new(Some(producer)),
        })
    }
}

/// Producer handle for one bus. The bus counts as attached while this lives;
/// dropping it returns the producer so the source can attach again.
pub struct SourceFeed {
    kind: SourceKind,
    producer: Option<PcmProducer>,
    bus: Arc<Bus>,
}

impl SourceFeed {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Push PCM into the bus; never blocks
    pub fn push(&mut self, frame: &[i16], sample_count: usize) {
        if let Some(producer) = self.producer.as_mut() {
            producer.push(frame, sample_count);
        }
    }

    pub fn lag(&self) -> usize {
        self.producer.as_ref().map_or(0, |p| p.ring().lag())
    }
}

impl Drop for SourceFeed {
    fn drop(&mut self) {
        let mut slot = self.bus.slot.lock();
        *slot = self.producer.take();
        self.bus.attached.store(false, Ordering::Release);
        drop(slot);
        tracing::info!("{} source detached", self.kind.as_str());
    }
}

/// The two-bus mixing engine
pub struct AudioEngine {
    params: Arc<MixParameters>,
    frame_samples: usize,
    frame_duration: Duration,
    mic: Arc<Bus>,
    player: Arc<Bus>,
    consumers: Mutex<Option<(PcmConsumer, PcmConsumer)>>,
    selector: RouteSelector,
    taps: DashMap<SessionId, Tap>,
    sequence: AtomicU64,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioEngine {
    pub fn new(config: &AudioConfig, params: Arc<MixParameters>) -> Arc<Self> {
        let frame_samples = config.frame_samples();
        let (mic_tx, mic_rx) = PcmRingBuffer::new(config.ring_capacity, frame_samples).split();
        let (player_tx, player_rx) =
            PcmRingBuffer::new(config.ring_capacity, frame_samples).split();

        Arc::new(Self {
            params,
            frame_samples,
            frame_duration: Duration::from_millis(u64::from(config.frame_size_ms)),
            mic: Bus::new(mic_tx),
            player: Bus::new(player_tx),
            consumers: Mutex::new(Some((mic_rx, player_rx))),
            selector: RouteSelector::new(),
            taps: DashMap::new(),
            sequence: AtomicU64::new(0),
            stop_tx: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }

    /// Spawn the mixing thread. Failure here is fatal for the broadcast.
    pub fn start(self: &Arc<Self>) -> Result<(), AudioError> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Err(AudioError::AlreadyRunning);
        }
        let (mut mic_rx, mut player_rx) = self
            .consumers
            .lock()
            .take()
            .ok_or_else(|| AudioError::EngineInit("engine cannot be restarted".into()))?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let engine: Weak<AudioEngine> = Arc::downgrade(self);
        let frame_samples = self.frame_samples;
        let period = self.frame_duration;

        let handle = thread::Builder::new()
            .name("audio-mix".into())
            .spawn(move || {
                let mut mic_buf = vec![0i16; frame_samples];
                let mut player_buf = vec![0i16; frame_samples];
                let mut deadline = Instant::now();

                loop {
                    let Some(engine) = engine.upgrade() else { break };
                    mic_rx.pop_into(&mut mic_buf, frame_samples);
                    player_rx.pop_into(&mut player_buf, frame_samples);
                    engine.process_frame(&mic_buf, &player_buf);
                    drop(engine);

                    deadline += period;
                    let now = Instant::now();
                    if now > deadline + period * MAX_LATE_TICKS {
                        tracing::warn!("Mix thread fell behind, re-anchoring clock");
                        deadline = now;
                    }
                    match stop_rx.recv_timeout(deadline.saturating_duration_since(now)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Mix thread exiting");
            })
            .map_err(|e| AudioError::EngineInit(e.to_string()))?;

        *self.stop_tx.lock() = Some(stop_tx);
        *thread_slot = Some(handle);
        tracing::info!(
            "Audio engine started: {} samples/frame every {:?}",
            self.frame_samples,
            self.frame_duration
        );
        Ok(())
    }

    /// Stop the mixing thread and wait for it
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
            tracing::info!("Audio engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Hand out the producer for one bus. At most one feed per bus is live
    /// at a time; a dropped feed frees the bus for the next source.
    pub fn take_source(&self, kind: SourceKind) -> Result<SourceFeed, AudioError> {
        let bus = self.bus(kind);
        let mut slot = bus.slot.lock();
        let producer = slot.take().ok_or(AudioError::SourceTaken(kind.as_str()))?;
        bus.attached.store(true, Ordering::Release);
        drop(slot);
        tracing::info!("{} source attached", kind.as_str());
        Ok(SourceFeed {
            kind,
            producer: Some(producer),
            bus: bus.clone(),
        })
    }

    pub fn is_attached(&self, kind: SourceKind) -> bool {
        self.bus(kind).attached.load(Ordering::Acquire)
    }

    pub fn params(&self) -> &Arc<MixParameters> {
        &self.params
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn gains(&self) -> Gains {
        Gains::from_mix(self.params.snapshot())
    }

    /// Route implied by the current parameters and attachments
    pub fn resolve(&self) -> Route {
        self.resolve_with(self.params.snapshot())
    }

    fn resolve_with(&self, mix: MixSnapshot) -> Route {
        resolve_route(
            mix,
            self.is_attached(SourceKind::Microphone),
            self.is_attached(SourceKind::Player),
        )
    }

    /// Re-resolve and re-point the program output if the target changed
    pub fn refresh_route(&self) -> Route {
        let route = self.resolve();
        if self.selector.select(route) {
            tracing::info!("Program output routed to {}", route);
        }
        route
    }

    pub fn current_route(&self) -> Option<Route> {
        self.selector.current()
    }

    pub fn route_switches(&self) -> u64 {
        self.selector.switch_count()
    }

    /// Start delivering frames for `feed` to `sink`
    pub fn attach(&self, id: SessionId, feed: Feed, sink: Arc<dyn FrameSink>) {
        if self.taps.insert(id, Tap { feed, sink }).is_some() {
            tracing::debug!("Session {} re-attached to {} feed", id, feed.as_str());
        } else {
            tracing::debug!("Session {} attached to {} feed", id, feed.as_str());
        }
    }

    /// Stop delivering to a session. Returns whether it was attached.
    pub fn detach(&self, id: SessionId) -> bool {
        let removed = self.taps.remove(&id).is_some();
        if removed {
            tracing::debug!("Session {} detached", id);
        }
        removed
    }

    pub fn is_tapped(&self, id: SessionId) -> bool {
        self.taps.contains_key(&id)
    }

    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }

    /// Mix one frame period and deliver it to every tap
    pub fn process_frame(&self, mic: &[i16], player: &[i16]) {
        let n = self.frame_samples.min(mic.len()).min(player.len());
        let mix = self.params.snapshot();
        let gains = Gains::from_mix(mix);
        let route = self.resolve_with(mix);
        if self.selector.select(route) {
            tracing::info!("Program output routed to {}", route);
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        if self.taps.is_empty() {
            return;
        }

        let frame_us = self.frame_duration.as_micros() as u64;
        let stamp = |mut frame: AudioFrame| {
            frame.sequence = seq as u32;
            frame.timestamp_us = seq * frame_us;
            frame
        };

        let mic_frame = stamp(if mix.mic_muted {
            AudioFrame::silent(n)
        } else {
            AudioFrame {
                samples: mic[..n].to_vec(),
                ..AudioFrame::silent(0)
            }
        });
        let player_frame = stamp(AudioFrame {
            samples: player[..n].to_vec(),
            ..AudioFrame::silent(0)
        });

        let mut program = AudioFrame::silent(n);
        match route {
            Route::Mixed => mix_into(&mic[..n], &player[..n], gains, &mut program.samples),
            Route::Direct(kind) => {
                let src = match kind {
                    SourceKind::Microphone => &mic[..n],
                    SourceKind::Player => &player[..n],
                };
                apply_gain(src, gains.for_source(kind), &mut program.samples);
            }
        }
        let program = stamp(program);

        for tap in self.taps.iter() {
            let frame = match tap.feed {
                Feed::Microphone => &mic_frame,
                Feed::Player => &player_frame,
                Feed::Program => &program,
            };
            tap.sink.deliver(tap.feed, frame);
        }
    }

    fn bus(&self, kind: SourceKind) -> &Arc<Bus> {
        match kind {
            SourceKind::Microphone => &self.mic,
            SourceKind::Player => &self.player,
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.get_mut().take() {
            let _ = tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<(Feed, Vec<i16>)>>,
    }

    impl FrameSink for Collect {
        fn deliver(&self, feed: Feed, frame: &AudioFrame) {
            self.frames.lock().push((feed, frame.samples.clone()));
        }
    }

    fn engine() -> Arc<AudioEngine> {
        let config = AudioConfig {
            frame_size_ms: 1,
            ring_capacity: 480,
            ..AudioConfig::default()
        };
        AudioEngine::new(&config, Arc::new(MixParameters::default()))
    }

    fn id() -> SessionId {
        SessionId(Uuid::new_v4())
    }

    #[test]
    fn test_source_attachment_follows_feed_lifetime() {
        let engine = engine();
        assert!(!engine.is_attached(SourceKind::Player));
        let feed = engine.take_source(SourceKind::Player).unwrap();
        assert!(engine.is_attached(SourceKind::Player));
        assert!(matches!(
            engine.take_source(SourceKind::Player),
            Err(AudioError::SourceTaken(_))
        ));
        drop(feed);
        assert!(!engine.is_attached(SourceKind::Player));
    }

    #[test]
    fn test_source_can_reattach_after_detach() {
        let engine = engine();
        let _mic = engine.take_source(SourceKind::Microphone).unwrap();
        let first = engine.take_source(SourceKind::Player).unwrap();
        assert_eq!(engine.refresh_route(), Route::Direct(SourceKind::Microphone));
        engine.params().store(0.5, false);
        assert_eq!(engine.refresh_route(), Route::Mixed);

        drop(first);
        assert_eq!(engine.refresh_route(), Route::Direct(SourceKind::Microphone));

        // Next track on the same bus
        let mut second = engine.take_source(SourceKind::Player).unwrap();
        assert!(engine.is_attached(SourceKind::Player));
        assert_eq!(engine.refresh_route(), Route::Mixed);

        let n = engine.frame_samples();
        second.push(&vec![9; n], n);
        assert_eq!(second.lag(), n);

        for _ in 0..3 {
            let feed = engine.take_source(SourceKind::Microphone);
            assert!(matches!(feed, Err(AudioError::SourceTaken("microphone"))));
        }
    }

    #[test]
    fn test_routing_follows_attachments_and_params() {
        let engine = engine();
        let _mic = engine.take_source(SourceKind::Microphone).unwrap();
        assert_eq!(engine.refresh_route(), Route::Direct(SourceKind::Microphone));

        engine.params().store(0.5, false);
        // Player not attached yet: still direct
        assert_eq!(engine.refresh_route(), Route::Direct(SourceKind::Microphone));

        let _player = engine.take_source(SourceKind::Player).unwrap();
        assert_eq!(engine.refresh_route(), Route::Mixed);
        assert_eq!(engine.refresh_route(), Route::Mixed);
        assert_eq!(engine.route_switches(), 2);

        engine.params().store(0.0, true);
        assert_eq!(engine.refresh_route(), Route::Mixed);
        assert_eq!(engine.route_switches(), 2);
    }

    #[test]
    fn test_program_mix_applies_gains() {
        let engine = engine();
        let _mic = engine.take_source(SourceKind::Microphone).unwrap();
        let _player = engine.take_source(SourceKind::Player).unwrap();
        engine.params().store(0.25, false);

        let sink = Arc::new(Collect::default());
        engine.attach(id(), Feed::Program, sink.clone());

        let n = engine.frame_samples();
        engine.process_frame(&vec![1000; n], &vec![2000; n]);

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        // 0.75 * 1000 + 0.25 * 2000
        assert!(frames[0].1.iter().all(|s| *s == 1250));
    }

    #[test]
    fn test_muted_mic_feed_is_silent() {
        let engine = engine();
        let _mic = engine.take_source(SourceKind::Microphone).unwrap();
        engine.params().store(0.0, true);

        let mic_sink = Arc::new(Collect::default());
        let player_sink = Arc::new(Collect::default());
        engine.attach(id(), Feed::Microphone, mic_sink.clone());
        engine.attach(id(), Feed::Player, player_sink.clone());

        let n = engine.frame_samples();
        engine.process_frame(&vec![500; n], &vec![700; n]);

        assert!(mic_sink.frames.lock()[0].1.iter().all(|s| *s == 0));
        assert!(player_sink.frames.lock()[0].1.iter().all(|s| *s == 700));
    }

    #[test]
    fn test_detach_stops_delivery() {
        let engine = engine();
        let sink = Arc::new(Collect::default());
        let session = id();
        engine.attach(session, Feed::Program, sink.clone());
        assert!(engine.detach(session));
        assert!(!engine.detach(session));

        let n = engine.frame_samples();
        engine.process_frame(&vec![1; n], &vec![1; n]);
        assert!(sink.frames.lock().is_empty());
    }

    #[test]
    fn test_thread_pulls_from_rings() {
        let engine = engine();
        let mut mic = engine.take_source(SourceKind::Microphone).unwrap();
        let sink = Arc::new(Collect::default());
        engine.attach(id(), Feed::Microphone, sink.clone());

        let n = engine.frame_samples();
        mic.push(&vec![42; n * 4], n * 4);
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(AudioError::AlreadyRunning)));
        std::thread::sleep(Duration::from_millis(50));
        engine.stop();

        let frames = sink.frames.lock();
        assert!(frames.len() >= 4);
        assert!(frames[0].1.iter().all(|s| *s == 42));
    }
}
