//! Per-session audio pipeline.
//!
//! A [`StreamRouter`] owns a bounded queue of raw audio chunks and a
//! dedicated worker thread that runs them through a [`VoiceLoop`]. Wake words
//! and finished utterances come out as [`StreamEvent`]s for the session's
//! message path. Synthesized response audio goes the other way, as WAV
//! frames on the stream's outbound channel.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    thread::JoinHandle,
};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select},
    hana_config::StreamingConfig,
    hana_protocol::{KlatResponseData, Message, msg_types},
    serde_json::{Map, Value},
    tokio::sync::mpsc,
    tracing::{debug, error, info, warn},
};

use crate::{
    HotwordDetector, Result, VoiceActivityDetector, VoiceError,
    audio::encode_wav,
    tts::decode_response_audio,
    vad::EnergyVad,
    voice_loop::{LoopEvent, VoiceLoop, VoiceLoopSettings},
};

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub voice: VoiceLoopSettings,
    /// Chunks buffered before new audio is dropped.
    pub queue_capacity: usize,
    /// Utterance language until a wake word selects another.
    pub lang: String,
}

impl From<&StreamingConfig> for StreamSettings {
    fn from(cfg: &StreamingConfig) -> Self {
        Self {
            voice: cfg.into(),
            queue_capacity: cfg.queue_capacity.max(1),
            lang: cfg.default_lang.clone(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        (&StreamingConfig::default()).into()
    }
}

/// Detection engines for one stream.
pub struct Detectors {
    pub vad: Box<dyn VoiceActivityDetector>,
    pub hotword: Option<Box<dyn HotwordDetector>>,
}

impl Detectors {
    /// Energy VAD without a wake word.
    pub fn energy(threshold: f64) -> Self {
        Self {
            vad: Box::new(EnergyVad::new(threshold)),
            hotword: None,
        }
    }
}

/// Builds a fresh set of detectors for each new stream.
pub type DetectorFactory = Arc<dyn Fn() -> Detectors + Send + Sync>;

// ── Events and state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    WakeWord {
        session_id: String,
        context: Map<String, Value>,
    },
    /// A `neon.audio_input` message ready for the backend.
    Utterance { session_id: String, message: Message },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StreamState {
    Idle = 0,
    Attaching = 1,
    Active = 2,
    ShuttingDown = 3,
    Stopped = 4,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Attaching,
            2 => Self::Active,
            3 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }

    pub fn is_closed(self) -> bool {
        self >= Self::ShuttingDown
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

pub struct StreamRouter {
    session_id: String,
    settings: StreamSettings,
    state: Arc<AtomicU8>,
    lang: Arc<Mutex<String>>,
    audio_tx: Sender<Vec<u8>>,
    audio_rx: Receiver<Vec<u8>>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    audio_out: mpsc::UnboundedSender<Vec<u8>>,
}

impl std::fmt::Debug for StreamRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRouter")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("queued", &self.audio_rx.len())
            .finish()
    }
}

impl StreamRouter {
    /// Create an idle router. `events` receives wake words and utterances,
    /// `audio_out` receives WAV frames for the client.
    pub fn new(
        session_id: impl Into<String>,
        settings: StreamSettings,
        events: mpsc::UnboundedSender<StreamEvent>,
        audio_out: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let (audio_tx, audio_rx) = bounded(settings.queue_capacity.max(1));
        let (stop_tx, stop_rx) = bounded(1);
        Self {
            session_id: session_id.into(),
            lang: Arc::new(Mutex::new(settings.lang.clone())),
            settings,
            state: Arc::new(AtomicU8::new(StreamState::Idle as u8)),
            audio_tx,
            audio_rx,
            stop_tx,
            stop_rx,
            worker: Mutex::new(None),
            events,
            audio_out,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current utterance language.
    pub fn lang(&self) -> String {
        self.lang.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mark the router as waiting for its control session.
    pub fn begin_attach(&self) {
        let _ = self.state.compare_exchange(
            StreamState::Idle as u8,
            StreamState::Attaching as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Spawn the worker thread. Audio pushed before this call is processed
    /// once the worker runs.
    ///
    /// The worker slot stays locked from the state transition until the
    /// handle is stored, so a concurrent [`shutdown`](Self::shutdown) either
    /// sees the handle or makes this call fail.
    pub fn start(&self, detectors: Detectors) -> Result<()> {
        let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        let claimed = [StreamState::Idle, StreamState::Attaching]
            .into_iter()
            .any(|from| {
                self.state
                    .compare_exchange(
                        from as u8,
                        StreamState::Active as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            });
        if !claimed {
            return Err(VoiceError::StreamClosed);
        }
        let voice = VoiceLoop::new(self.settings.voice.clone(), detectors.vad, detectors.hotword);
        let worker = Worker {
            session_id: self.session_id.clone(),
            sample_rate: self.settings.voice.sample_rate,
            state: Arc::clone(&self.state),
            lang: Arc::clone(&self.lang),
            audio_rx: self.audio_rx.clone(),
            stop_rx: self.stop_rx.clone(),
            events: self.events.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("stream-{}", self.session_id))
            .spawn(move || worker.run(voice))
            .map_err(|e| {
                self.state
                    .store(StreamState::Stopped as u8, Ordering::Release);
                VoiceError::WorkerSpawn(e)
            })?;
        *slot = Some(handle);
        info!(session_id = %self.session_id, "audio stream started");
        Ok(())
    }

    /// Queue a chunk of raw audio without blocking.
    pub fn push_audio(&self, chunk: Vec<u8>) -> Result<()> {
        if self.state().is_closed() {
            return Err(VoiceError::StreamClosed);
        }
        match self.audio_tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.session_id, "audio queue full, dropping chunk");
                Err(VoiceError::QueueFull)
            },
            Err(TrySendError::Disconnected(_)) => Err(VoiceError::StreamClosed),
        }
    }

    /// Send every synthesized clip in `response` to the client, one binary
    /// frame per clip. Returns the number of frames sent.
    pub fn deliver_response_audio(&self, response: &KlatResponseData) -> usize {
        if self.state().is_closed() {
            return 0;
        }
        let mut sent = 0;
        for clip in decode_response_audio(response) {
            if self.audio_out.send(clip).is_err() {
                debug!(session_id = %self.session_id, "stream transport gone, dropping response audio");
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Stop the worker and wait for it to exit. Safe to call more than once.
    ///
    /// Blocks the calling thread while joining. Concurrent callers wait for
    /// the first one to finish.
    pub fn shutdown(&self) {
        let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        let prev = StreamState::from_u8(
            self.state
                .swap(StreamState::ShuttingDown as u8, Ordering::AcqRel),
        );
        if prev == StreamState::Stopped {
            self.state
                .store(StreamState::Stopped as u8, Ordering::Release);
            return;
        }
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = slot.take()
            && handle.join().is_err()
        {
            error!(session_id = %self.session_id, "stream worker panicked");
        }
        // Anything still queued belongs to a closed stream.
        while self.audio_rx.try_recv().is_ok() {}
        self.state
            .store(StreamState::Stopped as u8, Ordering::Release);
        drop(slot);
        if prev != StreamState::ShuttingDown {
            info!(session_id = %self.session_id, "audio stream stopped");
        }
    }
}

impl Drop for StreamRouter {
    fn drop(&mut self) {
        if !self.state().is_closed() {
            self.state
                .store(StreamState::ShuttingDown as u8, Ordering::Release);
        }
        let _ = self.stop_tx.try_send(());
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

struct Worker {
    session_id: String,
    sample_rate: u32,
    state: Arc<AtomicU8>,
    lang: Arc<Mutex<String>>,
    audio_rx: Receiver<Vec<u8>>,
    stop_rx: Receiver<()>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl Worker {
    fn run(self, mut voice: VoiceLoop) {
        debug!(session_id = %self.session_id, "stream worker running");
        loop {
            if StreamState::from_u8(self.state.load(Ordering::Acquire)).is_closed() {
                break;
            }
            select! {
                recv(self.stop_rx) -> _ => break,
                recv(self.audio_rx) -> chunk => match chunk {
                    Ok(chunk) => {
                        if !self.handle_chunk(&mut voice, &chunk) {
                            break;
                        }
                    },
                    Err(_) => break,
                },
            }
        }
        debug!(session_id = %self.session_id, "stream worker exiting");
    }

    /// Returns `false` once nobody is listening for events.
    fn handle_chunk(&self, voice: &mut VoiceLoop, chunk: &[u8]) -> bool {
        for event in voice.feed(chunk) {
            let out = match event {
                LoopEvent::Hotword(hotword) => {
                    if let Some(lang) = &hotword.lang {
                        *self.lang.lock().unwrap_or_else(|e| e.into_inner()) = lang.clone();
                    }
                    info!(session_id = %self.session_id, hotword = %hotword.name, "wake word detected");
                    StreamEvent::WakeWord {
                        session_id: self.session_id.clone(),
                        context: hotword.to_context(),
                    }
                },
                LoopEvent::Utterance(samples) => {
                    let wav = match encode_wav(&samples, self.sample_rate) {
                        Ok(wav) => wav,
                        Err(e) => {
                            error!(session_id = %self.session_id, error = %e, "failed to encode utterance");
                            continue;
                        },
                    };
                    let lang = self.lang.lock().unwrap_or_else(|e| e.into_inner()).clone();
                    debug!(session_id = %self.session_id, bytes = wav.len(), %lang, "utterance captured");
                    let mut data = Map::new();
                    data.insert("audio_data".into(), Value::String(STANDARD.encode(&wav)));
                    data.insert("lang".into(), Value::String(lang));
                    StreamEvent::Utterance {
                        session_id: self.session_id.clone(),
                        message: Message::new(msg_types::AUDIO_INPUT, data),
                    }
                },
            };
            if self.events.send(out).is_err() {
                warn!(session_id = %self.session_id, "stream event receiver closed");
                return false;
            }
        }
        true
    }
}
