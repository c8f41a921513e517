//! Utterance segmentation over a raw PCM stream.
//!
//! With a hotword detector the loop waits for a wake word and then records
//! the command that follows. Without one it records whenever the VAD hears
//! speech. A recording ends after enough trailing silence, or at the
//! utterance length cap, and is only kept when it holds enough speech.

use hana_config::StreamingConfig;

use crate::{
    HotwordDetector, HotwordEvent, VoiceActivityDetector,
    audio::pcm_to_samples,
};

/// Length of one analysis frame.
const FRAME_MS: u32 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceLoopSettings {
    pub sample_rate: u32,
    pub sample_width: u16,
    pub speech_seconds: f32,
    pub silence_seconds: f32,
    pub max_utterance_seconds: f32,
}

impl From<&StreamingConfig> for VoiceLoopSettings {
    fn from(cfg: &StreamingConfig) -> Self {
        Self {
            sample_rate: cfg.sample_rate,
            sample_width: cfg.sample_width,
            speech_seconds: cfg.speech_seconds,
            silence_seconds: cfg.silence_seconds,
            max_utterance_seconds: cfg.max_utterance_seconds,
        }
    }
}

impl Default for VoiceLoopSettings {
    fn default() -> Self {
        (&StreamingConfig::default()).into()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Hotword(HotwordEvent),
    /// A finished utterance as 16-bit mono samples.
    Utterance(Vec<i16>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Waiting,
    Listening,
    Recording,
}

pub struct VoiceLoop {
    settings: VoiceLoopSettings,
    vad: Box<dyn VoiceActivityDetector>,
    hotword: Option<Box<dyn HotwordDetector>>,
    frame_len: usize,
    speech_frames_needed: usize,
    silence_frames_needed: usize,
    max_samples: usize,
    pending: Vec<u8>,
    state: LoopState,
    recording: Vec<i16>,
    speech_frames: usize,
    silence_frames: usize,
}

impl VoiceLoop {
    pub fn new(
        settings: VoiceLoopSettings,
        vad: Box<dyn VoiceActivityDetector>,
        hotword: Option<Box<dyn HotwordDetector>>,
    ) -> Self {
        let frame_len = (settings.sample_rate * FRAME_MS / 1000).max(1) as usize;
        let frames_for = |seconds: f32| {
            ((seconds * settings.sample_rate as f32) / frame_len as f32)
                .ceil()
                .max(1.0) as usize
        };
        let state = if hotword.is_some() {
            LoopState::Waiting
        } else {
            LoopState::Listening
        };
        Self {
            speech_frames_needed: frames_for(settings.speech_seconds),
            silence_frames_needed: frames_for(settings.silence_seconds),
            max_samples: (settings.max_utterance_seconds * settings.sample_rate as f32) as usize,
            frame_len,
            settings,
            vad,
            hotword,
            pending: Vec::new(),
            state,
            recording: Vec::new(),
            speech_frames: 0,
            silence_frames: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.settings.sample_rate
    }

    pub fn is_recording(&self) -> bool {
        self.state == LoopState::Recording
    }

    /// Feed a chunk of raw PCM. Partial frames are carried over to the next
    /// call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<LoopEvent> {
        self.pending.extend_from_slice(chunk);
        let frame_bytes = self.frame_len * usize::from(self.settings.sample_width.max(1));
        let mut events = Vec::new();
        while self.pending.len() >= frame_bytes {
            let bytes: Vec<u8> = self.pending.drain(..frame_bytes).collect();
            let frame = pcm_to_samples(&bytes, self.settings.sample_width);
            self.process_frame(frame, &mut events);
        }
        events
    }

    fn process_frame(&mut self, frame: Vec<i16>, events: &mut Vec<LoopEvent>) {
        match self.state {
            LoopState::Waiting => {
                if let Some(event) = self.hotword.as_mut().and_then(|h| h.detect(&frame)) {
                    events.push(LoopEvent::Hotword(event));
                    self.vad.reset();
                    self.start_recording();
                }
            },
            LoopState::Listening => {
                if self.vad.is_speech(&frame) {
                    self.start_recording();
                    self.record(frame, true, events);
                }
            },
            LoopState::Recording => {
                let speech = self.vad.is_speech(&frame);
                self.record(frame, speech, events);
            },
        }
    }

    fn start_recording(&mut self) {
        self.state = LoopState::Recording;
        self.recording.clear();
        self.speech_frames = 0;
        self.silence_frames = 0;
    }

    fn record(&mut self, frame: Vec<i16>, speech: bool, events: &mut Vec<LoopEvent>) {
        self.recording.extend(frame);
        if speech {
            self.speech_frames += 1;
            self.silence_frames = 0;
        } else if self.speech_frames > 0 {
            self.silence_frames += 1;
        }

        if self.silence_frames >= self.silence_frames_needed
            || self.recording.len() >= self.max_samples
        {
            if self.speech_frames >= self.speech_frames_needed {
                events.push(LoopEvent::Utterance(std::mem::take(&mut self.recording)));
            }
            self.finish_recording();
        }
    }

    fn finish_recording(&mut self) {
        self.recording.clear();
        self.speech_frames = 0;
        self.silence_frames = 0;
        self.vad.reset();
        self.state = match self.hotword.as_mut() {
            Some(hotword) => {
                hotword.reset();
                LoopState::Waiting
            },
            None => LoopState::Listening,
        };
    }
}
