//! Audio stream processing for node clients.
//!
//! Raw PCM arrives from the client, is segmented into utterances by a VAD
//! and optional wake word engine, and leaves as `neon.audio_input` messages.
//! Synthesized replies are decoded back into WAV frames for the client.

pub mod audio;
pub mod error;
pub mod hotword;
pub mod stream;
pub mod tts;
pub mod vad;
pub mod voice_loop;

pub use {
    error::{Result, VoiceError},
    hotword::{HotwordDetector, HotwordEvent},
    stream::{DetectorFactory, Detectors, StreamEvent, StreamRouter, StreamSettings, StreamState},
    tts::decode_response_audio,
    vad::{EnergyVad, VoiceActivityDetector},
    voice_loop::{LoopEvent, VoiceLoop, VoiceLoopSettings},
};
