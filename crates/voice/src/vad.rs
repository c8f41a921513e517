use crate::audio::rms;

/// Decides whether a frame of audio contains speech.
pub trait VoiceActivityDetector: Send {
    fn is_speech(&mut self, frame: &[i16]) -> bool;

    /// Clear any state carried between frames.
    fn reset(&mut self) {}
}

/// Energy threshold VAD: a frame is speech when its RMS level reaches the
/// threshold.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f64,
}

impl EnergyVad {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        rms(frame) >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_not_speech() {
        let mut vad = EnergyVad::new(500.0);
        assert!(!vad.is_speech(&[0; 480]));
        assert!(!vad.is_speech(&[100; 480]));
        assert!(vad.is_speech(&[2000; 480]));
    }
}
