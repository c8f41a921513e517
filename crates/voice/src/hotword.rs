use serde_json::{Map, Value};

/// A wake word heard in the audio stream.
#[derive(Debug, Clone, PartialEq)]
pub struct HotwordEvent {
    pub name: String,
    /// Language the following utterance should be transcribed in, when the
    /// wake word implies one.
    pub lang: Option<String>,
}

impl HotwordEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: None,
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    /// Context forwarded to the client with `neon.ww_detected`.
    pub fn to_context(&self) -> Map<String, Value> {
        let mut context = Map::new();
        context.insert("hotword".into(), Value::String(self.name.clone()));
        if let Some(lang) = &self.lang {
            context.insert("stt_lang".into(), Value::String(lang.clone()));
        }
        context
    }
}

/// Wake word engine run over consecutive audio frames.
pub trait HotwordDetector: Send {
    fn detect(&mut self, frame: &[i16]) -> Option<HotwordEvent>;

    fn reset(&mut self) {}
}
