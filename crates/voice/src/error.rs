#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("audio stream is closed")]
    StreamClosed,
    #[error("audio queue is full, chunk dropped")]
    QueueFull,
    #[error("failed to spawn stream worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VoiceError>;
