#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("Audio output unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Audio output reported an unusable buffer size of {0} bytes")]
    InvalidBufferSize(usize),
}
