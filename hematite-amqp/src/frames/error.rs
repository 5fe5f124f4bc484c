/// Frame codec error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Frame type or data offset is not supported
    #[error("Frame type or doff is not supported")]
    NotImplemented,

    /// Error encoding or decoding the performative
    #[error(transparent)]
    Codec(#[from] serde_amqp::Error),
}
