use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("transport is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// the byte pipe under one peer connection. writes never block: a transport buffers everything
/// it is handed and reports through [`Transport::is_flushed`] whether that buffer has drained.
pub trait Transport {
    fn write(&mut self, buf: &[u8]) -> Result<(), SendError>;

    fn is_flushed(&self) -> bool;

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
