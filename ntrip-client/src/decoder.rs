use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// Failure reported by a [`StreamDecoder`]
pub enum DecodeError {
    /// Used after [`StreamDecoder::close`]
    #[error("Stream decoder is closed")]
    Closed,
    /// The bytes could not be framed
    #[error("Invalid stream data: {0}")]
    Invalid(String),
}

/// Frames the raw bytes received from a caster into records.
///
/// A fresh decoder is created for every connection and closed when that
/// connection is torn down. An `Err` is treated like a transport fault.
pub trait StreamDecoder: Send {
    /// Feed a chunk of inbound bytes, returning the records completed by it.
    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError>;

    /// Release the decoder. Later calls to `decode` must fail.
    fn close(&mut self);
}

/// Creates the decoder attached to each new connection.
pub type DecoderFactory = Box<dyn FnMut() -> Box<dyn StreamDecoder> + Send>;

#[derive(Debug, Default)]
/// A decoder that hands every chunk through unchanged
pub struct Passthrough {
    closed: bool,
}

impl StreamDecoder for Passthrough {
    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![chunk.to_vec()])
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Factory for [`Passthrough`] decoders
pub fn passthrough() -> DecoderFactory {
    Box::new(|| Box::new(Passthrough::default()) as Box<dyn StreamDecoder>)
}
