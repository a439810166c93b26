//! Framed codec for control-channel messages.
//!
//! Uses LengthDelimitedCodec for framing with a 16-bit length prefix. A
//! message is a tuple of UTF-8 text fields, each terminated by a NUL byte.
//! Works over any AsyncRead/AsyncWrite.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Codec that frames NUL-separated field tuples with a length prefix.
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(2)
                .new_codec(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Vec<String>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let Some(body) = text.strip_suffix('\0') else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "message frame not NUL-terminated",
                    ));
                };
                let fields = body.split('\0').map(str::to_string).collect();
                Ok(Some(fields))
            }
            None => Ok(None),
        }
    }
}

impl<'a> Encoder<&'a [&'a str]> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, fields: &'a [&'a str], dst: &mut BytesMut) -> Result<(), io::Error> {
        if fields.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "message must contain at least one field",
            ));
        }

        let mut payload = Vec::with_capacity(fields.iter().map(|f| f.len() + 1).sum());
        for field in fields {
            if field.as_bytes().contains(&0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message field contains a NUL byte",
                ));
            }
            payload.extend_from_slice(field.as_bytes());
            payload.push(0);
        }

        tracing::trace!(fields = fields.len(), payload_bytes = payload.len(), "Encoding frame");
        self.inner.encode(Bytes::from(payload), dst)
    }
}
