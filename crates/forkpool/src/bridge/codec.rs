//! Framed codec for master/worker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Frame layout: `[u32 length, network byte order][JSON payload]`.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload accepted in one frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_LEN)
                .big_endian()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{DispatchRequest, WorkerHello};
    use crate::job::UnitOfWork;

    #[test]
    fn prefix_is_big_endian_payload_length() {
        let mut codec = JsonCodec::<WorkerHello>::new();
        let mut buf = BytesMut::new();
        codec.encode(WorkerHello { pid: 7 }, &mut buf).unwrap();

        let payload = br#"{"pid":7}"#;
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], payload);
    }

    #[test]
    fn partial_frame_is_not_decoded() {
        let mut codec = JsonCodec::<DispatchRequest>::new();
        let mut buf = BytesMut::new();
        let unit = UnitOfWork::new("job-1", "default", "{}");
        codec
            .encode(DispatchRequest::perform(vec![unit]), &mut buf)
            .unwrap();

        let mut head = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut head).unwrap().is_none());

        head.unsplit(buf);
        let decoded = codec.decode(&mut head).unwrap().unwrap();
        let DispatchRequest::Perform { units } = decoded;
        assert_eq!(units[0].id, "job-1");
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut codec = JsonCodec::<WorkerHello>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        buf.extend_from_slice(b"{}");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
