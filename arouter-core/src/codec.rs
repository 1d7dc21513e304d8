//! The transparent codec (C2): moves raw protobuf bytes between a
//! downstream server-side stream and an upstream client-side stream without
//! decoding them into a concrete message type.
//!
//! `tonic::codec::Codec` fixes one `Encode` and one `Decode` type per codec
//! instance, so the original's single dynamically-typed codec becomes two:
//! `ServerCodec` decodes bytes off the wire into a `RequestFrame` carrier
//! and encodes a `ResponseFrame` carrier back onto the wire unchanged;
//! `ClientCodec` is the mirror image on the upstream side. Neither one
//! invokes a router itself — routing needs the call's gRPC metadata, which
//! isn't visible to a `Decoder`, so `Forwarder`/`ForwardService` call
//! `Router::route` once they hold the full `http::Request` (see
//! `forwarder.rs`).

use bytes::{Buf, BufMut, Bytes};
use tonic::codec::{BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

use crate::router::{RequestFrame, ResponseFrame};

fn copy_buf(src: &mut dyn Buf) -> Bytes {
    let mut out = Vec::with_capacity(src.remaining());
    while src.has_remaining() {
        let chunk = src.chunk();
        out.extend_from_slice(chunk);
        let len = chunk.len();
        src.advance(len);
    }
    Bytes::from(out)
}

/// Server-side: decodes inbound client bytes into a bare frame, encodes the
/// upstream's response bytes straight back to the client.
#[derive(Default, Clone)]
pub struct ServerCodec;

impl Codec for ServerCodec {
    type Encode = ResponseFrame;
    type Decode = RequestFrame;
    type Encoder = FrameEncoder<ResponseFrame>;
    type Decoder = RequestFrameDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        FrameEncoder::default()
    }

    fn decoder(&mut self) -> Self::Decoder {
        RequestFrameDecoder
    }
}

/// Client-side: encodes an outbound frame's bytes straight upstream,
/// decodes the upstream's response bytes into a bare frame.
#[derive(Default, Clone)]
pub struct ClientCodec;

impl Codec for ClientCodec {
    type Encode = RequestFrame;
    type Decode = ResponseFrame;
    type Encoder = RequestFrameEncoder;
    type Decoder = ResponseFrameDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RequestFrameEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        ResponseFrameDecoder
    }
}

#[derive(Default)]
pub struct FrameEncoder<T>(std::marker::PhantomData<T>);

impl Encoder for FrameEncoder<ResponseFrame> {
    type Item = ResponseFrame;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item.payload);
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

pub struct RequestFrameEncoder;

impl Encoder for RequestFrameEncoder {
    type Item = RequestFrame;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item.payload);
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

pub struct RequestFrameDecoder;

impl Decoder for RequestFrameDecoder {
    type Item = RequestFrame;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if !src.has_remaining() {
            return Ok(None);
        }
        let payload = copy_buf(src);
        Ok(Some(RequestFrame {
            method: crate::method::MethodDetails::default(),
            payload,
            metadata: tonic::metadata::MetadataMap::new(),
            source: None,
            pending_header: None,
        }))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

pub struct ResponseFrameDecoder;

impl Decoder for ResponseFrameDecoder {
    type Item = ResponseFrame;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if !src.has_remaining() {
            return Ok(None);
        }
        Ok(Some(ResponseFrame { payload: copy_buf(src) }))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}
