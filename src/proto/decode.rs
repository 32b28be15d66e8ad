//! Request body assembly: content-length and chunked framing.

use http::HeaderMap;

use crate::buf::ByteBuf64;
use crate::error::{Error, Parse};
use crate::proto::chunked::{ChunkProgress, ChunkedDecoder};
use crate::proto::parse::BodyFraming;

#[derive(Debug)]
pub(crate) enum BodyDecoder {
    None,
    Length { remaining: u64 },
    Chunked { decoder: ChunkedDecoder, max: u64 },
}

impl BodyDecoder {
    /// Build the decoder for a parsed head. A declared Content-Length above
    /// `max_body_bytes` is rejected up front with 413.
    pub(crate) fn for_framing(framing: BodyFraming, max_body_bytes: u64) -> Result<Self, Error> {
        match framing {
            BodyFraming::None => Ok(Self::None),
            BodyFraming::Length(len) => {
                if len > max_body_bytes {
                    return Err(Error::new_parse(Parse::BodyTooLarge));
                }
                Ok(Self::Length { remaining: len })
            }
            BodyFraming::Chunked => Ok(Self::Chunked {
                decoder: ChunkedDecoder::new(),
                max: max_body_bytes,
            }),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        match self {
            Self::None => true,
            Self::Length { remaining } => *remaining == 0,
            Self::Chunked { .. } => false,
        }
    }

    /// Consume body bytes from `input` into `body`.
    ///
    /// Returns bytes consumed and whether the body is complete.
    pub(crate) fn decode(
        &mut self,
        input: &[u8],
        body: &mut ByteBuf64,
    ) -> Result<(usize, bool), Error> {
        match self {
            Self::None => Ok((0, true)),
            Self::Length { remaining } => {
                let take = (*remaining).min(input.len() as u64) as usize;
                body.append(&input[..take])
                    .map_err(|_| Error::new_parse(Parse::BodyTooLarge))?;
                *remaining -= take as u64;
                Ok((take, *remaining == 0))
            }
            Self::Chunked { decoder, max } => {
                let (consumed, progress) = decoder.decode(input, body, *max)?;
                Ok((consumed, progress == ChunkProgress::Done))
            }
        }
    }

    pub(crate) fn take_trailers(&mut self) -> Result<Option<HeaderMap>, Error> {
        match self {
            Self::Chunked { decoder, .. } => decoder.take_trailers(),
            _ => Ok(None),
        }
    }
}
