//! Incremental chunked transfer-coding decoder and the matching encoder.
//!
//! The decoder is resumable: feed it whatever bytes are buffered, it
//! consumes what it can and reports whether the body is complete. Chunk
//! extensions are skipped; trailers are captured and parsed once the
//! terminating empty line arrives.

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::buf::{ByteBuf64, CapacityOverflow};
use crate::error::{Error, Parse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkProgress {
    NeedMore,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    SizeDigits,
    Ext,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    Trailers,
    Done,
}

#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: State,
    chunk_remaining: u64,
    decoded: u64,
    trailer_buf: Vec<u8>,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Size,
            chunk_remaining: 0,
            decoded: 0,
            trailer_buf: Vec::new(),
        }
    }

    /// Decode from `input`, appending chunk payload bytes to `out`.
    ///
    /// Returns the number of input bytes consumed and whether the body
    /// (including trailers) is complete. The decoded total is capped at
    /// `max_decoded`; exceeding it is a 413.
    pub(crate) fn decode(
        &mut self,
        input: &[u8],
        out: &mut ByteBuf64,
        max_decoded: u64,
    ) -> Result<(usize, ChunkProgress), Error> {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                State::Size | State::SizeDigits => {
                    let byte = input[pos];
                    if let Some(digit) = hex_digit(byte) {
                        self.chunk_remaining = self
                            .chunk_remaining
                            .checked_mul(16)
                            .and_then(|n| n.checked_add(u64::from(digit)))
                            .ok_or_else(|| Error::new_parse(Parse::ChunkInvalid))?;
                        self.state = State::SizeDigits;
                        pos += 1;
                    } else if self.state == State::Size {
                        return Err(Error::new_parse(Parse::ChunkInvalid));
                    } else if byte == b';' {
                        self.state = State::Ext;
                        pos += 1;
                    } else if byte == b'\r' {
                        self.state = State::SizeLf;
                        pos += 1;
                    } else {
                        return Err(Error::new_parse(Parse::ChunkInvalid));
                    }
                }
                State::Ext => {
                    if input[pos] == b'\r' {
                        self.state = State::SizeLf;
                    }
                    pos += 1;
                }
                State::SizeLf => {
                    if input[pos] != b'\n' {
                        return Err(Error::new_parse(Parse::ChunkInvalid));
                    }
                    pos += 1;
                    self.state = if self.chunk_remaining == 0 {
                        State::Trailers
                    } else {
                        State::Data
                    };
                }
                State::Data => {
                    let available = input.len() - pos;
                    let take = (self.chunk_remaining.min(available as u64)) as usize;
                    self.decoded += take as u64;
                    if self.decoded > max_decoded {
                        return Err(Error::new_parse(Parse::BodyTooLarge));
                    }
                    out.append(&input[pos..pos + take])
                        .map_err(|_| Error::new_parse(Parse::BodyTooLarge))?;
                    pos += take;
                    self.chunk_remaining -= take as u64;
                    if self.chunk_remaining == 0 {
                        self.state = State::DataCr;
                    }
                }
                State::DataCr => {
                    if input[pos] != b'\r' {
                        return Err(Error::new_parse(Parse::ChunkInvalid));
                    }
                    pos += 1;
                    self.state = State::DataLf;
                }
                State::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(Error::new_parse(Parse::ChunkInvalid));
                    }
                    pos += 1;
                    self.state = State::Size;
                }
                State::Trailers => {
                    self.trailer_buf.push(input[pos]);
                    pos += 1;
                    if self.trailer_buf.ends_with(b"\r\n")
                        && (self.trailer_buf.len() == 2 || self.trailer_buf.ends_with(b"\r\n\r\n"))
                    {
                        self.state = State::Done;
                        return Ok((pos, ChunkProgress::Done));
                    }
                }
                State::Done => break,
            }
        }

        let progress = if self.state == State::Done {
            ChunkProgress::Done
        } else {
            ChunkProgress::NeedMore
        };
        Ok((pos, progress))
    }

    /// Parse captured trailers, if any. Valid only once decoding is done.
    pub(crate) fn take_trailers(&mut self) -> Result<Option<HeaderMap>, Error> {
        let raw = std::mem::take(&mut self.trailer_buf);
        if raw.len() <= 2 {
            return Ok(None);
        }
        let mut trailers = HeaderMap::new();
        for line in raw.split(|byte| *byte == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let colon = line
                .iter()
                .position(|byte| *byte == b':')
                .ok_or_else(|| Error::new_parse(Parse::ChunkInvalid))?;
            let name = HeaderName::from_bytes(&line[..colon])
                .map_err(|_| Error::new_parse(Parse::ChunkInvalid))?;
            let value = HeaderValue::from_bytes(trim_ows(&line[colon + 1..]))
                .map_err(|_| Error::new_parse(Parse::ChunkInvalid))?;
            trailers.append(name, value);
        }
        Ok(Some(trailers))
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = bytes.split_first() {
        bytes = rest;
    }
    while let Some((b' ' | b'\t', rest)) = bytes.split_last() {
        bytes = rest;
    }
    bytes
}

const MAX_HEX_LEN: usize = 16;

/// Append one chunk (size line, payload, CRLF) to `out`.
pub(crate) fn encode_chunk(data: &[u8], out: &mut ByteBuf64) -> Result<(), CapacityOverflow> {
    debug_assert!(!data.is_empty(), "zero-size chunk terminates the body");
    let mut hex = [0u8; MAX_HEX_LEN];
    let hex = format_hex(data.len(), &mut hex);
    out.ensure_available(hex.len() + 2 + data.len() + 2)?;
    out.unchecked_append(hex);
    out.unchecked_append(b"\r\n");
    out.unchecked_append(data);
    out.unchecked_append(b"\r\n");
    Ok(())
}

/// Append the terminating zero chunk.
pub(crate) fn encode_final(out: &mut ByteBuf64) -> Result<(), CapacityOverflow> {
    out.append(b"0\r\n\r\n")
}

fn format_hex(mut value: usize, buf: &mut [u8; MAX_HEX_LEN]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut pos = MAX_HEX_LEN;
    loop {
        pos -= 1;
        buf[pos] = DIGITS[value & 0xf];
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    &buf[pos..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<u8>, Option<HeaderMap>, usize) {
        let mut decoder = ChunkedDecoder::new();
        let mut out = ByteBuf64::new();
        let (consumed, progress) = decoder.decode(input, &mut out, 1 << 20).unwrap();
        assert_eq!(progress, ChunkProgress::Done);
        let trailers = decoder.take_trailers().unwrap();
        (out.as_slice().to_vec(), trailers, consumed)
    }

    #[test]
    fn single_chunk() {
        let (body, trailers, consumed) = decode_all(b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(body, b"hello");
        assert!(trailers.is_none());
        assert_eq!(consumed, 15);
    }

    #[test]
    fn multiple_chunks_concatenate() {
        let (body, _, _) = decode_all(b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n");
        assert_eq!(body, b"wikipedia");
    }

    #[test]
    fn chunk_extensions_are_skipped() {
        let (body, _, _) = decode_all(b"5;name=value\r\nhello\r\n0\r\n\r\n");
        assert_eq!(body, b"hello");
    }

    #[test]
    fn trailers_are_captured() {
        let (body, trailers, _) = decode_all(b"3\r\nabc\r\n0\r\nX-Sum: 9\r\n\r\n");
        assert_eq!(body, b"abc");
        let trailers = trailers.unwrap();
        assert_eq!(trailers.get("x-sum").unwrap(), "9");
    }

    #[test]
    fn resumable_across_feeds() {
        let full = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = ByteBuf64::new();
        let mut fed = 0;
        for chunk in full.chunks(3) {
            let (consumed, _) = decoder.decode(chunk, &mut out, 1 << 20).unwrap();
            assert_eq!(consumed, chunk.len());
            fed += consumed;
        }
        assert_eq!(fed, full.len());
        assert_eq!(out.as_slice(), b"hello world");
    }

    #[test]
    fn invalid_size_line_rejected() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = ByteBuf64::new();
        let err = decoder.decode(b"zz\r\n", &mut out, 1 << 20).unwrap_err();
        assert_eq!(err.parse_kind(), Some(crate::error::Parse::ChunkInvalid));
    }

    #[test]
    fn missing_chunk_crlf_rejected() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = ByteBuf64::new();
        let err = decoder
            .decode(b"3\r\nabcX\r\n", &mut out, 1 << 20)
            .unwrap_err();
        assert_eq!(err.parse_kind(), Some(crate::error::Parse::ChunkInvalid));
    }

    #[test]
    fn decoded_size_is_capped() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = ByteBuf64::new();
        let err = decoder
            .decode(b"a\r\n0123456789\r\n", &mut out, 4)
            .unwrap_err();
        assert_eq!(err.parse_kind(), Some(crate::error::Parse::BodyTooLarge));
    }

    #[test]
    fn encode_round_trip() {
        let mut out = ByteBuf64::new();
        encode_chunk(b"hello", &mut out).unwrap();
        encode_chunk(b" world", &mut out).unwrap();
        encode_final(&mut out).unwrap();
        let (body, _, _) = decode_all(out.as_slice());
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn hex_sizes_format_correctly() {
        let mut out = ByteBuf64::new();
        let data = vec![b'x'; 255];
        encode_chunk(&data, &mut out).unwrap();
        assert!(out.as_slice().starts_with(b"ff\r\n"));
    }

    quickcheck::quickcheck! {
        fn random_chunks_decode_to_their_concatenation(chunks: Vec<Vec<u8>>) -> bool {
            let mut wire = ByteBuf64::new();
            let mut expected = Vec::new();
            for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
                encode_chunk(chunk, &mut wire).unwrap();
                expected.extend_from_slice(chunk);
            }
            encode_final(&mut wire).unwrap();

            let mut decoder = ChunkedDecoder::new();
            let mut out = ByteBuf64::new();
            let (consumed, progress) = decoder.decode(wire.as_slice(), &mut out, u64::MAX).unwrap();
            consumed == wire.len()
                && progress == ChunkProgress::Done
                && out.as_slice() == expected.as_slice()
        }

        fn random_feed_boundaries_do_not_matter(payload: Vec<u8>, split: usize) -> bool {
            if payload.is_empty() {
                return true;
            }
            let mut wire = ByteBuf64::new();
            encode_chunk(&payload, &mut wire).unwrap();
            encode_final(&mut wire).unwrap();

            let split = (split % wire.len()).max(1);
            let mut decoder = ChunkedDecoder::new();
            let mut out = ByteBuf64::new();
            let mut offset = 0;
            for piece in wire.as_slice().chunks(split) {
                let (consumed, _) = decoder.decode(piece, &mut out, u64::MAX).unwrap();
                offset += consumed;
            }
            offset == wire.len() && out.as_slice() == payload.as_slice()
        }
    }
}
