use crate::prelude::*;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

// Frames are short ASCII lines; anything longer without a terminator is line
// noise and gets thrown away.
const MAX_FRAME_LENGTH: usize = 1024;

/// Splits the serial byte stream on `\n`, dropping a trailing `\r` and empty
/// lines. Bytes of an incomplete frame stay in the buffer for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameDecoder {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = match src.iter().position(|b| *b == b'\n') {
                Some(offset) => offset,
                None => {
                    if src.len() > MAX_FRAME_LENGTH {
                        warn!("discarding {} bytes without a frame terminator", src.len());
                        src.clear();
                        self.discarding = true;
                    }
                    return Ok(None);
                }
            };

            let mut frame = src.split_to(newline + 1);
            frame.truncate(newline);
            if frame.last() == Some(&b'\r') {
                frame.truncate(frame.len() - 1);
            }

            if self.discarding {
                // tail end of an oversized frame
                self.discarding = false;
                continue;
            }

            if frame.is_empty() {
                continue;
            }

            return Ok(Some(frame));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                buf.advance(buf.len());
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, buf: &mut BytesMut) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(buf).unwrap() {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        frames
    }

    #[test]
    fn splits_and_strips() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&b"st 4 4 0 0 1m1\r\nadc 0.1 0.2 2m1\n"[..]);

        assert_eq!(
            decode_all(&mut decoder, &mut buf),
            vec!["st 4 4 0 0 1m1", "adc 0.1 0.2 2m1"]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_survive() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&b"tmpr 21 2"[..]);

        assert!(decode_all(&mut decoder, &mut buf).is_empty());
        buf.extend_from_slice(b"2 7m1\r\n");
        assert_eq!(decode_all(&mut decoder, &mut buf), vec!["tmpr 21 22 7m1"]);
    }

    #[test]
    fn skips_empty_lines() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&b"\r\n\n\r\nrply ok\r\n"[..]);

        assert_eq!(decode_all(&mut decoder, &mut buf), vec!["rply ok"]);
    }

    #[test]
    fn oversized_frames_are_dropped() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&vec![b'x'; MAX_FRAME_LENGTH + 1][..]);

        assert!(decode_all(&mut decoder, &mut buf).is_empty());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"xxxx\r\nrply ok\r\n");
        assert_eq!(decode_all(&mut decoder, &mut buf), vec!["rply ok"]);
    }
}
