//! Delimiter Framing: Byte Stream → Text Messages
//!
//! Prinsip desain:
//! - Per-connection buffer: bytes yang belum lengkap tetap disimpan
//! - Lazy extraction: satu frame per delimiter, tanpa blocking
//! - Scan sekali: posisi scan disimpan, data lama tidak di-scan ulang
//!
//! Layout di wire:
//! ┌──────────────────────┬───┬──────────────────────┬───┐
//! │ UTF-8 payload        │ \n│ UTF-8 payload        │ \n│ ...
//! └──────────────────────┴───┴──────────────────────┴───┘
//!
//! Tidak ada length prefix dan tidak ada escaping.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Delimiter default (line-feed)
pub const DEFAULT_DELIMITER: u8 = b'\n';

/// Batas default untuk satu frame (1MB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Kegagalan per-frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Frame bukan UTF-8 valid. Frame dibuang, koneksi tetap terbuka.
    #[error("frame of {len} bytes is not valid UTF-8 (at byte {valid_up_to})")]
    InvalidUtf8 { len: usize, valid_up_to: usize },
    /// Frame (atau prefix yang belum ada delimiter-nya) melewati batas.
    #[error("frame of at least {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },
}

/// Per-connection frame decoder
///
/// Menyimpan FrameBuffer dan memecahnya berdasarkan satu delimiter byte.
/// Delimiter ditetapkan sekali saat konstruksi.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    delimiter: u8,
    max_frame_length: Option<usize>,
    /// Offset di buffer yang sudah di-scan tanpa menemukan delimiter
    scanned: usize,
    /// Sisa frame yang melewati batas dibuang sampai delimiter berikutnya
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl FrameDecoder {
    /// Membuat decoder dengan delimiter tertentu dan batas default
    pub fn new(delimiter: u8) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            delimiter,
            max_frame_length: Some(DEFAULT_MAX_FRAME_LENGTH),
            scanned: 0,
            discarding: false,
        }
    }

    /// Set batas panjang frame. `None` = tanpa batas.
    pub fn with_max_frame_length(mut self, max: Option<usize>) -> Self {
        self.max_frame_length = max;
        self
    }

    #[inline(always)]
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// Bytes yang sudah diterima tapi belum menjadi frame
    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append chunk ke FrameBuffer dan kembalikan iterator frame lengkap.
    ///
    /// Iterator bersifat lazy: frame yang tidak diambil tetap di buffer
    /// dan akan muncul lagi pada `feed` berikutnya.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buffer.put_slice(bytes);
        Frames { decoder: self }
    }

    fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        if self.discarding && !self.skip_discarded() {
            return None;
        }

        let hit = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == self.delimiter)
            .map(|offset| self.scanned + offset);

        let Some(end) = hit else {
            self.scanned = self.buffer.len();
            return self.check_unterminated();
        };

        let frame = self.buffer.split_to(end);
        self.buffer.advance(1);
        self.scanned = 0;

        if let Some(max) = self.max_frame_length {
            if frame.len() > max {
                return Some(Err(FrameError::FrameTooLong {
                    len: frame.len(),
                    max,
                }));
            }
        }

        Some(decode_utf8(frame))
    }

    /// Prefix tanpa delimiter yang terlalu panjang dibuang seluruhnya,
    /// begitu juga sisanya sampai delimiter berikutnya
    fn check_unterminated(&mut self) -> Option<Result<String, FrameError>> {
        let max = self.max_frame_length?;
        if self.buffer.len() <= max {
            return None;
        }

        let len = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;
        self.discarding = true;
        Some(Err(FrameError::FrameTooLong { len, max }))
    }

    /// Returns `true` jika delimiter penutup frame yang dibuang sudah lewat
    fn skip_discarded(&mut self) -> bool {
        match self.buffer.iter().position(|&b| b == self.delimiter) {
            Some(end) => {
                self.buffer.advance(end + 1);
                self.discarding = false;
                true
            }
            None => {
                self.buffer.clear();
                false
            }
        }
    }
}

fn decode_utf8(frame: BytesMut) -> Result<String, FrameError> {
    let len = frame.len();
    String::from_utf8(frame.to_vec()).map_err(|e| FrameError::InvalidUtf8 {
        len,
        valid_up_to: e.utf8_error().valid_up_to(),
    })
}

/// Iterator frame hasil satu `feed`
#[derive(Debug)]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<String, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

/// Encoder untuk pesan keluar
///
/// Buffer internal dipakai ulang; setiap frame di-split sebagai `Bytes`
/// sehingga bisa dikirim ke worker lain tanpa copy tambahan.
#[derive(Debug)]
pub struct FrameEncoder {
    buffer: BytesMut,
    delimiter: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl FrameEncoder {
    pub fn new(delimiter: u8) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            delimiter,
        }
    }

    /// Encode satu pesan: payload + delimiter
    ///
    /// Delimiter di dalam `message` tidak di-escape; penerima akan melihatnya
    /// sebagai batas frame.
    #[inline]
    pub fn encode(&mut self, message: &str) -> Bytes {
        self.buffer.reserve(message.len() + 1);
        self.buffer.put_slice(message.as_bytes());
        self.buffer.put_u8(self.delimiter);
        self.buffer.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(decoder: &mut FrameDecoder, chunk: &[u8]) -> Vec<Result<String, FrameError>> {
        decoder.feed(chunk).collect()
    }

    #[test]
    fn test_split_message_across_feeds() {
        let mut decoder = FrameDecoder::default();

        assert!(collect(&mut decoder, b"hel").is_empty());
        assert_eq!(decoder.buffered(), 3);

        let frames = collect(&mut decoder, b"lo\n");
        assert_eq!(frames, vec![Ok("hello".to_string())]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_single_chunk() {
        let mut decoder = FrameDecoder::default();
        let frames = collect(&mut decoder, b"a\nbb\nccc\npartial");

        assert_eq!(
            frames,
            vec![Ok("a".into()), Ok("bb".into()), Ok("ccc".into())]
        );
        assert_eq!(decoder.buffered(), "partial".len());
    }

    #[test]
    fn test_empty_lines_are_frames() {
        let mut decoder = FrameDecoder::default();
        let frames = collect(&mut decoder, b"\n\nx\n");

        assert_eq!(
            frames,
            vec![Ok(String::new()), Ok(String::new()), Ok("x".into())]
        );
    }

    #[test]
    fn test_invalid_utf8_dropped_stream_continues() {
        let mut decoder = FrameDecoder::default();
        let frames = collect(&mut decoder, b"ok\n\xff\xfe\nafter\n");

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Ok("ok".into()));
        assert_eq!(
            frames[1],
            Err(FrameError::InvalidUtf8 {
                len: 2,
                valid_up_to: 0
            })
        );
        assert_eq!(frames[2], Ok("after".into()));
    }

    #[test]
    fn test_custom_delimiter() {
        let mut decoder = FrameDecoder::new(b'|');
        let frames = collect(&mut decoder, b"one|two\n|");

        assert_eq!(frames, vec![Ok("one".into()), Ok("two\n".into())]);
    }

    #[test]
    fn test_unread_frames_survive_until_next_feed() {
        let mut decoder = FrameDecoder::default();

        let first = decoder.feed(b"a\nb\n").next();
        assert_eq!(first, Some(Ok("a".into())));

        let rest = collect(&mut decoder, b"c\n");
        assert_eq!(rest, vec![Ok("b".into()), Ok("c".into())]);
    }

    #[test]
    fn test_unterminated_prefix_over_limit() {
        let mut decoder = FrameDecoder::default().with_max_frame_length(Some(4));

        assert!(collect(&mut decoder, b"abcd").is_empty());
        let frames = collect(&mut decoder, b"e");
        assert_eq!(frames, vec![Err(FrameError::FrameTooLong { len: 5, max: 4 })]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_overflowed_frame_tail_is_not_a_message() {
        let mut decoder = FrameDecoder::default().with_max_frame_length(Some(4));

        let frames = collect(&mut decoder, b"abcde");
        assert_eq!(frames, vec![Err(FrameError::FrameTooLong { len: 5, max: 4 })]);

        // Sisa frame yang sama datang di beberapa chunk
        assert!(collect(&mut decoder, b"fgh").is_empty());
        assert_eq!(decoder.buffered(), 0);
        assert!(collect(&mut decoder, b"ijklmnop").is_empty());

        let frames = collect(&mut decoder, b"qr\nok\n");
        assert_eq!(frames, vec![Ok("ok".into())]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_overflow_then_delimiter_in_same_chunk() {
        let mut decoder = FrameDecoder::default().with_max_frame_length(Some(4));

        assert!(collect(&mut decoder, b"abc").is_empty());
        let frames = collect(&mut decoder, b"defgh\nnext\n");
        assert_eq!(
            frames,
            vec![
                Err(FrameError::FrameTooLong { len: 8, max: 4 }),
                Ok("next".into())
            ]
        );
    }

    #[test]
    fn test_terminated_frame_over_limit() {
        let mut decoder = FrameDecoder::default().with_max_frame_length(Some(2));
        let frames = collect(&mut decoder, b"abc\nok\n");

        assert_eq!(
            frames,
            vec![
                Err(FrameError::FrameTooLong { len: 3, max: 2 }),
                Ok("ok".into())
            ]
        );
    }

    #[test]
    fn test_unbounded_when_limit_disabled() {
        let mut decoder = FrameDecoder::default().with_max_frame_length(None);
        let big = vec![b'x'; 3 * DEFAULT_MAX_FRAME_LENGTH];

        assert!(collect(&mut decoder, &big).is_empty());
        assert_eq!(decoder.buffered(), big.len());
    }

    proptest::proptest! {
        // k delimiter → tepat k frame, berapapun pembagian chunk-nya
        #[test]
        fn prop_chunking_does_not_change_frames(
            lines in proptest::collection::vec("[a-z0-9 ]{0,12}", 0..16),
            tail in "[a-z]{0,5}",
            cuts in proptest::collection::vec(0usize..256, 0..10),
        ) {
            let mut stream = Vec::new();
            for line in &lines {
                stream.extend_from_slice(line.as_bytes());
                stream.push(b'\n');
            }
            stream.extend_from_slice(tail.as_bytes());

            let mut points: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
            points.sort_unstable();

            let mut decoder = FrameDecoder::default();
            let mut frames = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(stream.len())) {
                frames.extend(decoder.feed(&stream[start..point]));
                start = point;
            }

            let expected: Vec<Result<String, FrameError>> =
                lines.iter().cloned().map(Ok).collect();
            proptest::prop_assert_eq!(frames, expected);
            proptest::prop_assert_eq!(decoder.buffered(), tail.len());
        }
    }

    #[test]
    fn test_encoder_appends_delimiter() {
        let mut encoder = FrameEncoder::default();
        assert_eq!(&encoder.encode("hello")[..], b"hello\n");
        assert_eq!(&encoder.encode("")[..], b"\n");

        let mut encoder = FrameEncoder::new(0);
        assert_eq!(&encoder.encode("z")[..], b"z\0");
    }
}
