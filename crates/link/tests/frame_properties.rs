//! Property tests for the frame codec invariants.

#![allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions

use link::{encode_frame, FrameDecoder, FrameError, END_BYTE};
use proptest::prelude::*;

fn decode_stream(bytes: &[u8]) -> (Vec<Vec<u8>>, Vec<FrameError>) {
    let mut dec: FrameDecoder<512> = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut errors = Vec::new();
    for &b in bytes {
        match dec.push(b) {
            Some(Ok(payload)) => frames.push(payload.to_vec()),
            Some(Err(e)) => errors.push(e),
            None => {}
        }
    }
    (frames, errors)
}

proptest! {
    /// Encode-then-decode of any payload yields exactly that payload.
    #[test]
    fn encode_decode_round_trip(payload in proptest::collection::vec(any::<u8>(), 1..200)) {
        let encoded = encode_frame::<512>(&payload).unwrap();
        let (frames, errors) = decode_stream(&encoded);
        prop_assert_eq!(frames, vec![payload]);
        prop_assert!(errors.is_empty());
    }

    /// Back-to-back frames each decode exactly once, in order.
    #[test]
    fn concatenated_frames_all_decode(
        payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..40), 1..8)
    ) {
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(&encode_frame::<512>(p).unwrap());
        }
        let (frames, errors) = decode_stream(&stream);
        prop_assert_eq!(frames, payloads);
        prop_assert!(errors.is_empty());
    }

    /// One decoded frame per closing END byte of a valid body; noise before a
    /// frame never produces a phantom frame.
    #[test]
    fn leading_noise_is_discarded(
        noise in proptest::collection::vec(any::<u8>(), 0..30),
        payload in proptest::collection::vec(any::<u8>(), 1..40),
    ) {
        let mut stream = noise.clone();
        // terminate the noise so the real frame starts from a clean slate
        stream.push(END_BYTE);
        stream.extend_from_slice(&encode_frame::<512>(&payload).unwrap());
        let (frames, _errors) = decode_stream(&stream);
        prop_assert_eq!(frames.last().cloned(), Some(payload));
    }

    /// A single corrupted body byte yields no frame and exactly one error.
    #[test]
    fn single_corruption_yields_single_error(
        payload in proptest::collection::vec(any::<u8>(), 2..40),
        flip in any::<u8>().prop_filter("non-zero flip", |f| *f != 0),
    ) {
        let mut encoded = encode_frame::<512>(&payload).unwrap().to_vec();
        // corrupt a body byte (skip START and END), avoiding creating a
        // reserved literal which would change the framing itself
        let idx = 1 + (usize::from(flip) % (encoded.len() - 2));
        let corrupted = encoded[idx] ^ flip;
        prop_assume!(!matches!(corrupted, 0xF1 | 0xFA | 0xFF));
        prop_assume!(!matches!(encoded[idx], 0xF1 | 0xFA | 0xFF));
        encoded[idx] = corrupted;
        let (frames, errors) = decode_stream(&encoded);
        prop_assert!(frames.is_empty());
        prop_assert_eq!(errors.len(), 1);
    }
}
