/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::debug;

use crate::error::{Error, Result};
use crate::sprd::checksum::ChecksumMode;

/// Frame delimiter.
pub const FLAG: u8 = 0x7E;
/// Escape introducer.
pub const ESCAPE: u8 = 0x7D;
/// `0x7E` inside a frame becomes `0x7D 0x5E`.
pub const ESCAPED_FLAG: u8 = 0x5E;
/// `0x7D` inside a frame becomes `0x7D 0x5D`.
pub const ESCAPED_ESCAPE: u8 = 0x5D;

/// Escapes delimiter and escape bytes so the frame interior never contains a
/// raw 0x7E or 0x7D.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());

    for &byte in data {
        match byte {
            FLAG => out.extend_from_slice(&[ESCAPE, ESCAPED_FLAG]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            _ => out.push(byte),
        }
    }

    out
}

/// Exact inverse of [`escape`].
///
/// An escape byte followed by anything other than 0x5E/0x5D is kept
/// literally (both bytes), and a trailing unmatched escape byte is kept
/// as-is; real devices produce neither, and dropping bytes would only move
/// the failure into the checksum where it is harder to see.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied().peekable();

    while let Some(byte) = iter.next() {
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }

        match iter.peek() {
            Some(&ESCAPED_FLAG) => {
                iter.next();
                out.push(FLAG);
            }
            Some(&ESCAPED_ESCAPE) => {
                iter.next();
                out.push(ESCAPE);
            }
            // Not an escape sequence we know; keep the introducer and let
            // the following byte through on the next iteration.
            Some(_) => out.push(ESCAPE),
            None => out.push(ESCAPE),
        }
    }

    out
}

/// Builds `0x7E || escape(payload || checksum_be) || 0x7E`.
pub fn encode_frame(payload: &[u8], mode: ChecksumMode) -> Vec<u8> {
    let checksum = mode.compute(payload);

    let mut inner = Vec::with_capacity(payload.len() + 2);
    inner.extend_from_slice(payload);
    inner.extend_from_slice(&checksum.to_be_bytes());

    let mut frame = Vec::with_capacity(inner.len() + 2);
    frame.push(FLAG);
    frame.extend_from_slice(&escape(&inner));
    frame.push(FLAG);

    frame
}

/// Validates delimiters, unescapes the interior, verifies the checksum
/// trailer and returns the bare payload.
pub fn decode_frame(frame: &[u8], mode: ChecksumMode) -> Result<Vec<u8>> {
    if frame.len() < 2 {
        return Err(Error::framing(format!("Frame too short: {} bytes", frame.len())));
    }
    if frame[0] != FLAG || frame[frame.len() - 1] != FLAG {
        return Err(Error::framing("Frame is not delimited by 0x7E"));
    }

    let mut inner = unescape(&frame[1..frame.len() - 1]);
    if inner.len() < 2 {
        return Err(Error::framing("Frame interior shorter than its checksum"));
    }

    let trailer = inner.split_off(inner.len() - 2);
    let got = u16::from_be_bytes([trailer[0], trailer[1]]);
    let expected = mode.compute(&inner);

    if got != expected {
        debug!(
            "Frame checksum mismatch: expected 0x{:04X}, got 0x{:04X} ({} payload bytes)",
            expected,
            got,
            inner.len()
        );
        return Err(Error::ChecksumMismatch { expected, got });
    }

    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_replaces_flag_and_escape_bytes() {
        assert_eq!(escape(&[0x7E]), vec![0x7D, 0x5E]);
        assert_eq!(escape(&[0x7D]), vec![0x7D, 0x5D]);
        assert_eq!(escape(&[0x00, 0x7E, 0x01, 0x7D, 0x02]), vec![
            0x00, 0x7D, 0x5E, 0x01, 0x7D, 0x5D, 0x02
        ]);
    }

    #[test]
    fn unescape_is_inverse_of_escape() {
        let cases: [&[u8]; 5] = [
            &[],
            &[0x7E, 0x7D, 0x7E, 0x7E],
            &[0x00, 0x01, 0x02],
            &[0x7D, 0x5E],
            &[0x5D, 0x5E, 0x7D, 0x7E, 0xFF],
        ];

        for data in cases {
            assert_eq!(unescape(&escape(data)), data, "round trip failed for {:02X?}", data);
        }

        // Exhaustive over all two-byte sequences
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                let data = [a, b];
                assert_eq!(unescape(&escape(&data)), data);
            }
        }
    }

    #[test]
    fn unescape_keeps_unknown_escape_sequences_literally() {
        assert_eq!(unescape(&[0x7D, 0x00]), vec![0x7D, 0x00]);
        assert_eq!(unescape(&[0x01, 0x7D, 0xFF, 0x02]), vec![0x01, 0x7D, 0xFF, 0x02]);
    }

    #[test]
    fn unescape_keeps_trailing_escape() {
        assert_eq!(unescape(&[0x01, 0x7D]), vec![0x01, 0x7D]);
    }

    #[test]
    fn frame_round_trips_in_both_modes() {
        let payloads: [&[u8]; 4] = [
            &[],
            &[0x00, 0x00, 0x00, 0x00],
            &[0x7E, 0x7D, 0x12, 0x34],
            &[0x00, 0x01, 0x00, 0x08, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00],
        ];

        for mode in [ChecksumMode::Xmodem, ChecksumMode::Fdl] {
            for payload in payloads {
                let frame = encode_frame(payload, mode);
                assert_eq!(frame.first(), Some(&FLAG));
                assert_eq!(frame.last(), Some(&FLAG));
                // Interior must be free of raw delimiters and escapes
                assert!(!frame[1..frame.len() - 1].iter().any(|&b| b == FLAG || b == ESCAPE));

                let decoded = decode_frame(&frame, mode).unwrap();
                assert_eq!(decoded, payload, "round trip failed in {:?}", mode);
            }
        }
    }

    #[test]
    fn single_byte_corruption_is_detected() {
        let payload = [0x00u8, 0x02, 0x04, 0x00, 0xAA, 0xBB, 0xCC, 0xDD];

        for mode in [ChecksumMode::Xmodem, ChecksumMode::Fdl] {
            let frame = encode_frame(&payload, mode);

            // Flip one bit of every byte between the delimiters
            for i in 1..frame.len() - 1 {
                let mut bad = frame.clone();
                bad[i] ^= 0x01;
                assert!(
                    matches!(
                        decode_frame(&bad, mode),
                        Err(Error::ChecksumMismatch { .. }) | Err(Error::Framing(_))
                    ),
                    "corruption at index {} went unnoticed in {:?}",
                    i,
                    mode
                );
            }
        }
    }

    #[test]
    fn decode_rejects_bad_delimiters() {
        assert!(matches!(decode_frame(&[], ChecksumMode::Xmodem), Err(Error::Framing(_))));
        assert!(matches!(decode_frame(&[0x7E], ChecksumMode::Xmodem), Err(Error::Framing(_))));
        assert!(matches!(
            decode_frame(&[0x00, 0x01, 0x02], ChecksumMode::Xmodem),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_interior() {
        // Valid delimiters but only one interior byte
        assert!(matches!(
            decode_frame(&[0x7E, 0x00, 0x7E], ChecksumMode::Xmodem),
            Err(Error::Framing(_))
        ));
    }
}
