//! Frame encoding and streaming decode.
//!
//! The decoder operates on an append-only receive buffer: it extracts as
//! many complete frames as the buffer holds and trims the consumed prefix,
//! leaving any partial tail for the next delivery. Bytes preceding a header
//! occurrence are reported through the garbage callback; devices use that
//! side channel for plain ASCII banners and diagnostics.

use byteorder::{ByteOrder, LittleEndian};

use super::{A1Item, AckCode, Frame, FrameType, HEADER};

/// Header(4) + type(1) + length(2): bytes needed before LEN can be read.
const PREFIX_LEN: usize = 7;

/// Compute the CHECK byte: low 8 bits of the sum over TYPE, LEN, SEQ, VAL.
pub fn calc_check(frame_type: u8, length: u16, seq: u16, val: &[u8]) -> u8 {
    let mut sum = u32::from(frame_type);
    sum += u32::from(length & 0xFF) + u32::from(length >> 8);
    sum += u32::from(seq & 0xFF) + u32::from(seq >> 8);
    sum += val.iter().map(|&b| u32::from(b)).sum::<u32>();
    (sum & 0xFF) as u8
}

/// Encode a frame into its wire representation.
///
/// Deterministic and infallible for well-formed frames.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let length = (2 + frame.val.len() + 1) as u16;
    let check = calc_check(frame.frame_type as u8, length, frame.seq, &frame.val);
    let mut out = Vec::with_capacity(HEADER.len() + 3 + usize::from(length));
    out.extend_from_slice(&HEADER);
    out.push(frame.frame_type as u8);
    let mut field = [0u8; 2];
    LittleEndian::write_u16(&mut field, length);
    out.extend_from_slice(&field);
    LittleEndian::write_u16(&mut field, frame.seq);
    out.extend_from_slice(&field);
    out.extend_from_slice(&frame.val);
    out.push(check);
    out
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER.len()).position(|w| w == HEADER)
}

/// Extract every complete frame from `buf`, trimming consumed bytes.
///
/// `on_error` receives the ack code and the (possibly zero) sequence of each
/// malformed frame; `on_garbage` receives non-protocol bytes preceding each
/// header. Malformed frames are skipped entirely and decoding resumes at the
/// next header.
pub fn decode_stream<E, G>(buf: &mut Vec<u8>, mut on_error: E, mut on_garbage: G) -> Vec<Frame>
where
    E: FnMut(AckCode, u16),
    G: FnMut(&[u8]),
{
    let mut frames = Vec::new();
    loop {
        match find_header(buf) {
            None => {
                // No header anywhere: the whole buffer is stray bytes.
                if !buf.is_empty() {
                    on_garbage(buf);
                    buf.clear();
                }
                break;
            }
            Some(0) => {}
            Some(idx) => {
                on_garbage(&buf[..idx]);
                buf.drain(..idx);
            }
        }
        if buf.len() < PREFIX_LEN {
            break;
        }
        let raw_type = buf[4];
        let length = usize::from(LittleEndian::read_u16(&buf[5..7]));
        if length < 3 {
            // LEN cannot even cover SEQ + CHECK.
            let seq = if buf.len() >= 9 {
                LittleEndian::read_u16(&buf[7..9])
            } else {
                0
            };
            on_error(AckCode::LenError, seq);
            let total_bad = PREFIX_LEN + length;
            if buf.len() >= total_bad {
                buf.drain(..total_bad);
            } else {
                // Not enough buffered to skip the claimed span; drop the
                // header so the scan cannot loop on the same offset.
                buf.drain(..HEADER.len());
            }
            continue;
        }
        let total = PREFIX_LEN + length;
        if buf.len() < total {
            break;
        }
        let seq = LittleEndian::read_u16(&buf[7..9]);
        let val_len = length - 3;
        let val = buf[9..9 + val_len].to_vec();
        let check = buf[9 + val_len];
        if check != calc_check(raw_type, length as u16, seq, &val) {
            on_error(AckCode::ChecksumError, seq);
        } else {
            match FrameType::from_u8(raw_type) {
                None => on_error(AckCode::UnknownType, seq),
                Some(frame_type) => {
                    let shape_ok = match frame_type {
                        FrameType::A0 | FrameType::B0 | FrameType::B1 => val_len == 0,
                        FrameType::Af | FrameType::Bf => val_len == 1,
                        FrameType::A1 => val_len % 2 == 0,
                    };
                    if shape_ok {
                        frames.push(Frame {
                            frame_type,
                            seq,
                            val,
                        });
                    } else {
                        on_error(AckCode::ValError, seq);
                    }
                }
            }
        }
        // Skip the frame whether it validated or not.
        buf.drain(..total);
    }
    frames
}

/// Build a host heartbeat frame.
pub fn build_a0(seq: u16) -> Frame {
    Frame {
        frame_type: FrameType::A0,
        seq,
        val: Vec::new(),
    }
}

/// Build a host acknowledgement frame carrying a single result code byte.
pub fn build_af(seq: u16, code: AckCode) -> Frame {
    Frame {
        frame_type: FrameType::Af,
        seq,
        val: vec![code.wire()],
    }
}

/// Build an A1 command frame from LED indices and optional attributes.
///
/// Each item packs to a little-endian u16 per the [`A1Item`] bitfield.
/// `attrs` bit0 maps to the blink flag; `colors` carry 0/1/2 for R/G/B.
/// Absent or short slices default the remaining items to zero.
pub fn build_a1(indices: &[u16], seq: u16, attrs: Option<&[u8]>, colors: Option<&[u8]>) -> Frame {
    let mut val = Vec::with_capacity(indices.len() * 2);
    for (i, &led_id) in indices.iter().enumerate() {
        let blink = attrs.is_some_and(|a| a.get(i).is_some_and(|&b| b & 0x01 != 0));
        let color = colors.and_then(|c| c.get(i).copied()).unwrap_or(0);
        let item = A1Item {
            led_id,
            blink,
            color,
        };
        let mut field = [0u8; 2];
        LittleEndian::write_u16(&mut field, item.pack());
        val.extend_from_slice(&field);
    }
    Frame {
        frame_type: FrameType::A1,
        seq,
        val,
    }
}
