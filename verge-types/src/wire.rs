//! Vendor UDP datagram layout.
//!
//! One datagram is `BLOCKS_PER_PACKET` data blocks followed by a fixed tail.
//! Each block starts with the `0xFFEE` preamble and a little-endian azimuth
//! in hundredths of a degree, then `CHANNELS_PER_BLOCK` channel records of a
//! little-endian u16 distance (5 mm units) and a u8 intensity. The tail
//! carries the GPS timestamp and the 16-bit motor speed. Some firmware
//! revisions append a 4-byte outer sequence counter; both variants must be
//! accepted.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::RING_COUNT;

pub const BLOCKS_PER_PACKET: usize = 12;
/// Two firings of the 16 rings per block.
pub const CHANNELS_PER_BLOCK: usize = 32;
pub const BLOCK_PREAMBLE: u16 = 0xFFEE;
pub const CHANNEL_LEN: usize = 3;
pub const BLOCK_LEN: usize = 4 + CHANNELS_PER_BLOCK * CHANNEL_LEN;
pub const DATA_LEN: usize = BLOCKS_PER_PACKET * BLOCK_LEN;
pub const TAIL_LEN: usize = 62;
/// Datagram length without the outer sequence trailer.
pub const PACKET_LEN: usize = DATA_LEN + TAIL_LEN;
/// Optional outer sequence field appended by some firmware revisions.
pub const SEQUENCE_TRAILER_LEN: usize = 4;

/// Distance fixed-point unit, meters.
pub const DISTANCE_UNIT_M: f32 = 0.005;
/// Raw distance value meaning "no return".
pub const DISTANCE_INVALID: u16 = 0xFFFF;
/// Raw distance value meaning "return beyond maximum range".
pub const DISTANCE_OVER_RANGE: u16 = 0xFFFE;

// Tail layout, offsets relative to DATA_LEN.
const TAIL_GPS_TIMESTAMP_OFFSET: usize = 0;
const TAIL_MOTOR_RPM_OFFSET: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("bad datagram length {len}")]
    BadLength { len: usize },
    #[error("block {block} preamble {value:#06x} != {BLOCK_PREAMBLE:#06x}")]
    BadPreamble { block: usize, value: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChannel {
    pub distance_raw: u16,
    pub intensity: u8,
}

impl RawChannel {
    pub const NO_RETURN: RawChannel = RawChannel {
        distance_raw: DISTANCE_INVALID,
        intensity: 0,
    };

    /// Distance in meters, or `None` for no-return and over-range codes.
    #[inline]
    pub fn distance_m(&self) -> Option<f32> {
        match self.distance_raw {
            DISTANCE_INVALID | DISTANCE_OVER_RANGE => None,
            0 => None,
            raw => Some(raw as f32 * DISTANCE_UNIT_M),
        }
    }
}

/// Encode a distance in meters into the wire fixed-point representation.
///
/// Zero and negative distances encode as no-return; distances beyond the
/// encodable range encode as over-range.
#[inline]
pub fn encode_distance_m(distance_m: f32) -> u16 {
    if distance_m <= 0.0 || !distance_m.is_finite() {
        return DISTANCE_INVALID;
    }
    let units = (distance_m / DISTANCE_UNIT_M).round();
    if units >= DISTANCE_OVER_RANGE as f32 {
        DISTANCE_OVER_RANGE
    } else {
        units as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    /// Azimuth of the first firing in this block, hundredths of a degree.
    pub azimuth_centideg: u16,
    pub channels: Vec<RawChannel>,
}

impl RawBlock {
    pub fn empty(azimuth_centideg: u16) -> Self {
        RawBlock {
            azimuth_centideg,
            channels: vec![RawChannel::NO_RETURN; CHANNELS_PER_BLOCK],
        }
    }

    /// Ring index for a channel slot. Channels are two interleaved firings
    /// of the ring table.
    #[inline]
    pub fn ring_for_channel(channel: usize) -> u8 {
        (channel % RING_COUNT) as u8
    }

    /// Firing index (0 or 1) for a channel slot.
    #[inline]
    pub fn firing_for_channel(channel: usize) -> usize {
        channel / RING_COUNT
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPacket {
    pub blocks: Vec<RawBlock>,
    pub gps_timestamp_ns: u64,
    pub motor_rpm: u16,
    /// Outer sequence counter, present on some firmware revisions.
    pub sequence: Option<u32>,
}

impl RawPacket {
    /// Decode one datagram. Tolerates the optional 4-byte sequence trailer.
    pub fn decode(buf: &[u8]) -> Result<RawPacket, WireError> {
        let sequence = match buf.len() {
            PACKET_LEN => None,
            len if len == PACKET_LEN + SEQUENCE_TRAILER_LEN => {
                Some(LittleEndian::read_u32(&buf[PACKET_LEN..]))
            }
            len => return Err(WireError::BadLength { len }),
        };

        let mut blocks = Vec::with_capacity(BLOCKS_PER_PACKET);
        for block_idx in 0..BLOCKS_PER_PACKET {
            let base = block_idx * BLOCK_LEN;
            let preamble = LittleEndian::read_u16(&buf[base..]);
            if preamble != BLOCK_PREAMBLE {
                return Err(WireError::BadPreamble {
                    block: block_idx,
                    value: preamble,
                });
            }
            let azimuth_centideg = LittleEndian::read_u16(&buf[base + 2..]);
            let mut channels = Vec::with_capacity(CHANNELS_PER_BLOCK);
            for ch in 0..CHANNELS_PER_BLOCK {
                let off = base + 4 + ch * CHANNEL_LEN;
                channels.push(RawChannel {
                    distance_raw: LittleEndian::read_u16(&buf[off..]),
                    intensity: buf[off + 2],
                });
            }
            blocks.push(RawBlock {
                azimuth_centideg,
                channels,
            });
        }

        let tail = &buf[DATA_LEN..];
        let gps_timestamp_ns = LittleEndian::read_u64(&tail[TAIL_GPS_TIMESTAMP_OFFSET..]);
        let motor_rpm = LittleEndian::read_u16(&tail[TAIL_MOTOR_RPM_OFFSET..]);

        Ok(RawPacket {
            blocks,
            gps_timestamp_ns,
            motor_rpm,
            sequence,
        })
    }

    /// Encode into the wire layout. Blocks beyond `BLOCKS_PER_PACKET` are
    /// ignored; missing blocks are padded with no-return channels.
    pub fn encode(&self) -> Vec<u8> {
        let len = if self.sequence.is_some() {
            PACKET_LEN + SEQUENCE_TRAILER_LEN
        } else {
            PACKET_LEN
        };
        let mut buf = vec![0u8; len];

        for block_idx in 0..BLOCKS_PER_PACKET {
            let base = block_idx * BLOCK_LEN;
            LittleEndian::write_u16(&mut buf[base..], BLOCK_PREAMBLE);
            let (azimuth, channels) = match self.blocks.get(block_idx) {
                Some(b) => (b.azimuth_centideg, &b.channels[..]),
                None => (0, &[][..]),
            };
            LittleEndian::write_u16(&mut buf[base + 2..], azimuth);
            for ch in 0..CHANNELS_PER_BLOCK {
                let off = base + 4 + ch * CHANNEL_LEN;
                let channel = channels.get(ch).copied().unwrap_or(RawChannel::NO_RETURN);
                LittleEndian::write_u16(&mut buf[off..], channel.distance_raw);
                buf[off + 2] = channel.intensity;
            }
        }

        let tail = &mut buf[DATA_LEN..];
        LittleEndian::write_u64(&mut tail[TAIL_GPS_TIMESTAMP_OFFSET..], self.gps_timestamp_ns);
        LittleEndian::write_u16(&mut tail[TAIL_MOTOR_RPM_OFFSET..], self.motor_rpm);
        if let Some(seq) = self.sequence {
            LittleEndian::write_u32(&mut buf[PACKET_LEN..], seq);
        }
        buf
    }
}

/// Regroup polar returns into wire packets, for foreground re-emission.
///
/// Points sharing a block azimuth are packed into one block, placed at the
/// channel slot of their ring (second firing group when the first is
/// taken); remaining slots stay no-return. Blocks are packed twelve to a
/// packet in input order.
pub fn foreground_packets(
    points: &[crate::PointPolar],
    gps_timestamp_ns: u64,
    motor_rpm: u16,
) -> Vec<RawPacket> {
    let mut blocks: Vec<RawBlock> = Vec::new();
    for pt in points {
        let channel = RawChannel {
            distance_raw: encode_distance_m(pt.distance_m),
            intensity: pt.intensity,
        };
        let slot0 = pt.ring as usize;
        let slot1 = slot0 + RING_COUNT;

        let reuse = blocks
            .last_mut()
            .filter(|b| b.azimuth_centideg == pt.block_azimuth)
            .and_then(|b| {
                for slot in [slot0, slot1] {
                    if b.channels[slot] == RawChannel::NO_RETURN {
                        b.channels[slot] = channel;
                        return Some(());
                    }
                }
                None
            });
        if reuse.is_none() {
            let mut block = RawBlock::empty(pt.block_azimuth);
            block.channels[slot0] = channel;
            blocks.push(block);
        }
    }

    blocks
        .chunks(BLOCKS_PER_PACKET)
        .map(|chunk| RawPacket {
            blocks: chunk.to_vec(),
            gps_timestamp_ns,
            motor_rpm,
            sequence: None,
        })
        .collect()
}
