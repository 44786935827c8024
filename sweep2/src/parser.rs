use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use verge_types::wire::{RawBlock, RawPacket, BLOCKS_PER_PACKET};
use verge_types::{PointPolar, RingCalibration};

use crate::Result;

/// Nanoseconds between successive block firings at nominal motor speed.
const BLOCK_CYCLE_NS: i64 = 55_296;
/// Nanoseconds between the two firing groups within one block.
const FIRING_CYCLE_NS: i64 = BLOCK_CYCLE_NS / 2;

/// Decodes vendor datagrams into polar returns.
///
/// The parser owns the per-ring elevation calibration and exposes the most
/// recent motor-speed reading; both are read by the frame builder. Parse
/// failures are counted here and the datagram is dropped; the listener
/// keeps running.
#[derive(Debug)]
pub struct PacketParser {
    calibration: RingCalibration,
    last_motor_speed_rpm: AtomicU32,
    parse_errors: AtomicU64,
    packets_parsed: AtomicU64,
}

/// Decoded contents of one datagram.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub points: Vec<PointPolar>,
    pub motor_rpm: u16,
    pub gps_timestamp_ns: u64,
    pub sequence: Option<u32>,
}

impl PacketParser {
    pub fn new(calibration: RingCalibration) -> Self {
        PacketParser {
            calibration,
            last_motor_speed_rpm: AtomicU32::new(0),
            parse_errors: AtomicU64::new(0),
            packets_parsed: AtomicU64::new(0),
        }
    }

    pub fn calibration(&self) -> &RingCalibration {
        &self.calibration
    }

    /// Most recent motor-speed reading, RPM. Zero until the first packet.
    pub fn last_motor_speed_rpm(&self) -> u16 {
        self.last_motor_speed_rpm.load(Ordering::Relaxed) as u16
    }

    pub fn parse_error_count(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn packets_parsed(&self) -> u64 {
        self.packets_parsed.load(Ordering::Relaxed)
    }

    /// Decode one datagram into polar returns.
    ///
    /// Channels with no return are skipped. Azimuth for the second firing
    /// group of each block is interpolated halfway to the next block's
    /// azimuth.
    pub fn parse_datagram(&self, buf: &[u8]) -> Result<ParsedPacket> {
        let raw = match RawPacket::decode(buf) {
            Ok(raw) => raw,
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        self.last_motor_speed_rpm
            .store(raw.motor_rpm as u32, Ordering::Relaxed);
        self.packets_parsed.fetch_add(1, Ordering::Relaxed);

        let base_ns = raw.gps_timestamp_ns as i64;
        let mut points = Vec::with_capacity(BLOCKS_PER_PACKET * 8);
        let mut prev_delta_centideg: u16 = 0;

        for (block_idx, block) in raw.blocks.iter().enumerate() {
            // Azimuth step to the next block, used to interpolate the
            // second firing group.
            let delta_centideg = match raw.blocks.get(block_idx + 1) {
                Some(next) => {
                    ((next.azimuth_centideg as i32 - block.azimuth_centideg as i32)
                        .rem_euclid(36_000)) as u16
                }
                None => prev_delta_centideg,
            };
            prev_delta_centideg = delta_centideg;

            for (channel_idx, channel) in block.channels.iter().enumerate() {
                let distance_m = match channel.distance_m() {
                    Some(d) => d,
                    None => continue,
                };
                let ring = RawBlock::ring_for_channel(channel_idx);
                let firing = RawBlock::firing_for_channel(channel_idx);

                let azimuth_centideg = block.azimuth_centideg as u32
                    + (firing as u32 * delta_centideg as u32) / 2;
                let azimuth_deg = (azimuth_centideg % 36_000) as f32 / 100.0;

                points.push(PointPolar {
                    ring,
                    azimuth_deg,
                    distance_m,
                    intensity: channel.intensity,
                    timestamp_ns: base_ns
                        + block_idx as i64 * BLOCK_CYCLE_NS
                        + firing as i64 * FIRING_CYCLE_NS,
                    block_azimuth: block.azimuth_centideg,
                });
            }
        }

        Ok(ParsedPacket {
            points,
            motor_rpm: raw.motor_rpm,
            gps_timestamp_ns: raw.gps_timestamp_ns,
            sequence: raw.sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_types::wire::{RawChannel, RawPacket, CHANNELS_PER_BLOCK, PACKET_LEN};
    use verge_types::RING_COUNT;

    fn packet_with_rpm(rpm: u16) -> Vec<u8> {
        let mut blocks = Vec::new();
        for i in 0..BLOCKS_PER_PACKET {
            let mut block = RawBlock::empty((i as u16) * 40);
            for ch in 0..CHANNELS_PER_BLOCK {
                block.channels[ch] = RawChannel {
                    distance_raw: 4000,
                    intensity: 10,
                };
            }
            blocks.push(block);
        }
        RawPacket {
            blocks,
            gps_timestamp_ns: 1_000_000,
            motor_rpm: rpm,
            sequence: None,
        }
        .encode()
    }

    #[test]
    fn full_packet_yields_all_returns() {
        let parser = PacketParser::new(RingCalibration::sr16());
        let parsed = parser.parse_datagram(&packet_with_rpm(600)).unwrap();
        assert_eq!(parsed.points.len(), BLOCKS_PER_PACKET * CHANNELS_PER_BLOCK);
        assert_eq!(parsed.motor_rpm, 600);
        assert_eq!(parser.last_motor_speed_rpm(), 600);

        // Rings cycle through both firing groups.
        assert_eq!(parsed.points[0].ring, 0);
        assert_eq!(parsed.points[RING_COUNT].ring, 0);
        assert_eq!(parsed.points[RING_COUNT - 1].ring, (RING_COUNT - 1) as u8);

        // Timestamps are monotonic non-decreasing in firing order.
        for pair in parsed.points.windows(2) {
            assert!(pair[1].timestamp_ns >= pair[0].timestamp_ns);
        }
    }

    #[test]
    fn second_firing_azimuth_is_interpolated() {
        let parser = PacketParser::new(RingCalibration::sr16());
        let parsed = parser.parse_datagram(&packet_with_rpm(600)).unwrap();
        // Block 0 at 0.00 deg, block 1 at 0.40 deg: second firing of block
        // 0 sits halfway.
        let first_firing = &parsed.points[0];
        let second_firing = &parsed.points[RING_COUNT];
        assert_eq!(first_firing.azimuth_deg, 0.0);
        assert_eq!(second_firing.azimuth_deg, 0.2);
    }

    #[test]
    fn corrupt_datagram_counts_and_errors() {
        let parser = PacketParser::new(RingCalibration::sr16());
        let mut buf = packet_with_rpm(600);
        buf.truncate(PACKET_LEN - 10);
        assert!(parser.parse_datagram(&buf).is_err());
        assert_eq!(parser.parse_error_count(), 1);
        assert_eq!(parser.packets_parsed(), 0);
    }
}
