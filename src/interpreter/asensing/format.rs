//! Asensing point-cloud packet layout
//!
//! All fields little-endian, tightly packed:
//!
//! ```text
//! Header (32 bytes)
//!   0  sob            [u8; 4]  AA 55 A5 5A
//!   4  version_major  u8
//!   5  version_minor  u8
//!   6  laser_num      u8       units per block
//!   7  block_num      u8       blocks per packet
//!   8  echo_count     u8
//!   9  return_mode    u8
//!  10  point_num      u32      points per frame, 0 when unknown
//!  14  frame_id       u16
//!  16  seq_num        u16
//!  18  utc            [u8; 6]  years since 1900, month (1-12), day, hour, minute, second
//!  24  timestamp_us   u32      microseconds within the UTC second
//!  28  points_per_pkt u16
//!  30  reserved       u16
//!
//! Block (2 + 9 * laser_num bytes), repeated block_num times
//!   0  time_offset_us u16      offset of the block from the header timestamp
//!   2  units          laser_num * Unit
//!
//! Unit (9 bytes)
//!   0  distance       u16      0.01 m
//!   2  azimuth        u16      0.01 degree, clockwise
//!   4  elevation      i16      0.01 degree
//!   6  intensity      u8
//!   7  reserved       u16
//!
//! Tail (8 bytes)
//!   0  crc            u32      not verified
//!   4  reserved       u32
//! ```

use chrono::NaiveDate;

pub const MAGIC: [u8; 4] = [0xAA, 0x55, 0xA5, 0x5A];
pub const HEADER_SIZE: usize = 32;
pub const BLOCK_HEADER_SIZE: usize = 2;
pub const UNIT_SIZE: usize = 9;
pub const TAIL_SIZE: usize = 8;

/// Meters per distance count
pub const DISTANCE_UNIT: f64 = 0.01;
/// Degrees per angle count
pub const ANGLE_UNIT: f64 = 0.01;

/// Size of a packet carrying `block_num` blocks of `laser_num` units.
pub const fn packet_size(laser_num: usize, block_num: usize) -> usize {
    HEADER_SIZE + block_num * (BLOCK_HEADER_SIZE + laser_num * UNIT_SIZE) + TAIL_SIZE
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsensingHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub laser_num: u8,
    pub block_num: u8,
    pub echo_count: u8,
    pub return_mode: u8,
    pub point_num: u32,
    pub frame_id: u16,
    pub seq_num: u16,
    pub utc: [u8; 6],
    pub timestamp_us: u32,
    pub points_per_packet: u16,
}

impl AsensingHeader {
    /// Parse the fixed header; `None` when too short or the magic is wrong.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let h = data.get(..HEADER_SIZE)?;
        if h[..4] != MAGIC {
            return None;
        }
        let mut utc = [0u8; 6];
        utc.copy_from_slice(&h[18..24]);
        Some(Self {
            version_major: h[4],
            version_minor: h[5],
            laser_num: h[6],
            block_num: h[7],
            echo_count: h[8],
            return_mode: h[9],
            point_num: u32::from_le_bytes([h[10], h[11], h[12], h[13]]),
            frame_id: u16_at(h, 14),
            seq_num: u16_at(h, 16),
            utc,
            timestamp_us: u32::from_le_bytes([h[24], h[25], h[26], h[27]]),
            points_per_packet: u16_at(h, 28),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&[
            self.version_major,
            self.version_minor,
            self.laser_num,
            self.block_num,
            self.echo_count,
            self.return_mode,
        ]);
        out.extend_from_slice(&self.point_num.to_le_bytes());
        out.extend_from_slice(&self.frame_id.to_le_bytes());
        out.extend_from_slice(&self.seq_num.to_le_bytes());
        out.extend_from_slice(&self.utc);
        out.extend_from_slice(&self.timestamp_us.to_le_bytes());
        out.extend_from_slice(&self.points_per_packet.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
    }

    /// Expected size of the whole packet described by this header.
    pub fn packet_size(&self) -> usize {
        packet_size(self.laser_num as usize, self.block_num as usize)
    }

    /// Sensor time in seconds since the Unix epoch, if the UTC fields form a valid date.
    pub fn data_time(&self) -> Option<f64> {
        let [year, month, day, hour, minute, second] = self.utc;
        let utc = NaiveDate::from_ymd_opt(1900 + year as i32, month as u32, day as u32)?
            .and_hms_opt(hour as u32, minute as u32, second as u32)?
            .and_utc();
        Some(utc.timestamp() as f64 + self.timestamp_us as f64 / 1e6)
    }
}

/// One laser return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unit {
    pub distance: u16,
    pub azimuth: u16,
    pub elevation: i16,
    pub intensity: u8,
}

impl Unit {
    fn parse(u: &[u8]) -> Self {
        Self {
            distance: u16_at(u, 0),
            azimuth: u16_at(u, 2),
            elevation: u16_at(u, 4) as i16,
            intensity: u[6],
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.distance.to_le_bytes());
        out.extend_from_slice(&self.azimuth.to_le_bytes());
        out.extend_from_slice(&self.elevation.to_le_bytes());
        out.push(self.intensity);
        out.extend_from_slice(&[0, 0]);
    }

    pub fn distance_m(&self) -> f64 {
        self.distance as f64 * DISTANCE_UNIT
    }
}

/// A validated packet: header plus borrowed block bytes.
#[derive(Debug, Clone, Copy)]
pub struct AsensingPacket<'a> {
    pub header: AsensingHeader,
    blocks: &'a [u8],
}

impl<'a> AsensingPacket<'a> {
    /// Parse a payload whose length matches its header exactly.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let header = AsensingHeader::parse(data)?;
        if header.laser_num == 0 || data.len() != header.packet_size() {
            return None;
        }
        let blocks = &data[HEADER_SIZE..data.len() - TAIL_SIZE];
        Some(Self { header, blocks })
    }

    fn block_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.header.laser_num as usize * UNIT_SIZE
    }

    /// Blocks in wire order.
    pub fn blocks(&self) -> impl Iterator<Item = Block<'a>> + 'a {
        let blocks: &'a [u8] = self.blocks;
        blocks.chunks_exact(self.block_size()).map(|block| Block {
            time_offset_us: u16_at(block, 0),
            units: &block[BLOCK_HEADER_SIZE..],
        })
    }
}

/// One firing of every laser.
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    pub time_offset_us: u16,
    units: &'a [u8],
}

impl<'a> Block<'a> {
    /// Units in laser order.
    pub fn units(&self) -> impl Iterator<Item = Unit> + 'a {
        self.units.chunks_exact(UNIT_SIZE).map(Unit::parse)
    }
}
