//! Capture and packet builders for the integration tests.

#![allow(dead_code)]

use lidarcap::interpreter::asensing::format::{AsensingHeader, Unit};
use lidarcap::network::UdpPacketBuilder;
use lidarcap::pcap::CaptureWriter;
use lidarcap::pcap::format::LinkType;
use lidarcap::CaptureTimestamp;
use std::path::Path;

pub const LIDAR_PORT: u16 = 51180;
pub const LASERS: u8 = 8;
pub const BLOCKS: u8 = 4;
pub const POINTS_PER_PACKET: usize = LASERS as usize * BLOCKS as usize;
pub const START_TIME: f64 = 1_700_000_000.0;

/// Name the Asensing decoder treats as "no correction table".
pub const NO_CORRECTION: &str = "Test-No-Correction.json";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("lidarcap=debug").try_init();
}

pub fn asensing_payload(frame_id: u16) -> Vec<u8> {
    let header = AsensingHeader {
        version_major: 1,
        laser_num: LASERS,
        block_num: BLOCKS,
        echo_count: 1,
        frame_id,
        utc: [124, 3, 15, 12, 30, 5],
        points_per_packet: POINTS_PER_PACKET as u16,
        ..AsensingHeader::default()
    };
    let mut out = Vec::with_capacity(header.packet_size());
    header.write_to(&mut out);
    for block in 0..BLOCKS as u16 {
        out.extend_from_slice(&(block * 5).to_le_bytes());
        for laser in 0..LASERS {
            Unit { distance: 1000 + laser as u16, azimuth: block * 25, elevation: laser as i16 * 50, intensity: laser }
                .write_to(&mut out);
        }
    }
    out.extend_from_slice(&[0u8; 8]);
    out
}

/// What one record of a test capture carries.
pub enum Datagram {
    Lidar(u16),
    Other(Vec<u8>),
}

/// Write an Ethernet capture, one record per datagram, `step` seconds apart.
pub fn write_capture(path: &Path, datagrams: &[Datagram], start: f64, step: f64) -> anyhow::Result<()> {
    let mut writer = CaptureWriter::create(path, LinkType::Ethernet)?;
    for (i, datagram) in datagrams.iter().enumerate() {
        let timestamp = CaptureTimestamp::from_secs_f64(start + i as f64 * step);
        let builder = UdpPacketBuilder::new(10000, LIDAR_PORT).with_identification(i as u16);
        match datagram {
            Datagram::Lidar(id) => writer.write_udp_payload(&builder, &asensing_payload(*id), timestamp)?,
            Datagram::Other(bytes) => writer.write_udp_payload(&builder, bytes, timestamp)?,
        }
    }
    writer.flush()?;
    Ok(())
}

/// `count` lidar datagrams per frame id, in order.
pub fn frames_of(ids: &[(u16, usize)]) -> Vec<Datagram> {
    ids.iter().flat_map(|(id, count)| (0..*count).map(move |_| Datagram::Lidar(*id))).collect()
}
