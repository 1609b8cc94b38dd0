//! Packet and capture builders shared by unit tests and benchmarks
//!
//! Everything here produces bytes exactly as a sensor or a capture tool would,
//! so tests exercise the real parsing paths instead of hand-built structs.

#![cfg(any(test, feature = "benchmark"))]

use crate::interpreter::asensing::format::{AsensingHeader, Unit};
use crate::network::UdpPacketBuilder;
use crate::pcap::CaptureWriter;
use crate::pcap::format::LinkType;
use crate::types::CaptureTimestamp;
use crate::Result;
use std::path::Path;

const ETH: usize = 14;
const IPV4_HEADER_LEN: usize = 20;

/// Source port used for every synthetic sensor datagram.
pub const SENSOR_SOURCE_PORT: u16 = 10000;

/// Ethernet/IPv4/UDP frame carrying `payload`, unfragmented.
pub fn ipv4_udp_frame(payload: &[u8], dst_port: u16, id: u16) -> Vec<u8> {
    UdpPacketBuilder::new(SENSOR_SOURCE_PORT, dst_port)
        .with_identification(id)
        .build(payload)
        .expect("test payload fits in one datagram")
}

/// Split an unfragmented IPv4 frame into fragments.
///
/// `sizes` are the IP payload sizes of the leading fragments (multiples of 8);
/// whatever remains becomes the last fragment.
pub fn fragment_ipv4(whole: &[u8], sizes: &[usize]) -> Vec<Vec<u8>> {
    let headers = &whole[..ETH + IPV4_HEADER_LEN];
    let ip_payload = &whole[ETH + IPV4_HEADER_LEN..];

    let mut bounds = Vec::with_capacity(sizes.len() + 1);
    let mut offset = 0;
    for size in sizes {
        assert_eq!(size % 8, 0, "fragment sizes must be multiples of 8");
        bounds.push((offset, offset + size));
        offset += size;
    }
    assert!(offset < ip_payload.len(), "nothing left for the last fragment");
    bounds.push((offset, ip_payload.len()));

    let last = bounds.len() - 1;
    bounds
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| {
            let mut fragment = headers.to_vec();
            let total_len = (IPV4_HEADER_LEN + end - start) as u16;
            fragment[ETH + 2..ETH + 4].copy_from_slice(&total_len.to_be_bytes());
            let more = if i < last { 0x2000 } else { 0 };
            let flags_offset = more | (start / 8) as u16;
            fragment[ETH + 6..ETH + 8].copy_from_slice(&flags_offset.to_be_bytes());
            fragment.extend_from_slice(&ip_payload[start..end]);
            fragment
        })
        .collect()
}

/// IPv6 fragment carrying `payload`, behind a hop-by-hop options header.
///
/// `offset` is in 8-byte units; the network header is 56 bytes long.
pub fn ipv6_fragment_frame(payload: &[u8], id: u32, offset: u16, more_fragments: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH + 56 + payload.len());
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    frame.extend_from_slice(&0x86DDu16.to_be_bytes());

    frame.extend_from_slice(&[0x60, 0, 0, 0]);
    frame.extend_from_slice(&((16 + payload.len()) as u16).to_be_bytes());
    // hop-by-hop options
    frame.push(0);
    frame.push(64);
    frame.extend_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    frame.extend_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);

    // hop-by-hop: next = fragment, length 0 (8 bytes), PadN
    frame.extend_from_slice(&[44, 0, 1, 4, 0, 0, 0, 0]);

    // fragment: next = UDP
    frame.extend_from_slice(&[17, 0]);
    let offset_flags = (offset << 3) | more_fragments as u16;
    frame.extend_from_slice(&offset_flags.to_be_bytes());
    frame.extend_from_slice(&id.to_be_bytes());

    frame.extend_from_slice(payload);
    frame
}

/// Header of a synthetic Asensing packet.
pub fn asensing_header(frame_id: u16, laser_num: u8, block_num: u8) -> AsensingHeader {
    AsensingHeader {
        version_major: 1,
        version_minor: 0,
        laser_num,
        block_num,
        echo_count: 1,
        return_mode: 0x37,
        point_num: 0,
        frame_id,
        seq_num: 0,
        utc: [124, 3, 15, 12, 30, 5],
        timestamp_us: 0,
        points_per_packet: laser_num as u16 * block_num as u16,
    }
}

/// Serialize a header and its `(time_offset_us, units)` blocks, plus the tail.
pub fn encode_asensing(header: &AsensingHeader, blocks: &[(u16, Vec<Unit>)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.packet_size());
    header.write_to(&mut out);
    for (offset, units) in blocks {
        out.extend_from_slice(&offset.to_le_bytes());
        for unit in units {
            unit.write_to(&mut out);
        }
    }
    out.extend_from_slice(&[0u8; 8]);
    out
}

/// Well-formed Asensing packet where every unit hits at 10 m.
pub fn asensing_payload(frame_id: u16, laser_num: u8, block_num: u8) -> Vec<u8> {
    let header = asensing_header(frame_id, laser_num, block_num);
    let blocks: Vec<(u16, Vec<Unit>)> = (0..block_num as u16)
        .map(|block| {
            let units = (0..laser_num)
                .map(|laser| Unit {
                    distance: 1000,
                    azimuth: (block * 20 + laser as u16 * 3) % 36000,
                    elevation: laser as i16 * 10 - 100,
                    intensity: laser,
                })
                .collect();
            (block * 5, units)
        })
        .collect();
    encode_asensing(&header, &blocks)
}

/// Write an Ethernet capture holding the given frames.
pub fn write_capture(path: &Path, frames: &[(Vec<u8>, CaptureTimestamp)]) -> Result<u64> {
    let mut writer = CaptureWriter::create(path, LinkType::Ethernet)?;
    for (frame, timestamp) in frames {
        writer.write_frame(frame, *timestamp, frame.len() as u32)?;
    }
    writer.flush()?;
    Ok(writer.records_written())
}

/// Capture of Asensing packets, one per frame id in `frame_ids`, 1 ms apart.
pub fn asensing_capture(path: &Path, frame_ids: &[u16], laser_num: u8, block_num: u8, port: u16) -> Result<u64> {
    let frames: Vec<_> = frame_ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let frame = ipv4_udp_frame(&asensing_payload(*id, laser_num, block_num), port, i as u16);
            (frame, CaptureTimestamp::from_secs_f64(1_700_000_000.0 + i as f64 * 0.001))
        })
        .collect();
    write_capture(path, &frames)
}
