//! Capture replay through the public file source API.

mod common;

use anyhow::{Context, Result, ensure};
use common::{Datagram, LIDAR_PORT, NO_CORRECTION, POINTS_PER_PACKET, START_TIME, frames_of, init_tracing, write_capture};
use lidarcap::config::{FileSourceConfig, InterpreterConfig};
use lidarcap::interpreter::AsensingInterpreter;
use lidarcap::pcap::{CaptureReader, PacketFilter};
use lidarcap::providers::{CatalogStatus, FileFrameSource};
use lidarcap::{CaptureError, FramingMethod, Lidarcap, TimeBasis};
use proptest::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn config() -> FileSourceConfig {
    FileSourceConfig { calibration_file: Some(NO_CORRECTION.into()), ..FileSourceConfig::default() }
}

fn open(path: &Path, config: FileSourceConfig) -> Result<FileFrameSource<AsensingInterpreter>> {
    FileFrameSource::open(path, AsensingInterpreter::default(), config).context("open capture")
}

#[test]
fn frame_id_change_splits_the_capture() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let path = dir.path().join("two_frames.pcap");
    write_capture(&path, &frames_of(&[(1, 500), (2, 500)]), START_TIME, 0.001)?;

    let mut source = Lidarcap::open(&path, NO_CORRECTION, AsensingInterpreter::default())?;
    ensure!(source.frame_count() == 2, "got {} frames", source.frame_count());
    ensure!(source.catalog_status() == CatalogStatus::Ready);

    let first = source.get_frame(0)?;
    ensure!(first.len() == 500 * POINTS_PER_PACKET, "first frame has {} points", first.len());
    // sealed at end of file
    let last = source.get_frame(1)?;
    ensure!(last.len() == 500 * POINTS_PER_PACKET, "last frame has {} points", last.len());
    ensure!(last.point_ids.last() == Some(&(500 * POINTS_PER_PACKET as u32 - 1)));
    Ok(())
}

#[test]
fn decoding_is_repeatable_in_any_order() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("three_frames.pcap");
    write_capture(&path, &frames_of(&[(7, 20), (8, 30), (9, 25)]), START_TIME, 0.001)?;

    let mut source = open(&path, config())?;
    ensure!(source.frame_count() == 3);

    let middle = source.get_frame(1)?;
    let last = source.get_frame(2)?;
    let first = source.get_frame(0)?;
    ensure!(first.len() == 20 * POINTS_PER_PACKET);
    ensure!(middle.len() == 30 * POINTS_PER_PACKET);
    ensure!(last.len() == 25 * POINTS_PER_PACKET);

    let again = source.get_frame(1)?;
    ensure!(*again == *middle, "second decode of frame 1 differs");
    Ok(())
}

#[test]
fn fresh_sources_decode_identical_frames() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("twice.pcap");
    write_capture(&path, &frames_of(&[(3, 12), (4, 40), (5, 7), (6, 19)]), START_TIME, 0.001)?;

    let mut first = open(&path, config())?;
    let mut second = open(&path, config())?;
    ensure!(first.frame_count() == second.frame_count());
    ensure!(first.index().entries() == second.index().entries(), "catalogs differ");

    // visit the frames in opposite orders so reader state cannot line up by accident
    let count = first.frame_count();
    let forward: Vec<_> = (0..count).map(|k| first.get_frame(k)).collect::<lidarcap::Result<_>>()?;
    let backward: Vec<_> = (0..count).rev().map(|k| second.get_frame(k)).collect::<lidarcap::Result<_>>()?;
    for (k, frame) in forward.iter().enumerate() {
        ensure!(**frame == *backward[count - 1 - k], "frame {k} decodes differently");
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_frame_is_found_at_its_own_start_time(sizes in prop::collection::vec(1usize..25, 1..8)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.pcap");
        let frames: Vec<(u16, usize)> = sizes.iter().enumerate().map(|(i, n)| (i as u16 + 1, *n)).collect();
        write_capture(&path, &frames_of(&frames), START_TIME, 0.001).unwrap();

        let mut source = open(&path, config()).unwrap();
        prop_assert_eq!(source.frame_count(), sizes.len());

        let starts: Vec<f64> = (0..source.frame_count())
            .map(|i| source.index().start_time(i, TimeBasis::Network).unwrap())
            .collect();
        for pair in starts.windows(2) {
            prop_assert!(pair[0] < pair[1], "network start times not increasing: {:?}", starts);
        }
        for (i, start) in starts.iter().enumerate() {
            prop_assert_eq!(source.get_frame_index_for_network_time(*start).unwrap(), i);
        }
    }
}

#[test]
fn non_lidar_traffic_is_ignored() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mixed.pcap");
    let mut datagrams = frames_of(&[(1, 10)]);
    datagrams.insert(3, Datagram::Other(b"status heartbeat".to_vec()));
    datagrams.extend(frames_of(&[(2, 10)]));
    write_capture(&path, &datagrams, START_TIME, 0.001)?;

    let mut source = open(&path, config())?;
    ensure!(source.frame_count() == 2);
    ensure!(source.get_frame(0)?.len() == 10 * POINTS_PER_PACKET);
    Ok(())
}

#[test]
fn lookups_by_time_use_frame_start_times() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("timed.pcap");
    write_capture(&path, &frames_of(&[(1, 500), (2, 500)]), START_TIME, 0.001)?;

    let mut source = open(&path, config())?;
    ensure!(source.get_frame_index_for_network_time(START_TIME)? == 0);
    ensure!(source.get_frame_index_for_network_time(START_TIME + 0.2)? == 1);
    ensure!(source.get_frame_index_for_network_time(START_TIME + 0.5)? == 1);

    let err = source.get_frame_index_for_network_time(START_TIME + 0.9).unwrap_err();
    ensure!(matches!(err, CaptureError::OutOfRange { index: 2, len: 2, .. }), "unexpected {err:?}");

    let frame = source.get_frame_at_time(START_TIME + 0.5, TimeBasis::Network)?;
    ensure!(frame.len() == 500 * POINTS_PER_PACKET);

    // every packet carries the same sensor clock
    let data_time = source.index().start_time(0, TimeBasis::Data).context("entry 0")?;
    ensure!(source.get_frame_index_for_data_time(data_time)? == 0);
    Ok(())
}

#[test]
fn out_of_range_frame_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("short.pcap");
    write_capture(&path, &frames_of(&[(1, 5), (2, 5)]), START_TIME, 0.001)?;

    let mut source = open(&path, config())?;
    let err = source.get_frame(5).unwrap_err();
    ensure!(matches!(err, CaptureError::OutOfRange { index: 5, len: 2, .. }), "unexpected {err:?}");
    Ok(())
}

#[test]
fn first_and_last_frames_are_hidden_from_timesteps() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("hidden.pcap");
    write_capture(&path, &frames_of(&[(1, 10), (2, 10), (3, 10), (4, 10)]), START_TIME, 0.001)?;

    let mut source = open(&path, config())?;
    ensure!(source.frame_count() == 4);
    let steps = source.timesteps();
    ensure!(steps.len() == 2, "got {steps:?}");
    ensure!((steps[0] - (START_TIME + 0.010)).abs() < 1e-6);

    source.set_show_first_and_last_frame(true);
    ensure!(source.timesteps().len() == 4);
    let (begin, end) = source.time_range().context("time range")?;
    ensure!(begin == START_TIME && end > begin);
    Ok(())
}

#[test]
fn network_time_framing_cuts_fixed_slots() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("slots.pcap");
    // half a millisecond off so no packet sits on a slot edge
    write_capture(&path, &frames_of(&[(1, 1000)]), START_TIME + 0.0005, 0.001)?;

    let config = FileSourceConfig {
        interpreter: InterpreterConfig {
            framing_method: FramingMethod::NetworkPacketTime,
            frame_duration_s: 0.1,
            ..InterpreterConfig::default()
        },
        ..config()
    };
    let mut source = open(&path, config)?;
    ensure!(source.frame_count() == 10, "got {} frames", source.frame_count());
    ensure!(source.get_frame(3)?.len() == 100 * POINTS_PER_PACKET);
    ensure!(source.get_frame(9)?.len() == 100 * POINTS_PER_PACKET);

    let err = source.save_frame_range(dir.path().join("out.pcap"), 0, 1).unwrap_err();
    ensure!(matches!(err, CaptureError::Config { .. }), "unexpected {err:?}");
    Ok(())
}

#[test]
fn switching_framing_rebuilds_the_index() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("switch.pcap");
    write_capture(&path, &frames_of(&[(1, 150), (2, 150)]), START_TIME + 0.0005, 0.001)?;

    let mut source = open(&path, config())?;
    ensure!(source.frame_count() == 2);
    source.set_framing_method(FramingMethod::NetworkPacketTime)?;
    ensure!(source.frame_count() == 3, "got {} frames", source.frame_count());
    source.set_framing_method(FramingMethod::Interpreter)?;
    ensure!(source.frame_count() == 2);
    Ok(())
}

#[test]
fn saved_range_holds_exactly_its_records() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("source.pcap");
    let mut datagrams = frames_of(&[(1, 10), (2, 5)]);
    datagrams.push(Datagram::Other(vec![0u8; 12]));
    datagrams.extend(frames_of(&[(2, 5), (3, 10), (4, 10)]));
    write_capture(&path, &datagrams, START_TIME, 0.001)?;

    let mut source = open(&path, config())?;
    ensure!(source.frame_count() == 4);

    // display index 0 is frame 1 while first and last frames are hidden
    let out = dir.path().join("frame_2.pcap");
    let written = source.save_frame_range(&out, 0, 0)?;
    ensure!(written == 11, "wrote {written} records");

    let mut reader = CaptureReader::open(&out, PacketFilter::All, true)?;
    let mut lidar = 0;
    while let Some(record) = reader.next_packet()? {
        if record.payload().len() > 12 {
            lidar += 1;
        }
    }
    ensure!(lidar == 10);

    let mut saved = open(&out, config())?;
    ensure!(saved.catalog_status() == CatalogStatus::Unparsed);
    ensure!(saved.get_frame(0)?.len() == 10 * POINTS_PER_PACKET);

    // the source keeps decoding normally afterwards
    ensure!(source.get_frame(2)?.len() == 10 * POINTS_PER_PACKET);

    source.set_show_first_and_last_frame(true);
    let written = source.save_frame_range(dir.path().join("frames_1_2.pcap"), 1, 2)?;
    ensure!(written == 21, "wrote {written} records");
    Ok(())
}

#[test]
fn port_filter_drops_other_ports() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("ports.pcap");
    write_capture(&path, &frames_of(&[(1, 5), (2, 5)]), START_TIME, 0.001)?;

    let mut source = open(&path, FileSourceConfig { lidar_port: Some(LIDAR_PORT), ..config() })?;
    ensure!(source.frame_count() == 2);
    source.set_lidar_port(Some(LIDAR_PORT + 1))?;
    ensure!(source.catalog_status() == CatalogStatus::Empty);
    Ok(())
}

#[test]
fn missing_calibration_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("calib.pcap");
    write_capture(&path, &frames_of(&[(1, 2)]), START_TIME, 0.001).unwrap();

    let err = Lidarcap::open(&path, dir.path().join("absent.json"), AsensingInterpreter::default()).unwrap_err();
    assert!(matches!(err, CaptureError::Calibration { .. }), "unexpected {err:?}");
}

#[test]
fn missing_capture_is_a_file_error() {
    let err = Lidarcap::open("/nonexistent/drive.pcap", NO_CORRECTION, AsensingInterpreter::default()).unwrap_err();
    assert!(err.is_not_found(), "unexpected {err:?}");
}
