use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pad_audio_engine::audio::NullOutput;
use pad_audio_engine::codec::PacketEncoder;
use pad_audio_engine::config::EngineConfig;
use pad_audio_engine::engine::{EndReason, PlaybackMode};
use pad_audio_engine::{Endpoint, NetworkEndpoint, PadEngine, PlaybackEvent, PlaybackRequest};

fn write_wav(dir: &Path, name: &str, rate: u32, channels: u16, duration_ms: u64, value: i16) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    let frames = rate as u64 * duration_ms / 1000;
    for _ in 0..frames * channels as u64 {
        writer.write_sample(value).unwrap();
    }
    writer.finalize().unwrap();
    path
}

fn headless_engine() -> PadEngine {
    PadEngine::with_output(EngineConfig::default(), Arc::new(NullOutput::new()))
}

fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

#[test]
fn replaying_a_channel_keeps_one_resource_set() {
    let dir = tempfile::tempdir().unwrap();
    let clip = write_wav(dir.path(), "long.wav", 48000, 2, 3000, 1000);
    let engine = headless_engine();
    let events = engine.events();

    let request = PlaybackRequest::new(&clip);
    engine.play(1, &request).unwrap();
    engine.play(1, &request).unwrap();

    assert_eq!(engine.playback().active_count(), 1);
    assert_eq!(engine.playback().mode(1), Some(PlaybackMode::Local));
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        PlaybackEvent::Ended {
            channel: 1,
            reason: EndReason::Stopped
        }
    );
    assert!(events.try_recv().is_err());

    assert!(engine.stop(1));
    assert!(!engine.is_playing(1));
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        PlaybackEvent::Ended {
            channel: 1,
            reason: EndReason::Stopped
        }
    );
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn trimmed_playback_ends_once_after_window() {
    let dir = tempfile::tempdir().unwrap();
    let clip = write_wav(dir.path(), "two_seconds.wav", 48000, 2, 2000, 1000);
    let engine = headless_engine();
    let events = engine.events();

    let start = Instant::now();
    engine
        .play(3, &PlaybackRequest::new(&clip).with_window(500, 0))
        .unwrap();

    let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(
        event,
        PlaybackEvent::Ended {
            channel: 3,
            reason: EndReason::Finished
        }
    );
    assert!(elapsed >= Duration::from_millis(1400), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3000), "{:?}", elapsed);
    assert!(!engine.is_playing(3));
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn channels_play_independently() {
    let dir = tempfile::tempdir().unwrap();
    let clip = write_wav(dir.path(), "clip.wav", 44100, 1, 2000, 500);
    let engine = headless_engine();
    let events = engine.events();

    engine.play(1, &PlaybackRequest::new(&clip)).unwrap();
    engine.play(2, &PlaybackRequest::new(&clip)).unwrap();
    assert_eq!(engine.playback().active_count(), 2);

    assert!(engine.stop(2));
    assert!(engine.is_playing(1));
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        PlaybackEvent::Ended {
            channel: 2,
            reason: EndReason::Stopped
        }
    );
}

#[test]
fn network_playback_feeds_a_network_capture() {
    let dir = tempfile::tempdir().unwrap();
    let clip = write_wav(dir.path(), "tone.wav", 48000, 2, 400, 16384);
    let port = free_udp_port();
    let engine = headless_engine();
    let events = engine.events();

    let listen = NetworkEndpoint {
        remote_ip: String::new(),
        port,
        stream_name: "PADLINK".into(),
        ..NetworkEndpoint::receive_default()
    };
    engine
        .start_capture(7, Endpoint::Network(listen), 5)
        .unwrap();
    assert!(engine.is_capturing(7));

    let send = NetworkEndpoint {
        remote_ip: "127.0.0.1".into(),
        port,
        stream_name: "padlink".into(),
        ..NetworkEndpoint::transmit_default()
    };
    engine
        .play(
            2,
            &PlaybackRequest::new(&clip).with_destination(Endpoint::Network(send)),
        )
        .unwrap();
    assert_eq!(engine.playback().mode(2), Some(PlaybackMode::Network));

    assert_eq!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        PlaybackEvent::Ended {
            channel: 2,
            reason: EndReason::Finished
        }
    );
    // Let the receive thread drain the socket
    std::thread::sleep(Duration::from_millis(100));

    let format = engine.capture_format(7).unwrap();
    assert_eq!(format.sample_rate, 48000);
    assert_eq!(format.channels, 2);

    let rms = engine.rms01(7, 5000);
    assert!((rms - 0.5).abs() < 0.01, "rms {}", rms);
    assert!(engine.db(7, 5000) > -7.0);
    assert!(engine.peak01(7, 0) > 0.49);

    let out = dir.path().join("captures");
    let committed = engine.commit_capture_to_file(7, &out, "Pad07_take").unwrap();
    assert_eq!(committed.file_path, out.join("Pad07_take.wav"));
    assert!(committed.duration > Duration::from_millis(300));
    assert!(committed.duration <= Duration::from_millis(400));

    let reader = hound::WavReader::open(&committed.file_path).unwrap();
    assert_eq!(reader.spec().channels, 2);
    assert_eq!(reader.spec().sample_rate, 48000);

    assert!(engine.stop_capture(7));
    assert!(!engine.is_capturing(7));
}

#[test]
fn commit_with_nothing_captured_fails() {
    let engine = headless_engine();
    let dir = tempfile::tempdir().unwrap();
    let listen = NetworkEndpoint {
        port: free_udp_port(),
        ..NetworkEndpoint::receive_default()
    };
    engine.start_capture(4, Endpoint::Network(listen), 0).unwrap();

    assert!(engine.commit_capture_to_file(4, dir.path(), "empty").is_err());
    assert!(!dir.path().join("empty.wav").exists());
}

#[test]
fn commit_to_configured_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        capture_dir: Some(dir.path().join("echo")),
        ..EngineConfig::default()
    };
    let engine = PadEngine::with_output(config, Arc::new(NullOutput::new()));
    let port = free_udp_port();
    let listen = NetworkEndpoint {
        port,
        ..NetworkEndpoint::receive_default()
    };
    engine.start_capture(5, Endpoint::Network(listen), 2).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut encoder = PacketEncoder::new("ECHO_IN");
    for counter in 0..4 {
        let packet = encoder.encode(&[0.25; 256], 22050, 1, counter);
        socket.send_to(&packet, ("127.0.0.1", port)).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while engine.capture_format(5).map(|f| f.sample_rate) != Some(22050) {
        assert!(Instant::now() < deadline, "capture never locked");
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(100));

    let committed = engine.commit_capture(5).unwrap();
    let name = committed.file_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("Pad05_Echo_"), "{}", name);
    assert!(name.ends_with(".wav"));
    assert_eq!(committed.file_path.parent(), Some(dir.path().join("echo").as_path()));
    assert!(committed.duration > Duration::ZERO);
}
