use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use h264_ingest::mock::{MockBehavior, RecordingDecoderFactory};
use h264_ingest::{
    ControlChannel, DecodedFrame, DecoderState, FALLBACK_CODEC, FrameRenderer, FrameSource,
    StillImageFormat, StreamConfig, StreamError, StreamSession,
};
use rstest::rstest;

const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB, 0x40];
const PPS: &[u8] = &[0x68, 0xCE, 0x06, 0xE2];
const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21, 0x10];
const DELTA: &[u8] = &[0x41, 0x9A, 0x22, 0x11];

fn nal(nal: &[u8]) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 1];
    out.extend_from_slice(nal);
    out
}

fn stream(nals: &[&[u8]]) -> Vec<u8> {
    nals.iter().flat_map(|n| nal(n)).collect()
}

#[derive(Clone, Default)]
struct RecordingRenderer {
    frames: Arc<Mutex<Vec<(u32, u32, FrameSource)>>>,
}

impl FrameRenderer for RecordingRenderer {
    fn render(&mut self, frame: &DecodedFrame) -> Result<(), StreamError> {
        self.frames.lock().unwrap().push((
            frame.dims.width.get(),
            frame.dims.height.get(),
            frame.source,
        ));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingControl {
    sent: Arc<Mutex<Vec<String>>>,
}

impl ControlChannel for RecordingControl {
    fn send_text(&mut self, text: &str) -> Result<(), StreamError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

fn session(behavior: MockBehavior) -> (StreamSession, RecordingDecoderFactory, RecordingRenderer) {
    session_with(StreamConfig::default(), behavior)
}

fn session_with(
    config: StreamConfig,
    behavior: MockBehavior,
) -> (StreamSession, RecordingDecoderFactory, RecordingRenderer) {
    let factory = RecordingDecoderFactory::new(behavior);
    let renderer = RecordingRenderer::default();
    let session = StreamSession::new(config, factory.clone(), renderer.clone());
    (session, factory, renderer)
}

#[test]
fn sps_pps_idr_chunks_start_streaming() {
    let (mut session, factory, _renderer) = session(MockBehavior::default());
    let t0 = Instant::now();

    let report = session.ingest_at(&nal(SPS), t0).unwrap();
    assert_eq!(report.parameter_sets, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(session.state(), DecoderState::Unconfigured);

    let report = session.ingest_at(&nal(PPS), t0).unwrap();
    assert!(report.configured);
    assert_eq!(session.state(), DecoderState::Configuring);
    assert_eq!(session.decoder_config().unwrap().codec, "avc1.42001E");

    let report = session.ingest_at(&nal(IDR), t0).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(session.state(), DecoderState::Streaming);

    let log = factory.snapshot();
    assert_eq!(log.decoded.len(), 1);
    assert!(log.decoded[0].is_key);
    assert_eq!(log.decoded[0].timestamp_us, 33_000);
    assert_eq!(log.decoded[0].data, nal(IDR));
}

#[test]
fn keyframe_in_the_configuring_chunk_is_kept() {
    let (mut session, factory, _renderer) = session(MockBehavior {
        configure_delay_queries: 1,
        ..MockBehavior::default()
    });
    let t0 = Instant::now();

    let report = session.ingest_at(&stream(&[SPS, PPS, IDR]), t0).unwrap();
    assert!(report.configured);
    assert_eq!(report.held, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.dropped, 0);
    assert_eq!(session.state(), DecoderState::Configuring);

    let report = session.ingest_at(&nal(DELTA), t0).unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(session.state(), DecoderState::Streaming);

    let log = factory.snapshot();
    assert_eq!(log.decoded.len(), 2);
    assert!(log.decoded[0].is_key);
    assert_eq!(log.decoded[0].data, nal(IDR));
    assert_eq!(log.decoded[0].timestamp_us, 33_000);
    assert_eq!(log.decoded[1].timestamp_us, 66_000);
    assert_eq!(session.counters().keyframes, 1);
}

#[test]
fn delta_units_wait_for_keyframe_until_deadline() {
    let (mut session, factory, _renderer) = session(MockBehavior::default());
    let t0 = Instant::now();
    session.ingest_at(&stream(&[SPS, PPS]), t0).unwrap();

    assert_eq!(session.ingest_at(&nal(DELTA), t0).unwrap().dropped, 1);
    assert!(matches!(session.state(), DecoderState::AwaitingKeyframe { .. }));
    let report = session
        .ingest_at(&nal(DELTA), t0 + Duration::from_millis(2_500))
        .unwrap();
    assert_eq!(report.dispatched, 0);

    let report = session.ingest_at(&nal(DELTA), t0 + Duration::from_secs(3)).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(session.state(), DecoderState::Streaming);

    let log = factory.snapshot();
    assert_eq!(log.decoded.len(), 1);
    assert!(!log.decoded[0].is_key);
    assert_eq!(session.counters().gated_dropped, 2);
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(7)]
#[case(64)]
fn dispatched_units_do_not_depend_on_chunking(#[case] chunk_bytes: usize) {
    let data = stream(&[SPS, PPS, IDR, DELTA, DELTA, IDR, DELTA, &[0x09, 0xF0]]);
    let config = StreamConfig {
        flush_at_chunk_end: false,
        parameter_set_deadline_chunks: 1_000,
        ..StreamConfig::default()
    };
    let t0 = Instant::now();

    let (mut whole, whole_factory, _) = session_with(config.clone(), MockBehavior::default());
    whole.ingest_at(&data, t0).unwrap();

    let (mut split, split_factory, _) = session_with(config, MockBehavior::default());
    for chunk in data.chunks(chunk_bytes) {
        split.ingest_at(chunk, t0).unwrap();
    }

    let expected = whole_factory.snapshot().decoded;
    assert_eq!(expected.len(), 5);
    assert_eq!(split_factory.snapshot().decoded, expected);
}

fn long_idr() -> Vec<u8> {
    let mut idr = vec![0x65];
    idr.extend_from_slice(&[0x88; 100]);
    idr
}

#[test]
fn unit_split_across_chunks_is_cut_when_flushing_at_chunk_end() {
    let idr = long_idr();
    let data = stream(&[SPS, PPS, idr.as_slice(), DELTA]);
    let (first, second) = data.split_at(data.len() - 60);

    let (mut session, factory, _renderer) = session(MockBehavior::default());
    let t0 = Instant::now();
    session.ingest_at(first, t0).unwrap();
    assert_eq!(session.counters().misaligned_chunks, 0);
    session.ingest_at(second, t0).unwrap();

    let log = factory.snapshot();
    assert_eq!(log.decoded.len(), 2);
    assert_eq!(log.decoded[0].nal_type, 5);
    assert_eq!(log.decoded[0].data.len(), first.len() - nal(SPS).len() - nal(PPS).len());
    assert_eq!(log.decoded[1].data, nal(DELTA));
    assert_eq!(session.counters().misaligned_chunks, 1);
}

#[test]
fn finish_completes_the_last_unit() {
    let idr = long_idr();
    let data = stream(&[SPS, PPS, idr.as_slice(), DELTA]);
    let (first, second) = data.split_at(data.len() - 60);
    let config = StreamConfig {
        flush_at_chunk_end: false,
        ..StreamConfig::default()
    };

    let (mut session, factory, _renderer) = session_with(config, MockBehavior::default());
    let t0 = Instant::now();
    session.ingest_at(first, t0).unwrap();
    assert_eq!(session.ingest_at(second, t0).unwrap().dispatched, 1);
    assert_eq!(factory.snapshot().decoded[0].data, nal(&idr));
    assert!(session.buffered_bytes() > 0);

    let report = session.finish_at(t0).unwrap();
    assert_eq!(report.units, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(session.buffered_bytes(), 0);
    assert_eq!(factory.snapshot().decoded[1].data, nal(DELTA));
    assert_eq!(session.counters().misaligned_chunks, 0);

    assert_eq!(session.finish_at(t0).unwrap().units, 0);
    session.teardown();
    assert!(matches!(session.finish(), Err(StreamError::SessionClosed)));
}

#[test]
fn closed_decoder_is_rebuilt_and_timestamps_restart() {
    let (mut session, factory, renderer) = session(MockBehavior {
        close_after_decodes: Some(2),
        emit_frames: Some((64, 48)),
        ..MockBehavior::default()
    });
    let t0 = Instant::now();
    session.ingest_at(&stream(&[SPS, PPS]), t0).unwrap();
    session.ingest_at(&nal(IDR), t0).unwrap();
    session.ingest_at(&nal(DELTA), t0).unwrap();

    let report = session.ingest_at(&nal(DELTA), t0).unwrap();
    assert!(report.rebuilt);
    assert_eq!(report.dispatched, 0);
    assert!(matches!(session.state(), DecoderState::AwaitingKeyframe { .. }));

    session.ingest_at(&nal(IDR), t0).unwrap();
    let log = factory.snapshot();
    assert_eq!(log.created, 2);
    let timestamps: Vec<u64> = log.decoded.iter().map(|au| au.timestamp_us).collect();
    assert_eq!(timestamps, vec![33_000, 66_000, 33_000]);

    assert_eq!(session.pump_output().unwrap(), 3);
    assert_eq!(session.stats().frame_count, 3);
    assert_eq!(session.stats().width, Some(64));
    assert_eq!(renderer.frames.lock().unwrap().len(), 3);
}

#[test]
fn exhausted_rebuild_budget_is_fatal() {
    let (mut session, _factory, _renderer) = session(MockBehavior {
        reject_after_decodes: Some(0),
        ..MockBehavior::default()
    });
    let t0 = Instant::now();
    session.ingest_at(&stream(&[SPS, PPS]), t0).unwrap();

    for _ in 0..3 {
        let report = session.ingest_at(&nal(IDR), t0).unwrap();
        assert!(report.rebuilt);
    }
    let err = session.ingest_at(&nal(IDR), t0).unwrap_err();
    assert!(matches!(err, StreamError::DecoderFatal { attempts: 4, .. }));
    assert_eq!(session.state(), DecoderState::Closed);
    assert!(session.is_closed());
    assert!(matches!(
        session.ingest_at(&nal(IDR), t0),
        Err(StreamError::SessionClosed)
    ));
}

#[test]
fn rejected_description_falls_back_to_baseline() {
    let (mut session, factory, _renderer) = session(MockBehavior {
        reject_described_configs: true,
        ..MockBehavior::default()
    });
    let t0 = Instant::now();
    session.ingest_at(&stream(&[SPS, PPS]), t0).unwrap();

    let active = session.decoder_config().unwrap();
    assert_eq!(active.codec, FALLBACK_CODEC);
    assert!(active.description.is_none());

    assert_eq!(session.ingest_at(&nal(IDR), t0).unwrap().dispatched, 1);
    assert_eq!(factory.snapshot().decoded.len(), 1);
}

#[test]
fn missing_parameter_sets_trigger_fallback_config() {
    let (mut session, _factory, _renderer) = session(MockBehavior::default());
    let t0 = Instant::now();
    for _ in 0..5 {
        let report = session.ingest_at(&nal(DELTA), t0).unwrap();
        assert!(!report.configured);
    }
    assert!(session.decoder_config().is_none());

    assert!(session.ingest_at(&nal(DELTA), t0).unwrap().configured);
    assert_eq!(session.decoder_config().unwrap().codec, FALLBACK_CODEC);

    // Real parameter sets replace the fallback.
    assert!(session.ingest_at(&stream(&[SPS, PPS]), t0).unwrap().configured);
    let active = session.decoder_config().unwrap();
    assert_eq!(active.codec, "avc1.42001E");
    assert!(active.has_description());
}

#[test]
fn repeated_parameter_sets_keep_the_decoder() {
    let (mut session, factory, _renderer) = session(MockBehavior::default());
    let t0 = Instant::now();
    session.ingest_at(&stream(&[SPS, PPS, IDR]), t0).unwrap();
    let report = session.ingest_at(&stream(&[SPS, PPS, IDR]), t0).unwrap();
    assert!(!report.configured);
    assert_eq!(report.dispatched, 1);
    assert_eq!(factory.snapshot().created, 1);
    assert_eq!(session.state(), DecoderState::Streaming);
}

#[test]
fn filler_units_are_always_dropped() {
    let (mut session, factory, _renderer) = session(MockBehavior::default());
    let t0 = Instant::now();
    session.ingest_at(&stream(&[SPS, PPS, IDR]), t0).unwrap();

    let mut chunk = nal(&[0x10, 0xFF, 0xFF]);
    chunk.extend_from_slice(&[0, 0, 1, 0x00]);
    chunk.extend_from_slice(&nal(DELTA));
    let report = session.ingest_at(&chunk, t0).unwrap();
    assert_eq!(report.dropped, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(session.counters().filler_dropped, 2);
    assert_eq!(factory.snapshot().decoded.len(), 2);
}

#[test]
fn start_code_free_input_stays_bounded() {
    let config = StreamConfig {
        max_working_buffer: 4096,
        flush_at_chunk_end: false,
        ..StreamConfig::default()
    };
    let (mut session, _factory, _renderer) = session_with(config, MockBehavior::default());
    let garbage = vec![0xAB; 1000];
    for _ in 0..100 {
        session.ingest(&garbage).unwrap();
        assert!(session.buffered_bytes() <= 4096);
    }
    assert!(session.counters().resyncs > 0);
}

#[test]
fn still_images_bypass_the_decoder() {
    use image::ImageEncoder;
    use image::codecs::png::PngEncoder;

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(&[0x20; 5 * 4 * 4], 5, 4, image::ColorType::Rgba8)
        .unwrap();

    let (mut session, factory, renderer) = session(MockBehavior::default());
    let report = session.ingest(&png).unwrap();
    assert_eq!(report.still_image, Some(StillImageFormat::Png));
    assert_eq!(report.units, 0);
    assert_eq!(factory.snapshot().created, 0);

    assert_eq!(session.pump_output().unwrap(), 1);
    assert_eq!(session.stats().frame_count, 1);
    assert_eq!((session.stats().width, session.stats().height), (Some(5), Some(4)));
    assert_eq!(
        renderer.frames.lock().unwrap()[0].2,
        FrameSource::StillImage(StillImageFormat::Png)
    );

    let report = session.ingest(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]).unwrap();
    assert_eq!(report.still_image, Some(StillImageFormat::Jpeg));
    assert!(session.link_status().last_error.is_some());
    assert_eq!(session.pump_output().unwrap(), 0);
}

#[test]
fn control_messages_and_status_text() {
    let control = RecordingControl::default();
    let (session, _factory, _renderer) = session(MockBehavior::default());
    let mut session = session.with_control(control.clone());

    session.start().unwrap();
    session.request_encoding(720, 2).unwrap();
    assert!(matches!(
        session.request_encoding(0, 2),
        Err(StreamError::InvalidInput(_))
    ));

    let sent = control.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    let first: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(first, serde_json::json!({"type": "config", "max_size": 1080, "bit_rate": 4}));
    let second: serde_json::Value = serde_json::from_str(&sent[1]).unwrap();
    assert_eq!(second["max_size"], 720);

    session
        .handle_status_text(r#"{"type":"fallback","message":"screenshots"}"#)
        .unwrap();
    assert!(session.link_status().fallback_mode);
    assert!(session.handle_status_text("oops").is_err());
}

#[test]
fn teardown_is_idempotent() {
    let (mut session, factory, _renderer) = session(MockBehavior {
        emit_frames: Some((16, 16)),
        ..MockBehavior::default()
    });
    let t0 = Instant::now();
    session.ingest_at(&stream(&[SPS, PPS, IDR]), t0).unwrap();

    session.teardown();
    session.teardown();
    assert!(session.is_closed());
    assert_eq!(session.state(), DecoderState::Closed);
    assert_eq!(session.buffered_bytes(), 0);
    assert_eq!(factory.snapshot().closed, 1);
    assert_eq!(session.pump_output().unwrap(), 0);
    assert!(matches!(session.ingest(&nal(IDR)), Err(StreamError::SessionClosed)));

    drop(session);
    assert_eq!(factory.snapshot().closed, 1);
}
