mod common;

use std::sync::Arc;

use bunker_transcode::error::{PipelineError, SendStatus};
use bunker_transcode::output::{PayloadKind, TaskOutput};
use bunker_transcode::pipeline::{Pipeline, StageRegistry, build_pipeline};
use bunker_transcode::scheduler::StageKind;
use bunker_transcode::soft::SoftDevice;
use bunker_transcode::stages::{AudioRoute, AudioTask, PipelineTask, RetryPolicy, TaskCore};
use bunker_transcode::backoff::InstantBackoff;
use common::{CollectingWriter, ScriptedReader, SharedPackets, spec};
use serde_json::json;

fn trimmed_pipeline(ranges: serde_json::Value, frames: usize) -> (Pipeline, CollectingWriter) {
    let info = common::small_info();
    let device = SoftDevice::new(info, Default::default());
    let ctx = common::context(&device, common::raw_reader(info, frames), RetryPolicy::default());
    let stages = vec![spec("input", &[]), spec("trim", &[("ranges", ranges)])];
    let mut pipeline = build_pipeline(&StageRegistry::with_defaults(), &stages, &ctx).unwrap();
    pipeline.allocate().unwrap();
    let mut writer = CollectingWriter::new(PayloadKind::Surface);
    pipeline.run(&mut writer).unwrap();
    (pipeline, writer)
}

#[test]
fn trim_keeps_only_frames_inside_the_range() {
    let (pipeline, writer) = trimmed_pipeline(json!([{"start": 2, "end": 4}]), 6);
    assert_eq!(writer.markers(), vec![2, 3, 4]);

    let trim = &pipeline.tasks()[1];
    assert_eq!(trim.kind(), StageKind::Trim);
    assert_eq!(trim.core().in_frames(), 6);
    assert_eq!(trim.core().out_frames(), 3);
}

#[test]
fn trim_ranges_can_be_open_ended_and_combined() {
    let (_pipeline, writer) = trimmed_pipeline(json!([{"start": 0, "end": 0}, {"start": 4}]), 6);
    assert_eq!(writer.markers(), vec![0, 4, 5]);
}

#[test]
fn trim_without_ranges_keeps_everything() {
    let (_pipeline, writer) = trimmed_pipeline(json!([]), 3);
    assert_eq!(writer.markers(), vec![0, 1, 2]);
}

fn audio_core() -> TaskCore {
    TaskCore::new(
        StageKind::Audio,
        0,
        RetryPolicy::default(),
        Arc::new(InstantBackoff::new()),
    )
}

#[test]
fn audio_routes_packets_interleaved_with_video_frames() {
    let info = common::small_info();
    let device = SoftDevice::new(info, Default::default());
    let reader = ScriptedReader::new(info, &[0, 1, 2])
        .with_packet(0, 1, b"a0")
        .with_packet(1, 1, b"a1")
        .with_packet(1, 2, b"b1")
        .with_packet(2, 1, b"a2")
        .shared();
    let ctx = common::context(&device, reader.clone(), RetryPolicy::default());

    let muxed = SharedPackets::default();
    let filtered = SharedPackets::default();
    let mut audio = AudioTask::new(audio_core(), reader.clone());
    audio.route(1, AudioRoute::Muxer(Box::new(muxed.clone())));
    audio.route(2, AudioRoute::Filter(Box::new(filtered.clone())));

    let input = StageRegistry::with_defaults()
        .create("input", Default::default(), &ctx)
        .unwrap();
    let tasks: Vec<Box<dyn PipelineTask>> = vec![input, Box::new(audio)];
    let mut pipeline = Pipeline::new(tasks, ctx.device.clone());
    pipeline.allocate().unwrap();
    let mut writer = CollectingWriter::new(PayloadKind::Surface);
    pipeline.run(&mut writer).unwrap();

    assert_eq!(writer.markers(), vec![0, 1, 2]);
    let muxed: Vec<Vec<u8>> = muxed.0.lock().unwrap().iter().map(|p| p.data.clone()).collect();
    assert_eq!(muxed, vec![b"a0".to_vec(), b"a1".to_vec(), b"a2".to_vec()]);
    assert_eq!(filtered.0.lock().unwrap().len(), 1);
    assert_eq!(pipeline.tasks()[1].core().in_frames(), 3);
}

/// One frame loaded by a standalone input stage.
fn first_frame(ctx: &bunker_transcode::stages::StageContext) -> TaskOutput {
    let mut input = StageRegistry::with_defaults()
        .create("input", Default::default(), ctx)
        .unwrap();
    let request = input.required_output().unwrap().unwrap();
    input
        .core_mut()
        .allocate_pool(&request, false, ctx.device.allocator.clone())
        .unwrap();
    assert_eq!(input.send_frame(None).unwrap(), SendStatus::Done);
    input.drain_outputs(false).unwrap().remove(0)
}

#[test]
fn audio_without_routes_forwards_frames_and_leaves_packets() {
    let info = common::small_info();
    let device = SoftDevice::new(info, Default::default());
    let reader = ScriptedReader::new(info, &[0]).with_packet(0, 9, b"x").shared();
    let ctx = common::context(&device, reader.clone(), RetryPolicy::default());
    let mut audio = AudioTask::new(audio_core(), reader.clone());

    assert_eq!(audio.send_frame(Some(first_frame(&ctx))).unwrap(), SendStatus::Done);
    assert_eq!(audio.packets(), 0);
    assert_eq!(audio.drain_outputs(false).unwrap().len(), 1);
    assert_eq!(reader.lock().unwrap().stream_packets(10).unwrap().len(), 1);
}

#[test]
fn unrouted_track_is_an_error() {
    let info = common::small_info();
    let device = SoftDevice::new(info, Default::default());
    let reader = ScriptedReader::new(info, &[0])
        .with_packet(0, 7, b"x")
        .shared();
    let ctx = common::context(&device, reader.clone(), RetryPolicy::default());
    let mut audio = AudioTask::new(audio_core(), reader.clone());
    audio.route(1, AudioRoute::Muxer(Box::new(SharedPackets::default())));

    let err = audio.send_frame(Some(first_frame(&ctx))).unwrap_err();
    assert!(matches!(err, PipelineError::TrackNotRouted { track: 7 }));
}

#[test]
fn dropped_frames_extend_the_packet_limit() {
    let info = common::small_info();
    let device = SoftDevice::new(info, Default::default());
    let reader = ScriptedReader::new(info, &[0])
        .with_packet(0, 1, b"first")
        .with_packet(2, 1, b"after-drop")
        .with_packet(5, 1, b"later")
        .with_dropped(2)
        .shared();
    let ctx = common::context(&device, reader.clone(), RetryPolicy::default());
    let sink = SharedPackets::default();
    let mut audio = AudioTask::new(audio_core(), reader.clone());
    audio.route(1, AudioRoute::Muxer(Box::new(sink.clone())));

    let input = StageRegistry::with_defaults()
        .create("input", Default::default(), &ctx)
        .unwrap();
    let tasks: Vec<Box<dyn PipelineTask>> = vec![input, Box::new(audio)];
    let mut pipeline = Pipeline::new(tasks, ctx.device.clone());
    pipeline.allocate().unwrap();
    pipeline
        .run(&mut CollectingWriter::new(PayloadKind::Surface))
        .unwrap();

    let delivered: Vec<Vec<u8>> = sink.0.lock().unwrap().iter().map(|p| p.data.clone()).collect();
    assert_eq!(delivered, vec![b"first".to_vec(), b"after-drop".to_vec()]);
}

#[test]
fn extra_readers_are_merged_up_to_the_same_frame() {
    let info = common::small_info();
    let device = SoftDevice::new(info, Default::default());
    let reader = ScriptedReader::new(info, &[0]).with_packet(0, 1, b"main").shared();
    let extra = ScriptedReader::new(info, &[])
        .with_packet(0, 5, b"e0")
        .with_packet(3, 5, b"e3")
        .shared();
    let ctx = common::context(&device, reader.clone(), RetryPolicy::default());

    let main = SharedPackets::default();
    let dubbed = SharedPackets::default();
    let mut audio = AudioTask::new(audio_core(), reader.clone());
    audio.add_reader(extra.clone());
    audio.route(1, AudioRoute::Muxer(Box::new(main.clone())));
    audio.route(5, AudioRoute::Muxer(Box::new(dubbed.clone())));

    assert_eq!(audio.send_frame(Some(first_frame(&ctx))).unwrap(), SendStatus::Done);
    assert_eq!(audio.packets(), 2);
    assert_eq!(main.0.lock().unwrap().len(), 1);
    let dubbed: Vec<Vec<u8>> = dubbed.0.lock().unwrap().iter().map(|p| p.data.clone()).collect();
    assert_eq!(dubbed, vec![b"e0".to_vec()]);
    assert_eq!(extra.lock().unwrap().stream_packets(10).unwrap().len(), 1);
}
