use std::sync::Arc;
use std::time::{Duration, Instant};

use compositor::{RenderService, ServiceEvent};
use crossbeam_channel::Receiver;
use image::{Rgba, RgbaImage};
use renderconfig::PipelineConfig;
use renderer::{
    BackendLimits, CanvasParams, Filter, FilterParams, FrameSink, LayerId, LayerParams,
    LimitsValidator, ParamValidator, PresentedFrame, Quality, ResponseData, StylizeParams,
    SurfaceTarget, ToneParams, Transform,
};
use scheduler::{ErrorCode, TaskId};

fn start(width: u32, height: u32) -> (RenderService, Receiver<PresentedFrame>) {
    let service = RenderService::spawn(PipelineConfig::default()).unwrap();
    start_with(service, width, height)
}

fn start_with(
    mut service: RenderService,
    width: u32,
    height: u32,
) -> (RenderService, Receiver<PresentedFrame>) {
    let (sink, frames) = FrameSink::channel();
    let init = service.initialize(SurfaceTarget::Memory(sink), width, height);
    let events = run_until_terminal(&mut service, init);
    assert!(
        matches!(events.last(), Some(ServiceEvent::Completed { .. })),
        "{events:?}"
    );
    (service, frames)
}

fn run_until_terminal(service: &mut RenderService, id: TaskId) -> Vec<ServiceEvent> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        for event in service.wait(Duration::from_millis(100)) {
            let done = event.id() == id && event.is_terminal();
            seen.push(event);
            if done {
                return seen;
            }
        }
    }
    panic!("{id} did not finish; saw {seen:?}");
}

fn solid(width: u32, height: u32, px: [u8; 4]) -> Arc<RgbaImage> {
    Arc::new(RgbaImage::from_pixel(width, height, Rgba(px)))
}

fn close(actual: [u8; 4], expected: [u8; 4]) -> bool {
    actual
        .iter()
        .zip(expected)
        .all(|(a, e)| (i16::from(*a) - i16::from(e)).abs() <= 1)
}

#[test]
fn half_blue_over_red_composites_to_purple() {
    let (mut service, frames) = start(4, 4);
    let layers = vec![
        LayerParams::image(LayerId(2), "blue", solid(4, 4, [0, 0, 255, 255])).with_opacity(50.0),
        LayerParams::image(LayerId(1), "red", solid(4, 4, [255, 0, 0, 255])),
    ];
    let id = service.render(layers, CanvasParams::new(4, 4), false);
    let events = run_until_terminal(&mut service, id);

    match events.last() {
        Some(ServiceEvent::Completed {
            data:
                ResponseData::Rendered {
                    layers_drawn,
                    quality,
                    ..
                },
            ..
        }) => {
            assert_eq!(*layers_drawn, 2);
            assert_eq!(*quality, Quality::Full);
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
    let frame = frames.try_iter().last().unwrap();
    assert!(close(frame.image.get_pixel(1, 1).0, [128, 0, 128, 255]));
}

#[test]
fn empty_stack_presents_transparent_frame() {
    let (mut service, frames) = start(3, 3);
    let id = service.render(Vec::new(), CanvasParams::new(3, 3), false);
    let events = run_until_terminal(&mut service, id);

    assert!(matches!(
        events.last(),
        Some(ServiceEvent::Completed {
            data: ResponseData::Rendered { layers_drawn: 0, .. },
            ..
        })
    ));
    let frame = frames.try_iter().last().unwrap();
    assert!(frame.image.pixels().all(|px| px.0 == [0, 0, 0, 0]));
}

#[test]
fn identity_filter_returns_source_pixels() {
    let (mut service, _frames) = start(4, 4);
    let source = solid(5, 3, [10, 120, 200, 255]);
    let id = service.apply_filter(LayerId(9), Filter::Tone(ToneParams::default()), source);
    let events = run_until_terminal(&mut service, id);

    match events.last() {
        Some(ServiceEvent::Completed {
            data: ResponseData::Filtered { layer_id, image },
            ..
        }) => {
            assert_eq!(*layer_id, LayerId(9));
            assert_eq!(image.dimensions(), (5, 3));
            assert!(close(image.get_pixel(2, 1).0, [10, 120, 200, 255]));
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[test]
fn only_the_newest_generation_is_presented() {
    let (mut service, frames) = start(2, 2);
    let canvas = CanvasParams::new(2, 2);
    let render = |service: &mut RenderService, px: [u8; 4]| {
        let layer = LayerParams::image(LayerId(1), format!("{px:?}"), solid(2, 2, px));
        service.render(vec![layer], canvas, false)
    };
    let first = render(&mut service, [255, 0, 0, 255]);
    let second = render(&mut service, [0, 255, 0, 255]);
    let third = render(&mut service, [0, 0, 255, 255]);

    let events = run_until_terminal(&mut service, third);
    for superseded in [first, second] {
        assert!(
            events
                .iter()
                .any(|event| matches!(event, ServiceEvent::Preempted { id } if *id == superseded)),
            "{superseded} was not preempted: {events:?}"
        );
        assert!(!events
            .iter()
            .any(|event| matches!(event, ServiceEvent::Completed { id, .. } if *id == superseded)));
    }
    assert!(matches!(
        events.last(),
        Some(ServiceEvent::Completed {
            data: ResponseData::Rendered { generation: 3, .. },
            ..
        })
    ));

    let presented: Vec<_> = frames.try_iter().collect();
    assert!(!presented.is_empty());
    assert!(presented.iter().all(|frame| frame.generation == 3));
    assert_eq!(presented[0].image.get_pixel(0, 0).0, [0, 0, 255, 255]);
}

#[test]
fn oversize_canvas_fails_without_retry() {
    let (mut service, _frames) = start(2, 2);
    let id = service.render(Vec::new(), CanvasParams::new(100_000, 4), false);
    let events = run_until_terminal(&mut service, id);

    match events.last() {
        Some(ServiceEvent::Failed { failure, .. }) => {
            assert_eq!(failure.code, ErrorCode::Dimension);
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert!(!events
        .iter()
        .any(|event| matches!(event, ServiceEvent::Retrying { .. })));
    assert_eq!(service.snapshot().retried, 0);
}

#[test]
fn surface_cannot_be_initialised_twice() {
    let (mut service, _frames) = start(2, 2);
    let (sink, _) = FrameSink::channel();
    let id = service.initialize(SurfaceTarget::Memory(sink), 2, 2);
    let events = run_until_terminal(&mut service, id);

    match events.last() {
        Some(ServiceEvent::Failed { failure, .. }) => assert_eq!(failure.code, ErrorCode::Init),
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[test]
fn resize_changes_presented_frame_size() {
    let (mut service, frames) = start(4, 4);
    let id = service.resize(8, 6);
    let events = run_until_terminal(&mut service, id);
    assert!(matches!(
        events.last(),
        Some(ServiceEvent::Completed {
            data: ResponseData::Resized { width: 8, height: 6 },
            ..
        })
    ));

    let layer = LayerParams::image(LayerId(1), "grey", solid(4, 4, [90, 90, 90, 255]));
    let id = service.render(vec![layer], CanvasParams::new(4, 4), false);
    run_until_terminal(&mut service, id);
    let frame = frames.try_iter().last().unwrap();
    assert_eq!(frame.image.dimensions(), (8, 6));
}

#[test]
fn queued_task_can_be_cancelled() {
    let (mut service, _frames) = start(2, 2);
    let id = service.render(Vec::new(), CanvasParams::new(2, 2), false);
    assert!(service.cancel(id));
    assert!(!service.cancel(id));

    let events = run_until_terminal(&mut service, id);
    assert!(matches!(events.last(), Some(ServiceEvent::Cancelled { .. })));
    assert!(service.is_idle());
}

#[test]
fn interactive_render_completes_with_a_draft() {
    let (mut service, frames) = start(4, 4);
    let layer = LayerParams::image(LayerId(1), "teal", solid(4, 4, [0, 128, 128, 255]));
    let id = service.render(vec![layer], CanvasParams::new(4, 4), true);
    let events = run_until_terminal(&mut service, id);
    assert!(matches!(
        events.last(),
        Some(ServiceEvent::Completed {
            data: ResponseData::Rendered {
                quality: Quality::Draft,
                ..
            },
            ..
        })
    ));

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut qualities = Vec::new();
    while Instant::now() < deadline && !qualities.contains(&Quality::Full) {
        if let Ok(frame) = frames.recv_timeout(Duration::from_millis(100)) {
            qualities.push(frame.quality);
        }
    }
    assert_eq!(qualities, vec![Quality::Draft, Quality::Full]);
}

#[test]
fn cancelled_in_flight_render_is_never_presented() {
    let (mut service, frames) = start(512, 512);
    let layer = LayerParams::image(LayerId(1), "large", solid(512, 512, [200, 10, 10, 255]))
        .with_filters(FilterParams {
            blur: 32.0,
            ..FilterParams::default()
        });
    let id = service.render(vec![layer], CanvasParams::new(512, 512), false);
    let dispatched = service.pump(Instant::now());
    assert!(dispatched.is_empty(), "{dispatched:?}");
    assert_eq!(service.snapshot().in_flight_render, 1);
    assert!(service.cancel(id));

    // The worker handles requests in order, so once the resize is answered
    // the cancelled render has been dropped or abandoned.
    let resize = service.resize(512, 512);
    let events = run_until_terminal(&mut service, resize);
    assert!(events
        .iter()
        .any(|event| matches!(event, ServiceEvent::Cancelled { id: cancelled } if *cancelled == id)));
    assert!(!events
        .iter()
        .any(|event| matches!(event, ServiceEvent::Completed { id: done, .. } if *done == id)));
    assert!(frames.try_iter().all(|frame| frame.generation != 1));
}

/// Panics inside the worker thread as soon as a tone pass runs.
struct Crashing(LimitsValidator);

impl ParamValidator for Crashing {
    fn blur_radius(&self, radius: f32, limits: &BackendLimits) -> f32 {
        self.0.blur_radius(radius, limits)
    }

    fn dimensions(&self, width: u32, height: u32, limits: &BackendLimits) -> Result<(), String> {
        self.0.dimensions(width, height, limits)
    }

    fn opacity(&self, percent: f32) -> f32 {
        self.0.opacity(percent)
    }

    fn transform(&self, transform: Transform) -> Transform {
        self.0.transform(transform)
    }

    fn stylize(&self, params: StylizeParams) -> StylizeParams {
        self.0.stylize(params)
    }

    fn tone(&self, _params: ToneParams) -> ToneParams {
        panic!("tone pass crashed");
    }
}

#[test]
fn lost_worker_fails_in_flight_task_promptly() {
    let service = RenderService::spawn_with_validator(
        PipelineConfig::default(),
        Arc::new(Crashing(LimitsValidator::default())),
    )
    .unwrap();
    let (mut service, _frames) = start_with(service, 2, 2);
    let layer = LayerParams::image(LayerId(1), "red", solid(2, 2, [255, 0, 0, 255]));
    let id = service.render(vec![layer], CanvasParams::new(2, 2), false);

    let started = Instant::now();
    let events = run_until_terminal(&mut service, id);
    match events.last() {
        Some(ServiceEvent::Failed { failure, .. }) => assert_eq!(failure.code, ErrorCode::Init),
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(service.wait(Duration::from_secs(2)).is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
}
