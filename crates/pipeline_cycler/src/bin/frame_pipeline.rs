//! # Frame Pipeline Demo
//!
//! Runs App / Cull / Draw over a handful of cyclers for a number of frames:
//!
//! ```text
//!   App (main thread)  writes frame N into stage 0
//!        │ crossbeam channel: "frame N ready"
//!        ├──► Cull thread reads its stage
//!        └──► Draw thread reads its stage
//!        │ both report back
//!   Pipeline::cycle()
//! ```
//!
//! Every stage must see data exactly `stage` frames old.
//!
//! Usage: `frame_pipeline [config.toml] [frames]`

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use pipeline_cycler::{
    Cycler, Pipeline, PipelineConfig, PipelineCycler, PipelineResult, StageThread, ThreadingModel,
};

const DEFAULT_FRAMES: u64 = 120;
const STAGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
struct Camera {
    frame: u64,
    position: [f32; 3],
}

#[derive(Clone, Debug, Default)]
struct Lights {
    frame: u64,
    intensities: Vec<f32>,
}

/// Cyclers shared by every stage thread.
struct Scene {
    camera: PipelineCycler<Camera>,
    lights: PipelineCycler<Lights>,
    clock: PipelineCycler<u64>,
}

impl Scene {
    fn new(pipeline: &Arc<Pipeline>) -> Self {
        Self {
            camera: Cycler::with_parent_type(Camera::default(), Some(pipeline), "Camera"),
            lights: Cycler::with_parent_type(
                Lights {
                    frame: 0,
                    intensities: vec![1.0; 8],
                },
                Some(pipeline),
                "LightAttrib",
            ),
            clock: Cycler::with_parent_type(0, Some(pipeline), "ClockObject"),
        }
    }

    /// App work for one frame.
    fn update(&self, app: &StageThread, frame: u64) {
        {
            let mut camera = self.camera.write(app);
            camera.frame = frame;
            camera.position[2] += 0.5;
        }
        {
            let mut lights = self.lights.write(app);
            lights.frame = frame;
            let phase = frame as f32 * 0.1;
            for (i, intensity) in lights.intensities.iter_mut().enumerate() {
                *intensity = (phase + i as f32).sin().abs();
            }
        }
        *self.clock.write(app) = frame;
    }

    /// Reads every cycler at the thread's stage; returns the ages seen.
    fn observe(&self, thread: &StageThread) -> [u64; 3] {
        let camera = self.camera.read(thread).frame;
        let lights = self.lights.read_locked(thread).frame;
        let clock = *self.clock.read_unlocked(thread);
        [camera, lights, clock]
    }
}

#[derive(Debug)]
struct StageReport {
    thread: String,
    frame: u64,
    mismatches: usize,
}

fn stage_worker(scene: &Scene, thread: &StageThread, frames: &Receiver<u64>, reports: &Sender<StageReport>) {
    for frame in frames.iter() {
        let expected = frame.saturating_sub(thread.pipeline_stage() as u64);
        let seen = scene.observe(thread);
        let mismatches = seen.iter().filter(|&&got| got != expected).count();
        if mismatches > 0 {
            tracing::warn!(thread = thread.name(), frame, expected, ?seen, "stage saw the wrong frame");
        }
        let report = StageReport {
            thread: thread.name().to_owned(),
            frame,
            mismatches,
        };
        if reports.send(report).is_err() {
            break;
        }
    }
}

fn load_config(args: &[String]) -> PipelineResult<PipelineConfig> {
    match args.get(1) {
        Some(path) => PipelineConfig::load(path),
        None => Ok(PipelineConfig {
            threading_model: "cull/draw".to_owned(),
            ..PipelineConfig::default()
        }),
    }
}

fn main() -> PipelineResult<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = load_config(&args)?;
    let frames = args
        .get(2)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_FRAMES);
    let model: ThreadingModel = config.threading_model()?;
    let pipeline = config.build()?;

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║           FRAME PIPELINE                                         ║");
    println!("╠══════════════════════════════════════════════════════════════════╣");
    println!("║  Pipeline: {:<54}║", pipeline.to_string());
    println!("║  Threading model: {:<47}║", format!("{model:?}"));
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let scene = Scene::new(&pipeline);
    let app = StageThread::new("app", 0);
    app.bind_current();

    let mut workers = vec![StageThread::new(
        if model.cull_name().is_empty() { "cull" } else { model.cull_name() },
        model.cull_stage(),
    )];
    if model.draw_stage() != model.cull_stage() || model.is_single_threaded() {
        workers.push(StageThread::new(
            if model.draw_name().is_empty() { "draw" } else { model.draw_name() },
            model.draw_stage(),
        ));
    }

    let (report_tx, report_rx) = unbounded::<StageReport>();
    let mut mismatches = 0usize;
    let mut crashed = 0usize;
    let started = Instant::now();

    std::thread::scope(|scope| -> PipelineResult<()> {
        let mut frame_txs = Vec::new();
        let mut handles = Vec::new();
        for worker in &workers {
            let (frame_tx, frame_rx) = unbounded::<u64>();
            let scene = &scene;
            let reports = report_tx.clone();
            let worker = Arc::clone(worker);
            let handle = std::thread::Builder::new()
                .name(worker.name().to_owned())
                .spawn_scoped(scope, move || {
                    worker.bind_current();
                    stage_worker(scene, &worker, &frame_rx, &reports);
                })?;
            frame_txs.push(frame_tx);
            handles.push(handle);
        }

        for frame in 1..=frames {
            scene.update(&app, frame);
            let live = frame_txs.iter().filter(|tx| tx.send(frame).is_ok()).count();
            for _ in 0..live {
                let Ok(report) = report_rx.recv_timeout(STAGE_TIMEOUT) else {
                    tracing::warn!(frame, "stage thread stopped reporting");
                    crashed += 1;
                    break;
                };
                debug_assert_eq!(report.frame, frame);
                if report.mismatches > 0 {
                    println!("  ✗ frame {}: {} saw {} stale values", report.frame, report.thread, report.mismatches);
                }
                mismatches += report.mismatches;
            }
            let cycled = pipeline.cycle();
            if frame % 30 == 0 {
                println!(
                    "  frame {:>5}: cycled {} cyclers, {} still dirty",
                    cycled.frame, cycled.cycled, cycled.still_dirty
                );
            }
        }

        drop(frame_txs);
        for handle in handles {
            if handle.join().is_err() {
                crashed += 1;
            }
        }
        Ok(())
    })?;

    let elapsed = started.elapsed();
    println!();
    println!("┌─ RESULTS ───────────────────────────────────────────────────────┐");
    println!("│ Frames:          {frames}");
    println!("│ Stages:          {}", pipeline.num_stages());
    println!("│ Stage threads:   {}", workers.len());
    println!("│ Cyclers:         {:?}", pipeline.cycler_types());
    println!("│ Frame time:      {:.3} ms", elapsed.as_secs_f64() * 1000.0 / frames.max(1) as f64);
    if mismatches == 0 && crashed == 0 {
        println!("│ ✓ Every stage saw data exactly its depth in frames old");
    } else {
        println!("│ ✗ {mismatches} stale reads, {crashed} crashed stage threads");
    }
    println!("└──────────────────────────────────────────────────────────────────┘");

    if mismatches > 0 || crashed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
