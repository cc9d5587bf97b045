//! Render-loop simulation driving the cadence scheduler.
//!
//! Runs a fixed number of frames at a configurable rate, with a frame
//! heartbeat task, a worker-pool computation that hops off and back onto the
//! main thread, cross-thread submissions, and a watchdog that is cancelled
//! with its scope at shutdown.
//!
//! # Usage
//!
//! ```sh
//! frame-demo --fps 60 --frames 120 --workers 2
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cadence::topology::CpuConfig;
use cadence::{
    MainDispatcher, WorkerPool, WorkerPoolConfig, current_is_main, global_scope, local_scope,
    main_dispatcher, skip_tick, submit_to_main, switch_to,
};

/// Default frames per second for the simulated render loop.
const DEFAULT_FPS: u32 = 60;

/// Default number of frames to run before shutting down.
const DEFAULT_FRAMES: u64 = 120;

/// Default worker-pool size.
const DEFAULT_WORKERS: usize = 2;

struct DemoConfig {
    fps: u32,
    frames: u64,
    workers: usize,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("frame-demo: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    cadence::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let config = parse_args(&args)?;
    let frame_duration = Duration::from_secs(1) / config.fps;

    eprintln!(
        "frame-demo: {} frames at {} fps, {} worker(s)",
        config.frames, config.fps, config.workers
    );

    let pool = WorkerPool::with_config(WorkerPoolConfig {
        threads: config.workers,
        name: "demo-worker".to_string(),
        cpu: CpuConfig::Auto,
    })?;

    // A heartbeat that wakes once per frame for the first half of the run.
    let beats = Arc::new(AtomicU64::new(0));
    let heartbeat = {
        let beats = Arc::clone(&beats);
        let half = config.frames / 2;
        global_scope().launch(async move {
            for _ in 0..half {
                beats.fetch_add(1, Ordering::Relaxed);
                skip_tick().await;
            }
        })
    };

    // A computation that hops onto the pool and back.
    let compute = {
        let dispatcher = pool.dispatcher();
        global_scope().launch(async move {
            assert!(current_is_main());
            let sum = switch_to(&dispatcher, async {
                assert!(!current_is_main());
                (1u64..=1_000_000).sum::<u64>()
            })
            .await;
            assert!(current_is_main());
            sum
        })
    };

    // A watchdog in its own scope, cancelled at shutdown.
    let watchdog_scope = local_scope();
    let watchdog = watchdog_scope.launch(watch_frames());

    // Cross-thread submissions racing the render loop.
    let submitter = thread::spawn(|| {
        for i in 0..32u32 {
            submit_to_main(move || {
                assert!(current_is_main(), "submission {i} must run on main");
            });
            thread::sleep(Duration::from_millis(1));
        }
    });

    // The render loop itself: one flush per frame, on this thread.
    let main = main_dispatcher();
    for _ in 0..config.frames {
        main.flush();
        thread::sleep(frame_duration);
    }

    // Drain stragglers so the demo tasks can finish.
    while !(heartbeat.is_finished() && compute.is_finished()) {
        main.flush();
        thread::sleep(frame_duration);
    }
    submitter.join().expect("submitter thread panicked");

    watchdog_scope.cancel();
    main.flush();
    let watchdog_outcome = watchdog
        .join()
        .expect_err("the watchdog never finishes on its own");
    assert!(watchdog_outcome.is_cancelled());

    report(main, &beats, compute.join().expect("compute task failed"));
    pool.shutdown();
    Ok(())
}

/// Never finishes on its own; cancelled with its scope at shutdown.
async fn watch_frames() {
    loop {
        skip_tick().await;
    }
}

fn report(main: &MainDispatcher, beats: &AtomicU64, sum: u64) {
    eprintln!("frame-demo: ticks flushed       {}", main.ticks());
    eprintln!("frame-demo: entries executed    {}", main.executed());
    eprintln!("frame-demo: last flush          {} us", main.last_flush_micros());
    eprintln!("frame-demo: heartbeat frames    {}", beats.load(Ordering::Relaxed));
    eprintln!("frame-demo: pool computation    {sum}");
    eprintln!("frame-demo: watchdog cancelled  (expected)");
}

fn parse_args(args: &[String]) -> Result<DemoConfig, Box<dyn std::error::Error>> {
    let mut fps = DEFAULT_FPS;
    let mut frames = DEFAULT_FRAMES;
    let mut workers = DEFAULT_WORKERS;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--fps" | "-f" => {
                i += 1;
                fps = arg_value(args, i, "--fps")?.parse()?;
            }
            "--frames" | "-n" => {
                i += 1;
                frames = arg_value(args, i, "--frames")?.parse()?;
            }
            "--workers" | "-w" => {
                i += 1;
                workers = arg_value(args, i, "--workers")?.parse()?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(format!("unknown argument: {arg}").into()),
        }
        i += 1;
    }

    if fps == 0 {
        return Err("--fps must be at least 1".into());
    }
    Ok(DemoConfig {
        fps,
        frames,
        workers,
    })
}

fn arg_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn print_usage() {
    eprintln!(
        r#"frame-demo - cadence render-loop simulation

USAGE:
    frame-demo [OPTIONS]

OPTIONS:
    -f, --fps <N>       Frames per second (default: 60)
    -n, --frames <N>    Frames to run before shutdown (default: 120)
    -w, --workers <N>   Worker-pool threads (default: 2)
    -h, --help          Print this help message

EXAMPLE:
    frame-demo --fps 30 --frames 60 --workers 4
"#
    );
}
