//! Stress driver hammering one gate with randomly nested entries from a pool of threads while a
//! few other threads periodically close/open it. A shared occupancy counter checks no entry ever
//! overlaps a held close. The run stops early upon SIGINT/SIGTERM and prints a JSON report.
#[macro_use]
extern crate clap;
#[macro_use]
extern crate slog;

use rand::{thread_rng, Rng};
use regate::primitives::event::*;
use regate::primitives::gate::*;
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, LevelFilter, Logger};
use slog_async::{Async, AsyncGuard};
use slog_term::{FullFormat, PlainSyncDecorator};
use std::fs::File;
use std::hint::spin_loop;
use std::io::{stderr, Write};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    enterers: usize,
    closers: usize,
    iterations: usize,
    depth: usize,
    timeout: i64,
    spins: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            enterers: 16,
            closers: 2,
            iterations: 10_000,
            depth: 3,
            timeout: 50,
            spins: 200,
        }
    }
}

#[derive(Default)]
struct Counters {
    entries: AtomicUsize,
    enter_timeouts: AtomicUsize,
    closes: AtomicUsize,
    close_timeouts: AtomicUsize,
    overlaps: AtomicUsize,
    violations: AtomicUsize,
}

#[derive(Debug, Serialize)]
struct Report {
    settings: Settings,
    entries: usize,
    enter_timeouts: usize,
    closes: usize,
    close_timeouts: usize,
    overlaps: usize,
    violations: usize,
    elapsed_ms: u64,
    interrupted: bool,
    gate: Snapshot,
}

fn random_work(spins: usize) -> () {
    let mut rng = thread_rng();
    for _ in 0..rng.gen_range(0, spins + 1) {
        spin_loop();
    }
}

/// Async slog logger writing to `out`. Dropping the guard flushes and joins the logging thread
/// even if logger clones are still alive somewhere.
fn logger<W>(out: W, level: Level) -> (Logger, AsyncGuard)
where
    W: Write + Send + 'static,
{
    let decorator = PlainSyncDecorator::new(out);
    let formatted = FullFormat::new(decorator).build().fuse();
    let (drain, guard) = Async::new(formatted).build_with_guard();
    let filter = LevelFilter::new(drain.fuse(), level).fuse();
    (Logger::root(filter, o!()), guard)
}

/// Enters the gate `depth` times, spins and exits as many times as it entered. Returns false if
/// the outermost entry timed out. A nested entry timing out or an exit being refused are gate
/// invariant breaks and are counted as violations.
fn enter_nested(
    gate: &Gate,
    depth: usize,
    timeout: Timeout,
    spins: usize,
    inside: &AtomicUsize,
    counters: &Counters,
) -> bool {
    if !gate.enter_for(timeout) {
        counters.enter_timeouts.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    inside.fetch_add(1, Ordering::SeqCst);
    let mut held = 1;
    for _ in 1..depth {
        if gate.enter_for(timeout) {
            held += 1;
        } else {
            counters.violations.fetch_add(1, Ordering::Relaxed);
        }
    }
    random_work(spins);
    inside.fetch_sub(1, Ordering::SeqCst);
    for _ in 0..held {
        if gate.exit().is_err() {
            counters.violations.fetch_add(1, Ordering::Relaxed);
        }
    }
    counters.entries.fetch_add(1, Ordering::Relaxed);
    true
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {

    //
    // - parse the CLI line
    //
    let args = clap_app!(stress =>
        (version: env!("CARGO_PKG_VERSION"))
        (about: "hammers a reentrant gate and checks closes never overlap entries")
        (@arg CONFIG: --config +takes_value "json settings file")
        (@arg ENTERERS: -e --enterers +takes_value "number of entering threads")
        (@arg CLOSERS: -c --closers +takes_value "number of closing threads")
        (@arg ITERATIONS: -n --iterations +takes_value "iterations per thread")
        (@arg DEPTH: -d --depth +takes_value "maximum nesting depth per entry")
        (@arg TIMEOUT: -t --timeout +takes_value +allow_hyphen_values "enter/close timeout in ms (-1 waits forever)")
        (@arg SPINS: -s --spins +takes_value "maximum spins while holding the gate")
        (@arg VERBOSE: -v --verbose "log the gate close/open transitions")
    ).get_matches();

    //
    // - init slog to dump on stderr
    // - the async guard flushes and joins the logging thread when run() returns, the
    //   signal handler keeps a logger alive until the process exits
    //
    let level = if args.is_present("VERBOSE") { Level::Debug } else { Level::Info };
    let (root, _flush) = logger(stderr(), level);
    let log = root.new(o!("sys" => "main"));
    debug!(&log, "starting (version={})", env!("CARGO_PKG_VERSION"));

    //
    // - optionally load the settings from a json file
    // - any CLI argument overrides what the file says
    //
    let mut settings = match value_t!(args, "CONFIG", String) {
        Ok(path) => match File::open(&path).map_err(|e| e.to_string()).and_then(|f| {
            serde_json::from_reader::<_, Settings>(f).map_err(|e| e.to_string())
        }) {
            Ok(settings) => settings,
            Err(e) => {
                crit!(&log, "unable to load {} ({})", path, e);
                return 1;
            }
        },
        Err(_) => Settings::default(),
    };

    settings.enterers = value_t!(args, "ENTERERS", usize).unwrap_or(settings.enterers);
    settings.closers = value_t!(args, "CLOSERS", usize).unwrap_or(settings.closers);
    settings.iterations = value_t!(args, "ITERATIONS", usize).unwrap_or(settings.iterations);
    settings.depth = value_t!(args, "DEPTH", usize).unwrap_or(settings.depth).max(1);
    settings.timeout = value_t!(args, "TIMEOUT", i64).unwrap_or(settings.timeout);
    settings.spins = value_t!(args, "SPINS", usize).unwrap_or(settings.spins);

    let timeout = match Timeout::from_millis(settings.timeout) {
        Ok(timeout) => timeout,
        Err(e) => {
            crit!(&log, "{}", e);
            return 1;
        }
    };
    info!(&log, "running {:?}", settings);

    //
    // - trap SIGINT/SIGTERM and flip the stop flag
    // - each worker checks it between iterations
    //
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        let handler = log.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!(&handler, "interrupted, stopping");
            stop.store(true, Ordering::Release);
        }) {
            warn!(&log, "unable to trap signals ({})", e);
        }
    }

    let gate = Arc::new(Gate::with(root.new(o!("sys" => "gate"))));
    let inside = Arc::new(AtomicUsize::new(0));
    let counters = Arc::new(Counters::default());
    let event = Event::new();
    let start = Instant::now();

    {
        let guard = event.guard();
        for _ in 0..settings.enterers {

            let gate = gate.clone();
            let guard = guard.clone();
            let inside = inside.clone();
            let counters = counters.clone();
            let stop = stop.clone();
            let settings = settings.clone();
            let _ = thread::spawn(move || {

                let mut rng = thread_rng();
                for _ in 0..settings.iterations {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }

                    //
                    // - only the outermost entry may time out
                    // - nested entries go through right away
                    //
                    let depth = rng.gen_range(1, settings.depth + 1);
                    let _ = enter_nested(&gate, depth, timeout, settings.spins, &inside, &counters);
                }
                drop(guard);
            });
        }

        for _ in 0..settings.closers {

            let gate = gate.clone();
            let guard = guard.clone();
            let inside = inside.clone();
            let counters = counters.clone();
            let stop = stop.clone();
            let settings = settings.clone();
            let _ = thread::spawn(move || {

                for _ in 0..settings.iterations / 10 {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    match gate.closed(timeout) {
                        None => {
                            counters.close_timeouts.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(_closed) => {

                            //
                            // - nobody but us may be inside while we hold the close
                            //
                            if inside.load(Ordering::SeqCst) != 0 {
                                counters.overlaps.fetch_add(1, Ordering::Relaxed);
                            }
                            random_work(settings.spins);
                            if inside.load(Ordering::SeqCst) != 0 {
                                counters.overlaps.fetch_add(1, Ordering::Relaxed);
                            }
                            counters.closes.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                drop(guard);
            });
        }
    }

    //
    // - block until every worker dropped its guard
    //
    event.wait();
    let report = Report {
        settings,
        entries: counters.entries.load(Ordering::Relaxed),
        enter_timeouts: counters.enter_timeouts.load(Ordering::Relaxed),
        closes: counters.closes.load(Ordering::Relaxed),
        close_timeouts: counters.close_timeouts.load(Ordering::Relaxed),
        overlaps: counters.overlaps.load(Ordering::Relaxed),
        violations: counters.violations.load(Ordering::Relaxed),
        elapsed_ms: start.elapsed().as_millis() as u64,
        interrupted: stop.load(Ordering::Acquire),
        gate: gate.snapshot(),
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!(&log, "unable to serialize the report ({})", e),
    }

    if report.overlaps > 0 || report.violations > 0 || report.gate.entered > 0 || report.gate.closed > 0 {
        crit!(&log, "gate invariant violated"; "overlaps" => report.overlaps, "violations" => report.violations);
        1
    } else {
        info!(&log, "exiting");
        0
    }
}
