//! Basic EVMA example
//!
//! Spawns a handful of cooperating tasks: yielding counters, a sleeper
//! that gets woken early, and a file read through the worker pool.
//!
//! # Environment Variables
//!
//! - `EVMA_LOG_LEVEL=debug` - set log level (off, error, warn, info, debug, trace)
//! - `EVMA_FLUSH_EPRINT=1` - flush debug output immediately
//!
// EVMA_LOG_LEVEL=debug cargo run -p evma-basic -- /etc/hostname

use evma::parsers::All;
use evma::{kinfo, open, Outcome, Progress, Runtime, RuntimeConfig, Sleeper, Value};

fn main() {
    println!("=== EVMA Basic Example ===\n");

    evma::init_logging();

    let mut rt = match Runtime::new(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("basic: {}", e);
            std::process::exit(evma::EXIT_FAILURE);
        }
    };

    // Yielding counters: two tasks interleaving through the run queue
    for name in ["even", "odd"] {
        let mut round = 0;
        rt.spawn_fn(move |rt, _| {
            println!("[{}] round {}", name, round);
            round += 1;
            if round < 3 {
                rt.yield_now();
                return Outcome::Suspended;
            }
            Outcome::Finished
        });
    }

    // A sleeper another task pokes before the timeout
    let sleeper = Sleeper::new();
    let poked = sleeper.clone();
    let mut slept = false;
    rt.spawn_fn(move |rt, args| {
        if !slept {
            slept = true;
            kinfo!("sleeping up to 5s...");
            return match sleeper.sleep(rt, Some(5.0)) {
                Progress::Suspended => Outcome::Suspended,
                Progress::Complete(_) => Outcome::Finished,
            };
        }
        match args.first() {
            Some(Value::Nil) => println!("[sleeper] timed out"),
            Some(v) => println!("[sleeper] woken: {:?}", v),
            None => println!("[sleeper] woken"),
        }
        Outcome::Finished
    });
    rt.spawn_fn(move |rt, _| {
        poked.wakeup(rt, vec![Value::Str("good morning".into())]);
        Outcome::Finished
    });

    // Read a file through the worker pool
    let path = std::env::args().nth(1).unwrap_or_else(|| "/etc/hostname".to_owned());
    let mut step = 0;
    rt.spawn_fn(move |rt, args| match step {
        0 => {
            step = 1;
            match open(rt, &path, "r") {
                Progress::Suspended => Outcome::Suspended,
                Progress::Complete(vals) => {
                    eprintln!("basic: open: {:?}", vals.get(1));
                    Outcome::Finished
                }
            }
        }
        1 => {
            if args[0].is_nil() {
                eprintln!("basic: open: {:?}", args.get(1));
                return Outcome::Finished;
            }
            step = 2;
            let file = args[0].downcast::<evma::File>().expect("regular file").clone();
            match file.readp(rt, Box::new(All::new())) {
                Progress::Suspended => Outcome::Suspended,
                Progress::Complete(vals) => {
                    print_contents(&vals);
                    Outcome::Finished
                }
            }
        }
        _ => {
            print_contents(&args);
            Outcome::Finished
        }
    });

    std::process::exit(rt.run());
}

fn print_contents(vals: &[Value]) {
    match vals.first().and_then(Value::as_bytes) {
        Some(bytes) => println!("[file] {} bytes: {}", bytes.len(), String::from_utf8_lossy(bytes).trim_end()),
        None => eprintln!("basic: read: {:?}", vals.get(1)),
    }
}
