//! TCP echo server
//!
//! One task per connection via `Server::autospawn`; each connection task
//! loops read-available / write-back until the peer goes away.
//!
// cargo run -p evma-echo -- 127.0.0.1:7000

use evma::parsers::Available;
use evma::{
    kinfo, IStream, OStream, Outcome, Progress, Runtime, RuntimeConfig, Server, Task, Value,
};

/// Where in the read/write cycle a connection task is, and therefore how
/// to interpret the values the next resumption delivers.
enum EchoState {
    Start,
    GotData,
    Wrote,
}

struct EchoConn {
    is: IStream,
    os: OStream,
    state: EchoState,
}

impl EchoConn {
    fn new(is: IStream, os: OStream) -> Self {
        EchoConn {
            is,
            os,
            state: EchoState::Start,
        }
    }

    fn shutdown(&self, rt: &mut Runtime) {
        let _ = self.is.close(rt);
        let _ = self.os.close(rt);
    }
}

impl Task for EchoConn {
    fn resume(&mut self, rt: &mut Runtime, args: Vec<Value>) -> Outcome {
        let mut vals = args;
        loop {
            match self.state {
                EchoState::Start => match self.is.readp(rt, Box::new(Available)) {
                    Progress::Complete(v) => {
                        vals = v;
                        self.state = EchoState::GotData;
                    }
                    Progress::Suspended => {
                        self.state = EchoState::GotData;
                        return Outcome::Suspended;
                    }
                },
                EchoState::GotData => {
                    let data = match vals.first().and_then(Value::as_bytes) {
                        Some(data) => data.to_vec(),
                        // Peer closed or errored
                        None => {
                            self.shutdown(rt);
                            return Outcome::Finished;
                        }
                    };
                    match self.os.write(rt, data) {
                        Progress::Complete(v) => {
                            vals = v;
                            self.state = EchoState::Wrote;
                        }
                        Progress::Suspended => {
                            self.state = EchoState::Wrote;
                            return Outcome::Suspended;
                        }
                    }
                }
                EchoState::Wrote => {
                    if vals.first().map(Value::is_nil).unwrap_or(true) {
                        self.shutdown(rt);
                        return Outcome::Finished;
                    }
                    self.state = EchoState::Start;
                }
            }
        }
    }
}

fn main() {
    evma::init_logging();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_owned());

    let mut rt = match Runtime::new(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("echo: {}", e);
            std::process::exit(evma::EXIT_FAILURE);
        }
    };

    let server = match Server::listen(&addr) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("echo: cannot listen on {}: {}", addr, e);
            std::process::exit(evma::EXIT_FAILURE);
        }
    };
    println!("echo: listening on {}", addr);

    let mut listening = false;
    rt.spawn_fn(move |rt, args| {
        if !listening {
            listening = true;
            return match server.autospawn(rt, |is, os| {
                kinfo!("connection accepted");
                Box::new(EchoConn::new(is, os))
            }) {
                Progress::Suspended => Outcome::Suspended,
                Progress::Complete(vals) => {
                    eprintln!("echo: {:?}", vals.get(1));
                    Outcome::Finished
                }
            };
        }
        // Resumed only if accepting failed outright
        eprintln!("echo: {:?}", args.get(1));
        rt.exit(evma::EXIT_FAILURE);
        Outcome::Finished
    });

    std::process::exit(rt.run());
}
