//! Trace report server for spindle
//!
//! Runs a producer/consumer workload on a fresh runtime, then serves the
//! resulting run report. No dependencies beyond tiny_http.
//!
//! Usage: serve [port] [config.json]

use spindle::kernel::{self, Builder, Runtime, RuntimeConfig, ShutdownPolicy};
use spindle::{CondVar, Mutex, RunReport};
use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use tiny_http::{Header, Response, Server};

const DEFAULT_PORT: u16 = 8080;
const ITEMS_PER_PRODUCER: i64 = 5;

/// Unbounded queue guarded by a green mutex
struct Channel {
    lock: Mutex,
    nonempty: CondVar,
    items: std::sync::Mutex<VecDeque<i64>>,
}

impl Channel {
    fn send(&self, value: i64) {
        self.lock.lock();
        if let Ok(mut items) = self.items.lock() {
            items.push_back(value);
        }
        self.nonempty.signal();
        self.lock.unlock();
    }

    fn recv(&self) -> i64 {
        self.lock.lock();
        let value = loop {
            let next = self.items.lock().ok().and_then(|mut items| items.pop_front());
            if let Some(value) = next {
                break value;
            }
            self.nonempty.wait(&self.lock);
        };
        self.lock.unlock();
        value
    }
}

fn workload() -> i64 {
    let channel = Arc::new(Channel {
        lock: Mutex::new(),
        nonempty: CondVar::new(),
        items: std::sync::Mutex::new(VecDeque::new()),
    });

    let mut producers = Vec::new();
    for prio in [2, 4] {
        let tx = Arc::clone(&channel);
        let spawned = Builder::new()
            .priority(prio)
            .joinable()
            .name(format!("producer-{}", prio))
            .spawn(move || {
                for i in 0..ITEMS_PER_PRODUCER {
                    tx.send(i64::from(prio) * 100 + i);
                    kernel::yield_now();
                }
                0
            });
        if let Ok(id) = spawned {
            producers.push(id);
        }
    }

    let expected = producers.len() as i64 * ITEMS_PER_PRODUCER;
    let mut sum = 0;
    for _ in 0..expected {
        sum += channel.recv();
    }
    for id in producers {
        let _ = kernel::join(id);
    }
    println!("[serve] consumed {} items, sum {}", expected, sum);
    0
}

fn run_workload(config_path: Option<&str>) -> Result<RunReport, String> {
    let mut config = match config_path {
        Some(path) => {
            let json = fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e))?;
            RuntimeConfig::from_json(&json).map_err(|e| e.to_string())?
        }
        None => RuntimeConfig::default(),
    };
    // The report is needed after the run
    config.shutdown = ShutdownPolicy::ReturnToHost;
    let runtime = Runtime::new(config).map_err(|e| e.to_string())?;
    runtime.run(workload).map_err(|e| e.to_string())
}

fn main() {
    let mut args = std::env::args().skip(1);
    let port = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let config_path = args.next();

    let report = match run_workload(config_path.as_deref()) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("serve: {}", e);
            std::process::exit(1);
        }
    };

    let addr = format!("0.0.0.0:{}", port);
    let server = match Server::http(&addr) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("serve: cannot listen on {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    println!("spindle trace report on http://localhost:{}", port);
    println!("  /             trace, one event per line");
    println!("  /report.json  full run report");

    for request in server.incoming_requests() {
        let response = match request.url() {
            "/" => text_response(render_trace(&report), "text/plain; charset=utf-8", 200),
            "/report.json" => match report.to_json() {
                Ok(json) => text_response(json, "application/json", 200),
                Err(e) => text_response(format!("report: {}", e), "text/plain", 500),
            },
            _ => text_response("404 Not Found".into(), "text/plain", 404),
        };
        let _ = request.respond(response);
    }
}

fn render_trace(report: &RunReport) -> String {
    let mut out = String::new();
    for event in &report.trace {
        out.push_str(&event.to_string());
        out.push('\n');
    }
    out.push_str(&format!("{:?}\n", report.stats));
    out
}

fn text_response(body: String, mime: &str, status: u16) -> Response<std::io::Cursor<Vec<u8>>> {
    let response = Response::from_string(body).with_status_code(status);
    match Header::from_bytes("Content-Type", mime) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}
