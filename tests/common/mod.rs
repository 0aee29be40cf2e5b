// Shared helpers for integration tests: a scripted transport and temp-file builders.
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use UrbanFetch::data_model::{FetchRequest, HttpResponse};
use UrbanFetch::pipeline::fetcher::{Transport, TransportError};

type Responder =
    dyn Fn(&FetchRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Answers every request from a closure and remembers what was asked.
///
/// The closure also receives how many times this exact request was made before.
pub struct ScriptedTransport {
    respond: Box<Responder>,
    calls: AtomicUsize,
    seen: Mutex<Vec<FetchRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&FetchRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        ScriptedTransport {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// Values of `param` across every request seen so far.
    pub fn param_values(&self, param: &str) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.param(param).map(str::to_string))
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn get(&self, request: &FetchRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let previous = {
            let mut seen = self.seen.lock().unwrap();
            let previous = seen.iter().filter(|r| *r == request).count();
            seen.push(request.clone());
            previous
        };
        (self.respond)(request, previous)
    }
}

pub fn status_only(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        content_type: None,
        body: Vec::new(),
    }
}

pub fn write_file(path: &Path, content: &str) {
    let mut file = std::fs::File::create(path).expect("Failed to create file");
    write!(file, "{}", content).expect("Failed to write file");
}
