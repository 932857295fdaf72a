//! Scriptable in-process workers speaking the real framed protocol over
//! localhost sockets.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dfit_core::{FitParameter, FitQuality};
use dfit_wire::{read_frame, write_frame, CoordRequest, WorkerReply};

type PartialFn = Box<dyn Fn(u32, &[f64]) -> f64 + Send>;
type EventsFn = Box<dyn Fn(u32) -> u64 + Send>;

/// What the coordinator sent in its Finalize request.
#[derive(Debug, Clone)]
pub struct FinalizeSeen {
    pub quality: FitQuality,
    pub nll: f64,
    pub names: Vec<String>,
    pub values: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

/// Everything a stub worker observed, returned when its thread joins.
#[derive(Debug, Default)]
pub struct StubReport {
    pub declare_calls: usize,
    pub loads: Vec<u32>,
    pub cache_calls: usize,
    pub evaluate_calls: usize,
    pub last_n_total: u32,
    pub last_n_free: u32,
    pub last_values: Vec<f64>,
    pub asymm_events: Vec<bool>,
    pub finalize: Option<FinalizeSeen>,
    pub persisted: bool,
}

/// A scripted worker: declares a fixed parameter list and answers every
/// request until the coordinator shuts the connection down.
pub struct StubWorker {
    worker_id: u32,
    params: Vec<FitParameter>,
    events: EventsFn,
    partial: PartialFn,
    finalize_rename: Option<String>,
    finalize_adjust: Option<(String, f64)>,
}

impl StubWorker {
    pub fn new(worker_id: u32, params: Vec<FitParameter>) -> Self {
        Self {
            worker_id,
            params,
            events: Box::new(|_| 1000),
            // Sum of squares plus one: strictly positive everywhere.
            partial: Box::new(|_, values| 1.0 + values.iter().map(|v| v * v).sum::<f64>()),
            finalize_rename: None,
            finalize_adjust: None,
        }
    }

    /// Overrides the per-experiment event count.
    pub fn events(mut self, events: impl Fn(u32) -> u64 + Send + 'static) -> Self {
        self.events = Box::new(events);
        self
    }

    /// Overrides the partial NLL as a function of (expt_id, values).
    pub fn partial(mut self, partial: impl Fn(u32, &[f64]) -> f64 + Send + 'static) -> Self {
        self.partial = Box::new(partial);
        self
    }

    /// Makes the Finalized reply rename its first parameter, which the
    /// coordinator must reject as outside the worker's footprint.
    pub fn finalize_rename(mut self, name: &str) -> Self {
        self.finalize_rename = Some(name.to_string());
        self
    }

    /// Makes the Finalized reply adjust the named parameter's value.
    pub fn finalize_adjust(mut self, name: &str, value: f64) -> Self {
        self.finalize_adjust = Some((name.to_string(), value));
        self
    }

    pub fn spawn(self, addr: SocketAddr) -> JoinHandle<StubReport> {
        thread::spawn(move || {
            let mut stream = connect_with_retry(addr);
            let mut report = StubReport::default();
            let mut current_expt = 0u32;
            loop {
                let request: CoordRequest = match read_frame(&mut stream) {
                    Ok(request) => request,
                    Err(_) => break,
                };
                let reply = match request {
                    CoordRequest::DeclareParameters => {
                        report.declare_calls += 1;
                        WorkerReply::Parameters {
                            worker_id: self.worker_id,
                            params: self.params.clone(),
                        }
                    }
                    CoordRequest::LoadExperiment { expt_id } => {
                        current_expt = expt_id;
                        report.loads.push(expt_id);
                        WorkerReply::Loaded {
                            worker_id: self.worker_id,
                            event_count: (self.events)(expt_id),
                        }
                    }
                    CoordRequest::Cache => {
                        report.cache_calls += 1;
                        WorkerReply::Cached {
                            worker_id: self.worker_id,
                            ok: true,
                        }
                    }
                    CoordRequest::Evaluate {
                        n_total,
                        n_free,
                        values,
                    } => {
                        report.evaluate_calls += 1;
                        report.last_n_total = n_total;
                        report.last_n_free = n_free;
                        report.last_values = values.clone();
                        WorkerReply::Evaluated {
                            worker_id: self.worker_id,
                            partial_nll: (self.partial)(current_expt, &values),
                        }
                    }
                    CoordRequest::SetAsymmErrorMode { enabled } => {
                        report.asymm_events.push(enabled);
                        WorkerReply::AsymmErrorMode {
                            worker_id: self.worker_id,
                            ack: true,
                        }
                    }
                    CoordRequest::Finalize {
                        quality,
                        nll,
                        parameters,
                        covariance,
                        ..
                    } => {
                        report.finalize = Some(FinalizeSeen {
                            quality,
                            nll,
                            names: parameters.iter().map(|p| p.name.clone()).collect(),
                            values: parameters.iter().map(|p| p.value).collect(),
                            covariance: covariance.clone(),
                        });
                        let mut reply_params = parameters;
                        if let Some(name) = &self.finalize_rename {
                            reply_params[0].name = name.clone();
                        }
                        if let Some((name, value)) = &self.finalize_adjust {
                            if let Some(p) = reply_params.iter_mut().find(|p| &p.name == name) {
                                p.value = *value;
                            }
                        }
                        WorkerReply::Finalized {
                            worker_id: self.worker_id,
                            ok: true,
                            parameters: reply_params,
                        }
                    }
                    CoordRequest::Persist => {
                        report.persisted = true;
                        WorkerReply::Persisted {
                            worker_id: self.worker_id,
                            ok: true,
                        }
                    }
                    CoordRequest::Shutdown => break,
                };
                if write_frame(&mut stream, &reply).is_err() {
                    break;
                }
            }
            report
        })
    }
}

fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream.set_nodelay(true).ok();
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("could not connect stub worker to {addr}");
}

/// Binds a listener on an ephemeral localhost port.
pub fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    (listener, addr)
}
