//! Worker connections and the round fan-out/fan-in machinery.
//!
//! Each accepted connection gets a reader thread that decodes framed
//! replies into one shared channel. A round writes its requests to every
//! session before draining the channel, so replies are consumed in
//! whatever order the workers produce them. Attribution always uses the
//! explicit `worker_id` each reply carries; the session index only serves
//! to validate that a socket never changes identity mid-fit.

use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

use tracing::{debug, info, warn};

use dfit_core::{DfitError, ErrorInfo};
use dfit_wire::{read_frame, write_frame, CoordRequest, WorkerReply};

/// The set of connected workers plus the shared reply channel.
pub struct WorkerPool {
    writers: Vec<TcpStream>,
    rx: Receiver<(usize, Result<WorkerReply, DfitError>)>,
    worker_of_session: Vec<Option<u32>>,
    session_of_worker: Vec<Option<usize>>,
    shut_down: bool,
}

impl WorkerPool {
    /// Accepts exactly `n` worker connections from the listener, in
    /// arrival order, and spawns one reader thread per connection.
    pub fn accept(listener: &TcpListener, n: usize) -> Result<Self, DfitError> {
        let (tx, rx) = channel();
        let mut writers = Vec::with_capacity(n);
        for session in 0..n {
            let (stream, addr) = listener.accept().map_err(|err| {
                DfitError::Io(ErrorInfo::new("accept", err.to_string()))
            })?;
            stream.set_nodelay(true).ok();
            let reader = stream.try_clone().map_err(|err| {
                DfitError::Io(ErrorInfo::new("socket-clone", err.to_string()))
            })?;
            info!(session, %addr, "worker connected");
            spawn_reader(session, reader, tx.clone());
            writers.push(stream);
        }
        Ok(Self {
            writers,
            rx,
            worker_of_session: vec![None; n],
            session_of_worker: vec![None; n],
            shut_down: false,
        })
    }

    /// Number of connected workers.
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    /// True when no workers are connected.
    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Writes the same request to every session, in session order, before
    /// any reply is read.
    pub fn broadcast(&mut self, request: &CoordRequest) -> Result<(), DfitError> {
        for writer in &mut self.writers {
            write_frame(writer, request)?;
        }
        Ok(())
    }

    /// Writes one request to the session bound to `worker_id`. Only valid
    /// once a previous round has established the binding.
    pub fn send_to_worker(
        &mut self,
        worker_id: u32,
        request: &CoordRequest,
    ) -> Result<(), DfitError> {
        let session = self
            .session_of_worker
            .get(worker_id as usize)
            .copied()
            .flatten()
            .ok_or_else(|| {
                DfitError::Protocol(
                    ErrorInfo::new("unbound-worker", "no session bound to worker id")
                        .with_context("worker_id", worker_id.to_string()),
                )
            })?;
        write_frame(&mut self.writers[session], request)
    }

    /// Drains exactly `expected` replies in arrival order. Any decode
    /// failure or closed socket is fatal; the protocol has no retry.
    pub fn collect(&mut self, expected: usize) -> Result<Vec<WorkerReply>, DfitError> {
        let mut replies = Vec::with_capacity(expected);
        for _ in 0..expected {
            let (session, result) = self.rx.recv().map_err(|_| {
                DfitError::Protocol(ErrorInfo::new(
                    "reply-channel-closed",
                    "all worker reader threads have exited",
                ))
            })?;
            let reply = result?;
            self.bind(session, reply.worker_id())?;
            debug!(session, worker_id = reply.worker_id(), "reply drained");
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Binds a session to the worker id it reported, or validates an
    /// existing binding. Ids must be dense in `[0, n)` and unique.
    fn bind(&mut self, session: usize, worker_id: u32) -> Result<(), DfitError> {
        let n = self.writers.len();
        if worker_id as usize >= n {
            return Err(DfitError::Protocol(
                ErrorInfo::new("worker-id-range", "reply carries out-of-range worker id")
                    .with_context("worker_id", worker_id.to_string())
                    .with_context("workers", n.to_string()),
            ));
        }
        match self.worker_of_session[session] {
            Some(bound) if bound != worker_id => Err(DfitError::Protocol(
                ErrorInfo::new("worker-id-flip", "session changed its reported worker id")
                    .with_context("session", session.to_string())
                    .with_context("bound", bound.to_string())
                    .with_context("reported", worker_id.to_string()),
            )),
            Some(_) => Ok(()),
            None => {
                if let Some(other) = self.session_of_worker[worker_id as usize] {
                    return Err(DfitError::Protocol(
                        ErrorInfo::new("worker-id-duplicate", "two sessions report one worker id")
                            .with_context("worker_id", worker_id.to_string())
                            .with_context("sessions", format!("{other},{session}")),
                    ));
                }
                self.worker_of_session[session] = Some(worker_id);
                self.session_of_worker[worker_id as usize] = Some(session);
                Ok(())
            }
        }
    }

    /// Fire-and-forget shutdown: send `Shutdown` to every session and
    /// close the sockets. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for writer in &mut self.writers {
            if let Err(err) = write_frame(writer, &CoordRequest::Shutdown) {
                warn!(error = %err, "shutdown send failed");
            }
            writer.shutdown(Shutdown::Both).ok();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_reader(
    session: usize,
    mut stream: TcpStream,
    tx: Sender<(usize, Result<WorkerReply, DfitError>)>,
) {
    thread::spawn(move || loop {
        match read_frame::<_, WorkerReply>(&mut stream) {
            Ok(reply) => {
                if tx.send((session, Ok(reply))).is_err() {
                    break;
                }
            }
            Err(err) => {
                // The pool may already be gone; nothing to do then.
                let _ = tx.send((session, Err(err)));
                break;
            }
        }
    });
}
