// Runs a decode session's block production on its own thread.
//
// Control calls lock the session on the caller's thread; the worker takes
// the same lock once per block, so a setting stored between two blocks is
// seen by the next render.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};
use parking_lot::Mutex;

use super::convert::Format;
use super::session::{DecodeSession, Production, SessionState};
use super::sink::UpstreamEvent;
use crate::config::Setting;
use crate::error::{Result, SessionError};

pub const WORKER_NAME: &str = "siddec-stream";

pub struct DecodeTask {
    session: Arc<Mutex<DecodeSession>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DecodeTask {
    pub fn new(session: DecodeSession) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn accept_input(&self, bytes: &[u8]) -> Result<()> {
        self.session.lock().accept_input(bytes)
    }

    /// Forward an upstream event; end of input starts the worker.
    pub fn handle_event(&mut self, event: UpstreamEvent) -> Result<()> {
        self.session.lock().handle_event(event)?;
        self.spawn_if_playing()
    }

    pub fn finalize_input(&mut self) -> Result<()> {
        self.session.lock().finalize_input()?;
        self.spawn_if_playing()
    }

    pub fn configure(&self, setting: Setting) -> Result<()> {
        self.session.lock().configure(setting)
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state()
    }

    pub fn query_position(&self, unit: Format) -> Option<u64> {
        self.session.lock().query_position(unit)
    }

    pub fn query_duration(&self, unit: Format) -> Option<u64> {
        self.session.lock().query_duration(unit)
    }

    /// Direct access for anything not forwarded above.
    pub fn session(&self) -> &Arc<Mutex<DecodeSession>> {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Block until the worker stops on its own.
    pub fn wait(&mut self) {
        self.join();
    }

    /// Stop the worker after its current block, then end the session.
    pub fn terminate(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.join();
        self.session.lock().terminate();
    }

    fn spawn_if_playing(&mut self) -> Result<()> {
        if self.worker.is_some() || self.session.lock().state() != SessionState::Playing {
            return Ok(());
        }
        self.stop.store(false, Ordering::Release);
        let session = self.session.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || stream_loop(&session, &stop))
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        self.worker = Some(handle);
        Ok(())
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{WORKER_NAME} thread panicked");
            }
        }
    }
}

impl Drop for DecodeTask {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.join();
    }
}

fn stream_loop(session: &Mutex<DecodeSession>, stop: &AtomicBool) {
    debug!("{WORKER_NAME} started");
    while !stop.load(Ordering::Acquire) {
        let produced = session.lock().produce_block();
        match produced {
            Ok(Production::Continue) => {}
            Ok(Production::Finished) => break,
            Err(e) => {
                debug!("{WORKER_NAME} stopping: {e}");
                break;
            }
        }
    }
    debug!("{WORKER_NAME} finished");
}
