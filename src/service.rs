//! # Acquisition Service Module
//!
//! Owns one acquisition session: connects the device, persists every frame,
//! forwards a decimated stream to the client, and tears everything down
//! without losing or corrupting the recording.
//!
//! ## Lifecycle
//! ```text
//! Idle → Connecting → Streaming → Stopping → Finalizing → Terminated
//!   └──────────┴───────────┴──────────┴────────→ Error (absorbing)
//! ```
//! `Error` skips storage finalization entirely: a recording that hit a write
//! failure, or a session the host is reclaiming, is never reported as SAVED
//! and its partial data is discarded.
//!
//! ## Threads
//! - device delivery thread: runs `IngestCore::on_raw_data` for every frame
//! - controller thread: whoever calls the `AcquisitionService` methods
//! - finalize worker: spawned by `destroy`, compresses and stores the recording
//!
//! The service asks to be stopped by publishing a `StopRequest`; the supervisor
//! answers by calling `destroy`.

use crate::client::{
    ClientChannel, ServiceMessage, CODE_ERROR_CONNECTION, CODE_ERROR_SAVING_RECORDING,
    CODE_ERROR_WRITING_TEXT_FILE,
};
use crate::config::{DeviceConfiguration, SessionRequest, Settings};
use crate::decimator::Decimator;
use crate::device::{FrameSource, RawDataHandler};
use crate::error::StorageError;
use crate::frame::{normalize_bit_width, Frame};
use crate::storage::DataSink;
use crate::write_gate::WriteGate;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Streaming,
    Stopping,
    Finalizing,
    Terminated,
    Error,
}

impl LifecycleState {
    pub fn is_final(self) -> bool {
        matches!(self, LifecycleState::Terminated | LifecycleState::Error)
    }
}

/// Shared lifecycle state with checked transitions
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<Mutex<LifecycleState>>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LifecycleState::Idle)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> LifecycleState {
        *self.lock()
    }

    /// Move `from` → `to`. Returns false, changing nothing, if the state was
    /// not `from`.
    fn advance(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let mut state = self.lock();
        if *state != from {
            return false;
        }
        log::info!("Session {:?} -> {:?}", from, to);
        *state = to;
        true
    }

    /// Enter `Error` from any non-final state. Returns false if already final.
    fn fail(&self) -> bool {
        let mut state = self.lock();
        if state.is_final() {
            return false;
        }
        log::info!("Session {:?} -> Error", *state);
        *state = LifecycleState::Error;
        true
    }
}

/// Why the service wants to be stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    ConnectFailed,
    AcquisitionFailed,
    WriteFailed,
    /// The host is reclaiming the task
    TaskRemoved,
    /// SAVED could not be delivered, nobody is left to consume the recording
    ClientLost,
}

/// What the session-start entry point asks of the host if it kills the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Do not respawn automatically
    NotSticky,
}

/// Host facilities the session needs
pub trait ServiceHost: Send + Sync {
    fn acquire_wake_lock(&self);

    fn release_wake_lock(&self);

    /// Show or hide the persistent "recording" indicator that keeps the host
    /// from reclaiming an unbound service
    fn set_foreground(&self, visible: bool);
}

/// Host without wake locks or notifications; just logs
#[derive(Debug, Default)]
pub struct LogHost;

impl ServiceHost for LogHost {
    fn acquire_wake_lock(&self) {
        log::debug!("Wake lock acquired");
    }

    fn release_wake_lock(&self) {
        log::debug!("Wake lock released");
    }

    fn set_foreground(&self, visible: bool) {
        log::info!("Foreground indicator {}", if visible { "shown" } else { "hidden" });
    }
}

/// Holds the wake lock until dropped
pub struct WakeLockGuard {
    host: Arc<dyn ServiceHost>,
}

impl WakeLockGuard {
    fn acquire(host: Arc<dyn ServiceHost>) -> Self {
        host.acquire_wake_lock();
        Self { host }
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        self.host.release_wake_lock();
    }
}

/// Opens the storage for a session
pub type SinkFactory =
    Box<dyn Fn(&SessionRequest) -> Result<Arc<dyn DataSink>, StorageError> + Send>;

/// Frame path shared with the device delivery thread
struct IngestCore {
    number_of_bits: u8,
    gate: WriteGate,
    decimator: Mutex<Decimator>,
    sink: Arc<dyn DataSink>,
    channel: Arc<ClientChannel>,
    lifecycle: Lifecycle,
    stop_requests: Sender<StopRequest>,
}

impl RawDataHandler for IngestCore {
    fn on_raw_data(&self, source_id: &str, mut samples: Frame) {
        let Some(_write) = self.gate.begin_write() else {
            return;
        };

        normalize_bit_width(&mut samples, self.number_of_bits);

        if let Err(e) = self.sink.append_frame(&samples) {
            log::error!("Dropping session, frame from {} not written: {}", source_id, e);
            self.gate.halt();
            let _ = self.channel.send_error(CODE_ERROR_WRITING_TEXT_FILE);
            if self.lifecycle.fail() {
                let _ = self.stop_requests.send(StopRequest::WriteFailed);
            }
            return;
        }

        let x_value = self
            .decimator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .on_frame();
        if let Some(x_value) = x_value {
            self.channel.send_data(x_value, &samples);
        }
    }
}

impl IngestCore {
    /// Refuse further frames, wait out the one in flight and drop the
    /// partial recording
    fn discard_recording(&self) {
        self.gate.close_and_drain();
        if let Err(e) = self.sink.discard() {
            log::warn!("{}", e);
        }
    }
}

/// One acquisition session driven by an external supervisor.
///
/// Construct, `start`, then feed it `bind`/`unbind`/`handle_message` calls
/// until a stop is wanted, then `destroy`.
pub struct AcquisitionService<F: FrameSource> {
    source: F,
    settings: Settings,
    host: Arc<dyn ServiceHost>,
    sink_factory: SinkFactory,
    channel: Arc<ClientChannel>,
    lifecycle: Lifecycle,
    stop_tx: Sender<StopRequest>,
    configuration: Option<DeviceConfiguration>,
    ingest: Option<Arc<IngestCore>>,
    wake_lock: Option<WakeLockGuard>,
    destroyed: bool,
}

impl<F: FrameSource> AcquisitionService<F> {
    /// Returns the service and the receiving end of its stop requests.
    ///
    /// Acquires the wake lock immediately; it is held until the session has
    /// been finalized or abandoned.
    pub fn new(
        source: F,
        settings: Settings,
        host: Arc<dyn ServiceHost>,
        sink_factory: SinkFactory,
    ) -> (Self, Receiver<StopRequest>) {
        let (stop_tx, stop_rx) = unbounded();
        let wake_lock = WakeLockGuard::acquire(host.clone());
        let channel = Arc::new(ClientChannel::new(settings.draw_in_background));

        let service = AcquisitionService {
            source,
            settings,
            host,
            sink_factory,
            channel,
            lifecycle: Lifecycle::new(),
            stop_tx,
            configuration: None,
            ingest: None,
            wake_lock: Some(wake_lock),
            destroyed: false,
        };
        (service, stop_rx)
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn configuration(&self) -> Option<&DeviceConfiguration> {
        self.configuration.as_ref()
    }

    pub fn source(&self) -> &F {
        &self.source
    }

    /// Start a session. Only the first start of a service instance connects;
    /// later ones are ignored.
    pub fn start(&mut self, request: SessionRequest) -> RestartPolicy {
        if !self.lifecycle.advance(LifecycleState::Idle, LifecycleState::Connecting) {
            log::warn!(
                "Ignoring start of {} in state {:?}",
                request.recording_name,
                self.state()
            );
            return RestartPolicy::NotSticky;
        }

        log::info!(
            "Starting recording {} from {}",
            request.recording_name,
            request.configuration.mac_address
        );

        if let Err(e) = request.configuration.validate() {
            log::error!("{}", e);
            self.abort(CODE_ERROR_CONNECTION, StopRequest::ConnectFailed);
            return RestartPolicy::NotSticky;
        }
        self.configuration = Some(request.configuration.clone());

        if let Err(request_stop) = self.connect(&request) {
            self.abort(CODE_ERROR_CONNECTION, request_stop);
            return RestartPolicy::NotSticky;
        }

        // Open before beginning so the first frames the device delivers are kept
        if let Some(ingest) = &self.ingest {
            ingest.gate.open();
        }
        if let Err(e) = self.source.begin_acquisition(self.settings.frame_buffer_size) {
            log::error!("{}", e);
            self.abort(CODE_ERROR_CONNECTION, StopRequest::AcquisitionFailed);
            return RestartPolicy::NotSticky;
        }

        // A write failure may already have failed the session
        self.lifecycle
            .advance(LifecycleState::Connecting, LifecycleState::Streaming);
        RestartPolicy::NotSticky
    }

    /// Connect, open storage and subscribe the frame path
    fn connect(&mut self, request: &SessionRequest) -> Result<(), StopRequest> {
        let config = &request.configuration;

        let connected = self
            .source
            .connect(&config.mac_address)
            .and_then(|()| self.source.configure_channels(&config.active_channels));
        if let Err(e) = connected {
            log::error!("Bioplux connection exception: {}", e);
            return Err(StopRequest::ConnectFailed);
        }

        let sink = match (self.sink_factory)(request) {
            Ok(sink) => sink,
            Err(e) => {
                log::error!("{}", e);
                return Err(StopRequest::ConnectFailed);
            }
        };

        let ingest = Arc::new(IngestCore {
            number_of_bits: config.number_of_bits,
            gate: WriteGate::new(self.settings.drain_poll_interval()),
            decimator: Mutex::new(Decimator::new(
                config.sampling_frequency,
                config.visualization_frequency,
            )),
            sink,
            channel: self.channel.clone(),
            lifecycle: self.lifecycle.clone(),
            stop_requests: self.stop_tx.clone(),
        });

        if let Err(e) = self.source.subscribe_raw_data(
            config.sampling_frequency,
            config.number_of_bits,
            ingest.clone(),
        ) {
            log::error!("Bioplux connection exception: {}", e);
            ingest.discard_recording();
            return Err(StopRequest::ConnectFailed);
        }

        self.ingest = Some(ingest);
        Ok(())
    }

    /// Report a fatal error, release the device and ask to be stopped
    fn abort(&mut self, code: i32, reason: StopRequest) {
        if let Some(ingest) = &self.ingest {
            ingest.gate.halt();
        }
        if let Err(e) = self.source.disconnect() {
            log::warn!("{}", e);
        }
        let _ = self.channel.send_error(code);
        if self.lifecycle.fail() {
            let _ = self.stop_tx.send(reason);
        }
    }

    /// A client bound to the service
    pub fn bind(&self) {
        log::info!("Client bound");
    }

    /// The client went away. While streaming, the service switches to a
    /// visible foreground mode so the host keeps it alive.
    pub fn unbind(&self) {
        log::info!("Client unbound");
        self.channel.detach();
        if self.state() == LifecycleState::Streaming {
            self.host.set_foreground(true);
        }
    }

    pub fn handle_message(&self, message: ServiceMessage) {
        match message {
            ServiceMessage::RegisterClient(endpoint) => {
                self.channel.register(endpoint);
                self.host.set_foreground(false);
            }
            ServiceMessage::RecordingDuration(duration) => match &self.ingest {
                Some(ingest) => ingest.sink.set_duration(duration),
                None => log::warn!("No recording to set duration {} on", duration),
            },
        }
    }

    /// The host is reclaiming the task. Nothing is flushed.
    pub fn task_removed(&mut self) {
        log::warn!("Task removed, abandoning session");
        if let Some(ingest) = &self.ingest {
            ingest.gate.halt();
        }
        if self.lifecycle.fail() {
            let _ = self.stop_tx.send(StopRequest::TaskRemoved);
        }
    }

    /// Tear the session down.
    ///
    /// A streaming session is drained, its acquisition ended and its writers
    /// closed on the calling thread; storing the recording happens on a
    /// worker whose handle is returned. Sessions in `Error` are abandoned
    /// without touching storage. Calling this twice does nothing the second
    /// time.
    pub fn destroy(&mut self) -> Option<thread::JoinHandle<()>> {
        if self.destroyed {
            return None;
        }
        self.destroyed = true;

        let stopping = self
            .lifecycle
            .advance(LifecycleState::Streaming, LifecycleState::Stopping);
        let ingest = match (&self.ingest, stopping) {
            (Some(ingest), true) => ingest.clone(),
            _ => {
                // Never streamed, or already failed
                if let Some(ingest) = &self.ingest {
                    ingest.discard_recording();
                }
                if !self.lifecycle.current().is_final() {
                    self.lifecycle.fail();
                }
                self.wake_lock.take();
                log::info!("Service destroyed");
                return None;
            }
        };

        ingest.gate.close_and_drain();

        if let Err(e) = self.source.end_acquisition() {
            log::error!("Exception ending acquisition: {}", e);
            let _ = self.channel.send_error(CODE_ERROR_CONNECTION);
        }
        if let Err(e) = self.source.disconnect() {
            log::warn!("{}", e);
        }

        // A write that was in flight when we started stopping may have failed
        if !self
            .lifecycle
            .advance(LifecycleState::Stopping, LifecycleState::Finalizing)
        {
            log::warn!("Session failed while stopping, recording is not stored");
            ingest.discard_recording();
            self.wake_lock.take();
            return None;
        }

        let mut save_error_reported = false;
        if let Err(e) = ingest.sink.close_writers() {
            log::error!("{}", e);
            let _ = self.channel.send_error(CODE_ERROR_SAVING_RECORDING);
            save_error_reported = true;
        }

        let finalize = FinalizeJob {
            sink: ingest.sink.clone(),
            channel: self.channel.clone(),
            lifecycle: self.lifecycle.clone(),
            stop_requests: self.stop_tx.clone(),
            save_error_reported,
            wake_lock: self.wake_lock.take(),
        };

        log::info!("Service destroyed, storing recording in background");
        match thread::Builder::new()
            .name("bplux-finalize".to_string())
            .spawn(move || finalize.run())
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                // The job was dropped with the closure, releasing the wake lock
                log::error!("Could not spawn finalize worker: {}", e);
                let _ = self.channel.send_error(CODE_ERROR_SAVING_RECORDING);
                self.lifecycle.fail();
                None
            }
        }
    }
}

/// Stores the recording off the teardown path and reports the outcome once
struct FinalizeJob {
    sink: Arc<dyn DataSink>,
    channel: Arc<ClientChannel>,
    lifecycle: Lifecycle,
    stop_requests: Sender<StopRequest>,
    save_error_reported: bool,
    wake_lock: Option<WakeLockGuard>,
}

impl FinalizeJob {
    fn run(self) {
        let stored = self.sink.finalize_and_store();

        match stored {
            Ok(_) if self.save_error_reported => {
                log::warn!("Recording stored after a close failure, not confirming it");
            }
            Ok(path) => {
                log::info!("Recording saved to {}", path.display());
                if let Err(e) = self.channel.send_saved() {
                    log::error!("{}. Service is being stopped", e);
                    self.lifecycle.fail();
                    let _ = self.stop_requests.send(StopRequest::ClientLost);
                    return;
                }
            }
            Err(e) => {
                log::error!("{}", e);
                if !self.save_error_reported {
                    let _ = self.channel.send_error(CODE_ERROR_SAVING_RECORDING);
                }
            }
        }

        self.lifecycle
            .advance(LifecycleState::Finalizing, LifecycleState::Terminated);
        drop(self.wake_lock);
    }
}

impl<F: FrameSource> Drop for AcquisitionService<F> {
    fn drop(&mut self) {
        if !self.destroyed {
            if let Some(handle) = self.destroy() {
                let _ = handle.join();
            }
        }
    }
}
