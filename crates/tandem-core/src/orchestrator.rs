//! Device registry and synchronized fan-out of connect/start/stop
//!
//! Every per-device step runs as its own future, each borrowing exactly one
//! [`ConnectionHandle`] mutably, and all of them are driven concurrently and
//! joined before a fan-out returns. No lock is shared across devices: a
//! device's outcome is written only by the future that owns its handle.
//!
//! Each step is bounded twice: by the protocol client's own transport timeouts
//! and by the orchestrator's `operation_timeout`. A per-device cancellation
//! token lets the caller abort one device without touching the others.

use futures_util::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientFactory, DeviceClient};
use crate::device::{ConnectionState, DeviceAddress, DeviceDescriptor, DeviceId};
use crate::error::{DeviceError, ErrorRecord, Operation, OrchestratorError};
use crate::session::{Capture, DeviceRecording, RecordingSession, Timestamp};

/// Default upper bound for a single per-device step
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound for a best-effort disconnect
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on each discover/connect/start/stop step of one device
    pub operation_timeout: Duration,
    /// Upper bound on releasing one device's transport
    pub disconnect_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

/// Run one device step under its cancellation token and a time limit
async fn bounded<T, F>(cancel: &CancellationToken, limit: Duration, fut: F) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeviceError::Cancelled),
        res = tokio::time::timeout(limit, fut) => res.unwrap_or(Err(DeviceError::ConnectionTimeout(limit))),
    }
}

/// Output file stem derived from a label: ASCII alphanumerics, `-` and `_`
fn sanitize_output_id(label: &str) -> String {
    let id: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if id.is_empty() {
        "device".to_string()
    } else {
        id
    }
}

/// The orchestrator's live reference to one configured device
pub struct ConnectionHandle {
    descriptor: DeviceDescriptor,
    client: Box<dyn DeviceClient>,
    state: ConnectionState,
    address: Option<DeviceAddress>,
    output_id: String,
    cancel: CancellationToken,
    last_error: Option<DeviceError>,
}

impl ConnectionHandle {
    fn new(descriptor: DeviceDescriptor, client: Box<dyn DeviceClient>, output_id: String) -> Self {
        Self {
            descriptor,
            client,
            state: ConnectionState::Disconnected,
            address: None,
            output_id,
            cancel: CancellationToken::new(),
            last_error: None,
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.descriptor.id()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Address resolved by the last successful discovery
    pub fn address(&self) -> Option<&DeviceAddress> {
        self.address.as_ref()
    }

    /// Unique, filesystem-safe identifier for this device's output artifacts
    pub fn output_id(&self) -> &str {
        &self.output_id
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.as_ref()
    }

    fn fail(&mut self, operation: Operation, error: DeviceError) -> ErrorRecord {
        warn!(
            device = %self.id(),
            operation = %operation,
            error = %error,
            "Device operation failed"
        );
        self.state = ConnectionState::Error;
        self.last_error = Some(error.clone());
        ErrorRecord::new(self.id().clone(), operation, error)
    }

    async fn release(&mut self, limit: Duration) {
        if tokio::time::timeout(limit, self.client.disconnect()).await.is_err() {
            debug!(device = %self.id(), "Disconnect did not finish in time");
        }
    }

    async fn connect(&mut self, limit: Duration) -> Result<(), ErrorRecord> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Recording => {
                debug!(device = %self.id(), "Already connected");
                return Ok(());
            }
            ConnectionState::Error => {
                return Err(ErrorRecord::new(
                    self.id().clone(),
                    Operation::Connect,
                    DeviceError::InvalidState("device is in error state, reconnect required".into()),
                ));
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        self.state = ConnectionState::Connecting;

        let address = match &self.address {
            Some(address) => address.clone(),
            None => {
                let discovered = bounded(
                    &self.cancel,
                    limit,
                    self.client.discover(self.descriptor.locator()),
                )
                .await;
                match discovered {
                    Ok(address) => {
                        debug!(device = %self.id(), address = %address, "Device discovered");
                        self.address = Some(address.clone());
                        address
                    }
                    Err(e) => return Err(self.fail(Operation::Discover, e)),
                }
            }
        };

        match bounded(&self.cancel, limit, self.client.connect(&address)).await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.last_error = None;
                info!(device = %self.id(), address = %address, "Device connected");
                Ok(())
            }
            Err(e) => {
                let record = self.fail(Operation::Connect, e);
                self.release(limit).await;
                Err(record)
            }
        }
    }

    async fn start(&mut self, limit: Duration, epoch: Instant) -> Result<Timestamp, ErrorRecord> {
        if self.state != ConnectionState::Connected {
            return Err(ErrorRecord::new(
                self.id().clone(),
                Operation::Start,
                DeviceError::InvalidState(format!("cannot start from {:?}", self.state)),
            ));
        }

        match bounded(&self.cancel, limit, self.client.start_recording()).await {
            Ok(()) => {
                let started = Timestamp::capture(epoch);
                self.state = ConnectionState::Recording;
                info!(
                    device = %self.id(),
                    at_ms = started.monotonic.as_millis() as u64,
                    "Recording started"
                );
                Ok(started)
            }
            Err(e) => Err(self.fail(Operation::Start, e)),
        }
    }

    async fn stop(
        &mut self,
        limit: Duration,
        epoch: Instant,
    ) -> Result<(Timestamp, Capture), ErrorRecord> {
        if self.state != ConnectionState::Recording {
            return Err(ErrorRecord::new(
                self.id().clone(),
                Operation::Stop,
                DeviceError::InvalidState(format!("cannot stop from {:?}", self.state)),
            ));
        }

        match bounded(&self.cancel, limit, self.client.stop_recording()).await {
            Ok(capture) => {
                let stopped = Timestamp::capture(epoch);
                // Some families close their transport as part of stopping
                self.state = if self.client.is_connected() {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                };
                info!(
                    device = %self.id(),
                    at_ms = stopped.monotonic.as_millis() as u64,
                    "Recording stopped"
                );
                Ok((stopped, capture))
            }
            Err(e) => Err(self.fail(Operation::Stop, e)),
        }
    }

    async fn disconnect(&mut self, limit: Duration) {
        self.release(limit).await;
        if self.state != ConnectionState::Error {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Clear error state and forget the resolved address
    async fn reset(&mut self, limit: Duration) {
        self.release(limit).await;
        self.state = ConnectionState::Disconnected;
        self.address = None;
        self.last_error = None;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }
}

/// Aggregate outcome of one fan-out
#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub operation: Operation,
    pub succeeded: Vec<DeviceId>,
    pub failed: Vec<ErrorRecord>,
    /// Devices not attempted because of their state
    pub skipped: Vec<DeviceId>,
}

impl FanOutReport {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Collapse into the succeeded ids, or a partial/total failure
    pub fn into_result(self) -> Result<Vec<DeviceId>, OrchestratorError> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else if self.succeeded.is_empty() {
            Err(OrchestratorError::AllFailed(self.failed))
        } else {
            Err(OrchestratorError::PartialFailure {
                succeeded: self.succeeded,
                failed: self.failed,
            })
        }
    }
}

/// Result of `stop_all`: the closed session plus the per-device report
#[derive(Debug)]
pub struct StopOutcome {
    pub session: RecordingSession,
    pub report: FanOutReport,
}

/// Holds the registered devices and fans operations out to them
pub struct Orchestrator {
    factory: Arc<dyn ClientFactory>,
    config: OrchestratorConfig,
    handles: Vec<ConnectionHandle>,
    epoch: Instant,
    session: Option<RecordingSession>,
}

impl Orchestrator {
    pub fn new(factory: Arc<dyn ClientFactory>, config: OrchestratorConfig) -> Self {
        Self {
            factory,
            config,
            handles: Vec::new(),
            epoch: Instant::now(),
            session: None,
        }
    }

    /// Monotonic time since this orchestrator was created
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn handles(&self) -> &[ConnectionHandle] {
        &self.handles
    }

    pub fn handle(&self, id: &DeviceId) -> Option<&ConnectionHandle> {
        self.handles.iter().find(|h| h.id() == id)
    }

    pub fn states(&self) -> Vec<(DeviceId, ConnectionState)> {
        self.handles
            .iter()
            .map(|h| (h.id().clone(), h.state()))
            .collect()
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Token that aborts the device's in-flight operation when cancelled
    ///
    /// Once fired, the token stays with the device (which is left in `Error`)
    /// until `reconnect` replaces it; fetch the token again after a reconnect.
    pub fn cancel_token(&self, id: &DeviceId) -> Option<CancellationToken> {
        self.handle(id).map(|h| h.cancel.clone())
    }

    /// Register a device and resolve its protocol client
    pub fn register(&mut self, descriptor: DeviceDescriptor) -> Result<(), OrchestratorError> {
        if self.handle(descriptor.id()).is_some() {
            return Err(OrchestratorError::DuplicateDevice(descriptor.id().clone()));
        }

        let client = self.factory.create(&descriptor).map_err(|e| {
            ErrorRecord::new(descriptor.id().clone(), Operation::Register, e)
        })?;

        let output_id = self.unique_output_id(descriptor.label());
        debug!(
            device = %descriptor.id(),
            kind = %descriptor.kind(),
            output_id = %output_id,
            "Device registered"
        );
        self.handles
            .push(ConnectionHandle::new(descriptor, client, output_id));
        Ok(())
    }

    fn unique_output_id(&self, label: &str) -> String {
        let taken: HashSet<&str> = self.handles.iter().map(|h| h.output_id()).collect();
        let base = sanitize_output_id(label);
        if !taken.contains(base.as_str()) {
            return base;
        }
        (2..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .unwrap_or(base)
    }

    /// Register any new descriptors, then discover and connect every
    /// disconnected device concurrently
    ///
    /// Devices already connected count as succeeded without touching their
    /// transport. Devices in `Error` are skipped until [`Self::reconnect`].
    pub async fn connect_all(
        &mut self,
        descriptors: impl IntoIterator<Item = DeviceDescriptor>,
    ) -> FanOutReport {
        let mut report = FanOutReport::new(Operation::Connect);

        for descriptor in descriptors {
            if let Some(existing) = self.handle(descriptor.id()) {
                if existing.descriptor() != &descriptor {
                    report.failed.push(ErrorRecord::new(
                        descriptor.id().clone(),
                        Operation::Register,
                        DeviceError::InvalidState(
                            "id already registered with a different descriptor".into(),
                        ),
                    ));
                }
                continue;
            }
            match self.register(descriptor) {
                Ok(()) => {}
                Err(OrchestratorError::Device(record)) => report.failed.push(record),
                Err(e) => warn!(error = %e, "Registration failed"),
            }
        }

        for handle in &self.handles {
            match handle.state() {
                ConnectionState::Connected | ConnectionState::Recording => {
                    report.succeeded.push(handle.id().clone())
                }
                ConnectionState::Error => report.skipped.push(handle.id().clone()),
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }
        }

        let limit = self.config.operation_timeout;
        let pending: Vec<_> = self
            .handles
            .iter_mut()
            .filter(|h| {
                matches!(
                    h.state(),
                    ConnectionState::Disconnected | ConnectionState::Connecting
                )
            })
            .map(|h| async move {
                let result = h.connect(limit).await;
                (h.id().clone(), result)
            })
            .collect();

        info!(devices = pending.len(), "Connecting devices");

        for (id, result) in join_all(pending).await {
            match result {
                Ok(()) => report.succeeded.push(id),
                Err(record) => report.failed.push(record),
            }
        }

        info!(
            connected = report.succeeded.len(),
            failed = report.failed.len(),
            "Connect fan-out complete"
        );
        report
    }

    /// Explicitly leave `Error` (or refresh a healthy link): release, rediscover, connect
    pub async fn reconnect(&mut self, id: &DeviceId) -> Result<(), OrchestratorError> {
        let limit = self.config.operation_timeout;
        let release = self.config.disconnect_timeout;
        let handle = self
            .handles
            .iter_mut()
            .find(|h| h.id() == id)
            .ok_or_else(|| OrchestratorError::UnknownDevice(id.clone()))?;

        if handle.state() == ConnectionState::Recording {
            return Err(OrchestratorError::SessionActive);
        }

        info!(device = %id, "Reconnecting device");
        handle.reset(release).await;
        handle.connect(limit).await?;
        Ok(())
    }

    /// Start every connected device concurrently and open a recording session
    ///
    /// Each device's start timestamp is taken right after its own
    /// acknowledgement, so it reflects that device's command latency only.
    pub async fn start_all(&mut self) -> Result<FanOutReport, OrchestratorError> {
        if self.session.is_some() {
            return Err(OrchestratorError::SessionActive);
        }
        if !self
            .handles
            .iter()
            .any(|h| h.state() == ConnectionState::Connected)
        {
            return Err(OrchestratorError::NoConnectedDevices);
        }

        let mut report = FanOutReport::new(Operation::Start);
        report.skipped = self
            .handles
            .iter()
            .filter(|h| h.state() != ConnectionState::Connected)
            .map(|h| h.id().clone())
            .collect();

        let limit = self.config.operation_timeout;
        let epoch = self.epoch;
        let pending: Vec<_> = self
            .handles
            .iter_mut()
            .filter(|h| h.state() == ConnectionState::Connected)
            .map(|h| async move {
                let result = h.start(limit, epoch).await;
                (h, result)
            })
            .collect();

        info!(devices = pending.len(), "Starting recording");

        let mut session = RecordingSession::new();
        for (handle, result) in join_all(pending).await {
            match result {
                Ok(started) => {
                    session.insert(DeviceRecording::new(
                        handle.id().clone(),
                        handle.descriptor().kind(),
                        handle.output_id().to_string(),
                        started,
                    ));
                    report.succeeded.push(handle.id().clone());
                }
                Err(record) => report.failed.push(record),
            }
        }

        if session.is_empty() {
            warn!("No device started; session not opened");
        } else {
            info!(
                session = %session.id(),
                started = session.len(),
                failed = report.failed.len(),
                skew_ms = session.max_start_skew().as_millis() as u64,
                "Recording session opened"
            );
            self.session = Some(session);
        }

        Ok(report)
    }

    /// Stop every recording device concurrently and hand over the session
    ///
    /// The orchestrator keeps nothing of the session afterwards.
    pub async fn stop_all(&mut self) -> Result<StopOutcome, OrchestratorError> {
        let mut session = self
            .session
            .take()
            .ok_or(OrchestratorError::NoActiveSession)?;

        let mut report = FanOutReport::new(Operation::Stop);
        report.skipped = session
            .devices()
            .filter(|d| {
                self.handle(&d.device)
                    .map(|h| h.state() != ConnectionState::Recording)
                    .unwrap_or(true)
            })
            .map(|d| d.device.clone())
            .collect();

        let limit = self.config.operation_timeout;
        let epoch = self.epoch;
        let pending: Vec<_> = self
            .handles
            .iter_mut()
            .filter(|h| h.state() == ConnectionState::Recording)
            .map(|h| async move {
                let result = h.stop(limit, epoch).await;
                (h.id().clone(), result)
            })
            .collect();

        info!(devices = pending.len(), "Stopping recording");

        for (id, result) in join_all(pending).await {
            match result {
                Ok((stopped, capture)) => {
                    if let Some(recording) = session.get_mut(&id) {
                        recording.stopped = Some(stopped);
                        recording.capture = Some(capture);
                    }
                    report.succeeded.push(id);
                }
                Err(record) => report.failed.push(record),
            }
        }

        session.close();
        info!(
            session = %session.id(),
            stopped = report.succeeded.len(),
            failed = report.failed.len(),
            "Recording session closed"
        );

        Ok(StopOutcome { session, report })
    }

    /// Release every device's transport, best-effort
    pub async fn disconnect_all(&mut self) {
        if self.session.is_some() {
            warn!("Disconnecting while a recording session is still open");
        }
        let limit = self.config.disconnect_timeout;
        join_all(self.handles.iter_mut().map(|h| h.disconnect(limit))).await;
        info!(devices = self.handles.len(), "All devices disconnected");
    }
}
