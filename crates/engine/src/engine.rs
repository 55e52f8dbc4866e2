//! Connection engine
//!
//! Drives one accessory session at a time:
//!
//! 1. Opening: the manager opens the candidate device
//! 2. Established: connected flag set, listener notified
//! 3. Receiving: blocking reads into a reused buffer until error or EOF
//! 4. Teardown: stream released, flags reset, listener notified
//!
//! The read loop runs on a dedicated OS thread so blocking reads never touch
//! the caller's context. Shutdown is two-part: the termination flag stops the
//! loop at its next boundary, and closing the stream makes an in-flight read
//! return with an error. The flag alone cannot interrupt a blocked read.

use crate::device::{AccessoryManager, AccessoryStream};
use crate::listener::EngineListener;
use crate::permission::{PermissionGate, PermissionStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Default read buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the reused read buffer
    pub buffer_size: usize,
    /// Name given to the read-loop thread
    pub reader_thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            reader_thread_name: "accessory-reader".to_string(),
        }
    }
}

/// Live stream plus its once-only release guard
struct Session<S> {
    stream: S,
    released: AtomicBool,
}

impl<S: AccessoryStream> Session<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            released: AtomicBool::new(false),
        }
    }

    /// Close the stream; returns false if it was already released
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.stream.close() {
            warn!("Unable to release accessory stream: {}", e);
        }
        true
    }
}

struct Inner<M: AccessoryManager> {
    manager: Arc<M>,
    listener: Arc<dyn EngineListener>,
    config: EngineConfig,
    gate: PermissionGate,
    /// Most recently discovered device
    candidate: Mutex<Option<M::Device>>,
    session: Mutex<Option<Arc<Session<M::Stream>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Serializes established/closed callbacks across sessions
    emit: Mutex<()>,
    /// Read loop exists; transitions guarded by compare-and-set
    running: AtomicBool,
    /// Written only by the read-loop thread
    connected: AtomicBool,
    /// Termination flag, reset at teardown
    terminate: AtomicBool,
    /// Detach listener registered; cleared by shutdown
    attached: AtomicBool,
}

/// Manages the connection to a single accessory
///
/// Cloning yields another handle to the same engine.
pub struct ConnectionEngine<M: AccessoryManager> {
    inner: Arc<Inner<M>>,
}

impl<M: AccessoryManager> Clone for ConnectionEngine<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: AccessoryManager> ConnectionEngine<M> {
    /// Create an engine with its detach listener registered
    pub fn new(manager: Arc<M>, listener: Arc<dyn EngineListener>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                listener,
                config,
                gate: PermissionGate::new(),
                candidate: Mutex::new(None),
                session: Mutex::new(None),
                reader: Mutex::new(None),
                emit: Mutex::new(()),
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                terminate: AtomicBool::new(false),
                attached: AtomicBool::new(true),
            }),
        }
    }

    /// Offer discovered devices to the engine
    ///
    /// The first device becomes the candidate and a session start is
    /// attempted. An empty list is a no-op.
    pub fn notify_device_available<I>(&self, devices: I)
    where
        I: IntoIterator<Item = M::Device>,
    {
        if !self.inner.attached.load(Ordering::Acquire) {
            debug!("Engine shut down, ignoring device notification");
            return;
        }

        let Some(device) = devices.into_iter().next() else {
            debug!("No accessory available");
            return;
        };

        debug!("Accessory candidate {:?}", device);
        *self.inner.candidate.lock() = Some(device);
        Inner::attempt_open(&self.inner);
    }

    /// Write `data` to the accessory, blocking the calling thread
    ///
    /// Without a live session this is a logged no-op. Write failures are
    /// logged and swallowed.
    pub fn write(&self, data: &[u8]) {
        let session = if self.inner.connected.load(Ordering::Acquire) {
            self.inner.session.lock().clone()
        } else {
            None
        };

        let Some(session) = session else {
            debug!(
                "Accessory not connected, dropping {} byte write",
                data.len()
            );
            return;
        };

        if let Err(e) = session.stream.write_all(data) {
            warn!("Could not send {} bytes to accessory: {}", data.len(), e);
        }
    }

    /// Stop the engine
    ///
    /// Sets the termination flag, unregisters the detach listener and closes
    /// the live stream so a blocked read fails. Does not wait for the read
    /// loop; see [`join_reader`](Self::join_reader). Returns as quickly as the
    /// backend's [`AccessoryStream::close`], which must not wait for an
    /// in-flight read.
    pub fn shutdown(&self) {
        info!("Shutting down accessory engine");
        self.inner.terminate.store(true, Ordering::SeqCst);

        if self.inner.attached.swap(false, Ordering::AcqRel) {
            debug!("Detach listener unregistered");
        }

        let session = self.inner.session.lock().clone();
        if let Some(session) = session
            && session.release()
        {
            debug!("Closed accessory stream to unblock reader");
        }
    }

    /// Environment detach signal
    ///
    /// Notifies the listener immediately, whether or not a session exists,
    /// and forgets the candidate device. Ignored after shutdown.
    pub fn on_device_detached(&self) {
        if !self.inner.attached.load(Ordering::Acquire) {
            debug!("Detach signal after shutdown ignored");
            return;
        }

        self.inner.candidate.lock().take();
        info!("Accessory physically disconnected");
        self.inner.listener.on_device_disconnected();
    }

    /// Wait for the current read-loop thread to exit
    ///
    /// Returns false if there was no thread to join. Never joins from the
    /// read-loop thread itself. Must not be called from a listener callback:
    /// a restarted reader waits for that callback to return.
    pub fn join_reader(&self) -> bool {
        let handle = {
            let mut reader = self.inner.reader.lock();
            match reader.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => return false,
                Some(_) => reader.take(),
                None => None,
            }
        };

        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("Accessory reader thread panicked");
                }
                true
            }
            None => false,
        }
    }

    /// Whether a read-loop thread currently exists
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether a session is established
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether a permission request is awaiting its answer
    pub fn is_permission_pending(&self) -> bool {
        self.inner.gate.is_pending()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        !self.inner.attached.load(Ordering::Acquire)
    }

    /// The current candidate device
    pub fn candidate(&self) -> Option<M::Device> {
        self.inner.candidate.lock().clone()
    }
}

impl<M: AccessoryManager> Inner<M> {
    fn attempt_open(this: &Arc<Self>) {
        let Some(device) = this.candidate.lock().clone() else {
            debug!("Accessory is null");
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(this);
        let status = this.gate.ensure(this.manager.as_ref(), &device, move || {
            if let Some(inner) = weak.upgrade() {
                Inner::start_reader(&inner);
            }
        });

        if status == PermissionStatus::Requested {
            debug!("Open deferred until permission response");
        }
    }

    /// Spawn the read loop unless one already runs
    fn start_reader(this: &Arc<Self>) -> bool {
        if !this.attached.load(Ordering::Acquire) {
            debug!("Engine shut down, not starting reader");
            return false;
        }

        let Some(device) = this.candidate.lock().clone() else {
            debug!("Accessory is null");
            return false;
        };

        if this
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reader thread already started");
            return false;
        }

        // Held across the spawn so a reader restarted from the close callback
        // cannot store its handle before this one
        let mut reader = this.reader.lock();
        let worker = Arc::clone(this);
        let spawned = thread::Builder::new()
            .name(this.config.reader_thread_name.clone())
            .spawn(move || worker.run_session(device));

        match spawned {
            Ok(handle) => {
                *reader = Some(handle);
                true
            }
            Err(e) => {
                error!("Failed to spawn reader thread: {}", e);
                this.running.store(false, Ordering::Release);
                false
            }
        }
    }

    fn run_session(&self, device: M::Device) {
        debug!("Opening accessory {:?}", device);
        let stream = match self.manager.open(&device) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Could not open accessory {:?}: {}", device, e);
                let _emit = self.emit.lock();
                self.running.store(false, Ordering::Release);
                self.listener.on_connection_closed();
                return;
            }
        };

        let session = Arc::new(Session::new(stream));
        *self.session.lock() = Some(Arc::clone(&session));
        {
            // Waits for the previous session's closed callback to return
            let _emit = self.emit.lock();
            self.connected.store(true, Ordering::Release);
            info!("Accessory connection established");
            self.listener.on_connection_established();
        }

        let mut buffer = vec![0u8; self.config.buffer_size.max(1)];
        let mut reads: u64 = 0;
        while !self.terminate.load(Ordering::SeqCst) {
            match session.stream.read(&mut buffer) {
                Ok(0) => {
                    debug!("Accessory stream reached end of file");
                    break;
                }
                Ok(n) => {
                    reads += 1;
                    self.listener.on_data_received(&buffer, n);
                }
                Err(e) => {
                    debug!("Accessory read ended: {}", e);
                    break;
                }
            }
        }

        debug!("Exiting reader thread after {} reads", reads);
        self.teardown(&session);
    }

    fn teardown(&self, session: &Session<M::Stream>) {
        self.session.lock().take();
        session.release();

        // A restart may begin once `running` clears, but its established
        // callback is held back until this closed callback returns
        let _emit = self.emit.lock();
        self.connected.store(false, Ordering::Release);
        self.terminate.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::Release);

        info!("Accessory connection closed");
        self.listener.on_connection_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        DEFAULT_TEST_TIMEOUT, MockAccessoryManager, MockStream, RecordingListener, mock_device,
        wait_until,
    };

    fn engine_with(
        manager: &Arc<MockAccessoryManager>,
        listener: &Arc<RecordingListener>,
    ) -> ConnectionEngine<MockAccessoryManager> {
        ConnectionEngine::new(
            Arc::clone(manager),
            Arc::clone(listener) as Arc<dyn EngineListener>,
            EngineConfig::default(),
        )
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.reader_thread_name, "accessory-reader");
    }

    #[test]
    fn test_write_without_session_is_noop() {
        let manager = Arc::new(MockAccessoryManager::new(true));
        let listener = Arc::new(RecordingListener::new());
        let engine = engine_with(&manager, &listener);

        engine.write(&[1, 2, 3]);

        assert!(listener.events().is_empty());
        assert_eq!(manager.open_calls(), 0);
    }

    #[test]
    fn test_session_release_is_once_only() {
        let stream = MockStream::new();
        let session = Session::new(stream.clone());

        assert!(session.release());
        assert!(!session.release());
        assert_eq!(stream.close_count(), 1);
    }

    #[test]
    fn test_reader_thread_is_named() {
        let manager = Arc::new(MockAccessoryManager::new(true));
        let stream = MockStream::new();
        manager.queue_stream(stream.clone());
        let listener = Arc::new(RecordingListener::new());
        let engine = ConnectionEngine::new(
            Arc::clone(&manager),
            Arc::clone(&listener) as Arc<dyn EngineListener>,
            EngineConfig {
                buffer_size: 16,
                reader_thread_name: "reader-under-test".to_string(),
            },
        );

        engine.notify_device_available([mock_device(1)]);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || engine.is_connected()));

        let name = engine
            .inner
            .reader
            .lock()
            .as_ref()
            .and_then(|h| h.thread().name().map(str::to_string));
        assert_eq!(name.as_deref(), Some("reader-under-test"));

        engine.shutdown();
        assert!(engine.join_reader());
    }

    #[test]
    fn test_small_buffer_splits_reads() {
        let manager = Arc::new(MockAccessoryManager::new(true));
        let stream = MockStream::new();
        manager.queue_stream(stream.clone());
        let listener = Arc::new(RecordingListener::new());
        let engine = ConnectionEngine::new(
            Arc::clone(&manager),
            Arc::clone(&listener) as Arc<dyn EngineListener>,
            EngineConfig {
                buffer_size: 2,
                ..EngineConfig::default()
            },
        );

        stream.push_read(vec![9, 8]);
        stream.push_failure(std::io::ErrorKind::BrokenPipe);
        engine.notify_device_available([mock_device(1)]);

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || listener.closed_count() == 1));
        assert_eq!(listener.data(), vec![vec![9, 8]]);
    }

    #[test]
    fn test_detach_forgets_candidate() {
        let manager = Arc::new(MockAccessoryManager::new(false));
        let listener = Arc::new(RecordingListener::new());
        let engine = engine_with(&manager, &listener);

        engine.notify_device_available([mock_device(3)]);
        assert_eq!(engine.candidate(), Some(mock_device(3)));

        engine.on_device_detached();
        assert_eq!(engine.candidate(), None);
        assert_eq!(listener.disconnected_count(), 1);

        // Grant arrives after detach: nothing to open
        manager.respond_permission(true);
        assert!(!engine.is_running());
        assert_eq!(manager.open_calls(), 0);
    }
}
