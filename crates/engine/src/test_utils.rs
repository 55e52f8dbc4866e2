//! Test utilities for the connection engine
//!
//! Provides a scriptable [`AccessoryManager`], a blocking [`MockStream`] and a
//! [`RecordingListener`] for exercising the engine without hardware.
//!
//! # Example
//!
//! ```
//! use engine::test_utils::{MockAccessoryManager, MockStream, mock_device};
//! use engine::AccessoryManager;
//!
//! # fn main() {
//! let manager = MockAccessoryManager::new(true);
//! manager.queue_stream(MockStream::new());
//! assert!(manager.has_permission(&mock_device(1)));
//! # }
//! ```

use crate::device::{AccessoryManager, AccessoryStream};
use crate::listener::EngineListener;
use crate::permission::PermissionResponder;
use async_channel::{Receiver, Sender, unbounded};
use bytes::Bytes;
use common::{Error, LifecycleEvent, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Device reference used by the mocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockDevice {
    pub id: u32,
}

/// Create a mock device reference
pub fn mock_device(id: u32) -> MockDevice {
    MockDevice { id }
}

/// One scripted result for [`MockStream::read`]
#[derive(Debug, Clone)]
pub enum ReadStep {
    Data(Vec<u8>),
    Fail(ErrorKind),
    Eof,
}

struct MockStreamState {
    reads_tx: Sender<ReadStep>,
    reads_rx: Receiver<ReadStep>,
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    close_calls: AtomicUsize,
}

/// Scripted duplex stream
///
/// Reads block until a step is pushed; closing the stream wakes a blocked
/// read with [`Error::Closed`]. Clones share state.
#[derive(Clone)]
pub struct MockStream {
    state: Arc<MockStreamState>,
}

impl MockStream {
    pub fn new() -> Self {
        let (reads_tx, reads_rx) = unbounded();
        Self {
            state: Arc::new(MockStreamState {
                reads_tx,
                reads_rx,
                written: Mutex::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue data for the next read
    pub fn push_read(&self, data: impl Into<Vec<u8>>) {
        let _ = self.state.reads_tx.try_send(ReadStep::Data(data.into()));
    }

    /// Queue a read failure
    pub fn push_failure(&self, kind: ErrorKind) {
        let _ = self.state.reads_tx.try_send(ReadStep::Fail(kind));
    }

    /// Queue end of stream
    pub fn push_eof(&self) {
        let _ = self.state.reads_tx.try_send(ReadStep::Eof);
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.written.lock().clone()
    }

    /// Number of times `close` was called
    pub fn close_count(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.reads_tx.is_closed()
    }
}

impl Default for MockStream {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessoryStream for MockStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.state.reads_rx.recv_blocking() {
            Ok(ReadStep::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Ok(ReadStep::Fail(kind)) => Err(Error::Io(std::io::Error::from(kind))),
            Ok(ReadStep::Eof) => Ok(0),
            Err(_) => Err(Error::Closed),
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::from(ErrorKind::BrokenPipe)));
        }
        self.state.written.lock().push(data.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.reads_tx.close();
        Ok(())
    }
}

/// Scriptable accessory environment
///
/// Each `open` consumes one queued stream; with none queued, or while
/// [`fail_open`](Self::fail_open) is set, opening fails.
pub struct MockAccessoryManager {
    granted: AtomicBool,
    fail_open: AtomicBool,
    streams: Mutex<VecDeque<MockStream>>,
    pending: Mutex<VecDeque<PermissionResponder>>,
    permission_requests: AtomicUsize,
    open_calls: AtomicUsize,
}

impl MockAccessoryManager {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            fail_open: AtomicBool::new(false),
            streams: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            permission_requests: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Queue the stream returned by the next successful open
    pub fn queue_stream(&self, stream: MockStream) {
        self.streams.lock().push_back(stream);
    }

    /// Answer the oldest pending permission request
    ///
    /// A grant is recorded before the responder runs, like a host that
    /// remembers the user's choice. Returns false if nothing was pending.
    pub fn respond_permission(&self, granted: bool) -> bool {
        let responder = self.pending.lock().pop_front();
        match responder {
            Some(responder) => {
                if granted {
                    self.set_permission(true);
                }
                responder.respond(granted);
                true
            }
            None => false,
        }
    }

    /// Drop pending responders without answering
    pub fn drop_pending_requests(&self) {
        let dropped: Vec<_> = self.pending.lock().drain(..).collect();
        drop(dropped);
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

impl AccessoryManager for MockAccessoryManager {
    type Device = MockDevice;
    type Stream = MockStream;

    fn has_permission(&self, _device: &MockDevice) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn request_permission(&self, _device: &MockDevice, responder: PermissionResponder) {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back(responder);
    }

    fn open(&self, device: &MockDevice) -> Result<MockStream> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Usb(format!("cannot open {:?}", device)));
        }
        self.streams
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Usb(format!("no stream for {:?}", device)))
    }
}

type CloseHook = Box<dyn Fn() + Send + Sync>;

/// Listener that records every event in order
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LifecycleEvent>>,
    close_hook: Mutex<Option<CloseHook>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` inside every `on_connection_closed` callback
    pub fn set_close_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.close_hook.lock() = Some(Box::new(hook));
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Payloads of all `DataReceived` events in delivery order
    pub fn data(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::DataReceived { data } => Some(data.to_vec()),
                _ => None,
            })
            .collect()
    }

    pub fn established_count(&self) -> usize {
        self.count(|e| matches!(e, LifecycleEvent::ConnectionEstablished))
    }

    pub fn closed_count(&self) -> usize {
        self.count(|e| matches!(e, LifecycleEvent::ConnectionClosed))
    }

    pub fn disconnected_count(&self) -> usize {
        self.count(|e| matches!(e, LifecycleEvent::DeviceDisconnected))
    }

    fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&LifecycleEvent) -> bool,
    {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EngineListener for RecordingListener {
    fn on_connection_established(&self) {
        self.events.lock().push(LifecycleEvent::ConnectionEstablished);
    }

    fn on_device_disconnected(&self) {
        self.events.lock().push(LifecycleEvent::DeviceDisconnected);
    }

    fn on_connection_closed(&self) {
        if let Some(hook) = self.close_hook.lock().as_ref() {
            hook();
        }
        self.events.lock().push(LifecycleEvent::ConnectionClosed);
    }

    fn on_data_received(&self, buffer: &[u8], length: usize) {
        self.events.lock().push(LifecycleEvent::DataReceived {
            data: Bytes::copy_from_slice(&buffer[..length]),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_stream_close_unblocks_read() {
        let stream = MockStream::new();
        let reader = stream.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });

        std::thread::sleep(Duration::from_millis(20));
        stream.close().unwrap();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[test]
    fn test_mock_stream_truncates_to_buffer() {
        let stream = MockStream::new();
        stream.push_read(vec![1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_mock_manager_open_without_stream_fails() {
        let manager = MockAccessoryManager::new(true);
        assert!(manager.open(&mock_device(1)).is_err());
        assert_eq!(manager.open_calls(), 1);
    }

    #[test]
    fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(20), || false));
        assert!(wait_until(Duration::from_millis(20), || true));
    }
}
