//! HID transport: discovery, reconnection, queued writes and inbound fan-out
//!
//! Owns the physical device handle. Outbound commands go through an
//! unbounded queue with per-command completion handles; inbound reports are
//! decoded and fanned out to every registered callback. Unplug/replug is
//! survived by a single-flight rediscovery path — queued work is kept, not
//! dropped.

use crate::core::state::{ConnectionState, SharedHardwareState};
use crate::error::{Error, Result};
use crate::hid::report::{HidCommand, HidInput, REPORT_SIZE};
use crate::util::{poll_until, run_loop, RunFlag, SingleFlight};
use hidapi::{BusType, HidApi, HidDevice};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Product-string substring used when no explicit identifiers are given.
const PRODUCT_NAME_MATCH: &str = "meetpad";

/// Keep-alive floor: pings are sent no more often than this.
const PING_INTERVAL: Duration = Duration::from_millis(4500);

/// Sleep after an empty read or while no device is attached.
const READ_IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Discovery retry interval.
const DISCOVERY_POLL: Duration = Duration::from_secs(1);

/// Bounded wait on the send queue, so the write loop observes shutdown.
const WRITE_POLL: Duration = Duration::from_millis(200);

/// Explicit device identifiers from configuration. An entry with zero
/// vendor/product ids matches on serial number alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

fn matches_specs(
    specs: &[DeviceSpec],
    vendor_id: u16,
    product_id: u16,
    serial: Option<&str>,
    product: Option<&str>,
) -> bool {
    if specs.is_empty() {
        return product
            .map(|p| p.to_ascii_lowercase().contains(PRODUCT_NAME_MATCH))
            .unwrap_or(false);
    }
    specs.iter().any(|spec| {
        if spec.vendor_id == 0 && spec.product_id == 0 {
            spec.serial_number.as_deref().is_some_and(|s| Some(s) == serial)
        } else {
            spec.vendor_id == vendor_id
                && spec.product_id == product_id
                && spec
                    .serial_number
                    .as_deref()
                    .map_or(true, |s| Some(s) == serial)
        }
    })
}

/// Completion handle for one queued command.
pub struct SendHandle {
    rx: oneshot::Receiver<Result<usize>>,
}

impl SendHandle {
    /// Resolve to the byte count written, or the write/disconnect error.
    pub async fn done(self) -> Result<usize> {
        self.rx.await.map_err(|_| Error::Stopped)?
    }
}

/// Identifier returned by [`HidTransport::register_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

type InputCallback = Arc<dyn Fn(HidInput) + Send + Sync>;

struct QueuedCommand {
    cmd: HidCommand,
    done: oneshot::Sender<Result<usize>>,
}

/// Resilient bidirectional transport to the macropad.
pub struct HidTransport {
    api: Mutex<HidApi>,
    device: Mutex<Option<HidDevice>>,
    specs: Vec<DeviceSpec>,
    callbacks: Mutex<Vec<(CallbackId, InputCallback)>>,
    next_callback_id: AtomicU64,
    send_tx: mpsc::UnboundedSender<QueuedCommand>,
    send_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedCommand>>,
    run: RunFlag,
    reconnect: SingleFlight,
    hardware: SharedHardwareState,
    last_communication: Mutex<Option<Instant>>,
    last_ping: Mutex<Option<Instant>>,
}

impl HidTransport {
    pub fn new(specs: Vec<DeviceSpec>, hardware: SharedHardwareState) -> Result<Self> {
        let api = HidApi::new()?;
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        Ok(Self {
            api: Mutex::new(api),
            device: Mutex::new(None),
            specs,
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            send_tx,
            send_rx: tokio::sync::Mutex::new(send_rx),
            run: RunFlag::new(),
            reconnect: SingleFlight::new(),
            hardware,
            last_communication: Mutex::new(None),
            last_ping: Mutex::new(None),
        })
    }

    /// Enqueue an outbound command. Never blocks; the queue is unbounded.
    pub fn send(&self, cmd: HidCommand) -> SendHandle {
        let (tx, rx) = oneshot::channel();
        if let Err(rejected) = self.send_tx.send(QueuedCommand { cmd, done: tx }) {
            // Receiver gone: the transport was dropped after stop()
            let _ = rejected.0.done.send(Err(Error::Stopped));
        }
        SendHandle { rx }
    }

    /// Register an inbound fan-out callback. Callbacks must be cheap;
    /// long-running consumers should forward into their own channel.
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(HidInput) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) {
        self.callbacks.lock().retain(|(cb_id, _)| *cb_id != id);
    }

    pub fn connected(&self) -> bool {
        self.device.lock().is_some()
    }

    /// Instant of the last successful write, for diagnostics.
    pub fn last_communication(&self) -> Option<Instant> {
        *self.last_communication.lock()
    }

    /// Run until [`stop`](Self::stop): discovery, then the read, write and
    /// keep-alive loops concurrently.
    pub async fn process(&self) {
        self.wait_for_device().await;
        tokio::join!(
            run_loop(&self.run, || self.read_step()),
            run_loop(&self.run, || self.write_step()),
            run_loop(&self.run, || self.ping_step()),
        );
        info!("HID transport stopped");
    }

    /// Clear the run flag. Loops exit at their next iteration boundary;
    /// queued-but-unsent completions stay pending (they fail with
    /// `Error::Stopped` once the transport is dropped) — callers needing
    /// immediate failure semantics must drain explicitly.
    pub fn stop(&self) {
        self.run.clear();
    }

    /// Take exclusive ownership of the open device handle, e.g. for a
    /// firmware upgrade. The transport will rediscover afterwards.
    pub fn take_device(&self) -> Option<HidDevice> {
        self.device.lock().take()
    }

    /// Block (cooperatively) until a device is connected.
    pub async fn wait_for_device(&self) {
        self.reconnect
            .run(|| async {
                *self.device.lock() = None;
                self.hardware.write().connection = ConnectionState::Disconnected;
                info!("searching for device");
                let found = poll_until(&self.run, DISCOVERY_POLL, || async { self.try_open() }).await;
                if let Some(device) = found {
                    self.record_identity(&device);
                    *self.device.lock() = Some(device);
                    info!("device connected");
                }
            })
            .await;
    }

    fn record_identity(&self, device: &HidDevice) {
        let mut hardware = self.hardware.write();
        hardware.manufacturer = device
            .get_manufacturer_string()
            .ok()
            .flatten()
            .unwrap_or_default();
        hardware.product = device.get_product_string().ok().flatten().unwrap_or_default();
        hardware.serial_number = device
            .get_serial_number_string()
            .ok()
            .flatten()
            .unwrap_or_default();
        hardware.connection = ConnectionState::Connected;
    }

    /// One enumeration pass. Candidates matching the configured specs (or
    /// the product-name substring) are tried non-Bluetooth first.
    fn try_open(&self) -> Option<HidDevice> {
        let mut api = self.api.lock();
        if let Err(e) = api.refresh_devices() {
            debug!("failed to refresh device list: {}", e);
        }

        let mut candidates: Vec<_> = api
            .device_list()
            .filter(|d| {
                matches_specs(
                    &self.specs,
                    d.vendor_id(),
                    d.product_id(),
                    d.serial_number(),
                    d.product_string(),
                )
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|d| matches!(d.bus_type(), BusType::Bluetooth));

        for info in candidates {
            match info.open_device(&api) {
                Ok(device) => {
                    if let Err(e) = device.set_blocking_mode(false) {
                        warn!("failed to set non-blocking mode: {}", e);
                        continue;
                    }
                    info!(
                        "opened device {} {}",
                        info.manufacturer_string().unwrap_or("?"),
                        info.product_string().unwrap_or("?"),
                    );
                    return Some(device);
                }
                Err(e) => debug!("could not open candidate: {}", e),
            }
        }
        None
    }

    fn dispatch(&self, msg: HidInput) {
        let callbacks: Vec<InputCallback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(msg);
        }
    }

    async fn read_step(&self) {
        enum Outcome {
            Idle,
            Data([u8; REPORT_SIZE], usize),
            Failed(Error),
        }

        let outcome = {
            let guard = self.device.lock();
            match guard.as_ref() {
                None => Outcome::Idle,
                Some(device) => {
                    let mut buf = [0u8; REPORT_SIZE];
                    match device.read(&mut buf) {
                        Ok(0) => Outcome::Idle,
                        Ok(n) => Outcome::Data(buf, n),
                        Err(e) => Outcome::Failed(e.into()),
                    }
                }
            }
        };

        match outcome {
            Outcome::Idle => tokio::time::sleep(READ_IDLE_SLEEP).await,
            Outcome::Data(buf, n) => match HidInput::parse(&buf[..n]) {
                Ok(msg) => {
                    debug!("received {:?}", msg);
                    self.dispatch(msg);
                }
                Err(e) => warn!("undecodable report: {}", e),
            },
            Outcome::Failed(e) => {
                warn!("device read failed: {}", e);
                self.wait_for_device().await;
            }
        }
    }

    async fn write_step(&self) {
        // Leave commands queued while disconnected; they are serviced once
        // connectivity is restored, never dropped.
        if !self.connected() {
            tokio::time::sleep(READ_IDLE_SLEEP).await;
            return;
        }

        let queued = {
            let mut rx = self.send_rx.lock().await;
            match tokio::time::timeout(WRITE_POLL, rx.recv()).await {
                Ok(Some(queued)) => queued,
                Ok(None) | Err(_) => return,
            }
        };

        let result = {
            let guard = self.device.lock();
            match guard.as_ref() {
                None => Err(Error::NotConnected),
                Some(device) => device.write(&queued.cmd.wire_bytes()).map_err(Error::from),
            }
        };

        match result {
            Ok(written) => {
                debug!("wrote {:?} ({} bytes)", queued.cmd, written);
                *self.last_communication.lock() = Some(Instant::now());
                let _ = queued.done.send(Ok(written));
            }
            Err(e) => {
                warn!("device write failed: {}", e);
                let _ = queued.done.send(Err(e));
                self.wait_for_device().await;
            }
        }
    }

    async fn ping_step(&self) {
        let wait = match *self.last_ping.lock() {
            None => Duration::ZERO,
            Some(last) => (last + PING_INTERVAL).saturating_duration_since(Instant::now()),
        };
        tokio::time::sleep(wait).await;

        // Guard against spurious wake-ups: only send if the interval has
        // genuinely elapsed.
        let due = self
            .last_ping
            .lock()
            .map_or(true, |last| last.elapsed() >= PING_INTERVAL);
        if !due {
            return;
        }

        *self.last_ping.lock() = Some(Instant::now());
        // Bound the wait so a ping queued against an absent device cannot
        // wedge the loop past the next interval.
        match tokio::time::timeout(PING_INTERVAL, self.send(HidCommand::Ping).done()).await {
            Ok(Ok(_)) => debug!("ping sent"),
            Ok(Err(e)) => warn!("failed to send ping: {}", e),
            Err(_) => warn!("ping not confirmed before the next interval"),
        }
        *self.last_ping.lock() = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_match_when_no_specs_configured() {
        assert!(matches_specs(&[], 0x1234, 0x5678, None, Some("Meetpad Macropad v2")));
        assert!(!matches_specs(&[], 0x1234, 0x5678, None, Some("Some Keyboard")));
        assert!(!matches_specs(&[], 0x1234, 0x5678, None, None));
    }

    #[test]
    fn explicit_spec_matches_ids_and_optional_serial() {
        let specs = vec![DeviceSpec {
            vendor_id: 0x1D50,
            product_id: 0x6189,
            serial_number: None,
        }];
        assert!(matches_specs(&specs, 0x1D50, 0x6189, Some("abc"), None));
        assert!(!matches_specs(&specs, 0x1D50, 0x0001, Some("abc"), None));

        let pinned = vec![DeviceSpec {
            vendor_id: 0x1D50,
            product_id: 0x6189,
            serial_number: Some("abc".into()),
        }];
        assert!(matches_specs(&pinned, 0x1D50, 0x6189, Some("abc"), None));
        assert!(!matches_specs(&pinned, 0x1D50, 0x6189, Some("xyz"), None));
    }

    #[test]
    fn zero_ids_match_on_serial_alone() {
        let specs = vec![DeviceSpec {
            vendor_id: 0,
            product_id: 0,
            serial_number: Some("serial-1".into()),
        }];
        assert!(matches_specs(&specs, 0xAAAA, 0xBBBB, Some("serial-1"), None));
        assert!(!matches_specs(&specs, 0xAAAA, 0xBBBB, Some("serial-2"), None));
    }

    #[tokio::test]
    async fn send_handle_fails_once_queue_is_gone() {
        let (tx, rx) = oneshot::channel::<Result<usize>>();
        drop(tx);
        let handle = SendHandle { rx };
        assert!(matches!(handle.done().await, Err(Error::Stopped)));
    }
}
