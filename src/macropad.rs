//! Orchestrator: composes the device transport and the control-plane client
//!
//! Classifies inbound traffic and forwards it between the two sides through
//! collaborator-registered hooks. Button-to-action mapping, LED policy and
//! token persistence live outside the core; the seams they plug into are
//! the `on_button`, `on_state_change` and `on_token_refresh` registrations.

use crate::core::state::{HardwareState, MeetingSnapshot, SharedHardwareState, SharedMeetingState};
use crate::error::{Error, Result};
use crate::hid::device::{DeviceSpec, HidTransport, SendHandle};
use crate::hid::report::{HidCommand, HidInput, LedColor, Status, UpdateConfig};
use crate::hid::transfer::TransferFile;
use crate::hid::update::perform_upgrade;
use crate::meeting::client::{Identifier, MeetingClient};
use crate::meeting::messages::{MeetingAction, ReactionType, ServerMessage};
use crate::util::{run_loop, RunFlag};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Pace of the periodic status-check loop.
const STATUS_CHECK_PACE: Duration = Duration::from_millis(100);

/// Bounded wait on the internal event queue.
const EVENT_POLL: Duration = Duration::from_millis(200);

type ButtonHandler = Arc<dyn Fn(Status) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ServerMessage) + Send + Sync>;
type TokenSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Inbound traffic from either side, classified by the orchestrator loop.
enum Event {
    Hid(HidInput),
    Meeting(ServerMessage),
}

/// Per-button LED dedup cache: identical consecutive updates are skipped
/// until the cache is cleared by a forced refresh.
struct LedCache(HashMap<u8, LedColor>);

impl LedCache {
    fn new() -> Self {
        Self(HashMap::new())
    }

    /// Whether this update changes the button's LED; records it if so.
    fn update(&mut self, button: u8, color: LedColor) -> bool {
        if self.0.get(&button) == Some(&color) {
            return false;
        }
        self.0.insert(button, color);
        true
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// The main composition of the host driver.
pub struct Macropad {
    run: RunFlag,
    device: Arc<HidTransport>,
    meeting: Arc<MeetingClient>,
    hardware: SharedHardwareState,
    meeting_state: SharedMeetingState,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    button_handler: Mutex<Option<ButtonHandler>>,
    state_handler: Mutex<Option<StateHandler>>,
    token_sink: Mutex<Option<TokenSink>>,
    led_cache: Mutex<LedCache>,
    version_seen: Mutex<Option<String>>,
}

impl Macropad {
    pub fn new(specs: Vec<DeviceSpec>, uri: &str, identifier: Identifier) -> Result<Self> {
        let hardware: SharedHardwareState = Arc::new(RwLock::new(HardwareState::default()));
        let meeting_state: SharedMeetingState = Arc::new(RwLock::new(MeetingSnapshot::default()));

        let device = Arc::new(HidTransport::new(specs, Arc::clone(&hardware))?);
        let meeting = Arc::new(MeetingClient::new(uri, identifier, Arc::clone(&meeting_state)));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let hid_tx = event_tx.clone();
        device.register_callback(move |msg| {
            let _ = hid_tx.send(Event::Hid(msg));
        });
        let ws_tx = event_tx;
        meeting.register_callback(move |msg| {
            let _ = ws_tx.send(Event::Meeting(msg));
        });

        Ok(Self {
            run: RunFlag::new(),
            device,
            meeting,
            hardware,
            meeting_state,
            event_rx: tokio::sync::Mutex::new(event_rx),
            button_handler: Mutex::new(None),
            state_handler: Mutex::new(None),
            token_sink: Mutex::new(None),
            led_cache: Mutex::new(LedCache::new()),
            version_seen: Mutex::new(None),
        })
    }

    /// Collaborator hook: meaningful button activations (triggered and
    /// released, single or double tap).
    pub fn on_button<F>(&self, handler: F)
    where
        F: Fn(Status) + Send + Sync + 'static,
    {
        *self.button_handler.lock() = Some(Arc::new(handler));
    }

    /// Collaborator hook: invoked with the merged state after every
    /// control-plane message and periodically by the status-check loop.
    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(ServerMessage) + Send + Sync + 'static,
    {
        *self.state_handler.lock() = Some(Arc::new(handler));
    }

    /// Collaborator hook: refreshed pairing tokens, to be persisted.
    pub fn on_token_refresh<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.token_sink.lock() = Some(Arc::new(sink));
    }

    /// Set a button LED, skipping updates identical to the last one sent
    /// for that button. Returns the completion when a write was queued.
    pub fn set_led(&self, button: u8, color: LedColor) -> Option<SendHandle> {
        if !self.led_cache.lock().update(button, color) {
            return None;
        }
        debug!("LED {} -> {:?}", button, color);
        Some(self.device.send(HidCommand::SetLed { button, color }))
    }

    /// Clear the LED dedup cache and re-run the state handler so
    /// collaborators resend every LED.
    pub fn refresh_leds(&self) {
        self.led_cache.lock().clear();
        self.invoke_state_handler();
    }

    /// Forward a meeting action to the control plane.
    pub fn send_action(&self, action: MeetingAction) -> crate::meeting::client::SendHandle {
        self.meeting.send_action(action)
    }

    /// Forward a reaction to the control plane.
    pub fn send_reaction(&self, reaction: ReactionType) -> crate::meeting::client::SendHandle {
        self.meeting.send_reaction(reaction)
    }

    pub fn activate_serial_console(&self) -> SendHandle {
        self.device.send(HidCommand::UpdateConfig(UpdateConfig {
            activate_debug: true,
            activate_filesystem: false,
        }))
    }

    pub fn deactivate_serial_console(&self) -> SendHandle {
        self.device.send(HidCommand::UpdateConfig(UpdateConfig::default()))
    }

    pub fn activate_filesystem(&self) -> SendHandle {
        self.device.send(HidCommand::UpdateConfig(UpdateConfig {
            activate_debug: false,
            activate_filesystem: true,
        }))
    }

    pub fn device_connected(&self) -> bool {
        self.device.connected()
    }

    pub fn meeting_connected(&self) -> bool {
        self.meeting.connected()
    }

    /// Run the transport, the control-plane client, the event dispatcher
    /// and the periodic status check until [`stop`](Self::stop).
    pub async fn process(&self) {
        tokio::join!(
            self.device.process(),
            self.meeting.process(),
            run_loop(&self.run, || self.event_step()),
            run_loop(&self.run, || self.status_step()),
        );
        info!("macropad stopped");
    }

    pub async fn stop(&self) {
        self.run.clear();
        self.device.stop();
        self.meeting.stop().await;
    }

    /// Flash the device with the given files. Waits for a device, detaches
    /// its handle so the transfer monopolizes the transport, and triggers
    /// rediscovery afterwards (the device reboots into the new firmware).
    pub async fn manual_update(&self, paths: &[impl AsRef<Path>]) -> Result<()> {
        self.device.wait_for_device().await;
        let handle = self.device.take_device().ok_or(Error::NotConnected)?;

        let files = paths
            .iter()
            .enumerate()
            .map(|(index, path)| TransferFile::from_path(index as u16, path.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let result = perform_upgrade(&handle, files).await;
        drop(handle);
        self.device.wait_for_device().await;
        result
    }

    async fn event_step(&self) {
        let event = {
            let mut rx = self.event_rx.lock().await;
            match tokio::time::timeout(EVENT_POLL, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => return,
            }
        };
        match event {
            Event::Hid(input) => self.handle_hid(input),
            Event::Meeting(message) => self.handle_meeting(message),
        }
    }

    fn handle_hid(&self, input: HidInput) {
        match input {
            HidInput::Status(status) => {
                debug!("{:?}", status);
                self.hardware.write().last_button_pressed = Some(status.button);
                // Only completed activations reach the collaborator
                if status.triggered && status.released {
                    let handler = self.button_handler.lock().clone();
                    if let Some(handler) = handler {
                        handler(status);
                    }
                }
            }
            HidInput::VersionInfo(version) => {
                let text = version.version();
                let mut seen = self.version_seen.lock();
                if seen.as_deref() != Some(text.as_str()) {
                    info!("device firmware {} ({})", text, version.hardware);
                    *seen = Some(text.clone());
                }
                drop(seen);
                {
                    let mut hardware = self.hardware.write();
                    hardware.version = text;
                    hardware.variant = version.hardware.to_string();
                }
                // A fresh version report means the device (re)announced
                // itself; force the LEDs back into a known state.
                self.refresh_leds();
            }
        }
    }

    fn handle_meeting(&self, message: ServerMessage) {
        if let Some(token) = &message.token_refresh {
            let sink = self.token_sink.lock().clone();
            match sink {
                Some(sink) => sink(token),
                None => warn!("received token refresh but no sink is registered"),
            }
        }
        self.invoke_state_handler();
    }

    async fn status_step(&self) {
        tokio::time::sleep(STATUS_CHECK_PACE).await;
        self.invoke_state_handler();
    }

    fn invoke_state_handler(&self) {
        let handler = self.state_handler.lock().clone();
        if let Some(handler) = handler {
            let state = self.meeting_state.read().state.clone();
            handler(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn led_cache_skips_identical_updates() {
        let mut cache = LedCache::new();
        assert!(cache.update(1, LedColor::GREEN));
        assert!(!cache.update(1, LedColor::GREEN));
        assert!(cache.update(1, LedColor::RED));
        assert!(cache.update(2, LedColor::GREEN));
    }

    #[test]
    fn led_cache_clear_forces_resend() {
        let mut cache = LedCache::new();
        assert!(cache.update(1, LedColor::BLUE));
        cache.clear();
        assert!(cache.update(1, LedColor::BLUE));
    }
}
