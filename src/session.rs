//! The per-device session: connection lifecycle, handshake, and operations.
//!
//! A [`DeviceSession`] is created by the manager from one advertisement and
//! drives one peripheral. Inbound notifications flow through a per-session
//! pump task (reassembly → decryption → dispatch), so status callbacks fire
//! in receive order and before the next frame is dequeued. Outbound frames
//! take a transmit lock so the chunks of two commands never interleave on
//! the characteristic.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::advertisement::{Advertisement, ProductModel};
use crate::ble::{Peripheral, PeripheralLink, RX_UUID, SERVICE_UUID, TX_UUID};
use crate::crypto::{self, AppKey, SessionCipher};
use crate::device::{DeviceKey, DeviceProfile, DeviceStatus, Intention};
use crate::error::{Error, Result};
use crate::mech::{MechSetting, MechStatus};
use crate::protocol::{
    history_tag, Command, ItemCode, Notification, OpCode, Publish, Response, ResultCode,
};
use crate::transport::{Receiver, SegmentKind, Transmitter};

/// Invoked on every device-status change, on the task that processed the
/// triggering event. Must not block; it may call back into the session.
pub type StatusCallback = Box<dyn Fn(DeviceStatus) + Send + Sync>;

/// A handle to one device's session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    peripheral: Arc<dyn Peripheral>,
    profile: DeviceProfile,
    product_model: ProductModel,
    app_key: Arc<AppKey>,
    state: Mutex<SessionState>,
    /// Serializes whole frames on the TX characteristic.
    tx_lock: AsyncMutex<()>,
    login_tx: watch::Sender<bool>,
    status_callback: Mutex<Option<StatusCallback>>,
}

struct SessionState {
    advertisement: Option<Advertisement>,
    device_uuid: Option<Uuid>,
    registered: bool,
    rssi: i16,
    device_status: DeviceStatus,
    key: DeviceKey,
    sesame_token: Option<[u8; 4]>,
    cipher: Option<SessionCipher>,
    rx: Receiver,
    link: Option<Arc<dyn PeripheralLink>>,
    tx_characteristic: Option<Uuid>,
    mech_status: Option<MechStatus>,
    mech_setting: Option<MechSetting>,
    intention: Intention,
}

impl SessionState {
    fn new() -> Self {
        SessionState {
            advertisement: None,
            device_uuid: None,
            registered: false,
            rssi: -100,
            device_status: DeviceStatus::NoBleSignal,
            key: DeviceKey::new(),
            sesame_token: None,
            cipher: None,
            rx: Receiver::new(),
            link: None,
            tx_characteristic: None,
            mech_status: None,
            mech_setting: None,
            intention: Intention::Idle,
        }
    }
}

/// Record a status transition; the new value is returned for emission once
/// the state lock is released.
fn set_status(state: &mut SessionState, status: DeviceStatus) -> Option<DeviceStatus> {
    if state.device_status == status {
        None
    } else {
        state.device_status = status;
        Some(status)
    }
}

impl DeviceSession {
    /// Build a session for a scanned peripheral. Fails for product models
    /// without a lockable mechanism and for unregistered devices.
    pub fn new(
        peripheral: Arc<dyn Peripheral>,
        advertisement: Advertisement,
        app_key: Arc<AppKey>,
    ) -> Result<Self> {
        let product_model = advertisement.product_model();
        let profile = product_model.profile().ok_or_else(|| {
            Error::UnsupportedDevice(format!(
                "{} has no lockable mechanism",
                product_model.model_name()
            ))
        })?;

        let (login_tx, _) = watch::channel(false);
        let session = DeviceSession {
            inner: Arc::new(SessionInner {
                peripheral,
                profile,
                product_model,
                app_key,
                state: Mutex::new(SessionState::new()),
                tx_lock: AsyncMutex::new(()),
                login_tx,
                status_callback: Mutex::new(None),
            }),
        };
        session.set_advertisement(Some(advertisement))?;
        Ok(session)
    }

    pub fn product_model(&self) -> ProductModel {
        self.inner.product_model
    }

    pub fn device_uuid(&self) -> Option<Uuid> {
        self.inner.state().device_uuid
    }

    pub fn rssi(&self) -> i16 {
        self.inner.state().rssi
    }

    pub fn is_registered(&self) -> bool {
        self.inner.state().registered
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.inner.state().device_status
    }

    pub fn mech_status(&self) -> Option<MechStatus> {
        self.inner.state().mech_status
    }

    pub fn mech_setting(&self) -> Option<MechSetting> {
        self.inner.state().mech_setting
    }

    pub fn intention(&self) -> Intention {
        self.inner.state().intention
    }

    /// The token the device published at the start of the handshake.
    pub fn sesame_token(&self) -> Option<[u8; 4]> {
        self.inner.state().sesame_token
    }

    /// A snapshot of the registered key material.
    pub fn key(&self) -> DeviceKey {
        self.inner.state().key.clone()
    }

    pub fn set_key(&self, key: DeviceKey) {
        self.inner.state().key = key;
    }

    /// Register the device secret key, hex-encoded.
    pub fn set_secret_key(&self, key: &str) -> Result<()> {
        self.inner.state().key.set_secret_key_hex(key)
    }

    /// Register the device long-term public key, hex-encoded.
    pub fn set_device_public_key(&self, key: &str) -> Result<()> {
        self.inner.state().key.set_device_public_key_hex(key)
    }

    pub fn set_status_callback(&self, callback: impl Fn(DeviceStatus) + Send + Sync + 'static) {
        *self.inner.callback_slot() = Some(Box::new(callback));
    }

    pub fn clear_status_callback(&self) {
        *self.inner.callback_slot() = None;
    }

    /// Refresh identity and signal strength from a newer advertisement, or
    /// reset the session on signal loss (`None`).
    pub fn set_advertisement(&self, advertisement: Option<Advertisement>) -> Result<()> {
        let inner = &self.inner;
        let mut events = Vec::new();
        {
            let mut state = inner.state();
            match advertisement {
                None => {
                    tracing::debug!("advertisement reset");
                    state.advertisement = None;
                    state.rssi = -100;
                    events.extend(set_status(&mut state, DeviceStatus::NoBleSignal));
                }
                Some(advertisement) => {
                    if !advertisement.is_registered() {
                        return Err(Error::InitialConfigNeeded);
                    }
                    if advertisement.product_model() != inner.product_model {
                        return Err(Error::InvalidArgument(format!(
                            "advertisement is for a {}, session is for a {}",
                            advertisement.product_model().model_name(),
                            inner.product_model.model_name()
                        )));
                    }
                    state.rssi = advertisement.rssi();
                    state.device_uuid = Some(advertisement.device_uuid());
                    state.registered = true;
                    if state.device_status == DeviceStatus::NoBleSignal {
                        events.extend(set_status(&mut state, DeviceStatus::ReceivedBle));
                    }
                    state.advertisement = Some(advertisement);
                }
            }
        }
        inner.emit(events);
        Ok(())
    }

    /// Open the peripheral, discover the vendor service, and start listening.
    /// The handshake itself is driven by the device's `initial` publish.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let events = {
            let mut state = inner.state();
            if state.advertisement.is_none() {
                return Err(Error::Transport(anyhow::anyhow!(
                    "no BLE advertisement received from the device"
                )));
            }
            set_status(&mut state, DeviceStatus::BleConnecting)
        };
        inner.emit(events);

        let link = inner.peripheral.connect().await.map_err(Error::Transport)?;

        let weak = Arc::downgrade(inner);
        link.set_disconnect_handler(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_disconnect();
            }
        }));

        let events = set_status(&mut inner.state(), DeviceStatus::WaitingGatt);
        inner.emit(events);

        let services = link.discover_services().await.map_err(Error::Transport)?;
        let service = services
            .iter()
            .find(|service| service.uuid == SERVICE_UUID)
            .ok_or_else(|| Error::Protocol("vendor service not offered by peripheral".into()))?;
        if !service.has_characteristic(TX_UUID) || !service.has_characteristic(RX_UUID) {
            return Err(Error::Protocol(
                "RX/TX characteristics not found in vendor service".into(),
            ));
        }

        {
            let mut state = inner.state();
            state.link = Some(link.clone());
            state.tx_characteristic = Some(TX_UUID);
            state.rx = Receiver::new();
        }

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        link.subscribe(
            RX_UUID,
            Box::new(move |value| {
                let _ = frames_tx.send(value);
            }),
        )
        .await
        .map_err(Error::Transport)?;

        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_notification(&frame).await;
            }
        });

        tracing::info!(device = ?inner.state().device_uuid, "connected");
        Ok(())
    }

    /// Tear the link down. Failures are logged, not returned: the session
    /// ends up in `NoBleSignal` either way.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        tracing::info!(device = ?inner.state().device_uuid, "disconnecting");
        let (link, events) = {
            let mut state = inner.state();
            state.cipher = None;
            state.sesame_token = None;
            state.tx_characteristic = None;
            let events = set_status(&mut state, DeviceStatus::NoBleSignal);
            (state.link.take(), events)
        };
        inner.emit(events);

        if let Some(link) = link {
            if let Err(e) = link.unsubscribe(RX_UUID).await {
                tracing::warn!("failed to unsubscribe notifications: {e:#}");
            }
            if let Err(e) = link.disconnect().await {
                tracing::warn!("failed to disconnect cleanly: {e:#}");
            }
        }
    }

    /// Resolves once the login handshake has completed. Cancel by dropping
    /// the future (e.g. under `tokio::time::timeout`).
    pub async fn wait_for_login(&self) {
        let mut login = self.inner.login_tx.subscribe();
        // The sender lives as long as the session borrowed here.
        let _ = login.wait_for(|logged_in| *logged_in).await;
    }

    pub async fn lock(&self, history_tag: &str) -> Result<()> {
        self.ensure_logged_in()?;
        tracing::info!(device = ?self.device_uuid(), history_tag, "lock");
        self.send_operation(ItemCode::Lock, history_tag).await
    }

    pub async fn unlock(&self, history_tag: &str) -> Result<()> {
        self.ensure_logged_in()?;
        tracing::info!(device = ?self.device_uuid(), history_tag, "unlock");
        self.send_operation(ItemCode::Unlock, history_tag).await
    }

    /// Run the bot's configured click sequence. Not available on locks.
    pub async fn click(&self, history_tag: &str) -> Result<()> {
        if !self.inner.profile.supports_click() {
            return Err(Error::UnsupportedDevice(format!(
                "{} does not support click",
                self.inner.product_model.model_name()
            )));
        }
        self.ensure_logged_in()?;
        tracing::info!(device = ?self.device_uuid(), history_tag, "click");
        self.send_operation(ItemCode::Click, history_tag).await
    }

    /// Lock when unlocked, unlock when locked. Fails with
    /// [`Error::StatusUnknown`] when the mechanism is in neither range.
    pub async fn toggle(&self, history_tag: &str) -> Result<()> {
        self.ensure_logged_in()?;
        let status = self
            .inner
            .state()
            .mech_status
            .ok_or(Error::StatusUnknown)?;
        if status.is_in_lock_range() {
            self.unlock(history_tag).await
        } else if status.is_in_unlock_range() {
            self.lock(history_tag).await
        } else {
            Err(Error::StatusUnknown)
        }
    }

    fn ensure_logged_in(&self) -> Result<()> {
        if self.inner.state().device_status.is_logged_in() {
            Ok(())
        } else {
            Err(Error::NotLoggedIn)
        }
    }

    async fn send_operation(&self, item: ItemCode, tag: &str) -> Result<()> {
        let command = Command::new(OpCode::Async, item, history_tag(tag).to_vec());
        self.inner
            .send_command(command, SegmentKind::Ciphertext)
            .await
    }
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callback_slot(&self) -> MutexGuard<'_, Option<StatusCallback>> {
        self.status_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver status transitions collected under the state lock: update the
    /// login event, then run the observer.
    fn emit(&self, events: impl IntoIterator<Item = DeviceStatus>) {
        for status in events {
            tracing::debug!(?status, "device status changed");
            self.login_tx.send_replace(status.is_logged_in());
            if let Some(callback) = self.callback_slot().as_ref() {
                callback(status);
            }
        }
    }

    fn handle_disconnect(&self) {
        tracing::debug!("peripheral link lost");
        let events = {
            let mut state = self.state();
            state.advertisement = None;
            state.rssi = -100;
            state.link = None;
            state.tx_characteristic = None;
            state.cipher = None;
            state.sesame_token = None;
            set_status(&mut state, DeviceStatus::NoBleSignal)
        };
        self.emit(events);
    }

    /// Encrypt (if requested), fragment, and write one command frame.
    async fn send_command(&self, command: Command, kind: SegmentKind) -> Result<()> {
        let _sending = self.tx_lock.lock().await;

        let (link, characteristic, chunks) = {
            let mut state = self.state();
            let link = state
                .link
                .clone()
                .ok_or_else(|| Error::Transport(anyhow::anyhow!("not connected")))?;
            let characteristic = state
                .tx_characteristic
                .ok_or_else(|| Error::Transport(anyhow::anyhow!("TX characteristic unknown")))?;

            let frame = match kind {
                SegmentKind::Plaintext => command.to_bytes(),
                SegmentKind::Ciphertext => state
                    .cipher
                    .as_mut()
                    .ok_or(Error::NotLoggedIn)?
                    .encrypt(&command.to_bytes())?,
            };

            let mut transmitter = Transmitter::new(kind, &frame);
            let mut chunks = Vec::new();
            while let Some(chunk) = transmitter.next_chunk() {
                chunks.push(chunk);
            }
            (link, characteristic, chunks)
        };

        tracing::debug!(op = ?command.op, item = ?command.item, ?kind, "sending command");
        for chunk in &chunks {
            link.write(characteristic, chunk, false)
                .await
                .map_err(Error::Transport)?;
        }
        Ok(())
    }

    /// One RX notification: reassemble, decrypt, dispatch. Codec and cipher
    /// failures are logged and the frame dropped; the session stays up.
    async fn handle_notification(&self, raw: &[u8]) {
        let notification = {
            let mut state = self.state();
            let (kind, frame) = match state.rx.feed(raw) {
                Ok(Some(complete)) => complete,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("dropping malformed fragment: {e}");
                    return;
                }
            };

            let plain = match kind {
                SegmentKind::Plaintext => frame,
                SegmentKind::Ciphertext => {
                    let Some(cipher) = state.cipher.as_mut() else {
                        tracing::warn!("ciphertext frame before handshake completion; dropping");
                        return;
                    };
                    match cipher.decrypt(&frame) {
                        Ok(plain) => plain,
                        Err(e) => {
                            tracing::warn!("dropping frame: {e}");
                            return;
                        }
                    }
                }
            };

            match Notification::parse(&plain) {
                Ok(notification) => notification,
                Err(e) => {
                    tracing::warn!("dropping undecodable frame: {e}");
                    return;
                }
            }
        };

        match notification {
            Notification::Publish(publish) => self.handle_publish(publish).await,
            Notification::Response(response) => self.handle_response(response),
        }
    }

    async fn handle_publish(&self, publish: Publish) {
        tracing::debug!(item = ?publish.item, "publish received");
        match publish.item {
            ItemCode::Initial => {
                let Ok(token) = <[u8; 4]>::try_from(publish.body.as_slice()) else {
                    tracing::warn!("initial publish with a malformed token; dropping");
                    return;
                };
                let registered = {
                    let mut state = self.state();
                    state.sesame_token = Some(token);
                    state.registered
                };
                if !registered {
                    tracing::warn!("{}", Error::InitialConfigNeeded);
                    let events = set_status(&mut self.state(), DeviceStatus::ReadyToRegister);
                    self.emit(events);
                    return;
                }
                if let Err(e) = self.login().await {
                    tracing::warn!("login failed: {e}");
                }
            }
            ItemCode::MechStatus => {
                let events = {
                    let mut state = self.state();
                    let status = match self.profile.parse_status(&publish.body) {
                        Ok(status) => status,
                        Err(e) => {
                            tracing::warn!("dropping mechanical status: {e}");
                            return;
                        }
                    };
                    self.apply_mech_status(&mut state, status);
                    let next = if status.is_in_lock_range() {
                        DeviceStatus::Locked
                    } else {
                        DeviceStatus::Unlocked
                    };
                    set_status(&mut state, next)
                };
                self.emit(events);
            }
            ItemCode::MechSetting => {
                let events = {
                    let mut state = self.state();
                    let setting = match self.profile.parse_setting(&publish.body) {
                        Ok(setting) => setting,
                        Err(e) => {
                            tracing::warn!("dropping mechanical setting: {e}");
                            return;
                        }
                    };
                    tracing::debug!(?setting, "mechanical setting updated");
                    state.mech_setting = Some(setting);
                    match (self.profile, state.mech_status) {
                        (DeviceProfile::Lock, Some(status)) => {
                            let next = if status.is_in_lock_range() {
                                DeviceStatus::Locked
                            } else {
                                DeviceStatus::Unlocked
                            };
                            set_status(&mut state, next)
                        }
                        _ => None,
                    }
                };
                self.emit(events);
            }
            other => {
                tracing::debug!(item = ?other, "unhandled publish");
            }
        }
    }

    fn handle_response(&self, response: Response) {
        tracing::debug!(
            item = ?response.item,
            op = ?response.op,
            result = ?response.result,
            "response received"
        );
        if response.item != ItemCode::Login {
            return;
        }
        if response.result != ResultCode::Success {
            tracing::warn!(result = ?response.result, "login rejected by device");
            return;
        }

        let events = {
            let mut state = self.state();
            let parsed = match self.profile.parse_login_response(&response.body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("dropping login response: {e}");
                    return;
                }
            };
            state.mech_setting = Some(parsed.mech_setting);
            self.apply_mech_status(&mut state, parsed.mech_status);
            set_status(&mut state, self.profile.login_status(&parsed))
        };
        self.emit(events);
    }

    fn apply_mech_status(&self, state: &mut SessionState, status: MechStatus) {
        tracing::debug!(?status, "mechanical status updated");
        state.intention =
            self.profile
                .derive_intention(&status, state.mech_setting.as_ref(), state.intention);
        state.mech_status = Some(status);
    }

    /// Derive the session cipher from the exchanged tokens, then present the
    /// login payload. Sent in plaintext: it is the last cleartext frame.
    async fn login(&self) -> Result<()> {
        let (command, events) = {
            let mut state = self.state();
            let secret_key = state
                .key
                .secret_key()
                .ok_or_else(|| Error::InvalidArgument("secret key not set".into()))?;
            let device_public_key = state
                .key
                .device_public_key()
                .ok_or_else(|| Error::InvalidArgument("device public key not set".into()))?;
            let sesame_token = state
                .sesame_token
                .ok_or_else(|| Error::Protocol("login attempted before the initial token".into()))?;

            let mut tokens = [0u8; 8];
            tokens[..4].copy_from_slice(&self.app_key.app_token());
            tokens[4..].copy_from_slice(&sesame_token);

            let local_public_key = self.app_key.public_key();
            let shared_secret = self.app_key.ecdh(&device_public_key)?;
            let session_key = crypto::derive_session_key(&shared_secret, &tokens);
            let tag = crypto::login_response_tag(
                &secret_key,
                &state.key.key_index(),
                &local_public_key,
                &tokens,
            );

            state.cipher = Some(SessionCipher::new(session_key, tokens));

            let mut body = Vec::with_capacity(74);
            body.extend_from_slice(&state.key.key_index());
            body.extend_from_slice(&local_public_key);
            body.extend_from_slice(&self.app_key.app_token());
            body.extend_from_slice(&tag);

            let events = set_status(&mut state, DeviceStatus::BleLogining);
            (Command::new(OpCode::Sync, ItemCode::Login, body), events)
        };
        tracing::info!(device = ?self.state().device_uuid, "logging in");
        self.emit(events);
        self.send_command(command, SegmentKind::Plaintext).await
    }
}
