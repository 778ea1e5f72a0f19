//! End-to-end exercises of the session core over a mocked BLE stack, playing
//! the device side of the handshake byte-for-byte.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes::Aes128;
use async_trait::async_trait;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4};
use ccm::Ccm;

use crate::ble::{
    BleCentral, DisconnectHandler, GattService, NotificationHandler, Peripheral, PeripheralInfo,
    PeripheralLink, MANUFACTURER_ID, RX_UUID, SERVICE_UUID, TX_UUID,
};
use crate::crypto::{self, AppKey};
use crate::device::DeviceStatus;
use crate::error::Error;
use crate::manager::BleManager;
use crate::protocol::{history_tag, ItemCode};
use crate::session::DeviceSession;
use crate::transport::{Receiver, SegmentKind, Transmitter};
use crate::Intention;

const APP_SECRET_HEX: &str = "abb8309e288941a3d0e86124f581390b90805635e27b32a2e3f094e900577b56";
const APP_TOKEN: [u8; 4] = [0x11, 0x22, 0x33, 0x44];
const DEVICE_SECRET_HEX: &str = "34344f4734344b3534344f4934344f47";
const DEVICE_PUBLIC_HEX: &str = "d422b28bafdc17a9af2a7e778aeb9f9b962da8044d16f0107ad8d2db605b0090\
                                 fded0d7301fff24b3da3fe9126800be1ac046aca8144865f2e245fad32ecce5f";
const SESAME_TOKEN: [u8; 4] = [0xff; 4];
const LOGIN_BODY_HEX: &str = "f545d36001008001e30105034d0179026f029b035e03008016020002";

struct MockLink {
    writes: Mutex<Vec<Vec<u8>>>,
    notify: Mutex<Option<NotificationHandler>>,
    disconnect: Mutex<Option<DisconnectHandler>>,
}

impl MockLink {
    fn new() -> Arc<Self> {
        Arc::new(MockLink {
            writes: Mutex::new(Vec::new()),
            notify: Mutex::new(None),
            disconnect: Mutex::new(None),
        })
    }

    /// Fragment a device → host frame and push it through the notification
    /// handler, as the host stack would.
    fn notify_frame(&self, kind: SegmentKind, frame: &[u8]) {
        let guard = self.notify.lock().unwrap();
        let handler = guard.as_ref().expect("RX notifications not subscribed");
        let mut transmitter = Transmitter::new(kind, frame);
        while let Some(chunk) = transmitter.next_chunk() {
            handler(chunk);
        }
    }

    fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    /// Drain recorded chunks and reassemble them into one complete frame.
    fn take_frame(&self) -> (SegmentKind, Vec<u8>) {
        let chunks = std::mem::take(&mut *self.writes.lock().unwrap());
        let mut receiver = Receiver::new();
        let mut complete = None;
        for chunk in &chunks {
            complete = receiver.feed(chunk).unwrap();
        }
        complete.expect("written chunks did not form a complete frame")
    }
}

#[async_trait]
impl PeripheralLink for MockLink {
    async fn discover_services(&self) -> anyhow::Result<Vec<GattService>> {
        Ok(vec![GattService {
            uuid: SERVICE_UUID,
            characteristics: vec![TX_UUID, RX_UUID],
        }])
    }

    async fn write(
        &self,
        characteristic: uuid::Uuid,
        value: &[u8],
        with_response: bool,
    ) -> anyhow::Result<()> {
        assert_eq!(characteristic, TX_UUID);
        assert!(!with_response);
        self.writes.lock().unwrap().push(value.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: uuid::Uuid,
        handler: NotificationHandler,
    ) -> anyhow::Result<()> {
        assert_eq!(characteristic, RX_UUID);
        *self.notify.lock().unwrap() = Some(handler);
        Ok(())
    }

    async fn unsubscribe(&self, _characteristic: uuid::Uuid) -> anyhow::Result<()> {
        *self.notify.lock().unwrap() = None;
        Ok(())
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *self.disconnect.lock().unwrap() = Some(handler);
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if let Some(handler) = self.disconnect.lock().unwrap().as_ref() {
            handler();
        }
        Ok(())
    }
}

struct MockPeripheral {
    info: PeripheralInfo,
    link: Arc<MockLink>,
}

#[async_trait]
impl Peripheral for MockPeripheral {
    fn info(&self) -> PeripheralInfo {
        self.info.clone()
    }

    async fn connect(&self) -> anyhow::Result<Arc<dyn PeripheralLink>> {
        Ok(self.link.clone())
    }
}

struct MockCentral {
    peripheral: Arc<MockPeripheral>,
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn scan(&self, _duration: Duration) -> anyhow::Result<Vec<Arc<dyn Peripheral>>> {
        Ok(vec![self.peripheral.clone()])
    }
}

type TestCcm = Ccm<Aes128, U4, U13>;

/// The device's half of the session cipher: it encrypts with the plain
/// counter and decrypts with the direction-tagged one.
struct DeviceCipher {
    cipher: TestCcm,
    token: [u8; 8],
    tx_counter: u64,
    rx_counter: u64,
}

impl DeviceCipher {
    fn new(key: [u8; 16], token: [u8; 8]) -> Self {
        DeviceCipher {
            cipher: TestCcm::new((&key).into()),
            token,
            tx_counter: 0,
            rx_counter: 0,
        }
    }

    fn nonce(counter: u64, token: &[u8; 8]) -> [u8; 13] {
        let mut nonce = [0u8; 13];
        nonce[..5].copy_from_slice(&counter.to_le_bytes()[..5]);
        nonce[5..].copy_from_slice(token);
        nonce
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = Self::nonce(self.tx_counter & ((1 << 39) - 1), &self.token);
        self.tx_counter += 1;
        self.cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[0],
                },
            )
            .unwrap()
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        let nonce = Self::nonce(self.rx_counter | (1 << 39), &self.token);
        self.rx_counter += 1;
        self.cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[0],
                },
            )
            .unwrap()
    }
}

fn fixed_app_key() -> Arc<AppKey> {
    let secret = p256::SecretKey::from_slice(&hex::decode(APP_SECRET_HEX).unwrap()).unwrap();
    Arc::new(AppKey::from_secret(secret, APP_TOKEN))
}

fn sesame_peripheral_info(product_type: u8) -> PeripheralInfo {
    PeripheralInfo {
        bt_address: "AA:BB:CC:11:22:33".into(),
        local_name: Some("QpGK0YFUSv+9H/DN6IqN4Q".into()),
        rssi: -58,
        service_uuids: vec![SERVICE_UUID],
        manufacturer_data: HashMap::from([(MANUFACTURER_ID, vec![product_type, 0, 1])]),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn scan_single_session(link: Arc<MockLink>, product_type: u8) -> DeviceSession {
    let central = MockCentral {
        peripheral: Arc::new(MockPeripheral {
            info: sesame_peripheral_info(product_type),
            link,
        }),
    };
    let manager = BleManager::with_app_key(Arc::new(central), fixed_app_key());
    let mut sessions = manager.scan(Duration::from_secs(1)).await;
    assert_eq!(sessions.len(), 1);
    sessions.remove("AA:BB:CC:11:22:33").unwrap()
}

/// Drive the handshake up to the logged-in state, returning the device-side
/// cipher aligned with the session's.
async fn complete_login(
    link: &MockLink,
    session: &DeviceSession,
    login_body_hex: &str,
) -> DeviceCipher {
    let mut initial = vec![0x08, 0x0e];
    initial.extend_from_slice(&SESAME_TOKEN);
    link.notify_frame(SegmentKind::Plaintext, &initial);
    wait_until(|| link.write_count() == 4).await;
    let (kind, frame) = link.take_frame();
    assert_eq!(kind, SegmentKind::Plaintext);
    assert_eq!(frame.len(), 76);

    let app_key = fixed_app_key();
    let mut tokens = [0u8; 8];
    tokens[..4].copy_from_slice(&APP_TOKEN);
    tokens[4..].copy_from_slice(&SESAME_TOKEN);
    let device_public: [u8; 64] = hex::decode(DEVICE_PUBLIC_HEX).unwrap().try_into().unwrap();
    let shared = app_key.ecdh(&device_public).unwrap();
    let mut device = DeviceCipher::new(crypto::derive_session_key(&shared, &tokens), tokens);

    let mut login_ok = vec![0x07, 0x02, 0x05, 0x00];
    login_ok.extend_from_slice(&hex::decode(login_body_hex).unwrap());
    let ciphertext = device.encrypt(&login_ok);
    link.notify_frame(SegmentKind::Ciphertext, &ciphertext);

    tokio::time::timeout(Duration::from_secs(2), session.wait_for_login())
        .await
        .expect("login did not complete");
    device
}

#[test_log::test(tokio::test)]
async fn full_handshake_and_operation_round_trip() {
    let link = MockLink::new();
    let session = scan_single_session(link.clone(), 0).await;

    session.set_secret_key(DEVICE_SECRET_HEX).unwrap();
    session.set_device_public_key(DEVICE_PUBLIC_HEX).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        session.set_status_callback(move |status| events.lock().unwrap().push(status));
    }

    session.connect().await.unwrap();
    assert_eq!(session.device_status(), DeviceStatus::WaitingGatt);

    // Device opens the handshake by publishing its 4-byte token.
    let mut initial = vec![0x08, 0x0e];
    initial.extend_from_slice(&SESAME_TOKEN);
    link.notify_frame(SegmentKind::Plaintext, &initial);

    // The login command is one 76-byte plaintext frame over four chunks.
    wait_until(|| link.write_count() == 4).await;
    let (kind, frame) = link.take_frame();
    assert_eq!(kind, SegmentKind::Plaintext);
    assert_eq!(frame.len(), 76);
    assert_eq!(frame[0], 0x05, "login must use the sync op code");
    assert_eq!(frame[1], 0x02, "login item code");
    assert_eq!(session.device_status(), DeviceStatus::BleLogining);

    let app_key = fixed_app_key();
    let mut tokens = [0u8; 8];
    tokens[..4].copy_from_slice(&APP_TOKEN);
    tokens[4..].copy_from_slice(&SESAME_TOKEN);

    let body = &frame[2..];
    assert_eq!(&body[..2], &[0x00, 0x00], "key index is pinned to 0x0000");
    assert_eq!(&body[2..66], &app_key.public_key());
    assert_eq!(&body[66..70], &APP_TOKEN);
    let device_secret: [u8; 16] = hex::decode(DEVICE_SECRET_HEX).unwrap().try_into().unwrap();
    let expected_tag = crypto::login_response_tag(
        &device_secret,
        &[0x00, 0x00],
        &app_key.public_key(),
        &tokens,
    );
    assert_eq!(&body[70..74], &expected_tag);

    // Derive the session key exactly as the device would and answer the
    // login over the encrypted channel.
    let device_public: [u8; 64] = hex::decode(DEVICE_PUBLIC_HEX).unwrap().try_into().unwrap();
    let shared = app_key.ecdh(&device_public).unwrap();
    let session_key = crypto::derive_session_key(&shared, &tokens);
    let mut device = DeviceCipher::new(session_key, tokens);

    let mut login_ok = vec![0x07, 0x02, 0x05, 0x00];
    login_ok.extend_from_slice(&hex::decode(LOGIN_BODY_HEX).unwrap());
    let ciphertext = device.encrypt(&login_ok);
    link.notify_frame(SegmentKind::Ciphertext, &ciphertext);

    tokio::time::timeout(Duration::from_secs(2), session.wait_for_login())
        .await
        .expect("login did not complete");
    assert_eq!(session.device_status(), DeviceStatus::Locked);
    assert_eq!(session.intention(), Intention::Idle);
    let mech_status = session.mech_status().unwrap();
    assert!(mech_status.is_in_lock_range());
    assert!(session
        .mech_setting()
        .unwrap()
        .as_lock()
        .unwrap()
        .is_configured());

    // Locking goes out encrypted under the first host nonce.
    session.lock("unit-test").await.unwrap();
    wait_until(|| link.write_count() == 2).await;
    let (kind, frame) = link.take_frame();
    assert_eq!(kind, SegmentKind::Ciphertext);
    let plain = device.decrypt(&frame);
    assert_eq!(plain[0], 0x06, "operations use the async op code");
    assert_eq!(plain[1], ItemCode::Lock as u8);
    assert_eq!(&plain[2..], &history_tag("unit-test"));

    // A corrupted frame is dropped and both counters stay aligned.
    let mut corrupted = device.encrypt(&[0x08, 0x51, 0, 0, 0, 0, 0, 0, 0, 0]);
    *corrupted.last_mut().unwrap() ^= 0xff;
    link.notify_frame(SegmentKind::Ciphertext, &corrupted);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.device_status(), DeviceStatus::Locked);

    // The device reports it is moving to the unlock position.
    let mut publish = vec![0x08, 0x51];
    publish.extend_from_slice(&hex::decode("5c030503e3020004").unwrap());
    let ciphertext = device.encrypt(&publish);
    link.notify_frame(SegmentKind::Ciphertext, &ciphertext);
    wait_until(|| session.device_status() == DeviceStatus::Unlocked).await;
    assert_eq!(session.intention(), Intention::Unlocking);

    // Toggling an unlocked device locks it.
    session.toggle("unit-test").await.unwrap();
    wait_until(|| link.write_count() == 2).await;
    let (_, frame) = link.take_frame();
    let plain = device.decrypt(&frame);
    assert_eq!(plain[1], ItemCode::Lock as u8);

    session.disconnect().await;
    assert_eq!(session.device_status(), DeviceStatus::NoBleSignal);
    assert_eq!(session.rssi(), -100);
    assert!(matches!(
        session.connect().await,
        Err(Error::Transport(_))
    ));

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            DeviceStatus::BleConnecting,
            DeviceStatus::WaitingGatt,
            DeviceStatus::BleLogining,
            DeviceStatus::Locked,
            DeviceStatus::Unlocked,
            DeviceStatus::NoBleSignal,
        ]
    );
}

#[test_log::test(tokio::test)]
async fn bot_login_click_and_motor_reports() {
    let link = MockLink::new();
    let session = scan_single_session(link.clone(), 2).await;
    session.set_secret_key(DEVICE_SECRET_HEX).unwrap();
    session.set_device_public_key(DEVICE_PUBLIC_HEX).unwrap();
    session.connect().await.unwrap();

    // Bot login body: time, reserved, 12-byte setting (normal direction,
    // click mode), 8-byte status (motor holding, in lock range).
    let mut device = complete_login(
        &link,
        &session,
        "f545d36001008001000a0b0c0d0e000000000000e803000002000002",
    )
    .await;

    assert_eq!(session.device_status(), DeviceStatus::Locked);
    assert_eq!(session.intention(), Intention::Holding);
    let setting = session.mech_setting().unwrap();
    let bot_setting = setting.as_bot().unwrap();
    assert_eq!(bot_setting.lock_sec(), 10);
    assert_eq!(bot_setting.click_unlock_sec(), 14);

    session.click("bot-test").await.unwrap();
    wait_until(|| link.write_count() == 2).await;
    let (kind, frame) = link.take_frame();
    assert_eq!(kind, SegmentKind::Ciphertext);
    let plain = device.decrypt(&frame);
    assert_eq!(plain[0], 0x06);
    assert_eq!(plain[1], ItemCode::Click as u8);
    assert_eq!(plain[2..], history_tag("bot-test")[..]);

    // Motor starts rotating backwards: the bot is unlocking.
    let mut publish = vec![0x08, 0x51];
    publish.extend_from_slice(&hex::decode("e803000003000004").unwrap());
    let ciphertext = device.encrypt(&publish);
    link.notify_frame(SegmentKind::Ciphertext, &ciphertext);
    wait_until(|| session.device_status() == DeviceStatus::Unlocked).await;
    assert_eq!(session.intention(), Intention::Unlocking);
}

#[test_log::test(tokio::test)]
async fn link_loss_resets_the_session() {
    let link = MockLink::new();
    let session = scan_single_session(link.clone(), 0).await;
    session.connect().await.unwrap();
    assert_eq!(session.device_status(), DeviceStatus::WaitingGatt);

    // The host stack reports the peer went away.
    let handler = link.disconnect.lock().unwrap().take().unwrap();
    handler();

    assert_eq!(session.device_status(), DeviceStatus::NoBleSignal);
    assert_eq!(session.rssi(), -100);
    // Reconnecting requires a fresh advertisement.
    assert!(matches!(session.connect().await, Err(Error::Transport(_))));
    session
        .set_advertisement(Some(
            crate::Advertisement::parse(&sesame_peripheral_info(0)).unwrap(),
        ))
        .unwrap();
    assert_eq!(session.device_status(), DeviceStatus::ReceivedBle);
    session.connect().await.unwrap();
    assert_eq!(session.device_status(), DeviceStatus::WaitingGatt);
}
