//! Handshake state machine and keep-alive loop.
//!
//! A pairing moves forward through [`PairingState`] one exchange at a time.
//! Any failed step tears the socket down and leaves the pairing closed; the
//! session key of that attempt is dropped with it and never reused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use super::challenge::EncryptionChallenge;
use super::crypto::{self, LocalKeys, DEFAULT_KEY_BITS};
use super::messages::{encode_request, Feedback, RequestCode, SecureResult};
use crate::frame::put_prefixed;
use crate::transport::{QTransport, TransportConfig};
use crate::{QConnError, Result};

pub const DEFAULT_DOOR_PORT: u16 = 4455;
pub const DEFAULT_RESPONSE_CAPACITY: usize = 512;

/// Consecutive unanswered keep-alives that end the session
const MAX_MISSED_KEEP_ALIVES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub host: String,
    pub door_port: u16,
    pub transport: TransportConfig,
    pub response_capacity: usize,
    pub key_bits: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            host: "169.254.0.1".into(),
            door_port: DEFAULT_DOOR_PORT,
            transport: TransportConfig::default(),
            response_capacity: DEFAULT_RESPONSE_CAPACITY,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    HelloSent,
    ChallengeSent,
    ChallengeReceived,
    ChallengeAck,
    AuthChallengeRequested,
    Authenticating,
    KeySending,
    ServicesStarting,
    Authenticated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingEvent {
    Authenticated,
    NotAuthenticated,
}

struct Shared {
    transport: Mutex<Option<QTransport>>,
    authenticated: AtomicBool,
    state: StdMutex<PairingState>,
    events: broadcast::Sender<PairingEvent>,
    capacity: usize,
}

impl Shared {
    fn set_state(&self, state: PairingState) {
        log::debug!("Pairing state -> {:?}", state);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
        self.set_state(PairingState::Authenticated);
        let _ = self.events.send(PairingEvent::Authenticated);
    }

    /// Flip to not-authenticated, notifying only on an actual change.
    fn mark_lost(&self) {
        if self.authenticated.swap(false, Ordering::SeqCst) {
            log::warn!("Target connection lost");
            let _ = self.events.send(PairingEvent::NotAuthenticated);
        }
    }

    /// Send one frame and read its verified reply.
    async fn exchange(&self, code: RequestCode, payload: &[u8]) -> Result<SecureResult> {
        let request = encode_request(code, payload)?;
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(QConnError::NotAuthenticated)?;

        log::debug!("SEND[{:?}]: {} bytes", code, request.len());
        transport.send(&request).await?;
        let reply = transport.receive_packet(self.capacity).await?;
        let result = SecureResult::decode(&reply)?;
        log::debug!("RECV[{:?}]: {:?}", code, result);
        result.verify()
    }

    async fn expect_ok(&self, code: RequestCode, payload: &[u8]) -> Result<()> {
        match self.exchange(code, payload).await? {
            SecureResult::Feedback(Feedback::Ok) => Ok(()),
            other => Err(unexpected(code, &other)),
        }
    }

    async fn teardown(&self) {
        if let Some(mut transport) = self.transport.lock().await.take() {
            transport.close().await;
        }
    }
}

fn unexpected(code: RequestCode, result: &SecureResult) -> QConnError {
    QConnError::format(format!("unexpected reply to {:?}: {:?}", code, result))
}

/// Cryptographic pairing with the target's door service
pub struct SecurePairing {
    config: PairingConfig,
    keys: LocalKeys,
    shared: Arc<Shared>,
    keep_alive: StdMutex<Option<JoinHandle<()>>>,
}

impl SecurePairing {
    /// Create a pairing with a freshly generated RSA key pair.
    pub fn new(config: PairingConfig) -> Result<Self> {
        let keys = LocalKeys::generate(config.key_bits)?;
        Ok(Self::with_keys(config, keys))
    }

    pub fn with_keys(config: PairingConfig, keys: LocalKeys) -> Self {
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            transport: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            state: StdMutex::new(PairingState::Idle),
            events,
            capacity: config.response_capacity,
        });

        Self {
            config,
            keys,
            shared,
            keep_alive: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    pub fn state(&self) -> PairingState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.shared.events.subscribe()
    }

    /// Run the whole handshake; on failure the pairing ends up closed.
    pub async fn connect(&self, password: &str, ssh_public_key: &str) -> Result<()> {
        self.stop_keep_alive();
        self.shared.teardown().await;
        self.shared.authenticated.store(false, Ordering::SeqCst);

        match self.handshake(password, ssh_public_key).await {
            Ok(()) => {
                log::info!("Paired with {}:{}", self.config.host, self.config.door_port);
                self.shared.mark_authenticated();
                Ok(())
            }
            Err(e) => {
                log::error!("Pairing with {} failed: {}", self.config.host, e);
                self.shared.teardown().await;
                self.shared.set_state(PairingState::Closed);
                Err(e)
            }
        }
    }

    async fn handshake(&self, password: &str, ssh_public_key: &str) -> Result<()> {
        let shared = &self.shared;
        shared.set_state(PairingState::Idle);

        let transport =
            QTransport::connect(&self.config.host, self.config.door_port, self.config.transport.clone()).await?;
        *shared.transport.lock().await = Some(transport);

        shared.set_state(PairingState::HelloSent);
        shared.expect_ok(RequestCode::Hello, &[]).await?;

        shared.set_state(PairingState::ChallengeSent);
        let mut modulus = Vec::new();
        put_prefixed(&mut modulus, &self.keys.modulus())?;
        let encrypted = match shared.exchange(RequestCode::Challenge, &modulus).await? {
            SecureResult::EncryptedChallenge(data) => data,
            other => return Err(unexpected(RequestCode::Challenge, &other)),
        };

        shared.set_state(PairingState::ChallengeReceived);
        let decrypted = EncryptionChallenge::parse(&encrypted)?.decrypt(&self.keys)?;
        let session_key = crypto::generate_session_key();
        let sealed_key = crypto::seal(&decrypted.transport_key, &session_key)?;

        shared.set_state(PairingState::ChallengeAck);
        let mut answer = Vec::new();
        for part in [decrypted.blob.as_slice(), decrypted.signature.as_slice(), sealed_key.as_slice()] {
            let len = u16::try_from(part.len())
                .map_err(|_| QConnError::format(format!("challenge answer part of {} bytes", part.len())))?;
            answer.extend_from_slice(&len.to_be_bytes());
        }
        answer.extend_from_slice(&decrypted.blob);
        answer.extend_from_slice(&decrypted.signature);
        answer.extend_from_slice(&sealed_key);
        shared.expect_ok(RequestCode::ChallengeResponse, &answer).await?;

        shared.set_state(PairingState::AuthChallengeRequested);
        match shared.exchange(RequestCode::AuthChallengeRequest, &[]).await? {
            SecureResult::AuthChallenge(recipe) => {
                shared.set_state(PairingState::Authenticating);
                let hash = crypto::hash_password(password, &recipe)?;
                let mut payload = Zeroizing::new(Vec::new());
                put_prefixed(&mut payload, hash.as_bytes())?;
                let sealed = crypto::seal(&session_key, &payload)?;
                shared.expect_ok(RequestCode::Authenticate, &sealed).await?;
            }
            SecureResult::Feedback(Feedback::NoPasswordRequired) => {
                log::debug!("Target requires no password");
            }
            other => return Err(unexpected(RequestCode::AuthChallengeRequest, &other)),
        }

        shared.set_state(PairingState::KeySending);
        let sealed = crypto::seal(&session_key, ssh_public_key.trim().as_bytes())?;
        shared.expect_ok(RequestCode::SshPublicKey, &sealed).await?;

        shared.set_state(PairingState::ServicesStarting);
        shared.expect_ok(RequestCode::StartServices, &[]).await?;
        Ok(())
    }

    /// Ping the target every `interval` until it stops answering.
    pub fn keep_alive(&self, interval: Duration) -> Result<()> {
        if !self.is_authenticated() {
            return Err(QConnError::NotAuthenticated);
        }
        self.stop_keep_alive();

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut missed = 0;

            loop {
                ticker.tick().await;

                let request = match encode_request(RequestCode::KeepAlive, &[]) {
                    Ok(request) => request,
                    Err(_) => break,
                };
                let mut guard = shared.transport.lock().await;
                let Some(transport) = guard.as_mut() else {
                    break;
                };

                if let Err(e) = transport.send(&request).await {
                    log::warn!("Keep-alive send failed: {}", e);
                    break;
                }

                let answered = match transport.receive_packet(shared.capacity).await {
                    Ok(reply) => matches!(
                        SecureResult::decode(&reply),
                        Ok(SecureResult::Feedback(Feedback::Ok))
                    ),
                    Err(e) => {
                        log::debug!("Keep-alive not answered: {}", e);
                        false
                    }
                };
                drop(guard);

                if answered {
                    missed = 0;
                } else {
                    missed += 1;
                    log::warn!("Keep-alive missed ({}/{})", missed, MAX_MISSED_KEEP_ALIVES);
                    if missed >= MAX_MISSED_KEEP_ALIVES {
                        break;
                    }
                }
            }

            shared.mark_lost();
        });

        *self.keep_alive.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.keep_alive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    fn stop_keep_alive(&self) {
        if let Some(handle) = self.keep_alive.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Stop the keep-alive, ask the target to close, then drop the socket.
    ///
    /// Always reports not-authenticated, even when already disconnected.
    pub async fn close(&self) {
        self.stop_keep_alive();

        {
            let mut guard = self.shared.transport.lock().await;
            if let Some(transport) = guard.as_mut() {
                if let Ok(request) = encode_request(RequestCode::Close, &[]) {
                    if transport.send(&request).await.is_ok() {
                        let _ = transport.receive_packet(self.shared.capacity).await;
                    }
                }
            }
            if let Some(mut transport) = guard.take() {
                transport.close().await;
            }
        }

        self.shared.authenticated.store(false, Ordering::SeqCst);
        self.shared.set_state(PairingState::Closed);
        let _ = self.shared.events.send(PairingEvent::NotAuthenticated);
    }
}

impl Drop for SecurePairing {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> PairingConfig {
        PairingConfig {
            host: "127.0.0.1".into(),
            door_port: 1,
            transport: TransportConfig {
                connect_timeout_ms: 200,
                ..TransportConfig::default()
            },
            key_bits: 512,
            ..PairingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_failure_closes() {
        let pairing = SecurePairing::new(unreachable_config()).unwrap();
        assert_eq!(pairing.state(), PairingState::Idle);

        let err = pairing.connect("pw", "ssh-rsa AAAA").await.unwrap_err();
        assert!(matches!(err, QConnError::Connection { .. }));
        assert_eq!(pairing.state(), PairingState::Closed);
        assert!(!pairing.is_authenticated());
    }

    #[test]
    fn test_keep_alive_requires_authentication() {
        let pairing = SecurePairing::new(unreachable_config()).unwrap();
        assert!(matches!(
            pairing.keep_alive(Duration::from_millis(10)),
            Err(QConnError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_close_when_disconnected_still_notifies() {
        let pairing = SecurePairing::new(unreachable_config()).unwrap();
        let mut events = pairing.subscribe();

        tokio_test::block_on(pairing.close());
        assert_eq!(events.try_recv().unwrap(), PairingEvent::NotAuthenticated);
        assert_eq!(pairing.state(), PairingState::Closed);
    }
}
