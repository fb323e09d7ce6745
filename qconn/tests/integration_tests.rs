use std::sync::{Arc, Mutex};
use std::time::Duration;

use qconn::secure::challenge::{EncryptionChallenge, PERMISSIONS, SUPPORTED_SIGNATURE_TYPE};
use qconn::secure::crypto::{encrypt_for, hash_password, open, public_key_from_modulus, verify_signature};
use qconn::secure::messages::{decode_request, AuthChallenge, Feedback, RequestCode, SecureResult};
use qconn::{
    Endian, FileHandle, FileService, PairingConfig, PairingEvent, PairingState, QConnChannel, QConnError,
    SecurePairing, Status, TransportConfig,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::TryRecvError;

const PASSWORD: &str = "hunter2";
const SSH_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2E host@bench";

#[derive(Clone, Copy)]
struct DoorBehavior {
    require_password: bool,
    answer_keep_alive: bool,
    version_mismatch: bool,
    hang_up_after_services: bool,
}

impl Default for DoorBehavior {
    fn default() -> Self {
        Self {
            require_password: true,
            answer_keep_alive: true,
            version_mismatch: false,
            hang_up_after_services: false,
        }
    }
}

#[derive(Default)]
struct DoorLog {
    codes: Vec<RequestCode>,
    ssh_key: Option<String>,
    keep_alives: usize,
}

async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.ok()?;
    let total = usize::from(u16::from_be_bytes(header));
    let mut data = header.to_vec();
    data.resize(total.max(2), 0);
    stream.read_exact(&mut data[2..]).await.ok()?;
    Some(data)
}

async fn reply(stream: &mut TcpStream, result: SecureResult) {
    let data = result.encode().unwrap();
    stream.write_all(&data).await.unwrap();
}

async fn ok(stream: &mut TcpStream) {
    reply(stream, SecureResult::Feedback(Feedback::Ok)).await;
}

async fn reject(stream: &mut TcpStream, reason: &str) {
    reply(
        stream,
        SecureResult::Feedback(Feedback::Rejected {
            code: 30,
            reason: reason.into(),
        }),
    )
    .await;
}

fn split_answer(payload: &[u8]) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let len = |at: usize| usize::from(u16::from_be_bytes([payload[at], payload[at + 1]]));
    let (blob_len, sig_len, sealed_len) = (len(0), len(2), len(4));
    let blob = payload[6..6 + blob_len].to_vec();
    let sig = payload[6 + blob_len..6 + blob_len + sig_len].to_vec();
    let sealed = payload[6 + blob_len + sig_len..6 + blob_len + sig_len + sealed_len].to_vec();
    (blob, sig, sealed)
}

/// Door service that walks one client through the handshake.
async fn spawn_door(behavior: DoorBehavior) -> (u16, Arc<Mutex<DoorLog>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(Mutex::new(DoorLog::default()));
    let door_log = log.clone();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let transport_key = [0x5Au8; 32];
        let container: Vec<u8> = [&[32u8, 2][..], &transport_key[..], &[4, 1, 9, 8, 7, 6][..]].concat();
        let recipe = AuthChallenge {
            algorithm: 2,
            iterations: 5,
            salt: b"door-salt".to_vec(),
            nonce: b"n0nce".to_vec(),
        };
        let mut public_key = None;
        let mut session_key = None;

        while let Some(frame) = read_frame(&mut stream).await {
            let (code, payload) = decode_request(&frame).unwrap();
            door_log.lock().unwrap().codes.push(code);

            match code {
                RequestCode::Hello if behavior.version_mismatch => {
                    reply(&mut stream, SecureResult::Feedback(Feedback::VersionMismatch("v1".into()))).await;
                }
                RequestCode::Hello => ok(&mut stream).await,
                RequestCode::Challenge => {
                    let len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
                    let key = public_key_from_modulus(&payload[2..2 + len]).unwrap();
                    let challenge = EncryptionChallenge {
                        length: 0,
                        version: 1,
                        source_name: "door".into(),
                        session_key_length: 32,
                        session_key_type: 1,
                        container_primitive: 1,
                        container_type: 1,
                        expected_signature_length: len as u16,
                        expected_signature_type: SUPPORTED_SIGNATURE_TYPE,
                        container_key_version: 1,
                        encrypted_blob: encrypt_for(&key, &container).unwrap(),
                    };
                    public_key = Some(key);
                    reply(&mut stream, SecureResult::EncryptedChallenge(challenge.encode().unwrap())).await;
                }
                RequestCode::ChallengeResponse => {
                    let (blob, sig, sealed) = split_answer(&payload);
                    let expected: Vec<u8> = [container.as_slice(), &PERMISSIONS[..]].concat();
                    let key = public_key.as_ref().unwrap();
                    if blob != expected || verify_signature(key, &blob, &sig).is_err() {
                        reject(&mut stream, "bad challenge answer").await;
                        continue;
                    }
                    session_key = Some(open(&transport_key, &sealed).unwrap().to_vec());
                    ok(&mut stream).await;
                }
                RequestCode::AuthChallengeRequest if behavior.require_password => {
                    reply(&mut stream, SecureResult::AuthChallenge(recipe.clone())).await;
                }
                RequestCode::AuthChallengeRequest => {
                    reply(&mut stream, SecureResult::Feedback(Feedback::NoPasswordRequired)).await;
                }
                RequestCode::Authenticate => {
                    let plain = open(session_key.as_ref().unwrap(), &payload).unwrap();
                    let len = usize::from(u16::from_be_bytes([plain[0], plain[1]]));
                    let expected = hash_password(PASSWORD, &recipe).unwrap();
                    if plain[2..2 + len] == *expected.as_bytes() {
                        ok(&mut stream).await;
                    } else {
                        reject(&mut stream, "wrong password").await;
                    }
                }
                RequestCode::SshPublicKey => {
                    let plain = open(session_key.as_ref().unwrap(), &payload).unwrap();
                    door_log.lock().unwrap().ssh_key = Some(String::from_utf8(plain.to_vec()).unwrap());
                    ok(&mut stream).await;
                }
                RequestCode::StartServices => {
                    ok(&mut stream).await;
                    if behavior.hang_up_after_services {
                        break;
                    }
                }
                RequestCode::KeepAlive => {
                    door_log.lock().unwrap().keep_alives += 1;
                    if behavior.answer_keep_alive {
                        ok(&mut stream).await;
                    }
                }
                RequestCode::Close => {
                    ok(&mut stream).await;
                    break;
                }
            }
        }
    });

    (port, log)
}

fn pairing_config(port: u16) -> PairingConfig {
    PairingConfig {
        host: "127.0.0.1".into(),
        door_port: port,
        transport: TransportConfig {
            connect_timeout_ms: 2000,
            send_timeout_ms: 2000,
            receive_timeout_ms: 1000,
            ..TransportConfig::default()
        },
        key_bits: 512,
        ..PairingConfig::default()
    }
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<PairingEvent>) -> PairingEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("no pairing event")
        .unwrap()
}

#[tokio::test]
async fn test_pairing_happy_path() {
    let (port, log) = spawn_door(DoorBehavior::default()).await;
    let pairing = SecurePairing::new(pairing_config(port)).unwrap();
    let mut events = pairing.subscribe();

    pairing.connect(PASSWORD, &format!("{}\n", SSH_KEY)).await.unwrap();
    assert!(pairing.is_authenticated());
    assert_eq!(pairing.state(), PairingState::Authenticated);
    assert_eq!(next_event(&mut events).await, PairingEvent::Authenticated);

    {
        let log = log.lock().unwrap();
        assert_eq!(log.ssh_key.as_deref(), Some(SSH_KEY));
        assert_eq!(
            log.codes,
            vec![
                RequestCode::Hello,
                RequestCode::Challenge,
                RequestCode::ChallengeResponse,
                RequestCode::AuthChallengeRequest,
                RequestCode::Authenticate,
                RequestCode::SshPublicKey,
                RequestCode::StartServices,
            ]
        );
    }

    pairing.keep_alive(Duration::from_millis(50)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(pairing.is_authenticated());
    assert!(pairing.is_keep_alive_running());
    assert!(log.lock().unwrap().keep_alives >= 2);

    pairing.close().await;
    assert!(!pairing.is_authenticated());
    assert!(!pairing.is_keep_alive_running());
    assert_eq!(pairing.state(), PairingState::Closed);
    assert_eq!(next_event(&mut events).await, PairingEvent::NotAuthenticated);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(log.lock().unwrap().codes.last(), Some(&RequestCode::Close));
}

#[tokio::test]
async fn test_pairing_without_password() {
    let (port, log) = spawn_door(DoorBehavior {
        require_password: false,
        ..DoorBehavior::default()
    })
    .await;
    let pairing = SecurePairing::new(pairing_config(port)).unwrap();

    pairing.connect("ignored", SSH_KEY).await.unwrap();
    assert!(pairing.is_authenticated());
    assert!(!log.lock().unwrap().codes.contains(&RequestCode::Authenticate));

    pairing.close().await;
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let (port, log) = spawn_door(DoorBehavior::default()).await;
    let pairing = SecurePairing::new(pairing_config(port)).unwrap();

    let err = pairing.connect("wrong", SSH_KEY).await.unwrap_err();
    assert!(matches!(err, QConnError::Authentication { .. }), "{:?}", err);
    assert!(!pairing.is_authenticated());
    assert_eq!(pairing.state(), PairingState::Closed);
    assert!(log.lock().unwrap().ssh_key.is_none());

    pairing.close().await;
    assert!(matches!(
        pairing.keep_alive(Duration::from_millis(10)),
        Err(QConnError::NotAuthenticated)
    ));
}

#[tokio::test]
async fn test_version_mismatch() {
    let (port, _log) = spawn_door(DoorBehavior {
        version_mismatch: true,
        ..DoorBehavior::default()
    })
    .await;
    let pairing = SecurePairing::new(pairing_config(port)).unwrap();

    let err = pairing.connect(PASSWORD, SSH_KEY).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::Fail));
    assert_eq!(pairing.state(), PairingState::Closed);
}

#[tokio::test]
async fn test_unanswered_keep_alive_drops_authentication_once() {
    let (port, log) = spawn_door(DoorBehavior {
        answer_keep_alive: false,
        ..DoorBehavior::default()
    })
    .await;
    let mut config = pairing_config(port);
    config.transport.receive_timeout_ms = 200;
    let pairing = SecurePairing::new(config).unwrap();
    let mut events = pairing.subscribe();

    pairing.connect(PASSWORD, SSH_KEY).await.unwrap();
    assert_eq!(next_event(&mut events).await, PairingEvent::Authenticated);

    pairing.keep_alive(Duration::from_millis(20)).unwrap();
    assert_eq!(next_event(&mut events).await, PairingEvent::NotAuthenticated);
    assert!(!pairing.is_authenticated());
    assert_eq!(log.lock().unwrap().keep_alives, 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(!pairing.is_keep_alive_running());
}

#[tokio::test]
async fn test_failed_keep_alive_send_stops_loop() {
    let (port, log) = spawn_door(DoorBehavior {
        hang_up_after_services: true,
        ..DoorBehavior::default()
    })
    .await;
    let pairing = SecurePairing::new(pairing_config(port)).unwrap();
    let mut events = pairing.subscribe();

    pairing.connect(PASSWORD, SSH_KEY).await.unwrap();
    assert_eq!(next_event(&mut events).await, PairingEvent::Authenticated);
    tokio::time::sleep(Duration::from_millis(100)).await;

    pairing.keep_alive(Duration::from_millis(20)).unwrap();
    assert_eq!(next_event(&mut events).await, PairingEvent::NotAuthenticated);
    assert!(!pairing.is_authenticated());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pairing.is_keep_alive_running());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    let log = log.lock().unwrap();
    assert_eq!(log.keep_alives, 0);
    assert_eq!(log.codes.last(), Some(&RequestCode::StartServices));
}

/// Minimal `qconn` service answering a fixed set of commands.
async fn spawn_qconn() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"QCONN\r\n\xff\xfb\x01").await.unwrap();

        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let answer: &[u8] = match line.trim_end() {
                "service launcher" => b"OK\r\n",
                "info" => b"QCONN_VERSION=1.4 ENDIAN=be OS=nto HOSTNAME=bench\r\n",
                "service ?" => {
                    write.write_all(b"\r\n").await.unwrap();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    b"services: launcher cntl file\r\n"
                }
                "version launcher" => b"260\r\n",
                _ => b"error unknown command\r\n",
            };
            write.write_all(answer).await.unwrap();
        }
    });

    port
}

#[tokio::test]
async fn test_qconn_channel_commands() {
    let port = spawn_qconn().await;
    let mut channel = QConnChannel::open("127.0.0.1", port, TransportConfig::default(), Some("launcher"))
        .await
        .unwrap();
    assert_eq!(channel.service(), Some("launcher"));

    let info = channel.info().await.unwrap();
    assert_eq!(info["HOSTNAME"], "bench");
    assert_eq!(channel.endian().await.unwrap(), Endian::Big);
    assert_eq!(channel.services().await.unwrap(), vec!["launcher", "cntl", "file"]);
    assert_eq!(channel.service_version("launcher").await.unwrap(), (1, 4));

    match channel.send("frobnicate").await {
        Err(QConnError::Command { command, message }) => {
            assert_eq!(command, "frobnicate");
            assert_eq!(message, "unknown command");
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    channel.close().await;
}

#[tokio::test]
async fn test_qconn_wrong_greeting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"SSH-2.0-OpenSSH\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let result = QConnChannel::open("127.0.0.1", port, TransportConfig::default(), None).await;
    assert!(matches!(result, Err(QConnError::ProtocolFormat { .. })));
}

async fn spawn_file_service() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let closed = Arc::new(Mutex::new(Vec::new()));
    let log = closed.clone();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"QCONN\r\n\xff\xfb\x01").await.unwrap();

        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end().to_string();
            let answer: Vec<u8> = match line.as_str() {
                "service file" => b"OK\r\n".to_vec(),
                "info" => b"QCONN_VERSION=1.4 ENDIAN=be OS=nto\r\n".to_vec(),
                "s:8" => {
                    // regular file, rw-r--r--, split over two writes
                    let mut record = 0x81A4u32.to_be_bytes().to_vec();
                    record.extend_from_slice(&11u64.to_be_bytes());
                    write.write_all(&record).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(50)).await;

                    let mut rest = 1u32.to_be_bytes().to_vec();
                    for value in [100u32, 200, 1_700_000_000] {
                        rest.extend_from_slice(&value.to_be_bytes());
                    }
                    rest
                }
                "l:7" => {
                    let mut listing = 4u32.to_be_bytes().to_vec();
                    listing.extend_from_slice(b".\0..\0log.txt\0app\0");
                    listing
                }
                "r:8:0:8000" => {
                    let mut block = 11u32.to_be_bytes().to_vec();
                    block.extend_from_slice(b"hello qconn");
                    block
                }
                "c:7" | "c:8" => {
                    log.lock().unwrap().push(line[2..].to_string());
                    b"o\r\n".to_vec()
                }
                _ => match line.strip_prefix("o:\"").and_then(|rest| rest.split('"').next()) {
                    Some("/tmp") => b"o:7\r\n".to_vec(),
                    Some("/tmp/log.txt") => b"o:8\r\n".to_vec(),
                    Some(_) => b"error No such file or directory\r\n".to_vec(),
                    None => b"error bad handle\r\n".to_vec(),
                },
            };
            write.write_all(&answer).await.unwrap();
        }
    });

    (port, closed)
}

#[tokio::test]
async fn test_file_service_queries() {
    let (port, closed) = spawn_file_service().await;
    let mut files = FileService::open("127.0.0.1", port, TransportConfig::default())
        .await
        .unwrap();
    assert_eq!(files.endian(), Endian::Big);

    assert_eq!(files.list("/tmp").await.unwrap(), vec!["log.txt", "app"]);

    let stat = files.stat("/tmp/log.txt").await.unwrap();
    assert_eq!(stat.name(), "log.txt");
    assert_eq!(stat.type_char(), '-');
    assert_eq!(stat.permissions(), 0o644);
    assert_eq!(stat.size, 11);
    assert_eq!((stat.flags, stat.uid, stat.gid), (1, 100, 200));
    assert_eq!(stat.modified, 1_700_000_000);

    assert_eq!(files.download("/tmp/log.txt").await.unwrap(), b"hello qconn");
    assert_eq!(*closed.lock().unwrap(), vec!["7", "8", "8"]);

    files.close().await;
}

#[tokio::test]
async fn test_file_service_errors() {
    let (port, closed) = spawn_file_service().await;
    let channel = QConnChannel::open("127.0.0.1", port, TransportConfig::default(), Some("file"))
        .await
        .unwrap();
    let mut files = FileService::from_channel(channel, Endian::Big);

    match files.stat("/missing").await {
        Err(QConnError::Command { message, .. }) => assert_eq!(message, "No such file or directory"),
        other => panic!("unexpected reply: {:?}", other),
    }

    let stale = FileHandle {
        handle: "99".into(),
        path: "/tmp/gone".into(),
    };
    match files.stat_handle(&stale).await {
        Err(QConnError::Command { command, message }) => {
            assert_eq!(command, "s:99");
            assert_eq!(message, "bad handle");
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert!(closed.lock().unwrap().is_empty());
    files.close().await;
}
