use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{getsockopt, sockopt, SockType};
use nix::unistd::Pid;
use sockbroker::broker::{recv_fd, BrokerClient, SocketKind, TAG_DATAGRAM};
use sockbroker::error::{BrokerError, ProtocolError};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// A socketd child process listening in a private temp directory
struct Broker {
    child: Child,
    path: PathBuf,
    _dir: TempDir,
}

impl Broker {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.sock");
        let child = Command::new(env!("CARGO_BIN_EXE_socketd"))
            .arg("--listen")
            .arg(&path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start socketd");

        for _ in 0..100 {
            if path.exists() && UnixStream::connect(&path).is_ok() {
                return Broker { child, path, _dir: dir };
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("socketd failed to start within 5 seconds");
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn wait_gone(path: &Path) -> bool {
    for _ in 0..100 {
        if !path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_datagram_then_invalid_tag() {
    let broker = Broker::start();
    let mut stream = UnixStream::connect(&broker.path).unwrap();

    stream.write_all(&[TAG_DATAGRAM]).unwrap();
    let fd = recv_fd(&stream).unwrap();
    assert_eq!(getsockopt(&fd, sockopt::SockType).unwrap(), SockType::Datagram);

    stream.write_all(&[99]).unwrap();
    match recv_fd(&stream) {
        Err(BrokerError::Protocol(ProtocolError::ConnectionClosed)) => {}
        other => panic!("expected the broker to hang up, got {:?}", other),
    }
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_each_kind_matches_request() {
    let broker = Broker::start();
    let mut client = BrokerClient::connect(&broker.path).unwrap();

    for kind in [SocketKind::Stream, SocketKind::Datagram, SocketKind::Stream] {
        let fd = client.request(kind).unwrap();
        assert_eq!(getsockopt(&fd, sockopt::SockType).unwrap(), kind.sock_type());
    }
    assert_eq!(client.requests(), 3);
}

#[test]
fn test_many_requests_on_one_connection() {
    let broker = Broker::start();
    let mut client = BrokerClient::connect(&broker.path).unwrap();

    let mut fds: Vec<_> = (0..16).map(|_| client.request_datagram().unwrap()).collect();
    // Drop every other descriptor; the rest stay valid
    let kept: Vec<_> = fds.drain(..).enumerate().filter(|(i, _)| i % 2 == 0).map(|(_, fd)| fd).collect();
    for fd in &kept {
        assert_eq!(getsockopt(fd, sockopt::SockType).unwrap(), SockType::Datagram);
    }
}

#[test]
fn test_concurrent_connections_are_independent() {
    let broker = Broker::start();
    let path = broker.path.clone();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || {
                let mut client = BrokerClient::connect(&path).unwrap();
                for _ in 0..5 {
                    client.request_datagram().unwrap();
                }
                client.requests()
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), 5);
    }

    // One client misbehaving does not affect another
    let mut bad = UnixStream::connect(&path).unwrap();
    let mut good = BrokerClient::connect(&path).unwrap();
    bad.write_all(&[0]).unwrap();
    assert!(recv_fd(&bad).is_err());
    assert!(good.request_stream().is_ok());
}

#[test]
fn test_sigint_unlinks_rendezvous_path() {
    let mut broker = Broker::start();
    let path = broker.path.clone();

    kill(broker.pid(), Signal::SIGINT).unwrap();
    let status = broker.child.wait().unwrap();

    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    assert!(wait_gone(&path), "socket path should be removed on SIGINT");
}

#[test]
fn test_sigterm_unlinks_rendezvous_path() {
    let mut broker = Broker::start();
    let path = broker.path.clone();

    kill(broker.pid(), Signal::SIGTERM).unwrap();
    let status = broker.child.wait().unwrap();

    assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    assert!(wait_gone(&path));
}

#[test]
fn test_handler_outlives_broker_parent() {
    let mut broker = Broker::start();
    let mut client = BrokerClient::connect(&broker.path).unwrap();
    client.request_datagram().unwrap();

    kill(broker.pid(), Signal::SIGINT).unwrap();
    broker.child.wait().unwrap();

    // The forked handler keeps serving the connection it owns
    let fd = client.request_datagram().unwrap();
    assert_eq!(getsockopt(&fd, sockopt::SockType).unwrap(), SockType::Datagram);
}

#[test]
fn test_read_timeout_closes_idle_connection() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idle.sock");
    let mut child = Command::new(env!("CARGO_BIN_EXE_socketd"))
        .arg("--listen")
        .arg(&path)
        .arg("--read-timeout")
        .arg("1")
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut stream = None;
    for _ in 0..100 {
        if let Ok(s) = UnixStream::connect(&path) {
            stream = Some(s);
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    let mut stream = stream.expect("socketd failed to start");

    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0, "idle handler should hang up");

    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn test_exit_code_for_oversized_path() {
    let long = format!("/tmp/{}", "s".repeat(200));
    let status = Command::new(env!("CARGO_BIN_EXE_socketd"))
        .arg("--listen")
        .arg(&long)
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn test_exit_code_for_missing_path() {
    let status = Command::new(env!("CARGO_BIN_EXE_socketd"))
        .env_remove("SOCKETD_LISTEN")
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}
