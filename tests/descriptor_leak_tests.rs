// Kept as the only test in this binary: it counts the process-wide
// descriptor table, so no other test may open files concurrently.
#![cfg(target_os = "linux")]

use sockbroker::broker::{BrokerClient, BrokerServer};
use std::fs;
use std::os::unix::net::UnixStream;
use std::thread;

fn open_descriptors() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn test_handoffs_close_broker_copy() {
    let (client, server) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || BrokerServer::handle_connection(server));
    let mut client = BrokerClient::from_stream("/tmp/leak.sock", client);

    // Warm up so lazily opened runtime descriptors are already counted
    drop(client.request_datagram().unwrap());
    let before = open_descriptors();

    for _ in 0..50 {
        let fd = client.request_datagram().unwrap();
        drop(fd);
    }
    for _ in 0..10 {
        drop(client.request_stream().unwrap());
    }

    assert_eq!(open_descriptors(), before);

    drop(client);
    assert_eq!(handle.join().unwrap().unwrap(), 61);
}
