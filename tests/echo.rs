use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::Token;
use spindle_io::{Channel, EventLoop, MsgBuffer};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn echo_round_trip_within_deadline() {
    init_logging();
    let event_loop = Arc::new(EventLoop::new().unwrap());

    let (mut client, server) = UnixStream::pair().unwrap();
    server.set_nonblocking(true).unwrap();
    let server = Arc::new(Mutex::new(server));

    let mut channel = Channel::new(Token(1), server.lock().unwrap().as_raw_fd());
    let echo_side = server.clone();
    channel.set_read_callback(move || {
        let mut stream = echo_side.lock().unwrap();
        let mut buffer = MsgBuffer::new();
        match buffer.read_from_fd(stream.as_raw_fd()) {
            Ok(0) => {}
            Ok(_) => {
                stream.write_all(buffer.peek()).unwrap();
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => panic!("echo read failed: {}", e),
        }
    });
    channel.enable_reading();
    event_loop.update_channel(channel).unwrap();

    client
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();

    let el = event_loop.clone();
    let exchange = std::thread::spawn(move || {
        client.write_all(b"hello").unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        el.quit();
        reply
    });

    // Safety net so a broken echo path cannot hang the test.
    let el = event_loop.clone();
    event_loop.run_after(Duration::from_secs(5), move || el.quit());

    event_loop.run();
    assert_eq!(&exchange.join().unwrap(), b"hello");
}

#[test]
fn still_readable_channel_is_reported_again() {
    init_logging();
    let event_loop = Arc::new(EventLoop::new().unwrap());

    let (mut client, server) = UnixStream::pair().unwrap();
    server.set_nonblocking(true).unwrap();
    let server = Arc::new(Mutex::new(server));

    let calls = Arc::new(AtomicUsize::new(0));
    let collected = Arc::new(Mutex::new(Vec::new()));

    // Reads a single byte per callback invocation; the remaining bytes
    // must be reported again on later iterations without new writes.
    let mut channel = Channel::new(Token(1), server.lock().unwrap().as_raw_fd());
    let reader = server.clone();
    let c = calls.clone();
    let sink = collected.clone();
    let el = event_loop.clone();
    channel.set_read_callback(move || {
        let mut stream = reader.lock().unwrap();
        let mut one = [0u8; 1];
        match stream.read(&mut one) {
            Ok(1) => {
                c.fetch_add(1, Ordering::SeqCst);
                let mut sink = sink.lock().unwrap();
                sink.push(one[0]);
                if sink.len() == 3 {
                    el.quit();
                }
            }
            _ => {}
        }
    });
    channel.enable_reading();
    event_loop.update_channel(channel).unwrap();

    client.write_all(b"abc").unwrap();

    let el = event_loop.clone();
    event_loop.run_after(Duration::from_secs(5), move || el.quit());

    event_loop.run();
    assert_eq!(&*collected.lock().unwrap(), b"abc");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn removed_channel_never_fires_again() {
    init_logging();
    let event_loop = Arc::new(EventLoop::new().unwrap());

    let (mut client, server) = UnixStream::pair().unwrap();
    server.set_nonblocking(true).unwrap();

    let fired_after_removal = Arc::new(AtomicUsize::new(0));

    let mut channel = Channel::new(Token(9), server.as_raw_fd());
    let el = event_loop.clone();
    let fired = fired_after_removal.clone();
    let removed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let removed_flag = removed.clone();
    channel.set_read_callback(move || {
        if removed_flag.load(Ordering::SeqCst) {
            fired.fetch_add(1, Ordering::SeqCst);
            return;
        }
        // First event: remove ourselves from the loop thread.
        removed_flag.store(true, Ordering::SeqCst);
        el.remove_channel(Token(9)).unwrap();
    });
    channel.enable_reading();
    event_loop.update_channel(channel).unwrap();

    client.write_all(b"unread and staying that way").unwrap();

    let el = event_loop.clone();
    event_loop.run_after(Duration::from_millis(200), move || el.quit());

    event_loop.run();
    drop(server);
    assert_eq!(fired_after_removal.load(Ordering::SeqCst), 0);
}
