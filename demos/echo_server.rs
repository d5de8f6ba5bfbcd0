use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use spindle_io::{BufferPool, Channel, EventLoop, Result};

const LISTENER: Token = Token(1);

struct NextToken(usize);

impl NextToken {
    fn new() -> Self {
        NextToken(2)
    }

    fn next(&mut self) -> Token {
        let next = self.0;
        self.0 += 1;
        Token(next)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    let listener = Arc::new(TcpListener::bind(addr)?);
    let event_loop = Arc::new(EventLoop::new()?);

    let connections: Arc<Mutex<HashMap<Token, TcpStream>>> = Arc::new(Mutex::new(HashMap::new()));
    let next_token = Arc::new(Mutex::new(NextToken::new()));
    let buffer_pool = BufferPool::new(16, 8192);

    let mut listen_channel = Channel::new(LISTENER, listener.as_raw_fd());
    {
        let listener = listener.clone();
        let event_loop = event_loop.clone();
        let connections = connections.clone();
        listen_channel.set_read_callback(move || loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let token = next_token.lock().unwrap().next();
                    info!("new connection from {} as {:?}", peer, token);

                    let mut channel = Channel::new(token, stream.as_raw_fd());
                    let connections_for_read = connections.clone();
                    let event_loop_for_read = event_loop.clone();
                    let pool = buffer_pool.clone();
                    channel.set_read_callback(move || {
                        let mut connections = connections_for_read.lock().unwrap();
                        let stream = match connections.get_mut(&token) {
                            Some(stream) => stream,
                            None => return,
                        };
                        let mut buffer = pool.acquire();
                        match buffer.read_from_fd(stream.as_raw_fd()) {
                            Ok(0) => {
                                info!("{:?} disconnected", token);
                                connections.remove(&token);
                                let _ = event_loop_for_read.remove_channel(token);
                            }
                            Ok(n) => {
                                info!("echoing {} bytes to {:?}", n, token);
                                if let Err(e) = stream.write_all(buffer.peek()) {
                                    warn!("write to {:?} failed: {}", token, e);
                                    connections.remove(&token);
                                    let _ = event_loop_for_read.remove_channel(token);
                                }
                            }
                            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                            Err(e) => {
                                warn!("read from {:?} failed: {}", token, e);
                                connections.remove(&token);
                                let _ = event_loop_for_read.remove_channel(token);
                            }
                        }
                    });
                    let connections_for_close = connections.clone();
                    let event_loop_for_close = event_loop.clone();
                    channel.set_close_callback(move || {
                        info!("{:?} hung up", token);
                        connections_for_close.lock().unwrap().remove(&token);
                        let _ = event_loop_for_close.remove_channel(token);
                    });
                    channel.enable_reading();

                    if let Err(e) = event_loop.update_channel(channel) {
                        error!("failed to register {:?}: {}", token, e);
                        continue;
                    }
                    connections.lock().unwrap().insert(token, stream);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        });
    }
    listen_channel.enable_reading();
    event_loop.update_channel(listen_channel)?;

    info!("echo server listening on {}", addr);
    event_loop.run();
    Ok(())
}
