//! Line-echo server demonstrating the reactor end to end.
//!
//! Accepts TCP connections on a listener thread, wraps each one in a
//! `StreamSocket` with an echo handler, and hands it to a single
//! `SocketPoll`. Everything after the accept runs on the poll's loop
//! thread.
//!
//! ```sh
//! TILEHUB_ECHO_ADDR=127.0.0.1:9981 cargo run --bin echo
//! ```

use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};

use tilehub::{Config, Socket, SocketHandler, SocketPoll, StreamSocket};

/// Echoes every received byte straight back.
#[derive(Default)]
struct EchoHandler {
    socket: Weak<StreamSocket>,
}

impl SocketHandler for EchoHandler {
    fn on_connect(&mut self, socket: Weak<StreamSocket>) {
        self.socket = socket;
    }

    fn handle_incoming_message(&mut self) {
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        let data = std::mem::take(&mut *socket.input());
        socket.send(&data, true);
    }

    fn on_disconnect(&mut self) {
        log::info!("client disconnected");
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load(None)?;
    let poll = SocketPoll::with_config("echo", &config)?;

    let addr = std::env::var("TILEHUB_ECHO_ADDR").unwrap_or_else(|_| "127.0.0.1:9981".to_owned());
    let listener = TcpListener::bind(&addr).with_context(|| format!("bind {addr}"))?;
    log::info!("echo server listening on {}", listener.local_addr()?);

    for connection in listener.incoming() {
        match connection {
            Ok(connection) => {
                let peer = connection.peer_addr();
                let socket = Socket::from_fd(OwnedFd::from(connection));
                socket.apply_config(&config);
                let stream = StreamSocket::create(socket, Box::new(EchoHandler::default()));
                log::info!("client connected from {peer:?} on socket #{}", stream.socket().raw_fd());
                poll.insert(stream as Arc<dyn tilehub::Pollable>);
            }
            Err(err) => log::warn!("accept failed: {err}"),
        }
    }

    Ok(())
}
