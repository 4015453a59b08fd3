//! Client-side TCP link
//!
//! Length-prefixed frames over one stream. A dedicated reader thread
//! decodes frames; sends write whole frames under the writer lock. TCP
//! delivers control messages, so there is no acknowledgement layer.

use bytes::BytesMut;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::liveness::Activity;
use crate::protocol::{ConnectionDescriptor, TransportKind};
use crate::remote::frame::{encode_frame, FrameDecoder, MessageKind, LENGTH_LEN, TYPE_LEN};
use crate::remote::link::{LinkEvent, LinkId, LinkSink, LinkStats, RemoteLink};

pub struct TcpLink {
    me: Weak<Self>,
    id: LinkId,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    config: LinkConfig,
    writer: Mutex<Option<TcpStream>>,
    open: AtomicBool,
    closed: AtomicBool,
    activity: Activity,
    stats: LinkStats,
    sink: LinkSink,
}

impl TcpLink {
    pub fn new(descriptor: &ConnectionDescriptor, config: LinkConfig, sink: LinkSink) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: LinkId::next(),
            remote: descriptor.remote_address,
            local: descriptor.local_address,
            config,
            writer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            activity: Activity::new(),
            stats: LinkStats::default(),
            sink,
        })
    }

    fn connect_stream(&self) -> Result<TcpStream, LinkError> {
        let socket = Socket::new(Domain::for_address(self.remote), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(local) = self.local {
            socket.set_reuse_address(true)?;
            socket.bind(&local.into())?;
        }
        socket.connect_timeout(&self.remote.into(), self.config.connect_timeout())?;
        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn send_frame(&self, kind: MessageKind, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > self.config.output_buffer_size {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        let frame = encode_frame(kind, payload);
        let result = {
            let mut writer = self.writer.lock();
            let stream = writer.as_mut().ok_or(LinkError::NotOpen)?;
            stream.write_all(&frame)
        };
        if let Err(e) = result {
            tracing::warn!("TCP link {} to {} send failed: {}", self.id, self.remote, e);
            self.shutdown();
            return Err(e.into());
        }
        Ok(())
    }

    /// Tear down once; reports `Closed` to the owner
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        if let Some(stream) = self.writer.lock().take() {
            // Wakes the reader thread
            let _ = stream.shutdown(Shutdown::Both);
        }
        tracing::debug!("TCP link {} to {} closed", self.id, self.remote);
        (self.sink)(self.id, LinkEvent::Closed);
    }

    fn read_loop(&self, mut stream: TcpStream) {
        let decoder = FrameDecoder::new(self.config.input_buffer_size);
        let mut buf = BytesMut::with_capacity(LENGTH_LEN + TYPE_LEN + self.config.input_buffer_size);
        let mut chunk = vec![0u8; LENGTH_LEN + TYPE_LEN + self.config.input_buffer_size];

        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!("TCP link {}: peer closed the stream", self.id);
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.is_open() {
                        tracing::warn!("TCP link {} read failed: {}", self.id, e);
                    }
                    break;
                }
            };
            self.activity.touch();
            buf.extend_from_slice(&chunk[..n]);

            loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(frame)) => self.dispatch(frame.kind, frame.payload),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("TCP link {}: protocol violation: {}", self.id, e);
                        self.shutdown();
                        return;
                    }
                }
            }
        }
        self.shutdown();
    }

    fn dispatch(&self, kind: MessageKind, payload: bytes::Bytes) {
        match kind {
            MessageKind::Data => {
                LinkStats::bump(&self.stats.data_received);
                (self.sink)(self.id, LinkEvent::Data(payload));
            }
            MessageKind::Control => {
                LinkStats::bump(&self.stats.control_received);
                (self.sink)(self.id, LinkEvent::Control(payload));
            }
            MessageKind::Heartbeat => {}
        }
    }
}

impl RemoteLink for TcpLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer_address(&self) -> SocketAddr {
        self.remote
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn open(&self) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        if self.is_open() {
            return Ok(());
        }

        let stream = self.connect_stream()?;
        let reader = stream.try_clone()?;
        *self.writer.lock() = Some(stream);
        self.open.store(true, Ordering::SeqCst);
        self.activity.touch();

        let link = self.me.upgrade().ok_or(LinkError::Closed)?;
        let spawned = thread::Builder::new()
            .name(format!("tcp-link-{}", self.id.as_u64()))
            .spawn(move || link.read_loop(reader));
        if let Err(e) = spawned {
            self.shutdown();
            return Err(e.into());
        }

        tracing::info!("TCP link {} connected to {}", self.id, self.remote);
        Ok(())
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_data(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.send_frame(MessageKind::Data, payload)?;
        LinkStats::bump(&self.stats.data_sent);
        Ok(())
    }

    fn send_control(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.send_frame(MessageKind::Control, payload)?;
        LinkStats::bump(&self.stats.control_sent);
        Ok(())
    }

    fn send_heartbeat(&self) -> Result<(), LinkError> {
        self.send_frame(MessageKind::Heartbeat, &[])
    }

    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::net::TcpListener;
    use std::time::Duration;

    fn collecting_sink() -> (LinkSink, crossbeam_channel::Receiver<LinkEvent>) {
        let (tx, rx) = unbounded();
        let sink: LinkSink = Arc::new(move |_: LinkId, event: LinkEvent| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    fn connected_pair(config: LinkConfig) -> (Arc<TcpLink>, TcpStream, crossbeam_channel::Receiver<LinkEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (sink, rx) = collecting_sink();
        let descriptor = ConnectionDescriptor::new(TransportKind::Tcp, listener.local_addr().unwrap());
        let link = TcpLink::new(&descriptor, config, sink);
        link.open().unwrap();
        let (server, _) = listener.accept().unwrap();
        (link, server, rx)
    }

    #[test]
    fn test_frames_cross_the_stream() {
        let (link, mut server, rx) = connected_pair(LinkConfig::default());

        link.send_control(&[0, 4, 1]).unwrap();
        link.send_data(b"payload").unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&encode_frame(MessageKind::Control, &[0, 4, 1]));
        expected.extend_from_slice(&encode_frame(MessageKind::Data, b"payload"));
        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);

        server.write_all(&encode_frame(MessageKind::Heartbeat, &[])).unwrap();
        server.write_all(&encode_frame(MessageKind::Data, b"back")).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, LinkEvent::Data(bytes::Bytes::from_static(b"back")));
        link.close();
    }

    #[test]
    fn test_oversized_frame_closes_link() {
        let config = LinkConfig {
            input_buffer_size: 8,
            ..Default::default()
        };
        let (link, mut server, rx) = connected_pair(config);

        server.write_all(&encode_frame(MessageKind::Data, &[0u8; 9])).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), LinkEvent::Closed);
        assert!(!link.is_open());
        assert!(matches!(link.send_data(b"x"), Err(LinkError::NotOpen)));
    }

    #[test]
    fn test_peer_eof_reports_closed_once() {
        let (link, server, rx) = connected_pair(LinkConfig::default());
        drop(server);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), LinkEvent::Closed);
        link.close();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        // Single use
        assert!(matches!(link.open(), Err(LinkError::Closed)));
    }
}
