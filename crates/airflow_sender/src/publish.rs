//! Publish sinks for serialized samples.
//!
//! Delivery is fire-and-forget: the loop hands a message over and moves on.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use airflow_core::config::PublishConfig;
use airflow_core::Transport;
use tokio::runtime::Handle;
use tracing::{info, warn};
use zeromq::{Endpoint, PubSocket, Socket, SocketSend, ZmqError, ZmqMessage};

/// Upper bound for one write to a TCP subscriber before it is dropped.
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {endpoint}: {source}")]
    ZmqBind {
        endpoint: String,
        #[source]
        source: ZmqError,
    },

    #[error("invalid address {0:?}")]
    Address(String),

    #[error("zmq send failed: {0}")]
    ZmqSend(#[source] ZmqError),

    #[error("send failed: {0}")]
    Send(#[from] io::Error),
}

/// Send primitive of the publish bus.
pub trait PublishSink {
    fn publish(&mut self, message: &str) -> Result<(), PublishError>;
}

/// Builds the sink selected in the configuration.
///
/// `runtime` drives the ZeroMQ socket; the other transports ignore it.
pub fn from_config(
    config: &PublishConfig,
    runtime: &Handle,
) -> Result<Box<dyn PublishSink + Send>, PublishError> {
    match config.transport {
        Transport::Zmq => Ok(Box::new(ZmqPublisher::bind(
            &config.zmq_endpoint,
            runtime.clone(),
        )?)),
        Transport::Tcp => Ok(Box::new(TcpPublisher::bind(&config.bind_addr)?)),
        Transport::Udp => Ok(Box::new(UdpPublisher::new(&config.dest_addr)?)),
    }
}

// ──────────────────────────────────────────────
// ZeroMQ
// ──────────────────────────────────────────────

/// Bound ZeroMQ PUB socket. Each message goes out as one single-frame
/// message, so plain SUB sockets subscribed to "" receive the JSON as is.
///
/// `publish` blocks on the runtime handle and must be called from outside
/// the runtime (the sampler thread).
pub struct ZmqPublisher {
    socket: PubSocket,
    runtime: Handle,
    #[cfg_attr(not(test), allow(dead_code))]
    endpoint: Endpoint,
}

impl ZmqPublisher {
    pub fn bind(endpoint: &str, runtime: Handle) -> Result<Self, PublishError> {
        let (socket, bound) = runtime
            .block_on(async {
                let mut socket = PubSocket::new();
                let bound = socket.bind(endpoint).await?;
                Ok::<_, ZmqError>((socket, bound))
            })
            .map_err(|source| PublishError::ZmqBind {
                endpoint: endpoint.to_string(),
                source,
            })?;
        info!("Publishing on {bound}");
        Ok(Self {
            socket,
            runtime,
            endpoint: bound,
        })
    }

    #[cfg(test)]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl PublishSink for ZmqPublisher {
    fn publish(&mut self, message: &str) -> Result<(), PublishError> {
        let frame = ZmqMessage::from(message.to_string());
        self.runtime
            .block_on(self.socket.send(frame))
            .map_err(PublishError::ZmqSend)
    }
}

// ──────────────────────────────────────────────
// TCP
// ──────────────────────────────────────────────

/// Bound TCP endpoint that fans each message out to connected subscribers.
///
/// Every message is one JSON line. New subscribers are picked up at publish
/// time; a subscriber whose write fails is dropped.
pub struct TcpPublisher {
    listener: TcpListener,
    subscribers: Vec<(SocketAddr, TcpStream)>,
}

impl TcpPublisher {
    pub fn bind(addr: &str) -> Result<Self, PublishError> {
        let bind_err = |source| PublishError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        info!("Publishing on tcp://{}", listener.local_addr().map_err(bind_err)?);
        Ok(Self {
            listener,
            subscribers: Vec::new(),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let setup = stream
                        .set_nonblocking(false)
                        .and_then(|()| stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT)))
                        .and_then(|()| stream.set_nodelay(true));
                    match setup {
                        Ok(()) => {
                            info!("Subscriber connected: {addr}");
                            self.subscribers.push((addr, stream));
                        }
                        Err(e) => warn!("Rejected subscriber {addr}: {e}"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    break;
                }
            }
        }
    }
}

impl PublishSink for TcpPublisher {
    fn publish(&mut self, message: &str) -> Result<(), PublishError> {
        self.accept_pending();

        let mut line = Vec::with_capacity(message.len() + 1);
        line.extend_from_slice(message.as_bytes());
        line.push(b'\n');

        self.subscribers.retain_mut(|(addr, stream)| match stream.write_all(&line) {
            Ok(()) => true,
            Err(e) => {
                info!("Subscriber {addr} dropped: {e}");
                false
            }
        });
        Ok(())
    }
}

// ──────────────────────────────────────────────
// UDP
// ──────────────────────────────────────────────

/// One datagram per message to a fixed destination.
pub struct UdpPublisher {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpPublisher {
    pub fn new(dest_addr: &str) -> Result<Self, PublishError> {
        let dest: SocketAddr = dest_addr
            .parse()
            .map_err(|_| PublishError::Address(dest_addr.to_string()))?;
        let bind_addr = if dest.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).map_err(|source| PublishError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;

        let broadcast = matches!(dest, SocketAddr::V4(v4) if v4.ip().is_broadcast());
        if broadcast {
            socket.set_broadcast(true)?;
            info!("Publishing BROADCAST → {dest}");
        } else {
            info!("Publishing UNICAST → {dest}");
        }
        Ok(Self { socket, dest })
    }
}

impl PublishSink for UdpPublisher {
    fn publish(&mut self, message: &str) -> Result<(), PublishError> {
        self.socket.send_to(message.as_bytes(), self.dest)?;
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    #[test]
    fn zmq_subscriber_receives_json_frames() {
        use zeromq::{SocketRecv, SubSocket};

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let mut publisher =
            ZmqPublisher::bind("tcp://127.0.0.1:0", runtime.handle().clone()).unwrap();
        let endpoint = publisher.endpoint().to_string();

        let mut subscriber = runtime.block_on(async {
            let mut sub = SubSocket::new();
            sub.connect(&endpoint).await.unwrap();
            sub.subscribe("").await.unwrap();
            sub
        });

        // PUB drops messages until the subscription has reached it
        for _ in 0..50 {
            publisher.publish(r#"{"mass-flow":118.3}"#).unwrap();
            let received = runtime.block_on(async {
                tokio::time::timeout(Duration::from_millis(100), subscriber.recv()).await
            });
            if let Ok(message) = received {
                let text = String::try_from(message.unwrap()).unwrap();
                assert_eq!(text, r#"{"mass-flow":118.3}"#);
                return;
            }
        }
        panic!("subscriber never received a message");
    }

    #[test]
    fn zmq_bind_failure_is_reported() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let first = ZmqPublisher::bind("tcp://127.0.0.1:0", runtime.handle().clone()).unwrap();
        let taken = first.endpoint().to_string();
        assert!(matches!(
            ZmqPublisher::bind(&taken, runtime.handle().clone()),
            Err(PublishError::ZmqBind { .. })
        ));
    }

    #[test]
    fn tcp_subscriber_receives_json_lines() {
        let mut publisher = TcpPublisher::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(publisher.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        publisher.publish(r#"{"mass-flow":1.0}"#).unwrap();
        publisher.publish(r#"{"mass-flow":2.0}"#).unwrap();
        assert_eq!(publisher.subscriber_count(), 1);

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "{\"mass-flow\":1.0}\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "{\"mass-flow\":2.0}\n");
    }

    #[test]
    fn tcp_publish_without_subscribers_is_ok() {
        let mut publisher = TcpPublisher::bind("127.0.0.1:0").unwrap();
        assert!(publisher.publish("{}").is_ok());
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn tcp_bind_failure_is_reported() {
        let first = TcpPublisher::bind("127.0.0.1:0").unwrap();
        let taken = first.local_addr().unwrap().to_string();
        assert!(matches!(
            TcpPublisher::bind(&taken),
            Err(PublishError::Bind { .. })
        ));
    }

    #[test]
    fn udp_sends_one_datagram_per_message() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let dest = receiver.local_addr().unwrap().to_string();

        let mut publisher = UdpPublisher::new(&dest).unwrap();
        publisher.publish(r#"{"gas":"N2"}"#).unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], br#"{"gas":"N2"}"#);
    }

    #[test]
    fn udp_rejects_bad_destination() {
        assert!(matches!(
            UdpPublisher::new("not-an-address"),
            Err(PublishError::Address(_))
        ));
    }
}
