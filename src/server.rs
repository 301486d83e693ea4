//! The UDP server: accepts queries, feeds the query-log side-channel, and
//! proxies resolution to the configured upstreams.

use crate::clients::UdpClient;
use crate::config::Config;
use crate::errors::Error;
use crate::pool::BackendPool;
use crate::qlog::{self, QueryInfo, QueryLog};
use crate::stats::{Counters, Dumper};
use crate::subnet;
use crate::types::{Message, Rcode, QR};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Implements the DNS proxy. Owns the backend pools, the query-log grid
/// and the counters; [`Server::run`] brings up the long-lived tasks and
/// serves until SIGINT or SIGTERM.
pub struct Server {
    config: Config,
    handler: Arc<Handler>,
    pools: Vec<Arc<BackendPool>>,
    receivers: Vec<Vec<mpsc::Receiver<QueryInfo>>>,
    listener: Option<Arc<UdpSocket>>,
}

/// The per-datagram state, shared by every handler task.
struct Handler {
    upstreams: Vec<SocketAddr>,
    counters: Arc<Counters>,
    qlog: QueryLog,
    client: UdpClient,
}

impl Server {
    /// Creates a new Server with the given configuration, constructing the
    /// backend pools and the query-log grid. Nothing is bound or spawned
    /// yet.
    pub fn new(mut config: Config) -> Result<Server, Error> {
        config.validate()?;

        let upstreams = config
            .name_servers
            .iter()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| Error::Config(format!("name server '{}': {}", addr, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let connect_timeout = Duration::from_millis(config.connect_timeout);
        let read_timeout = Duration::from_millis(config.read_timeout);

        let pools = config
            .backend_addrs()
            .iter()
            .map(|addr| {
                BackendPool::new(addr, config.pool_num, connect_timeout, read_timeout)
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let counters = Arc::new(Counters::new());
        let (qlog, receivers) = QueryLog::new(pools.len(), config.chan_num, counters.clone());

        Ok(Server {
            config,
            handler: Arc::new(Handler {
                upstreams,
                counters,
                qlog,
                client: UdpClient::default(),
            }),
            pools,
            receivers,
            listener: None,
        })
    }

    /// The counters shared with the handlers and the stats dumper.
    pub fn counters(&self) -> Arc<Counters> {
        self.handler.counters.clone()
    }

    /// The resolved upstream addresses, in fallback order.
    pub fn upstreams(&self) -> &[SocketAddr] {
        &self.handler.upstreams
    }

    /// Binds the UDP listener and returns the bound address. Useful ahead
    /// of [`Server::run`] when listening on an ephemeral port.
    pub async fn bind(&mut self) -> Result<SocketAddr, Error> {
        let socket = UdpSocket::bind(self.config.listen.as_str()).await?;
        let addr = socket.local_addr()?;

        self.listener = Some(Arc::new(socket));
        Ok(addr)
    }

    /// Runs the server: spawns the log workers and the stats dumper, then
    /// serves datagrams until SIGINT or SIGTERM.
    ///
    /// On shutdown the listener and the ticker stop, in-flight handlers
    /// drain under their own timeouts, and the workers are left to run
    /// until process exit; whatever backlog they hold is dropped with it.
    pub async fn run(mut self) -> Result<(), Error> {
        let socket = match self.listener.take() {
            Some(socket) => socket,
            None => Arc::new(UdpSocket::bind(self.config.listen.as_str()).await?),
        };

        for (b, row) in self.receivers.drain(..).enumerate() {
            for (c, rx) in row.into_iter().enumerate() {
                tokio::spawn(qlog::run_worker(
                    b,
                    c,
                    rx,
                    self.pools[b].clone(),
                    self.config.expires_in,
                ));
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dumper = Dumper::new(
            self.handler.counters.clone(),
            self.config.stats_period,
            self.config.stats_file.clone().map(PathBuf::from),
        );
        tokio::spawn(dumper.run(shutdown_rx));

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let local = socket.local_addr()?;
        if self.handler.upstreams.is_empty() {
            info!("listening on {} with pid {}", local, std::process::id());
        } else {
            info!(
                "listening on {} with pid {}, proxying to {:?}",
                local,
                std::process::id(),
                self.handler.upstreams
            );
        }

        let mut handlers = JoinSet::new();
        let mut buf = vec![0_u8; 65535];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let datagram = buf[..len].to_vec();
                            let handler = self.handler.clone();
                            let socket = socket.clone();

                            handlers.spawn(async move {
                                handler.handle(socket, datagram, peer).await;
                            });

                            // Reap whatever already finished, keeping the set small.
                            while handlers.try_join_next().is_some() {}
                        }
                        Err(err) => warn!("failed to receive datagram: {}", err),
                    }
                }
                _ = sigint.recv() => {
                    info!("shutting down by signal <SIGINT>");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("shutting down by signal <SIGTERM>");
                    break;
                }
            }
        }

        // Stop the ticker, then let in-flight handlers finish under their
        // own timeouts.
        let _ = shutdown_tx.send(true);
        while handlers.join_next().await.is_some() {}

        Ok(())
    }
}

impl Handler {
    async fn handle(&self, socket: Arc<UdpSocket>, datagram: Vec<u8>, peer: SocketAddr) {
        if let Some(reply) = self.process(&datagram, peer).await {
            if let Err(err) = socket.send_to(&reply, peer).await {
                warn!("failed to send response to {}: {}", peer, err);
            }
        }
    }

    /// The per-query pipeline: guards, subnet injection, side-channel
    /// enqueue, accounting, upstream fallback, subnet strip.
    async fn process(&self, datagram: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let mut query = match Message::from_slice(datagram) {
            Ok(m) => m,
            Err(err) => {
                warn!("malformed query from {}: {}", peer, err);
                return servfail_header(datagram);
            }
        };

        // Without an upstream to ask, or a question to ask it, fail the
        // query outright.
        if self.upstreams.is_empty() || query.questions.is_empty() {
            return encode_reply(servfail(&query));
        }

        // Inject the client's subnet only when the client sent none; a
        // client-supplied option passes through in both directions.
        let had_subnet = subnet::get_subnet(&query).is_some();
        if !had_subnet {
            subnet::set_subnet(&mut query, peer.ip());
        }

        let name = query.questions[0].name.as_str();
        let key = name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase();

        self.qlog.enqueue(key, peer);
        self.counters.incr_queries();

        let request = if had_subnet {
            // Nothing was rewritten; forward the client's own bytes.
            datagram.to_vec()
        } else {
            match query.to_vec() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("failed to re-encode query from {}: {}", peer, err);
                    return encode_reply(servfail(&query));
                }
            }
        };

        for upstream in &self.upstreams {
            let response = match self.client.exchange(&request, *upstream).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!("upstream {} failed: {}", upstream, err);
                    continue;
                }
            };

            if had_subnet {
                return Some(response);
            }

            return Some(strip_subnet(response));
        }

        encode_reply(servfail(&query))
    }
}

/// Encodes a reply for the client, or nothing when encoding fails (the
/// client times out instead of receiving garbage).
fn encode_reply(reply: Message) -> Option<Vec<u8>> {
    match reply.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!("failed to encode reply: {}", err);
            None
        }
    }
}

/// Removes the subnet option the proxy injected from an upstream response,
/// re-encoding the message only when there was one to remove. A response
/// the codec can't parse is passed through as-is rather than lost.
fn strip_subnet(bytes: Vec<u8>) -> Vec<u8> {
    let mut response = match Message::from_slice(&bytes) {
        Ok(m) => m,
        Err(err) => {
            debug!("passing through unparseable upstream response: {}", err);
            return bytes;
        }
    };

    if !subnet::remove_subnet(&mut response) {
        return bytes;
    }

    match response.to_vec() {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!("failed to re-encode stripped response: {}", err);
            bytes
        }
    }
}

/// A SERVFAIL response echoing the query's id and questions.
fn servfail(query: &Message) -> Message {
    Message {
        id: query.id,
        qr: QR::Response,
        opcode: query.opcode,
        rd: query.rd,
        ad: false,
        rcode: Rcode::ServFail,
        questions: query.questions.clone(),
        ..Default::default()
    }
}

/// A bare-header SERVFAIL for a datagram that didn't parse: echo the id and
/// opcode bits when present, with every section empty. Anything shorter
/// than an id is dropped.
fn servfail_header(datagram: &[u8]) -> Option<Vec<u8>> {
    if datagram.len() < 2 {
        return None;
    }

    let mut header = vec![0_u8; 12];
    header[0] = datagram[0];
    header[1] = datagram[1];

    let flags = datagram.get(2).copied().unwrap_or(0);
    header[2] = 0b1000_0000 | (flags & 0b0111_1001); // QR set, opcode and RD kept
    header[3] = Rcode::ServFail as u8;

    Some(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Class, Type};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_servfail_echoes_the_question() {
        let mut query = Message::default();
        query.add_question("example.com", Type::A, Class::Internet);

        let reply = servfail(&query);

        assert_eq!(reply.id, query.id);
        assert_eq!(reply.qr, QR::Response);
        assert_eq!(reply.rcode, Rcode::ServFail);
        assert_eq!(reply.questions, query.questions);
        assert_eq!(reply.answers, vec![]);
    }

    #[test]
    fn test_servfail_header() {
        // A truncated query: id 0xbeef, RD flag set, then garbage.
        let reply = servfail_header(&[0xbe, 0xef, 0x01, 0x00, 0xff]).unwrap();

        let parsed = Message::from_slice(&reply).expect("reply must parse");
        assert_eq!(parsed.id, 0xbeef);
        assert_eq!(parsed.qr, QR::Response);
        assert!(parsed.rd);
        assert_eq!(parsed.rcode, Rcode::ServFail);
        assert_eq!(parsed.questions, vec![]);

        assert_eq!(servfail_header(&[0xbe]), None);
    }

    #[test]
    fn test_strip_subnet_round_trip() {
        // A response carrying the injected option loses it.
        let mut response = Message {
            qr: QR::Response,
            ..Default::default()
        };
        response.add_question("example.com", Type::A, Class::Internet);
        subnet::set_subnet(&mut response, "203.0.113.7".parse().unwrap());

        let stripped = strip_subnet(response.to_vec().unwrap());
        let parsed = Message::from_slice(&stripped).unwrap();

        assert_eq!(subnet::get_subnet(&parsed), None);
        assert!(parsed.extension.is_some());
    }

    #[test]
    fn test_strip_subnet_passes_through_untouched_bytes() {
        // No subnet option: the exact input bytes come back.
        let mut response = Message {
            qr: QR::Response,
            ..Default::default()
        };
        response.add_question("example.com", Type::A, Class::Internet);

        let bytes = response.to_vec().unwrap();
        assert_eq!(strip_subnet(bytes.clone()), bytes);

        // Unparseable bytes also come back as-is.
        let garbage = vec![0xff; 5];
        assert_eq!(strip_subnet(garbage.clone()), garbage);
    }
}
