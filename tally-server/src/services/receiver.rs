//! Network ingestion of statsd lines.
//!
//! [`Ingestion`] binds the configured endpoint and runs `max_readers` read loops. Read loops
//! collect datagrams (UDP) or lines (TCP) into batches and hand them to a pool of parser tasks
//! through a bounded channel. Parser tasks turn the batches into records and pass them to the
//! [`Dispatcher`].
//!
//! When a read loop cannot hand over a batch because all parsers are busy, it stops reading until
//! there is room again. Excess traffic then queues up in the kernel's socket buffer.
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use socket2::{Domain, Protocol, Socket, Type};
use tally_config::{Config, ReceiverMode};
use tally_metrics::{Event, Metric, Parser, ParserConfig, Record};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::services::dispatcher::Dispatcher;
use crate::services::stats::{PipelineStats, incr};
use crate::utils::BadLineLimiter;

/// Backlog of the TCP listener.
const TCP_LISTEN_BACKLOG: u32 = 1024;

/// A buffer of newline separated lines received from one peer.
#[derive(Clone, Debug)]
pub struct Datagram {
    /// The raw bytes.
    pub data: Bytes,
    /// Address of the peer, used to tag metrics with their host.
    pub source: IpAddr,
}

/// Parses received buffers and hands the records to the [`Dispatcher`].
#[derive(Clone, Debug)]
pub struct LineHandler {
    parser: Parser,
    dispatcher: Dispatcher,
    stats: Arc<PipelineStats>,
    limiter: Arc<BadLineLimiter>,
    log_raw_metric: bool,
}

impl LineHandler {
    /// Creates a handler from the parser configuration.
    pub fn new(config: &ParserConfig, dispatcher: Dispatcher, stats: Arc<PipelineStats>) -> Self {
        Self {
            parser: Parser::new(config),
            dispatcher,
            stats,
            limiter: Arc::new(BadLineLimiter::new(config.bad_lines_per_minute)),
            log_raw_metric: config.log_raw_metric,
        }
    }

    /// Parses all lines of a batch and dispatches the records in one go.
    ///
    /// A malformed line is counted and skipped. It never affects other lines of the batch.
    pub fn handle(&self, batch: &[Datagram]) {
        let mut metrics = Vec::new();
        let mut events = Vec::new();

        for datagram in batch {
            let source = datagram.source.to_string();
            self.parse_into(&datagram.data, &source, &mut metrics, &mut events);
        }

        incr(&self.stats.metrics_parsed, metrics.len() as u64);
        incr(&self.stats.events_parsed, events.len() as u64);
        self.dispatcher.dispatch(metrics, events);
    }

    fn parse_into(
        &self,
        data: &[u8],
        source: &str,
        metrics: &mut Vec<Metric>,
        events: &mut Vec<Event>,
    ) {
        for result in self.parser.parse_all(data, Some(source)) {
            incr(&self.stats.lines_received, 1);

            match result {
                Ok(Record::Metric(metric)) => {
                    if self.log_raw_metric {
                        tally_log::info!(metric = ?metric, "received metric");
                    }
                    metrics.push(metric);
                }
                Ok(Record::Event(event)) => events.push(event),
                Err(error) => {
                    self.stats.bad_line(error.kind());
                    if self.limiter.check() {
                        tally_log::warn!(
                            error = &error as &dyn std::error::Error,
                            source,
                            "dropped malformed line"
                        );
                    }
                }
            }
        }
    }
}

/// Limits and counters shared by all read loops.
#[derive(Debug)]
struct ReadState {
    batch_size: usize,
    max_packet_size: usize,
    max_line_length: usize,
    stats: Arc<PipelineStats>,
}

impl ReadState {
    /// Adds a received datagram to the batch, unless it was truncated.
    fn push(&self, batch: &mut Vec<Datagram>, data: &[u8], peer: SocketAddr) {
        incr(&self.stats.packets_received, 1);
        incr(&self.stats.bytes_received, data.len() as u64);

        // The buffer has room for one byte more than the limit, so a longer datagram is cut off.
        if data.len() > self.max_packet_size {
            incr(&self.stats.truncated, 1);
            return;
        }

        batch.push(Datagram {
            data: Bytes::copy_from_slice(data),
            source: peer.ip(),
        });
    }

    fn read_error(&self, error: &io::Error) {
        if matches!(
            error.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
        ) {
            return;
        }

        incr(&self.stats.read_errors, 1);
        tally_log::warn!(
            error = error as &dyn std::error::Error,
            "failed to read from socket"
        );
    }
}

/// The running read loops and parser tasks.
#[derive(Debug)]
pub struct Ingestion {
    local_addr: SocketAddr,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Ingestion {
    /// Binds the configured endpoint and spawns the read loops and parser tasks.
    ///
    /// Must be called from within a tokio runtime. The tasks run until `token` is cancelled.
    pub fn start(
        config: &Config,
        handler: LineHandler,
        token: CancellationToken,
    ) -> io::Result<Self> {
        let bind = config.bind_addr();
        let readers = config.max_readers().max(1);

        let endpoint = match config.receiver_mode() {
            ReceiverMode::Udp => Endpoint::Udp(bind_udp_sockets(
                bind,
                readers,
                config.conn_per_reader(),
            )?),
            ReceiverMode::Tcp => Endpoint::Tcp(bind_tcp(bind)?),
        };
        let local_addr = endpoint.local_addr()?;

        let state = Arc::new(ReadState {
            batch_size: config.receive_batch_size().max(1),
            max_packet_size: config.max_packet_size().max(1),
            max_line_length: config.max_line_length().max(1),
            stats: handler.stats.clone(),
        });

        let tracker = TaskTracker::new();
        let (tx, rx) = flume::bounded(config.parser_queue_size().max(1));

        for _ in 0..config.max_parsers().max(1) {
            tracker.spawn(parse_batches(rx.clone(), handler.clone()));
        }

        match endpoint {
            Endpoint::Udp(sockets) => {
                for socket in sockets {
                    tracker.spawn(read_datagrams(
                        socket,
                        tx.clone(),
                        state.clone(),
                        token.clone(),
                    ));
                }
            }
            Endpoint::Tcp(listener) => {
                tracker.spawn(accept_connections(
                    listener,
                    tx,
                    state,
                    tracker.clone(),
                    token.clone(),
                ));
            }
        }

        tracker.close();

        tally_log::info!(
            mode = %config.receiver_mode(),
            readers,
            "listening on {local_addr}"
        );

        Ok(Self {
            local_addr,
            tracker,
            token,
        })
    }

    /// Returns the address the receiver is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops reading and waits until all received batches have been parsed and dispatched.
    pub async fn stop(self) {
        self.token.cancel();
        self.tracker.wait().await;
        tally_log::debug!("ingestion stopped");
    }
}

enum Endpoint {
    Udp(Vec<Arc<UdpSocket>>),
    Tcp(TcpListener),
}

impl Endpoint {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Udp(sockets) => match sockets.first() {
                Some(socket) => socket.local_addr(),
                None => Err(io::ErrorKind::AddrNotAvailable.into()),
            },
            Self::Tcp(listener) => listener.local_addr(),
        }
    }
}

fn bind_udp(addr: SocketAddr, reuse_port: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if reuse_port {
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Binds one socket shared by all readers, or one socket per reader with `SO_REUSEPORT`.
fn bind_udp_sockets(
    addr: SocketAddr,
    readers: usize,
    per_reader: bool,
) -> io::Result<Vec<Arc<UdpSocket>>> {
    if !per_reader {
        let socket = Arc::new(bind_udp(addr, false)?);
        return Ok(vec![socket; readers]);
    }

    // Resolve an ephemeral port once, so all sockets share the same port.
    let first = bind_udp(addr, true)?;
    let addr = first.local_addr()?;

    let mut sockets = vec![Arc::new(first)];
    for _ in 1..readers {
        sockets.push(Arc::new(bind_udp(addr, true)?));
    }
    Ok(sockets)
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(TCP_LISTEN_BACKLOG)
}

async fn parse_batches(rx: flume::Receiver<Vec<Datagram>>, handler: LineHandler) {
    while let Ok(batch) = rx.recv_async().await {
        handler.handle(&batch);
    }
}

async fn read_datagrams(
    socket: Arc<UdpSocket>,
    tx: flume::Sender<Vec<Datagram>>,
    state: Arc<ReadState>,
    token: CancellationToken,
) {
    let mut buf = vec![0; state.max_packet_size + 1];

    loop {
        let received = tokio::select! {
            biased;

            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let mut batch = Vec::with_capacity(state.batch_size);
        match received {
            Ok((len, peer)) => state.push(&mut batch, &buf[..len], peer),
            Err(error) => {
                state.read_error(&error);
                continue;
            }
        }

        // Drain what is already buffered without waiting for more.
        for _ in 1..state.batch_size {
            match socket.try_recv_from(&mut buf) {
                Ok((len, peer)) => state.push(&mut batch, &buf[..len], peer),
                Err(error) => {
                    state.read_error(&error);
                    break;
                }
            }
        }

        if !batch.is_empty() && tx.send_async(batch).await.is_err() {
            break;
        }
    }
}

async fn accept_connections(
    listener: TcpListener,
    tx: flume::Sender<Vec<Datagram>>,
    state: Arc<ReadState>,
    tracker: TaskTracker,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;

            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tally_log::trace!(peer = %peer, "accepted connection");
                tracker.spawn(read_lines(
                    stream,
                    peer.ip(),
                    tx.clone(),
                    state.clone(),
                    token.clone(),
                ));
            }
            Err(error) => state.read_error(&error),
        }
    }
}

/// A line exceeded the maximum line length and was skipped.
#[derive(Debug)]
struct LineTooLong;

/// Decodes newline delimited lines as raw bytes.
///
/// Lines are not validated as UTF-8 here. The parser reports invalid lines individually, so a
/// malformed line never ends the connection. An over-long line is reported as an item and
/// decoding continues with the next line, instead of terminating the stream.
struct LineDecoder(AnyDelimiterCodec);

impl LineDecoder {
    fn new(max_length: usize) -> Self {
        Self(AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            max_length,
        ))
    }

    fn map(
        result: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> io::Result<Option<Result<Bytes, LineTooLong>>> {
        match result {
            Ok(line) => Ok(line.map(Ok)),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(Err(LineTooLong))),
            Err(AnyDelimiterCodecError::Io(error)) => Err(error),
        }
    }
}

impl Decoder for LineDecoder {
    type Item = Result<Bytes, LineTooLong>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::map(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::map(self.0.decode_eof(src))
    }
}

async fn read_lines(
    stream: TcpStream,
    source: IpAddr,
    tx: flume::Sender<Vec<Datagram>>,
    state: Arc<ReadState>,
    token: CancellationToken,
) {
    let decoder = LineDecoder::new(state.max_line_length);
    let mut chunks = FramedRead::new(stream, decoder).ready_chunks(state.batch_size);

    loop {
        let chunk = tokio::select! {
            biased;

            _ = token.cancelled() => break,
            chunk = chunks.next() => chunk,
        };

        let Some(chunk) = chunk else {
            break;
        };

        let mut batch = Vec::with_capacity(chunk.len());
        let mut failed = false;

        for line in chunk {
            match line {
                Ok(Ok(line)) => {
                    incr(&state.stats.packets_received, 1);
                    incr(&state.stats.bytes_received, line.len() as u64 + 1);
                    batch.push(Datagram { data: line, source });
                }
                Ok(Err(LineTooLong)) => incr(&state.stats.truncated, 1),
                Err(error) => {
                    state.read_error(&error);
                    failed = true;
                }
            }
        }

        if !batch.is_empty() && tx.send_async(batch).await.is_err() {
            break;
        }
        if failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tally_metrics::{KeyedMetric, MetricValue};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::services::dispatcher::{WorkerBatch, worker_queues};

    fn config(mode: &str, extra: serde_json::Value) -> Config {
        let mut value = serde_json::json!({
            "receiver": {
                "mode": mode,
                "bind": "127.0.0.1:0",
                "max_readers": 2,
                "max_parsers": 1,
                "max_packet_size": 64,
                "max_line_length": 32,
            },
        });
        if let (Some(receiver), Some(extra)) = (value["receiver"].as_object_mut(), extra.as_object())
        {
            receiver.extend(extra.clone());
        }
        Config::from_json_value(value).unwrap()
    }

    fn start(
        config: &Config,
    ) -> (Ingestion, mpsc::Receiver<WorkerBatch>, Arc<PipelineStats>) {
        start_with_queue(config, 100)
    }

    fn start_with_queue(
        config: &Config,
        queue_size: usize,
    ) -> (Ingestion, mpsc::Receiver<WorkerBatch>, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::default());
        let (queues, mut receivers) = worker_queues(1, queue_size);
        let dispatcher = Dispatcher::new(queues, None, stats.clone());
        let handler = LineHandler::new(config.parser(), dispatcher, stats.clone());
        let ingestion = Ingestion::start(config, handler, CancellationToken::new()).unwrap();
        (ingestion, receivers.remove(0), stats)
    }

    async fn next_metrics(rx: &mut mpsc::Receiver<WorkerBatch>) -> Vec<KeyedMetric> {
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        batch.metrics
    }

    #[test]
    fn test_line_handler_skips_bad_lines() {
        let stats = Arc::new(PipelineStats::default());
        let (queues, mut receivers) = worker_queues(1, 10);
        let dispatcher = Dispatcher::new(queues, None, stats.clone());
        let handler = LineHandler::new(&ParserConfig::default(), dispatcher, stats.clone());

        handler.handle(&[Datagram {
            data: Bytes::from_static(b"foo.bar:1|c\nnot-a-metric\nfoo.bar:1|c\n"),
            source: IpAddr::from([10, 0, 0, 1]),
        }]);

        let batch = receivers[0].try_recv().unwrap();
        assert_eq!(batch.metrics.len(), 2);
        assert_eq!(batch.metrics[0].key.tags().get("host"), Some("10.0.0.1"));

        let taken = stats.take();
        assert_eq!(taken.lines_received, 3);
        assert_eq!(taken.metrics_parsed, 2);
        assert_eq!(taken.bad_lines, vec![("missing_value", 1)]);
    }

    #[tokio::test]
    async fn test_udp_receive() {
        tally_test::setup();
        let config = config("udp", serde_json::json!({}));
        let (ingestion, mut rx, stats) = start(&config);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(b"foo.bar:1|c\nfoo.gauge:5|g", ingestion.local_addr())
            .unwrap();

        let mut metrics = next_metrics(&mut rx).await;
        metrics.sort_by(|a, b| a.key.name().cmp(b.key.name()));
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].key.name(), "foo.bar");
        assert_eq!(metrics[1].value, MetricValue::Gauge(5.0));

        ingestion.stop().await;
        let taken = stats.take();
        assert_eq!(taken.packets_received, 1);
        assert_eq!(taken.bytes_received, 25);
    }

    #[tokio::test]
    async fn test_udp_truncated() {
        tally_test::setup();
        let config = config("udp", serde_json::json!({}));
        let (ingestion, mut rx, stats) = start(&config);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let oversized = format!("foo:1|c|#{}", "a".repeat(100));
        client
            .send_to(oversized.as_bytes(), ingestion.local_addr())
            .unwrap();
        client.send_to(b"bar:1|c", ingestion.local_addr()).unwrap();

        let metrics = next_metrics(&mut rx).await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].key.name(), "bar");

        ingestion.stop().await;
        assert_eq!(stats.take().truncated, 1);
    }

    #[tokio::test]
    async fn test_udp_datagram_at_size_limit() {
        tally_test::setup();
        let config = config("udp", serde_json::json!({}));
        let (ingestion, mut rx, stats) = start(&config);

        // Exactly `max_packet_size` bytes.
        let datagram = format!("foo:1|c|#{}", "a".repeat(55));
        assert_eq!(datagram.len(), 64);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(datagram.as_bytes(), ingestion.local_addr())
            .unwrap();

        let metrics = next_metrics(&mut rx).await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].key.name(), "foo");

        ingestion.stop().await;
        assert_eq!(stats.take().truncated, 0);
    }

    #[tokio::test]
    async fn test_udp_keeps_reading_on_full_queue() {
        tally_test::setup();
        let config = config("udp", serde_json::json!({ "max_readers": 1 }));
        // Nothing consumes the worker queue, so it is full after the first batch.
        let (ingestion, _rx, stats) = start_with_queue(&config, 1);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut received = 0;
        let mut dropped = 0;

        for round in 0..3 {
            for _ in 0..10 {
                client.send_to(b"foo:1|c", ingestion.local_addr()).unwrap();
            }

            // Drops are counted by the parser task, possibly after the packets were read.
            let mut taken = stats.take();
            for _ in 0..100 {
                let settled = round == 0 || dropped + taken.metrics_dropped > 0;
                if taken.packets_received >= 10 && settled {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                let more = stats.take();
                taken.packets_received += more.packets_received;
                taken.metrics_dropped += more.metrics_dropped;
            }

            assert_eq!(taken.packets_received, 10, "round {round}");
            received += taken.packets_received;
            dropped += taken.metrics_dropped;
            if round > 0 {
                assert!(dropped > 0, "round {round}");
            }
        }

        assert_eq!(received, 30);
        ingestion.stop().await;
    }

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    #[tokio::test]
    async fn test_udp_socket_per_reader() {
        tally_test::setup();
        let config = config("udp", serde_json::json!({ "conn_per_reader": true }));
        let (ingestion, mut rx, _stats) = start(&config);
        assert_ne!(ingestion.local_addr().port(), 0);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"foo:1|c", ingestion.local_addr()).unwrap();

        let metrics = next_metrics(&mut rx).await;
        assert_eq!(metrics.len(), 1);
        ingestion.stop().await;
    }

    #[tokio::test]
    async fn test_tcp_lines() {
        tally_test::setup();
        let config = config("tcp", serde_json::json!({}));
        let (ingestion, mut rx, stats) = start(&config);

        let mut stream = TcpStream::connect(ingestion.local_addr()).await.unwrap();
        let long = format!("foo:1|c|#{}\n", "a".repeat(64));
        stream.write_all(long.as_bytes()).await.unwrap();
        stream.write_all(b"foo.bar:1|c\r\nfoo.bar:2|c\n").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        let mut received = Vec::new();
        while received.len() < 2 {
            received.extend(next_metrics(&mut rx).await);
        }
        assert!(received.iter().all(|metric| metric.key.name() == "foo.bar"));

        ingestion.stop().await;
        let taken = stats.take();
        assert_eq!(taken.truncated, 1);
        assert_eq!(taken.packets_received, 2);
    }

    #[tokio::test]
    async fn test_tcp_invalid_utf8_line() {
        tally_test::setup();
        let config = config("tcp", serde_json::json!({}));
        let (ingestion, mut rx, stats) = start(&config);

        let mut stream = TcpStream::connect(ingestion.local_addr()).await.unwrap();
        stream.write_all(b"a:1|c\n").await.unwrap();
        stream.write_all(b"\xff\xfe:1|c\n").await.unwrap();
        stream.write_all(b"b:1|c\n").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        let mut names = Vec::new();
        while names.len() < 2 {
            names.extend(
                next_metrics(&mut rx)
                    .await
                    .into_iter()
                    .map(|metric| metric.key.name().to_owned()),
            );
        }
        assert_eq!(names, vec!["a", "b"]);

        ingestion.stop().await;
        let taken = stats.take();
        assert_eq!(taken.read_errors, 0);
        assert_eq!(taken.bad_lines, vec![("invalid_utf8", 1)]);
    }

    #[tokio::test]
    async fn test_stop_drains_parsers() {
        tally_test::setup();
        let config = config("udp", serde_json::json!({ "max_readers": 1 }));
        let (ingestion, mut rx, _stats) = start(&config);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"foo:1|c", ingestion.local_addr()).unwrap();
        let _ = next_metrics(&mut rx).await;

        // All tasks have finished and released their dispatchers.
        ingestion.stop().await;
        assert!(rx.recv().await.is_none());
    }
}
