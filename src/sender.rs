use std::cmp::min;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::config::ArqConfig;
use crate::error::{FailureKind, TransferError};
use crate::latency::{LatencyRecorder, LatencySummary};
use crate::packet::{is_ack, Packet};
use crate::retry::{AckWait, RetryScheduler};
use crate::sequence::SequenceBit;
use crate::socket::DatagramSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Preparing,
    AwaitingAck,
    Completed,
    Failed,
}

/// Per-transfer bookkeeping of a [Sender]. It lives exactly as long as one call to
///  [Sender::send], so concurrent senders never share progress counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub total_len: usize,
    pub bytes_acked: usize,
    pub sequence: SequenceBit,
    /// failed attempts for the packet currently in flight
    pub retry_count: u32,
    pub packets_acked: u64,
    pub retransmissions: u64,
    last_reported_percent: u64,
    packets_since_report: u32,
}

impl TransferSession {
    pub fn new(total_len: usize) -> TransferSession {
        TransferSession {
            total_len,
            bytes_acked: 0,
            sequence: SequenceBit::ZERO,
            retry_count: 0,
            packets_acked: 0,
            retransmissions: 0,
            last_reported_percent: 0,
            packets_since_report: 0,
        }
    }

    /// The next chunk to send and whether it is the last one. An empty buffer is sent as a
    ///  single empty chunk so that the receiver sees the end of the stream.
    pub fn next_chunk<'a>(&self, data: &'a [u8], max_segment: usize) -> (&'a [u8], bool) {
        let len = min(max_segment, self.total_len - self.bytes_acked);
        let end = self.bytes_acked + len;
        (&data[self.bytes_acked..end], end == self.total_len)
    }

    fn on_acked(&mut self, chunk_len: usize) {
        self.bytes_acked += chunk_len;
        self.packets_acked += 1;
        self.sequence.flip();
    }

    pub fn percent_acked(&self) -> u64 {
        if self.total_len == 0 {
            return 100;
        }
        self.bytes_acked as u64 * 100 / self.total_len as u64
    }

    /// Called once per acknowledged packet, returns the percentage to report if progress is
    ///  due. Transfers that fit into a single packet are not reported.
    pub fn progress_due(&mut self, config: &ArqConfig) -> Option<u64> {
        if self.total_len <= config.max_segment {
            return None;
        }

        self.packets_since_report += 1;
        let percent = self.percent_acked();
        if percent >= self.last_reported_percent + config.progress_percent_step as u64
            || self.packets_since_report >= config.progress_packet_step
        {
            self.last_reported_percent = percent;
            self.packets_since_report = 0;
            Some(percent)
        }
        else {
            None
        }
    }
}

/// Summary of a successful transfer
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub transfer_id: Uuid,
    pub bytes: usize,
    pub packets: u64,
    pub retransmissions: u64,
    pub latency: LatencySummary,
}

impl Display for TransferReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "transferred {} bytes in {} packets ({} retransmissions) in {:.2} ms, {:.2} KB/s",
               self.bytes,
               self.packets,
               self.retransmissions,
               self.latency.elapsed.as_secs_f64() * 1000.0,
               self.latency.throughput / 1024.0,
        )
    }
}

/// The sending side of a stop-and-wait transfer to a single peer. There is at most one packet
///  in flight at any time: the next packet is prepared only after the previous one was acked.
///
/// A sender performs a single transfer. After that it is in one of the terminal states
///  `Completed` or `Failed`, and its latency statistics remain available for inspection.
pub struct Sender {
    config: Arc<ArqConfig>,
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    scheduler: RetryScheduler,
    state: SenderState,
    latency: LatencyRecorder,
}

impl Sender {
    pub fn new(config: Arc<ArqConfig>, socket: Arc<dyn DatagramSocket>, peer: SocketAddr) -> anyhow::Result<Sender> {
        config.validate()?;

        Ok(Sender {
            scheduler: RetryScheduler::new(&config),
            config,
            socket,
            peer,
            state: SenderState::Idle,
            latency: LatencyRecorder::new(),
        })
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn latency(&self) -> &LatencyRecorder {
        &self.latency
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<TransferReport, TransferError> {
        if self.state != SenderState::Idle {
            return Err(TransferError::InvalidState(self.state));
        }

        let transfer_id = Uuid::new_v4();
        let span = span!(Level::INFO, "send", %transfer_id);

        let result = self.do_send(transfer_id, data)
            .instrument(span)
            .await;

        self.state = match &result {
            Ok(_) => SenderState::Completed,
            Err(_) => SenderState::Failed,
        };
        result
    }

    async fn do_send(&mut self, transfer_id: Uuid, data: &[u8]) -> Result<TransferReport, TransferError> {
        info!("sending {} bytes to {:?}", data.len(), self.peer);

        self.state = SenderState::Preparing;
        let mut session = TransferSession::new(data.len());
        self.latency.start_transfer();

        let mut recv_buf = vec![0u8; self.config.max_packet_len()];
        loop {
            let (chunk, is_last) = session.next_chunk(data, self.config.max_segment);
            let packet = Packet::encode(session.sequence, chunk, is_last)?;
            session.retry_count = 0;
            trace!("prepared packet {}: {} bytes, is_last={}", session.sequence, chunk.len(), is_last);

            self.state = SenderState::AwaitingAck;
            let rtt = self.transmit_until_acked(&mut session, &packet, &mut recv_buf).await?;

            self.latency.record(rtt, session.retry_count > 0);
            session.on_acked(chunk.len());
            debug!("packet acked after {:?} ({}/{} bytes)", rtt, session.bytes_acked, session.total_len);

            if let Some(percent) = session.progress_due(&self.config) {
                info!("progress: {}% ({}/{} bytes) [latency: {:.2} ms]", percent, session.bytes_acked, session.total_len, rtt.as_secs_f64() * 1000.0);
            }

            if is_last {
                break;
            }
            self.state = SenderState::Preparing;
        }

        self.latency.end_transfer(data.len());
        let report = TransferReport {
            transfer_id,
            bytes: data.len(),
            packets: session.packets_acked,
            retransmissions: session.retransmissions,
            latency: self.latency.summary(),
        };
        info!("{}", report);
        Ok(report)
    }

    /// (Re)transmits a packet until it is acked or the retry budget is exhausted, returning the
    ///  round trip time measured from the last transmission
    async fn transmit_until_acked(&self, session: &mut TransferSession, packet: &[u8], recv_buf: &mut [u8]) -> Result<Duration, TransferError> {
        loop {
            if session.retry_count > 0 {
                session.retransmissions += 1;
                info!("sending packet {} (attempt {}) [{}/{} bytes]", session.sequence, session.retry_count + 1, session.bytes_acked, session.total_len);
            }

            let sent_at = Instant::now();
            if let Err(e) = self.socket.send_to(self.peer, packet).await {
                warn!("error sending packet {}: {}", session.sequence, e);
                session.retry_count += 1;
                if self.scheduler.budget_exhausted(session.retry_count) {
                    return Err(self.retries_exhausted(session, FailureKind::Send(e.kind())));
                }

                let delay = self.scheduler.backoff_delay(session.retry_count);
                debug!("backing off for {:?}", delay);
                sleep(delay).await;
                continue;
            }

            let failure = match self.await_ack(recv_buf).await {
                Ok(()) => return Ok(sent_at.elapsed()),
                Err(failure) => failure,
            };

            match failure {
                FailureKind::AckTimeout => info!("ack timeout for packet {}, retransmitting", session.sequence),
                other => warn!("{} for packet {}, retransmitting", other, session.sequence),
            }
            session.retry_count += 1;
            if self.scheduler.budget_exhausted(session.retry_count) {
                return Err(self.retries_exhausted(session, failure));
            }
        }
    }

    /// Waits for the ack sentinel from the peer. Datagrams from other addresses are ignored
    ///  without extending the deadline.
    ///
    /// NB: The ack does not identify the packet it belongs to, so any ack from the peer is
    ///  taken to confirm the packet currently in flight, even a late ack for a previous
    ///  transmission
    async fn await_ack(&self, recv_buf: &mut [u8]) -> Result<(), FailureKind> {
        let deadline = self.scheduler.ack_deadline();
        loop {
            match self.scheduler.wait_for_ack_until(deadline, self.socket.recv_from(recv_buf)).await {
                AckWait::TimedOut => return Err(FailureKind::AckTimeout),
                AckWait::Completed(Err(e)) => {
                    warn!("error receiving ack: {}", e);
                    return Err(FailureKind::Receive(e.kind()));
                }
                AckWait::Completed(Ok((len, from))) => {
                    if from != self.peer {
                        debug!("ignoring datagram from {:?} while waiting for ack from {:?}", from, self.peer);
                        continue;
                    }
                    if is_ack(&recv_buf[..len]) {
                        return Ok(());
                    }
                    return Err(FailureKind::InvalidAck);
                }
            }
        }
    }

    fn retries_exhausted(&self, session: &TransferSession, last_failure: FailureKind) -> TransferError {
        warn!("giving up on packet {} after {} attempts at {}/{} bytes", session.sequence, session.retry_count, session.bytes_acked, session.total_len);
        TransferError::RetriesExhausted {
            sequence: session.sequence,
            retries: session.retry_count,
            last_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use super::*;
    use rstest::rstest;
    use tokio::runtime::{Builder, Runtime};
    use crate::packet::ACK_DATAGRAM;
    use crate::socket::MockDatagramSocket;
    use crate::test_util::{simulated_link, test_addr, FaultPlan, SimulatedSocket};

    fn paused_runtime() -> Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    fn decode_sent(socket: &SimulatedSocket) -> Vec<(u8, bool, usize)> {
        socket.sent_datagrams().iter()
            .map(|d| Packet::decode(d, 1024).unwrap())
            .map(|p| (p.sequence.to_wire(), p.is_last, p.payload.len()))
            .collect()
    }

    #[rstest]
    #[case::empty(0, 1024, vec![(0, true)])]
    #[case::single(10, 1024, vec![(10, true)])]
    #[case::exact(1024, 1024, vec![(1024, true)])]
    #[case::three(3000, 1024, vec![(1024, false), (1024, false), (952, true)])]
    #[case::exact_multiple(2048, 1024, vec![(1024, false), (1024, true)])]
    fn test_chunking(#[case] total_len: usize, #[case] max_segment: usize, #[case] expected: Vec<(usize, bool)>) {
        let data = vec![1u8; total_len];
        let mut session = TransferSession::new(total_len);

        let mut chunks = Vec::new();
        loop {
            let (chunk, is_last) = session.next_chunk(&data, max_segment);
            chunks.push((chunk.len(), is_last));
            session.on_acked(chunk.len());
            if is_last {
                break;
            }
        }
        assert_eq!(chunks, expected);
        assert_eq!(session.bytes_acked, total_len);
    }

    #[rstest]
    #[case::single_packet(1024, 0)]
    #[case::every_packet_is_25_percent(4096, 4)]
    #[case::percent_step(1024 * 100, 20)]
    #[case::packet_step(1024 * 1000, 100)]
    fn test_progress_due(#[case] total_len: usize, #[case] expected_reports: usize) {
        let config = ArqConfig::default();
        let data = vec![0u8; total_len];
        let mut session = TransferSession::new(total_len);

        let mut num_reports = 0;
        loop {
            let (chunk, is_last) = session.next_chunk(&data, config.max_segment);
            session.on_acked(chunk.len());
            if session.progress_due(&config).is_some() {
                num_reports += 1;
            }
            if is_last {
                break;
            }
        }
        assert_eq!(num_reports, expected_reports);
    }

    #[test]
    fn test_lossless_transfer_alternates_sequence() {
        paused_runtime().block_on(async {
            let (client, server) = simulated_link(test_addr(1), FaultPlan::reliable(), test_addr(2), FaultPlan::reliable());
            let client = Arc::new(client);

            let server = tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let mut num_packets = 0;
                while num_packets < 3 {
                    let (_, from) = server.recv_from(&mut buf).await.unwrap();
                    server.send_to(from, &ACK_DATAGRAM).await.unwrap();
                    num_packets += 1;
                }
            });

            let mut sender = Sender::new(Arc::new(ArqConfig::default()), client.clone(), test_addr(2)).unwrap();
            let report = sender.send(&vec![7u8; 3000]).await.unwrap();
            server.await.unwrap();

            assert_eq!(sender.state(), SenderState::Completed);
            assert_eq!(report.bytes, 3000);
            assert_eq!(report.packets, 3);
            assert_eq!(report.retransmissions, 0);
            assert_eq!(report.latency.count, 3);
            assert_eq!(decode_sent(&client), vec![(0, false, 1024), (1, false, 1024), (0, true, 952)]);
        });
    }

    #[test]
    fn test_always_timing_out_fails_after_max_retries() {
        paused_runtime().block_on(async {
            let (client, _server) = simulated_link(test_addr(1), FaultPlan::dropping_all(), test_addr(2), FaultPlan::reliable());
            let client = Arc::new(client);

            let mut sender = Sender::new(Arc::new(ArqConfig::default()), client.clone(), test_addr(2)).unwrap();
            let start = Instant::now();
            let result = sender.send(b"abc").await;

            match result {
                Err(TransferError::RetriesExhausted { sequence, retries, last_failure }) => {
                    assert_eq!(sequence, SequenceBit::ZERO);
                    assert_eq!(retries, 5);
                    assert_eq!(last_failure, FailureKind::AckTimeout);
                }
                other => panic!("unexpected result {:?}", other),
            }
            assert_eq!(sender.state(), SenderState::Failed);
            assert_eq!(client.sent_datagrams().len(), 5);
            assert_eq!(start.elapsed(), Duration::from_millis(5000));
        });
    }

    #[test]
    fn test_send_failures_back_off_exponentially() {
        paused_runtime().block_on(async {
            let mut num_send_calls = 0;
            let mut socket = MockDatagramSocket::new();
            socket.expect_send_to()
                .times(5)
                .returning(move |_, _| {
                    num_send_calls += 1;
                    if num_send_calls <= 4 {
                        Err(io::Error::new(io::ErrorKind::Other, "no buffer space"))
                    }
                    else {
                        Ok(())
                    }
                });
            socket.expect_recv_from()
                .times(1)
                .returning(|buf| {
                    buf[0] = 0xff;
                    Ok((1, test_addr(2)))
                });

            let mut sender = Sender::new(Arc::new(ArqConfig::default()), Arc::new(socket), test_addr(2)).unwrap();
            let start = Instant::now();
            let report = sender.send(b"abc").await.unwrap();

            assert_eq!(start.elapsed(), Duration::from_millis(100 + 200 + 400 + 800));
            assert_eq!(report.retransmissions, 4);
            assert_eq!(report.latency.retries, 1);
        });
    }

    #[test]
    fn test_send_failures_exhaust_budget() {
        paused_runtime().block_on(async {
            let mut socket = MockDatagramSocket::new();
            socket.expect_send_to()
                .times(5)
                .returning(|_, _| Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")));
            socket.expect_recv_from()
                .never();

            let mut sender = Sender::new(Arc::new(ArqConfig::default()), Arc::new(socket), test_addr(2)).unwrap();
            let start = Instant::now();
            let result = sender.send(b"abc").await;

            assert!(matches!(result, Err(TransferError::RetriesExhausted {
                retries: 5,
                last_failure: FailureKind::Send(io::ErrorKind::PermissionDenied),
                ..
            })));
            assert_eq!(start.elapsed(), Duration::from_millis(100 + 200 + 400 + 800));
        });
    }

    #[rstest]
    #[case::invalid_ack(Ok((vec![0x00], test_addr(2))), 2)]
    #[case::oversized_ack(Ok((vec![0xff, 0xff], test_addr(2))), 2)]
    #[case::receive_error(Err(io::ErrorKind::ConnectionRefused), 2)]
    #[case::foreign_address(Ok((vec![0xff], test_addr(99))), 1)]
    fn test_unexpected_first_datagram(#[case] first: Result<(Vec<u8>, SocketAddr), io::ErrorKind>, #[case] expected_transmissions: usize) {
        paused_runtime().block_on(async {
            let mut socket = MockDatagramSocket::new();
            socket.expect_send_to()
                .times(expected_transmissions)
                .returning(|_, _| Ok(()));

            let mut first = Some(first);
            socket.expect_recv_from()
                .times(2)
                .returning(move |buf| {
                    match first.take() {
                        Some(Ok((datagram, from))) => {
                            buf[..datagram.len()].copy_from_slice(&datagram);
                            Ok((datagram.len(), from))
                        }
                        Some(Err(kind)) => Err(io::Error::new(kind, "simulated")),
                        None => {
                            buf[0] = 0xff;
                            Ok((1, test_addr(2)))
                        }
                    }
                });

            let mut sender = Sender::new(Arc::new(ArqConfig::default()), Arc::new(socket), test_addr(2)).unwrap();
            let start = Instant::now();
            let report = sender.send(b"abc").await.unwrap();

            // no backoff for anything but send failures
            assert_eq!(start.elapsed(), Duration::ZERO);
            assert_eq!(report.retransmissions as usize, expected_transmissions - 1);
        });
    }

    #[test]
    fn test_rtt_is_measured_from_last_transmission() {
        paused_runtime().block_on(async {
            let (client, server) = simulated_link(test_addr(1), FaultPlan::dropping(&[0]), test_addr(2), FaultPlan::reliable());

            let server = tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let (_, from) = server.recv_from(&mut buf).await.unwrap();
                sleep(Duration::from_millis(30)).await;
                server.send_to(from, &ACK_DATAGRAM).await.unwrap();
            });

            let mut sender = Sender::new(Arc::new(ArqConfig::default()), Arc::new(client), test_addr(2)).unwrap();
            let report = sender.send(b"abc").await.unwrap();
            server.await.unwrap();

            assert_eq!(report.retransmissions, 1);
            assert_eq!(report.latency.max, Duration::from_millis(30));
            assert_eq!(report.latency.retries, 1);
            assert_eq!(report.latency.elapsed, Duration::from_millis(1030));
        });
    }

    #[test]
    fn test_second_send_is_rejected() {
        paused_runtime().block_on(async {
            let mut socket = MockDatagramSocket::new();
            socket.expect_send_to()
                .times(1)
                .returning(|_, _| Ok(()));
            socket.expect_recv_from()
                .times(1)
                .returning(|buf| {
                    buf[0] = 0xff;
                    Ok((1, test_addr(2)))
                });

            let mut sender = Sender::new(Arc::new(ArqConfig::default()), Arc::new(socket), test_addr(2)).unwrap();
            sender.send(b"").await.unwrap();

            assert!(matches!(sender.send(b"abc").await, Err(TransferError::InvalidState(SenderState::Completed))));
            assert_eq!(sender.state(), SenderState::Completed);
        });
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ArqConfig { max_retries: 0, ..Default::default() };
        assert!(Sender::new(Arc::new(config), Arc::new(MockDatagramSocket::new()), test_addr(2)).is_err());
    }
}
