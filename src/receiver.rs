use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::config::ArqConfig;
use crate::error::TransferError;
use crate::latency::{Histogram, LatencyRecorder, LatencySummary};
use crate::packet::{CodecError, Packet, ACK_DATAGRAM};
use crate::sequence::SequenceBit;
use crate::socket::DatagramSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    WaitingPacket,
    Done,
}

/// What the receiver made of a single datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// not a packet at all - dropped without ack
    Malformed(CodecError),
    /// structurally valid, but the payload does not match its checksum
    Corrupt { sequence: SequenceBit, checksum: u32, calculated: u32 },
    /// a valid packet with the wrong sequence bit, typically a retransmission after a lost ack
    Duplicate { sequence: SequenceBit, expected: SequenceBit },
    Accepted {
        sequence: SequenceBit,
        len: usize,
        is_last: bool,
        /// the reassembled data if this packet completed the stream
        completed: Option<Bytes>,
    },
}

impl DatagramOutcome {
    /// NB: Corrupt packets and duplicates are acked as well. The ack carries no sequence
    ///  number, so the sender takes it as confirmation of whatever it sent last.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, DatagramOutcome::Malformed(_))
    }
}

/// The final packet of a completed stream, remembered for a while so that a retransmission
///  (after its ack was lost) is not mistaken for the start of a new stream
#[derive(Debug, Clone, Copy)]
struct CompletedPacket {
    sequence: SequenceBit,
    checksum: u32,
    len: usize,
    at: Instant,
}

/// The receiver's state machine without any I/O: It consumes raw datagrams and reassembles
///  the payload of consecutive packets in order.
pub struct Reassembly {
    max_segment: usize,
    state: ReceiverState,
    expected: SequenceBit,
    buffer: BytesMut,
    completed: Option<CompletedPacket>,
    completion_linger: Duration,
}

impl Reassembly {
    pub fn new(config: &ArqConfig) -> Reassembly {
        Reassembly {
            max_segment: config.max_segment,
            state: ReceiverState::Idle,
            expected: SequenceBit::ZERO,
            buffer: BytesMut::new(),
            completed: None,
            // the sender retransmits its final packet for at most this long
            completion_linger: config.ack_timeout.saturating_mul(config.max_retries),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn expected(&self) -> SequenceBit {
        self.expected
    }

    /// number of bytes reassembled so far for the current stream
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn on_datagram(&mut self, datagram: &[u8]) -> DatagramOutcome {
        self.on_datagram_at(datagram, Instant::now())
    }

    pub fn on_datagram_at(&mut self, datagram: &[u8], now: Instant) -> DatagramOutcome {
        let packet = match Packet::decode(datagram, self.max_segment) {
            Ok(packet) => packet,
            Err(e) => return DatagramOutcome::Malformed(e),
        };

        if self.completed.is_some_and(|c| now.saturating_duration_since(c.at) >= self.completion_linger) {
            self.completed = None;
        }
        if self.is_retransmitted_final_packet(&packet) {
            return DatagramOutcome::Duplicate { sequence: packet.sequence, expected: self.expected };
        }
        // NB: the final packet stays remembered until its linger expires or a new stream
        //  accepts a packet. Stale or corrupt packets leave it alone.
        if self.completed.is_none() {
            self.state = ReceiverState::WaitingPacket;
        }

        if !packet.verify() {
            return DatagramOutcome::Corrupt {
                sequence: packet.sequence,
                checksum: packet.checksum,
                calculated: crate::packet::checksum(&packet.payload),
            };
        }
        if packet.sequence != self.expected {
            return DatagramOutcome::Duplicate { sequence: packet.sequence, expected: self.expected };
        }

        self.completed = None;
        self.state = ReceiverState::WaitingPacket;
        self.buffer.extend_from_slice(&packet.payload);
        self.expected.flip();

        let completed = if packet.is_last {
            self.state = ReceiverState::Done;
            self.expected = SequenceBit::ZERO;
            self.completed = Some(CompletedPacket {
                sequence: packet.sequence,
                checksum: packet.checksum,
                len: packet.payload.len(),
                at: now,
            });
            Some(self.buffer.split().freeze())
        }
        else {
            None
        };

        DatagramOutcome::Accepted {
            sequence: packet.sequence,
            len: packet.payload.len(),
            is_last: packet.is_last,
            completed,
        }
    }

    fn is_retransmitted_final_packet(&self, packet: &Packet) -> bool {
        match &self.completed {
            Some(c) => {
                c.sequence == packet.sequence
                    && c.checksum == packet.checksum
                    && c.len == packet.payload.len()
                    && packet.is_last
            }
            None => false,
        }
    }
}

/// A completely received stream
#[derive(Debug, Clone)]
pub struct ReceivedTransfer {
    pub transfer_id: Uuid,
    pub from: SocketAddr,
    pub data: Bytes,
    pub latency: LatencySummary,
    pub histogram: Option<Histogram>,
}

/// Application callback for completed transfers. A failing sink aborts the receiver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransferSink: Send + Sync {
    async fn on_transfer_complete(&self, transfer: &ReceivedTransfer) -> anyhow::Result<()>;
}

/// The I/O driver for a [Reassembly]: receives datagrams, acks them, and hands out completed
///  transfers.
pub struct Receiver {
    config: Arc<ArqConfig>,
    socket: Arc<dyn DatagramSocket>,
    reassembly: Reassembly,
    latency: LatencyRecorder,
}

impl Receiver {
    pub fn new(config: Arc<ArqConfig>, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<Receiver> {
        config.validate()?;

        Ok(Receiver {
            reassembly: Reassembly::new(&config),
            config,
            socket,
            latency: LatencyRecorder::new(),
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.reassembly.state()
    }

    /// Receives until a stream is complete
    pub async fn receive_transfer(&mut self) -> Result<ReceivedTransfer, TransferError> {
        let transfer_id = Uuid::new_v4();
        let span = span!(Level::INFO, "receive", %transfer_id);
        self.do_receive_transfer(transfer_id)
            .instrument(span)
            .await
    }

    /// Receives and delivers transfers until the sink or the socket fails
    pub async fn run(&mut self, sink: &dyn TransferSink) -> Result<(), TransferError> {
        info!("waiting for data on {:?}", self.socket.local_addr());
        loop {
            let transfer = self.receive_transfer().await?;
            if let Err(e) = sink.on_transfer_complete(&transfer).await {
                error!("failed to deliver transfer {}: {:#}", transfer.transfer_id, e);
                return Err(TransferError::Resource(e));
            }
        }
    }

    async fn do_receive_transfer(&mut self, transfer_id: Uuid) -> Result<ReceivedTransfer, TransferError> {
        let mut buf = vec![0u8; self.config.max_packet_len()];
        let mut consecutive_errors = 0u32;
        let mut started = false;

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => {
                    consecutive_errors = 0;
                    x
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!("socket error: {}", e);
                    if consecutive_errors >= self.config.max_consecutive_receive_errors {
                        return Err(TransferError::ReceiveFailed { consecutive_errors, source: e });
                    }
                    continue;
                }
            };
            let received_at = Instant::now();

            let outcome = self.reassembly.on_datagram_at(&buf[..len], received_at);
            // leftovers of the previous stream do not start the clock
            if !started && matches!(outcome, DatagramOutcome::Accepted { .. } | DatagramOutcome::Corrupt { .. }) {
                started = true;
                self.latency = LatencyRecorder::new();
                self.latency.start_transfer_at(received_at);
            }
            Self::log_outcome(&outcome, from, self.reassembly.buffered_len());

            if outcome.requires_ack() {
                if let Err(e) = self.socket.send_to(from, &ACK_DATAGRAM).await {
                    // the sender will time out and retransmit
                    warn!("error sending ack to {:?}: {}", from, e);
                }
            }
            if started {
                self.latency.record(received_at.elapsed(), false);
            }

            if let DatagramOutcome::Accepted { completed: Some(data), .. } = outcome {
                self.latency.end_transfer(data.len());
                let transfer = ReceivedTransfer {
                    transfer_id,
                    from,
                    latency: self.latency.summary(),
                    histogram: self.histogram(),
                    data,
                };
                info!("received {} bytes from {:?}", transfer.data.len(), from);
                return Ok(transfer);
            }
        }
    }

    fn histogram(&self) -> Option<Histogram> {
        if self.latency.len() > self.config.histogram_min_samples {
            self.latency.histogram(self.config.histogram_bins)
        }
        else {
            None
        }
    }

    fn log_outcome(outcome: &DatagramOutcome, from: SocketAddr, buffered_len: usize) {
        match outcome {
            DatagramOutcome::Malformed(e) => debug!("dropping malformed datagram from {:?}: {}", from, e),
            DatagramOutcome::Corrupt { sequence, checksum, calculated } =>
                warn!("checksum mismatch for packet {} from {:?}: expected={:08x}, calculated={:08x}", sequence, from, checksum, calculated),
            DatagramOutcome::Duplicate { sequence, expected } =>
                debug!("duplicate or out-of-order packet {} from {:?}, expected {}", sequence, from, expected),
            DatagramOutcome::Accepted { sequence, len, is_last, .. } => {
                trace!("accepted packet {} from {:?}: {} bytes (total: {} bytes)", sequence, from, len, buffered_len);
                if *is_last {
                    debug!("last packet received");
                }
            }
        }
    }
}
