use std::time::Duration;
use anyhow::bail;

/// Tunables for both sides of a stop-and-wait transfer. Sender and receiver are expected to
///  share the same `max_segment`; the other values are local to each side.
#[derive(Clone, Debug)]
pub struct ArqConfig {
    /// The maximum number of payload bytes per packet. The header encodes the payload length
    ///  as a u16, so this can not be bigger than `u16::MAX`.
    pub max_segment: usize,

    /// The number of failed attempts (timeouts or transport failures) after which the sender
    ///  gives up on a packet, and on the transfer as a whole. The first transmission counts as
    ///  an attempt, so a packet is transmitted at most this many times.
    pub max_retries: u32,

    /// Time to wait for an acknowledgement before retransmitting
    pub ack_timeout: Duration,

    /// Base for the exponential backoff after a failed *send* operation: the n-th retry waits
    ///  for `backoff_base * 2^n`.
    ///
    /// NB: Ack timeouts retransmit immediately without backoff
    pub backoff_base: Duration,

    /// Progress is reported when it advanced by at least this many percent...
    pub progress_percent_step: u32,
    /// ... or after this many acknowledged packets, whichever comes first
    pub progress_packet_step: u32,

    pub histogram_bins: usize,
    /// The latency histogram is only worth printing for more than this many samples
    pub histogram_min_samples: usize,

    /// Socket send and receive buffer size, `None` to leave the OS defaults
    pub socket_buffer_size: Option<usize>,

    /// The receiver retries failed `recv` calls, but treats this many failures in a row as
    ///  fatal to avoid spinning on a broken socket
    pub max_consecutive_receive_errors: u32,
}

impl Default for ArqConfig {
    fn default() -> Self {
        ArqConfig {
            max_segment: 1024,
            max_retries: 5,
            ack_timeout: Duration::from_millis(1000),
            backoff_base: Duration::from_millis(50),
            progress_percent_step: 5,
            progress_packet_step: 10,
            histogram_bins: 10,
            histogram_min_samples: 10,
            socket_buffer_size: Some(8192),
            max_consecutive_receive_errors: 16,
        }
    }
}

impl ArqConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_segment == 0 {
            bail!("max segment size must not be 0");
        }
        if self.max_segment > u16::MAX as usize {
            bail!("max segment size {} does not fit the u16 length field", self.max_segment);
        }
        if self.max_retries == 0 {
            bail!("max retries must be at least 1");
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.histogram_bins == 0 {
            bail!("histogram needs at least one bin");
        }
        if self.max_consecutive_receive_errors == 0 {
            bail!("max consecutive receive errors must be at least 1");
        }
        Ok(())
    }

    /// The size of the biggest datagram this configuration produces, i.e. the receive buffer
    ///  size required to never truncate a packet
    pub fn max_packet_len(&self) -> usize {
        crate::packet::HEADER_LEN + self.max_segment
    }
}
