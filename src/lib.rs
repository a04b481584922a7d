//! A stop-and-wait ARQ (alternating bit) protocol for transferring a byte buffer over an
//!  unreliable datagram transport like UDP, which may drop, duplicate, corrupt or reorder
//!  datagrams.
//!
//! ## Protocol
//!
//! * The sender splits the data into segments of at most `max_segment` bytes and sends them one
//!   at a time: the next packet is sent only after the previous one was acknowledged. There is
//!   no pipelining, no congestion control and no encryption.
//! * Packets carry a single sequence bit that alternates between consecutive packets, starting
//!   at 0 for every transfer. The last packet of a transfer is flagged as such; an empty buffer
//!   is sent as a single empty 'last' packet.
//! * The receiver acks every packet it can parse, appending the payload only if the checksum
//!   is valid and the sequence bit is the expected one. Unparsable datagrams are not acked.
//! * The sender retransmits a packet immediately when there is no ack within the ack timeout, or
//!   when something other than an ack arrives from the peer. If *sending* fails, it retransmits
//!   after an exponential backoff. A packet that failed `max_retries` times aborts the transfer.
//!
//! NB: The ack is a single fixed byte that does not say which packet it confirms. So the sender
//!  treats any ack as confirmation of the packet in flight, even if it was triggered by a
//!  corrupt packet or a duplicate.
//!
//! ## Packet format
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0: sequence bit (u8) - 0 or 1
//! 1: payload length (u16) - at most `max_segment`
//! 3: is_last flag (u8) - 0 or 1
//! 4: CRC-32 of the payload (u32) - the header is not covered
//! 8: payload
//! ```
//!
//! The ack is a single byte `0xFF`.

pub mod config;
pub mod error;
pub mod latency;
pub mod packet;
pub mod receiver;
pub mod retry;
pub mod sender;
pub mod sequence;
pub mod socket;
pub mod test_util;
pub mod verify;
