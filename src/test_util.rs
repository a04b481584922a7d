//! An in-memory datagram link with configurable fault injection. It is used for testing the
//!  sender and receiver state machines in this crate, but it is exported for testing
//!  application code built on top of them as well.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::trace;
use crate::socket::DatagramSocket;

/// convenience for test code: the same number always yields the same (local) address
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// Faults applied to the datagrams a [SimulatedSocket] *sends*. Datagrams are numbered by
///  successful `send_to` calls, starting at 0.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    pub drop_all: bool,
    pub drop: HashSet<usize>,
    /// flip the lowest bit of the datagram's last byte
    pub corrupt: HashSet<usize>,
    pub duplicate: HashSet<usize>,
    /// this many `send_to` calls fail with an I/O error before the first one succeeds
    pub fail_first_sends: usize,
    /// probability of dropping each datagram, drawn from an RNG seeded with `seed`
    pub loss_rate: f64,
    pub seed: u64,
}

impl FaultPlan {
    pub fn reliable() -> FaultPlan {
        Default::default()
    }

    pub fn dropping_all() -> FaultPlan {
        FaultPlan { drop_all: true, ..Default::default() }
    }

    pub fn dropping(indices: &[usize]) -> FaultPlan {
        FaultPlan { drop: indices.iter().copied().collect(), ..Default::default() }
    }

    pub fn corrupting(indices: &[usize]) -> FaultPlan {
        FaultPlan { corrupt: indices.iter().copied().collect(), ..Default::default() }
    }

    pub fn duplicating(indices: &[usize]) -> FaultPlan {
        FaultPlan { duplicate: indices.iter().copied().collect(), ..Default::default() }
    }

    pub fn lossy(loss_rate: f64, seed: u64) -> FaultPlan {
        FaultPlan { loss_rate, seed, ..Default::default() }
    }
}

struct FaultState {
    plan: FaultPlan,
    rng: StdRng,
    num_send_calls: usize,
    num_sent: usize,
    sent: Vec<Bytes>,
}

/// One end of an in-memory link created by [simulated_link].
pub struct SimulatedSocket {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    to_peer: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    to_self: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    /// tokio's Mutex so that a pending receive can be dropped without losing a datagram
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>,
    faults: Mutex<FaultState>,
}

/// Creates two connected sockets, each applying its own fault plan to the datagrams it sends
pub fn simulated_link(addr_a: SocketAddr, faults_a: FaultPlan, addr_b: SocketAddr, faults_b: FaultPlan) -> (SimulatedSocket, SimulatedSocket) {
    let (send_a, recv_a) = mpsc::unbounded_channel();
    let (send_b, recv_b) = mpsc::unbounded_channel();

    let a = SimulatedSocket::new(addr_a, addr_b, send_b.clone(), send_a.clone(), recv_a, faults_a);
    let b = SimulatedSocket::new(addr_b, addr_a, send_a, send_b, recv_b, faults_b);
    (a, b)
}

impl SimulatedSocket {
    fn new(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        to_peer: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
        to_self: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
        inbox: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
        plan: FaultPlan,
    ) -> SimulatedSocket {
        SimulatedSocket {
            local_addr,
            peer_addr,
            to_peer,
            to_self,
            inbox: tokio::sync::Mutex::new(inbox),
            faults: Mutex::new(FaultState {
                rng: StdRng::seed_from_u64(plan.seed),
                plan,
                num_send_calls: 0,
                num_sent: 0,
                sent: Vec::new(),
            }),
        }
    }

    /// Places a datagram into this socket's inbox as if it had arrived from `from`
    pub fn inject(&self, from: SocketAddr, datagram: &[u8]) {
        let _ = self.to_self.send((from, Bytes::copy_from_slice(datagram)));
    }

    /// All datagrams passed to successful `send_to` calls (before faults were applied)
    pub fn sent_datagrams(&self) -> Vec<Bytes> {
        self.faults.lock()
            .map(|f| f.sent.clone())
            .unwrap_or_default()
    }

    pub fn num_send_calls(&self) -> usize {
        self.faults.lock()
            .map(|f| f.num_send_calls)
            .unwrap_or_default()
    }
}

#[async_trait]
impl DatagramSocket for SimulatedSocket {
    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let (copies, corrupt) = {
            let mut faults = self.faults.lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned fault state"))?;

            faults.num_send_calls += 1;
            if faults.num_send_calls <= faults.plan.fail_first_sends {
                trace!("simulated send failure #{}", faults.num_send_calls);
                return Err(io::Error::new(io::ErrorKind::Other, "simulated send failure"));
            }

            let index = faults.num_sent;
            faults.num_sent += 1;
            faults.sent.push(Bytes::copy_from_slice(datagram));

            let loss_rate = faults.plan.loss_rate;
            let lost = loss_rate > 0.0 && faults.rng.gen_bool(loss_rate);
            let copies = if faults.plan.drop_all || faults.plan.drop.contains(&index) || lost {
                trace!("simulated loss of datagram #{}", index);
                0
            }
            else if faults.plan.duplicate.contains(&index) {
                2
            }
            else {
                1
            };
            (copies, faults.plan.corrupt.contains(&index))
        };

        if to != self.peer_addr {
            trace!("no simulated peer at {:?} - datagram vanishes", to);
            return Ok(());
        }

        let mut datagram = datagram.to_vec();
        if corrupt {
            if let Some(last) = datagram.last_mut() {
                *last ^= 0x01;
            }
        }

        let datagram = Bytes::from(datagram);
        for _ in 0..copies {
            // the peer may be gone, which is just another way of losing a datagram
            let _ = self.to_peer.send((self.local_addr, datagram.clone()));
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((from, datagram)) => {
                // like UDP, excess bytes are discarded if the buffer is too small
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "simulated link closed")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
