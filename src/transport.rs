//! Transport / communicator
//!
//! [`Communicator`] is the message-passing boundary the multiply engine is
//! generic over. A real deployment plugs in MPI, NCCL or a vendor
//! one-sided layer behind this trait; that swap is out of this crate's
//! scope exactly as the local-GEMM swap is (§1). [`ThreadCommunicator`] is
//! the one backend this crate ships: an in-process, rank-per-`std::thread`
//! reference implementation built on `crossbeam_channel`, used by every
//! test and by the CLI miniapp.
//!
//! Correctness never depends on the transport overlapping communication
//! with computation (§A.5) — `post_send`/`post_recv`/`wait` exist so a
//! backend *can* overlap, not so the engine must rely on it.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use num_complex::{Complex32, Complex64};
use thiserror::Error;

use crate::gemm::Scalar;

/// Errors a [`Communicator`] backend may report.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rank {rank} is out of range (communicator size {size})")]
    RankOutOfRange { rank: usize, size: usize },
    #[error("lost message: expected from rank {from}, channel closed")]
    LostMessage { from: usize },
    #[error("communicator failure: {0}")]
    CommunicatorFailure(String),
    #[error("received message of unexpected shape (expected {expected} elements, got {got})")]
    UnexpectedShape { expected: usize, got: usize },
}

/// The closed [`Scalar`] set, erased into an enum so it can cross a
/// `std::thread` boundary without `unsafe` byte reinterpretation.
#[derive(Clone, Debug)]
pub enum Payload {
    F32(Vec<f32>),
    F64(Vec<f64>),
    C32(Vec<Complex32>),
    C64(Vec<Complex64>),
}

impl Payload {
    fn len(&self) -> usize {
        match self {
            Payload::F32(v) => v.len(),
            Payload::F64(v) => v.len(),
            Payload::C32(v) => v.len(),
            Payload::C64(v) => v.len(),
        }
    }
}

/// Conversion between a concrete [`Scalar`] buffer and the wire [`Payload`].
/// Implemented for exactly the four types [`Scalar`] closes over.
pub trait WireScalar: Scalar {
    fn to_payload(v: Vec<Self>) -> Payload;
    fn from_payload(p: Payload) -> Result<Vec<Self>, TransportError>;
}

macro_rules! impl_wire_scalar {
    ($ty:ty, $variant:ident) => {
        impl WireScalar for $ty {
            fn to_payload(v: Vec<Self>) -> Payload {
                Payload::$variant(v)
            }
            fn from_payload(p: Payload) -> Result<Vec<Self>, TransportError> {
                match p {
                    Payload::$variant(v) => Ok(v),
                    other => Err(TransportError::CommunicatorFailure(format!(
                        "wire payload type mismatch: expected {}, got a payload of length {}",
                        stringify!($variant),
                        other.len()
                    ))),
                }
            }
        }
    };
}

impl_wire_scalar!(f32, F32);
impl_wire_scalar!(f64, F64);
impl_wire_scalar!(Complex32, C32);
impl_wire_scalar!(Complex64, C64);

#[derive(Clone, Debug)]
enum WireMsg {
    /// Allgather tuple exchanged during `split`.
    SplitInfo { global_rank: usize, color: usize, key: usize },
    Data(Payload),
}

/// A completed or in-flight send; `wait` on it is always a no-op for
/// [`ThreadCommunicator`] because its channel send never blocks.
pub struct SendHandle;

/// A posted, not-yet-awaited receive.
pub struct RecvHandle<T> {
    source: usize,
    expected_len: usize,
    _marker: PhantomData<T>,
}

/// The message-passing boundary the multiply engine is generic over.
pub trait Communicator: Sized {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Partition into sub-communicators: ranks sharing `color` end up
    /// together, ordered by `key`.
    fn split(&self, color: usize, key: usize) -> Result<Self, TransportError>;

    fn broadcast_from<T: WireScalar>(&self, root: usize, buf: &mut [T]) -> Result<(), TransportError>;
    fn scatter_from<T: WireScalar>(&self, root: usize, send_buf: &[T], recv_buf: &mut [T]) -> Result<(), TransportError>;
    fn gather_into<T: WireScalar>(&self, root: usize, send_buf: &[T], recv_buf: &mut [T]) -> Result<(), TransportError>;
    fn reduce_sum_into<T: WireScalar>(&self, root: usize, send_buf: &[T], recv_buf: &mut [T]) -> Result<(), TransportError>;
    fn all_reduce_sum<T: WireScalar>(&self, buf: &mut [T]) -> Result<(), TransportError>;

    fn post_send<T: WireScalar>(&self, dest: usize, data: &[T]) -> Result<SendHandle, TransportError>;
    fn post_recv<T: WireScalar>(&self, source: usize, expected_len: usize) -> Result<RecvHandle<T>, TransportError>;
    fn wait_send(&self, handle: SendHandle) -> Result<(), TransportError>;
    fn wait_recv<T: WireScalar>(&self, handle: RecvHandle<T>) -> Result<Vec<T>, TransportError>;
}

/// Shared, process-wide mesh of point-to-point channels, one per global
/// rank, built once by [`ThreadCommunicator::world`].
struct Mesh {
    senders: Vec<Sender<WireMsg>>,
    receivers: Vec<Receiver<WireMsg>>,
}

/// In-process reference [`Communicator`]: one rank per `std::thread`,
/// point-to-point `crossbeam_channel` queues. Relies on every rank issuing
/// the same sequence of collective calls (true for COSMA's deterministic,
/// synchronous-by-plan traversal, §A.5) so a single per-rank inbox channel
/// never needs message tags to stay correctly matched.
#[derive(Clone)]
pub struct ThreadCommunicator {
    global_rank: usize,
    global_size: usize,
    mesh: Arc<Mesh>,
    /// Global ranks belonging to this (sub-)communicator, in local-rank order.
    group: Vec<usize>,
}

impl ThreadCommunicator {
    /// Build `size` communicator handles sharing one mesh, one per rank —
    /// hand one to each `std::thread::scope` worker.
    pub fn world(size: usize) -> Vec<ThreadCommunicator> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();
        let mesh = Arc::new(Mesh { senders, receivers });
        (0..size)
            .map(|rank| ThreadCommunicator { global_rank: rank, global_size: size, mesh: mesh.clone(), group: (0..size).collect() })
            .collect()
    }

    fn local_rank_of(&self, global: usize) -> Option<usize> {
        self.group.iter().position(|&g| g == global)
    }

    fn send_to(&self, global_dest: usize, msg: WireMsg) -> Result<(), TransportError> {
        self.mesh.senders[global_dest]
            .send(msg)
            .map_err(|_| TransportError::CommunicatorFailure(format!("channel to rank {global_dest} closed")))
    }

    fn recv_data(&self, from: usize) -> Result<Payload, TransportError> {
        match self.mesh.receivers[self.global_rank].recv() {
            Ok(WireMsg::Data(p)) => Ok(p),
            Ok(WireMsg::SplitInfo { .. }) => Err(TransportError::CommunicatorFailure(
                "received a split handshake message where data was expected".into(),
            )),
            Err(_) => Err(TransportError::LostMessage { from }),
        }
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.local_rank_of(self.global_rank).expect("this rank is always a member of its own group")
    }

    fn size(&self) -> usize {
        self.group.len()
    }

    fn split(&self, color: usize, key: usize) -> Result<Self, TransportError> {
        // Allgather (global_rank, color, key) among current group members.
        for &peer in &self.group {
            if peer != self.global_rank {
                self.send_to(peer, WireMsg::SplitInfo { global_rank: self.global_rank, color, key })?;
            }
        }
        let mut tuples = vec![(self.global_rank, color, key)];
        for _ in 0..self.group.len() - 1 {
            match self.mesh.receivers[self.global_rank].recv() {
                Ok(WireMsg::SplitInfo { global_rank, color, key }) => tuples.push((global_rank, color, key)),
                Ok(WireMsg::Data(_)) => {
                    return Err(TransportError::CommunicatorFailure("expected split handshake, got data".into()))
                }
                Err(_) => return Err(TransportError::CommunicatorFailure("split handshake channel closed".into())),
            }
        }

        let mut new_group: Vec<(usize, usize)> = tuples.into_iter().filter(|&(_, c, _)| c == color).map(|(g, _, k)| (g, k)).collect();
        new_group.sort_by_key(|&(_, k)| k);
        let group = new_group.into_iter().map(|(g, _)| g).collect();

        Ok(ThreadCommunicator { global_rank: self.global_rank, global_size: self.global_size, mesh: self.mesh.clone(), group })
    }

    fn broadcast_from<T: WireScalar>(&self, root: usize, buf: &mut [T]) -> Result<(), TransportError> {
        let root_global = *self.group.get(root).ok_or(TransportError::RankOutOfRange { rank: root, size: self.size() })?;
        if self.global_rank == root_global {
            let payload = T::to_payload(buf.to_vec());
            for &peer in &self.group {
                if peer != self.global_rank {
                    self.send_to(peer, WireMsg::Data(payload.clone()))?;
                }
            }
            Ok(())
        } else {
            let payload = self.recv_data(root_global)?;
            let v = T::from_payload(payload)?;
            if v.len() != buf.len() {
                return Err(TransportError::UnexpectedShape { expected: buf.len(), got: v.len() });
            }
            buf.copy_from_slice(&v);
            Ok(())
        }
    }

    fn scatter_from<T: WireScalar>(&self, root: usize, send_buf: &[T], recv_buf: &mut [T]) -> Result<(), TransportError> {
        let root_global = *self.group.get(root).ok_or(TransportError::RankOutOfRange { rank: root, size: self.size() })?;
        let chunk = recv_buf.len();
        if self.global_rank == root_global {
            if send_buf.len() != chunk * self.group.len() {
                return Err(TransportError::UnexpectedShape { expected: chunk * self.group.len(), got: send_buf.len() });
            }
            for (i, &peer) in self.group.iter().enumerate() {
                let piece = send_buf[i * chunk..(i + 1) * chunk].to_vec();
                if peer == self.global_rank {
                    recv_buf.copy_from_slice(&piece);
                } else {
                    self.send_to(peer, WireMsg::Data(T::to_payload(piece)))?;
                }
            }
            Ok(())
        } else {
            let payload = self.recv_data(root_global)?;
            let v = T::from_payload(payload)?;
            if v.len() != chunk {
                return Err(TransportError::UnexpectedShape { expected: chunk, got: v.len() });
            }
            recv_buf.copy_from_slice(&v);
            Ok(())
        }
    }

    fn gather_into<T: WireScalar>(&self, root: usize, send_buf: &[T], recv_buf: &mut [T]) -> Result<(), TransportError> {
        let root_global = *self.group.get(root).ok_or(TransportError::RankOutOfRange { rank: root, size: self.size() })?;
        let chunk = send_buf.len();
        if self.global_rank == root_global {
            if recv_buf.len() != chunk * self.group.len() {
                return Err(TransportError::UnexpectedShape { expected: chunk * self.group.len(), got: recv_buf.len() });
            }
            for (i, &peer) in self.group.iter().enumerate() {
                if peer == self.global_rank {
                    recv_buf[i * chunk..(i + 1) * chunk].copy_from_slice(send_buf);
                } else {
                    let payload = self.recv_data(peer)?;
                    let v = T::from_payload(payload)?;
                    if v.len() != chunk {
                        return Err(TransportError::UnexpectedShape { expected: chunk, got: v.len() });
                    }
                    recv_buf[i * chunk..(i + 1) * chunk].copy_from_slice(&v);
                }
            }
            Ok(())
        } else {
            self.send_to(root_global, WireMsg::Data(T::to_payload(send_buf.to_vec())))
        }
    }

    fn reduce_sum_into<T: WireScalar>(&self, root: usize, send_buf: &[T], recv_buf: &mut [T]) -> Result<(), TransportError> {
        let root_global = *self.group.get(root).ok_or(TransportError::RankOutOfRange { rank: root, size: self.size() })?;
        let len = send_buf.len();
        if self.global_rank == root_global {
            if recv_buf.len() != len {
                return Err(TransportError::UnexpectedShape { expected: len, got: recv_buf.len() });
            }
            recv_buf.copy_from_slice(send_buf);
            for &peer in &self.group {
                if peer == self.global_rank {
                    continue;
                }
                let payload = self.recv_data(peer)?;
                let v = T::from_payload(payload)?;
                if v.len() != len {
                    return Err(TransportError::UnexpectedShape { expected: len, got: v.len() });
                }
                for (acc, x) in recv_buf.iter_mut().zip(v.into_iter()) {
                    *acc += x;
                }
            }
            Ok(())
        } else {
            self.send_to(root_global, WireMsg::Data(T::to_payload(send_buf.to_vec())))
        }
    }

    fn all_reduce_sum<T: WireScalar>(&self, buf: &mut [T]) -> Result<(), TransportError> {
        let mut reduced = buf.to_vec();
        self.reduce_sum_into(0, buf, &mut reduced)?;
        // `reduce_sum_into` only fills `reduced` meaningfully at root (local
        // rank 0); broadcast it back out to realize an all-reduce.
        self.broadcast_from(0, &mut reduced)?;
        buf.copy_from_slice(&reduced);
        Ok(())
    }

    fn post_send<T: WireScalar>(&self, dest: usize, data: &[T]) -> Result<SendHandle, TransportError> {
        let dest_global = *self.group.get(dest).ok_or(TransportError::RankOutOfRange { rank: dest, size: self.size() })?;
        self.send_to(dest_global, WireMsg::Data(T::to_payload(data.to_vec())))?;
        Ok(SendHandle)
    }

    fn post_recv<T: WireScalar>(&self, source: usize, expected_len: usize) -> Result<RecvHandle<T>, TransportError> {
        if source >= self.group.len() {
            return Err(TransportError::RankOutOfRange { rank: source, size: self.size() });
        }
        Ok(RecvHandle { source, expected_len, _marker: PhantomData })
    }

    fn wait_send(&self, _handle: SendHandle) -> Result<(), TransportError> {
        Ok(())
    }

    fn wait_recv<T: WireScalar>(&self, handle: RecvHandle<T>) -> Result<Vec<T>, TransportError> {
        let source_global = self.group[handle.source];
        let payload = self.recv_data(source_global)?;
        let v = T::from_payload(payload)?;
        if v.len() != handle.expected_len {
            return Err(TransportError::UnexpectedShape { expected: handle.expected_len, got: v.len() });
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_delivers_root_data_to_every_rank() {
        let comms = ThreadCommunicator::world(4);
        std::thread::scope(|s| {
            for comm in &comms {
                s.spawn(move || {
                    let mut buf = if comm.rank() == 0 { vec![1.0f64, 2.0, 3.0] } else { vec![0.0; 3] };
                    comm.broadcast_from(0, &mut buf).unwrap();
                    assert_eq!(buf, vec![1.0, 2.0, 3.0]);
                });
            }
        });
    }

    #[test]
    fn scatter_then_gather_round_trips() {
        let comms = ThreadCommunicator::world(3);
        std::thread::scope(|s| {
            for comm in &comms {
                s.spawn(move || {
                    let send = if comm.rank() == 0 { vec![10.0, 20.0, 30.0] } else { Vec::new() };
                    let mut recv = vec![0.0f64];
                    comm.scatter_from(0, &send, &mut recv).unwrap();
                    assert_eq!(recv[0], 10.0 * (comm.rank() as f64 + 1.0));

                    let mut gathered = if comm.rank() == 0 { vec![0.0; 3] } else { Vec::new() };
                    comm.gather_into(0, &recv, &mut gathered).unwrap();
                    if comm.rank() == 0 {
                        assert_eq!(gathered, vec![10.0, 20.0, 30.0]);
                    }
                });
            }
        });
    }

    #[test]
    fn all_reduce_sums_across_all_ranks() {
        let comms = ThreadCommunicator::world(4);
        std::thread::scope(|s| {
            for comm in &comms {
                s.spawn(move || {
                    let mut buf = vec![(comm.rank() + 1) as f64];
                    comm.all_reduce_sum(&mut buf).unwrap();
                    assert_eq!(buf[0], 10.0); // 1+2+3+4
                });
            }
        });
    }

    #[test]
    fn split_partitions_into_independent_sub_communicators() {
        let comms = ThreadCommunicator::world(4);
        std::thread::scope(|s| {
            for comm in &comms {
                s.spawn(move || {
                    let color = comm.rank() / 2; // {0,1} -> color 0, {2,3} -> color 1
                    let sub = comm.split(color, comm.rank()).unwrap();
                    assert_eq!(sub.size(), 2);
                    let mut buf = if sub.rank() == 0 { vec![42.0f64] } else { vec![0.0] };
                    sub.broadcast_from(0, &mut buf).unwrap();
                    assert_eq!(buf[0], 42.0);
                });
            }
        });
    }
}
