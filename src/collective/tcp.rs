use std::{io, net::SocketAddr, time::Duration};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
};
use futures::{StreamExt, stream::FuturesUnordered};
use log::{debug, info, warn};
use tokio::net::{
    TcpListener, TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};

use super::{CollectiveError, ProcessGroup, ReduceOp, Result, fold_in_rank_order};
use crate::context::ProcessContext;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);
const CONNECT_ATTEMPTS: u32 = 240;

/// How long a member whose send failed waits for the frame that explains why.
const ABORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Link {
    rank: usize,
    rx: OnoReceiver<OwnedReadHalf>,
    tx: OnoSender<OwnedWriteHalf>,
    buf: Vec<u64>,
}

/// What a spoke sent the hub, copied out of the receive buffer.
enum Incoming {
    Contribution {
        seq: u64,
        op: ReduceOp,
        values: Vec<f64>,
    },
    Abort {
        rank: usize,
        reason: String,
    },
    Disconnect,
}

impl Link {
    fn new(rank: usize, stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        Ok(Self {
            rank,
            rx,
            tx,
            buf: Vec::new(),
        })
    }

    async fn recv_incoming(&mut self) -> (usize, Result<Incoming>) {
        let rank = self.rank;
        let res = match self.rx.recv_into(&mut self.buf).await {
            Ok(Msg::Data(Payload::Contribute { seq, op, values })) => Ok(Incoming::Contribution {
                seq,
                op,
                values: values.to_vec(),
            }),
            Ok(Msg::Control(Command::Abort { rank, reason })) => {
                Ok(Incoming::Abort { rank, reason })
            }
            Ok(Msg::Control(Command::Disconnect)) => Ok(Incoming::Disconnect),
            Ok(Msg::Err(detail)) => Err(CollectiveError::Protocol(format!(
                "rank {rank} reported: {detail}"
            ))),
            Ok(other) => Err(CollectiveError::Protocol(format!(
                "rank {rank} sent unexpected {other:?}"
            ))),
            Err(e) => Err(e.into()),
        };

        (rank, res)
    }

    /// Reads what is left in the receive buffer after a failed send, looking for the abort
    /// that made the other end close.
    async fn pending_abort(&mut self) -> Option<CollectiveError> {
        let read = tokio::time::timeout(ABORT_DRAIN_TIMEOUT, self.rx.recv_into(&mut self.buf));
        match read.await {
            Ok(Ok(Msg::Control(Command::Abort { rank, reason }))) => {
                Some(CollectiveError::PeerAborted { rank, reason })
            }
            _ => None,
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.tx.shutdown().await {
            debug!(rank = self.rank; "closing link: {e}");
        }
    }
}

enum Role {
    /// Rank 0: folds every contribution and sends the result back.
    Hub { spokes: Vec<Link> },
    Spoke { hub: Link },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Open,
    /// Holds the abort that ended the group, reported again by any later collective.
    Aborted { rank: usize, reason: String },
    Left,
}

/// A process group over TCP, in a star around rank 0.
///
/// The hub folds contributions in rank order regardless of arrival order, so every member
/// gets a bitwise identical result.
pub struct TcpGroup {
    rank: usize,
    size: usize,
    seq: u64,
    role: Role,
    state: State,
}

impl TcpGroup {
    /// Connects this process to the group described by `ctx`.
    ///
    /// Rank 0 listens on the master address, every other rank dials it.
    pub async fn connect(ctx: &ProcessContext) -> Result<Self> {
        if ctx.is_primary() {
            let listener = TcpListener::bind((ctx.master_addr.as_str(), ctx.master_port)).await?;
            Self::hub(listener, ctx.world_size).await
        } else {
            let addr = tokio::net::lookup_host((ctx.master_addr.as_str(), ctx.master_port))
                .await?
                .next()
                .ok_or_else(|| {
                    CollectiveError::Protocol(format!(
                        "master address {} does not resolve",
                        ctx.master_addr
                    ))
                })?;

            Self::spoke(addr, ctx.rank, ctx.world_size).await
        }
    }

    /// Accepts the other `world_size - 1` members on `listener` and becomes rank 0.
    pub async fn hub(listener: TcpListener, world_size: usize) -> Result<Self> {
        let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;

        info!(world_size = world_size; "waiting for peers to join");
        while joined + 1 < world_size {
            let (stream, peer) = listener.accept().await?;
            let mut link = Link::new(0, stream)?;

            let (rank, peer_world) = match link.rx.recv_into(&mut link.buf).await? {
                Msg::Control(Command::Join { rank, world_size }) => (rank, world_size),
                other => {
                    return Err(CollectiveError::Protocol(format!(
                        "{peer} opened with {other:?} instead of joining"
                    )));
                }
            };

            if peer_world != world_size {
                let detail = format!(
                    "rank {rank} expects world size {peer_world}, the group has {world_size}"
                );
                link.tx.send(&Msg::Err(detail.as_str().into())).await?;
                return Err(CollectiveError::Mismatch(detail));
            }

            let slot = rank
                .checked_sub(1)
                .and_then(|i| slots.get_mut(i))
                .filter(|slot| slot.is_none());

            let Some(slot) = slot else {
                let detail = format!("{peer} joined with an invalid or duplicate rank {rank}");
                link.tx.send(&Msg::Err(detail.as_str().into())).await?;
                return Err(CollectiveError::Protocol(detail));
            };

            debug!(rank = rank; "peer joined from {peer}");
            link.rank = rank;
            *slot = Some(link);
            joined += 1;
        }

        let mut spokes: Vec<Link> = slots.into_iter().flatten().collect();
        for link in &mut spokes {
            link.tx
                .send(&Msg::Control(Command::Welcome { world_size }))
                .await?;
        }

        info!(world_size = world_size; "process group ready");
        Ok(Self {
            rank: 0,
            size: world_size,
            seq: 0,
            role: Role::Hub { spokes },
            state: State::Open,
        })
    }

    /// Dials the hub at `addr` as `rank`, retrying while the hub is not listening yet.
    pub async fn spoke(addr: SocketAddr, rank: usize, world_size: usize) -> Result<Self> {
        if rank == 0 || rank >= world_size {
            return Err(CollectiveError::Protocol(format!(
                "rank {rank} cannot join a group of {world_size} as a spoke"
            )));
        }

        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    attempt += 1;
                    debug!(rank = rank, attempt = attempt; "hub at {addr} not reachable yet: {e}");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut hub = Link::new(0, stream)?;
        hub.tx
            .send(&Msg::Control(Command::Join { rank, world_size }))
            .await?;

        match hub.rx.recv_into(&mut hub.buf).await? {
            Msg::Control(Command::Welcome { world_size: w }) if w == world_size => {}
            Msg::Err(detail) => return Err(CollectiveError::Protocol(detail.into_owned())),
            other => {
                return Err(CollectiveError::Protocol(format!(
                    "hub answered the join with {other:?}"
                )));
            }
        }

        info!(rank = rank, world_size = world_size; "joined process group");
        Ok(Self {
            rank,
            size: world_size,
            seq: 0,
            role: Role::Spoke { hub },
            state: State::Open,
        })
    }

    fn check_open(&self) -> Result<()> {
        match &self.state {
            State::Open => Ok(()),
            State::Aborted { rank, reason } => Err(CollectiveError::PeerAborted {
                rank: *rank,
                reason: reason.clone(),
            }),
            State::Left => Err(CollectiveError::Protocol(format!(
                "rank {} already left the group",
                self.rank
            ))),
        }
    }

    async fn hub_reduce(
        spokes: &mut [Link],
        seq: u64,
        values: &mut [f64],
        op: ReduceOp,
    ) -> Result<()> {
        let mut rows: Vec<Option<Vec<f64>>> = (0..spokes.len()).map(|_| None).collect();
        let mut failure = None;

        {
            let mut pending: FuturesUnordered<_> =
                spokes.iter_mut().map(Link::recv_incoming).collect();

            while let Some((rank, res)) = pending.next().await {
                let err = match res {
                    Ok(Incoming::Contribution {
                        seq: got_seq,
                        op: got_op,
                        values: got,
                    }) => {
                        if got_seq == seq && got_op == op && got.len() == values.len() {
                            rows[rank - 1] = Some(got);
                            continue;
                        }
                        CollectiveError::Mismatch(format!(
                            "collective #{seq} is {op:?} over {} values, rank {rank} sent \
                             #{got_seq} {got_op:?} over {}",
                            values.len(),
                            got.len()
                        ))
                    }
                    Ok(Incoming::Abort { rank, reason }) => {
                        CollectiveError::PeerAborted { rank, reason }
                    }
                    Ok(Incoming::Disconnect) => CollectiveError::Protocol(format!(
                        "rank {rank} left the group during collective #{seq}"
                    )),
                    Err(e) => e,
                };
                failure = Some(err);
                break;
            }
        }

        if let Some(err) = failure {
            fail_spokes(spokes, &err).await;
            return Err(err);
        }

        let own = values.to_vec();
        let contributions = std::iter::once(own.as_slice())
            .chain(rows.iter().map(|row| row.as_deref().unwrap_or_default()));
        fold_in_rank_order(contributions, op, values);

        let reduced = Msg::Data(Payload::Reduced {
            seq,
            op,
            values: &*values,
        });
        for link in spokes.iter_mut() {
            link.tx.send(&reduced).await?;
        }

        Ok(())
    }

    async fn spoke_reduce(hub: &mut Link, seq: u64, values: &mut [f64], op: ReduceOp) -> Result<()> {
        let sent = hub
            .tx
            .send(&Msg::Data(Payload::Contribute {
                seq,
                op,
                values: &*values,
            }))
            .await;

        // A hub that aborted and closed before this contribution left its abort behind.
        if let Err(e) = sent {
            return Err(hub.pending_abort().await.unwrap_or(e.into()));
        }

        match hub.rx.recv_into(&mut hub.buf).await? {
            Msg::Data(Payload::Reduced {
                seq: got_seq,
                op: got_op,
                values: got,
            }) if got_seq == seq && got_op == op && got.len() == values.len() => {
                values.copy_from_slice(got);
                Ok(())
            }
            Msg::Control(Command::Abort { rank, reason }) => {
                Err(CollectiveError::PeerAborted { rank, reason })
            }
            other => Err(CollectiveError::Protocol(format!(
                "hub answered collective #{seq} with {other:?}"
            ))),
        }
    }

    /// Waits for every spoke's `Disconnect`, then answers each one and closes.
    async fn hub_leave(spokes: &mut [Link]) -> Result<()> {
        let mut failure = None;

        {
            let mut pending: FuturesUnordered<_> =
                spokes.iter_mut().map(Link::recv_incoming).collect();

            while let Some((rank, res)) = pending.next().await {
                let err = match res {
                    Ok(Incoming::Disconnect) => continue,
                    Ok(Incoming::Abort { rank, reason }) => {
                        CollectiveError::PeerAborted { rank, reason }
                    }
                    Ok(Incoming::Contribution { seq, .. }) => CollectiveError::Mismatch(format!(
                        "rank {rank} issued collective #{seq} while the group was leaving"
                    )),
                    Err(e) => e,
                };
                failure = Some(err);
                break;
            }
        }

        if let Some(err) = failure {
            fail_spokes(spokes, &err).await;
            return Err(err);
        }

        for link in spokes.iter_mut() {
            link.tx.send(&Msg::Control(Command::Disconnect)).await?;
            link.close().await;
        }
        Ok(())
    }

    async fn spoke_leave(hub: &mut Link) -> Result<()> {
        let sent = hub.tx.send(&Msg::Control(Command::Disconnect)).await;
        if let Err(e) = sent {
            return Err(hub.pending_abort().await.unwrap_or(e.into()));
        }

        let res = match hub.rx.recv_into(&mut hub.buf).await? {
            Msg::Control(Command::Disconnect) => Ok(()),
            Msg::Control(Command::Abort { rank, reason }) => {
                Err(CollectiveError::PeerAborted { rank, reason })
            }
            other => Err(CollectiveError::Protocol(format!(
                "hub answered the disconnect with {other:?}"
            ))),
        };

        hub.close().await;
        res
    }
}

/// Tells every spoke but the one that caused `err` to abort, then closes every link so
/// the abort frame is followed by an orderly end of stream.
async fn fail_spokes(spokes: &mut [Link], err: &CollectiveError) {
    let (rank, reason) = match err {
        CollectiveError::PeerAborted { rank, reason } => (*rank, reason.clone()),
        other => (0, other.to_string()),
    };

    broadcast_abort(spokes, rank, &reason).await;
    for link in spokes.iter_mut() {
        link.close().await;
    }
}

async fn broadcast_abort(links: &mut [Link], rank: usize, reason: &str) {
    let msg = Msg::Control(Command::Abort {
        rank,
        reason: reason.to_string(),
    });

    for link in links.iter_mut().filter(|l| l.rank != rank) {
        if let Err(e) = link.tx.send(&msg).await {
            warn!(rank = link.rank; "could not forward abort: {e}");
        }
    }
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn all_reduce(&mut self, values: &mut [f64], op: ReduceOp) -> Result<()> {
        self.check_open()?;

        self.seq += 1;
        let res = match &mut self.role {
            Role::Hub { spokes } => Self::hub_reduce(spokes, self.seq, values, op).await,
            Role::Spoke { hub } => Self::spoke_reduce(hub, self.seq, values, op).await,
        };

        if let Err(e) = &res {
            self.state = match e {
                CollectiveError::PeerAborted { rank, reason } => State::Aborted {
                    rank: *rank,
                    reason: reason.clone(),
                },
                other => State::Aborted {
                    rank: self.rank,
                    reason: other.to_string(),
                },
            };
        }
        res
    }

    async fn barrier(&mut self) -> Result<()> {
        self.all_reduce(&mut [], ReduceOp::Sum).await
    }

    async fn abort(&mut self, reason: &str) {
        if self.state != State::Open {
            return;
        }
        self.state = State::Aborted {
            rank: self.rank,
            reason: reason.to_string(),
        };

        let rank = self.rank;
        match &mut self.role {
            Role::Hub { spokes } => {
                broadcast_abort(spokes, rank, reason).await;
                for link in spokes.iter_mut() {
                    link.close().await;
                }
            }
            Role::Spoke { hub } => {
                let msg = Msg::Control(Command::Abort {
                    rank,
                    reason: reason.to_string(),
                });
                if let Err(e) = hub.tx.send(&msg).await {
                    warn!(rank = rank; "could not announce abort to the hub: {e}");
                }
                hub.close().await;
            }
        }
    }

    async fn leave(&mut self) -> Result<()> {
        self.check_open()?;

        let res = match &mut self.role {
            Role::Hub { spokes } => Self::hub_leave(spokes).await,
            Role::Spoke { hub } => Self::spoke_leave(hub).await,
        };

        self.state = State::Left;
        if res.is_ok() {
            debug!(rank = self.rank; "left the process group");
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn group(size: usize) -> Vec<TcpGroup> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let spokes: Vec<_> = (1..size)
            .map(|rank| tokio::spawn(TcpGroup::spoke(addr, rank, size)))
            .collect();

        let mut groups = vec![TcpGroup::hub(listener, size).await.unwrap()];
        for s in spokes {
            groups.push(s.await.unwrap().unwrap());
        }
        groups
    }

    #[tokio::test]
    async fn all_reduce_over_tcp_matches_on_every_rank() {
        let handles: Vec<_> = group(3)
            .await
            .into_iter()
            .map(|mut g| {
                tokio::spawn(async move {
                    let r = g.rank() as f64;
                    let mut v = [r, -r, 1.0];
                    g.all_reduce(&mut v, ReduceOp::Mean).await.unwrap();
                    let mut m = [r * r];
                    g.all_reduce(&mut m, ReduceOp::Max).await.unwrap();
                    g.barrier().await.unwrap();
                    (v, m)
                })
            })
            .collect();

        for h in handles {
            let (v, m) = h.await.unwrap();
            assert_eq!(v, [1.0, -1.0, 1.0]);
            assert_eq!(m, [4.0]);
        }
    }

    #[tokio::test]
    async fn spoke_abort_reaches_everyone() {
        let mut groups = group(3).await;
        let mut third = groups.pop().unwrap();
        let mut second = groups.pop().unwrap();
        let mut hub = groups.pop().unwrap();

        let hub_task = tokio::spawn(async move {
            let mut v = [0.0];
            hub.all_reduce(&mut v, ReduceOp::Sum).await
        });
        let third_task = tokio::spawn(async move {
            let mut v = [0.0];
            third.all_reduce(&mut v, ReduceOp::Sum).await
        });

        second.abort("bad batch").await;

        for res in [hub_task.await.unwrap(), third_task.await.unwrap()] {
            match res {
                Err(CollectiveError::PeerAborted { rank, reason }) => {
                    assert_eq!(rank, 1);
                    assert_eq!(reason, "bad batch");
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn late_spoke_learns_why_the_hub_gave_up() {
        let mut groups = group(3).await;
        let mut third = groups.pop().unwrap();
        let mut second = groups.pop().unwrap();
        let mut hub = groups.pop().unwrap();

        second.abort("compute failed at step 3").await;
        let res = hub.all_reduce(&mut [0.0], ReduceOp::Sum).await;
        assert!(matches!(res, Err(CollectiveError::PeerAborted { rank: 1, .. })));
        drop(hub);

        // The hub is gone before this rank even contributes.
        let mut v = vec![1.0; 512];
        match third.all_reduce(&mut v, ReduceOp::Sum).await {
            Err(CollectiveError::PeerAborted { rank, reason }) => {
                assert_eq!(rank, 1);
                assert_eq!(reason, "compute failed at step 3");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // Later collectives keep reporting the same cause.
        assert!(matches!(
            third.barrier().await,
            Err(CollectiveError::PeerAborted { rank: 1, .. })
        ));
    }

    #[tokio::test]
    async fn members_leave_together_after_their_last_collective() {
        let handles: Vec<_> = group(3)
            .await
            .into_iter()
            .map(|mut g| {
                tokio::spawn(async move {
                    let mut v = [g.rank() as f64];
                    g.all_reduce(&mut v, ReduceOp::Sum).await.unwrap();
                    g.leave().await.unwrap();
                    (v, g.all_reduce(&mut [0.0], ReduceOp::Sum).await)
                })
            })
            .collect();

        for h in handles {
            let (v, after) = h.await.unwrap();
            assert_eq!(v, [3.0]);
            assert!(matches!(after, Err(CollectiveError::Protocol(_))));
        }
    }

    #[tokio::test]
    async fn spoke_with_wrong_world_size_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let spoke = tokio::spawn(TcpGroup::spoke(addr, 1, 3));
        let hub = TcpGroup::hub(listener, 2).await;

        assert!(matches!(hub, Err(CollectiveError::Mismatch(_))));
        assert!(matches!(
            spoke.await.unwrap(),
            Err(CollectiveError::Protocol(_))
        ));
    }
}
