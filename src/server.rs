//! Listening socket and worker pool.
//!
//! A single acceptor takes TCP connections and hands the raw socket, with the
//! peer address, to the least loaded worker. Each worker is an OS thread
//! running its own single-threaded runtime; sessions on a worker are tasks.

use crate::broker::Broker;
use crate::config::Config;
use crate::session::{SessionContext, TunnelSession};
use crate::stats::{GlobalStats, WorkerStats};
use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Connection passed from the acceptor to a worker.
#[derive(Debug)]
pub struct Handoff {
    pub stream: std::net::TcpStream,
    pub peer: SocketAddr,
}

struct WorkerHandle {
    index: usize,
    tx: mpsc::UnboundedSender<Handoff>,
    stats: Arc<WorkerStats>,
    thread: thread::JoinHandle<()>,
}

pub struct TunnelServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    acceptor: TlsAcceptor,
}

impl TunnelServer {
    /// Binds the configured listen address.
    pub async fn bind(
        config: Arc<Config>,
        acceptor: TlsAcceptor,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let addr = config.listen.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;
        let stats = Arc::new(GlobalStats::new(config.tunnel.worker_count()));
        Ok(Self {
            listener,
            ctx: Arc::new(SessionContext {
                config,
                broker,
                stats,
            }),
            acceptor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Listener has no local address")
    }

    pub fn stats(&self) -> Arc<GlobalStats> {
        self.ctx.stats.clone()
    }

    /// Accepts until `shutdown` flips to `true`, then stops the workers. Each
    /// worker gets `tunnel.shutdown_grace` to finish open sessions and send
    /// their broker notifications; whatever is left after that is cut.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut workers = self.spawn_workers()?;
        info!(
            "Tunnel server listening on {} with {} workers",
            self.local_addr()?,
            workers.len()
        );

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = dispatch(&mut workers, stream, peer) {
                                break Err(e);
                            }
                        }
                        Err(e) => error!("LOOP: accept failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        info!("Stopping workers");
        for worker in workers {
            let WorkerHandle {
                index, tx, thread, ..
            } = worker;
            // Closing the channel ends the worker loop.
            drop(tx);
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!("worker {} joined", index),
                _ => warn!("worker {} did not stop cleanly", index),
            }
        }
        info!("FINISHED");
        result
    }

    fn spawn_workers(&self) -> Result<Vec<WorkerHandle>> {
        self.ctx
            .stats
            .workers()
            .iter()
            .enumerate()
            .map(|(index, stats)| {
                let (tx, rx) = mpsc::unbounded_channel();
                let ctx = self.ctx.clone();
                let acceptor = self.acceptor.clone();
                let worker_stats = stats.clone();
                let thread = thread::Builder::new()
                    .name(format!("tunnel-worker-{index}"))
                    .spawn(move || worker_main(index, rx, ctx, acceptor, worker_stats))
                    .with_context(|| format!("Failed to start worker {index}"))?;
                Ok(WorkerHandle {
                    index,
                    tx,
                    stats: stats.clone(),
                    thread,
                })
            })
            .collect()
    }
}

/// Index of the worker with the fewest live sessions; ties go to the lowest index.
pub fn least_loaded(loads: impl IntoIterator<Item = u64>) -> Option<usize> {
    loads
        .into_iter()
        .enumerate()
        .min_by_key(|&(index, load)| (load, index))
        .map(|(index, _)| index)
}

fn dispatch(workers: &mut Vec<WorkerHandle>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("TCP_NODELAY for {}: {}", peer, e);
    }
    let mut handoff = Handoff {
        stream: stream
            .into_std()
            .with_context(|| format!("Failed to detach socket of {peer}"))?,
        peer,
    };

    loop {
        let best = least_loaded(workers.iter().map(|w| w.stats.load()))
            .ok_or_else(|| anyhow!("No workers left"))?;
        match workers[best].tx.send(handoff) {
            Ok(()) => {
                debug!("CONNECTION from {} to worker {}", peer, workers[best].index);
                return Ok(());
            }
            Err(mpsc::error::SendError(returned)) => {
                error!("worker {} is gone, dropping it", workers[best].index);
                workers.remove(best);
                handoff = returned;
            }
        }
    }
}

fn worker_main(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<Handoff>,
    ctx: Arc<SessionContext>,
    acceptor: TlsAcceptor,
    stats: Arc<WorkerStats>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("worker {}: could not build runtime: {}", index, e);
            return;
        }
    };

    runtime.block_on(async move {
        debug!("worker {} started", index);
        while let Some(Handoff { stream, peer }) = rx.recv().await {
            let stream = match TcpStream::from_std(stream) {
                Ok(s) => s,
                Err(e) => {
                    error!("worker {}: cannot adopt socket from {}: {}", index, peer, e);
                    continue;
                }
            };
            let session = TunnelSession::new(ctx.clone(), stats.clone(), peer);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let outcome = session.serve(stream, &acceptor).await;
                debug!("session from {} ended in {:?}", peer, outcome.state);
            });
        }
        drain(index, &stats, ctx.config.tunnel.shutdown_grace()).await;
        debug!("worker {} stopped", index);
    });
}

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Waits for the worker's sessions and their broker notifications to finish,
/// at most `grace`. Returns whether the worker went idle in time.
pub async fn drain(index: usize, stats: &WorkerStats, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        let (sessions, notifies) = (stats.load(), stats.pending_notifies());
        if sessions == 0 && notifies == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            warn!(
                "worker {}: cutting {} sessions and {} notifications after {:?}",
                index, sessions, notifies, grace
            );
            return false;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}
