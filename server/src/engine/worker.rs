//! Media Workers
//!
//! A worker is an isolated media-processing unit with its own DTLS
//! certificate and its own slice of the RTC port range. Rooms are spread
//! over a fixed pool of workers round-robin.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::select_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vc_common::IceCandidate;
use webrtc::util::vnet::net::Net;

use super::dtls::DtlsIdentity;
use super::error::EngineError;
use super::router::Router;

/// Network settings shared by all workers.
#[derive(Clone)]
pub struct WorkerSettings {
    /// IP media transports bind to. Unspecified gathers on every interface.
    pub listen_ip: IpAddr,
    /// Public address advertised in ICE candidates instead of the local one.
    pub announced_address: Option<String>,
    /// Lowest RTC port.
    pub rtc_min_port: u16,
    /// Highest RTC port.
    pub rtc_max_port: u16,
    /// Budget for ICE checks plus the DTLS handshake on connect.
    pub handshake_timeout: Duration,
    /// In-process network to bind on instead of the host interfaces.
    pub network: Option<Arc<Net>>,
}

impl std::fmt::Debug for WorkerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSettings")
            .field("listen_ip", &self.listen_ip)
            .field("announced_address", &self.announced_address)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("virtual_network", &self.network.is_some())
            .finish()
    }
}

impl WorkerSettings {
    /// Candidate as advertised to clients.
    pub fn advertise(&self, mut candidate: IceCandidate) -> IceCandidate {
        if let Some(address) = &self.announced_address {
            candidate.ip.clone_from(address);
        }
        candidate
    }
}

#[derive(Debug)]
struct PortAllocator {
    min: u16,
    max: u16,
    next: u16,
    leased: HashSet<u16>,
}

impl PortAllocator {
    fn lease(&mut self) -> Option<u16> {
        let span = usize::from(self.max - self.min) + 1;
        for _ in 0..span {
            let port = self.next;
            self.next = if self.next >= self.max {
                self.min
            } else {
                self.next + 1
            };
            if self.leased.insert(port) {
                return Some(port);
            }
        }
        None
    }
}

/// A media worker.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    settings: Arc<WorkerSettings>,
    dtls: DtlsIdentity,
    ports: Mutex<PortAllocator>,
    routers: AtomicUsize,
    closed: CancellationToken,
}

impl Worker {
    fn new(
        id: usize,
        settings: Arc<WorkerSettings>,
        min_port: u16,
        max_port: u16,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            id,
            settings,
            dtls: DtlsIdentity::generate()?,
            ports: Mutex::new(PortAllocator {
                min: min_port,
                max: max_port,
                next: min_port,
                leased: HashSet::new(),
            }),
            routers: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        })
    }

    /// Worker index in the pool.
    pub const fn id(&self) -> usize {
        self.id
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub const fn dtls(&self) -> &DtlsIdentity {
        &self.dtls
    }

    /// Routers currently alive on this worker.
    pub fn router_count(&self) -> usize {
        self.routers.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Create a router with the fixed codec set.
    pub async fn create_router(self: &Arc<Self>) -> Result<Arc<Router>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::WorkerClosed(self.id));
        }
        let router = Arc::new(Router::new(self.clone(), self.closed.child_token()));
        self.routers.fetch_add(1, Ordering::Relaxed);
        info!(worker_id = self.id, router_id = %router.id(), "Router created");
        Ok(router)
    }

    pub(crate) fn router_closed(&self) {
        self.routers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn lease_port(&self) -> Result<u16, EngineError> {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lease()
            .ok_or(EngineError::PortsExhausted(self.id))
    }

    pub(crate) fn release_port(&self, port: u16) {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leased
            .remove(&port);
    }

    #[cfg(test)]
    pub(crate) fn is_port_leased(&self, port: u16) -> bool {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leased
            .contains(&port)
    }

    /// Stop the worker. Every router on it closes.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            warn!(worker_id = self.id, "Worker closed");
            self.closed.cancel();
        }
    }

    /// Resolves when the worker dies.
    pub async fn died(&self) {
        self.closed.cancelled().await;
    }
}

/// Fixed pool of workers with round-robin assignment.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Start `num_workers` workers, splitting the port range between them.
    pub fn new(num_workers: usize, settings: WorkerSettings) -> Result<Self, EngineError> {
        if num_workers == 0 {
            return Err(EngineError::NoWorkers);
        }
        let (min, max) = (settings.rtc_min_port, settings.rtc_max_port);
        let span = if max >= min {
            usize::from(max - min) + 1
        } else {
            0
        };
        if span < num_workers {
            return Err(EngineError::InvalidPortRange {
                min,
                max,
                workers: num_workers,
            });
        }

        let per_worker = span / num_workers;
        let settings = Arc::new(settings);
        let workers = (0..num_workers)
            .map(|id| {
                let lo = min + (id * per_worker) as u16;
                let hi = if id + 1 == num_workers {
                    max
                } else {
                    lo + per_worker as u16 - 1
                };
                Worker::new(id, settings.clone(), lo, hi).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(workers = num_workers, min_port = min, max_port = max, "Worker pool started");

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Next worker in round-robin order.
    pub fn next_worker(&self) -> Arc<Worker> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Resolves with the id of the first worker that dies.
    pub async fn wait_for_worker_death(&self) -> usize {
        let deaths = self
            .workers
            .iter()
            .map(|worker| Box::pin(async move {
                worker.died().await;
                worker.id()
            }));
        let (id, _, _) = select_all(deaths).await;
        id
    }

    /// Shut down every worker.
    pub fn close(&self) {
        for worker in &self.workers {
            worker.close();
        }
    }
}
