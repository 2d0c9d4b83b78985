use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use coap_wire::{Code, CodeKind, Packet, Type, MAX_DGRAM_SIZE};
use log::{debug, error, info, warn};
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::error::{DispatchError, What, When};
use crate::net::Addrd;
use crate::resource::ResourceManager;
use crate::transaction::TransactionPool;
use crate::worker::Worker;

type ShortTermId = (SocketAddr, u16);
type LongTermId = (SocketAddr, Vec<u8>, u16, u32);

/// Owns the UDP socket, the ingress/validated queues, the worker pool, and
/// the five background service loops described in the dispatcher design:
/// listen, ingress-format-filter, deduplication-filter, transaction-tick, and
/// worker-lifecycle.
pub struct Dispatcher {
  socket: Arc<UdpSocket>,
  shutdown: Arc<AtomicBool>,
  threads: Mutex<Vec<JoinHandle<()>>>,
  workers: Arc<Mutex<Vec<Worker>>>,
  next_worker_id: AtomicU64,
  transactions: Arc<TransactionPool>,
  resources: Arc<ResourceManager>,
  config: Config,
  token_counter: AtomicU64,
  token_salt: u64,
  tick_signal: Arc<(Mutex<()>, Condvar)>,
  idle_signal: Arc<(Mutex<()>, Condvar)>,
}

impl Dispatcher {
  /// Bind a UDP socket at `bind_addr` and start all background service loops
  /// and one initial worker. The only error this returns to the caller is a
  /// failure to bind -- everything past that point is absorbed internally,
  /// per the error handling design.
  pub fn start(bind_addr: impl std::net::ToSocketAddrs,
                config: Config,
                resources: Arc<ResourceManager>)
                -> Result<Arc<Self>, DispatchError> {
    let socket = UdpSocket::bind(bind_addr).map_err(|e| When::None.what(What::BindFailed(e)))?;
    socket.set_read_timeout(Some(config.poll_timeout))
          .map_err(|e| When::None.what(What::BindFailed(e)))?;

    let token_salt = rand_chacha::ChaCha8Rng::from_entropy().gen::<u64>();

    let this = Arc::new(Self { socket: Arc::new(socket),
                               shutdown: Arc::new(AtomicBool::new(false)),
                               threads: Mutex::new(Vec::new()),
                               workers: Arc::new(Mutex::new(Vec::new())),
                               next_worker_id: AtomicU64::new(0),
                               transactions:
                                 Arc::new(TransactionPool::new(config.con,
                                                                config.dedup.exchange_lifetime)),
                               resources,
                               config,
                               token_counter: AtomicU64::new(0),
                               token_salt,
                               tick_signal: Arc::new((Mutex::new(()), Condvar::new())),
                               idle_signal: Arc::new((Mutex::new(()), Condvar::new())) });

    this.spawn_worker();

    let (ingress_tx, ingress_rx) = std::sync::mpsc::channel::<(Vec<u8>, SocketAddr)>();
    let (valid_tx, valid_rx) = std::sync::mpsc::channel::<Packet>();

    this.clone().spawn_listen_loop(ingress_tx);
    this.clone().spawn_ingress_filter_loop(ingress_rx, valid_tx);
    this.clone().spawn_dedup_loop(valid_rx);
    this.clone().spawn_transaction_tick_loop();
    this.clone().spawn_worker_lifecycle_loop();

    Ok(this)
  }

  /// Generate the next outbound token: an 8-byte value combining a random
  /// per-process salt with a monotonic counter, so tokens are unique per peer
  /// across concurrent transactions without the single-byte wraparound
  /// collision a naive counter would have.
  pub fn next_token(&self) -> Vec<u8> {
    let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
    (n ^ self.token_salt).to_be_bytes().to_vec()
  }

  /// The local address this dispatcher's socket is bound to.
  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.socket.local_addr()
  }

  /// Has the overall (possibly block-wise) transaction `packet` belongs to
  /// failed -- exhausted its retransmission budget, or been RST?
  ///
  /// A resource handler tracking a multi-block transfer it initiated should
  /// poll this (via the shared transaction tables, not a raised error) to
  /// learn of failure, per the error handling design's `TransactionTimeout`
  /// and `RemoteReset` kinds.
  pub fn is_overall_transaction_failed(&self, packet: &Packet) -> bool {
    self.transactions.is_overall_transaction_failed(packet)
  }

  /// Has every per-block transaction under `packet`'s overall transaction
  /// finished successfully?
  pub fn is_overall_transaction_complete(&self, packet: &Packet) -> bool {
    self.transactions.is_overall_transaction_complete(packet)
  }

  /// Send a CON request, registering it with the transaction pool for
  /// retransmission until ACKed.
  pub fn send_con(&self, mut packet: Packet, remote: SocketAddr) -> Result<(), DispatchError> {
    packet.ty = Type::Con;
    packet.remote = Some(remote);
    self.send_raw(&packet, remote)?;
    self.transactions.add_transaction(packet);
    Ok(())
  }

  /// Send a packet without any reliability tracking (used for NON, ACK, RST,
  /// and any reply synthesized by a resource handler).
  pub fn send_raw(&self, packet: &Packet, remote: SocketAddr) -> Result<(), DispatchError> {
    let bytes = packet.encode().map_err(|e| {
                                  When::SendingMessage(remote, packet.id, packet.token.clone())
                                                                                           .what(What::ToBytes(e))
                                })?;
    self.socket
        .send_to(&bytes, remote)
        .map(|_| ())
        .map_err(|e| {
          When::SendingMessage(remote, packet.id, packet.token.clone()).what(What::SocketError(e))
        })
  }

  /// Request shutdown: stop accepting new work, stop every worker, and join
  /// all background threads. Returns control to the caller instead of
  /// exiting the process, since this is a library rather than the reference
  /// implementation's CLI.
  pub fn stop(&self) {
    self.shutdown.store(true, Ordering::SeqCst);
    self.tick_signal.1.notify_all();
    self.idle_signal.1.notify_all();

    for handle in self.threads.lock().unwrap().drain(..) {
      let _ = handle.join();
    }

    for worker in self.workers.lock().unwrap().drain(..) {
      worker.stop();
    }
  }

  fn running(&self) -> bool {
    !self.shutdown.load(Ordering::SeqCst)
  }

  fn spawn_worker(&self) {
    let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
    let resources = Arc::clone(&self.resources);
    let socket = Arc::clone(&self.socket);

    let reply: Arc<dyn Fn(Addrd<Packet>) + Send + Sync> = Arc::new(move |Addrd(packet, remote)| {
      if let Ok(bytes) = packet.encode() {
        if let Err(e) = socket.send_to(&bytes, remote) {
          error!("failed to send handler response to {remote}: {e}");
        }
      }
    });

    let worker = Worker::spawn(id as usize, resources, reply);
    self.workers.lock().unwrap().push(worker);
  }

  fn spawn_listen_loop(self: Arc<Self>, ingress_tx: std::sync::mpsc::Sender<(Vec<u8>, SocketAddr)>) {
    let handle = std::thread::spawn(move || {
      let mut buf = vec![0u8; MAX_DGRAM_SIZE];
      while self.running() {
        match self.socket.recv_from(&mut buf) {
          | Ok((n, remote)) => {
            if ingress_tx.send((buf[..n].to_vec(), remote)).is_err() {
              break;
            }
          },
          | Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                      || e.kind() == std::io::ErrorKind::TimedOut => {},
          | Err(e) => warn!("listen loop socket error: {e}"),
        }
        self.tick_signal.1.notify_all();
        self.idle_signal.1.notify_all();
      }
      info!("listen loop stopped");
    });
    self.threads.lock().unwrap().push(handle);
  }

  fn spawn_ingress_filter_loop(self: Arc<Self>,
                                 ingress_rx: std::sync::mpsc::Receiver<(Vec<u8>, SocketAddr)>,
                                 valid_tx: std::sync::mpsc::Sender<Packet>) {
    let handle = std::thread::spawn(move || {
      while self.running() {
        let (bytes, remote) = match ingress_rx.recv_timeout(Duration::from_secs(1)) {
          | Ok(item) => item,
          | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
          | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let packet = Packet::decode(&bytes, remote);
        if !packet.is_well_formed() {
          debug!("malformed packet from {remote}, replying 5.00");
          let mut resp = Packet::new(Type::Reset, Code::INTERNAL_SERVER_ERROR, packet.id);
          resp.token = packet.token.clone();
          let _ = self.send_raw(&resp, remote);
          continue;
        }

        match packet.ty {
          | Type::Con => {
            if self.transactions.is_overall_transaction_failed(&packet) {
              debug!("dropping CON for already-failed overall transaction");
              continue;
            }
            let ack = synthesize_ack(&packet);
            let _ = self.send_raw(&ack, remote);
            if valid_tx.send(packet).is_err() {
              break;
            }
          },
          | Type::Ack => self.transactions.finish_transaction(&packet),
          | Type::Reset => {
            warn!("RST received from {remote}, failing overall transaction");
            self.transactions.set_overall_transaction_failure(&packet);
            self.transactions.finish_overall_transaction(&packet);
          },
          | Type::Non => {
            if valid_tx.send(packet).is_err() {
              break;
            }
          },
        }
      }
      info!("ingress filter loop stopped");
    });
    self.threads.lock().unwrap().push(handle);
  }

  fn spawn_dedup_loop(self: Arc<Self>, valid_rx: std::sync::mpsc::Receiver<Packet>) {
    let short_seen = Mutex::new(HashMap::<ShortTermId, Instant>::new());
    let long_seen = Mutex::new(HashMap::<LongTermId, Instant>::new());

    let handle = std::thread::spawn(move || {
      while self.running() {
        let packet = match valid_rx.recv_timeout(Duration::from_secs(1)) {
          | Ok(p) => p,
          | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
          | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let ttl = self.config.dedup.exchange_lifetime;
        let now = Instant::now();

        let short_id = packet.short_term_work_id();
        let long_id = packet.long_term_work_id();

        let mut short_map = short_seen.lock().unwrap();
        let mut long_map = long_seen.lock().unwrap();
        short_map.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
        long_map.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);

        let duplicate = short_map.contains_key(&short_id)
                         || long_id.as_ref().is_some_and(|id| long_map.contains_key(id));

        if duplicate {
          debug!("dropping duplicate work {:?}", short_id);
          continue;
        }

        match &long_id {
          | Some(id) => {
            long_map.insert(id.clone(), now);
          },
          | None => {
            short_map.insert(short_id, now);
          },
        }
        drop(short_map);
        drop(long_map);

        self.dispatch_to_worker(packet);
      }
      info!("deduplication loop stopped");
    });
    self.threads.lock().unwrap().push(handle);
  }

  fn dispatch_to_worker(&self, packet: Packet) {
    let remote = packet.remote.expect("decoded packets always carry a remote address");
    let workers = self.workers.lock().unwrap();

    let candidate = workers.iter()
                            .filter(|w| {
                              !w.is_heavily_loaded(self.config.worker_pool.heavy_load_queue_len)
                              && w.get_queue_size() < self.config.worker_pool.max_queue_len
                            })
                            .min_by_key(|w| w.get_queue_size());

    match candidate {
      | Some(worker) => worker.submit_task(Addrd(packet, remote)),
      | None => {
        drop(workers);
        self.spawn_worker();
        if let Some(worker) = self.workers.lock().unwrap().last() {
          worker.submit_task(Addrd(packet, remote));
        }
      },
    }
  }

  fn spawn_transaction_tick_loop(self: Arc<Self>) {
    let handle = std::thread::spawn(move || {
      while self.running() {
        let (lock, cvar) = &*self.tick_signal;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout(guard, Duration::from_secs(1)).unwrap();

        let socket = Arc::clone(&self.socket);
        self.transactions.solve_transactions(|packet| {
          if let (Ok(bytes), Some(remote)) = (packet.encode(), packet.remote) {
            if let Err(e) = socket.send_to(&bytes, remote) {
              warn!("retransmit to {remote} failed: {e}");
            }
          }
        });
      }
      info!("transaction tick loop stopped");
    });
    self.threads.lock().unwrap().push(handle);
  }

  fn spawn_worker_lifecycle_loop(self: Arc<Self>) {
    let handle = std::thread::spawn(move || {
      while self.running() {
        let (lock, cvar) = &*self.idle_signal;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout(guard, Duration::from_secs(60)).unwrap();

        let mut workers = self.workers.lock().unwrap();
        if workers.len() <= 1 {
          continue;
        }

        let idle_threshold = self.config.worker_pool.allowed_idle_time;
        let retire_idx = workers.iter()
                                 .position(|w| w.get_idle_time() > idle_threshold)
                                 .filter(|_| workers.len() > 1);

        if let Some(idx) = retire_idx {
          let worker = workers.remove(idx);
          drop(workers);
          info!("retiring idle worker {}", worker.id());
          worker.stop();
        }
      }
      info!("worker lifecycle loop stopped");
    });
    self.threads.lock().unwrap().push(handle);
  }
}

/// Build the ACK this endpoint should send immediately upon receiving `con`.
///
/// A bare request gets an empty ACK; a 2.xx response carrying a Block option
/// gets a 2.03 VALID ACK echoing the block identifier, so the sender can
/// advance its block window without waiting for a piggybacked reply.
fn synthesize_ack(con: &Packet) -> Packet {
  let mut ack = Packet::new(Type::Ack, Code::EMPTY, con.id);
  ack.token = con.token.clone();

  if con.code.kind() == CodeKind::Response {
    ack.code = Code::VALID;
    for number in [coap_wire::option::number::BLOCK1, coap_wire::option::number::BLOCK2] {
      if let Some(value) = con.option(number) {
        ack.add_option(number, value.to_vec());
      }
    }
  }

  ack
}
