use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use coap_wire::Packet;
use log::debug;

use crate::net::Addrd;
use crate::resource::ResourceManager;

/// A cooperative task runner with a single-consumer FIFO queue of packets to
/// dispatch to resource handlers.
///
/// Backed by a `std::sync::mpsc` channel and a dedicated OS thread -- the
/// teacher crate targets `no_std` and has no direct analogue for this, so the
/// shape (small owned state, `log` for diagnostics, explicit lifecycle
/// methods) is carried over from its worker-adjacent code and the channel
/// itself is idiomatic `std`.
pub struct Worker {
  id: usize,
  sender: mpsc::Sender<Addrd<Packet>>,
  queue_len: Arc<AtomicUsize>,
  last_completed: Arc<Mutex<Instant>>,
  handle: Option<JoinHandle<()>>,
}

impl Worker {
  /// Spawn a worker thread that dispatches submitted packets to `resources`
  /// and forwards the handler's response through `reply`.
  pub fn spawn(id: usize,
               resources: Arc<ResourceManager>,
               reply: Arc<dyn Fn(Addrd<Packet>) + Send + Sync>)
               -> Self {
    let (sender, receiver) = mpsc::channel::<Addrd<Packet>>();
    let queue_len = Arc::new(AtomicUsize::new(0));
    let last_completed = Arc::new(Mutex::new(Instant::now()));

    let queue_len_thread = Arc::clone(&queue_len);
    let last_completed_thread = Arc::clone(&last_completed);

    let handle = std::thread::spawn(move || {
      loop {
        match receiver.recv_timeout(Duration::from_secs(1)) {
          | Ok(Addrd(packet, remote)) => {
            let response = resources.dispatch(&packet);
            reply(Addrd(response, remote));
            queue_len_thread.fetch_sub(1, Ordering::SeqCst);
            *last_completed_thread.lock().unwrap() = Instant::now();
          },
          | Err(RecvTimeoutError::Timeout) => continue,
          | Err(RecvTimeoutError::Disconnected) => {
            debug!("worker {id} stopping: channel disconnected");
            break;
          },
        }
      }
    });

    Self { id, sender, queue_len, last_completed, handle: Some(handle) }
  }

  /// This worker's id, stable for its lifetime.
  pub fn id(&self) -> usize {
    self.id
  }

  /// Enqueue a packet for this worker to dispatch. Fails silently (logged)
  /// if the worker has already stopped.
  pub fn submit_task(&self, task: Addrd<Packet>) {
    self.queue_len.fetch_add(1, Ordering::SeqCst);
    if self.sender.send(task).is_err() {
      self.queue_len.fetch_sub(1, Ordering::SeqCst);
      debug!("worker {} submit failed: already stopped", self.id);
    }
  }

  /// Current number of packets queued but not yet dispatched.
  pub fn get_queue_size(&self) -> usize {
    self.queue_len.load(Ordering::SeqCst)
  }

  /// Is this worker's queue at or past the configured high-water mark?
  pub fn is_heavily_loaded(&self, threshold: usize) -> bool {
    self.get_queue_size() >= threshold
  }

  /// Wall time since this worker last finished a task (or since it was
  /// spawned, if it has never completed one).
  pub fn get_idle_time(&self) -> Duration {
    self.last_completed.lock().unwrap().elapsed()
  }

  /// Stop accepting new tasks and join the worker thread, draining whatever
  /// is already queued first.
  pub fn stop(mut self) {
    drop(self.sender);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}
