use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use coap_wire::Packet;
use log::{debug, warn};

use crate::config::Con;
use crate::retry::{Attempts, RetryTimer, YouShould};

type ShortTermId = (SocketAddr, u16);
type GeneralId = (SocketAddr, Vec<u8>);

/// A single outstanding CON awaiting its ACK or a terminal RST.
struct Transaction {
  packet: Packet,
  retry: RetryTimer,
  parent: GeneralId,
}

/// The composite state of an entire (possibly block-wise) exchange sharing a token.
#[derive(Default)]
struct OverallTransaction {
  failed: bool,
  /// Set once every child transaction has finished (ACKed) without the
  /// overall transaction having failed first.
  complete: bool,
  /// Short-term ids of transactions still outstanding under this overall transaction.
  children: Vec<ShortTermId>,
  /// Total body size in bytes, from the first CON's Size1/Size2 option, if
  /// the sender advertised one up front. `None` when the total size isn't
  /// known ahead of time (the common case for a response produced on the fly).
  total_size: Option<u64>,
  /// When this overall transaction became terminal (completed or failed).
  /// `None` while still in flight. Swept once EXCHANGE_LIFETIME has passed,
  /// so a caller has a window to observe the terminal state before the entry
  /// is reclaimed, per RFC 7252's EXCHANGE_LIFETIME bound on retained
  /// exchange state.
  finished_at: Option<Instant>,
}

/// Read a Size1/Size2 option value as a big-endian integer, per RFC 7252
/// section 5.10.9 (the option is sized 0-4 bytes, uint encoding).
fn read_size_option(packet: &Packet) -> Option<u64> {
  use coap_wire::option::number::{SIZE1, SIZE2};

  [SIZE1, SIZE2].into_iter().find_map(|n| packet.option(n)).map(|bytes| {
                                                               bytes.iter()
                                                                    .fold(0u64, |acc, &b| {
                                                                      (acc << 8) | b as u64
                                                                    })
                                                             })
}

#[derive(Default)]
struct Tables {
  transactions: HashMap<ShortTermId, Transaction>,
  overall: HashMap<GeneralId, OverallTransaction>,
}

/// Process-wide registry of outstanding CON transactions and the overall
/// (possibly multi-block) exchanges they belong to.
///
/// Constructed once at startup and shared via `Arc` between the dispatcher
/// and every worker -- never re-derived through an implicit global lookup on
/// the hot path.
pub struct TransactionPool {
  tables: Mutex<Tables>,
  con_config: Con,
  exchange_lifetime: Duration,
}

impl TransactionPool {
  /// Create an empty pool using the given CON retry configuration. Terminal
  /// overall transactions (completed or failed) are reclaimed once
  /// `exchange_lifetime` has passed since they became terminal.
  pub fn new(con_config: Con, exchange_lifetime: Duration) -> Self {
    Self { tables: Mutex::new(Tables::default()), con_config, exchange_lifetime }
  }

  /// Record a CON awaiting an ACK. `general_work_id` identifies the overall
  /// exchange this transaction belongs to; a fresh overall transaction is
  /// created the first time a given id is seen.
  pub fn add_transaction(&self, packet: Packet) {
    let short = packet.short_term_work_id();
    let general = packet.general_work_id();

    let retry = RetryTimer::new(Instant::now(),
                                 self.con_config.retry_strategy,
                                 self.con_config.max_attempts);

    let size_hint = read_size_option(&packet);

    let mut tables = self.tables.lock().unwrap();
    let overall = tables.overall.entry(general.clone()).or_default();
    overall.children.push(short);
    overall.complete = false;
    overall.finished_at = None;
    if overall.total_size.is_none() {
      overall.total_size = size_hint;
    }
    tables.transactions.insert(short, Transaction { packet, retry, parent: general });
  }

  /// Look up the transaction matching an inbound ACK's `short_term_work_id`
  /// and remove it. Unknown ACKs (no matching transaction) are silently
  /// dropped, as CoAP permits.
  pub fn finish_transaction(&self, ack: &Packet) {
    let short = ack.short_term_work_id();
    let mut tables = self.tables.lock().unwrap();
    if let Some(txn) = tables.transactions.remove(&short) {
      if let Some(overall) = tables.overall.get_mut(&txn.parent) {
        overall.children.retain(|c| *c != short);
        if overall.children.is_empty() && !overall.failed {
          overall.complete = true;
          overall.finished_at = Some(Instant::now());
        }
      }
    } else {
      debug!("ACK for unknown transaction {:?}; dropping", short);
    }
  }

  /// Has the overall transaction this packet belongs to already failed?
  pub fn is_overall_transaction_failed(&self, packet: &Packet) -> bool {
    let general = packet.general_work_id();
    self.tables.lock().unwrap().overall.get(&general).map(|o| o.failed).unwrap_or(false)
  }

  /// Has every per-block transaction under this packet's overall transaction
  /// finished (ACKed) without the overall transaction having failed?
  ///
  /// `false` both before the transfer starts and while it is still in flight.
  pub fn is_overall_transaction_complete(&self, packet: &Packet) -> bool {
    let general = packet.general_work_id();
    self.tables.lock().unwrap().overall.get(&general).map(|o| o.complete).unwrap_or(false)
  }

  /// The total body size in bytes this overall transaction was told to expect
  /// up front, via a Size1/Size2 option on its first CON -- `None` if no such
  /// option was present.
  pub fn overall_transaction_total_size(&self, packet: &Packet) -> Option<u64> {
    let general = packet.general_work_id();
    self.tables.lock().unwrap().overall.get(&general).and_then(|o| o.total_size)
  }

  /// Mark the overall transaction this packet belongs to as failed, removing
  /// every outstanding per-block transaction under it without further retransmission.
  pub fn set_overall_transaction_failure(&self, packet: &Packet) {
    let general = packet.general_work_id();
    let mut tables = self.tables.lock().unwrap();
    if let Some(overall) = tables.overall.get_mut(&general) {
      overall.failed = true;
      overall.finished_at = Some(Instant::now());
      for child in overall.children.drain(..) {
        tables.transactions.remove(&child);
      }
    }
  }

  /// Remove the overall transaction this packet belongs to (and anything
  /// still outstanding under it) entirely.
  pub fn finish_overall_transaction(&self, packet: &Packet) {
    let general = packet.general_work_id();
    let mut tables = self.tables.lock().unwrap();
    if let Some(overall) = tables.overall.remove(&general) {
      for child in overall.children {
        tables.transactions.remove(&child);
      }
    }
  }

  /// Called periodically by the transaction-tick service loop. Re-sends any
  /// transaction whose retry deadline has passed (via `send`), and marks the
  /// owning overall transaction failed once a transaction exhausts its
  /// retransmission budget.
  pub fn solve_transactions(&self, mut send: impl FnMut(&Packet)) {
    let now = Instant::now();
    let mut to_fail = Vec::new();
    let mut to_resend = Vec::new();

    {
      let mut tables = self.tables.lock().unwrap();
      for (id, txn) in tables.transactions.iter_mut() {
        match txn.retry.what_should_i_do(now) {
          | YouShould::Retry => to_resend.push(txn.packet.clone()),
          | YouShould::Cry => to_fail.push((*id, txn.parent.clone())),
          | YouShould::Wait => {},
        }
      }
    }

    for packet in &to_resend {
      send(packet);
    }

    if !to_fail.is_empty() {
      let mut tables = self.tables.lock().unwrap();
      for (short, general) in to_fail {
        warn!("transaction {:?} exhausted its retransmission budget", short);
        tables.transactions.remove(&short);
        if let Some(overall) = tables.overall.get_mut(&general) {
          overall.failed = true;
          overall.finished_at = Some(now);
          overall.children.retain(|c| *c != short);
        }
      }
    }

    let mut tables = self.tables.lock().unwrap();
    tables.overall.retain(|_, overall| {
                     overall.finished_at
                            .map(|at| now.duration_since(at) < self.exchange_lifetime)
                            .unwrap_or(true)
                   });
  }

  /// Number of transactions currently outstanding. Exposed for tests.
  pub fn len(&self) -> usize {
    self.tables.lock().unwrap().transactions.len()
  }

  /// Number of overall transactions currently tracked (in flight or not yet
  /// swept past EXCHANGE_LIFETIME). Exposed for tests.
  pub fn overall_len(&self) -> usize {
    self.tables.lock().unwrap().overall.len()
  }
}

#[cfg(test)]
mod test {
  use std::time::Duration;

  use coap_wire::{Code, Type};

  use super::*;

  fn addr() -> SocketAddr {
    "10.0.0.1:5683".parse().unwrap()
  }

  /// A pool with a generous EXCHANGE_LIFETIME, for tests that don't care
  /// about sweeping.
  fn pool(con: Con) -> TransactionPool {
    TransactionPool::new(con, Duration::from_secs(247))
  }

  fn con_packet(id: u16, token: &[u8]) -> Packet {
    let mut p = Packet::new(Type::Con, Code::GET, id);
    p.token = token.to_vec();
    p.remote = Some(addr());
    p
  }

  #[test]
  fn finish_removes_transaction() {
    let pool = pool(Con { max_attempts: Attempts(4),
                          ..Con::default() });
    let p = con_packet(1, &[0x01]);
    pool.add_transaction(p.clone());
    assert_eq!(pool.len(), 1);

    let mut ack = p.clone();
    ack.ty = coap_wire::Type::Ack;
    pool.finish_transaction(&ack);
    assert_eq!(pool.len(), 0);
  }

  #[test]
  fn overall_transaction_completes_once_every_child_is_acked() {
    let pool = pool(Con::default());
    let a = con_packet(1, &[0x0A]);
    let b = {
      let mut b = con_packet(2, &[0x0A]);
      b.remote = a.remote;
      b
    };
    pool.add_transaction(a.clone());
    pool.add_transaction(b.clone());
    assert!(!pool.is_overall_transaction_complete(&a));

    let mut ack_a = a.clone();
    ack_a.ty = Type::Ack;
    pool.finish_transaction(&ack_a);
    assert!(!pool.is_overall_transaction_complete(&a), "one child still outstanding");

    let mut ack_b = b.clone();
    ack_b.ty = Type::Ack;
    pool.finish_transaction(&ack_b);
    assert!(pool.is_overall_transaction_complete(&a), "both children acked");
  }

  #[test]
  fn overall_transaction_remembers_size_hint_from_first_con() {
    let pool = pool(Con::default());
    let mut p = con_packet(1, &[0x0B]);
    p.add_option(coap_wire::option::number::SIZE1, 1024u32.to_be_bytes().to_vec());

    pool.add_transaction(p.clone());
    assert_eq!(pool.overall_transaction_total_size(&p), Some(1024));
  }

  #[test]
  fn unknown_ack_is_dropped_silently() {
    let pool = pool(Con::default());
    let ack = con_packet(99, &[0xFF]);
    pool.finish_transaction(&ack);
    assert_eq!(pool.len(), 0);
  }

  #[test]
  fn exhausting_retries_fails_overall_transaction() {
    let pool = pool(Con { retry_strategy:
                            crate::retry::Strategy::Delay { min: Duration::from_millis(1),
                                                            max: Duration::from_millis(1) },
                          max_attempts: Attempts(2) });
    let p = con_packet(5, &[0x05]);
    pool.add_transaction(p.clone());

    std::thread::sleep(Duration::from_millis(5));
    pool.solve_transactions(|_| {});
    assert_eq!(pool.len(), 1);
    assert!(!pool.is_overall_transaction_failed(&p));

    std::thread::sleep(Duration::from_millis(5));
    pool.solve_transactions(|_| {});
    assert_eq!(pool.len(), 0);
    assert!(pool.is_overall_transaction_failed(&p));
  }

  #[test]
  fn failing_overall_removes_all_children() {
    let pool = pool(Con::default());
    let a = con_packet(1, &[0x0A]);
    let b = {
      let mut b = con_packet(2, &[0x0A]);
      b.remote = a.remote;
      b
    };
    pool.add_transaction(a.clone());
    pool.add_transaction(b);
    assert_eq!(pool.len(), 2);

    pool.set_overall_transaction_failure(&a);
    assert_eq!(pool.len(), 0);
    assert!(pool.is_overall_transaction_failed(&a));
  }

  #[test]
  fn completed_overall_transaction_is_swept_after_exchange_lifetime() {
    let pool = TransactionPool::new(Con::default(), Duration::from_millis(5));
    let p = con_packet(1, &[0x0C]);
    pool.add_transaction(p.clone());
    assert_eq!(pool.overall_len(), 1);

    let mut ack = p.clone();
    ack.ty = Type::Ack;
    pool.finish_transaction(&ack);
    assert!(pool.is_overall_transaction_complete(&p));
    assert_eq!(pool.overall_len(), 1, "still observable right after completion");

    std::thread::sleep(Duration::from_millis(10));
    pool.solve_transactions(|_| {});
    assert_eq!(pool.overall_len(), 0, "reclaimed once past exchange lifetime");
  }

  #[test]
  fn failed_overall_transaction_is_swept_after_exchange_lifetime() {
    let pool = TransactionPool::new(Con::default(), Duration::from_millis(5));
    let p = con_packet(1, &[0x0D]);
    pool.add_transaction(p.clone());

    pool.set_overall_transaction_failure(&p);
    assert_eq!(pool.overall_len(), 1, "still observable right after failing");

    std::thread::sleep(Duration::from_millis(10));
    pool.solve_transactions(|_| {});
    assert_eq!(pool.overall_len(), 0, "reclaimed once past exchange lifetime");
  }
}
