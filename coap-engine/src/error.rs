use std::net::SocketAddr;

use coap_wire::ParseError;

/// The context a [`DispatchError`] occurred in.
#[derive(Debug, Clone)]
pub enum When {
  /// Reading from the UDP socket.
  Polling,
  /// Decoding a just-received datagram from `remote`.
  Decoding(SocketAddr),
  /// Sending a message to `remote` with the given message id and token.
  SendingMessage(SocketAddr, u16, Vec<u8>),
  /// Running `solve_transactions` for the transaction pool.
  Retrying,
  /// No specific step; a general condition.
  None,
}

impl When {
  /// Attach a cause to this context, yielding a complete error.
  pub fn what(self, what: What) -> DispatchError {
    DispatchError { when: self, what }
  }
}

/// An error surfaced while dispatching or retrying CoAP exchanges.
///
/// Nearly all of these are absorbed inside the dispatcher (logged and turned
/// into a wire response or a state transition, per the propagation policy) --
/// only a handful ever reach a caller as `Result::Err`.
#[derive(Debug)]
pub struct DispatchError {
  /// What happened.
  pub what: What,
  /// What the dispatcher was doing when it happened.
  pub when: When,
}

impl DispatchError {
  /// Shorthand for constructing an error with no particular context.
  pub fn new(what: What) -> Self {
    When::None.what(what)
  }
}

impl std::fmt::Display for DispatchError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{:?} (while: {:?})", self.what, self.when)
  }
}

impl std::error::Error for DispatchError {}

/// The cause of a [`DispatchError`].
#[derive(Debug)]
pub enum What {
  /// The inbound datagram failed to parse.
  FromBytes(ParseError),
  /// A packet could not be serialized (e.g. token too long).
  ToBytes(coap_wire::EncodeError),
  /// A `std::net::UdpSocket` operation failed.
  SocketError(std::io::Error),
  /// Binding the listening socket failed; this is the one error variant that
  /// is always surfaced to the caller of `Dispatcher::start` rather than absorbed.
  BindFailed(std::io::Error),
  /// A CONfirmable message exhausted its retransmission budget without an ACK.
  MessageNeverAcked,
  /// A RST was received for this exchange.
  RemoteReset,
}
