use std::net::SocketAddr;

/// Data that came from, or is bound for, a network socket.
///
/// Carried over from the teacher crate's `net::Addrd` wrapper, minus the
/// `no_std_net` indirection -- this crate runs on a hosted `std` target, so
/// `std::net::SocketAddr` is used directly.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Addrd<T>(pub T, pub SocketAddr);

impl<T> Addrd<T> {
  /// Borrow the contents of this `Addrd`.
  pub fn as_ref(&self) -> Addrd<&T> {
    Addrd(self.data(), self.addr())
  }

  /// Discard the address and get the data.
  pub fn unwrap(self) -> T {
    self.0
  }

  /// Map the data, keeping the address.
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Addrd<R> {
    Addrd(f(self.0), self.1)
  }

  /// Borrow the contents.
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Copy the address.
  pub fn addr(&self) -> SocketAddr {
    self.1
  }
}
