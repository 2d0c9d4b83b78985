/// The four CoAP message types (RFC 7252 section 3).
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Type {
  /// Confirmable. The sender expects an ACK or RST.
  Con,
  /// Non-confirmable. No acknowledgement is expected.
  Non,
  /// Acknowledgement of a Confirmable message.
  Ack,
  /// Reset: the recipient could not process a Confirmable or Non-confirmable message.
  Reset,
}

impl Type {
  /// Decode the 2-bit `T` field of the first header byte.
  ///
  /// Every value in `[0, 3]` is valid; this cannot fail.
  pub const fn from_bits(bits: u8) -> Self {
    match bits & 0b11 {
      | 0 => Self::Con,
      | 1 => Self::Non,
      | 2 => Self::Ack,
      | _ => Self::Reset,
    }
  }

  /// Encode as the 2-bit `T` field of the first header byte.
  pub const fn to_bits(self) -> u8 {
    match self {
      | Self::Con => 0,
      | Self::Non => 1,
      | Self::Ack => 2,
      | Self::Reset => 3,
    }
  }
}
