use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::code::Code;
use crate::error::{EncodeError, ParseError};
use crate::ty::Type;

/// The maximum size of a single UDP datagram this crate will read or write,
/// matching the IPv6 minimum MTU (1280) less IP/UDP headers -- the same bound
/// RFC 7252 section 4.6 recommends and the figure the spec calls out explicitly.
pub const MAX_DGRAM_SIZE: usize = 1152;

/// CoAP protocol version this crate implements. RFC 7252 defines only version 1;
/// any other value makes a packet [`Packet::is_well_formed`] will reject.
pub const VERSION: u8 = 1;

/// A single CoAP message, decoded from or ready to be encoded to the wire
/// (RFC 7252 section 3).
///
/// `remote` is not part of the wire format -- it is attached in memory to
/// record which peer a packet was received from (or should be sent to).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
  /// Protocol version. Always `1` for a well-formed packet; a decode failure
  /// is represented as a packet with this set to `0` (see [`Packet::decode`]).
  pub version: u8,
  /// CON / NON / ACK / RST.
  pub ty: Type,
  /// Opaque request/response correlation token, 0 to 8 bytes.
  pub token: Vec<u8>,
  /// Request or response code.
  pub code: Code,
  /// 16-bit message id, used to correlate a CON with its ACK/RST.
  pub id: u16,
  /// Options in ascending option-number order, each number mapped to one or
  /// more values (some options, like Uri-Path, are repeatable).
  pub options: BTreeMap<u16, Vec<Vec<u8>>>,
  /// Opaque message body.
  pub payload: Vec<u8>,
  /// The peer this packet came from (after [`Packet::decode`]) or should be sent to.
  pub remote: Option<SocketAddr>,
}

impl Packet {
  /// Construct an empty packet of the given type and code, with no token,
  /// options, or payload. Useful as a base for ACKs and RSTs.
  pub fn new(ty: Type, code: Code, id: u16) -> Self {
    Self { version: VERSION,
           ty,
           token: Vec::new(),
           code,
           id,
           options: BTreeMap::new(),
           payload: Vec::new(),
           remote: None }
  }

  /// Attach (or overwrite) the remote peer address.
  pub fn with_remote(mut self, remote: SocketAddr) -> Self {
    self.remote = Some(remote);
    self
  }

  /// Add one value to the named option, preserving ascending key order
  /// (falls out of using a `BTreeMap`, not something callers must maintain).
  pub fn add_option(&mut self, number: u16, value: impl Into<Vec<u8>>) {
    self.options.entry(number).or_default().push(value.into());
  }

  /// The single value of an option, if present, ignoring repeats past the first.
  pub fn option(&self, number: u16) -> Option<&[u8]> {
    self.options.get(&number).and_then(|vs| vs.first()).map(Vec::as_slice)
  }

  /// All option numbers carrying a Block1 or Block2 value present on this packet.
  pub fn block_option(&self, number: u16) -> Option<crate::option::Block> {
    self.option(number).and_then(crate::option::Block::from_be_bytes)
  }

  /// `version == 1`, the token length is in range, and the code's class is
  /// one RFC 7252 actually defines -- the post-decode validity check the
  /// dispatcher's ingress filter runs before routing a packet anywhere.
  pub fn is_well_formed(&self) -> bool {
    self.version == VERSION && self.token.len() <= 8 && self.code.is_valid_class()
  }

  /// `(remote, message_id)` -- unique per datagram attempt, drives
  /// duplicate-suppression of retransmitted CONs.
  pub fn short_term_work_id(&self) -> (SocketAddr, u16) {
    (self.remote.unwrap_or_else(unspecified_addr), self.id)
  }

  /// `(remote, token)` -- identifies every exchange sharing a token,
  /// used when a RST aborts a whole (possibly block-wise) flow.
  pub fn general_work_id(&self) -> (SocketAddr, Vec<u8>) {
    (self.remote.unwrap_or_else(unspecified_addr), self.token.clone())
  }

  /// `(remote, token, option_number, block_value)` -- identifies one block of
  /// a logical, possibly multi-block exchange. Only meaningful (and only
  /// returned) for a success response carrying a Block1 or Block2 option.
  ///
  /// The block's own raw value (NUM/M/SZX) is part of the id, not just the
  /// option number: two different blocks of the same transfer must reach two
  /// different workers, while two retransmissions of the *same* block (equal
  /// NUM/M/SZX) still collide onto one id so they dedup as expected.
  pub fn long_term_work_id(&self) -> Option<(SocketAddr, Vec<u8>, u16, u32)> {
    use crate::code::CodeKind;
    use crate::option::number::{BLOCK1, BLOCK2};

    if self.code.kind() != CodeKind::Response || self.code.class != 2 {
      return None;
    }

    [BLOCK2, BLOCK1].into_iter().find_map(|n| {
                                  self.block_option(n).map(|block| {
                                                        (self.remote.unwrap_or_else(unspecified_addr),
                                                         self.token.clone(),
                                                         n,
                                                         u32::from(block))
                                                      })
                                })
  }

  /// Serialize this packet to its RFC 7252 wire representation.
  pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
    if self.token.len() > 8 {
      return Err(EncodeError::TokenTooLong(self.token.len()));
    }

    let mut bytes = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);

    let byte0 = (VERSION << 6) | (self.ty.to_bits() << 4) | (self.token.len() as u8);
    bytes.push(byte0);
    bytes.push(self.code.into());
    bytes.extend_from_slice(&self.id.to_be_bytes());
    bytes.extend_from_slice(&self.token);

    let mut last_number = 0u16;
    for (&number, values) in &self.options {
      for value in values {
        encode_option(&mut bytes, number - last_number, value);
        last_number = number;
      }
    }

    if !self.payload.is_empty() {
      bytes.push(0xFF);
      bytes.extend_from_slice(&self.payload);
    }

    Ok(bytes)
  }

  /// Parse a packet from its wire representation.
  ///
  /// Never panics: any malformed input yields [`ParseError`] rather than a partial
  /// or incorrect packet.
  pub fn try_decode(bytes: &[u8]) -> Result<Self, ParseError> {
    if bytes.len() < 4 {
      return Err(ParseError::HeaderTooShort);
    }

    let version = bytes[0] >> 6;
    let ty = Type::from_bits(bytes[0] >> 4);
    let tkl = bytes[0] & 0b1111;
    if tkl > 8 {
      return Err(ParseError::InvalidTokenLength(tkl));
    }

    let code = Code::from(bytes[1]);
    let id = u16::from_be_bytes([bytes[2], bytes[3]]);

    let mut cursor = 4usize;
    let token_end = cursor + tkl as usize;
    let token = bytes.get(cursor..token_end).ok_or(ParseError::eof())?.to_vec();
    cursor = token_end;

    let mut options = BTreeMap::<u16, Vec<Vec<u8>>>::new();
    let mut last_number = 0u16;

    loop {
      match bytes.get(cursor) {
        | None => break,
        | Some(&0xFF) => {
          cursor += 1;
          break;
        },
        | Some(&head) => {
          let delta_nibble = head >> 4;
          let len_nibble = head & 0b1111;
          if delta_nibble == 15 || len_nibble == 15 {
            return Err(ParseError::OptionReservedNibble);
          }
          cursor += 1;

          let delta = decode_opt_ext(delta_nibble, bytes, &mut cursor)?;
          let len = decode_opt_ext(len_nibble, bytes, &mut cursor)? as usize;

          let value_end = cursor + len;
          let value = bytes.get(cursor..value_end).ok_or(ParseError::eof())?.to_vec();
          cursor = value_end;

          let number = last_number + delta;
          options.entry(number).or_default().push(value);
          last_number = number;
        },
      }
    }

    let payload = bytes.get(cursor..).unwrap_or(&[]).to_vec();

    Ok(Self { version, ty, token, code, id, options, payload, remote: None })
  }

  /// Infallible decode: a malformed datagram yields a packet with `version == 0`
  /// rather than propagating an error, so the ingress format filter can respond
  /// with a single uniform 5.00 rejection path (see the dispatcher's ingress
  /// filter in `coap-engine`).
  pub fn decode(bytes: &[u8], remote: SocketAddr) -> Self {
    Self::try_decode(bytes).map(|p| p.with_remote(remote)).unwrap_or_else(|_| {
                                                              let mut sentinel =
                                                                Self::new(Type::Reset,
                                                                          Code::EMPTY,
                                                                          0);
                                                              sentinel.version = 0;
                                                              sentinel.remote = Some(remote);
                                                              sentinel
                                                            })
  }
}

fn unspecified_addr() -> SocketAddr {
  use std::net::{IpAddr, Ipv4Addr};
  SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Encode one option's delta/length nibble header plus its value, appending to `bytes`.
fn encode_option(bytes: &mut Vec<u8>, delta: u16, value: &[u8]) {
  let (delta_nibble, delta_ext) = nibble_and_extension(delta);
  let (len_nibble, len_ext) = nibble_and_extension(value.len() as u16);

  bytes.push((delta_nibble << 4) | len_nibble);
  if let Some(ext) = delta_ext {
    bytes.extend_from_slice(&ext);
  }
  if let Some(ext) = len_ext {
    bytes.extend_from_slice(&ext);
  }
  bytes.extend_from_slice(value);
}

/// Split a delta or length value into its 4-bit header nibble and, for values
/// `>= 13`, the 1- or 2-byte big-endian extension that follows the header byte
/// (RFC 7252 section 3.1).
fn nibble_and_extension(n: u16) -> (u8, Option<Vec<u8>>) {
  match n {
    | n if n >= 269 => (14, Some((n - 269).to_be_bytes().to_vec())),
    | n if n >= 13 => (13, Some(vec![(n - 13) as u8])),
    | n => (n as u8, None),
  }
}

/// Reverse of [`nibble_and_extension`]: given the header nibble, read any
/// extension bytes from `bytes` at `*cursor` (advancing it) and return the
/// real delta or length value.
fn decode_opt_ext(nibble: u8, bytes: &[u8], cursor: &mut usize) -> Result<u16, ParseError> {
  match nibble {
    | 13 => {
      let b = *bytes.get(*cursor).ok_or(ParseError::eof())?;
      *cursor += 1;
      Ok(b as u16 + 13)
    },
    | 14 => {
      let pair = bytes.get(*cursor..*cursor + 2).ok_or(ParseError::eof())?;
      *cursor += 2;
      Ok(u16::from_be_bytes([pair[0], pair[1]]) + 269)
    },
    | n => Ok(n as u16),
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::option::number::URI_PATH;

  fn dummy_addr() -> SocketAddr {
    "192.168.0.1:8080".parse().unwrap()
  }

  #[test]
  fn encode_then_decode_is_identity() {
    let mut p = Packet::new(Type::Con, Code::GET, 42);
    p.token = vec![0xAB, 0xCD];
    p.add_option(URI_PATH, "hello".as_bytes().to_vec());
    p.payload = b"body".to_vec();

    let bytes = p.encode().unwrap();
    let decoded = Packet::try_decode(&bytes).unwrap();

    assert_eq!(decoded.version, 1);
    assert_eq!(decoded.ty, Type::Con);
    assert_eq!(decoded.code, Code::GET);
    assert_eq!(decoded.id, 42);
    assert_eq!(decoded.token, p.token);
    assert_eq!(decoded.options, p.options);
    assert_eq!(decoded.payload, p.payload);
  }

  #[test]
  fn no_payload_marker_when_payload_empty() {
    let p = Packet::new(Type::Con, Code::CONTENT, 1);
    let bytes = p.encode().unwrap();
    assert_ne!(bytes.last(), Some(&0xFF));
  }

  #[test]
  fn large_option_numbers_use_13_and_14_extensions() {
    // Block2 (23) then Size1 (60): a delta of 37 needs the 13-extension.
    let mut p = Packet::new(Type::Ack, Code::CONTENT, 7);
    p.add_option(23, vec![0x01]);
    p.add_option(60, vec![0x02, 0x03]);

    let bytes = p.encode().unwrap();
    let decoded = Packet::try_decode(&bytes).unwrap();
    assert_eq!(decoded.options, p.options);

    // A number requiring the 14-bit extension (>= 269) round-trips too.
    let mut p2 = Packet::new(Type::Con, Code::GET, 1);
    p2.add_option(300, vec![0xFF; 5]);
    let bytes2 = p2.encode().unwrap();
    let decoded2 = Packet::try_decode(&bytes2).unwrap();
    assert_eq!(decoded2.options, p2.options);
  }

  #[test]
  fn decode_never_panics_on_truncated_options() {
    // Header says there's a 2-byte token but only 1 byte follows.
    let bytes = [0x41, 0x01, 0x00, 0x01, 0xAA];
    assert!(Packet::try_decode(&bytes).is_err());
    // The infallible wrapper still returns a sentinel, not a panic.
    let sentinel = Packet::decode(&bytes, dummy_addr());
    assert_eq!(sentinel.version, 0);
  }

  #[test]
  fn decode_rejects_bad_version() {
    // version = 2 in the top 2 bits.
    let bytes = [0b1000_0000, 0x01, 0x00, 0x01];
    let decoded = Packet::try_decode(&bytes).unwrap();
    assert_eq!(decoded.version, 2);
    assert!(!decoded.is_well_formed());

    let sentinel = Packet::decode(&bytes, dummy_addr());
    assert!(!sentinel.is_well_formed());
  }

  #[test]
  fn decode_rejects_reserved_code_class() {
    // version = 1, class = 1 (reserved), detail = 1 -- a well-formed header
    // with a code RFC 7252 doesn't define.
    let bytes = [0b0100_0000, 0b0010_0001, 0x00, 0x01];
    let decoded = Packet::try_decode(&bytes).unwrap();
    assert_eq!(decoded.version, 1);
    assert_eq!(decoded.code.class, 1);
    assert!(!decoded.is_well_formed(), "class 1 is reserved, not a valid request/response");

    let valid = Packet::new(Type::Con, Code::GET, 1);
    assert!(valid.is_well_formed());
  }

  #[test]
  fn decode_rejects_reserved_option_nibble() {
    // A header byte of 0xF0 has the reserved delta nibble 15 without being the 0xFF marker.
    let bytes = [0x40, 0x01, 0x00, 0x01, 0xF0];
    assert_eq!(Packet::try_decode(&bytes), Err(ParseError::OptionReservedNibble));
  }

  #[test]
  fn long_term_work_id_only_for_block_success_responses() {
    let mut p = Packet::new(Type::Ack, Code::CONTENT, 1);
    p.token = vec![0x05];
    assert!(p.long_term_work_id().is_none());

    p.add_option(crate::option::number::BLOCK2, crate::option::Block::new(64, 0, true).to_be_bytes());
    assert!(p.long_term_work_id().is_some());

    let mut req = Packet::new(Type::Con, Code::GET, 1);
    req.add_option(crate::option::number::BLOCK2, vec![0x00]);
    assert!(req.long_term_work_id().is_none());
  }

  #[test]
  fn long_term_work_id_distinguishes_block_numbers_but_not_retries() {
    let block_packet = |num: u32| {
      let mut p = Packet::new(Type::Con, Code::CONTENT, num as u16);
      p.token = vec![0x05];
      p.add_option(crate::option::number::BLOCK2, crate::option::Block::new(64, num, true).to_be_bytes());
      p
    };

    let block0 = block_packet(0);
    let block1 = block_packet(1);
    let block0_retry = block_packet(0);

    assert_ne!(block0.long_term_work_id(), block1.long_term_work_id(),
               "distinct blocks of the same transfer must not collide in the dedup map");
    assert_eq!(block0.long_term_work_id(), block0_retry.long_term_work_id(),
               "retransmissions of the same block must still dedup");
  }
}
