/// Well-known CoAP option numbers (RFC 7252 section 12.2, RFC 7959 section 2.1).
pub mod number {
  /// Observe (RFC 7641) -- not acted on by this crate beyond being a recognized number.
  pub const OBSERVE: u16 = 6;
  /// Location-Path, used by 2.01 Created responses.
  pub const LOCATION_PATH: u16 = 8;
  /// Uri-Path, one path segment per option instance.
  pub const URI_PATH: u16 = 11;
  /// Content-Format.
  pub const CONTENT_FORMAT: u16 = 12;
  /// Uri-Query, one `key=value` pair per option instance.
  pub const URI_QUERY: u16 = 15;
  /// Block2: block-wise transfer of the response body (RFC 7959).
  pub const BLOCK2: u16 = 23;
  /// Block1: block-wise transfer of the request body (RFC 7959).
  pub const BLOCK1: u16 = 27;
  /// Size2: the total size of the response body, advertised before transfer completes.
  pub const SIZE2: u16 = 28;
  /// Size1: the total size of the request body.
  pub const SIZE1: u16 = 60;
}

/// Either [`number::BLOCK1`] or [`number::BLOCK2`] -- the two option numbers that
/// identify a long-running, block-wise exchange.
pub fn is_block_option(n: u16) -> bool {
  n == number::BLOCK1 || n == number::BLOCK2
}

/// A decoded Block1/Block2 option value (RFC 7959 section 2.2).
///
/// Packed identically to the wire's single-to-three-byte integer: `NUM << 4 | M << 3 | SZX`.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Block(u32);

impl Block {
  /// Build a Block value from its three logical fields.
  ///
  /// `size` is rounded down to the nearest power of two in `[16, 1024]`.
  pub fn new(size: u16, num: u32, more: bool) -> Self {
    let szx = (size.clamp(16, 1024) as f32).log2() as u32 - 4;
    Self((num << 4) | (u32::from(more) << 3) | szx)
  }

  /// Block size in bytes, `2^(SZX+4)`, always in `[16, 1024]`.
  pub fn size(&self) -> u16 {
    let szx = (self.0 & 0b111).min(6);
    2u16.pow(szx + 4)
  }

  /// Whether more blocks follow this one.
  pub fn more(&self) -> bool {
    (self.0 & 0b1000) != 0
  }

  /// The 0-based index of this block within the overall transfer.
  pub fn num(&self) -> u32 {
    self.0 >> 4
  }

  /// Parse from the big-endian bytes found in a Block1/Block2 option value.
  pub fn from_be_bytes(bytes: &[u8]) -> Option<Self> {
    if bytes.is_empty() || bytes.len() > 3 {
      return None;
    }
    let mut buf = [0u8; 4];
    buf[4 - bytes.len()..].copy_from_slice(bytes);
    Some(Self(u32::from_be_bytes(buf)))
  }

  /// Serialize to the minimal big-endian byte representation used on the wire.
  pub fn to_be_bytes(self) -> Vec<u8> {
    let bytes = self.0.to_be_bytes();
    match self.0 {
      | n if n < 0x100 => vec![bytes[3]],
      | n if n < 0x1_0000 => bytes[2..].to_vec(),
      | _ => bytes[1..].to_vec(),
    }
  }
}

impl From<Block> for u32 {
  fn from(b: Block) -> Self {
    b.0
  }
}

impl From<u32> for Block {
  fn from(n: u32) -> Self {
    Self(n)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn block_fields() {
    let b = Block::from(33);
    assert_eq!(b.size(), 32);
    assert_eq!(b.num(), 2);
    assert!(!b.more());

    let b = Block::from(59);
    assert_eq!(b.size(), 128);
    assert_eq!(b.num(), 3);
    assert!(b.more());
  }

  #[test]
  fn block_new_matches_bit_layout() {
    assert_eq!(Block::new(32, 2, false), Block::from(33));
    assert_eq!(Block::new(128, 3, true), Block::from(59));
  }

  #[test]
  fn size_rounds_down_to_nearest_power_of_two() {
    assert_eq!(Block::new(0, 1, false).size(), 16);
    assert_eq!(Block::new(17, 1, false).size(), 16);
    assert_eq!(Block::new(33, 1, false).size(), 32);
    assert_eq!(Block::new(2048, 1, false).size(), 1024);
  }

  #[test]
  fn be_byte_roundtrip() {
    let b = Block::new(64, 130, true);
    let bytes = b.to_be_bytes();
    assert_eq!(Block::from_be_bytes(&bytes), Some(b));
  }
}
