// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Helpers for the SSH primitive vocabulary on top of `ssh-encoding`:
//! `mpint` (RFC 4251 §5 two's-complement big-endian integers) and
//! `name-list` (comma-separated US-ASCII names inside a `string`).

use std::fmt::Debug;

use ssh_encoding::{Decode, Encode, Reader, Writer};

use crate::Error;

/// Encode a non-negative integer given as big-endian magnitude bytes.
///
/// Leading zero bytes are stripped; a `0x00` byte is prepended when the
/// most significant bit of the magnitude is set, so the value stays
/// non-negative. Zero encodes as the empty string.
#[allow(clippy::indexing_slicing)] // i is bounded by s.len()
pub(crate) fn encode_mpint<W: Writer>(s: &[u8], w: &mut W) -> Result<(), Error> {
    // Skip initial 0s.
    let mut i = 0;
    while i < s.len() && s[i] == 0 {
        i += 1
    }
    if i >= s.len() {
        0u32.encode(w)?;
        return Ok(());
    }
    // If the first non-zero is >= 128, write its length (u32, BE), followed by 0.
    if s[i] & 0x80 != 0 {
        ((s.len() - i + 1) as u32).encode(w)?;
        0u8.encode(w)?;
    } else {
        ((s.len() - i) as u32).encode(w)?;
    }
    w.write(&s[i..])?;
    Ok(())
}

/// Encoding length of the given magnitude, in bytes.
pub(crate) fn mpint_len(s: &[u8]) -> usize {
    let mut i = 0;
    while i < s.len() && s.get(i) == Some(&0) {
        i += 1
    }
    if i >= s.len() {
        return 4;
    }
    (if s.get(i).map_or(false, |b| b & 0x80 != 0) {
        5
    } else {
        4
    }) + s.len()
        - i
}

/// Decode an mpint back into magnitude bytes (any sign byte removed).
pub(crate) fn decode_mpint(r: &mut impl Reader) -> Result<Vec<u8>, Error> {
    let bytes = Vec::<u8>::decode(r)?;
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    Ok(bytes.get(start..).unwrap_or_default().to_vec())
}

/// A comma-separated list of algorithm or method names.
pub struct NameList(pub Vec<String>);

impl Debug for NameList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl NameList {
    pub fn as_encoded_string(&self) -> String {
        self.0.join(",")
    }

    pub fn from_encoded_string(value: &str) -> Self {
        if value.is_empty() {
            return Self(Vec::new());
        }
        Self(value.split(',').map(|x| x.to_string()).collect())
    }
}

impl Encode for NameList {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.as_encoded_string().encoded_len()
    }

    fn encode(&self, writer: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        self.as_encoded_string().encode(writer)
    }
}

impl Decode for NameList {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl Reader) -> Result<Self, ssh_encoding::Error> {
        let s = String::decode(reader)?;
        Ok(Self::from_encoded_string(&s))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod test {
    use super::*;

    fn roundtrip(magnitude: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_mpint(magnitude, &mut buf).unwrap();
        assert_eq!(buf.len(), mpint_len(magnitude));
        let mut r = &buf[..];
        let out = decode_mpint(&mut r).unwrap();
        assert!(r.is_empty());
        out
    }

    #[test]
    fn mpint_zero_is_empty() {
        let mut buf = Vec::new();
        encode_mpint(&[], &mut buf).unwrap();
        assert_eq!(buf, &[0, 0, 0, 0]);
        encode_mpint(&[0, 0, 0], &mut Vec::new()).unwrap();
        assert_eq!(roundtrip(&[0, 0, 0]), Vec::<u8>::new());
    }

    #[test]
    fn mpint_high_bit_gets_sign_byte() {
        // n = 2^(8k-1): a single 0x80 byte, must encode with a leading zero.
        let mut buf = Vec::new();
        encode_mpint(&[0x80], &mut buf).unwrap();
        assert_eq!(buf, &[0, 0, 0, 2, 0, 0x80]);
        assert_eq!(roundtrip(&[0x80]), vec![0x80]);
    }

    #[test]
    fn mpint_strips_leading_zeros() {
        let mut buf = Vec::new();
        encode_mpint(&[0, 0, 0x12, 0x34], &mut buf).unwrap();
        assert_eq!(buf, &[0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn mpint_roundtrip_misc() {
        for m in [
            &[1u8][..],
            &[0x7f],
            &[0xff, 0xff],
            &[0x01, 0x00, 0x00],
            &[0x80, 0x00, 0x00, 0x01],
        ] {
            assert_eq!(roundtrip(m), m.to_vec());
        }
    }

    #[test]
    fn name_list_empty() {
        let l = NameList::from_encoded_string("");
        assert!(l.0.is_empty());
        let mut buf = Vec::new();
        l.encode(&mut buf).unwrap();
        assert_eq!(buf, &[0, 0, 0, 0]);
    }

    #[test]
    fn name_list_roundtrip() {
        let l = NameList::from_encoded_string("curve25519-sha256,ssh-ed25519");
        assert_eq!(l.0.len(), 2);
        let mut buf = Vec::new();
        l.encode(&mut buf).unwrap();
        let mut r = &buf[..];
        let back = NameList::decode(&mut r).unwrap();
        assert_eq!(back.0, l.0);
    }
}
