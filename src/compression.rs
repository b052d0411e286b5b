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

//! Payload compression, negotiated like any other algorithm family.
//! `zlib@openssh.com` is the delayed variant: it only becomes active once
//! the server has accepted authentication.

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    None,
    #[cfg(feature = "flate2")]
    Zlib,
    #[cfg(feature = "flate2")]
    ZlibLegacy,
}

pub enum Compress {
    None,
    #[cfg(feature = "flate2")]
    Zlib(flate2::Compress),
}

pub enum Decompress {
    None,
    #[cfg(feature = "flate2")]
    Zlib(flate2::Decompress),
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// `none`
pub const NONE: Name = Name("none");
/// `zlib@openssh.com`
#[cfg(feature = "flate2")]
pub const ZLIB: Name = Name("zlib@openssh.com");
/// `zlib`
#[cfg(feature = "flate2")]
pub const ZLIB_LEGACY: Name = Name("zlib");

impl Compression {
    pub fn new(name: &Name) -> Compression {
        Self::from_string(name.0)
    }

    pub fn from_string(s: &str) -> Compression {
        match s {
            #[cfg(feature = "flate2")]
            "zlib@openssh.com" => Compression::Zlib,
            #[cfg(feature = "flate2")]
            "zlib" => Compression::ZlibLegacy,
            _ => Compression::None,
        }
    }

    pub fn init_compress(&self, comp: &mut Compress) {
        match self {
            Compression::None => *comp = Compress::None,
            #[cfg(feature = "flate2")]
            Compression::Zlib | Compression::ZlibLegacy => {
                *comp = Compress::Zlib(flate2::Compress::new(flate2::Compression::fast(), true))
            }
        }
    }

    pub fn init_decompress(&self, comp: &mut Decompress) {
        match self {
            Compression::None => *comp = Decompress::None,
            #[cfg(feature = "flate2")]
            Compression::Zlib | Compression::ZlibLegacy => {
                *comp = Decompress::Zlib(flate2::Decompress::new(true))
            }
        }
    }
}

impl Compress {
    pub fn compress<'a>(
        &mut self,
        input: &'a [u8],
        output: &'a mut Vec<u8>,
    ) -> Result<&'a [u8], Error> {
        match *self {
            Compress::None => Ok(input),
            #[cfg(feature = "flate2")]
            Compress::Zlib(ref mut z) => {
                output.clear();
                let n_in = z.total_in() as usize;
                let n_out = z.total_out() as usize;
                output.resize(input.len() + 10, 0);
                loop {
                    let in_off = z.total_in() as usize - n_in;
                    let out_off = z.total_out() as usize - n_out;
                    let input_rest = input.get(in_off..).ok_or(Error::IndexOutOfBounds)?;
                    let output_rest = output.get_mut(out_off..).ok_or(Error::IndexOutOfBounds)?;
                    z.compress(input_rest, output_rest, flate2::FlushCompress::Partial)?;
                    if z.total_in() as usize - n_in >= input.len()
                        && z.total_out() as usize - n_out < output.len()
                    {
                        break;
                    }
                    output.resize(output.len() * 2, 0);
                }
                output.truncate(z.total_out() as usize - n_out);
                Ok(output)
            }
        }
    }
}

impl Decompress {
    pub fn decompress<'a>(
        &mut self,
        input: &'a [u8],
        output: &'a mut Vec<u8>,
    ) -> Result<&'a [u8], Error> {
        match *self {
            Decompress::None => Ok(input),
            #[cfg(feature = "flate2")]
            Decompress::Zlib(ref mut z) => {
                output.clear();
                let n_in = z.total_in() as usize;
                let n_out = z.total_out() as usize;
                output.resize(input.len().max(64), 0);
                loop {
                    let in_off = z.total_in() as usize - n_in;
                    let out_off = z.total_out() as usize - n_out;
                    let input_rest = input.get(in_off..).ok_or(Error::IndexOutOfBounds)?;
                    let output_rest = output.get_mut(out_off..).ok_or(Error::IndexOutOfBounds)?;
                    let status =
                        z.decompress(input_rest, output_rest, flate2::FlushDecompress::None)?;
                    match status {
                        flate2::Status::StreamEnd => break,
                        _ => {
                            if z.total_in() as usize - n_in >= input.len()
                                && z.total_out() as usize - n_out < output.len()
                            {
                                break;
                            }
                            output.resize(output.len() * 2, 0);
                        }
                    }
                }
                output.truncate(z.total_out() as usize - n_out);
                Ok(output)
            }
        }
    }
}

#[cfg(all(test, feature = "flate2"))]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod test {
    use super::*;

    #[test]
    fn zlib_roundtrip() {
        let mut comp = Compress::None;
        let mut decomp = Decompress::None;
        Compression::Zlib.init_compress(&mut comp);
        Compression::Zlib.init_decompress(&mut decomp);

        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mut compressed = Vec::new();
        let out = comp.compress(&payload, &mut compressed).unwrap().to_vec();
        let mut decompressed = Vec::new();
        let back = decomp.decompress(&out, &mut decompressed).unwrap();
        assert_eq!(back, &payload[..]);
    }
}
