//! Read/write extension traits used by the region store and record formats.
//!
//! Every on-disk integer in this crate is big-endian except the chunk payload's
//! `(cx, cz)` header, which the spec fixes as little-endian for historical reasons; the
//! two call sites that need little-endian use `byteorder` directly instead of going
//! through these traits.

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use std::io::{self, Read, Write};

/// Big-endian primitive reads shared by the region header and the record format.
pub trait ReadExt: Read {
    #[inline]
    fn read_u8_be(&mut self) -> io::Result<u8> {
        ReadBytesExt::read_u8(self)
    }

    #[inline]
    fn read_i32_be(&mut self) -> io::Result<i32> {
        ReadBytesExt::read_i32::<BE>(self)
    }

    #[inline]
    fn read_u32_be(&mut self) -> io::Result<u32> {
        ReadBytesExt::read_u32::<BE>(self)
    }

    #[inline]
    fn read_u16_be(&mut self) -> io::Result<u16> {
        ReadBytesExt::read_u16::<BE>(self)
    }

    #[inline]
    fn read_i64_be(&mut self) -> io::Result<i64> {
        ReadBytesExt::read_i64::<BE>(self)
    }

    #[inline]
    fn read_f32_be(&mut self) -> io::Result<f32> {
        ReadBytesExt::read_f32::<BE>(self)
    }

    #[inline]
    fn read_f64_be(&mut self) -> io::Result<f64> {
        ReadBytesExt::read_f64::<BE>(self)
    }

    fn read_str(&mut self, max_len: usize) -> io::Result<String> {
        let len = self.read_u16_be()? as usize;
        if len > max_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "string too long"));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

/// Big-endian primitive writes shared by the region header and the record format.
pub trait WriteExt: Write {
    #[inline]
    fn write_u8_be(&mut self, v: u8) -> io::Result<()> {
        WriteBytesExt::write_u8(self, v)
    }

    #[inline]
    fn write_i32_be(&mut self, v: i32) -> io::Result<()> {
        WriteBytesExt::write_i32::<BE>(self, v)
    }

    #[inline]
    fn write_u32_be(&mut self, v: u32) -> io::Result<()> {
        WriteBytesExt::write_u32::<BE>(self, v)
    }

    #[inline]
    fn write_u16_be(&mut self, v: u16) -> io::Result<()> {
        WriteBytesExt::write_u16::<BE>(self, v)
    }

    #[inline]
    fn write_i64_be(&mut self, v: i64) -> io::Result<()> {
        WriteBytesExt::write_i64::<BE>(self, v)
    }

    #[inline]
    fn write_f32_be(&mut self, v: f32) -> io::Result<()> {
        WriteBytesExt::write_f32::<BE>(self, v)
    }

    #[inline]
    fn write_f64_be(&mut self, v: f64) -> io::Result<()> {
        WriteBytesExt::write_f64::<BE>(self, v)
    }

    fn write_str(&mut self, s: &str) -> io::Result<()> {
        assert!(s.len() <= u16::MAX as usize, "string too long to encode");
        self.write_u16_be(s.len() as u16)?;
        self.write_all(s.as_bytes())
    }
}

impl<W: Write + ?Sized> WriteExt for W {}
