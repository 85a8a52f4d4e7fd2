use std::io::{Read, Write};

use crate::error::{ChunkError, Result};

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_i32_le(&mut self, v: i32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_f32_le(&mut self, v: f32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    /// Fixed-size array of f32, no count on the wire.
    fn write_f32x4(&mut self, v: &[f32; 4]) -> Result<()> {
        for f in v {
            self.write_f32_le(*f)?;
        }
        Ok(())
    }

    /// Variable-length blob: explicit u64 length immediately preceding the
    /// payload.
    fn write_blob(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u64_le(bytes.len() as u64)?;
        self.write_bytes(bytes)?;
        Ok(())
    }

    fn write_string(&mut self, s: &str) -> Result<()> {
        let len: u32 = s
            .len()
            .try_into()
            .map_err(|_| ChunkError::Corrupt("string length does not fit in u32"))?;
        self.write_u32_le(len)?;
        self.write_bytes(s.as_bytes())?;
        Ok(())
    }

    /// Optional element: one presence byte, then the value when present.
    fn write_opt_with<T>(
        &mut self,
        v: Option<&T>,
        f: impl FnOnce(&mut Self, &T) -> Result<()>,
    ) -> Result<()>
    where
        Self: Sized,
    {
        match v {
            Some(inner) => {
                self.write_bool(true)?;
                f(self, inner)
            }
            None => self.write_bool(false),
        }
    }

    fn write_opt_u64(&mut self, v: Option<u64>) -> Result<()>
    where
        Self: Sized,
    {
        self.write_opt_with(v.as_ref(), |w, v| w.write_u64_le(*v))
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ChunkError::Corrupt("boolean element out of range")),
        }
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32_le(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_f32_le(&mut self) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    fn read_f32x4(&mut self) -> Result<[f32; 4]> {
        let mut out = [0f32; 4];
        for v in &mut out {
            *v = self.read_f32_le()?;
        }
        Ok(out)
    }

    /// Allocation goes through `try_reserve_exact` so a corrupted length
    /// field surfaces as an error instead of an abort.
    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| ChunkError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_opt_u64(&mut self) -> Result<Option<u64>> {
        if self.read_bool()? {
            Ok(Some(self.read_u64_le()?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn scalar_round_trip() {
        let mut buf = Vec::new();
        buf.write_u8(7).unwrap();
        buf.write_bool(true).unwrap();
        buf.write_u16_le(0xbeef).unwrap();
        buf.write_u32_le(0xdeadbeef).unwrap();
        buf.write_i32_le(-12).unwrap();
        buf.write_u64_le(u64::MAX - 1).unwrap();
        buf.write_f32_le(0.5).unwrap();
        buf.write_f32x4(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        buf.write_opt_u64(None).unwrap();
        buf.write_opt_u64(Some(42)).unwrap();
        buf.write_string("hello").unwrap();

        let mut r = Cursor::new(buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u16_le().unwrap(), 0xbeef);
        assert_eq!(r.read_u32_le().unwrap(), 0xdeadbeef);
        assert_eq!(r.read_i32_le().unwrap(), -12);
        assert_eq!(r.read_u64_le().unwrap(), u64::MAX - 1);
        assert_eq!(r.read_f32_le().unwrap(), 0.5);
        assert_eq!(r.read_f32x4().unwrap(), [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(r.read_opt_u64().unwrap(), None);
        assert_eq!(r.read_opt_u64().unwrap(), Some(42));
        let len = r.read_u32_le().unwrap() as usize;
        assert_eq!(String::from_utf8(r.read_exact_vec(len).unwrap()).unwrap(), "hello");
    }

    #[test]
    fn bool_out_of_range_is_corrupt() {
        let mut r = Cursor::new(vec![2u8]);
        assert!(matches!(r.read_bool(), Err(ChunkError::Corrupt(_))));
    }

    #[test]
    fn read_exact_vec_allocation_failure_returns_error() {
        let mut r = Cursor::new(Vec::new());
        let err = r.read_exact_vec(usize::MAX).unwrap_err();
        assert!(matches!(err, ChunkError::OutOfMemory { .. }));
    }
}
