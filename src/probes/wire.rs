//! Cursor over a binary reply, shared by the length-prefixed protocol decoders.
use crate::error::ProbeError;

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.at >= self.data.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], ProbeError> {
        let end = self
            .at
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| ProbeError::Malformed(format!("truncated message at byte {}", self.at)))?;
        let bytes = &self.data[self.at..end];
        self.at = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProbeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProbeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProbeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, ProbeError> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProbeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ProbeError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub(crate) fn i32_le(&mut self) -> Result<i32, ProbeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64_le(&mut self) -> Result<i64, ProbeError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64_le(&mut self) -> Result<f64, ProbeError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// A block preceded by its big-endian `u32` length.
    pub(crate) fn long_bytes(&mut self) -> Result<&'a [u8], ProbeError> {
        let len = self.u32()?;
        self.take(to_usize(len))
    }

    /// A block preceded by its big-endian `u16` length.
    pub(crate) fn short_string(&mut self) -> Result<String, ProbeError> {
        let len = self.u16()?;
        Ok(String::from_utf8_lossy(self.take(usize::from(len))?).into_owned())
    }

    /// A NUL terminated string; the terminator is consumed.
    pub(crate) fn cstring(&mut self) -> Result<String, ProbeError> {
        let rest = &self.data[self.at.min(self.data.len())..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProbeError::Malformed("unterminated string".to_owned()))?;
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.at += end + 1;
        Ok(text)
    }
}

pub(crate) fn to_usize(n: u32) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

pub(crate) fn length_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

pub(crate) fn length_u16(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}
