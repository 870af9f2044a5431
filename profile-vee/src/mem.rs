//! Raw fixed-width reads from a suspended foreign process's address
//! space.
//!
//! The decoder only ever needs 1/2/4/8 byte loads at absolute remote
//! addresses, issued tens of times per frame while the target is
//! stopped, so implementations read into a stack buffer and never
//! allocate per call. Address 0 is the defined null sentinel and always
//! yields 0 without touching the target.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("remote read fault at {address:#x}")]
pub struct ReadFault {
    pub address: u64,
}

/// Fixed-width reads from another process's memory.
pub trait ProcessMemory {
    fn read_u8(&self, addr: u64) -> Result<u8, ReadFault>;
    fn read_u16(&self, addr: u64) -> Result<u16, ReadFault>;
    fn read_u32(&self, addr: u64) -> Result<u32, ReadFault>;

    /// 64-bit loads are assembled from two little-endian 32-bit halves.
    fn read_u64(&self, addr: u64) -> Result<u64, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let low = self.read_u32(addr)? as u64;
        let high = self.read_u32(addr + 4)? as u64;
        Ok(low + (high << 32))
    }
}

/// `/proc/<pid>/mem` backed reader. The pseudo-file is opened once at
/// attach time and every read is a positioned read at the remote
/// address; the handle is dropped exactly once on detach.
#[cfg(target_os = "linux")]
pub struct ProcMemReader {
    file: std::fs::File,
}

#[cfg(target_os = "linux")]
impl ProcMemReader {
    pub fn open(pid: u32) -> std::io::Result<Self> {
        let file = std::fs::File::open(format!("/proc/{}/mem", pid))?;
        Ok(ProcMemReader { file })
    }

    fn read_exact_at(&self, buf: &mut [u8], addr: u64) -> Result<(), ReadFault> {
        use std::os::unix::fs::FileExt;
        self.file
            .read_exact_at(buf, addr)
            .map_err(|_| ReadFault { address: addr })
    }
}

#[cfg(target_os = "linux")]
impl ProcessMemory for ProcMemReader {
    fn read_u8(&self, addr: u64) -> Result<u8, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 1];
        self.read_exact_at(&mut buf, addr)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 2];
        self.read_exact_at(&mut buf, addr)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 4];
        self.read_exact_at(&mut buf, addr)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// Byte-addressed in-memory image implementing [`ProcessMemory`].
///
/// Backs the decoder tests and fixtures: unmapped addresses fault the
/// same way a bad remote read does.
#[derive(Debug, Default)]
pub struct SparseMemory {
    bytes: std::collections::HashMap<u64, u8>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    fn load(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadFault> {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = *self
                .bytes
                .get(&(addr + i as u64))
                .ok_or(ReadFault { address: addr })?;
        }
        Ok(())
    }
}

impl ProcessMemory for SparseMemory {
    fn read_u8(&self, addr: u64) -> Result<u8, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 1];
        self.load(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 2];
        self.load(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 4];
        self.load(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_address_reads_zero() {
        let mem = SparseMemory::new();
        assert_eq!(mem.read_u8(0).unwrap(), 0);
        assert_eq!(mem.read_u64(0).unwrap(), 0);
    }

    #[test]
    fn u64_assembled_from_halves() {
        let mut mem = SparseMemory::new();
        mem.write_u32(0x1000, 0xddcc_bbaa);
        mem.write_u32(0x1004, 0x1122_3344);
        assert_eq!(mem.read_u64(0x1000).unwrap(), 0x1122_3344_ddcc_bbaa);
    }

    #[test]
    fn unmapped_read_faults() {
        let mem = SparseMemory::new();
        let err = mem.read_u32(0x4000).unwrap_err();
        assert_eq!(err.address, 0x4000);

        // partial mapping still faults
        let mut mem = SparseMemory::new();
        mem.write(0x2000, &[1, 2]);
        assert!(mem.read_u32(0x2000).is_err());
        assert_eq!(mem.read_u16(0x2000).unwrap(), 0x0201);
    }
}
