//! Memory Reader: a uniform, address-agnostic view over either a live
//! process or a core file.
//!
//! The actual backends are `remoteprocess::ProcessMemory` (live process,
//! attach + `/proc/<pid>/mem`) and [`crate::coredump::CoreDump`] (core file,
//! PT_LOAD lookup table), both of which implement the same trait. Every
//! other component in this crate is generic over `P: ProcessMemory` and
//! never knows which backend is serving its reads.
//!
//! This module only adds the handful of read shapes the engine needs beyond
//! raw byte copies (bounded C-string reads, and error values carrying the
//! address/length context this engine requires) plus a small cache-free
//! reminder: callers own their own caching, the reader never does.

use remoteprocess::ProcessMemory;

use crate::errors::EngineError;

/// Maximum length of a C string we'll ever read; guards against a torn or
/// adversarial read never finding a NUL.
const MAX_CSTRING_LEN: usize = 4096;

pub fn read<P: ProcessMemory>(process: &P, addr: usize, len: usize) -> Result<Vec<u8>, EngineError> {
    process
        .copy(addr, len)
        .map_err(|e| EngineError::memory(addr, len, e))
}

pub fn read_struct<T: Copy, P: ProcessMemory>(process: &P, addr: usize) -> Result<T, EngineError> {
    process
        .copy_struct(addr)
        .map_err(|e| EngineError::memory(addr, std::mem::size_of::<T>(), e))
}

/// Reads a NUL-terminated C string starting at `addr`, up to `max` bytes.
pub fn read_cstring<P: ProcessMemory>(
    process: &P,
    addr: usize,
    max: usize,
) -> Result<String, EngineError> {
    let max = max.min(MAX_CSTRING_LEN);
    // Read in chunks so we don't pay for `max` bytes when the string is short
    // and don't walk off the end of a mapped region unnecessarily.
    const CHUNK: usize = 64;
    let mut buf = Vec::new();
    let mut offset = 0;
    while offset < max {
        let chunk_len = CHUNK.min(max - offset);
        let chunk = read(process, addr + offset, chunk_len)?;
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            buf.extend_from_slice(&chunk[..nul]);
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        buf.extend_from_slice(&chunk);
        offset += chunk_len;
    }
    Err(EngineError::memory(addr, max, "no NUL terminator found"))
}

/// A pointer read from the target is only as trustworthy as the map table
/// says it is. Every linked-list hop the Structure Walker takes in
/// non-blocking mode must pass through this before being dereferenced.
pub fn validate_pointer(addr: usize, maps: &dyn crate::maps::ContainsAddr) -> Result<(), EngineError> {
    if addr == 0 {
        return Err(EngineError::memory(addr, 0, "null pointer"));
    }
    if !maps.contains_addr(addr) {
        return Err(EngineError::memory(addr, 0, "pointer outside of any known mapping"));
    }
    Ok(())
}

/// Enforced on every linked-list walk (interpreters, threads, frames) to
/// guarantee termination under torn, non-blocking reads. 
pub const MAX_LINKED_LIST_HOPS: usize = 10_000;
