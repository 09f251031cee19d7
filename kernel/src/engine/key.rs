// Index key staging.

use crate::engine::{IndexId, RowStore};
use crate::error::VtmdError;
use crate::record::TrxId;

pub const END_KEY_LEN: usize = 8;

/// Big-endian so byte order matches epoch order.
pub fn end_key(end: TrxId) -> [u8; END_KEY_LEN] {
    end.0.to_be_bytes()
}

/// Null flag byte, then the name. NULL sorts before every name.
pub fn archive_key(name: Option<&str>) -> Vec<u8> {
    match name {
        None => vec![0],
        Some(name) => {
            let mut key = Vec::with_capacity(1 + name.len());
            key.push(1);
            key.extend_from_slice(name.as_bytes());
            key
        }
    }
}

/// Lookup key buffer sized to an index's maximum key length.
///
/// Freed when dropped.
#[derive(Debug)]
pub struct KeyBuffer {
    index: IndexId,
    capacity: usize,
    buf: Vec<u8>,
}

impl KeyBuffer {
    pub fn for_index<T: RowStore + ?Sized>(table: &T, index: IndexId) -> Result<Self, VtmdError> {
        let capacity = table.max_key_length(index);
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| VtmdError::KeyAlloc { index })?;
        Ok(Self {
            index,
            capacity,
            buf,
        })
    }

    pub fn stage_end(&mut self, end: TrxId) -> Result<&[u8], VtmdError> {
        self.stage(&end_key(end))
    }

    pub fn stage_archive_name(&mut self, name: Option<&str>) -> Result<&[u8], VtmdError> {
        self.stage(&archive_key(name))
    }

    fn stage(&mut self, key: &[u8]) -> Result<&[u8], VtmdError> {
        if key.len() > self.capacity {
            return Err(VtmdError::KeyTooLong {
                index: self.index,
                len: key.len(),
                max: self.capacity,
            });
        }
        self.buf.clear();
        self.buf.extend_from_slice(key);
        Ok(&self.buf)
    }
}
