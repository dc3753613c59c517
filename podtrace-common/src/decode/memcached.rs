//! Memcached operation-string building for `libmemcached` entry probes:
//! `"<op> <key>"`, truncated to fit the event's `details` field.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemcachedOp {
    Get,
    Set,
    Delete,
}

impl MemcachedOp {
    fn as_str(self) -> &'static str {
        match self {
            MemcachedOp::Get => "get",
            MemcachedOp::Set => "set",
            MemcachedOp::Delete => "delete",
        }
    }
}

/// Builds `"<op> <key>"` into `dst`, truncating the key if it doesn't fit.
/// Returns the number of bytes written.
pub fn build_op_string(op: MemcachedOp, key: &[u8], dst: &mut [u8]) -> usize {
    let op_bytes = op.as_str().as_bytes();
    let mut idx = 0;
    let n = core::cmp::min(op_bytes.len(), dst.len());
    dst[..n].copy_from_slice(&op_bytes[..n]);
    idx += n;

    if idx < dst.len() {
        dst[idx] = b' ';
        idx += 1;
    }

    let remaining = dst.len() - idx;
    let key_n = core::cmp::min(key.len(), remaining);
    dst[idx..idx + key_n].copy_from_slice(&key[..key_n]);
    idx += key_n;
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_get_op_string() {
        let mut dst = [0u8; 64];
        let n = build_op_string(MemcachedOp::Get, b"session:1234", &mut dst);
        assert_eq!(&dst[..n], b"get session:1234");
    }

    #[test]
    fn truncates_oversized_key() {
        let mut dst = [0u8; 8];
        let n = build_op_string(MemcachedOp::Set, b"a_very_long_key_name", &mut dst);
        assert_eq!(&dst[..n], b"set a_ve");
    }
}
