//! Byte-scan protocol decoders. Every function here takes a fixed-size
//! window of already-captured bytes and a static loop bound; none of them
//! allocate or branch on attacker-controlled lengths without a clamp, so
//! they stay verifier-safe when inlined directly into a probe body.

pub mod fastcgi;
pub mod grpc;
pub mod kafka;
pub mod memcached;
pub mod redis;
