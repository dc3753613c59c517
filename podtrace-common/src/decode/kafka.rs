//! librdkafka instrumentation helpers. `rd_kafka_topic_new` hands back an
//! opaque `rd_kafka_topic_t*` that every later `produce`/`consumer_poll`
//! call only ever refers to by pointer, so the topic name has to be
//! captured once at creation time and looked up by pointer afterward
//! (a dedicated map, not reuse of the generic correlation table, since the
//! key space here is pointers rather than thread ids).

/// Builds the `"<topic>"` or `"<topic>[<partition>]"` details string used
/// for `KafkaProduce`/`KafkaFetch` events. `partition < 0` means
/// unspecified (`RD_KAFKA_PARTITION_UA`), in which case only the topic
/// name is emitted.
pub fn build_topic_details(topic: &[u8], partition: i32, dst: &mut [u8]) -> usize {
    let n = core::cmp::min(topic.len(), dst.len());
    dst[..n].copy_from_slice(&topic[..n]);
    let mut idx = n;

    if partition < 0 {
        return idx;
    }

    idx += crate::format::write_str(&mut dst[idx..], b"[");
    idx += crate::format::write_u64(&mut dst[idx..], partition as u64);
    idx += crate::format::write_str(&mut dst[idx..], b"]");
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_topic_with_partition() {
        let mut dst = [0u8; 32];
        let n = build_topic_details(b"orders", 3, &mut dst);
        assert_eq!(&dst[..n], b"orders[3]");
    }

    #[test]
    fn formats_topic_with_unassigned_partition() {
        let mut dst = [0u8; 32];
        let n = build_topic_details(b"orders", -1, &mut dst);
        assert_eq!(&dst[..n], b"orders");
    }
}
