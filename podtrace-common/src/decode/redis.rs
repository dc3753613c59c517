//! Redis command-name extraction from `hiredis` call sites: either a
//! formatted command string (`redisCommand`) or an `argv`/`argvlen` pair
//! (`redisCommandArgv`), in both cases we only need the first token.

/// Extracts the command name (e.g. `"GET"`, `"SET"`) from a formatted
/// command buffer such as `"GET foo\r\n"` or a RESP-encoded inline command.
/// Stops at the first whitespace, CR, or LF.
pub fn extract_command_name(buf: &[u8], dst: &mut [u8]) -> usize {
    let mut end = 0;
    while end < buf.len() && is_command_byte(buf[end]) {
        end += 1;
    }
    let n = core::cmp::min(end, dst.len());
    dst[..n].copy_from_slice(&buf[..n]);
    n
}

fn is_command_byte(b: u8) -> bool {
    !matches!(b, b' ' | b'\r' | b'\n' | 0)
}

/// Extracts the command name from the first `argv` element (the
/// `redisCommandArgv` calling convention).
pub fn extract_command_name_from_argv0(argv0: &[u8], dst: &mut [u8]) -> usize {
    extract_command_name(argv0, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_command() {
        let mut dst = [0u8; 32];
        let n = extract_command_name(b"GET foo\r\n", &mut dst);
        assert_eq!(&dst[..n], b"GET");
    }

    #[test]
    fn extracts_command_with_no_trailing_args() {
        let mut dst = [0u8; 32];
        let n = extract_command_name(b"PING\r\n", &mut dst);
        assert_eq!(&dst[..n], b"PING");
    }

    #[test]
    fn argv0_extraction_matches_plain_extraction() {
        let mut dst = [0u8; 32];
        let n = extract_command_name_from_argv0(b"HSET", &mut dst);
        assert_eq!(&dst[..n], b"HSET");
    }
}
