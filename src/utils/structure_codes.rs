/// Reserved pad code. Code 0 never appears in a real decomposition; the
/// sequence encoder masks these positions out of attention entirely.
pub const PAD_CODE: i64 = 0;

/// Parse a comma-separated code list and pad (or truncate) it to `max_len`.
///
/// All sequences must share one fixed maximum length known at model
/// construction time, because the decoder flattens the sequence memory into
/// a fixed-size conditioning vector. The unpadded length is not kept; the
/// attention mask recovers it from the pad positions.
pub fn parse_codes(raw: &str, max_len: usize) -> Option<Vec<i64>> {
    let mut codes = Vec::with_capacity(max_len);
    for part in raw.trim().split(',') {
        let code: i64 = part.trim().parse().ok()?;
        codes.push(code);
        if codes.len() == max_len {
            break;
        }
    }
    if codes.is_empty() {
        return None;
    }

    codes.resize(max_len, PAD_CODE);
    Some(codes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pads_to_max_len() {
        let parsed = parse_codes("3,45,102", 6).unwrap();
        assert_eq!(parsed, vec![3, 45, 102, 0, 0, 0]);
    }

    #[test]
    fn test_truncates_overlong_sequence() {
        let parsed = parse_codes("1,2,3,4,5", 3).unwrap();
        assert_eq!(parsed, vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_codes("1,x,3", 4).is_none());
        assert!(parse_codes("", 4).is_none());
    }
}
