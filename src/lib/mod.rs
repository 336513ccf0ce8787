pub mod barcode_classifier;
pub mod barcode_matching;
pub mod demux;
pub mod duplex_encoder;
pub mod errors;
pub mod join_table;
pub mod manifest;
pub mod messages;
pub mod node;
pub mod pipeline;
pub mod queue;
pub mod read_filter;
pub mod samples;
pub mod sink;
pub mod stats;
pub mod subread_tagger;

/// Checks whether a given u8 byte is a "No-call"-ed base, signified by the bytes 'N', 'n' and '.'
fn byte_is_nocall(byte: u8) -> bool {
    byte == b'N' || byte == b'n' || byte == b'.'
}

/// Checks whether a provided byte is an A, G, C, T or a no-call.
fn is_valid_base(byte: u8) -> bool {
    byte == b'A' || byte == b'C' || byte == b'G' || byte == b'T' || byte_is_nocall(byte)
}

/// Complements a single base, preserving case. Anything that is not A, C, G or T becomes N.
fn complement_base(byte: u8) -> u8 {
    match byte {
        b'A' => b'T',
        b'C' => b'G',
        b'G' => b'C',
        b'T' => b'A',
        b'a' => b't',
        b'c' => b'g',
        b'g' => b'c',
        b't' => b'a',
        _ => b'N',
    }
}

/// Returns the reverse complement of `bases`.
#[must_use]
pub fn reverse_complement(bases: &[u8]) -> Vec<u8> {
    bases.iter().rev().map(|&b| complement_base(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ############################################################################################
    // Test byte_is_no_call
    // ############################################################################################
    #[test]
    fn test_byte_is_no_call() {
        assert!(byte_is_nocall(b'N'));
        assert!(byte_is_nocall(b'n'));
        assert!(byte_is_nocall(b'.'));
        assert!(!byte_is_nocall(b'A'));
        assert!(!byte_is_nocall(b'C'));
        assert!(!byte_is_nocall(b'G'));
        assert!(!byte_is_nocall(b'T'));
        assert!(!byte_is_nocall(b'a'));
        assert!(!byte_is_nocall(b't'));
    }

    // ############################################################################################
    // Test is_valid_base
    // ############################################################################################
    #[test]
    fn test_is_valid_base() {
        assert!(is_valid_base(b'N'));
        assert!(is_valid_base(b'.'));
        assert!(!is_valid_base(b'a'));
        assert!(!is_valid_base(b'R'));
        assert!(is_valid_base(b'A'));
        assert!(is_valid_base(b'C'));
        assert!(is_valid_base(b'G'));
        assert!(is_valid_base(b'T'));
    }

    // ############################################################################################
    // Test reverse_complement
    // ############################################################################################
    #[test]
    fn test_reverse_complement() {
        assert_eq!(reverse_complement(b"GATTACA"), b"TGTAATC".to_vec());
        assert_eq!(reverse_complement(b"acgN"), b"Ncgt".to_vec());
        assert_eq!(reverse_complement(b""), Vec::<u8>::new());
    }
}
