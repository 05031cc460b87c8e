//! Utility functions for the library.

macro_rules! dispatch_by_dfa_state_status {
    ($dfa_state:ident, $dfa:ident , accept=>$accept:block , reject=>$reject:block ,in_progress=>$in_progress:block) => {
        if $dfa.is_special_state($dfa_state) && ($dfa.is_dead_state($dfa_state)||$dfa.is_quit_state($dfa_state))
            $reject
        else if $dfa.is_match_state($dfa.next_eoi_state($dfa_state))
            $accept
        else
            $in_progress
    };
}
pub(crate) use dispatch_by_dfa_state_status;

/// Decode bytes into a string, mapping each byte to the Unicode code point of
/// the same value. Lossless for arbitrary byte sequences.
pub(crate) fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Pack a stream of bits (each element 0 or 1, most significant bit first)
/// into bytes. A trailing group shorter than eight bits is right-aligned in
/// the final byte.
pub(crate) fn pack_bits(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| chunk.iter().fold(0u8, |acc, &bit| (acc << 1) | (bit & 1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::pack_bits;

    #[test]
    fn bit_packing() {
        assert_eq!(pack_bits(&[1, 0, 1, 0, 1, 0, 1, 1]), vec![0xAB]);
        assert_eq!(pack_bits(&[1, 0, 1]), vec![0x05]);
        assert_eq!(pack_bits(&[]), Vec::<u8>::new());
    }
}
