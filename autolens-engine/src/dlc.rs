//! CAN-FD data length code table

/// Payload byte count for each DLC code 0-15
pub const DLC_TABLE: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Map a DLC code to its payload byte count
///
/// Codes above 15 are treated as 15.
pub fn dlc_to_length(dlc: u8) -> usize {
    DLC_TABLE[(dlc as usize).min(15)]
}

/// Smallest DLC code whose byte count is at least `len`
///
/// Lengths above 64 clamp to code 15.
pub fn length_to_dlc(len: usize) -> u8 {
    DLC_TABLE
        .iter()
        .position(|&n| n >= len)
        .unwrap_or(15) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlc_table_edges() {
        assert_eq!(dlc_to_length(8), 8);
        assert_eq!(dlc_to_length(9), 12);
        assert_eq!(dlc_to_length(15), 64);
        assert_eq!(dlc_to_length(200), 64);
    }

    #[test]
    fn test_length_rounds_up() {
        assert_eq!(length_to_dlc(0), 0);
        assert_eq!(length_to_dlc(9), 9);
        assert_eq!(length_to_dlc(13), 10);
        assert_eq!(length_to_dlc(33), 14);
        assert_eq!(length_to_dlc(65), 15);
    }

    #[test]
    fn test_dlc_round_trip_properties() {
        for n in 0..=64 {
            assert!(dlc_to_length(length_to_dlc(n)) >= n, "length {}", n);
        }
        for d in 0..=15u8 {
            assert_eq!(length_to_dlc(dlc_to_length(d)), d);
        }
    }
}
