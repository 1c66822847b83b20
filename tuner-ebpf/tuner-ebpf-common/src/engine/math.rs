use crate::{EWMA_WEIGHT, SEQUENTIAL_SECTOR_WINDOW};

/// Integer EWMA with weight 1/8. A zero average takes the first sample as-is.
#[inline(always)]
pub fn ewma_update(avg: u64, sample: u64) -> u64 {
    if avg == 0 {
        sample
    } else {
        (avg.wrapping_mul(EWMA_WEIGHT - 1).wrapping_add(sample)) / EWMA_WEIGHT
    }
}

#[inline(always)]
pub fn ns_to_us(ns: u64) -> u64 {
    ns / 1000
}

#[inline(always)]
pub fn ns_to_us_round_up(ns: u64) -> u64 {
    ns.saturating_add(999) / 1000
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Locality {
    Sequential,
    Random,
}

/// Sequential when the sector distance is strictly below the window.
#[inline(always)]
pub fn classify(last_sector: u64, sector: u64) -> Locality {
    if last_sector.abs_diff(sector) < SEQUENTIAL_SECTOR_WINDOW {
        Locality::Sequential
    } else {
        Locality::Random
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_cold_start_takes_sample() {
        assert_eq!(ewma_update(0, 40), 40);
        assert_eq!(ewma_update(0, 0), 0);
    }

    #[test]
    fn ewma_steady_state() {
        assert_eq!(ewma_update(40, 8), 36);
        assert_eq!(ewma_update(36, 36), 36);
        // truncating division
        assert_eq!(ewma_update(1, 0), 0);
    }

    fn run_ewma(samples: &[u64]) -> [u64; 3] {
        let mut out = [0; 3];
        let mut avg = 0;
        for (slot, &s) in out.iter_mut().zip(samples) {
            avg = ewma_update(avg, s);
            *slot = avg;
        }
        out
    }

    #[test]
    fn ewma_sequences() {
        assert_eq!(run_ewma(&[100, 100, 100]), [100, 100, 100]);
        // a zero sample leaves the average cold, so 800 is taken as-is
        assert_eq!(run_ewma(&[0, 800, 0]), [0, 800, 700]);
    }

    #[test]
    fn microsecond_conversions() {
        assert_eq!(ns_to_us(1_999), 1);
        assert_eq!(ns_to_us_round_up(1_001), 2);
        assert_eq!(ns_to_us_round_up(1_000), 1);
        assert_eq!(ns_to_us_round_up(0), 0);
        assert_eq!(ns_to_us_round_up(1), 1);
        assert_eq!(ns_to_us_round_up(999), 1);
        assert_eq!(ns_to_us_round_up(1_999), 2);
        assert_eq!(ns_to_us(999), 0);
    }

    #[test]
    fn sector_window_boundary() {
        assert_eq!(classify(1000, 1063), Locality::Sequential);
        assert_eq!(classify(1000, 1064), Locality::Random);
        assert_eq!(classify(1064, 1000), Locality::Random);
        assert_eq!(classify(1000, 937), Locality::Sequential);
        assert_eq!(classify(1000, 1000), Locality::Sequential);
        assert_eq!(classify(1000, 2000), Locality::Random);
    }
}
