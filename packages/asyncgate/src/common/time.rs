//! Time helpers shared by the engine and sweeper.

use chrono::{DateTime, Utc};

/// Returns the current instant in UTC with an explicit offset, satisfying spec §8
/// invariant 9 (timezone fidelity): every timestamp carries an explicit UTC offset.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_has_utc_offset() {
        let t = now();
        assert_eq!(t.offset().local_minus_utc(), 0);
    }
}
