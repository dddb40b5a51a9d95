//! Budget limit policies
//!
//! One checker per axis, run in order before every turn. Exceeding a
//! limit is a normal suspend branch in the turn loop, not a thrown error;
//! the returned `LimitExceeded` value names the axis for the transcript.

use ryeos_core::{Cost, Error, Limits};

/// First exceeded axis, if any, in the order
/// turns → tokens → spend → duration → spawns.
pub fn check_limits(cost: &Cost, limits: &Limits, spawned: u32, elapsed_s: u64) -> Option<Error> {
    if cost.turns_used >= limits.turns {
        return Some(Error::limit("turns", cost.turns_used, limits.turns));
    }
    if cost.total_tokens() >= limits.tokens {
        return Some(Error::limit("tokens", cost.total_tokens(), limits.tokens));
    }
    if cost.spend >= limits.spend {
        return Some(Error::limit("spend", format!("{:.4}", cost.spend), format!("{:.4}", limits.spend)));
    }
    if elapsed_s >= limits.duration_s {
        return Some(Error::limit("duration", elapsed_s, limits.duration_s));
    }
    if spawned >= limits.spawns {
        return Some(Error::limit("spawns", spawned, limits.spawns));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits { turns: 3, tokens: 1000, spend: 0.5, spawns: 2, duration_s: 60, depth: 2 }
    }

    #[test]
    fn under_all_limits_passes() {
        let cost = Cost { turns_used: 1, input_tokens: 100, output_tokens: 50, spend: 0.1, duration_s: 5 };
        assert!(check_limits(&cost, &limits(), 0, 5).is_none());
    }

    #[test]
    fn each_axis_trips_in_order() {
        let mut cost = Cost { turns_used: 3, input_tokens: 2000, spend: 9.0, ..Cost::default() };
        let err = check_limits(&cost, &limits(), 9, 999).unwrap();
        assert!(err.to_string().contains("turns"));

        cost.turns_used = 0;
        let err = check_limits(&cost, &limits(), 9, 999).unwrap();
        assert!(err.to_string().contains("tokens"));

        cost.input_tokens = 0;
        let err = check_limits(&cost, &limits(), 9, 999).unwrap();
        assert!(err.to_string().contains("spend"));

        cost.spend = 0.0;
        let err = check_limits(&cost, &limits(), 9, 999).unwrap();
        assert!(err.to_string().contains("duration"));

        let err = check_limits(&cost, &limits(), 9, 0).unwrap();
        assert!(err.to_string().contains("spawns"));
    }

    #[test]
    fn exact_limit_trips() {
        let cost = Cost { turns_used: 3, ..Cost::default() };
        assert!(check_limits(&cost, &limits(), 0, 0).is_some());
        let cost = Cost { turns_used: 2, ..Cost::default() };
        assert!(check_limits(&cost, &limits(), 0, 0).is_none());
    }
}
