use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const BASE_SCORE: i64 = 100;
pub const SPEED_BONUS: i64 = 10;
/// Runs finishing under this earn the speed bonus
pub const SPEED_BONUS_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Fix records allowed before the penalty kicks in
pub const FREE_FIXES: usize = 20;
pub const PENALTY_PER_FIX: i64 = 2;

/// Final run score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub base: i64,
    pub speed_bonus: i64,
    /// Zero or negative
    pub penalty: i64,
    #[serde(rename = "final")]
    pub final_score: i64,
}

impl Score {
    pub fn compute(elapsed: Duration, fix_count: usize) -> Self {
        let speed_bonus = if elapsed < SPEED_BONUS_WINDOW {
            SPEED_BONUS
        } else {
            0
        };
        let excess = fix_count.saturating_sub(FREE_FIXES) as i64;
        let penalty = -PENALTY_PER_FIX * excess;
        let final_score = (BASE_SCORE + speed_bonus + penalty).max(0);
        Self {
            base: BASE_SCORE,
            speed_bonus,
            penalty,
            final_score,
        }
    }
}

impl Default for Score {
    fn default() -> Self {
        Self {
            base: BASE_SCORE,
            speed_bonus: 0,
            penalty: 0,
            final_score: BASE_SCORE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_run_gets_bonus() {
        let score = Score::compute(Duration::from_secs(60), 3);
        assert_eq!(score.speed_bonus, 10);
        assert_eq!(score.penalty, 0);
        assert_eq!(score.final_score, 110);
    }

    #[test]
    fn test_bonus_window_is_exclusive() {
        assert_eq!(Score::compute(SPEED_BONUS_WINDOW, 0).final_score, 100);
        assert_eq!(
            Score::compute(SPEED_BONUS_WINDOW - Duration::from_millis(1), 0).final_score,
            110
        );
    }

    #[test]
    fn test_penalty_past_free_fixes() {
        let score = Score::compute(Duration::from_secs(600), 25);
        assert_eq!(score.penalty, -10);
        assert_eq!(score.final_score, 90);
        assert_eq!(Score::compute(Duration::from_secs(600), 20).penalty, 0);
    }

    #[test]
    fn test_final_never_negative() {
        assert_eq!(Score::compute(Duration::from_secs(600), 500).final_score, 0);
    }

    #[test]
    fn test_serializes_final_key() {
        let json = serde_json::to_value(Score::compute(Duration::ZERO, 0)).unwrap();
        assert_eq!(json["final"], 110);
        assert_eq!(json["speedBonus"], 10);
    }
}
