use std::{collections::HashMap, ops::RangeInclusive, sync::Mutex};

// Soft cap and absolute cap of the per-user spam score. Crossing the soft
// cap saturates the score to the hard cap but still lets that one message
// through; anything after that is rejected until decay catches up.
pub const SPAM_LIMIT: f32 = 3.0;
pub const SPAM_LIMIT_HIT: f32 = 6.0;
pub const SPAM_INTERVAL_SECS: u64 = 5;

pub const SCORE_BASE_MESSAGE: f32 = 0.75;
pub const SCORE_BASE_FORWARD: f32 = 1.25;
pub const SCORE_STICKER: f32 = 1.5;
pub const SCORE_TEXT_CHARACTER: f32 = 0.002;
pub const SCORE_TEXT_LINEBREAK: f32 = 0.1;

// Mathematical Alphanumeric Symbols, the pseudo-bold/italic letters popular
// with spam bots. Messages using them are rejected outright.
const MATH_ALPHANUMERIC: RangeInclusive<char> = '\u{1D400}'..='\u{1D7FF}';
const SCORE_MATH_SYMBOLS: f32 = 999.0;

/// In-memory spam scores with periodic decay.
pub struct ScoreKeeper {
    scores: Mutex<HashMap<i64, f32>>,
}

impl ScoreKeeper {
    pub fn new() -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `n` to the user's score and reports whether the message may be
    /// sent. A score already past the soft cap rejects immediately; the
    /// message that first crosses it saturates the score to the hard cap
    /// and is accepted only if the sum stays within it.
    pub fn increase_spam_score(&self, uid: i64, n: f32) -> bool {
        let mut scores = self.scores.lock().unwrap();
        let s = scores.get(&uid).copied().unwrap_or(0.0);
        if s > SPAM_LIMIT {
            return false;
        } else if s + n > SPAM_LIMIT {
            scores.insert(uid, SPAM_LIMIT_HIT);
            return s + n <= SPAM_LIMIT_HIT;
        }
        scores.insert(uid, s + n);
        true
    }

    /// Scheduled decay: every tracked score drops by 1, entries reaching
    /// zero are forgotten.
    pub fn decay(&self) {
        let mut scores = self.scores.lock().unwrap();
        scores.retain(|_, s| {
            *s -= 1.0;
            *s > 0.0
        });
    }
}

impl Default for ScoreKeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// The pseudo-styled letters spam bots use to dodge text filters.
pub fn has_math_symbols(text: &str) -> bool {
    text.chars().any(|c| MATH_ALPHANUMERIC.contains(&c))
}

/// Spam score of a plain text message.
pub fn text_score(text: &str) -> f32 {
    if has_math_symbols(text) {
        return SCORE_MATH_SYMBOLS;
    }
    let newlines = text.matches('\n').count();
    SCORE_BASE_MESSAGE
        + text.chars().count() as f32 * SCORE_TEXT_CHARACTER
        + newlines as f32 * SCORE_TEXT_LINEBREAK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_accumulate_under_limit() {
        let keeper = ScoreKeeper::new();
        assert!(keeper.increase_spam_score(1, 1.0));
        assert!(keeper.increase_spam_score(1, 1.0));
        assert!(keeper.increase_spam_score(1, 1.0));
    }

    #[test]
    fn test_one_grace_message_over_limit() {
        let keeper = ScoreKeeper::new();
        for _ in 0..3 {
            assert!(keeper.increase_spam_score(1, 0.76));
        }
        // crosses the soft cap: saturates but is still accepted
        assert!(keeper.increase_spam_score(1, 0.76));
        // now saturated at the hard cap, rejected until decay
        assert!(!keeper.increase_spam_score(1, 0.76));
        assert!(!keeper.increase_spam_score(1, 0.1));
    }

    #[test]
    fn test_big_jump_is_rejected() {
        let keeper = ScoreKeeper::new();
        assert!(keeper.increase_spam_score(1, 2.0));
        // 2.0 + 5.0 exceeds even the hard cap
        assert!(!keeper.increase_spam_score(1, 5.0));
    }

    #[test]
    fn test_decay_forgets_users() {
        let keeper = ScoreKeeper::new();
        assert!(keeper.increase_spam_score(1, 0.76));
        for _ in 0..4 {
            assert!(keeper.increase_spam_score(2, 0.76));
        }
        keeper.decay();
        // user 1 dropped to zero and is fresh again
        assert!(keeper.increase_spam_score(1, 3.0));
        // user 2 sits at 5.0, still over the soft cap
        assert!(!keeper.increase_spam_score(2, 0.76));
        for _ in 0..5 {
            keeper.decay();
        }
        assert!(keeper.increase_spam_score(2, 0.76));
    }

    #[test]
    fn test_text_score() {
        assert!((text_score("") - 0.75).abs() < 1e-6);
        assert!((text_score("hello") - 0.76).abs() < 1e-6);
        assert!((text_score("a\nb\nc") - (0.75 + 3.0 * 0.002 + 0.2)).abs() < 1e-6);
        // 𝐬𝐩𝐚𝐦 in math bold is always rejected
        assert!(text_score("buy \u{1D42C}\u{1D429}\u{1D41A}\u{1D426} now") >= SCORE_MATH_SYMBOLS);
    }
}
