//! Simulated counterpart behaviour: delivery/read receipts and canned replies
//! when the message could not reach anyone.

use std::{sync::Mutex, time::Duration};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptSchedule {
    pub delivered_after: Duration,
    pub read_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoReply {
    pub delay: Duration,
    pub content: String,
}

pub trait PresenceSimulator: Send + Sync {
    /// When a freshly sent message should show as delivered and as read.
    fn receipts(&self) -> Option<ReceiptSchedule>;
    /// Reply from the counterpart to a message that reached no one.
    fn auto_reply(&self, message: &str) -> Option<AutoReply>;
}

/// No receipts and no replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPresence;

impl PresenceSimulator for NoPresence {
    fn receipts(&self) -> Option<ReceiptSchedule> {
        None
    }

    fn auto_reply(&self, _message: &str) -> Option<AutoReply> {
        None
    }
}

const KEYWORD_REPLIES: &[(&[&str], &str)] = &[
    (&["hello", "hi", "hey"], "Hey! How's it going?"),
    (&["how are you"], "Doing well, thanks for asking!"),
    (&["photo", "pic", "snap"], "Ha, love it. Send more!"),
    (&["call"], "Can't talk right now, I'll call you back."),
    (&["bye", "later", "night"], "Talk soon!"),
    (&["?"], "Good question, let me think about it."),
];

/// Whole-word match for word keywords, substring match for punctuation.
fn mentions(lowered: &str, words: &[&str], needle: &str) -> bool {
    if !needle.chars().any(char::is_alphanumeric) {
        return lowered.contains(needle);
    }
    let needle: Vec<&str> = needle.split_whitespace().collect();
    words.windows(needle.len()).any(|window| window == needle.as_slice())
}

const FALLBACK_REPLIES: &[&str] = &["Sounds good!", "Haha, nice", "Got it.", "Tell me more"];

/// Randomised receipts and keyword-matched replies.
pub struct SimulatedPresence {
    rng: Mutex<StdRng>,
}

impl SimulatedPresence {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests and demos.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        match self.rng.lock() {
            Ok(mut rng) => f(&mut rng),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Default for SimulatedPresence {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceSimulator for SimulatedPresence {
    fn receipts(&self) -> Option<ReceiptSchedule> {
        self.with_rng(|rng| {
            let delivered_after = Duration::from_millis(rng.gen_range(500..=1_500));
            let read_after = delivered_after + Duration::from_millis(rng.gen_range(1_000..=3_000));
            Some(ReceiptSchedule {
                delivered_after,
                read_after,
            })
        })
    }

    fn auto_reply(&self, message: &str) -> Option<AutoReply> {
        let lowered = message.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|word| !word.is_empty())
            .collect();
        let keyword = KEYWORD_REPLIES
            .iter()
            .find(|(needles, _)| {
                needles
                    .iter()
                    .any(|needle| mentions(&lowered, &words, needle))
            })
            .map(|(_, reply)| *reply);

        self.with_rng(|rng| {
            let content = match keyword {
                Some(reply) => reply,
                None => FALLBACK_REPLIES.choose(rng).copied().unwrap_or("Sounds good!"),
            };
            Some(AutoReply {
                delay: Duration::from_millis(rng.gen_range(1_000..=3_000)),
                content: content.to_string(),
            })
        })
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
