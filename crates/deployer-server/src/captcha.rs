//! Captcha broker
//!
//! Issues one-time challenge tokens and verifies answers. The provider is
//! pluggable; the default generates small arithmetic problems rendered as an
//! SVG data URI. Entries are process-local and single-use: any verification
//! outcome consumes the token.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use deployer_core::epoch_now;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;

/// A generated challenge: what the user sees and what we expect back.
pub struct Challenge {
    pub problem: String,
    pub answer: String,
}

/// Pluggable challenge generator. Stronger schemes drop in behind this.
pub trait CaptchaProvider: Send + Sync {
    fn generate(&self) -> Challenge;
}

/// Default provider: `a op b` with small operands.
pub struct MathCaptcha;

impl CaptchaProvider for MathCaptcha {
    fn generate(&self) -> Challenge {
        let mut rng = rand::thread_rng();
        let mut a: i32 = rng.gen_range(1..=10);
        let mut b: i32 = rng.gen_range(1..=10);

        let (problem, answer) = match rng.gen_range(0..3) {
            0 => (format!("{} + {}", a, b), a + b),
            1 => {
                // Keep subtraction non-negative.
                if a < b {
                    std::mem::swap(&mut a, &mut b);
                }
                (format!("{} - {}", a, b), a - b)
            }
            _ => (format!("{} × {}", a, b), a * b),
        };

        Challenge {
            problem,
            answer: answer.to_string(),
        }
    }
}

struct Entry {
    answer: String,
    expires_at: i64,
}

pub struct CaptchaBroker {
    provider: Box<dyn CaptchaProvider>,
    entries: DashMap<String, Entry>,
    ttl_secs: u64,
    bypass: bool,
}

impl CaptchaBroker {
    pub fn new(ttl_secs: u64, bypass: bool) -> Self {
        Self::with_provider(Box::new(MathCaptcha), ttl_secs, bypass)
    }

    pub fn with_provider(provider: Box<dyn CaptchaProvider>, ttl_secs: u64, bypass: bool) -> Self {
        Self {
            provider,
            entries: DashMap::new(),
            ttl_secs,
            bypass,
        }
    }

    /// Issue a new captcha: `(id, image data URI)`.
    pub fn create(&self) -> (String, String) {
        self.purge_expired();

        let challenge = self.provider.generate();
        let nonce: u64 = rand::thread_rng().gen();
        let digest = Sha256::digest(
            format!(
                "{}{}{}{}",
                challenge.problem,
                challenge.answer,
                epoch_now(),
                nonce
            )
            .as_bytes(),
        );
        let id: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

        self.entries.insert(
            id.clone(),
            Entry {
                answer: challenge.answer,
                expires_at: epoch_now() + self.ttl_secs as i64,
            },
        );

        (id, render_data_uri(&challenge.problem))
    }

    /// Verify and consume a captcha. Unknown id, expired entry and wrong
    /// answer all return false; the entry is removed either way so an id
    /// cannot be replayed.
    pub fn verify(&self, captcha_id: &str, answer: &str) -> bool {
        if self.bypass {
            debug!("Captcha verification bypassed");
            return true;
        }

        self.purge_expired();

        let Some((_, entry)) = self.entries.remove(captcha_id) else {
            return false;
        };

        if entry.expires_at < epoch_now() {
            return false;
        }

        entry.answer == answer.trim()
    }

    /// Number of live entries, exposed for the admin status page.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    fn purge_expired(&self) {
        let now = epoch_now();
        self.entries.retain(|_, entry| entry.expires_at >= now);
    }
}

/// Render the problem as an SVG wrapped in a data URI.
///
/// Presentation is deliberately minimal; the admin page and any real
/// anti-bot hardening live outside this service.
fn render_data_uri(problem: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut noise = String::new();
    for _ in 0..6 {
        noise.push_str(&format!(
            r##"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="#c8c8c8" stroke-width="2"/>"##,
            rng.gen_range(0..200),
            rng.gen_range(0..80),
            rng.gen_range(0..200),
            rng.gen_range(0..80),
        ));
    }

    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="80"><rect width="200" height="80" fill="#f0f0f0"/>{}<text x="100" y="50" font-family="monospace" font-size="32" fill="#212121" text-anchor="middle">{}</text></svg>"##,
        noise, problem
    );

    format!("data:image/svg+xml;base64,{}", BASE64.encode(svg))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Provider with a fixed answer so tests do not depend on randomness.
    struct FixedCaptcha;

    impl CaptchaProvider for FixedCaptcha {
        fn generate(&self) -> Challenge {
            Challenge {
                problem: "3 + 4".to_string(),
                answer: "7".to_string(),
            }
        }
    }

    fn broker() -> CaptchaBroker {
        CaptchaBroker::with_provider(Box::new(FixedCaptcha), 300, false)
    }

    #[test]
    fn test_correct_answer_verifies_once() {
        let broker = broker();
        let (id, image) = broker.create();
        assert!(image.starts_with("data:image/svg+xml;base64,"));

        assert!(broker.verify(&id, "7"));
        // Single-use: the same id must not verify twice.
        assert!(!broker.verify(&id, "7"));
    }

    #[test]
    fn test_wrong_answer_consumes_entry() {
        let broker = broker();
        let (id, _) = broker.create();

        assert!(!broker.verify(&id, "8"));
        // No retry on the same id, even with the right answer.
        assert!(!broker.verify(&id, "7"));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let broker = broker();
        assert!(!broker.verify("deadbeef", "7"));
    }

    #[test]
    fn test_answer_is_trimmed() {
        let broker = broker();
        let (id, _) = broker.create();
        assert!(broker.verify(&id, " 7 "));
    }

    #[test]
    fn test_expired_entry_rejected() {
        let broker = CaptchaBroker::with_provider(Box::new(FixedCaptcha), 0, false);
        let (id, _) = broker.create();
        // TTL of zero expires immediately relative to the next second tick;
        // force the expiry path by backdating through a fresh broker purge.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(!broker.verify(&id, "7"));
    }

    #[test]
    fn test_bypass_accepts_anything() {
        let broker = CaptchaBroker::with_provider(Box::new(FixedCaptcha), 300, true);
        assert!(broker.verify("missing", "whatever"));
    }

    #[test]
    fn test_math_provider_produces_numeric_answers() {
        let provider = MathCaptcha;
        for _ in 0..100 {
            let challenge = provider.generate();
            let answer: i32 = challenge.answer.parse().expect("numeric answer");
            assert!(answer >= 0, "subtraction must not go negative");
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let broker = broker();
        let (a, _) = broker.create();
        let (b, _) = broker.create();
        assert_ne!(a, b);
        assert_eq!(broker.pending(), 2);
    }
}
