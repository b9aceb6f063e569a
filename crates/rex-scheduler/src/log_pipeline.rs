//! Per-step log framing: secret masking, numbering, timestamping, and
//! hook dispatch.

use rex_core::hooks::Line;
use rex_core::spec::{Secret, SecretVar};

/// Builds a masking function from the secrets a step references,
/// resolved against the spec's secret pool. Only secrets flagged
/// `mask` contribute a replacement; if none do, masking is a no-op.
pub struct Masker {
    pairs: Vec<(String, &'static str)>,
}

const MASK_PLACEHOLDER: &str = "********";

impl Masker {
    /// `secrets` are the step's references; `pool` is the spec's full
    /// secret list to resolve them against. Unresolved references are
    /// silently skipped.
    pub fn new(secrets: &[SecretVar], pool: &[Secret]) -> Self {
        let pairs = secrets
            .iter()
            .filter_map(|reference| pool.iter().find(|s| s.name == reference.name))
            .filter(|secret| secret.mask && !secret.data.is_empty())
            .map(|secret| (secret.data.clone(), MASK_PLACEHOLDER))
            .collect();
        Self { pairs }
    }

    pub fn mask(&self, text: &str) -> String {
        if self.pairs.is_empty() {
            return text.to_string();
        }
        let mut out = text.to_string();
        for (secret, placeholder) in &self.pairs {
            out = out.replace(secret.as_str(), placeholder);
        }
        out
    }
}

/// Frames raw byte writes from a step's log stream into numbered,
/// masked, timestamped `Line`s. One `write` call produces exactly one
/// `Line` (the reference behavior: emit on each write rather than
/// buffering for a trailing newline).
pub struct LineWriter {
    masker: Masker,
    started_at: std::time::Instant,
    next_number: i64,
    cap: Option<usize>,
    lines: Vec<Line>,
}

impl LineWriter {
    pub fn new(masker: Masker) -> Self {
        Self {
            masker,
            started_at: std::time::Instant::now(),
            next_number: 0,
            cap: None,
            lines: Vec::new(),
        }
    }

    /// Bound the number of buffered lines delivered to `got_logs` on
    /// close; oldest lines are dropped first.
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Frame one write of raw bytes into a `Line`. Returns the framed
    /// line so the caller can dispatch the `got_line` hook before
    /// processing the next write.
    pub fn write(&mut self, raw: &str) -> Line {
        let message = self.masker.mask(raw);
        let line = Line {
            number: self.next_number,
            message,
            timestamp: self.started_at.elapsed().as_secs() as i64,
        };
        self.next_number += 1;

        self.lines.push(line.clone());
        if let Some(cap) = self.cap {
            while self.lines.len() > cap {
                self.lines.remove(0);
            }
        }
        line
    }

    /// The buffered lines, for delivery to `got_logs` on stream close.
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_only_flagged_secrets() {
        let pool = vec![
            Secret {
                name: "foo".into(),
                data: "bar".into(),
                mask: true,
            },
            Secret {
                name: "baz".into(),
                data: "qux".into(),
                mask: false,
            },
        ];
        let refs = vec![
            SecretVar {
                name: "foo".into(),
                env: String::new(),
            },
            SecretVar {
                name: "baz".into(),
                env: String::new(),
            },
        ];
        let masker = Masker::new(&refs, &pool);
        // "bar" (foo's value, masked) is replaced; "qux" (baz's value, unmasked) is not.
        assert_eq!(masker.mask("fooXbarYqux"), "fooX********Yqux");
    }

    #[test]
    fn scenario_foobarbaz_mask() {
        let pool = vec![Secret {
            name: "foo".into(),
            data: "bar".into(),
            mask: true,
        }];
        let refs = vec![SecretVar {
            name: "foo".into(),
            env: String::new(),
        }];
        let masker = Masker::new(&refs, &pool);
        assert_eq!(masker.mask("foobarbaz"), "foo********baz");
    }

    #[test]
    fn numbering_starts_at_zero_and_increments() {
        let masker = Masker::new(&[], &[]);
        let mut w = LineWriter::new(masker);
        let l0 = w.write("first");
        let l1 = w.write("second");
        assert_eq!(l0.number, 0);
        assert_eq!(l1.number, 1);
    }

    #[test]
    fn no_masked_secrets_is_pass_through() {
        let pool = vec![Secret {
            name: "foo".into(),
            data: "bar".into(),
            mask: false,
        }];
        let masker = Masker::new(&[], &pool);
        assert_eq!(masker.mask("bar stays"), "bar stays");
    }

    #[test]
    fn cap_drops_oldest_lines() {
        let masker = Masker::new(&[], &[]);
        let mut w = LineWriter::new(masker).with_cap(2);
        w.write("a");
        w.write("b");
        w.write("c");
        let nums: Vec<i64> = w.lines().iter().map(|l| l.number).collect();
        assert_eq!(nums, vec![1, 2]);
    }
}
