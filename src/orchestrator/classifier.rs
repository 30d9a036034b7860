//! Build output classification.
//!
//! Turns raw build-script lines into progress percentages and step descriptions
//! using an ordered list of `(predicate, effect)` rules. The first matching rule
//! wins. The classifier is stateless; keeping progress monotonic is the job of
//! the operation that applies the result (`Operation::set_progress`).

use regex::{Captures, Regex};

/// What one line says about the build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub progress: Option<u8>,
    pub step: Option<String>,
}

/// When a rule applies.
#[derive(Debug, Clone)]
pub enum Predicate {
    Contains(&'static str),
    Pattern(Regex),
}

/// What a matching rule reports.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Fixed progress and step
    Milestone { progress: u8, step: &'static str },
    /// Fixed step, progress untouched
    Step(&'static str),
    /// Progress from the `pct` capture, step from the optional `msg` capture
    CapturedProgress,
    /// Progress from the `done`/`total` captures
    CapturedRatio,
    /// Step from the `step` capture
    CapturedStep,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: &'static str,
    pub predicate: Predicate,
    pub effect: Effect,
}

impl Rule {
    pub fn contains(name: &'static str, needle: &'static str, effect: Effect) -> Self {
        Rule {
            name,
            predicate: Predicate::Contains(needle),
            effect,
        }
    }

    /// Build a regex rule; `None` if the pattern does not compile.
    pub fn pattern(name: &'static str, pattern: &str, effect: Effect) -> Option<Self> {
        match Regex::new(pattern) {
            Ok(re) => Some(Rule {
                name,
                predicate: Predicate::Pattern(re),
                effect,
            }),
            Err(e) => {
                log::error!("[Build] Classifier rule '{}' has an invalid pattern: {}", name, e);
                None
            }
        }
    }

    fn apply(&self, line: &str) -> Option<Classification> {
        match &self.predicate {
            Predicate::Contains(needle) => {
                if line.contains(needle) {
                    self.effect.fixed()
                } else {
                    None
                }
            }
            Predicate::Pattern(re) => {
                let caps = re.captures(line)?;
                match self.effect {
                    Effect::CapturedProgress => captured_progress(&caps),
                    Effect::CapturedRatio => captured_ratio(&caps),
                    Effect::CapturedStep => {
                        let step = caps.name("step")?.as_str().trim();
                        if step.is_empty() {
                            return None;
                        }
                        Some(Classification {
                            progress: None,
                            step: Some(step.to_string()),
                        })
                    }
                    _ => self.effect.fixed(),
                }
            }
        }
    }
}

impl Effect {
    fn fixed(&self) -> Option<Classification> {
        match self {
            Effect::Milestone { progress, step } => Some(Classification {
                progress: Some(*progress),
                step: Some(step.to_string()),
            }),
            Effect::Step(step) => Some(Classification {
                progress: None,
                step: Some(step.to_string()),
            }),
            // Capture effects need a pattern predicate
            _ => None,
        }
    }
}

fn captured_progress(caps: &Captures<'_>) -> Option<Classification> {
    let pct = caps.name("pct")?.as_str().parse::<u16>().ok()?;
    let step = caps
        .name("msg")
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(Classification {
        progress: Some(pct.min(100) as u8),
        step,
    })
}

fn captured_ratio(caps: &Captures<'_>) -> Option<Classification> {
    let done = caps.name("done")?.as_str().parse::<u64>().ok()?;
    let total = caps.name("total")?.as_str().parse::<u64>().ok()?;
    if total == 0 {
        return None;
    }
    let pct = (done.saturating_mul(100) / total).min(100) as u8;
    Some(Classification {
        progress: Some(pct),
        step: None,
    })
}

/// Ordered rule list applied to each output line.
#[derive(Debug, Clone)]
pub struct ProgressClassifier {
    rules: Vec<Rule>,
}

impl Default for ProgressClassifier {
    fn default() -> Self {
        ProgressClassifier::new(default_rules())
    }
}

impl ProgressClassifier {
    pub fn new(rules: Vec<Rule>) -> Self {
        ProgressClassifier { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classify one line. `None` when no rule matches.
    pub fn classify(&self, line: &str) -> Option<Classification> {
        self.rules.iter().find_map(|rule| rule.apply(line))
    }
}

/// The rules the kernel customizer script is known to trigger.
pub fn default_rules() -> Vec<Rule> {
    let structured = [
        Rule::pattern(
            "reported-progress",
            r"^\s*PROGRESS:\s*(?P<pct>\d{1,3})%\s*(?:-\s*(?P<msg>.*))?$",
            Effect::CapturedProgress,
        ),
        Rule::pattern("reported-step", r"^\s*STEP:\s*(?P<step>.+)$", Effect::CapturedStep),
        Rule::pattern(
            "build-complete",
            r"^\s*BUILD_COMPLETE:",
            Effect::Step("Build completed"),
        ),
        Rule::pattern("build-failed", r"^\s*BUILD_FAILED:", Effect::Step("Build failed")),
        // Ninja/Kbuild style [ 582/12041]
        Rule::pattern(
            "ratio",
            r"\[\s*(?P<done>\d+)/(?P<total>\d+)\]",
            Effect::CapturedRatio,
        ),
        Rule::pattern("percent", r"(?P<pct>\d{1,3})%", Effect::CapturedProgress),
    ];

    let mut rules: Vec<Rule> = structured.into_iter().flatten().collect();

    rules.extend([
        Rule::contains(
            "wsl-setup",
            "Setting up WSL environment",
            Effect::Milestone {
                progress: 10,
                step: "Setting up WSL environment",
            },
        ),
        Rule::contains(
            "clone",
            "Cloning kernel repository",
            Effect::Milestone {
                progress: 20,
                step: "Cloning repositories",
            },
        ),
        Rule::contains(
            "patches",
            "Applying NetHunter patches",
            Effect::Milestone {
                progress: 40,
                step: "Applying NetHunter patches",
            },
        ),
        Rule::contains(
            "compile",
            "Starting kernel compilation",
            Effect::Milestone {
                progress: 60,
                step: "Compiling kernel",
            },
        ),
        Rule::contains(
            "completed",
            "Build process completed",
            Effect::Step("Build completed"),
        ),
        Rule::contains("failed", "Build failed", Effect::Step("Build failed")),
    ]);

    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classify(line: &str) -> Option<Classification> {
        ProgressClassifier::default().classify(line)
    }

    #[test]
    fn test_all_default_rules_compile() {
        assert_eq!(ProgressClassifier::default().rules().len(), 12);
    }

    #[test]
    fn test_reported_progress_line() {
        let c = classify("PROGRESS: 45% - Applying NetHunter patches").unwrap();
        assert_eq!(c.progress, Some(45));
        assert_eq!(c.step.as_deref(), Some("Applying NetHunter patches"));
    }

    #[test]
    fn test_reported_step_line() {
        let c = classify("STEP: Cloning repositories").unwrap();
        assert_eq!(c.progress, None);
        assert_eq!(c.step.as_deref(), Some("Cloning repositories"));
    }

    #[test]
    fn test_milestones() {
        assert_eq!(
            classify("[*] Setting up WSL environment...").unwrap().progress,
            Some(10)
        );
        assert_eq!(
            classify("Cloning kernel repository from github").unwrap().progress,
            Some(20)
        );
        let c = classify("Starting kernel compilation with 8 jobs").unwrap();
        assert_eq!(c.progress, Some(60));
        assert_eq!(c.step.as_deref(), Some("Compiling kernel"));
    }

    #[test]
    fn test_milestone_step_names() {
        let table = [
            ("==> Setting up WSL environment", Some(10), "Setting up WSL environment"),
            ("Cloning kernel repository into ./kernel", Some(20), "Cloning repositories"),
            ("Applying NetHunter patches (level 1)", Some(40), "Applying NetHunter patches"),
            ("Starting kernel compilation", Some(60), "Compiling kernel"),
            ("Build process completed", None, "Build completed"),
            ("Build failed: missing defconfig", None, "Build failed"),
        ];
        for (line, progress, step) in table {
            let c = classify(line).unwrap_or_else(|| panic!("unclassified: {}", line));
            assert_eq!(c.progress, progress, "{}", line);
            assert_eq!(c.step.as_deref(), Some(step), "{}", line);
        }
    }

    #[test]
    fn test_terminal_markers_only_set_step() {
        let c = classify("BUILD_COMPLETE: out/Image.gz-dtb").unwrap();
        assert_eq!(c, Classification { progress: None, step: Some("Build completed".to_string()) });

        let c = classify("Build process completed").unwrap();
        assert_eq!(c.step.as_deref(), Some("Build completed"));

        let c = classify("BUILD_FAILED: make exited 2").unwrap();
        assert_eq!(c.step.as_deref(), Some("Build failed"));
    }

    #[test]
    fn test_generic_percent_and_ratio() {
        assert_eq!(classify("Receiving objects:  73% (1200/1640)").unwrap().progress, Some(73));
        assert_eq!(classify("[ 50/200] CC kernel/fork.o").unwrap().progress, Some(25));
        assert_eq!(classify("[ 0/0] nothing").and_then(|c| c.progress), None);
    }

    #[test]
    fn test_first_match_wins() {
        // The structured rule beats the bare percentage and the milestone text
        let c = classify("PROGRESS: 15% - Starting kernel compilation").unwrap();
        assert_eq!(c.progress, Some(15));
    }

    #[test]
    fn test_unmatched_line() {
        assert!(classify("  CC      arch/arm64/kernel/setup.o").is_none());
        assert!(classify("").is_none());
    }

    #[test]
    fn test_custom_rules() {
        let classifier = ProgressClassifier::new(vec![Rule::contains(
            "repo-sync",
            "repo sync",
            Effect::Milestone { progress: 5, step: "Syncing sources" },
        )]);
        assert_eq!(classifier.classify("running repo sync -j8").unwrap().progress, Some(5));
        assert!(classifier.classify("PROGRESS: 50% - x").is_none());
    }

    proptest! {
        #[test]
        fn prop_classified_progress_is_bounded(line in ".*") {
            if let Some(c) = classify(&line) {
                prop_assert!(c.progress.map_or(true, |p| p <= 100));
            }
        }

        #[test]
        fn prop_reported_progress_round_trips(pct in 0u8..=100, msg in "[A-Za-z ]{1,30}") {
            let c = classify(&format!("PROGRESS: {}% - {}", pct, msg)).unwrap();
            prop_assert_eq!(c.progress, Some(pct));
            let expected = msg.trim().to_string();
            prop_assert_eq!(c.step, if expected.is_empty() { None } else { Some(expected) });
        }
    }
}
