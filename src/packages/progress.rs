//! Package manager output parser
//!
//! dnf reports its work as free text. Each line is classified against a
//! table of patterns into a transaction phase, a `processed/total` counter
//! is pulled out when the line carries one, and the pair is mapped onto a
//! fixed schedule:
//!
//! | Phase                              | Overall fraction |
//! |------------------------------------|------------------|
//! | Downloading                        | 0.00 – 0.30      |
//! | Checking / Testing / Running Transaction | 0.30       |
//! | Installing, Running Scriptlets     | 0.30 – 0.90      |
//! | Verifying                          | 0.90 – 0.95      |
//! | Finalizing Installation            | 0.95 – 0.99      |
//! | Complete                           | 1.00             |
//!
//! The parser never reports a lower fraction than it already has.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Phase of a package transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Downloading,
    CheckingTransaction,
    TestingTransaction,
    RunningTransaction,
    Installing,
    RunningScriptlets,
    Verifying,
    Finalizing,
    Complete,
}

impl Phase {
    /// Overall fraction range covered by this phase
    pub const fn range(self) -> (f64, f64) {
        match self {
            Self::Downloading => (0.0, 0.30),
            Self::CheckingTransaction | Self::TestingTransaction | Self::RunningTransaction => (0.30, 0.30),
            Self::Installing | Self::RunningScriptlets => (0.30, 0.90),
            Self::Verifying => (0.90, 0.95),
            Self::Finalizing => (0.95, 0.99),
            Self::Complete => (1.0, 1.0),
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Downloading => "Downloading",
            Self::CheckingTransaction => "Checking Transaction",
            Self::TestingTransaction => "Testing Transaction",
            Self::RunningTransaction => "Running Transaction",
            Self::Installing => "Installing",
            Self::RunningScriptlets => "Running Scriptlets",
            Self::Verifying => "Verifying",
            Self::Finalizing => "Finalizing Installation",
            Self::Complete => "Complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One classified line
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: Phase,
    /// `(processed, total)` when the line carried a counter
    pub counter: Option<(u64, u64)>,
    /// Overall fraction after this line, never lower than before
    pub fraction: f64,
}

// Order matters: the first matching pattern wins.
const PHASE_PATTERNS: &[(&str, Phase)] = &[
    (r"^Complete!", Phase::Complete),
    (r"(?i)^\s*(?:\[\s*\d+/\d+\]\s*)?verif(?:y|ying)\b", Phase::Verifying),
    (r"(?i)^\s*(?:\[\s*\d+/\d+\]\s*)?running scriptlet", Phase::RunningScriptlets),
    (
        r"(?i)^\s*(?:\[\s*\d+/\d+\]\s*)?(?:installing|reinstalling|upgrading|updating)\b",
        Phase::Installing,
    ),
    (r"(?i)^\s*(?:\[\s*\d+/\d+\]\s*)?(?:cleanup|finaliz)", Phase::Finalizing),
    (r"(?i)running transaction check|transaction check succeeded", Phase::CheckingTransaction),
    (r"(?i)running transaction test|transaction test succeeded", Phase::TestingTransaction),
    (
        r"(?i)^\s*(?:\[\s*\d+/\d+\]\s*)?(?:running transaction|preparing\b|prepare transaction)",
        Phase::RunningTransaction,
    ),
    (r"(?i)^\s*downloading packages", Phase::Downloading),
    (r"^\s*\(\s*\d+/\d+\)\s*:", Phase::Downloading),
    (r"^\s*\[\s*\d+/\d+\]", Phase::Downloading),
];

fn phase_table() -> &'static [(Regex, Phase)] {
    static TABLE: OnceLock<Vec<(Regex, Phase)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        PHASE_PATTERNS
            .iter()
            .map(|(pattern, phase)| (Regex::new(pattern).expect("valid phase pattern"), *phase))
            .collect()
    })
}

// Transaction summary headers such as `Installing dependencies:` print before
// anything is downloaded and carry no progress.
const SUMMARY_HEADER: &str =
    r"(?i)^\s*(?:installing|reinstalling|upgrading|updating|downgrading|removing)\b[\w ]*:\s*$";

fn summary_header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| Regex::new(SUMMARY_HEADER).expect("valid summary header pattern"))
}

fn counter_patterns() -> &'static [Regex] {
    static COUNTERS: OnceLock<Vec<Regex>> = OnceLock::new();
    COUNTERS.get_or_init(|| {
        [r"\(\s*(\d+)/(\d+)\s*\)", r"\[\s*(\d+)/(\d+)\s*\]", r"(\d+)/(\d+)\s*$"]
            .iter()
            .map(|p| Regex::new(p).expect("valid counter pattern"))
            .collect()
    })
}

/// Classify a single line
pub fn classify(line: &str) -> Option<Phase> {
    if summary_header().is_match(line) {
        return None;
    }
    phase_table()
        .iter()
        .find(|(re, _)| re.is_match(line))
        .map(|(_, phase)| *phase)
}

/// `processed/total` carried by a line, if any
pub fn extract_counter(line: &str) -> Option<(u64, u64)> {
    counter_patterns().iter().find_map(|re| {
        let caps = re.captures(line)?;
        let done: u64 = caps.get(1)?.as_str().parse().ok()?;
        let total: u64 = caps.get(2)?.as_str().parse().ok()?;
        (total > 0 && done <= total).then_some((done, total))
    })
}

/// Map a phase and optional counter onto the overall schedule
pub fn phase_fraction(phase: Phase, counter: Option<(u64, u64)>) -> f64 {
    let (start, end) = phase.range();
    match counter {
        Some((done, total)) => start + (end - start) * (done as f64 / total as f64),
        None => start,
    }
}

/// Stateful, monotonic parser over a transaction's stdout
#[derive(Debug, Default)]
pub struct TransactionProgress {
    phase: Option<Phase>,
    fraction: f64,
}

impl TransactionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Feed one stdout line; `None` if the line carries no progress
    pub fn feed(&mut self, line: &str) -> Option<ProgressUpdate> {
        let phase = classify(line)?;
        let counter = extract_counter(line);
        let raw = phase_fraction(phase, counter);
        if raw > self.fraction {
            self.fraction = raw;
        }
        self.phase = Some(phase);
        Some(ProgressUpdate {
            phase,
            counter,
            fraction: self.fraction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DNF4_SAMPLE: &str = "\
Downloading Packages:
(1/3): bash-5.2.26-3.fc40.x86_64.rpm            5.1 MB/s | 1.8 MB     00:00
(2/3): glibc-2.39-5.fc40.x86_64.rpm             9.0 MB/s | 2.2 MB     00:00
(3/3): filesystem-3.18-8.fc40.x86_64.rpm        1.0 MB/s | 1.1 MB     00:01
--------------------------------------------------------------------------------
Total                                            6.0 MB/s | 5.1 MB     00:00
Running transaction check
Transaction check succeeded.
Running transaction test
Transaction test succeeded.
Running transaction
  Preparing        :                                                        1/1
  Installing       : filesystem-3.18-8.fc40.x86_64                          1/3
  Running scriptlet: filesystem-3.18-8.fc40.x86_64                          1/3
  Installing       : glibc-2.39-5.fc40.x86_64                               2/3
  Installing       : bash-5.2.26-3.fc40.x86_64                              3/3
  Running scriptlet: bash-5.2.26-3.fc40.x86_64                              3/3
  Verifying        : bash-5.2.26-3.fc40.x86_64                              1/3
  Verifying        : filesystem-3.18-8.fc40.x86_64                          3/3

Installed:
  bash-5.2.26-3.fc40.x86_64   filesystem-3.18-8.fc40.x86_64   glibc-2.39-5.fc40.x86_64

Complete!
";

    #[test]
    fn test_classify_dnf4_lines() {
        assert_eq!(classify("Downloading Packages:"), Some(Phase::Downloading));
        assert_eq!(classify("(2/3): glibc-2.39-5.fc40.x86_64.rpm  9.0 MB/s"), Some(Phase::Downloading));
        assert_eq!(classify("Running transaction check"), Some(Phase::CheckingTransaction));
        assert_eq!(classify("Transaction test succeeded."), Some(Phase::TestingTransaction));
        assert_eq!(classify("Running transaction"), Some(Phase::RunningTransaction));
        assert_eq!(classify("  Installing       : bash  3/3"), Some(Phase::Installing));
        assert_eq!(classify("  Running scriptlet: bash  3/3"), Some(Phase::RunningScriptlets));
        assert_eq!(classify("  Verifying        : bash  1/3"), Some(Phase::Verifying));
        assert_eq!(classify("  Cleanup          : bash  1/1"), Some(Phase::Finalizing));
        assert_eq!(classify("Complete!"), Some(Phase::Complete));
        assert_eq!(classify("Installed:"), None);
        assert_eq!(classify("Total   6.0 MB/s | 5.1 MB"), None);
    }

    #[test]
    fn test_classify_dnf5_lines() {
        assert_eq!(
            classify("[ 1/42] bash-0:5.2.26-3.fc40.x86_64 100% | 5.0 MiB/s | 1.8 MiB | 00m00s"),
            Some(Phase::Downloading)
        );
        assert_eq!(classify("[ 2/12] Prepare transaction"), Some(Phase::RunningTransaction));
        assert_eq!(classify("[ 3/12] Installing bash-0:5.2.26-3.fc40.x86_64"), Some(Phase::Installing));
        assert_eq!(classify("[12/12] Verify package files"), Some(Phase::Verifying));
    }

    #[test]
    fn test_counter_forms() {
        assert_eq!(extract_counter("(12/345): foo.rpm"), Some((12, 345)));
        assert_eq!(extract_counter("[ 3/12] Installing bash"), Some((3, 12)));
        assert_eq!(extract_counter("  Installing : bash  7/10"), Some((7, 10)));
        assert_eq!(extract_counter("Running transaction"), None);
        assert_eq!(extract_counter("(5/0)"), None);
    }

    #[test]
    fn test_schedule() {
        assert_eq!(phase_fraction(Phase::Downloading, Some((3, 3))), 0.30);
        assert!((phase_fraction(Phase::Installing, Some((1, 2))) - 0.60).abs() < 1e-9);
        assert!((phase_fraction(Phase::Verifying, Some((1, 1))) - 0.95).abs() < 1e-9);
        assert_eq!(phase_fraction(Phase::Complete, None), 1.0);
    }

    #[test]
    fn test_full_transcript_is_monotonic_and_completes() {
        let mut parser = TransactionProgress::new();
        let mut last = 0.0;
        let mut phases = Vec::new();
        for line in DNF4_SAMPLE.lines() {
            if let Some(update) = parser.feed(line) {
                assert!(update.fraction >= last);
                last = update.fraction;
                if phases.last() != Some(&update.phase) {
                    phases.push(update.phase);
                }
            }
        }
        assert_eq!(parser.phase(), Some(Phase::Complete));
        assert_eq!(parser.fraction(), 1.0);
        assert!(phases.contains(&Phase::Downloading));
        assert!(phases.contains(&Phase::Installing));
        assert!(phases.contains(&Phase::Verifying));
    }

    #[test]
    fn test_summary_headers_leave_download_range_intact() {
        let transcript = "\
Dependencies resolved.
================================================================================
 Package            Arch       Version              Repository            Size
================================================================================
Installing:
 bash               x86_64     5.2.26-3.fc40        fedora               1.8 M
Installing dependencies:
 filesystem         x86_64     3.18-8.fc40          fedora               1.1 M
 glibc              x86_64     2.39-5.fc40          fedora               2.2 M
Installing weak dependencies:
 glibc-langpack-en  x86_64     2.39-5.fc40          fedora               0.6 M
Upgrading:
 tzdata             noarch     2024a-5.fc40         updates              0.4 M

Transaction Summary
================================================================================
Install  4 Packages
Upgrade  1 Package

Downloading Packages:
(1/3): bash-5.2.26-3.fc40.x86_64.rpm            5.1 MB/s | 1.8 MB     00:00
";
        assert_eq!(classify("Installing:"), None);
        assert_eq!(classify("Installing dependencies:"), None);
        assert_eq!(classify("Upgrading:"), None);

        let mut parser = TransactionProgress::new();
        let mut after_first_download = None;
        for line in transcript.lines() {
            if let Some(update) = parser.feed(line) {
                assert_eq!(update.phase, Phase::Downloading, "{line}");
                if update.counter.is_some() && after_first_download.is_none() {
                    after_first_download = Some(update.fraction);
                }
            }
        }
        let fraction = after_first_download.unwrap();
        assert!(fraction > 0.0 && fraction < 0.30, "fraction after first download line = {fraction}");
    }

    #[test]
    fn test_verifying_restart_does_not_regress() {
        let mut parser = TransactionProgress::new();
        parser.feed("  Verifying        : bash   3/3");
        let update = parser.feed("  Verifying        : glibc  1/3").unwrap();
        assert!((update.fraction - 0.95).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn fraction_never_decreases(lines in proptest::collection::vec(
            prop_oneof![
                Just("Downloading Packages:".to_string()),
                (1u64..50, 50u64..100).prop_map(|(a, b)| format!("({}/{}): pkg.rpm", a, b)),
                (1u64..50, 50u64..100).prop_map(|(a, b)| format!("  Installing : pkg  {}/{}", a, b)),
                (1u64..50, 50u64..100).prop_map(|(a, b)| format!("  Verifying  : pkg  {}/{}", a, b)),
                Just("Running transaction".to_string()),
                Just("Complete!".to_string()),
                Just("noise".to_string()),
            ],
            0..60,
        )) {
            let mut parser = TransactionProgress::new();
            let mut last = 0.0f64;
            for line in &lines {
                if let Some(update) = parser.feed(line) {
                    prop_assert!(update.fraction >= last);
                    prop_assert!((0.0..=1.0).contains(&update.fraction));
                    last = update.fraction;
                }
            }
        }
    }
}
