//! Subtest registration, selection and pass/fail/skip bookkeeping

use crate::{Error, Result};

use std::ffi::OsString;
use std::fmt;

/// Outcome of a subtest or of a whole run
///
/// Ordered so that merging keeps the worst outcome: fail beats pass, and
/// pass beats skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TestResult {
    /// The host cannot run the test
    Skip,
    /// Every check held
    Pass,
    /// At least one check did not hold
    Fail,
}

impl TestResult {
    /// Combine two outcomes
    pub fn merge(self, other: TestResult) -> TestResult {
        self.max(other)
    }

    /// Lowercase name used in reports
    pub fn as_str(self) -> &'static str {
        match self {
            TestResult::Skip => "skip",
            TestResult::Pass => "pass",
            TestResult::Fail => "fail",
        }
    }

    /// Process exit status for this outcome
    pub fn exit_code(self) -> i32 {
        match self {
            TestResult::Pass => 0,
            TestResult::Fail => 1,
            TestResult::Skip => 77,
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named check run against an environment `E`
pub struct Subtest<E> {
    /// Name used in reports
    pub name: &'static str,
    /// Name accepted on the command line
    pub option: &'static str,
    /// The check itself
    pub run: fn(&mut E) -> TestResult,
}

impl<E> fmt::Debug for Subtest<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subtest")
            .field("name", &self.name)
            .field("option", &self.option)
            .finish()
    }
}

/// Result of [`Harness::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Every subtest that ran, in order
    pub subtests: Vec<(&'static str, TestResult)>,
    /// All outcomes merged into the initial one
    pub result: TestResult,
}

/// An ordered set of subtests
pub struct Harness<E> {
    subtests: Vec<Subtest<E>>,
}

impl<E> fmt::Debug for Harness<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.subtests.iter()).finish()
    }
}

impl<E> Harness<E> {
    /// Register `subtests`
    pub fn new(subtests: Vec<Subtest<E>>) -> Harness<E> {
        Harness { subtests }
    }

    /// All registered subtests
    pub fn subtests(&self) -> &[Subtest<E>] {
        &self.subtests
    }

    /// Resolve `names` against the registered subtests.
    ///
    /// An empty selection means every subtest.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<&Subtest<E>>> {
        if names.is_empty() {
            return Ok(self.subtests.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.subtests
                    .iter()
                    .find(|subtest| subtest.option == name || subtest.name == name)
                    .ok_or_else(|| Error::UnknownSubtest(name.to_owned()))
            })
            .collect()
    }

    /// Run the selected subtests in order, merging their results into `initial`
    pub fn run<S: AsRef<str>>(
        &self,
        env: &mut E,
        names: &[S],
        initial: TestResult,
    ) -> Result<Summary> {
        let mut summary = Summary {
            subtests: Vec::new(),
            result: initial,
        };
        for subtest in self.select(names)? {
            log::debug!("running subtest {}", subtest.name);
            let result = (subtest.run)(env);
            log::info!("subtest {}: {}", subtest.name, result);
            summary.subtests.push((subtest.name, result));
            summary.result = summary.result.merge(result);
        }
        Ok(summary)
    }
}

/// Rewrite the single-dash flags used by piglit runners.
///
/// `-auto` and `-fbo` carry no meaning for this program and are dropped;
/// `-subtest` and `-list-subtests` become their double-dash forms.
pub fn strip_legacy_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .filter(|arg| arg != "-auto" && arg != "-fbo")
        .map(|arg| {
            if arg == "-subtest" {
                OsString::from("--subtest")
            } else if arg == "-list-subtests" {
                OsString::from("--list-subtests")
            } else {
                arg
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn pass(_: &mut Vec<&'static str>) -> TestResult {
        TestResult::Pass
    }

    fn fail(log: &mut Vec<&'static str>) -> TestResult {
        log.push("fail");
        TestResult::Fail
    }

    fn skip(log: &mut Vec<&'static str>) -> TestResult {
        log.push("skip");
        TestResult::Skip
    }

    fn harness() -> Harness<Vec<&'static str>> {
        Harness::new(vec![
            Subtest { name: "first", option: "first", run: pass },
            Subtest { name: "second", option: "second", run: skip },
            Subtest { name: "third", option: "third", run: fail },
        ])
    }

    #[test]
    fn merge_keeps_worst() {
        assert_eq!(TestResult::Skip.merge(TestResult::Pass), TestResult::Pass);
        assert_eq!(TestResult::Pass.merge(TestResult::Skip), TestResult::Pass);
        assert_eq!(TestResult::Pass.merge(TestResult::Fail), TestResult::Fail);
        assert_eq!(TestResult::Fail.merge(TestResult::Skip), TestResult::Fail);
    }

    #[test]
    fn empty_selection_runs_everything() {
        let mut log = Vec::new();
        let summary = harness()
            .run::<&str>(&mut log, &[], TestResult::Skip)
            .unwrap();
        assert_eq!(summary.subtests.len(), 3);
        assert_eq!(summary.result, TestResult::Fail);
        assert_eq!(log, ["skip", "fail"]);
    }

    #[test]
    fn selection_runs_in_requested_order() {
        let mut log = Vec::new();
        let summary = harness()
            .run(&mut log, &["second", "first"], TestResult::Skip)
            .unwrap();
        assert_eq!(
            summary.subtests,
            [("second", TestResult::Skip), ("first", TestResult::Pass)]
        );
        assert_eq!(summary.result, TestResult::Pass);
    }

    #[test]
    fn unknown_subtest_is_an_error() {
        let mut log = Vec::new();
        let err = harness()
            .run(&mut log, &["fourth"], TestResult::Skip)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSubtest(name) if name == "fourth"));
        assert!(log.is_empty());
    }

    #[test]
    fn legacy_flags_are_stripped() {
        let args = ["prog", "-auto", "-subtest", "x", "-fbo", "--simulated"]
            .into_iter()
            .map(OsString::from);
        assert_eq!(
            strip_legacy_args(args),
            ["prog", "--subtest", "x", "--simulated"]
                .into_iter()
                .map(OsString::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(TestResult::Pass.exit_code(), 0);
        assert_eq!(TestResult::Fail.exit_code(), 1);
        assert_eq!(TestResult::Skip.exit_code(), 77);
    }
}
