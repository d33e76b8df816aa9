//! Internal testing utilities for the tilefuse crates.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Runner for table-driven tests.
///
/// Each case is run in isolation with panics caught, so a single run reports
/// every failing case rather than stopping at the first one. Cases are
/// conventionally a `Case` struct deriving `Debug`:
///
/// ```
/// use tilefuse_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     width: usize,
///     aligned: usize,
/// }
///
/// let cases = [
///     Case { width: 1, aligned: 16 },
///     Case { width: 16, aligned: 16 },
///     Case { width: 20, aligned: 32 },
/// ];
///
/// cases.test_each(|case| {
///     assert_eq!(case.width.div_ceil(16) * 16, case.aligned);
/// });
/// ```
///
/// Test cases and anything captured by the test closure must be unwind safe.
/// Build values with interior mutability (such as graphs under mutation)
/// inside the closure instead of capturing them.
pub trait TestCases {
    type Case;

    /// Run `test` with a reference to each case.
    ///
    /// Panics after all cases have run if any of them failed, listing the
    /// index and debug representation of each failure.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Run `test` with each case passed by value.
    ///
    /// The debug representation is captured before the case is moved into the
    /// test function.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn report_failures(failures: &[(usize, String)]) {
    if failures.is_empty() {
        return;
    }
    let details: Vec<String> = failures
        .iter()
        .map(|(index, case)| format!("#{} {}", index, case))
        .collect();
    panic!(
        "{} test cases failed:\n{}",
        failures.len(),
        details.join("\n")
    );
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        I::Item: Debug + RefUnwindSafe,
    {
        let mut failures = Vec::new();
        for (index, case) in self.into_iter().enumerate() {
            if std::panic::catch_unwind(|| test(&case)).is_err() {
                failures.push((index, format!("{:?}", case)));
            }
        }
        report_failures(&failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        I::Item: Debug + UnwindSafe,
    {
        let mut failures = Vec::new();
        for (index, case) in self.into_iter().enumerate() {
            let case_str = format!("{:?}", case);
            let test = &test;
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push((index, case_str));
            }
        }
        report_failures(&failures);
    }
}
