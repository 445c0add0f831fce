//! Internal testing utilities for the rten-extdata crates.

use std::fmt::Debug;
use std::panic::RefUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Utility for creating parametrized (aka. table-driven) tests.
///
/// Create a `Debug` struct, conventionally named `Case`, holding the data for
/// one case, collect the cases into an array or `Vec` and call `test_each`
/// with the test body.
///
/// Every case is run, even if earlier ones fail. If any case panics,
/// `test_each` panics afterwards with the count and debug representations
/// of the failing cases.
///
/// ```
/// use rten_extdata_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///   offset: u64,
///   expected: u64,
/// }
///
/// let cases = [
///   Case { offset: 10, expected: 64 },
///   Case { offset: 64, expected: 64 },
/// ];
///
/// cases.test_each(|case| {
///   assert_eq!(case.offset.next_multiple_of(64), case.expected);
/// });
/// ```
///
/// Test cases and anything captured by the test closure must be
/// [unwind safe](https://doc.rust-lang.org/std/panic/fn.catch_unwind.html).
/// Values with interior mutability should be created inside the closure
/// instead.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call `test` with a reference to each case, catching panics.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;
}

fn report_failures(failures: &[String]) {
    assert_eq!(
        failures.len(),
        0,
        "{} test cases failed: {:?}",
        failures.len(),
        failures
    );
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<String> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .map(|case| format!("{:?}", case))
            .collect();
        report_failures(&failures);
    }
}

/// A uniquely named directory under the system temporary directory, which is
/// removed together with its contents when dropped.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    /// Create a new directory whose name starts with `prefix`.
    pub fn new(prefix: &str) -> std::io::Result<TempDir> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let base = if cfg!(target_arch = "wasm32") {
            // `temp_dir` is not available on WASI.
            PathBuf::new()
        } else {
            std::env::temp_dir()
        };
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{}-{}-{}", prefix, std::process::id(), id));

        // Leftovers from an earlier, aborted run.
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;

        Ok(TempDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the path of `name` within this directory.
    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Generate `len` pseudo-random bytes from a fixed seed.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| rng.u8(..)).collect()
}
