use mdbox::{BoxController, BoxExtents, BoxResult, BoxTree, FullRecord, LeanRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::backtrace::Backtrace;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

/// Runs a test between a setup and a teardown step.
/// The teardown runs even when the test fails; failures report the step and elapsed time.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> BoxResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> BoxResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> BoxResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    let start_time = Instant::now();
    let result = std::panic::catch_unwind(|| {
        let backtrace = Backtrace::capture();
        match before() {
            Ok(ctx) => match test(ctx.clone()) {
                Ok(_) => after(ctx)
                    .map_err(|e| (format!("After run failed: {:?}", e), backtrace.to_string())),
                Err(e) => {
                    let _ = after(ctx);
                    Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                }
            },
            Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
        }
    });

    let elapsed = start_time.elapsed();
    let (error, backtrace) = match result {
        Ok(Ok(_)) => return,
        Ok(Err(failure)) => failure,
        Err(panic_err) => {
            let message = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            (format!("Panic: {}", message), String::new())
        }
    };

    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {:?}", elapsed);
    eprintln!("Error: {}", error);
    if !backtrace.is_empty() && !backtrace.contains("disabled") {
        eprintln!("\nBacktrace:\n{}", backtrace);
    }
    eprintln!("=====================================================\n");
    panic!("Test failed: {}", error);
}

/// A scratch directory for container files
#[derive(Clone)]
pub struct TestContext {
    dir: Arc<TempDir>,
}

impl TestContext {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a container file inside the scratch directory
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn create_test_context() -> BoxResult<TestContext> {
    let dir = tempfile::Builder::new().prefix("mdbox-").tempdir()?;
    Ok(TestContext { dir: Arc::new(dir) })
}

pub fn cleanup(ctx: TestContext) -> BoxResult<()> {
    for entry in fs::read_dir(ctx.dir())? {
        fs::remove_file(entry?.path())?;
    }
    Ok(())
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `n` lean records uniformly spread over `[min, max)` in every dimension
pub fn uniform_lean_records(rng: &mut StdRng, n: usize, nd: usize, min: f32, max: f32) -> Vec<LeanRecord> {
    (0..n)
        .map(|_| {
            let coords: Vec<f32> = (0..nd).map(|_| rng.gen_range(min..max)).collect();
            LeanRecord::new(rng.gen_range(0.5..1.5), 1.0, &coords)
        })
        .collect()
}

/// `n` full records spread over `runs` runs
pub fn uniform_full_records(rng: &mut StdRng, n: usize, nd: usize, runs: u16) -> Vec<FullRecord> {
    (0..n)
        .map(|i| {
            let coords: Vec<f32> = (0..nd).map(|_| rng.gen_range(0.0..1.0)).collect();
            FullRecord::new(1.0, 1.0, i as u16 % runs.max(1), rng.gen_range(0..1000), &coords)
        })
        .collect()
}

/// An empty tree over the unit cube
pub fn unit_tree<R: mdbox::Record>(
    nd: usize,
    branching: u32,
    split_threshold: u64,
) -> BoxResult<BoxTree<R>> {
    let controller = BoxController::builder(nd)
        .branching(branching)
        .split_threshold(split_threshold)
        .build()?;
    BoxTree::new(controller, BoxExtents::uniform(nd, 0.0, 1.0))
}
