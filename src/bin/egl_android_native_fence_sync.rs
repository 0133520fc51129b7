//! Run the `EGL_ANDROID_native_fence_sync` subtests and report in piglit's format

use clap::error::ErrorKind;
use clap::Parser;
use native_fence_sync::simulated::{SimulatedDriver, SimulatedTimelines};
use native_fence_sync::subtests::{self, Conformance};
use native_fence_sync::{strip_legacy_args, FenceBackend, Result, SyncDriver, TestResult};

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
/// Conformance tests for EGL_ANDROID_native_fence_sync
struct Cli {
    /// Only run this subtest, may be repeated
    #[arg(long, value_name = "NAME")]
    subtest: Vec<String>,

    /// Print the available subtests and exit
    #[arg(long)]
    list_subtests: bool,

    /// Run against the in-process EGL driver and timelines instead of libEGL
    #[arg(long)]
    simulated: bool,

    /// sw_sync device to open instead of the default locations, may be repeated
    #[arg(long, value_name = "PATH")]
    sw_sync_device: Vec<PathBuf>,
}

fn run<D, B>(driver: D, backend: B, names: &[String]) -> Result<TestResult>
where
    D: SyncDriver<Fence = B::Fence>,
    B: FenceBackend,
{
    let mut env = Conformance::new(driver, backend);
    let summary = subtests::harness().run(&mut env, names, TestResult::Skip)?;
    for (name, result) in &summary.subtests {
        println!("PIGLIT: {{\"subtest\": {{\"{}\" : \"{}\"}}}}", name, result);
    }
    Ok(summary.result)
}

#[cfg(feature = "egl")]
fn run_egl(cli: &Cli) -> Result<TestResult> {
    use native_fence_sync::SwSync;

    let driver = native_fence_sync::egl::EglDriver::new()?;
    let backend = if cli.sw_sync_device.is_empty() {
        SwSync::new()
    } else {
        SwSync::with_paths(cli.sw_sync_device.clone())
    };
    log::debug!("using {:?} with {:?}", driver, backend);
    run(driver, backend, &cli.subtest)
}

#[cfg(not(feature = "egl"))]
fn run_egl(_cli: &Cli) -> Result<TestResult> {
    Err(native_fence_sync::Error::EglUnavailable(
        "built without the `egl` feature".to_owned(),
    ))
}

fn run_selected(cli: &Cli) -> Result<TestResult> {
    // Reject unknown names before loading anything.
    subtests::harness::<SimulatedDriver, SimulatedTimelines>().select(&cli.subtest)?;

    if cli.simulated {
        let fences = SimulatedTimelines::new();
        run(SimulatedDriver::new(fences.clone()), fences, &cli.subtest)
    } else {
        run_egl(cli)
    }
}

/// Outcome of a rejected command line, or `None` when clap only printed help or version
fn usage_outcome(err: &clap::Error) -> Option<TestResult> {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => None,
        _ => Some(TestResult::Fail),
    }
}

fn report(result: TestResult) -> ! {
    println!("PIGLIT: {{\"result\": \"{}\" }}", result);
    std::process::exit(result.exit_code());
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse_from(strip_legacy_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => match usage_outcome(&err) {
            Some(result) => {
                if let Err(print) = err.print() {
                    log::error!("{}", print);
                }
                report(result)
            }
            None => err.exit(),
        },
    };

    if cli.list_subtests {
        for subtest in subtests::harness::<SimulatedDriver, SimulatedTimelines>().subtests() {
            println!("{}: {}", subtest.option, subtest.name);
        }
        return;
    }

    let result = run_selected(&cli).unwrap_or_else(|err| {
        log::error!("{}", err);
        if err.is_inconclusive() {
            TestResult::Skip
        } else {
            TestResult::Fail
        }
    });

    report(result)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::ffi::OsString;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(strip_legacy_args(args.iter().map(OsString::from)))
    }

    #[test]
    fn legacy_arguments_are_accepted() {
        let args = ["runner", "-auto", "-fbo", "-subtest", "eglDupNativeFenceFDANDROID"];
        let cli = parse(&args).unwrap();
        assert_eq!(cli.subtest, ["eglDupNativeFenceFDANDROID"]);
        assert!(!cli.simulated);
    }

    #[test]
    fn leftover_arguments_fail() {
        let err = parse(&["runner", "-unknown-flag"]).unwrap_err();
        assert_eq!(usage_outcome(&err), Some(TestResult::Fail));
        assert_eq!(TestResult::Fail.exit_code(), 1);

        let err = parse(&["runner", "--subtest"]).unwrap_err();
        assert_eq!(usage_outcome(&err), Some(TestResult::Fail));
    }

    #[test]
    fn help_and_version_are_not_failures() {
        let err = parse(&["runner", "--help"]).unwrap_err();
        assert_eq!(usage_outcome(&err), None);
        let err = parse(&["runner", "--version"]).unwrap_err();
        assert_eq!(usage_outcome(&err), None);
    }
}
