use anyhow::{Context, Result, bail};
use std::fs::{self, DirEntry};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;
use tempfile::TempDir;

const CLI_UNDER_TEST: &str = "utron-tools";

fn main() -> Result<()> {
    let mut ran_any = false;
    for test_dir in std::env::args().skip(1).filter(|x| !x.starts_with("--")) {
        ran_any = true;
        run_tests(PathBuf::from(test_dir))?;
    }
    if !ran_any {
        run_tests(PathBuf::from("test_cases"))?;
    }
    Ok(())
}

fn run_tests(test_dir: impl AsRef<Path>) -> Result<()> {
    let test_dir = test_dir.as_ref();
    let mut test_cases = discover_test_cases(test_dir)?;

    //randomize order, tests must not depend on each other
    use rand::seq::SliceRandom;
    let mut rng = rand::rng();
    test_cases.shuffle(&mut rng);

    let mut passed = 0;
    let mut failed = 0;
    let binary = find_binary()?;
    let start = std::time::Instant::now();

    println!("Found {} test cases", test_cases.len());
    for test_case in test_cases {
        print!(
            "\n  Running {} test: {}",
            if test_case.is_failure {
                "failure"
            } else {
                "output"
            },
            test_case.dir.display()
        );
        let test_result = if test_case.is_failure {
            run_failure_test(&test_case, binary.as_ref())
        } else {
            run_output_test(&test_case, binary.as_ref())
        };
        match test_result {
            Ok(()) => {
                print!("\r✅");
                passed += 1;
            }
            Err(e) => {
                print!("\r❌");
                print!("\n{:?}", e);
                failed += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    println!(
        "\nTest results: {} passed, {} failed. Took {}.{:03}s.",
        passed,
        failed,
        elapsed.as_secs(),
        elapsed.subsec_millis()
    );
    if failed > 0 {
        process::exit(1);
    }
    Ok(())
}

/// Finds the binary in $PATH, or next to this runner (building it first
/// when we're running from a cargo target directory).
fn find_binary() -> Result<PathBuf> {
    let from_path = std::env::var_os("PATH").and_then(|path| {
        path.to_string_lossy()
            .split(':')
            .map(PathBuf::from)
            .find_map(|dir| {
                let full_path = dir.join(CLI_UNDER_TEST);
                let executable = fs::metadata(&full_path)
                    .map(|m| m.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false);
                (full_path.is_file() && executable).then_some(full_path)
            })
    });
    if let Some(path) = from_path {
        return Ok(path);
    }
    let current_exe = std::env::current_exe().context("Get current executable path")?;
    let parent = current_exe
        .parent()
        .context("Get parent directory of executable")?;
    let profile = parent.file_name().unwrap().to_string_lossy().to_string();
    if profile == "debug" || profile == "release" {
        let mut build = std::process::Command::new("cargo");
        build.arg("build");
        if profile == "release" {
            build.arg("--release");
        }
        build
            .status()
            .context("Failed to run cargo build")?
            .success()
            .then_some(())
            .ok_or_else(|| anyhow::anyhow!("Cargo build failed"))?;
    }
    let bin_path = parent.join(CLI_UNDER_TEST);
    if !bin_path.exists() {
        bail!(
            "{CLI_UNDER_TEST} binary not found at: {}",
            bin_path.display()
        );
    }
    Ok(bin_path)
}

struct TestCase {
    dir: PathBuf,
    is_failure: bool,
}

fn discover_test_cases(dir: &Path) -> Result<Vec<TestCase>> {
    if !dir.exists() {
        bail!("Test directory does not exist: {}", dir.display());
    }
    let mut test_cases = Vec::new();
    discover_recursive(dir, &mut test_cases)?;
    Ok(test_cases)
}

fn discover_recursive(dir: &Path, test_cases: &mut Vec<TestCase>) -> Result<()> {
    if dir.join("input.toml").exists() && !dir.join("ignore").exists() {
        test_cases.push(TestCase {
            dir: dir.to_path_buf(),
            is_failure: dir.join("expected_error.txt").exists(),
        });
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && path.file_name().unwrap() != "actual" {
            discover_recursive(&path, test_cases)?;
        }
    }
    Ok(())
}

struct TestOutput {
    stderr: String,
    return_code: i32,
    temp_dir: TempDir,
}

fn perform_test(test_case: &TestCase, binary: &Path) -> Result<TestOutput> {
    let temp_dir = tempfile::tempdir().context("make tempdir")?;
    let input_files = scan_dir(&test_case.dir, |relative_path, _| {
        relative_path.starts_with("input")
    })?;
    copy_files(&input_files, temp_dir.path())?;

    let proc = std::process::Command::new(binary)
        .arg(temp_dir.path().join("input.toml"))
        .env("NO_FRIENDLY_PANIC", "1")
        .current_dir(temp_dir.path())
        .output()
        .context(format!("Failed to run {CLI_UNDER_TEST}"))?;

    Ok(TestOutput {
        stderr: String::from_utf8_lossy(&proc.stderr).to_string(),
        return_code: proc.status.code().unwrap_or(-1),
        temp_dir,
    })
}

fn run_failure_test(test_case: &TestCase, binary: &Path) -> Result<()> {
    let rr = perform_test(test_case, binary)?;
    if rr.return_code == 0 {
        bail!("Expected a failure, but the run succeeded.");
    }
    let expected = fs::read_to_string(test_case.dir.join("expected_error.txt"))
        .context("Read expected error file")?
        .trim()
        .to_string();
    if !rr.stderr.contains(&expected) {
        bail!(
            "{CLI_UNDER_TEST} failed, but not as expected.\nExpected: {}\nActual stderr: '{}'",
            expected,
            rr.stderr
        );
    }
    Ok(())
}

fn run_output_test(test_case: &TestCase, binary: &Path) -> Result<()> {
    let rr = perform_test(test_case, binary)?;
    if rr.return_code != 0 {
        bail!(
            "{CLI_UNDER_TEST} failed with return code: {}\nstderr: {}",
            rr.return_code,
            rr.stderr
        );
    }

    let expected_files = scan_dir(&test_case.dir, |relative_path, filename| {
        !relative_path.starts_with("input")
            && !relative_path.starts_with("actual")
            && filename != "expected_error.txt"
            && filename != "ignore"
    })?;
    let produced_files = scan_dir(rr.temp_dir.path(), |relative_path, _| {
        !relative_path.starts_with("input")
    })?;

    let mut msg = String::new();
    for missing in diff(&expected_files, &produced_files) {
        msg.push_str(&format!("\t- Expected output file not created: {}\n", missing));
    }
    for unexpected in diff(&produced_files, &expected_files) {
        msg.push_str(&format!("\t- Unexpected output file created: {}\n", unexpected));
    }
    for relative in common(&expected_files, &produced_files) {
        if !files_equal(
            &test_case.dir.join(&relative),
            &rr.temp_dir.path().join(&relative),
        )? {
            msg.push_str(&format!("\t- {} (mismatched)\n", relative));
        }
    }
    if !msg.is_empty() {
        // keep the produced tree around for inspection
        let actual_dir = test_case.dir.join("actual");
        if actual_dir.exists() {
            fs::remove_dir_all(&actual_dir)?;
        }
        let all_files = scan_dir(rr.temp_dir.path(), |_, _| true)?;
        copy_files(&all_files, &actual_dir)?;
        bail!("\toutput files failed verification.\n{}", msg);
    }
    Ok(())
}

fn read_maybe_compressed(filename: &Path) -> Result<String> {
    let fh = std::fs::File::open(filename)
        .with_context(|| format!("Could not open file {:?}", filename))?;
    let mut wrapped = niffler::send::get_reader(Box::new(fh))?;
    let mut out: Vec<u8> = Vec::new();
    wrapped.0.read_to_end(&mut out)?;
    Ok(std::str::from_utf8(&out)?.to_string())
}

fn files_equal(file_a: &Path, file_b: &Path) -> Result<bool> {
    let content_a = ex::fs::read(file_a)?;
    let content_b = ex::fs::read(file_b)?;
    if content_a == content_b {
        return Ok(true);
    }
    // gzip headers differ between writers, compare the payload
    if file_a.extension() == Some(std::ffi::OsStr::new("gz")) {
        return Ok(read_maybe_compressed(file_a)? == read_maybe_compressed(file_b)?);
    }
    Ok(false)
}

fn visit_dirs(dir: &Path, cb: &mut dyn FnMut(&DirEntry) -> Result<()>) -> Result<()> {
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                visit_dirs(&entry.path(), cb)?;
            } else {
                cb(&entry)?;
            }
        }
    }
    Ok(())
}

fn scan_dir<F: Fn(&str, &str) -> bool>(dir: &Path, keep: F) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    visit_dirs(dir, &mut |entry: &DirEntry| -> Result<()> {
        let path = entry.path();
        let relative_path = path
            .strip_prefix(dir)
            .context("Strip prefix from directory path")?
            .to_string_lossy()
            .to_string();
        if let Some(file_name) = path.file_name() {
            if keep(&relative_path, &file_name.to_string_lossy()) {
                files.push((path.clone(), relative_path));
            }
        }
        Ok(())
    })?;
    Ok(files)
}

fn copy_files(files: &[(PathBuf, String)], target_dir: &Path) -> Result<()> {
    for (source, relative_path) in files {
        let dst_path = target_dir.join(relative_path);
        std::fs::create_dir_all(dst_path.parent().unwrap())?;
        fs::copy(source, &dst_path)?;
    }
    Ok(())
}

fn diff(files_a: &[(PathBuf, String)], files_b: &[(PathBuf, String)]) -> Vec<String> {
    let set_b: std::collections::HashSet<&String> =
        files_b.iter().map(|(_, rel)| rel).collect();
    files_a
        .iter()
        .filter(|(_, rel)| !set_b.contains(rel))
        .map(|(_, rel)| rel.clone())
        .collect()
}

fn common(files_a: &[(PathBuf, String)], files_b: &[(PathBuf, String)]) -> Vec<String> {
    let set_b: std::collections::HashSet<&String> =
        files_b.iter().map(|(_, rel)| rel).collect();
    files_a
        .iter()
        .filter(|(_, rel)| set_b.contains(rel))
        .map(|(_, rel)| rel.clone())
        .collect()
}
