//! Shared test infrastructure for integration tests.
//!
//! Each test gets a throwaway dataset plus a `bin/` directory of `sh`
//! scripts that stand in for the imaging toolkit, so the real binary can be
//! driven end to end without the toolkit installed.
#![allow(dead_code)]

use std::env;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub const SUBJECT: &str = "sub-01";
pub const RAW_IMAGE: &[u8] = b"raw t2w";

/// Copies `-i` to `-o`, like a reorient or resample would.
const COPY_INPUT_TO_OUTPUT: &str = r#"while [ $# -gt 0 ]; do
  case "$1" in -i) in="$2"; shift;; -o) out="$2"; shift;; esac
  shift
done
cp "$in" "$out""#;

const FAKE_DEEPSEG: &str = r#"while [ $# -gt 0 ]; do
  case "$1" in -i) in="$2"; shift;; -c) c="$2"; shift;; -o) out="$2"; shift;; esac
  shift
done
echo "sct_deepseg_sc $(basename "$in") $c" >> calls.txt
printf auto-seg > "$out""#;

const FAKE_LABEL_VERTEBRAE: &str = r#"while [ $# -gt 0 ]; do
  case "$1" in -i) in="$2"; shift;; -s) seg="$2"; shift;; -c) c="$2"; shift;; -ofolder) dir="$2"; shift;; esac
  shift
done
echo "sct_label_vertebrae $(basename "$in") $c" >> calls.txt
printf auto-discs > "$dir/$(basename "$seg" .nii.gz)_labeled_discs.nii.gz""#;

const FAKE_PROCESS_SEGMENTATION: &str = r#"while [ $# -gt 0 ]; do
  case "$1" in -o) out="$2"; shift;; esac
  shift
done
mkdir -p "$(dirname "$out")"
echo csa >> "$out""#;

/// Stand-ins for every program the default config runs.
pub const FAKE_TOOLKIT: [(&str, &str); 7] = [
    ("sct_image", COPY_INPUT_TO_OUTPUT),
    ("sct_resample", COPY_INPUT_TO_OUTPUT),
    ("sct_deepseg_sc", FAKE_DEEPSEG),
    ("sct_label_vertebrae", FAKE_LABEL_VERTEBRAE),
    ("sct_register_to_template", "printf warp > warp_template2anat.nii.gz"),
    ("sct_warp_template", "exit 0"),
    ("sct_process_segmentation", FAKE_PROCESS_SEGMENTATION),
];

/// Temporary dataset, output root and fake-tool directory.
pub struct Workspace {
    _dir: TempDir,
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub bin_dir: PathBuf,
}

impl Workspace {
    /// Returns `None` (and the test should skip) when `/bin/sh` is missing.
    pub fn new() -> Option<Self> {
        if !Path::new("/bin/sh").is_file() {
            eprintln!("Skipping: /bin/sh not available");
            return None;
        }
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path().to_path_buf();
        let workspace = Self {
            data_dir: root.join("data"),
            output_dir: root.join("out"),
            bin_dir: root.join("bin"),
            root,
            _dir: dir,
        };
        fs::create_dir_all(&workspace.bin_dir).expect("create bin dir");
        workspace.write_file(
            &format!("data/{SUBJECT}/anat/{SUBJECT}_T2w.nii.gz"),
            RAW_IMAGE,
        );
        Some(workspace)
    }

    pub fn write_file(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn write_tool(&self, name: &str, body: &str) {
        let path = self.bin_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod tool");
    }

    pub fn install_fake_toolkit(&self) {
        for (name, body) in FAKE_TOOLKIT {
            self.write_tool(name, body);
        }
    }

    /// Curated override for `sub-01` in the default `labels` profile.
    pub fn write_curated(&self, file_name: &str, contents: &[u8]) -> PathBuf {
        self.write_file(
            &format!("data/derivatives/labels/{SUBJECT}/anat/{file_name}"),
            contents,
        )
    }

    pub fn work_dir(&self) -> PathBuf {
        self.output_dir
            .join("data_processed")
            .join(SUBJECT)
            .join("anat")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("cordprep.json")
    }

    fn search_path(&self) -> OsString {
        let mut paths = vec![self.bin_dir.clone()];
        if let Some(existing) = env::var_os("PATH") {
            paths.extend(env::split_paths(&existing));
        }
        env::join_paths(paths).expect("join PATH")
    }

    /// The binary under test, isolated from the caller's config dirs.
    pub fn cordprep(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_cordprep"));
        command
            .current_dir(&self.root)
            .env("PATH", self.search_path())
            .env("HOME", &self.root)
            .env("XDG_CONFIG_HOME", self.root.join(".config"))
            .env("RUST_LOG", "info");
        command
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.cordprep().args(args).output().expect("run cordprep")
    }

    /// Write the default config with `init` and return its path.
    pub fn init_config(&self) -> PathBuf {
        let path = self.config_path();
        let output = self
            .cordprep()
            .arg("init")
            .arg("--config")
            .arg(&path)
            .output()
            .expect("run init");
        assert_success(&output);
        path
    }

    pub fn process(&self) -> Output {
        self.cordprep()
            .arg("--config")
            .arg(self.config_path())
            .args(["process", "--subject", SUBJECT, "--data-dir"])
            .arg(&self.data_dir)
            .arg("--output-dir")
            .arg(&self.output_dir)
            .output()
            .expect("run process")
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

pub fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "cordprep failed: {}\nstdout: {}",
        stderr(output),
        stdout(output)
    );
}

pub fn read_json(path: &Path) -> serde_json::Value {
    let text = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("read {}: {err}", path.display()));
    serde_json::from_str(&text).expect("parse JSON")
}
