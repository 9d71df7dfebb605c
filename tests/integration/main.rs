//! Integration tests for buildenv

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn buildenv() -> Command {
        let mut cmd = cargo_bin_cmd!("buildenv");
        cmd.env_remove("BUILDENV_CONFIG");
        cmd
    }

    /// Config that keeps locks and catalog inside `dir` and points at an rbd that does not exist
    fn write_config(dir: &Path) -> PathBuf {
        let path = dir.join("config.toml");
        let content = format!(
            r#"
[storage]
rbd_binary = "{rbd}"

[locks]
dir = "{locks}"

[catalog]
dir = "{catalog}"
"#,
            rbd = dir.join("no-such-rbd").display(),
            locks = dir.join("locks").display(),
            catalog = dir.join("catalog").display(),
        );
        fs::write(&path, content).unwrap();
        path
    }

    fn seed_image(dir: &Path, id: &str, published: bool) {
        let images = dir.join("catalog").join("images");
        fs::create_dir_all(&images).unwrap();
        let record = format!(
            r#"{{"id":"{id}","comment":"base","created_at":"2026-01-02T03:04:05Z","packages":[]}}"#
        );
        fs::write(images.join(format!("{id}.json")), record).unwrap();
        if published {
            fs::write(
                dir.join("catalog").join("published.json"),
                format!(r#"["{id}"]"#),
            )
            .unwrap();
        }
    }

    #[test]
    fn help_displays() {
        buildenv()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Copy-on-write build environment images"));
    }

    #[test]
    fn version_displays() {
        buildenv()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("buildenv"));
    }

    #[test]
    fn config_path_follows_flag() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(config.display().to_string()));
    }

    #[test]
    fn config_show_merges_defaults() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[storage]"))
            .stdout(predicate::str::contains("buildenv-images"))
            .stdout(predicate::str::contains("no-such-rbd"));
    }

    #[test]
    fn config_init_writes_defaults_once() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("nested").join("config.toml");

        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration written"));
        let written = fs::read_to_string(&config).unwrap();
        assert!(written.contains("buildenv-images"));

        fs::write(&config, "[storage]\nimage_pool = \"mine\"\n").unwrap();
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
        assert!(fs::read_to_string(&config).unwrap().contains("mine"));

        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["config", "init", "--force"])
            .assert()
            .success();
        assert!(!fs::read_to_string(&config).unwrap().contains("mine"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("broken.toml");
        fs::write(&config, "[storage\n").unwrap();
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn image_list_empty() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["image", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No images"));
    }

    #[test]
    fn image_list_json_marks_published() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        let id = "6f1c2a9e-0000-4000-8000-000000000001";
        seed_image(temp.path(), id, true);

        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["image", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains(id))
            .stdout(predicate::str::contains("\"published\""));
    }

    #[test]
    fn image_find_without_published_images() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["image", "find", "gcc:amd64 >= 12"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No published images"));
    }

    #[test]
    fn image_find_rejects_bad_requirement() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["image", "find", "gcc"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid requirement"));
    }

    #[test]
    fn image_find_rejects_contradiction() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["image", "find", "gcc:amd64 >= 13", "gcc:amd64 < 12"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn image_packages_unknown_id() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["image", "packages", "6f1c2a9e-0000-4000-8000-000000000002"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Image not found"));
    }

    #[test]
    fn image_delete_unknown_id_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["image", "delete", "6f1c2a9e-0000-4000-8000-000000000003"])
            .assert()
            .success()
            .stdout(predicate::str::contains("does not exist"));
    }

    #[test]
    fn malformed_image_id() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["image", "publish", "not-a-uuid"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not-a-uuid"));
    }

    #[test]
    fn scratch_without_rbd_hints_at_tools() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        buildenv()
            .arg("-c")
            .arg(&config)
            .args(["scratch", "delete", "build-1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn unknown_subcommand_fails() {
        buildenv().arg("frobnicate").assert().failure();
    }
}
