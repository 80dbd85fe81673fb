use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("novel2epub")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn download_rejects_unsupported_sites_without_touching_the_network() {
    Command::cargo_bin("novel2epub")
        .unwrap()
        .args(["download", "--url", "https://example.com/truyen/x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported novel url"));
}

#[test]
fn download_rejects_malformed_urls() {
    Command::cargo_bin("novel2epub")
        .unwrap()
        .args(["download", "--url", "not a url"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parse --url"));
}
