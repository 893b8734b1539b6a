use assert_cmd::prelude::*;
use predicates::prelude::*;

/// This test is broker-backed and is skipped if BROKER_URL is not set to a
/// reachable driftq instance.
#[test]
fn cli_runs_submit_rejects_invalid_fail_mode() -> anyhow::Result<()> {
    if std::env::var("BROKER_URL").is_err() {
        eprintln!("SKIP: BROKER_URL not set");
        return Ok(());
    }

    let mut cmd = assert_cmd::Command::cargo_bin("sidefx")?;
    cmd.args([
        "runs",
        "submit",
        "--business-key",
        "order-cli-test",
        "--amount",
        "10.0",
        "--fail-mode",
        "not_a_real_mode",
    ]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid --fail-mode"));

    Ok(())
}

#[test]
fn cli_without_subcommand_prints_usage() -> anyhow::Result<()> {
    let mut cmd = assert_cmd::Command::cargo_bin("sidefx")?;
    cmd.assert().failure();
    Ok(())
}
