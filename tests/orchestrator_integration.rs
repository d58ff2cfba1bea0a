mod common;

use common::{ORIGIN_BODY, https_origin};
use proxywrap::child::ChildEnvironment;
use proxywrap::cli::Invocation;
use proxywrap::config::WrapperConfig;
use proxywrap::orchestrator::{
    EXIT_CACHE_DIR_UNAVAILABLE, EXIT_CHILD_ABNORMAL, EXIT_LAUNCH_FAILED, Orchestrator,
};
use proxywrap::proxy::ProxyConfig;
use proxywrap::telemetry::AuditLogger;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

fn orchestrator() -> Orchestrator {
    let path = std::env::var_os("PATH").unwrap_or_else(|| "/usr/bin:/bin".into());
    Orchestrator::new(Arc::new(AuditLogger::new_null()))
        .with_identity("test")
        .with_base_env(ChildEnvironment::from_base([
            ("PATH", path),
            ("NO_PROXY", OsString::from("*")),
        ]))
}

fn shell(script: &str) -> Invocation {
    Invocation {
        tool: "sh".to_string(),
        tool_args: vec!["-c".to_string(), script.to_string()],
        ..Invocation::default()
    }
}

fn config(cache_dir: &Path) -> WrapperConfig {
    WrapperConfig {
        proxy: ProxyConfig {
            insecure_upstream_tls: true,
            ..ProxyConfig::default()
        },
        cache_dir: Some(cache_dir.to_path_buf()),
        syslog: false,
    }
}

#[test]
fn test_tool_exit_code_is_returned() {
    let cache = tempfile::tempdir().unwrap();
    let code = orchestrator().run(&shell("exit 3"), &config(cache.path()));
    assert_eq!(code, 3);
}

#[test]
fn test_tool_sees_proxy_and_trust_environment() {
    let cache = tempfile::tempdir().unwrap();
    let script = r#"
        case "$HTTPS_PROXY" in http://127.0.0.1:*) ;; *) exit 10 ;; esac
        [ "$HTTP_PROXY" = "$HTTPS_PROXY" ] || exit 11
        [ "$https_proxy" = "$HTTPS_PROXY" ] || exit 11
        [ -z "$NO_PROXY" ] || exit 12
        [ -f "$NODE_EXTRA_CA_CERTS" ] || exit 13
        [ -f "$SSL_CERT_FILE" ] || exit 14
        [ "$REQUESTS_CA_BUNDLE" = "$SSL_CERT_FILE" ] || exit 15
        grep -q "BEGIN CERTIFICATE" "$SSL_CERT_FILE" || exit 16
        exit 0
    "#;
    let code = orchestrator().run(&shell(script), &config(cache.path()));
    assert_eq!(code, 0);
}

#[test]
fn test_root_anchor_is_private_to_the_run() {
    let cache = tempfile::tempdir().unwrap();
    let script = format!(
        r#"
        case "$NODE_EXTRA_CA_CERTS" in '{}'/*) exit 20 ;; esac
        [ "$(dirname "$NODE_EXTRA_CA_CERTS")" = "$(dirname "$SSL_CERT_FILE")" ] || exit 21
        [ "$(grep -c 'BEGIN CERTIFICATE' "$NODE_EXTRA_CA_CERTS")" = 1 ] || exit 22
        exit 0
    "#,
        cache.path().display()
    );
    let code = orchestrator().run(&shell(&script), &config(cache.path()));
    assert_eq!(code, 0);
}

#[test]
fn test_root_persists_across_runs() {
    let cache = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let dump = scratch.path().join("anchor.pem");
    let script = format!("cat \"$NODE_EXTRA_CA_CERTS\" >> '{}'", dump.display());

    assert_eq!(orchestrator().run(&shell(&script), &config(cache.path())), 0);
    let first = std::fs::read_to_string(&dump).unwrap();
    std::fs::remove_file(&dump).unwrap();

    assert_eq!(orchestrator().run(&shell(&script), &config(cache.path())), 0);
    let second = std::fs::read_to_string(&dump).unwrap();

    assert!(first.contains("BEGIN CERTIFICATE"));
    assert_eq!(first, second);
}

#[test]
fn test_unusable_cache_dir_skips_launch() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("launched");
    let script = format!("touch '{}'", marker.display());

    let code = orchestrator().run(&shell(&script), &config(Path::new("/dev/null/cache")));
    assert_eq!(code, EXIT_CACHE_DIR_UNAVAILABLE);
    assert!(!marker.exists());
}

#[test]
fn test_missing_tool_is_launch_failure() {
    let cache = tempfile::tempdir().unwrap();
    let invocation = Invocation {
        tool: "proxywrap-no-such-tool".to_string(),
        ..Invocation::default()
    };
    let code = orchestrator().run(&invocation, &config(cache.path()));
    assert_eq!(code, EXIT_LAUNCH_FAILED);
}

#[test]
fn test_killed_tool_reports_abnormal_end() {
    let cache = tempfile::tempdir().unwrap();
    let code = orchestrator().run(&shell("kill -TERM $$"), &config(cache.path()));
    assert_eq!(code, EXIT_CHILD_ABNORMAL);
}

#[test]
fn test_tool_exit_code_in_signal_range_is_kept() {
    let cache = tempfile::tempdir().unwrap();
    let code = orchestrator().run(&shell("exit 143"), &config(cache.path()));
    assert_eq!(code, 143);
}

#[test]
fn test_curl_through_proxy() {
    let Ok(curl) = which::which("curl") else {
        eprintln!("curl not installed, skipping");
        return;
    };

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let origin = runtime.block_on(https_origin());

    let cache = tempfile::tempdir().unwrap();
    let output = cache.path().join("body");
    let script = format!(
        "'{}' -sS --fail --noproxy '' -o '{}' https://localhost:{}/",
        curl.display(),
        output.display(),
        origin.port()
    );

    let code = orchestrator().run(&shell(&script), &config(cache.path()));
    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), ORIGIN_BODY);
}
