#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the attachment lifecycle.
//!
//! The contract service is a scripted fake transport and APT is replaced by a
//! recording repository configurator, so every test runs against a temp
//! directory only.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use elxr_pro_core::apt::{AptPaths, RepoConfigurator, RepoSpec};
use elxr_pro_core::contract::{HttpResponse, HttpTransport, MachineInfo, TransportError};
use elxr_pro_core::files::user_config::{UserConfig, UserConfigFile};
use elxr_pro_core::lock::{HOLDER_JOIN, LockOptions, RetryLock};
use elxr_pro_core::secrets::REDACTED;
use elxr_pro_core::system::MachineIdCache;
use elxr_pro_core::tracing_init::RedactingMakeWriter;
use elxr_pro_core::{Attachment, Client, Command, Config, Error, Outcome, SecretRegistry};

const LOCAL_MACHINE_ID: &str = "local-machine-id";

type Reply = Result<HttpResponse, TransportError>;

#[derive(Default)]
struct ServerState {
    replies: VecDeque<Reply>,
    requests: Vec<(String, serde_json::Value, Option<String>)>,
    delay: Duration,
}

/// Contract service double: replays scripted replies, records requests.
#[derive(Clone, Default)]
struct FakeServer(Arc<Mutex<ServerState>>);

impl FakeServer {
    fn replying(replies: impl IntoIterator<Item = Reply>) -> Self {
        let server = Self::default();
        server.0.lock().unwrap().replies = replies.into_iter().collect();
        server
    }

    fn with_delay(self, delay: Duration) -> Self {
        self.0.lock().unwrap().delay = delay;
        self
    }

    fn requests(&self) -> Vec<(String, serde_json::Value, Option<String>)> {
        self.0.lock().unwrap().requests.clone()
    }
}

impl HttpTransport for FakeServer {
    async fn post_json(&self, url: &str, body: String, bearer: Option<&str>) -> Reply {
        let (reply, delay) = {
            let mut state = self.0.lock().unwrap();
            state.requests.push((
                url.to_string(),
                serde_json::from_str(&body).unwrap(),
                bearer.map(str::to_string),
            ));
            let reply = state
                .replies
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("connection refused".into())));
            (reply, state.delay)
        };
        tokio::time::sleep(delay).await;
        reply
    }
}

#[derive(Default)]
struct RepoLog {
    active: Vec<String>,
    added: Vec<String>,
    removed: Vec<String>,
    failing: HashSet<String>,
}

/// Repository configurator double.
#[derive(Clone, Default)]
struct RecordingRepos(Arc<Mutex<RepoLog>>);

impl RecordingRepos {
    fn failing_on(name: &str) -> Self {
        let repos = Self::default();
        repos.0.lock().unwrap().failing.insert(name.to_string());
        repos
    }

    fn active(&self) -> Vec<String> {
        self.0.lock().unwrap().active.clone()
    }

    fn added(&self) -> Vec<String> {
        self.0.lock().unwrap().added.clone()
    }

    fn removed(&self) -> Vec<String> {
        self.0.lock().unwrap().removed.clone()
    }
}

impl RepoConfigurator for RecordingRepos {
    fn add(&self, repo: &RepoSpec) -> elxr_pro_core::Result<()> {
        let mut log = self.0.lock().unwrap();
        if log.failing.contains(&repo.name) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        log.added.push(repo.name.clone());
        log.active.push(repo.name.clone());
        Ok(())
    }

    fn remove(&self, name: &str, _uri: &str) -> elxr_pro_core::Result<()> {
        let mut log = self.0.lock().unwrap();
        log.removed.push(name.to_string());
        log.active.retain(|n| n != name);
        Ok(())
    }
}

fn ok(body: serde_json::Value) -> Reply {
    Ok(HttpResponse::new(200, body.to_string()))
}

fn join_reply(uris: &[(&str, &str)]) -> Reply {
    let resources: Vec<serde_json::Value> = uris
        .iter()
        .map(|(kind, uri)| {
            serde_json::json!({
                "type": kind,
                "uri": uri,
                "login": "repo-user",
                "password": "repo-password",
                "suites": ["aria"],
                "components": ["main"],
            })
        })
        .collect();
    ok(serde_json::json!({
        "machineId": "server-machine-id",
        "productToken": "server-product-token",
        "resources": resources,
    }))
}

fn leave_reply() -> Reply {
    ok(serde_json::json!({ "message": "Leave successful" }))
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: Config,
    secrets: Arc<SecretRegistry>,
    machine_id_file: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let machine_id_file = dir.path().join("etc-machine-id");
        std::fs::write(&machine_id_file, format!("{LOCAL_MACHINE_ID}\n")).unwrap();
        let config = Config {
            contract_url: "https://contracts.test".into(),
            apt: AptPaths::rooted_at(&dir.path().join("apt")),
            ..Config::with_data_dir(dir.path().join("data"))
        };
        Self {
            _dir: dir,
            config,
            secrets: Arc::new(SecretRegistry::new()),
            machine_id_file,
        }
    }

    fn client(
        &self,
        server: &FakeServer,
        repos: &RecordingRepos,
    ) -> Client<FakeServer, RecordingRepos> {
        Client::new(
            self.config.clone(),
            server.clone(),
            repos.clone(),
            Arc::clone(&self.secrets),
        )
        .with_machine_info(MachineInfo::default())
        .with_machine_id_cache(MachineIdCache::with_sources(vec![self.machine_id_file.clone()]))
        .with_retry_sleeps(vec![Duration::ZERO; 3])
        .with_lock_options(LockOptions {
            sleep: Duration::from_millis(1),
            max_retries: 2,
        })
    }

    fn data(&self, rel: &str) -> std::path::PathBuf {
        self.config.data_dir.join(rel)
    }

    fn assert_no_state(&self) {
        for rel in [
            "machine-token.json",
            "private/machine-token.json",
            "attachment.json",
            "private/machine-id",
        ] {
            assert!(!self.data(rel).exists(), "{rel} should not exist");
        }
    }

    /// Join with one entitlement so leave tests start attached.
    async fn attach(&self, repos: &RecordingRepos) {
        let server = FakeServer::replying([join_reply(&[("elxr-pro", "https://repo.test/pro")])]);
        self.client(&server, repos)
            .process(Command::Join {
                token: "user-token".into(),
            })
            .await
            .unwrap();
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

/// In-memory log sink shared with a subscriber.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

#[tokio::test]
async fn join_configures_entitlements_and_persists_state() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    let server = FakeServer::replying([join_reply(&[
        ("elxr-pro", "https://repo.test/pro"),
        ("elxr-fips", "https://repo.test/fips"),
    ])]);
    let mut client = fx.client(&server, &repos);

    let outcome = client
        .process(Command::Join {
            token: "user-token".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Joined {
            machine_id: "server-machine-id".into(),
            entitlements: vec!["elxr-pro".into(), "elxr-fips".into()],
        }
    );
    assert_eq!(repos.active(), vec!["elxr-pro", "elxr-fips"]);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "https://contracts.test/api/v1/actions/join");
    assert_eq!(requests[0].1["machineId"], LOCAL_MACHINE_ID);
    assert_eq!(requests[0].1["productToken"], "user-token");
    assert_eq!(requests[0].2.as_deref(), Some("user-token"));

    // The id assigned by the service replaces the local one.
    assert_eq!(read(&fx.data("private/machine-id")), "server-machine-id");
    assert!(read(&fx.data("attachment.json")).contains("attached_at"));
    assert!(matches!(client.attachment().unwrap(), Attachment::Attached(_)));

    // Public projection carries no secrets.
    let public = read(&fx.data("machine-token.json"));
    assert!(!public.contains("server-product-token"));
    assert!(!public.contains("repo-password"));
    assert!(read(&fx.data("private/machine-token.json")).contains("server-product-token"));

    // Lock is released.
    assert!(!fx.config.lock_path().exists());
}

#[tokio::test]
async fn join_registers_tokens_as_secrets() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    fx.attach(&repos).await;
    let line = "sent user-token, got server-product-token";
    assert_eq!(
        fx.secrets.redact(line),
        format!("sent {REDACTED}, got {REDACTED}")
    );
}

#[tokio::test]
async fn join_log_file_never_contains_tokens_or_repository_credentials() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    let server = FakeServer::replying([join_reply(&[("elxr-pro", "https://repo.test/pro")])]);
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(RedactingMakeWriter::new(capture.clone(), Arc::clone(&fx.secrets)))
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    // Logged before anything is registered, as the binary does at startup.
    tracing::debug!(
        argv = ?vec!["elxr-pro", "join", "C1SECRETJOINTOKEN"],
        "executed with arguments"
    );
    fx.client(&server, &repos)
        .process(Command::Join {
            token: "C1SECRETJOINTOKEN".into(),
        })
        .await
        .unwrap();

    let logged = capture.contents();
    assert!(logged.contains("executed with arguments"));
    assert!(logged.contains("contract response"));
    for secret in ["C1SECRETJOINTOKEN", "server-product-token", "repo-password"] {
        assert!(!logged.contains(secret), "{secret} leaked to the log");
    }
}

#[tokio::test]
async fn join_rejects_entitlement_names_outside_sources_dir() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    let server = FakeServer::replying([join_reply(&[
        ("elxr-pro", "https://repo.test/pro"),
        ("../escape", "https://repo.test/escape"),
    ])]);

    let err = fx
        .client(&server, &repos)
        .process(Command::Join {
            token: "user-token".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid-entitlement-name");
    assert!(repos.added().is_empty());
    fx.assert_no_state();
}

#[tokio::test]
async fn join_when_attached_is_rejected_without_contacting_service() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    fx.attach(&repos).await;

    let server = FakeServer::default();
    let err = fx
        .client(&server, &repos)
        .process(Command::Join {
            token: "another".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "already-attached");
    assert_eq!(err.exit_code(), 2);
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn join_rolls_back_when_a_repository_fails() {
    let fx = Fixture::new();
    let repos = RecordingRepos::failing_on("elxr-fips");
    let server = FakeServer::replying([join_reply(&[
        ("elxr-pro", "https://repo.test/pro"),
        ("elxr-fips", "https://repo.test/fips"),
    ])]);
    let mut client = fx.client(&server, &repos);

    let err = client
        .process(Command::Join {
            token: "user-token".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "io-error");
    assert_eq!(repos.added(), vec!["elxr-pro"]);
    assert_eq!(repos.removed(), vec!["elxr-pro"]);
    assert!(repos.active().is_empty());
    fx.assert_no_state();
    assert_eq!(client.attachment().unwrap(), Attachment::Unattached);
}

#[tokio::test]
async fn join_rejects_non_https_entitlement_before_configuring_any() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    let server = FakeServer::replying([join_reply(&[
        ("elxr-pro", "https://repo.test/pro"),
        ("elxr-legacy", "http://repo.test/legacy"),
    ])]);

    let err = fx
        .client(&server, &repos)
        .process(Command::Join {
            token: "user-token".into(),
        })
        .await
        .unwrap_err();
    match err {
        Error::InvalidHttpsUrl { url } => assert_eq!(url, "http://repo.test/legacy"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(repos.added().is_empty());
    fx.assert_no_state();
}

#[tokio::test]
async fn join_api_error_leaves_machine_unattached() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    let server = FakeServer::replying([Ok(HttpResponse::new(403, "invalid token"))]);

    let err = fx
        .client(&server, &repos)
        .process(Command::Join {
            token: "bad".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "contract-api-error");
    assert!(err.to_string().contains("403"));
    fx.assert_no_state();
}

#[tokio::test]
async fn leave_removes_repositories_and_state() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    fx.attach(&repos).await;

    let server = FakeServer::replying([leave_reply()]);
    let mut client = fx.client(&server, &repos);
    let outcome = client.process(Command::Leave { force: false }).await.unwrap();
    assert_eq!(outcome, Outcome::Left { forced: false });

    let requests = server.requests();
    assert_eq!(requests[0].0, "https://contracts.test/api/v1/actions/leave");
    assert_eq!(requests[0].1["machineId"], "server-machine-id");
    assert_eq!(requests[0].2.as_deref(), Some("server-product-token"));

    assert!(repos.active().is_empty());
    assert_eq!(repos.removed(), vec!["elxr-pro"]);
    fx.assert_no_state();
    assert_eq!(client.attachment().unwrap(), Attachment::Unattached);
}

#[tokio::test]
async fn leave_drops_service_proxy_hosts() {
    let fx = Fixture::new();
    let mut user_config = UserConfig::default();
    user_config
        .assign("ea_apt_https_proxy", Some("http://squid:3128".into()))
        .unwrap();
    UserConfigFile::new(&fx.config.data_dir).write(&user_config).unwrap();

    let repos = RecordingRepos::default();
    fx.attach(&repos).await;
    let proxy_conf = &fx.config.apt.proxy_conf;
    assert!(read(proxy_conf).contains("Acquire::https::Proxy::repo.test \"http://squid:3128\";"));

    let server = FakeServer::replying([leave_reply()]);
    fx.client(&server, &repos)
        .process(Command::Leave { force: false })
        .await
        .unwrap();
    assert!(!read(proxy_conf).contains("repo.test"));
}

#[tokio::test]
async fn leave_after_leave_is_unattached_error() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    fx.attach(&repos).await;

    let server = FakeServer::replying([leave_reply(), leave_reply()]);
    let mut client = fx.client(&server, &repos);
    client.process(Command::Leave { force: false }).await.unwrap();

    for force in [false, true] {
        let err = client.process(Command::Leave { force }).await.unwrap_err();
        assert!(matches!(err, Error::Unattached));
    }
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn unconfirmed_leave_keeps_local_state() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    fx.attach(&repos).await;

    let server = FakeServer::replying([ok(serde_json::json!({ "message": "pending" }))]);
    let outcome = fx
        .client(&server, &repos)
        .process(Command::Leave { force: false })
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::LeaveNotConfirmed {
            message: Some("pending".into())
        }
    );
    assert_eq!(repos.active(), vec!["elxr-pro"]);
    assert!(fx.data("private/machine-token.json").exists());
}

#[tokio::test]
async fn forced_leave_ignores_unreachable_service() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    fx.attach(&repos).await;

    // Every call would fail to connect.
    let server = FakeServer::default();
    let mut client = fx.client(&server, &repos);

    let err = client.process(Command::Leave { force: false }).await.unwrap_err();
    assert_eq!(err.code(), "connectivity-error");
    assert!(fx.data("private/machine-token.json").exists());

    let outcome = client.process(Command::Leave { force: true }).await.unwrap();
    assert_eq!(outcome, Outcome::Left { forced: true });
    assert_eq!(server.requests().len(), 1);
    assert!(repos.active().is_empty());
    fx.assert_no_state();
}

#[tokio::test]
async fn unauthenticated_test_accepts_401() {
    let fx = Fixture::new();
    let server = FakeServer::replying([Ok(HttpResponse::new(401, "Unauthorized"))]);
    let outcome = fx
        .client(&server, &RecordingRepos::default())
        .process(Command::Test { token: None })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Tested { authenticated: false });

    let requests = server.requests();
    assert_eq!(requests[0].0, "https://contracts.test/api/v1/actions/test");
    assert!(requests[0].1.get("productToken").is_none());
    assert!(requests[0].2.is_none());
    assert!(!fx.config.lock_path().exists());
}

#[tokio::test]
async fn authenticated_test_checks_machine_id() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();

    let server = FakeServer::replying([ok(serde_json::json!({ "machineId": LOCAL_MACHINE_ID }))]);
    let outcome = fx
        .client(&server, &repos)
        .process(Command::Test {
            token: Some("user-token".into()),
        })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Tested { authenticated: true });

    let server = FakeServer::replying([ok(serde_json::json!({ "machineId": "someone-else" }))]);
    let err = fx
        .client(&server, &repos)
        .process(Command::Test {
            token: Some("user-token".into()),
        })
        .await
        .unwrap_err();
    match err {
        Error::MachineIdUnmatch {
            request_machine_id,
            response_machine_id,
        } => {
            assert_eq!(request_machine_id, LOCAL_MACHINE_ID);
            assert_eq!(response_machine_id, "someone-else");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn authenticated_test_rejects_401() {
    let fx = Fixture::new();
    let server = FakeServer::replying([Ok(HttpResponse::new(401, "Unauthorized"))]);
    let err = fx
        .client(&server, &RecordingRepos::default())
        .process(Command::Test {
            token: Some("user-token".into()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "contract-api-error");
}

#[tokio::test]
async fn held_lock_blocks_join() {
    let fx = Fixture::new();
    let _held = RetryLock::new(fx.config.lock_path(), HOLDER_JOIN)
        .acquire()
        .await
        .unwrap();

    let server = FakeServer::default();
    let err = fx
        .client(&server, &RecordingRepos::default())
        .process(Command::Join {
            token: "user-token".into(),
        })
        .await
        .unwrap_err();
    match err {
        Error::LockHeld {
            lock_holder, pid, ..
        } => {
            assert_eq!(lock_holder, HOLDER_JOIN);
            assert_eq!(pid, i32::try_from(std::process::id()).unwrap());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn concurrent_joins_second_sees_lock_held() {
    let fx = Fixture::new();
    let repos = RecordingRepos::default();
    let slow = FakeServer::replying([join_reply(&[("elxr-pro", "https://repo.test/pro")])])
        .with_delay(Duration::from_millis(200));
    let idle = FakeServer::default();
    let mut first = fx.client(&slow, &repos);
    let mut second = fx.client(&idle, &repos);

    let (a, b) = tokio::join!(
        first.process(Command::Join {
            token: "user-token".into(),
        }),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            second
                .process(Command::Join {
                    token: "user-token".into(),
                })
                .await
        }
    );

    assert!(matches!(a.unwrap(), Outcome::Joined { .. }));
    match b.unwrap_err() {
        Error::LockHeld {
            lock_request,
            lock_holder,
            pid,
        } => {
            assert_eq!(lock_request, HOLDER_JOIN);
            assert_eq!(lock_holder, HOLDER_JOIN);
            assert_eq!(pid, i32::try_from(std::process::id()).unwrap());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(idle.requests().is_empty());
}
