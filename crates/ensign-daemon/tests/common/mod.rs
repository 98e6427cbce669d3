//! Test fixtures for device manager scenario tests.
//!
//! Provides an isolated manager over a fresh state with fake seed, boot
//! and store collaborators, plus a minimal canned-response HTTP server
//! standing in for the device service.

use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ensign_core::asserts::{
    Assertion, AssertionType, Database, DeviceKey, sign_without_authority,
};
use ensign_core::state::{
    BoxError, ChangeStatus, State, StateLock, TaskId, TaskStatus,
};
use ensign_daemon::device::{
    BootSupport, DeviceIdentity, DeviceManager, ManagerConfig, RepeatRequestSerial, SeedLoader,
    StoreClient, set_device,
};
use ensign_daemon::hooks::HookManager;
use ensign_daemon::snaps::{SnapInfo, SnapType, set_gadget_info};
use tempfile::TempDir;

pub const TEST_KEY_BITS: usize = 1024;

/// Seed loader that installs a model for (brand, model) and finishes
/// with a mark-seeded task.
pub struct TestSeed {
    pub brand: String,
    pub model: String,
    pub db: Arc<Mutex<Database>>,
    pub brand_key: DeviceKey,
}

impl SeedLoader for TestSeed {
    fn load(&self, st: &mut State) -> Result<Vec<Vec<TaskId>>, BoxError> {
        set_device(
            st,
            &DeviceIdentity {
                brand: self.brand.clone(),
                model: self.model.clone(),
                ..Default::default()
            },
        )?;
        self.db.lock().unwrap().add(model_assertion(
            &self.brand,
            &self.model,
            "pc",
            "pc-kernel",
            &self.brand_key,
        ))?;
        let mark_seeded = st.new_task("mark-seeded", "Mark system seeded");
        Ok(vec![vec![mark_seeded]])
    }
}

/// Seed loader with nothing to seed.
pub struct EmptySeed;

impl SeedLoader for EmptySeed {
    fn load(&self, _st: &mut State) -> Result<Vec<Vec<TaskId>>, BoxError> {
        Ok(Vec::new())
    }
}

/// Boot support that records its calls.
#[derive(Default)]
pub struct RecordingBoot {
    pub boot_ok_calls: AtomicU32,
    pub revision_update_calls: AtomicU32,
}

impl BootSupport for RecordingBoot {
    fn mark_boot_successful(&self) -> Result<(), BoxError> {
        self.boot_ok_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_boot_revisions(&self, _st: &mut State) -> Result<(), BoxError> {
        self.revision_update_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store client serving account-key assertions signed by the brand key,
/// or failing on demand.
pub struct TestStore {
    pub fail: AtomicBool,
    pub requests: Mutex<Vec<String>>,
    pub brand_key: DeviceKey,
}

impl TestStore {
    pub fn new(brand_key: DeviceKey) -> Self {
        Self {
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            brand_key,
        }
    }
}

impl StoreClient for TestStore {
    fn assertion(&self, typ: AssertionType, primary_key: &[&str]) -> Result<Assertion, BoxError> {
        self.requests
            .lock()
            .unwrap()
            .push(format!("{typ}/{}", primary_key.join("/")));
        if self.fail.load(Ordering::SeqCst) {
            return Err("store is unreachable".into());
        }
        let headers: BTreeMap<String, String> = [
            ("public-key-sha3-384".to_string(), primary_key[0].to_string()),
            ("account-id".to_string(), "generic".to_string()),
        ]
        .into();
        Ok(sign_without_authority(typ, headers, b"", &self.brand_key)?)
    }
}

fn string_headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Sign a model assertion naming the mandated gadget and kernel snaps.
pub fn model_assertion(
    brand: &str,
    model: &str,
    gadget: &str,
    kernel: &str,
    signer: &DeviceKey,
) -> Assertion {
    sign_without_authority(
        AssertionType::Model,
        string_headers(&[
            ("series", "16"),
            ("brand-id", brand),
            ("model", model),
            ("gadget", gadget),
            ("kernel", kernel),
        ]),
        b"",
        signer,
    )
    .unwrap()
}

/// Sign a serial assertion for the given device key.
pub fn serial_assertion(
    brand: &str,
    model: &str,
    serial: &str,
    device_key_pem: &str,
    device_key_id: &str,
    signer: &DeviceKey,
) -> Assertion {
    sign_without_authority(
        AssertionType::Serial,
        string_headers(&[
            ("brand-id", brand),
            ("model", model),
            ("serial", serial),
            ("device-key", device_key_pem.trim_end()),
            ("device-key-sha3-384", device_key_id),
        ]),
        b"",
        signer,
    )
    .unwrap()
}

/// One canned HTTP response.
pub struct CannedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl CannedResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn assertion(status: u16, assertion: &Assertion) -> Self {
        Self {
            status,
            content_type: ensign_core::asserts::MEDIA_TYPE,
            body: assertion.encode().into_bytes(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }
}

/// A request captured by the test server.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub body: Vec<u8>,
}

/// Minimal single-threaded HTTP server answering from a response queue.
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let responses: Arc<Mutex<VecDeque<CannedResponse>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let requests = Arc::clone(&requests);
            let responses = Arc::clone(&responses);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { break };
                    if let Some(request) = read_request(&stream) {
                        requests.lock().unwrap().push(request);
                        let response = responses
                            .lock()
                            .unwrap()
                            .pop_front()
                            .unwrap_or_else(|| CannedResponse::empty(500));
                        write_response(&stream, &response);
                    }
                }
            })
        };

        Self {
            addr,
            requests,
            responses,
            shutdown,
            handle: Some(handle),
        }
    }

    /// The base URL for the device-service path prefix, with a trailing
    /// slash so relative endpoint paths resolve under it.
    pub fn base_url(&self) -> String {
        format!("http://{}/svc/", self.addr)
    }

    pub fn push_response(&self, response: CannedResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count_for(&self, path_suffix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path.ends_with(path_suffix))
            .count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_request(stream: &TcpStream) -> Option<CapturedRequest> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut content_length = 0usize;
    let mut content_type = None;
    let mut user_agent = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.parse().unwrap_or(0),
            "content-type" => content_type = Some(value.to_string()),
            "user-agent" => user_agent = Some(value.to_string()),
            _ => {},
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).ok()?;
    }

    Some(CapturedRequest {
        method,
        path,
        content_type,
        user_agent,
        body,
    })
}

fn write_response(mut stream: &TcpStream, response: &CannedResponse) {
    let reason = match response.status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        400 => "Bad Request",
        _ => "Error",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason,
        response.content_type,
        response.body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&response.body);
    let _ = stream.flush();
}

/// Options for building a test manager.
pub struct FixtureOptions {
    /// Seed brand/model; `None` uses an empty seed loader.
    pub seed: Option<(String, String)>,
    /// Hooks the installed gadget declares; `None` installs no gadget.
    pub gadget_hooks: Option<Vec<String>>,
    pub on_classic: bool,
    pub repeat_request_serial: Option<RepeatRequestSerial>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            seed: Some(("canonical".to_string(), "pc".to_string())),
            gadget_hooks: Some(Vec::new()),
            on_classic: false,
            repeat_request_serial: None,
        }
    }
}

/// An isolated device manager with fake collaborators and a device
/// service stand-in.
pub struct Fixture {
    pub state: Arc<StateLock>,
    pub db: Arc<Mutex<Database>>,
    pub mgr: DeviceManager,
    pub boot: Arc<RecordingBoot>,
    pub store: Arc<TestStore>,
    pub server: TestServer,
    pub brand_key: DeviceKey,
    _tmp: TempDir,
}

impl Fixture {
    pub fn new(options: FixtureOptions) -> Self {
        let tmp = TempDir::new().unwrap();
        let state = Arc::new(StateLock::new(State::new()));
        let db = Arc::new(Mutex::new(Database::new()));
        let hook_mgr = Arc::new(HookManager::new());
        let boot = Arc::new(RecordingBoot::default());
        let brand_key = DeviceKey::generate(TEST_KEY_BITS).unwrap();
        let store = Arc::new(TestStore::new(brand_key.clone()));
        let server = TestServer::start();

        let mut config = ManagerConfig::new(tmp.path().join("device"));
        config.key_length = TEST_KEY_BITS;
        config.on_classic = options.on_classic;
        config.repeat_request_serial = options.repeat_request_serial;

        let seed_loader: Arc<dyn SeedLoader> = match &options.seed {
            Some((brand, model)) => Arc::new(TestSeed {
                brand: brand.clone(),
                model: model.clone(),
                db: Arc::clone(&db),
                brand_key: brand_key.clone(),
            }),
            None => Arc::new(EmptySeed),
        };

        if let Some(hooks) = &options.gadget_hooks {
            state.with(|st| {
                set_gadget_info(
                    st,
                    &SnapInfo {
                        name: "pc".to_string(),
                        snap_type: SnapType::Gadget,
                        snap_id: String::new(),
                        hooks: hooks.iter().cloned().collect(),
                    },
                )
            })
            .unwrap();
        }

        // Point the device service at the test server.
        state
            .with(|st| {
                st.set(
                    "config",
                    &serde_json::json!({
                        "pc": { "device-service.url": server.base_url() }
                    }),
                )
            })
            .unwrap();

        let mgr = DeviceManager::new(
            Arc::clone(&state),
            Arc::clone(&db),
            &hook_mgr,
            Arc::new(config),
            seed_loader,
            Arc::clone(&boot) as Arc<dyn BootSupport>,
            Arc::clone(&store) as Arc<dyn StoreClient>,
        )
        .unwrap();

        Self {
            state,
            db,
            mgr,
            boot,
            store,
            server,
            brand_key,
            _tmp: tmp,
        }
    }

    /// Run `cycles` ensure cycles, waiting out each one's tasks.
    pub fn settle(&mut self, cycles: usize) {
        for _ in 0..cycles {
            let _ = self.mgr.ensure();
            self.mgr.wait();
        }
    }

    /// Clear every task's retry holdoff so the next ensure re-dispatches
    /// immediately.
    pub fn clear_holdoffs(&self) {
        self.state.with(|st| {
            let ids: Vec<TaskId> = st.tasks().map(|t| t.id()).collect();
            for id in ids {
                if let Some(task) = st.task_mut(id) {
                    task.set_not_before(None);
                }
            }
        });
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.state
            .with(|st| ensign_daemon::device::device(st))
            .unwrap()
    }

    pub fn task_status(&self, kind: &str) -> Option<TaskStatus> {
        self.state.with(|st| {
            st.tasks()
                .find(|t| t.kind() == kind)
                .map(ensign_core::state::Task::status)
        })
    }

    pub fn task_log(&self, kind: &str) -> Vec<String> {
        self.state.with(|st| {
            st.tasks()
                .find(|t| t.kind() == kind)
                .map(|t| t.log().to_vec())
                .unwrap_or_default()
        })
    }

    pub fn change_status(&self, kind: &str) -> Option<ChangeStatus> {
        self.state.with(|st| {
            st.changes()
                .find(|c| c.kind() == kind)
                .map(|c| st.change_status(c))
        })
    }

    /// The device key generated by the manager, with its public PEM.
    pub fn device_key(&self) -> (String, String) {
        let key = self.mgr.device_key().unwrap();
        (key.id().to_string(), key.public_key_pem().unwrap())
    }

    /// Queue the standard request-id response.
    pub fn push_request_id(&self, request_id: &str) {
        self.server.push_response(CannedResponse::json(
            200,
            &format!(r#"{{"request-id": "{request_id}"}}"#),
        ));
    }

    /// Queue a serial response for the device's generated key.
    pub fn push_serial(&self, status: u16, serial: &str) {
        let (key_id, pem) = self.device_key();
        let assertion = serial_assertion("canonical", "pc", serial, &pem, &key_id, &self.brand_key);
        self.server
            .push_response(CannedResponse::assertion(status, &assertion));
    }
}
