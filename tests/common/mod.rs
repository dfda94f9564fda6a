// Jackson Coxson
// A scripted device reachable through an in-memory provider

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use fruitstrap::{
    Idevice, IdeviceError, Session,
    afc::{
        MAGIC,
        opcode::AfcOpcode,
        packet::{AfcPacket, AfcPacketHeader},
    },
    cancel::CancelSource,
    config::FruitstrapConfig,
    debug_proxy::{RspBuffer, hex_decode, hex_encode},
    pairing_file::PairingFile,
    provider::IdeviceProvider,
};
use plist::{Dictionary, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const LOCKDOWN_PORT: u16 = 62078;
pub const MOUNTER_PORT: u16 = 49001;
pub const INSTPROXY_PORT: u16 = 49002;
pub const AFC_PORT: u16 = 49003;
pub const DEBUGSERVER_PORT: u16 = 49004;
pub const HOUSE_ARREST_PORT: u16 = 49005;
pub const LEGACY_DEBUGSERVER_PORT: u16 = 49006;

pub const UDID: &str = "00008030-001A2B3C4D5E6F70";

/// Everything the simulated device knows and how it should misbehave
#[derive(Debug, Default)]
pub struct DeviceState {
    /// Raw frame body answered to `QueryType` instead of a proper reply
    pub query_type_reply: Option<Vec<u8>>,
    /// Error string answered to `StartSession`
    pub start_session_error: Option<String>,
    /// Services lockdown refuses to start
    pub disabled_services: BTreeSet<String>,
    pub value_queries: usize,
    /// Lockdown stops answering `GetValue`
    pub lockdown_hung: bool,

    pub mounted_signature: Option<Vec<u8>>,
    pub uploads: usize,
    pub mount_error: Option<String>,
    pub mount_stall: bool,

    /// bundle id -> (path, executable)
    pub apps: BTreeMap<String, (String, String)>,
    /// `(command, package path)` of every install or upgrade
    pub installs: Vec<(String, String)>,
    pub install_percents: Vec<u64>,
    pub install_error: Option<(String, String)>,

    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    /// Drops the AFC connection after this many writes, once
    pub drop_afc_after_writes: Option<usize>,
    pub afc_writes: usize,
    pub afc_write_delay: Option<Duration>,

    /// Packets sent after `vCont;c`
    pub debug_script: Vec<String>,
    pub launch_error: Option<String>,
    pub launched_argv: Vec<String>,
    pub environment: Vec<String>,
    pub aslr_disabled: bool,
    pub killed: bool,
}

pub type SharedState = Arc<Mutex<DeviceState>>;

#[derive(Debug, Clone)]
pub struct MockProvider {
    pub state: SharedState,
    pub pairing: Option<PairingFile>,
}

pub fn pairing_file() -> PairingFile {
    PairingFile {
        device_certificate: Vec::new(),
        host_private_key: Vec::new(),
        host_certificate: Vec::new(),
        root_certificate: Vec::new(),
        system_buid: "30B6A9D6-5C2E-4F4B-8C4A-1E2B3C4D5E6F".into(),
        host_id: "7F1E0C3A-2B4D-4E6F-8A9B-0C1D2E3F4A5B".into(),
        escrow_bag: Vec::new(),
        wifi_mac_address: None,
        udid: Some(UDID.into()),
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
            pairing: Some(pairing_file()),
        }
    }

    pub fn with_state(f: impl FnOnce(&mut DeviceState)) -> Self {
        let provider = Self::new();
        f(&mut provider.state.lock().unwrap());
        provider
    }
}

impl IdeviceProvider for MockProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send>> {
        let state = self.state.clone();
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(1 << 20);
            tokio::spawn(serve(port, server, state));
            Ok(Idevice::new(Box::new(client), format!("mock:{port}")))
        })
    }

    fn label(&self) -> &str {
        "mock"
    }

    fn udid(&self) -> Option<&str> {
        Some(UDID)
    }

    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, IdeviceError>> + Send>> {
        let pairing = self.pairing.clone();
        Box::pin(async move { pairing.ok_or(IdeviceError::PairingRequired) })
    }
}

pub fn test_config() -> FruitstrapConfig {
    FruitstrapConfig {
        io_timeout: Duration::from_secs(5),
        mount_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

pub async fn session(provider: &MockProvider) -> Session {
    Session::establish(
        Box::new(provider.clone()),
        None,
        test_config(),
        CancelSource::new(),
    )
    .await
    .expect("handshake with the mock device")
}

/// Writes an app bundle below `root` with one executable of `executable_len` bytes
pub fn write_bundle(root: &std::path::Path, bundle_id: &str, executable_len: usize) -> std::path::PathBuf {
    let app = root.join("Example.app");
    std::fs::create_dir_all(app.join("Base.lproj")).unwrap();
    let info = plist_macro::plist!({
        "CFBundleIdentifier": bundle_id,
        "CFBundleExecutable": "Example",
    });
    info.to_file_xml(app.join("Info.plist")).unwrap();
    let executable = (0..executable_len).map(|i| (i % 253) as u8).collect::<Vec<_>>();
    std::fs::write(app.join("Example"), executable).unwrap();
    std::fs::write(app.join("Base.lproj/Main.strings"), b"\"hello\" = \"bonjour\";").unwrap();
    app
}

async fn serve(port: u16, stream: DuplexStream, state: SharedState) {
    match port {
        LOCKDOWN_PORT => lockdown(stream, state).await,
        MOUNTER_PORT => mounter(stream, state).await,
        INSTPROXY_PORT => instproxy(stream, state).await,
        AFC_PORT => afc(stream, state, String::new()).await,
        HOUSE_ARREST_PORT => house_arrest(stream, state).await,
        DEBUGSERVER_PORT | LEGACY_DEBUGSERVER_PORT => debugserver(stream, state).await,
        _ => {}
    }
}

async fn read_plist(stream: &mut DuplexStream) -> Option<Dictionary> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.ok()?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut body).await.ok()?;
    Value::from_reader(std::io::Cursor::new(body))
        .ok()?
        .into_dictionary()
}

async fn write_frame(stream: &mut DuplexStream, body: &[u8]) {
    let _ = stream
        .write_all(&fruitstrap::frame::encode(body).unwrap())
        .await;
}

async fn write_plist(stream: &mut DuplexStream, value: Value) {
    let mut body = Vec::new();
    value.to_writer_xml(&mut body).unwrap();
    write_frame(stream, &body).await;
}

fn string<'a>(d: &'a Dictionary, key: &str) -> &'a str {
    d.get(key).and_then(|v| v.as_string()).unwrap_or_default()
}

async fn lockdown(mut stream: DuplexStream, state: SharedState) {
    while let Some(req) = read_plist(&mut stream).await {
        let request = string(&req, "Request").to_string();
        let reply = match request.as_str() {
            "QueryType" => {
                let raw = state.lock().unwrap().query_type_reply.clone();
                if let Some(raw) = raw {
                    write_frame(&mut stream, &raw).await;
                    continue;
                }
                plist_macro::plist!({
                    "Request": "QueryType",
                    "Type": "com.apple.mobile.lockdown",
                })
            }
            "StartSession" => match state.lock().unwrap().start_session_error.clone() {
                Some(e) => plist_macro::plist!({ "Request": "StartSession", "Error": e }),
                None => plist_macro::plist!({
                    "Request": "StartSession",
                    "SessionID": "5A8B2C1D-0000-4000-8000-123456789ABC",
                    "EnableSessionSSL": false,
                }),
            },
            "GetValue" => {
                let mut state = state.lock().unwrap();
                if state.lockdown_hung {
                    continue;
                }
                state.value_queries += 1;
                drop(state);
                plist_macro::plist!({
                    "Request": "GetValue",
                    "Value": {
                        "UniqueDeviceID": UDID,
                        "ProductVersion": "12.4.1",
                        "BuildVersion": "16G102",
                        "ProductType": "iPhone11,2",
                        "DeviceName": "Test iPhone",
                    },
                })
            }
            "StartService" => {
                let service = string(&req, "Service").to_string();
                let disabled = state.lock().unwrap().disabled_services.contains(&service);
                let port = match service.as_str() {
                    "com.apple.mobile.mobile_image_mounter" => MOUNTER_PORT,
                    "com.apple.mobile.installation_proxy" => INSTPROXY_PORT,
                    "com.apple.afc" => AFC_PORT,
                    "com.apple.mobile.house_arrest" => HOUSE_ARREST_PORT,
                    "com.apple.debugserver.DVTSecureSocketProxy" => DEBUGSERVER_PORT,
                    "com.apple.debugserver" => LEGACY_DEBUGSERVER_PORT,
                    _ => 0,
                };
                if disabled || port == 0 {
                    plist_macro::plist!({ "Request": "StartService", "Error": "InvalidService" })
                } else {
                    let port = u64::from(port);
                    plist_macro::plist!({
                        "Request": "StartService",
                        "Service": service,
                        "Port": port,
                    })
                }
            }
            "StopSession" => plist_macro::plist!({ "Request": "StopSession" }),
            other => plist_macro::plist!({ "Request": other, "Error": "InvalidRequest" }),
        };
        write_plist(&mut stream, reply).await;
    }
}

async fn mounter(mut stream: DuplexStream, state: SharedState) {
    while let Some(req) = read_plist(&mut stream).await {
        let reply = match string(&req, "Command") {
            "LookupImage" => match state.lock().unwrap().mounted_signature.clone() {
                Some(sig) => plist_macro::plist!({
                    "ImageSignature": [Value::Data(sig)],
                    "Status": "Complete",
                }),
                None => plist_macro::plist!({ "Status": "Complete" }),
            },
            "ReceiveBytes" => {
                let size = req
                    .get("ImageSize")
                    .and_then(|v| v.as_unsigned_integer())
                    .unwrap_or_default() as usize;
                write_plist(&mut stream, plist_macro::plist!({ "Status": "ReceiveBytesAck" })).await;
                let mut image = vec![0u8; size];
                if stream.read_exact(&mut image).await.is_err() {
                    return;
                }
                state.lock().unwrap().uploads += 1;
                plist_macro::plist!({ "Status": "Complete" })
            }
            "MountImage" => {
                let (error, stall) = {
                    let s = state.lock().unwrap();
                    (s.mount_error.clone(), s.mount_stall)
                };
                if stall {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                }
                match error {
                    Some(e) => plist_macro::plist!({
                        "Error": "ImageMountFailed",
                        "DetailedError": e,
                    }),
                    None => {
                        let sig = req
                            .get("ImageSignature")
                            .and_then(|v| v.as_data())
                            .map(|d| d.to_vec());
                        state.lock().unwrap().mounted_signature = sig;
                        plist_macro::plist!({ "Status": "Complete" })
                    }
                }
            }
            "CopyDevices" => {
                let entries = match state.lock().unwrap().mounted_signature.clone() {
                    Some(sig) => vec![plist_macro::plist!({
                        "DiskImageType": "Developer",
                        "MountPath": "/Developer",
                        "ImageSignature": Value::Data(sig),
                    })],
                    None => Vec::new(),
                };
                plist_macro::plist!({ "EntryList": entries, "Status": "Complete" })
            }
            "UnmountImage" => {
                state.lock().unwrap().mounted_signature = None;
                plist_macro::plist!({ "Status": "Complete" })
            }
            "Hangup" => return,
            _ => plist_macro::plist!({ "Error": "UnknownCommand" }),
        };
        write_plist(&mut stream, reply).await;
    }
}

fn bundle_id_of_staged(state: &DeviceState, package_path: &str) -> Option<String> {
    let info = state.files.get(&format!("{package_path}/Info.plist"))?;
    let info: Value = plist::from_bytes(info).ok()?;
    info.as_dictionary()?
        .get("CFBundleIdentifier")?
        .as_string()
        .map(String::from)
}

async fn instproxy(mut stream: DuplexStream, state: SharedState) {
    while let Some(req) = read_plist(&mut stream).await {
        match string(&req, "Command") {
            "Lookup" => {
                let wanted: Option<Vec<String>> = req
                    .get("ClientOptions")
                    .and_then(|o| o.as_dictionary())
                    .and_then(|o| o.get("BundleIDs"))
                    .and_then(|ids| ids.as_array())
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|i| i.as_string().map(String::from))
                            .collect()
                    });
                let mut result = Dictionary::new();
                for (id, (path, exe)) in state.lock().unwrap().apps.iter() {
                    if wanted.as_ref().is_some_and(|w| !w.contains(id)) {
                        continue;
                    }
                    result.insert(
                        id.clone(),
                        plist_macro::plist!({
                            "CFBundleIdentifier": id.as_str(),
                            "Path": path.as_str(),
                            "CFBundleExecutable": exe.as_str(),
                        }),
                    );
                }
                write_plist(
                    &mut stream,
                    plist_macro::plist!({
                        "LookupResult": Value::Dictionary(result),
                        "Status": "Complete",
                    }),
                )
                .await;
            }
            command @ ("Install" | "Upgrade") => {
                let package = string(&req, "PackagePath").to_string();
                let (percents, error, bundle_id) = {
                    let mut s = state.lock().unwrap();
                    s.installs.push((command.to_string(), package.clone()));
                    (
                        s.install_percents.clone(),
                        s.install_error.clone(),
                        bundle_id_of_staged(&s, &package),
                    )
                };
                for p in percents {
                    write_plist(
                        &mut stream,
                        plist_macro::plist!({ "PercentComplete": p, "Status": "InstallingApplication" }),
                    )
                    .await;
                }
                if let Some((error, description)) = error {
                    write_plist(
                        &mut stream,
                        plist_macro::plist!({ "Error": error, "ErrorDescription": description }),
                    )
                    .await;
                    continue;
                }
                if let Some(id) = bundle_id {
                    let name = package.rsplit('/').next().unwrap_or_default().to_string();
                    state.lock().unwrap().apps.insert(
                        id,
                        (
                            format!("/private/var/containers/Bundle/Application/0A1B/{name}"),
                            "Example".into(),
                        ),
                    );
                }
                write_plist(&mut stream, plist_macro::plist!({ "Status": "Complete" })).await;
            }
            "Uninstall" => {
                let id = string(&req, "ApplicationIdentifier").to_string();
                state.lock().unwrap().apps.remove(&id);
                write_plist(
                    &mut stream,
                    plist_macro::plist!({ "PercentComplete": 50u64, "Status": "RemovingApplication" }),
                )
                .await;
                write_plist(&mut stream, plist_macro::plist!({ "Status": "Complete" })).await;
            }
            _ => {
                write_plist(&mut stream, plist_macro::plist!({ "Error": "UnknownCommand" })).await;
            }
        }
    }
}

async fn read_afc_packet(stream: &mut DuplexStream) -> Option<AfcPacket> {
    let mut header = [0u8; AfcPacketHeader::LEN as usize];
    stream.read_exact(&mut header).await.ok()?;
    let header = AfcPacketHeader::parse(&header).ok()?;
    let mut header_payload = vec![0u8; (header.header_payload_len - AfcPacketHeader::LEN) as usize];
    stream.read_exact(&mut header_payload).await.ok()?;
    let mut payload = vec![0u8; (header.entire_len - header.header_payload_len) as usize];
    stream.read_exact(&mut payload).await.ok()?;
    Some(AfcPacket {
        header,
        header_payload,
        payload,
    })
}

fn normalize(root: &str, path: &[u8]) -> String {
    let path = String::from_utf8_lossy(path);
    let path = path.trim_end_matches('\0').trim_matches('/');
    let path = if path == "." { "" } else { path };
    match (root.is_empty(), path.is_empty()) {
        (true, _) => path.to_string(),
        (false, true) => root.to_string(),
        (false, false) => format!("{root}/{path}"),
    }
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or_default()
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

async fn afc_reply(stream: &mut DuplexStream, op: AfcOpcode, num: u64, header_payload: Vec<u8>, payload: Vec<u8>) {
    let packet = AfcPacket::new(op, num, header_payload, payload);
    assert_eq!(packet.header.magic, MAGIC);
    let _ = stream.write_all(&packet.serialize()).await;
}

async fn afc_status(stream: &mut DuplexStream, num: u64, code: u64) {
    afc_reply(stream, AfcOpcode::Status, num, code.to_le_bytes().to_vec(), Vec::new()).await;
}

const AFC_OBJECT_NOT_FOUND: u64 = 8;

async fn afc(mut stream: DuplexStream, state: SharedState, root: String) {
    // fd -> (path, read cursor)
    let mut open: HashMap<u64, (String, usize)> = HashMap::new();
    let mut next_fd = 3u64;

    while let Some(req) = read_afc_packet(&mut stream).await {
        let num = req.header.packet_num;
        match req.header.operation {
            AfcOpcode::ReadDir => {
                let path = normalize(&root, &req.header_payload);
                let listing = {
                    let s = state.lock().unwrap();
                    if !path.is_empty() && path != root && !s.dirs.contains(&path) {
                        None
                    } else {
                        let mut names = vec![".".to_string(), "..".to_string()];
                        for child in s.dirs.iter().chain(s.files.keys()) {
                            if parent(child) == path && child != &path {
                                names.push(child.rsplit('/').next().unwrap_or_default().to_string());
                            }
                        }
                        Some(names)
                    }
                };
                match listing {
                    Some(names) => {
                        let mut payload = Vec::new();
                        for n in names {
                            payload.extend(n.as_bytes());
                            payload.push(0);
                        }
                        afc_reply(&mut stream, AfcOpcode::Data, num, Vec::new(), payload).await;
                    }
                    None => afc_status(&mut stream, num, AFC_OBJECT_NOT_FOUND).await,
                }
            }
            AfcOpcode::MakeDir => {
                let path = normalize(&root, &req.header_payload);
                state.lock().unwrap().dirs.insert(path);
                afc_status(&mut stream, num, 0).await;
            }
            AfcOpcode::GetFileInfo => {
                let path = normalize(&root, &req.header_payload);
                let info = {
                    let s = state.lock().unwrap();
                    if s.dirs.contains(&path) {
                        Some((0, "S_IFDIR"))
                    } else {
                        s.files.get(&path).map(|f| (f.len(), "S_IFREG"))
                    }
                };
                match info {
                    Some((size, kind)) => {
                        let payload = format!("st_size\0{size}\0st_ifmt\0{kind}\0st_nlink\x001\0");
                        afc_reply(&mut stream, AfcOpcode::Data, num, Vec::new(), payload.into_bytes())
                            .await;
                    }
                    None => afc_status(&mut stream, num, AFC_OBJECT_NOT_FOUND).await,
                }
            }
            AfcOpcode::RemovePath | AfcOpcode::RemovePathAndContents => {
                let path = normalize(&root, &req.header_payload);
                let prefix = format!("{path}/");
                {
                    let mut s = state.lock().unwrap();
                    s.dirs.retain(|d| d != &path && !d.starts_with(&prefix));
                    s.files.retain(|f, _| f != &path && !f.starts_with(&prefix));
                }
                afc_status(&mut stream, num, 0).await;
            }
            AfcOpcode::FileOpen => {
                let mode = u64_at(&req.header_payload, 0);
                let path = normalize(&root, &req.header_payload[8..]);
                let exists = {
                    let mut s = state.lock().unwrap();
                    if mode == 3 {
                        s.files.insert(path.clone(), Vec::new());
                    }
                    s.files.contains_key(&path)
                };
                if !exists {
                    afc_status(&mut stream, num, AFC_OBJECT_NOT_FOUND).await;
                    continue;
                }
                let fd = next_fd;
                next_fd += 1;
                open.insert(fd, (path, 0));
                afc_reply(&mut stream, AfcOpcode::FileOpenRes, num, fd.to_le_bytes().to_vec(), Vec::new())
                    .await;
            }
            AfcOpcode::Write => {
                let fd = u64_at(&req.header_payload, 0);
                let (drop_now, delay) = {
                    let mut s = state.lock().unwrap();
                    s.afc_writes += 1;
                    let drop_now = s.drop_afc_after_writes.is_some_and(|n| s.afc_writes > n);
                    if drop_now {
                        s.drop_afc_after_writes = None;
                    }
                    (drop_now, s.afc_write_delay)
                };
                if drop_now {
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some((path, _)) = open.get(&fd) {
                    state
                        .lock()
                        .unwrap()
                        .files
                        .entry(path.clone())
                        .or_default()
                        .extend_from_slice(&req.payload);
                }
                afc_status(&mut stream, num, 0).await;
            }
            AfcOpcode::Read => {
                let fd = u64_at(&req.header_payload, 0);
                let len = u64_at(&req.header_payload, 8) as usize;
                let chunk = match open.get_mut(&fd) {
                    Some((path, cursor)) => {
                        let s = state.lock().unwrap();
                        let data = s.files.get(path.as_str()).cloned().unwrap_or_default();
                        let end = (*cursor + len).min(data.len());
                        let chunk = data[*cursor..end].to_vec();
                        *cursor = end;
                        chunk
                    }
                    None => Vec::new(),
                };
                afc_reply(&mut stream, AfcOpcode::Data, num, Vec::new(), chunk).await;
            }
            AfcOpcode::FileClose => {
                open.remove(&u64_at(&req.header_payload, 0));
                afc_status(&mut stream, num, 0).await;
            }
            _ => afc_status(&mut stream, num, 1).await,
        }
    }
}

async fn house_arrest(mut stream: DuplexStream, state: SharedState) {
    let Some(req) = read_plist(&mut stream).await else {
        return;
    };
    let id = string(&req, "Identifier").to_string();
    let known = state.lock().unwrap().apps.contains_key(&id);
    if string(&req, "Command") != "VendContainer" || !known {
        write_plist(&mut stream, plist_macro::plist!({ "Error": "ApplicationLookupFailed" })).await;
        return;
    }
    let root = format!("containers/{id}");
    state.lock().unwrap().dirs.insert(root.clone());
    write_plist(&mut stream, plist_macro::plist!({ "Status": "Complete" })).await;
    afc(stream, state, root).await;
}

fn rsp_packet(data: &str) -> Vec<u8> {
    let sum = data.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    format!("${data}#{sum:02x}").into_bytes()
}

/// Console output as debugserver sends it
pub fn output_packet(text: &str) -> String {
    format!("O{}", hex_encode(text.as_bytes()))
}

async fn debugserver(mut stream: DuplexStream, state: SharedState) {
    let mut buffer = RspBuffer::default();
    let mut noack = false;
    let mut buf = [0u8; 4096];

    loop {
        let packet = loop {
            match buffer.next_packet() {
                Ok(Some(p)) => break String::from_utf8_lossy(&p).into_owned(),
                Ok(None) => {}
                Err(_) => return,
            }
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend(&buf[..n]),
            }
        };

        let mut out = Vec::new();
        if !noack {
            out.push(b'+');
        }
        if packet == "QStartNoAckMode" {
            out.extend(rsp_packet("OK"));
            noack = true;
        } else if let Some(env) = packet.strip_prefix("QEnvironmentHexEncoded:") {
            let env = hex_decode(env.as_bytes()).unwrap_or_default();
            state
                .lock()
                .unwrap()
                .environment
                .push(String::from_utf8_lossy(&env).into_owned());
            out.extend(rsp_packet("OK"));
        } else if packet == "QSetDisableASLR:1" {
            state.lock().unwrap().aslr_disabled = true;
            out.extend(rsp_packet("OK"));
        } else if let Some(args) = packet.strip_prefix('A') {
            let fields: Vec<&str> = args.split(',').collect();
            let argv = fields
                .chunks(3)
                .filter_map(|f| f.get(2))
                .map(|hex| String::from_utf8_lossy(&hex_decode(hex.as_bytes()).unwrap_or_default()).into_owned())
                .collect();
            state.lock().unwrap().launched_argv = argv;
            out.extend(rsp_packet("OK"));
        } else if packet == "qLaunchSuccess" {
            match state.lock().unwrap().launch_error.clone() {
                Some(e) => out.extend(rsp_packet(&format!("E{e}"))),
                None => out.extend(rsp_packet("OK")),
            }
        } else if packet == "vCont;c" {
            let script = state.lock().unwrap().debug_script.clone();
            for p in script {
                out.extend(rsp_packet(&p));
            }
        } else if packet == "k" {
            state.lock().unwrap().killed = true;
            out.extend(rsp_packet("X09"));
        } else {
            out.extend(rsp_packet(""));
        }
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}
